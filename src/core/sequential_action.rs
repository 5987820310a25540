//! Fluent builder and runner for ordered chains.
//!
//! ```rust,no_run
//! use prometheus_action_chain::builders::SchedulerBuilder;
//! use prometheus_action_chain::core::{ExecutionContext, TickPhase};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = SchedulerBuilder::new().build()?;
//! scheduler
//!     .sequence("load profile")
//!     .then(|| println!("validate"))
//!     .then_try(|| std::fs::metadata("profile.json").map(|_| ()))
//!     .with_execution_context(ExecutionContext::BackgroundThread)
//!     .then(|| println!("apply"))
//!     .with_execution_context(ExecutionContext::Tick(TickPhase::Late))
//!     .with_finalizer(|| println!("cleanup"))
//!     .run_async()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::core::chain::{
    await_completion, completion_channel, spawn_async_step, ChainCore, ChainHandle, ChainSettings, Done,
};
use crate::core::error::panic_message;
use crate::core::registry::Abortable;
use crate::core::sequential::{Advance, SequentialContainer};
use crate::core::signal::{IntoStep, Resolver, Step, StepOutcome, StepSignal};
use crate::core::{ChainError, ConcurrentAction, ExecutionContext, Scheduler};

/// Builder for a chain whose steps run strictly one after another.
///
/// Created by [`Scheduler::sequence`]. Step methods append a step; the
/// `with_execution_context` and skip-condition methods modify the step added
/// last. `run` consumes the builder, so a chain cannot be started twice or
/// extended once running.
#[must_use = "a chain does nothing until `run` is called"]
pub struct SequentialAction {
    scheduler: Scheduler,
    settings: ChainSettings,
    container: SequentialContainer,
}

impl SequentialAction {
    pub(crate) fn new(scheduler: Scheduler, name: impl Into<String>) -> Self {
        Self {
            scheduler,
            settings: ChainSettings::new(name),
            container: SequentialContainer::new(),
        }
    }

    /// Chain name without the unique suffix added at `run`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Number of steps added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.container.len()
    }

    /// Whether no steps were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.container.len() == 0
    }

    /// Append a prepared step.
    pub fn then_step(mut self, step: Step) -> Self {
        self.container.push(step);
        self
    }

    /// Append a closure that completes when it returns.
    #[track_caller]
    pub fn then<F>(self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.then_step(Step::from_fn(f))
    }

    /// Append a closure whose `Err` fails the chain.
    #[track_caller]
    pub fn then_try<F, E>(self, f: F) -> Self
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        self.then_step(Step::from_result(f))
    }

    /// Append a step that resolves its signal itself, possibly from another thread.
    #[track_caller]
    pub fn then_signal<F>(self, f: F) -> Self
    where
        F: FnOnce(StepSignal) + Send + 'static,
    {
        self.then_step(Step::new(f))
    }

    /// Append an async step, run on the host's async facility.
    ///
    /// The execution context of this step only decides where `f` is called;
    /// the future itself always runs on the host.
    #[track_caller]
    pub fn then_async<F, Fut, E>(self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let host = Arc::downgrade(self.scheduler.host());
        self.then_step(Step::new(move |signal| spawn_async_step(&host, signal, f)))
    }

    /// Append another chain (sequential or concurrent) as one step.
    ///
    /// The nested chain starts when its turn comes; its outcome resolves the step.
    pub fn then_chain<C: IntoStep>(self, chain: C) -> Self {
        self.then_step(chain.into_step())
    }

    /// Append a step whose failure is logged and treated as completion.
    pub fn try_step<S: IntoStep>(self, step: S) -> Self {
        let inner = step.into_step();
        let label = inner.shared_label();
        let outer_label = Arc::clone(&label);
        let chain = self.settings.name.clone();
        let log_errors = Arc::clone(&self.settings.log_errors);

        self.then_step(
            Step::new(move |signal: StepSignal| {
                let index = signal.index();
                let resolver: Resolver = Box::new(move |outcome: StepOutcome| {
                    if let StepOutcome::Failed(e) = outcome {
                        if log_errors.load(Ordering::Relaxed) {
                            error!(chain = %chain, step = index, error = %e, "try step failed; continuing");
                        } else {
                            warn!(chain = %chain, step = index, error = %e, "try step failed; continuing");
                        }
                    }
                    signal.complete();
                });
                let (inner_signal, guard) = StepSignal::new(index, Arc::clone(&label), resolver);
                let result = {
                    let _scope = guard.enter();
                    catch_unwind(AssertUnwindSafe(move || inner.invoke(inner_signal)))
                };
                if let Err(payload) = result {
                    guard.fail(ChainError::StepPanicked {
                        label: guard.label().to_owned(),
                        message: panic_message(payload.as_ref()),
                    });
                }
            })
            .labeled(&*outer_label),
        )
    }

    /// Append a step logging `message` at info level.
    #[track_caller]
    pub fn log(self, message: impl Into<String>) -> Self {
        let chain = self.settings.name.clone();
        let message = message.into();
        self.then(move || info!(chain = %chain, "{message}"))
    }

    /// Append a step logging a message built when the step runs.
    #[track_caller]
    pub fn log_with<F>(self, message: F) -> Self
    where
        F: FnOnce() -> String + Send + 'static,
    {
        let chain = self.settings.name.clone();
        self.then(move || info!(chain = %chain, "{}", message()))
    }

    /// Append a step logging `message` at warn level.
    #[track_caller]
    pub fn log_warning(self, message: impl Into<String>) -> Self {
        let chain = self.settings.name.clone();
        let message = message.into();
        self.then(move || warn!(chain = %chain, "{message}"))
    }

    /// Append a step logging `message` at error level. The chain continues.
    #[track_caller]
    pub fn log_error(self, message: impl Into<String>) -> Self {
        let chain = self.settings.name.clone();
        let message = message.into();
        self.then(move || error!(chain = %chain, "{message}"))
    }

    /// Append a step that completes after `duration`.
    #[track_caller]
    pub fn delay(self, duration: Duration) -> Self {
        self.then_async(move || async move {
            tokio::time::sleep(duration).await;
            Ok::<(), Infallible>(())
        })
    }

    /// Append a step that yields once to the host's async scheduler.
    #[track_caller]
    pub fn yield_now(self) -> Self {
        self.then_async(|| async {
            tokio::task::yield_now().await;
            Ok::<(), Infallible>(())
        })
    }

    /// Set where the most recently added step runs.
    pub fn with_execution_context(mut self, context: ExecutionContext) -> Self {
        if !self.container.with_last(|entry| entry.context = context) {
            error!(chain = %self.settings.name, context = context.as_str(), "execution context set before any step; ignoring");
        }
        self
    }

    /// Skip the most recently added step when `skip` returns `true` at its turn.
    pub fn with_skip_condition<P>(mut self, skip: P) -> Self
    where
        P: Fn() -> bool + Send + Sync + 'static,
    {
        if !self.container.with_last(|entry| entry.skip = Some(Box::new(skip))) {
            error!(chain = %self.settings.name, "skip condition set before any step; ignoring");
        }
        self
    }

    /// Run the most recently added step only when `condition` returns `true` at its turn.
    pub fn only_if<P>(self, condition: P) -> Self
    where
        P: Fn() -> bool + Send + Sync + 'static,
    {
        self.with_skip_condition(move || !condition())
    }

    /// Abort the chain at the first step boundary where `abort` returns `true`. Set at most once.
    pub fn with_abort_condition<P>(mut self, abort: P) -> Self
    where
        P: Fn() -> bool + Send + Sync + 'static,
    {
        if !self.container.set_abort_condition(Box::new(abort)) {
            error!(chain = %self.settings.name, "abort condition already set; ignoring the new one");
        }
        self
    }

    /// Cleanup hook run once before the terminal callback, on every path. Set at most once.
    pub fn with_finalizer<F>(mut self, finalizer: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.settings.set_finalizer(Box::new(finalizer));
        self
    }

    /// Log the total duration at the end, and each step's duration when `per_step`.
    pub fn with_duration_logging(mut self, per_step: bool) -> Self {
        self.settings.duration = Some(per_step);
        self
    }

    /// Log an error if no step finishes within `timeout`.
    pub fn with_health_monitor(mut self, timeout: Duration) -> Self {
        self.settings.health_timeout = Some(timeout);
        self
    }

    /// Health monitor using the scheduler's default timeout.
    pub fn with_default_health_monitor(self) -> Self {
        let timeout = Duration::from_millis(self.scheduler.config().default_health_timeout_ms);
        self.with_health_monitor(timeout)
    }

    /// Log chain failures (and try-step failures) at warn level instead of error.
    pub fn dont_log_errors(self) -> Self {
        self.settings.log_errors.store(false, Ordering::Relaxed);
        self
    }

    /// Log aborts at error level instead of warn.
    pub fn log_errors_on_abort(mut self) -> Self {
        self.settings.log_errors_on_abort = true;
        self
    }

    /// Callback run once when every step completed.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.settings.set_on_complete(Box::new(callback));
        self
    }

    /// Callback run once when the chain failed or was aborted.
    pub fn on_failed<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(ChainError) + Send + 'static,
    {
        self.settings.set_on_failed(Box::new(callback));
        self
    }

    /// Wrap this sequence as the single member of a concurrent batch.
    ///
    /// Terminal callbacks move to the batch; everything else stays with the sequence.
    pub fn into_concurrent(mut self) -> ConcurrentAction {
        let on_complete = self.settings.on_complete.take();
        let on_failed = self.settings.on_failed.take();
        let name = self.settings.name.clone();
        ConcurrentAction::new(self.scheduler.clone(), name)
            .with_callbacks(on_complete, on_failed)
            .with_chain(self)
    }

    /// Start the chain.
    pub fn run(self) -> ChainHandle {
        self.run_with(None)
    }

    /// Start the chain and wait for its outcome.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the chain.
    pub async fn run_async(self) -> Result<(), ChainError> {
        let (done, rx) = completion_channel();
        let _handle = self.run_with(Some(done));
        await_completion(rx).await
    }

    pub(crate) fn run_with(self, done: Option<Done>) -> ChainHandle {
        let Self {
            scheduler,
            settings,
            container,
        } = self;
        let steps = container.len();
        let yield_every = scheduler.config().fairness_yield_every;

        let run = Arc::new(SequentialRun {
            core: ChainCore::new(&scheduler, settings, done),
            container: RwLock::new(Some(Arc::new(container))),
            drive: Mutex::new(DriveState::default()),
            yield_every,
        });
        let chain: Arc<dyn Abortable> = run.clone();
        run.core.begin(&scheduler, &chain, steps);
        run.request_advance();
        ChainHandle::new(chain)
    }
}

impl IntoStep for SequentialAction {
    fn into_step(self) -> Step {
        let Self {
            scheduler,
            settings,
            container,
        } = self;
        let label = settings.name.clone();
        // Held weakly until its turn, like a running chain.
        let scheduler = scheduler.downgrade();

        Step::new(move |signal: StepSignal| {
            let Some(scheduler) = scheduler.upgrade() else {
                signal.fail_with(ChainError::Disposed("scheduler dropped before the nested chain started".into()));
                return;
            };
            let done: Done = Box::new(move |result| match result {
                Ok(()) => signal.complete(),
                Err(e) => signal.fail_with(e),
            });
            Self {
                scheduler,
                settings,
                container,
            }
            .run_with(Some(done));
        })
        .labeled(label)
    }
}

impl fmt::Debug for SequentialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialAction")
            .field("name", &self.settings.name)
            .field("steps", &self.container.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct DriveState {
    driving: bool,
    pending: bool,
}

/// A started sequence. Advances through a trampoline so synchronous steps do
/// not grow the stack.
struct SequentialRun {
    core: ChainCore,
    container: RwLock<Option<Arc<SequentialContainer>>>,
    drive: Mutex<DriveState>,
    yield_every: usize,
}

impl SequentialRun {
    /// Ask for one more advance. The first caller becomes the driver and loops
    /// until no advance is pending; re-entrant callers only set the flag.
    fn request_advance(self: &Arc<Self>) {
        {
            let mut drive = self.drive.lock();
            drive.pending = true;
            if drive.driving {
                return;
            }
            drive.driving = true;
        }

        let mut streak = 0_usize;
        loop {
            {
                let mut drive = self.drive.lock();
                if !drive.pending {
                    drive.driving = false;
                    return;
                }
                drive.pending = false;
            }

            self.advance_once();

            streak += 1;
            if self.yield_every > 0 && streak % self.yield_every == 0 {
                std::thread::yield_now();
            }
        }
    }

    fn advance_once(self: &Arc<Self>) {
        let Some(container) = self.container.read().clone() else {
            return;
        };

        let Some(scheduler) = self.core.scheduler() else {
            self.finish(
                Err(ChainError::Disposed("scheduler dropped while the chain was running".into())),
                None,
            );
            return;
        };

        let advance = container.try_advance(scheduler.dispatcher(), |index, label| {
            self.core.step_started(index, label);
            let run = Arc::clone(self);
            let label: Arc<str> = Arc::from(label);
            let resolver: Resolver =
                Box::new(move |outcome: StepOutcome| run.on_step_outcome(index, &label, outcome));
            resolver
        });

        match advance {
            Advance::Dispatched(_) | Advance::Halted => {}
            Advance::Skipped(index) => {
                self.core.step_skipped(index);
                self.drive.lock().pending = true;
            }
            Advance::Exhausted => self.finish(Ok(()), None),
            Advance::Aborted(index) => self.finish(Err(ChainError::Aborted { step: index }), Some(index)),
            Advance::Failed(index, e) => self.finish(Err(e), Some(index)),
        }
    }

    fn on_step_outcome(self: &Arc<Self>, index: usize, label: &str, outcome: StepOutcome) {
        let container = self.container.read().clone();
        let settled = container.is_some_and(|container| container.settle(index));
        if !settled {
            self.core.report_double_signal(index);
            return;
        }

        match outcome {
            StepOutcome::Completed => {
                self.core.step_finished(index, label);
                self.request_advance();
            }
            StepOutcome::Failed(e) => self.finish(Err(e), Some(index)),
        }
    }

    fn finish(&self, result: Result<(), ChainError>, at_step: Option<usize>) {
        self.core.finish(result, at_step, || {
            let disposed = self.container.write().take();
            drop(disposed);
        });
    }
}

impl Abortable for SequentialRun {
    fn abort(&self) {
        if let Some(container) = self.container.read().as_ref() {
            container.request_abort();
        }
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn is_finished(&self) -> bool {
        self.core.is_finished()
    }
}
