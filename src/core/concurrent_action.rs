//! Fluent builder and runner for concurrent batches.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::core::chain::{
    await_completion, completion_channel, spawn_async_step, Callback, ChainCore, ChainHandle, ChainSettings,
    Done, FailureCallback,
};
use crate::core::concurrent::{BatchEvent, ConcurrentContainer};
use crate::core::registry::Abortable;
use crate::core::signal::{IntoStep, Resolver, Step, StepOutcome, StepSignal};
use crate::core::{ChainError, ExecutionContext, Scheduler};

/// Builder for a batch whose steps all launch at once.
///
/// The batch completes when every step completed and fails on the first step
/// failure. Steps still running after the batch settled finish on their own;
/// their outcomes are discarded.
#[must_use = "a chain does nothing until `run` is called"]
pub struct ConcurrentAction {
    scheduler: Scheduler,
    settings: ChainSettings,
    container: ConcurrentContainer,
}

impl ConcurrentAction {
    pub(crate) fn new(scheduler: Scheduler, name: impl Into<String>) -> Self {
        Self {
            scheduler,
            settings: ChainSettings::new(name),
            container: ConcurrentContainer::new(),
        }
    }

    pub(crate) fn with_callbacks(mut self, on_complete: Option<Callback>, on_failed: Option<FailureCallback>) -> Self {
        if let Some(callback) = on_complete {
            self.settings.set_on_complete(callback);
        }
        if let Some(callback) = on_failed {
            self.settings.set_on_failed(callback);
        }
        self
    }

    /// Batch name without the unique suffix added at `run`.
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

    /// Add a prepared step.
    pub fn with_step(mut self, step: Step) -> Self {
        self.container.push(step);
        self
    }

    /// Add a closure that completes when it returns.
    #[track_caller]
    pub fn with<F>(self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.with_step(Step::from_fn(f))
    }

    /// Add a closure whose `Err` fails the batch.
    #[track_caller]
    pub fn with_try<F, E>(self, f: F) -> Self
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        self.with_step(Step::from_result(f))
    }

    /// Add a step that resolves its signal itself.
    #[track_caller]
    pub fn with_signal<F>(self, f: F) -> Self
    where
        F: FnOnce(StepSignal) + Send + 'static,
    {
        self.with_step(Step::new(f))
    }

    /// Add an async step, run on the host's async facility.
    #[track_caller]
    pub fn with_async<F, Fut, E>(self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let host = Arc::downgrade(self.scheduler.host());
        self.with_step(Step::new(move |signal| spawn_async_step(&host, signal, f)))
    }

    /// Add another chain as one member of the batch.
    pub fn with_chain<C: IntoStep>(self, chain: C) -> Self {
        self.with_step(chain.into_step())
    }

    /// Set where the most recently added step runs.
    pub fn with_execution_context(mut self, context: ExecutionContext) -> Self {
        if !self.container.set_last_context(context) {
            error!(chain = %self.settings.name, context = context.as_str(), "execution context set before any step; ignoring");
        }
        self
    }

    /// Settle the batch as aborted at the first completion where `abort` returns `true`. Set at most once.
    ///
    /// Checked after every member completion, not only once a member has
    /// failed, so handle aborts and `abort_all` settle a batch at its next completion.
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

    /// Log the total duration, and the time between step completions when `per_step`.
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

    /// Log batch failures at warn level instead of error.
    pub fn dont_log_errors(self) -> Self {
        self.settings
            .log_errors
            .store(false, std::sync::atomic::Ordering::Relaxed);
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

    /// Callback run once with the first failure (or the abort).
    pub fn on_failed<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(ChainError) + Send + 'static,
    {
        self.settings.set_on_failed(Box::new(callback));
        self
    }

    /// Launch every step.
    ///
    /// An empty batch fails immediately with [`ChainError::EmptyChain`].
    pub fn run(self) -> ChainHandle {
        self.run_with(None)
    }

    /// Launch every step and wait for the batch outcome.
    ///
    /// # Errors
    ///
    /// Returns the first failure, the abort, or `EmptyChain`.
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

        let run = Arc::new(ConcurrentRun {
            core: ChainCore::new(&scheduler, settings, done),
            container: RwLock::new(Some(Arc::new(container))),
        });
        let chain: Arc<dyn Abortable> = run.clone();
        run.core.begin(&scheduler, &chain, steps);
        run.launch(&scheduler);
        ChainHandle::new(chain)
    }
}

impl IntoStep for ConcurrentAction {
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

impl fmt::Debug for ConcurrentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentAction")
            .field("name", &self.settings.name)
            .field("steps", &self.container.len())
            .finish_non_exhaustive()
    }
}

struct ConcurrentRun {
    core: ChainCore,
    container: RwLock<Option<Arc<ConcurrentContainer>>>,
}

impl ConcurrentRun {
    fn launch(self: &Arc<Self>, scheduler: &Scheduler) {
        let Some(container) = self.container.read().clone() else {
            return;
        };

        let launched = container.launch(scheduler.dispatcher(), |index, label| {
            self.core.step_started(index, label);
            let run = Arc::clone(self);
            let label: Arc<str> = Arc::from(label);
            let resolver: Resolver =
                Box::new(move |outcome: StepOutcome| run.on_step_outcome(index, &label, outcome));
            resolver
        });

        match launched {
            Ok(count) => debug!(chain = %self.core.name(), launched = count, "batch launched"),
            Err(e) => self.finish(Err(e), None),
        }
    }

    fn on_step_outcome(&self, index: usize, label: &str, outcome: StepOutcome) {
        let Some(container) = self.container.read().clone() else {
            debug!(chain = %self.core.name(), step = index, "step finished after the batch settled; outcome discarded");
            return;
        };

        match outcome {
            StepOutcome::Completed => match container.on_complete(index) {
                BatchEvent::AllComplete => {
                    self.core.step_finished(index, label);
                    self.finish(Ok(()), None);
                }
                BatchEvent::Pending => self.core.step_finished(index, label),
                BatchEvent::Aborted => self.finish(Err(ChainError::Aborted { step: index }), Some(index)),
                BatchEvent::DoubleSignal => self.core.report_double_signal(index),
                BatchEvent::FirstFailure | BatchEvent::Ignored => {
                    debug!(chain = %self.core.name(), step = index, "completion after the batch settled; discarded");
                }
            },
            StepOutcome::Failed(e) => match container.on_failed(index) {
                BatchEvent::FirstFailure => self.finish(Err(e), Some(index)),
                BatchEvent::DoubleSignal => self.core.report_double_signal(index),
                _ => {
                    debug!(chain = %self.core.name(), step = index, error = %e, "additional failure discarded");
                }
            },
        }
    }

    fn finish(&self, result: Result<(), ChainError>, at_step: Option<usize>) {
        self.core.finish(result, at_step, || {
            let disposed = self.container.write().take();
            drop(disposed);
        });
    }
}

impl Abortable for ConcurrentRun {
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
