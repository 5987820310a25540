//! Terminal logic shared by sequential and concurrent chains.
//!
//! [`ChainCore`] owns everything that happens exactly once per chain: the
//! finished latch, the outcome log line, the finalizer, deregistration, and
//! the terminal callbacks.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::error::panic_message;
use crate::core::health::HealthMonitor;
use crate::core::host::ExecutionHost;
use crate::core::registry::Abortable;
use crate::core::signal::StepSignal;
use crate::core::stats::SchedulerCounters;
use crate::core::scheduler::WeakScheduler;
use crate::core::{ChainError, Scheduler};
use crate::util::{millis, Stopwatch};

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type FailureCallback = Box<dyn FnOnce(ChainError) + Send + 'static>;
/// Continuation for whoever started the chain (nested parent, `run_async`).
pub(crate) type Done = Box<dyn FnOnce(Result<(), ChainError>) + Send + 'static>;

/// Options collected by a builder before `run`.
pub(crate) struct ChainSettings {
    pub(crate) name: String,
    pub(crate) on_complete: Option<Callback>,
    pub(crate) on_failed: Option<FailureCallback>,
    pub(crate) finalizer: Option<Callback>,
    /// `Some(per_step)` when duration logging is on.
    pub(crate) duration: Option<bool>,
    pub(crate) health_timeout: Option<Duration>,
    /// Shared so try steps see `dont_log_errors` even when it is called later.
    pub(crate) log_errors: Arc<AtomicBool>,
    pub(crate) log_errors_on_abort: bool,
}

impl ChainSettings {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_complete: None,
            on_failed: None,
            finalizer: None,
            duration: None,
            health_timeout: None,
            log_errors: Arc::new(AtomicBool::new(true)),
            log_errors_on_abort: false,
        }
    }

    pub(crate) fn set_finalizer(&mut self, finalizer: Callback) {
        if self.finalizer.is_some() {
            error!(chain = %self.name, "finalizer already set; ignoring the new one");
            return;
        }
        self.finalizer = Some(finalizer);
    }

    pub(crate) fn set_on_complete(&mut self, callback: Callback) {
        if self.on_complete.is_some() {
            error!(chain = %self.name, "completion callback already set; ignoring the new one");
            return;
        }
        self.on_complete = Some(callback);
    }

    pub(crate) fn set_on_failed(&mut self, callback: FailureCallback) {
        if self.on_failed.is_some() {
            error!(chain = %self.name, "failure callback already set; ignoring the new one");
            return;
        }
        self.on_failed = Some(callback);
    }
}

struct Terminal {
    on_complete: Option<Callback>,
    on_failed: Option<FailureCallback>,
    finalizer: Option<Callback>,
    done: Option<Done>,
}

/// Identity, instrumentation and the once-only terminal path of a running chain.
///
/// Holds its scheduler weakly: queued steps keep their chain alive, so a
/// strong reference here would keep the scheduler and its queues alive too.
pub(crate) struct ChainCore {
    id: Uuid,
    name: String,
    scheduler: WeakScheduler,
    counters: Arc<SchedulerCounters>,
    finished: AtomicBool,
    stopwatch: Option<Stopwatch>,
    per_step: bool,
    monitor: Option<HealthMonitor>,
    log_errors: bool,
    log_errors_on_abort: bool,
    terminal: Mutex<Option<Terminal>>,
}

impl ChainCore {
    pub(crate) fn new(scheduler: &Scheduler, settings: ChainSettings, done: Option<Done>) -> Self {
        let id = Uuid::new_v4();
        let name = format!("{} {id}", settings.name);
        let monitor = settings
            .health_timeout
            .map(|timeout| HealthMonitor::new(name.clone(), timeout));

        Self {
            id,
            name,
            scheduler: scheduler.downgrade(),
            counters: Arc::clone(scheduler.counters()),
            finished: AtomicBool::new(false),
            stopwatch: settings.duration.map(|_| Stopwatch::start()),
            per_step: settings.duration.unwrap_or(false),
            monitor,
            log_errors: settings.log_errors.load(Ordering::Relaxed),
            log_errors_on_abort: settings.log_errors_on_abort,
            terminal: Mutex::new(Some(Terminal {
                on_complete: settings.on_complete,
                on_failed: settings.on_failed,
                finalizer: settings.finalizer,
                done,
            })),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// The owning scheduler, or `None` once every user clone was dropped.
    pub(crate) fn scheduler(&self) -> Option<Scheduler> {
        self.scheduler.upgrade()
    }

    pub(crate) fn counters(&self) -> &SchedulerCounters {
        &self.counters
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Register for `abort_all`, start the watchdog, and count the start.
    pub(crate) fn begin(&self, scheduler: &Scheduler, chain: &Arc<dyn Abortable>, steps: usize) {
        scheduler.registry().register(self.id, Arc::downgrade(chain));
        SchedulerCounters::bump(&self.counters().chains_started);

        if let Some(monitor) = &self.monitor {
            let interval = Duration::from_millis(scheduler.config().health_poll_interval_ms);
            monitor.start(&**scheduler.host(), interval);
        }
        debug!(chain = %self.name, steps, "chain started");
    }

    pub(crate) fn step_started(&self, index: usize, label: &str) {
        SchedulerCounters::bump(&self.counters().steps_dispatched);
        if let Some(monitor) = &self.monitor {
            monitor.reset(label);
        }
        debug!(chain = %self.name, step = index, label, "step started");
    }

    pub(crate) fn step_finished(&self, index: usize, label: &str) {
        if let Some(monitor) = &self.monitor {
            monitor.reset(label);
        }
        if !self.per_step {
            return;
        }
        if let Some(stopwatch) = &self.stopwatch {
            info!(chain = %self.name, step = index, label, elapsed_ms = millis(stopwatch.lap()), "step duration");
        }
    }

    pub(crate) fn step_skipped(&self, index: usize) {
        SchedulerCounters::bump(&self.counters().steps_skipped);
        debug!(chain = %self.name, step = index, "step skipped by its condition");
    }

    pub(crate) fn report_double_signal(&self, index: usize) {
        SchedulerCounters::bump(&self.counters().double_signals);
        error!(chain = %self.name, step = index, "step signaled more than once. PLEASE REPORT BUG WITH FULL LOG");
    }

    /// Run the terminal path once. Later calls are reported and ignored.
    ///
    /// Order: log, finalizer, deregister, `dispose`, callbacks.
    pub(crate) fn finish(&self, result: Result<(), ChainError>, at_step: Option<usize>, dispose: impl FnOnce()) {
        if self.finished.swap(true, Ordering::AcqRel) {
            SchedulerCounters::bump(&self.counters().double_signals);
            error!(chain = %self.name, step = ?at_step, "chain finished twice. PLEASE REPORT BUG WITH FULL LOG");
            return;
        }

        self.log_outcome(&result, at_step);
        if let Some(stopwatch) = &self.stopwatch {
            info!(chain = %self.name, elapsed_ms = millis(stopwatch.elapsed()), "chain duration");
        }

        let Some(terminal) = self.terminal.lock().take() else {
            return;
        };

        if let Some(finalizer) = terminal.finalizer {
            self.guarded("finalizer", finalizer);
        }

        // Gone while the scheduler itself is being dropped; nothing to deregister from.
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.registry().deregister(&self.id);
        }
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        let counter = match &result {
            Ok(()) => &self.counters().chains_completed,
            Err(e) if e.is_abort() => &self.counters().chains_aborted,
            Err(_) => &self.counters().chains_failed,
        };
        SchedulerCounters::bump(counter);

        dispose();

        match &result {
            Ok(()) => {
                if let Some(on_complete) = terminal.on_complete {
                    self.guarded("completion callback", on_complete);
                }
            }
            Err(e) => {
                if let Some(on_failed) = terminal.on_failed {
                    let e = e.clone();
                    self.guarded("failure callback", move || on_failed(e));
                }
            }
        }
        if let Some(done) = terminal.done {
            self.guarded("continuation", move || done(result));
        }
    }

    fn log_outcome(&self, result: &Result<(), ChainError>, at_step: Option<usize>) {
        match result {
            Ok(()) => debug!(chain = %self.name, "chain completed"),
            Err(e) if e.is_abort() => {
                if self.log_errors_on_abort {
                    error!(chain = %self.name, error = %e, "chain aborted");
                } else {
                    warn!(chain = %self.name, error = %e, "chain aborted");
                }
            }
            Err(e) => {
                if self.log_errors {
                    error!(chain = %self.name, step = ?at_step, error = %e, "chain failed");
                } else {
                    warn!(chain = %self.name, step = ?at_step, error = %e, "chain failed");
                }
            }
        }
    }

    fn guarded(&self, what: &str, f: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            error!(chain = %self.name, panic = %panic_message(payload.as_ref()), "{what} panicked");
        }
    }
}

/// Handle to a running chain, returned by `run`.
#[derive(Clone)]
pub struct ChainHandle {
    chain: Arc<dyn Abortable>,
}

impl ChainHandle {
    pub(crate) fn new(chain: Arc<dyn Abortable>) -> Self {
        Self { chain }
    }

    /// Request an abort; it takes effect at the next step boundary.
    pub fn abort(&self) {
        self.chain.abort();
    }

    /// Whether the chain reached its terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.chain.is_finished()
    }

    /// Chain name with its unique suffix.
    #[must_use]
    pub fn name(&self) -> &str {
        self.chain.name()
    }
}

impl fmt::Debug for ChainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainHandle")
            .field("name", &self.name())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Continuation that forwards the chain result into a oneshot.
pub(crate) fn completion_channel() -> (Done, oneshot::Receiver<Result<(), ChainError>>) {
    let (tx, rx) = oneshot::channel();
    let done: Done = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (done, rx)
}

pub(crate) async fn await_completion(rx: oneshot::Receiver<Result<(), ChainError>>) -> Result<(), ChainError> {
    rx.await
        .unwrap_or_else(|_| Err(ChainError::Disposed("chain dropped before finishing".into())))
}

/// Drive `f()` on the host's async facility and resolve `signal` with its result.
///
/// A panic inside the future fails the step. If the host is gone or refuses
/// the future, the step fails with `HostUnavailable`. Steps hold the host
/// weakly so a pending step does not keep its own host alive.
pub(crate) fn spawn_async_step<F, Fut, E>(host: &Weak<dyn ExecutionHost>, signal: StepSignal, f: F)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let Some(host) = host.upgrade() else {
        error!(step = %signal.label(), "host dropped before async step started");
        signal.fail_with(ChainError::HostUnavailable("host dropped".into()));
        return;
    };
    let label = signal.label().to_owned();
    let cell = Arc::new(Mutex::new(Some(signal)));
    let task_cell = Arc::clone(&cell);

    let task = async move {
        let outcome = AssertUnwindSafe(async move { f().await }).catch_unwind().await;
        let Some(signal) = task_cell.lock().take() else {
            return;
        };
        match outcome {
            Ok(result) => signal.resolve_result(result),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(step = %label, panic = %message, "async step panicked");
                signal.fail_with(ChainError::StepPanicked { label, message });
            }
        }
    };

    if let Err(rejected) = host.spawn_async(task.boxed()) {
        let signal = cell.lock().take();
        if let Some(signal) = signal {
            error!(step = %signal.label(), reason = %rejected.reason, "host refused async step");
            signal.fail_with(ChainError::HostUnavailable(rejected.reason));
        }
    }
}
