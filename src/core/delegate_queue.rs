//! Budgeted per-tick work queue.
//!
//! A [`DelegateQueue`] decouples submitting work from running it. Any thread
//! may enqueue; the owning tick phase calls [`DelegateQueue::drain`] once per
//! tick. A drain runs every repeating entry, then at most
//! `min(processing_rate, queued)` one-shot entries while the time budget lasts.
//! One-shot entries submitted during a drain wait for the next one.

use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::config::QueueConfig;
use crate::core::error::panic_message;
use crate::core::ChainError;
use crate::util::millis;

const REPEATING_WARN_AFTER: Duration = Duration::from_millis(100);
const REPEATING_ERROR_AFTER: Duration = Duration::from_millis(500);

type EntryFn = Box<dyn FnMut() -> Result<(), ChainError> + Send + 'static>;
type ExceptionHandler = Box<dyn FnOnce() + Send + 'static>;

/// Where an entry's result is published for waiting callers.
enum ResultLatch {
    Async(oneshot::Sender<Result<(), ChainError>>),
    Blocking(crossbeam_channel::Sender<Result<(), ChainError>>),
}

/// One queued callable plus its diagnostics.
struct QueueEntry {
    name: String,
    callback: Option<EntryFn>,
    on_panic: Option<ExceptionHandler>,
    latch: Option<ResultLatch>,
    cancelled: Option<Arc<AtomicBool>>,
}

impl QueueEntry {
    fn execute(&mut self) -> Result<(), ChainError> {
        let Some(callback) = self.callback.as_mut() else {
            return Err(ChainError::Disposed(format!("queue entry `{}`", self.name)));
        };

        match catch_unwind(AssertUnwindSafe(callback)) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(entry = %self.name, panic = %message, "delegate queue entry panicked");
                if let Some(handler) = self.on_panic.take() {
                    if let Err(inner) = catch_unwind(AssertUnwindSafe(handler)) {
                        error!(
                            entry = %self.name,
                            panic = %panic_message(inner.as_ref()),
                            "delegate queue exception handler panicked"
                        );
                    }
                }
                Err(ChainError::StepPanicked {
                    label: self.name.clone(),
                    message,
                })
            }
        }
    }

    fn publish(&mut self, result: Result<(), ChainError>) {
        match self.latch.take() {
            Some(ResultLatch::Async(tx)) => {
                let _ = tx.send(result);
            }
            Some(ResultLatch::Blocking(tx)) => {
                let _ = tx.try_send(result);
            }
            None => {}
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    fn dispose(&mut self) {
        self.callback = None;
        self.on_panic = None;
    }
}

/// A one-shot job for a [`DelegateQueue`].
pub struct QueueJob {
    name: String,
    callback: EntryFn,
    on_panic: Option<ExceptionHandler>,
}

impl QueueJob {
    /// Job that always succeeds unless it panics.
    #[track_caller]
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::fallible(move || {
            f();
            Ok(())
        })
    }

    /// Job whose `Err` is reported as a failure.
    #[track_caller]
    pub fn fallible<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<(), ChainError> + Send + 'static,
    {
        let location = Location::caller();
        let mut f = Some(f);
        Self {
            name: format!("{}:{}", location.file(), location.line()),
            callback: Box::new(move || match f.take() {
                Some(f) => f(),
                None => Err(ChainError::Disposed("one-shot queue entry ran twice".into())),
            }),
            on_panic: None,
        }
    }

    /// Replace the diagnostic name (defaults to the creating source location).
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Handler invoked best-effort when the job panics.
    #[must_use]
    pub fn on_panic<H>(mut self, handler: H) -> Self
    where
        H: FnOnce() + Send + 'static,
    {
        self.on_panic = Some(Box::new(handler));
        self
    }

    fn into_entry(self, latch: Option<ResultLatch>) -> QueueEntry {
        QueueEntry {
            name: self.name,
            callback: Some(self.callback),
            on_panic: self.on_panic,
            latch,
            cancelled: None,
        }
    }
}

/// A job re-run on every drain until it fails or is cancelled.
pub struct RepeatingJob {
    name: String,
    callback: EntryFn,
    on_panic: Option<ExceptionHandler>,
}

impl RepeatingJob {
    /// Repeating job; returning `Err` removes it from the queue.
    #[track_caller]
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() -> Result<(), ChainError> + Send + 'static,
    {
        let location = Location::caller();
        Self {
            name: format!("{}:{}", location.file(), location.line()),
            callback: Box::new(f),
            on_panic: None,
        }
    }

    /// Replace the diagnostic name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Handler invoked best-effort when the job panics (the job is then removed).
    #[must_use]
    pub fn on_panic<H>(mut self, handler: H) -> Self
    where
        H: FnOnce() + Send + 'static,
    {
        self.on_panic = Some(Box::new(handler));
        self
    }
}

/// Handle for removing a repeating entry.
#[derive(Debug, Clone)]
pub struct RepeatHandle {
    cancelled: Arc<AtomicBool>,
}

impl RepeatHandle {
    /// Remove the entry before its next run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether `cancel` was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Summary of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Repeating entries executed.
    pub repeating_run: usize,
    /// Repeating entries removed after failing.
    pub repeating_removed: usize,
    /// One-shot entries executed.
    pub executed: usize,
    /// One-shot entries that failed.
    pub failed: usize,
    /// Whether the time budget stopped the drain with entries left in its window.
    pub budget_exhausted: bool,
}

/// Budgeted queue drained once per tick phase.
pub struct DelegateQueue {
    name: String,
    tx: Sender<QueueEntry>,
    rx: Receiver<QueueEntry>,
    repeating: Mutex<Vec<QueueEntry>>,
    processing_rate: usize,
    time_budget: Duration,
    logs_enabled: AtomicBool,
    draining: AtomicBool,
}

impl DelegateQueue {
    /// Create a queue with an explicit rate and budget.
    pub fn new(name: impl Into<String>, processing_rate: usize, time_budget: Duration) -> Self {
        let (tx, rx) = unbounded();
        Self {
            name: name.into(),
            tx,
            rx,
            repeating: Mutex::new(Vec::new()),
            processing_rate,
            time_budget,
            logs_enabled: AtomicBool::new(true),
            draining: AtomicBool::new(false),
        }
    }

    /// Create a queue from configuration.
    pub fn from_config(name: impl Into<String>, config: &QueueConfig) -> Self {
        Self::new(
            name,
            config.processing_rate,
            Duration::from_millis(config.time_budget_ms),
        )
    }

    /// Queue name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enable or disable slow-repeating-entry diagnostics.
    pub fn set_logs_enabled(&self, enabled: bool) {
        self.logs_enabled.store(enabled, Ordering::Relaxed);
    }

    /// One-shot entries waiting for a drain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no one-shot entries are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Live repeating entries.
    #[must_use]
    pub fn repeating_len(&self) -> usize {
        self.repeating.lock().len()
    }

    /// Append a one-shot job. Callable from any thread.
    pub fn enqueue(&self, job: QueueJob) {
        self.push(job.into_entry(None));
    }

    /// Add a repeating job; the oldest repeating entry runs first on each drain.
    pub fn enqueue_repeating(&self, job: RepeatingJob) -> RepeatHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = QueueEntry {
            name: job.name,
            callback: Some(job.callback),
            on_panic: job.on_panic,
            latch: None,
            cancelled: Some(Arc::clone(&cancelled)),
        };
        self.repeating.lock().push(entry);
        RepeatHandle { cancelled }
    }

    /// Enqueue a job and wait for its result.
    ///
    /// Resolves to `Timeout` if no drain runs it within `timeout`; the job
    /// stays queued and still runs later.
    pub async fn execute_async(&self, job: QueueJob, timeout: Duration) -> Result<(), ChainError> {
        let (tx, rx) = oneshot::channel();
        self.push(job.into_entry(Some(ResultLatch::Async(tx))));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChainError::Disposed(format!(
                "queue `{}` dropped the entry before running it",
                self.name
            ))),
            Err(_) => Err(ChainError::Timeout {
                waited_ms: millis(timeout),
            }),
        }
    }

    /// Blocking variant of [`execute_async`](Self::execute_async).
    ///
    /// Must not be called from the thread that drains this queue.
    pub fn execute_blocking(&self, job: QueueJob, timeout: Duration) -> Result<(), ChainError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.push(job.into_entry(Some(ResultLatch::Blocking(tx))));

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(ChainError::Timeout {
                waited_ms: millis(timeout),
            }),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(ChainError::Disposed(
                format!("queue `{}` dropped the entry before running it", self.name),
            )),
        }
    }

    /// Run one drain cycle. Call once per tick from the owning phase.
    pub fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();

        if self.draining.swap(true, Ordering::AcqRel) {
            error!(queue = %self.name, "re-entrant drain ignored. PLEASE REPORT BUG WITH FULL LOG");
            return report;
        }

        self.drain_repeating(&mut report);
        self.drain_one_shot(&mut report);

        self.draining.store(false, Ordering::Release);
        report
    }

    // The time budget does not apply here: callers expect repeating entries to fire every tick.
    fn drain_repeating(&self, report: &mut DrainReport) {
        let started = Instant::now();
        let mut current = std::mem::take(&mut *self.repeating.lock());
        let mut survivors = Vec::with_capacity(current.len());

        for mut entry in current.drain(..) {
            if entry.is_cancelled() {
                debug!(queue = %self.name, entry = %entry.name, "repeating entry cancelled");
                continue;
            }
            report.repeating_run += 1;
            match entry.execute() {
                Ok(()) => survivors.push(entry),
                Err(e) => {
                    error!(queue = %self.name, entry = %entry.name, error = %e, "repeating entry failed and was removed");
                    entry.dispose();
                    report.repeating_removed += 1;
                }
            }
        }

        {
            let mut repeating = self.repeating.lock();
            let added = std::mem::take(&mut *repeating);
            *repeating = survivors;
            repeating.extend(added);
        }

        if !self.logs_enabled.load(Ordering::Relaxed) {
            return;
        }

        let elapsed = started.elapsed();
        if elapsed > REPEATING_ERROR_AFTER {
            error!(queue = %self.name, elapsed_ms = millis(elapsed), "repeating entries consumed the tick; performance issues possible");
        } else if elapsed > REPEATING_WARN_AFTER {
            warn!(queue = %self.name, elapsed_ms = millis(elapsed), "repeating entries are slow; performance issues possible");
        }
    }

    fn drain_one_shot(&self, report: &mut DrainReport) {
        // Only entries present now are eligible; later ones wait a tick.
        let mut remaining = self.processing_rate.min(self.rx.len());
        let started = Instant::now();

        while remaining > 0 {
            if started.elapsed() >= self.time_budget {
                report.budget_exhausted = true;
                debug!(queue = %self.name, left = remaining, "time budget exhausted");
                break;
            }
            let Ok(mut entry) = self.rx.try_recv() else {
                break;
            };
            remaining -= 1;

            let result = entry.execute();
            report.executed += 1;
            if let Err(e) = &result {
                error!(queue = %self.name, entry = %entry.name, error = %e, "delegate queue entry failed");
                report.failed += 1;
            }
            entry.publish(result);
            entry.dispose();
        }
    }

    fn push(&self, entry: QueueEntry) {
        // The receiver lives in `self`, so the channel never disconnects here.
        let _ = self.tx.send(entry);
    }
}

impl std::fmt::Debug for DelegateQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateQueue")
            .field("name", &self.name)
            .field("queued", &self.len())
            .field("repeating", &self.repeating_len())
            .field("processing_rate", &self.processing_rate)
            .field("time_budget", &self.time_budget)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_job(counter: &Arc<AtomicUsize>) -> QueueJob {
        let counter = Arc::clone(counter);
        QueueJob::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn test_drain_respects_processing_rate() {
        let queue = DelegateQueue::new("early", 3, Duration::from_secs(5));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            queue.enqueue(counting_job(&counter));
        }

        let report = queue.drain();
        assert_eq!(report.executed, 3);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert_eq!(queue.len(), 2);

        queue.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 5);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_stops_when_budget_spent() {
        let queue = DelegateQueue::new("late", 10, Duration::from_millis(30));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            queue.enqueue(QueueJob::new(move || {
                std::thread::sleep(Duration::from_millis(20));
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }

        let report = queue.drain();
        assert!(report.budget_exhausted);
        assert!(report.executed >= 1 && report.executed <= 2, "{report:?}");
        assert_eq!(queue.len(), 5 - report.executed);
    }

    #[test]
    fn test_entries_enqueued_during_drain_wait_for_next_drain() {
        let queue = Arc::new(DelegateQueue::new("fixed", 50, Duration::from_secs(5)));
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_queue = Arc::clone(&queue);
        let inner_counter = Arc::clone(&counter);
        queue.enqueue(QueueJob::new(move || {
            inner_queue.enqueue(counting_job(&inner_counter));
        }));

        assert_eq!(queue.drain().executed, 1);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert_eq!(queue.drain().executed, 1);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_repeating_entry_runs_until_failure() {
        let queue = DelegateQueue::new("early", 1, Duration::from_millis(1));
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&runs);
        queue.enqueue_repeating(RepeatingJob::new(move || {
            if seen.fetch_add(1, Ordering::Relaxed) + 1 >= 3 {
                Err(ChainError::failed(0, "done"))
            } else {
                Ok(())
            }
        }));

        for _ in 0..5 {
            queue.drain();
        }
        assert_eq!(runs.load(Ordering::Relaxed), 3);
        assert_eq!(queue.repeating_len(), 0);
    }

    #[test]
    fn test_repeating_entry_cancel() {
        let queue = DelegateQueue::new("early", 1, Duration::from_millis(1));
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&runs);
        let handle = queue.enqueue_repeating(RepeatingJob::new(move || {
            seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }));

        queue.drain();
        handle.cancel();
        queue.drain();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(queue.repeating_len(), 0);
    }

    #[test]
    fn test_panicking_entry_invokes_handler() {
        let queue = DelegateQueue::new("early", 10, Duration::from_secs(1));
        let handled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&handled);
        queue.enqueue(
            QueueJob::new(|| panic!("entry exploded"))
                .named("exploding")
                .on_panic(move || flag.store(true, Ordering::Release)),
        );
        queue.enqueue(QueueJob::new(|| {}));

        let report = queue.drain();
        assert_eq!(report.executed, 2);
        assert_eq!(report.failed, 1);
        assert!(handled.load(Ordering::Acquire));
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let queue = DelegateQueue::new("early", 10, Duration::from_secs(1));
        queue.enqueue(QueueJob::new(|| panic!("outer")).on_panic(|| panic!("inner")));
        assert_eq!(queue.drain().failed, 1);
    }

    #[test]
    fn test_execute_blocking_receives_result() {
        let queue = Arc::new(DelegateQueue::new("early", 10, Duration::from_secs(1)));
        let drainer = Arc::clone(&queue);
        let ticker = std::thread::spawn(move || {
            for _ in 0..50 {
                drainer.drain();
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let result = queue.execute_blocking(
            QueueJob::fallible(|| Err(ChainError::failed(0, "refused"))),
            Duration::from_secs(2),
        );
        assert_eq!(result, Err(ChainError::failed(0, "refused")));
        ticker.join().unwrap();
    }

    #[tokio::test]
    async fn test_execute_async_times_out_without_drain() {
        let queue = DelegateQueue::new("late", 10, Duration::from_secs(1));
        let result = queue
            .execute_async(QueueJob::new(|| {}), Duration::from_millis(20))
            .await;
        assert_eq!(result, Err(ChainError::Timeout { waited_ms: 20 }));
        // The entry still runs on a later drain.
        assert_eq!(queue.drain().executed, 1);
    }
}
