//! Integration tests for sequential chains
//!
//! These tests drive chains through a `PumpedHost` owned by the test thread:
//! - Strict ordering and first-failure semantics
//! - Exactly-once terminal callbacks and finalizers on every path
//! - Skip conditions, try steps, nested chains
//! - Aborts from conditions, handles, and `abort_all`
//! - Placement across coordination, background, and tick phases
//! - Lost signals, scheduler drop, and log severity

use parking_lot::Mutex;
use prometheus_action_chain::config::SchedulerConfig;
use prometheus_action_chain::core::{ChainError, ExecutionContext, Scheduler, StepSignal, TickPhase};
use prometheus_action_chain::runtime::PumpedHost;
use prometheus_action_chain::util::init_tracing;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn setup() -> (Arc<PumpedHost>, Scheduler) {
    init_tracing();
    let host = Arc::new(PumpedHost::with_worker_threads(2).unwrap());
    let scheduler = Scheduler::new(SchedulerConfig::default().with_background_workers(2), host.clone()).unwrap();
    (host, scheduler)
}

/// Pump the host and tick every phase until `done` holds or two seconds pass.
fn drive_until(host: &PumpedHost, scheduler: &Scheduler, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        host.pump();
        scheduler.tick_all();
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}

type Outcome = Arc<Mutex<Vec<Result<(), ChainError>>>>;

fn outcome() -> Outcome {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(log: &Arc<Mutex<Vec<&'static str>>>, entry: &'static str) -> impl FnOnce() + Send + 'static {
    let log = Arc::clone(log);
    move || log.lock().push(entry)
}

/// Writer collecting formatted log output for assertions.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn line_with(&self, needle: &str) -> Option<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .find(|line| line.contains(needle))
            .map(str::to_owned)
    }
}

/// Run `f` with a thread-local subscriber and return what it logged.
fn capture_logs(f: impl FnOnce()) -> CapturedLogs {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    logs
}

// ============================================================================
// ORDERING AND FAILURE
// ============================================================================

#[test]
fn test_steps_run_in_order_and_complete_once() {
    let (_host, scheduler) = setup();
    let log = Arc::new(Mutex::new(Vec::new()));
    let result = outcome();
    let sink = Arc::clone(&result);
    let failed = Arc::clone(&result);

    let handle = scheduler
        .sequence("ordered")
        .then(push(&log, "a"))
        .then(push(&log, "b"))
        .then(push(&log, "c"))
        .on_complete(move || sink.lock().push(Ok(())))
        .on_failed(move |e| failed.lock().push(Err(e)))
        .run();

    assert!(handle.is_finished());
    assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    assert_eq!(*result.lock(), vec![Ok(())]);
    assert_eq!(scheduler.active_chains(), 0);
}

#[test]
fn test_first_failure_stops_chain() {
    let (_host, scheduler) = setup();
    let log = Arc::new(Mutex::new(Vec::new()));
    let result = outcome();
    let sink = Arc::clone(&result);

    scheduler
        .sequence("stops")
        .then(push(&log, "first"))
        .then_try(|| Err::<(), _>("disk full"))
        .then(push(&log, "never"))
        .on_failed(move |e| sink.lock().push(Err(e)))
        .dont_log_errors()
        .run();

    assert_eq!(*log.lock(), vec!["first"]);
    assert_eq!(*result.lock(), vec![Err(ChainError::failed(1, "disk full"))]);

    let stats = scheduler.stats();
    assert_eq!(stats.chains_failed, 1);
    assert_eq!(stats.chains_completed, 0);
}

#[test]
fn test_empty_sequence_completes() {
    let (_host, scheduler) = setup();
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completed);

    let handle = scheduler
        .sequence("empty")
        .on_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .run();

    assert!(handle.is_finished());
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_step_fails_chain() {
    let (_host, scheduler) = setup();
    let result = outcome();
    let sink = Arc::clone(&result);

    scheduler
        .sequence("panics")
        .then_step(prometheus_action_chain::core::Step::from_fn(|| panic!("kaboom")).labeled("exploder"))
        .on_failed(move |e| sink.lock().push(Err(e)))
        .run();

    assert_eq!(
        *result.lock(),
        vec![Err(ChainError::StepPanicked {
            label: "exploder".into(),
            message: "kaboom".into()
        })]
    );
}

#[test]
fn test_dropped_signal_fails_step() {
    let (_host, scheduler) = setup();
    let result = outcome();
    let sink = Arc::clone(&result);

    scheduler
        .sequence("forgetful")
        .then_signal(|signal: StepSignal| drop(signal))
        .on_failed(move |e| sink.lock().push(Err(e)))
        .run();

    let result = result.lock();
    assert_eq!(result.len(), 1);
    assert!(matches!(result[0], Err(ChainError::SignalDropped { .. })));
}

// ============================================================================
// FINALIZER
// ============================================================================

#[test]
fn test_finalizer_runs_before_callback_on_every_path() {
    let (host, scheduler) = setup();

    for path in ["complete", "fail", "abort"] {
        let log = Arc::new(Mutex::new(Vec::new()));
        let on_complete = push(&log, "callback");
        let failed_log = Arc::clone(&log);

        let chain = scheduler
            .sequence(path)
            .then_try(move || if path == "fail" { Err("nope") } else { Ok(()) })
            .with_abort_condition(move || path == "abort")
            .with_finalizer(push(&log, "finalizer"))
            .on_complete(on_complete)
            .on_failed(move |_| failed_log.lock().push("callback"))
            .dont_log_errors();

        chain.run();
        assert!(drive_until(&host, &scheduler, || log.lock().len() == 2), "path {path}");
        assert_eq!(*log.lock(), vec!["finalizer", "callback"], "path {path}");
    }
}

#[test]
fn test_second_finalizer_is_ignored() {
    let (_host, scheduler) = setup();
    let runs = Arc::new(AtomicUsize::new(0));
    let first = Arc::clone(&runs);
    let second = Arc::clone(&runs);

    scheduler
        .sequence("twice")
        .then(|| {})
        .with_finalizer(move || {
            first.fetch_add(1, Ordering::SeqCst);
        })
        .with_finalizer(move || {
            second.fetch_add(10, Ordering::SeqCst);
        })
        .run();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

// ============================================================================
// CONDITIONS AND TRY STEPS
// ============================================================================

#[test]
fn test_skip_condition_and_only_if() {
    let (_host, scheduler) = setup();
    let log = Arc::new(Mutex::new(Vec::new()));

    scheduler
        .sequence("conditional")
        .then(push(&log, "always"))
        .then(push(&log, "skipped"))
        .with_skip_condition(|| true)
        .then(push(&log, "kept"))
        .only_if(|| true)
        .then(push(&log, "filtered"))
        .only_if(|| false)
        .run();

    assert_eq!(*log.lock(), vec!["always", "kept"]);
    assert_eq!(scheduler.stats().steps_skipped, 2);
}

#[test]
fn test_skip_condition_reads_state_at_step_time() {
    let (_host, scheduler) = setup();
    let flag = Arc::new(AtomicUsize::new(0));
    let setter = Arc::clone(&flag);
    let reader = Arc::clone(&flag);
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);

    scheduler
        .sequence("late binding")
        .then(move || setter.store(1, Ordering::SeqCst))
        .then(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .with_skip_condition(move || reader.load(Ordering::SeqCst) == 1)
        .run();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_try_step_failure_continues() {
    let (_host, scheduler) = setup();
    let log = Arc::new(Mutex::new(Vec::new()));
    let result = outcome();
    let sink = Arc::clone(&result);

    let optional = scheduler.sequence("optional").then_try(|| Err::<(), _>("cache miss"));

    scheduler
        .sequence("tolerant")
        .try_step(optional)
        .then(push(&log, "after"))
        .on_complete(move || sink.lock().push(Ok(())))
        .dont_log_errors()
        .run();

    assert_eq!(*log.lock(), vec!["after"]);
    assert_eq!(*result.lock(), vec![Ok(())]);
}

// ============================================================================
// NESTED CHAINS
// ============================================================================

#[test]
fn test_nested_chain_runs_as_one_step() {
    let (_host, scheduler) = setup();
    let log = Arc::new(Mutex::new(Vec::new()));
    let inner_done = push(&log, "inner callback");

    let inner = scheduler
        .sequence("inner")
        .then(push(&log, "inner 1"))
        .then(push(&log, "inner 2"))
        .on_complete(inner_done);

    scheduler
        .sequence("outer")
        .then(push(&log, "outer 1"))
        .then_chain(inner)
        .then(push(&log, "outer 2"))
        .run();

    assert_eq!(
        *log.lock(),
        vec!["outer 1", "inner 1", "inner 2", "inner callback", "outer 2"]
    );
    assert_eq!(scheduler.stats().chains_completed, 2);
}

#[test]
fn test_nested_failure_fails_parent() {
    let (_host, scheduler) = setup();
    let result = outcome();
    let sink = Arc::clone(&result);

    let inner = scheduler
        .sequence("inner")
        .then_try(|| Err::<(), _>("inner broke"))
        .dont_log_errors();

    scheduler
        .sequence("outer")
        .then_chain(inner)
        .then(|| panic!("must not run"))
        .on_failed(move |e| sink.lock().push(Err(e)))
        .dont_log_errors()
        .run();

    assert_eq!(*result.lock(), vec![Err(ChainError::failed(0, "inner broke"))]);
}

// ============================================================================
// ABORTS
// ============================================================================

#[test]
fn test_abort_condition_stops_at_boundary() {
    let (_host, scheduler) = setup();
    let stop = Arc::new(AtomicUsize::new(0));
    let trigger = Arc::clone(&stop);
    let check = Arc::clone(&stop);
    let result = outcome();
    let sink = Arc::clone(&result);

    scheduler
        .sequence("abortable")
        .then(move || trigger.store(1, Ordering::SeqCst))
        .then(|| panic!("must not run"))
        .with_abort_condition(move || check.load(Ordering::SeqCst) == 1)
        .on_failed(move |e| sink.lock().push(Err(e)))
        .run();

    assert_eq!(*result.lock(), vec![Err(ChainError::Aborted { step: 1 })]);
    assert_eq!(scheduler.stats().chains_aborted, 1);
}

#[test]
fn test_handle_abort_waits_for_running_step() {
    let (_host, scheduler) = setup();
    let held: Arc<Mutex<Option<StepSignal>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&held);
    let result = outcome();
    let sink = Arc::clone(&result);

    let handle = scheduler
        .sequence("long running")
        .then_signal(move |signal| *slot.lock() = Some(signal))
        .then(|| panic!("must not run"))
        .on_failed(move |e| sink.lock().push(Err(e)))
        .run();

    handle.abort();
    assert!(!handle.is_finished());
    assert!(result.lock().is_empty());

    let signal = held.lock().take().unwrap();
    signal.complete();

    assert!(handle.is_finished());
    assert_eq!(*result.lock(), vec![Err(ChainError::Aborted { step: 1 })]);
}

#[test]
fn test_abort_all_reaches_every_running_chain() {
    let (_host, scheduler) = setup();
    let held: Arc<Mutex<Vec<StepSignal>>> = Arc::new(Mutex::new(Vec::new()));
    let aborted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let slot = Arc::clone(&held);
            let counter = Arc::clone(&aborted);
            scheduler
                .sequence(format!("chain {i}"))
                .then_signal(move |signal| slot.lock().push(signal))
                .then(|| {})
                .on_failed(move |e| {
                    if e.is_abort() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .run()
        })
        .collect();

    assert_eq!(scheduler.active_chains(), 3);
    assert_eq!(scheduler.abort_all(), 3);

    for signal in held.lock().drain(..) {
        signal.complete();
    }

    assert!(handles.iter().all(|h| h.is_finished()));
    assert_eq!(aborted.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.active_chains(), 0);
}

// ============================================================================
// PLACEMENT
// ============================================================================

#[test]
fn test_background_then_tick_then_coordination() {
    let (host, scheduler) = setup();
    let log = Arc::new(Mutex::new(Vec::new()));
    let test_thread = thread::current().id();

    let background_log = Arc::clone(&log);
    let tick_log = Arc::clone(&log);
    let coordination_log = Arc::clone(&log);
    let finished = Arc::new(AtomicUsize::new(0));
    let done = Arc::clone(&finished);

    scheduler
        .sequence("three places")
        .then(move || background_log.lock().push(("background", thread::current().id() != test_thread)))
        .with_execution_context(ExecutionContext::BackgroundThread)
        .then(move || tick_log.lock().push(("late tick", thread::current().id() == test_thread)))
        .with_execution_context(ExecutionContext::Tick(TickPhase::Late))
        .then(move || coordination_log.lock().push(("coordination", thread::current().id() == test_thread)))
        .with_execution_context(ExecutionContext::ForceSingleThread)
        .on_complete(move || {
            done.fetch_add(1, Ordering::SeqCst);
        })
        .run();

    assert!(drive_until(&host, &scheduler, || finished.load(Ordering::SeqCst) == 1));
    assert_eq!(
        *log.lock(),
        vec![("background", true), ("late tick", true), ("coordination", true)]
    );
}

#[test]
fn test_background_failure_stops_three_step_chain() {
    let (host, scheduler) = setup();
    let log = Arc::new(Mutex::new(Vec::new()));
    let failed_log = Arc::clone(&log);
    let failures = outcome();
    let sink = Arc::clone(&failures);

    scheduler
        .sequence("three steps")
        .then(push(&log, "step 1"))
        .then_try(|| Err::<(), _>("background refused"))
        .with_execution_context(ExecutionContext::BackgroundThread)
        .then(push(&log, "step 3"))
        .with_finalizer(push(&log, "finalizer"))
        .on_failed(move |e| {
            failed_log.lock().push("failed");
            sink.lock().push(Err(e));
        })
        .dont_log_errors()
        .run();

    assert!(drive_until(&host, &scheduler, || failures.lock().len() == 1));
    assert_eq!(*log.lock(), vec!["step 1", "finalizer", "failed"]);
    assert_eq!(*failures.lock(), vec![Err(ChainError::failed(1, "background refused"))]);
}

#[test]
fn test_force_single_thread_always_posts() {
    let (host, scheduler) = setup();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);

    scheduler
        .sequence("posted")
        .then(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .with_execution_context(ExecutionContext::ForceSingleThread)
        .run();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(host.pending(), 1);
    host.pump();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_ensure_single_thread_runs_inline_on_coordinator() {
    let (host, scheduler) = setup();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);

    scheduler
        .sequence("inline")
        .then(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .with_execution_context(ExecutionContext::EnsureSingleThread)
        .run();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(host.pending(), 0);
}

#[test]
fn test_refused_background_fails_chain() {
    let host = Arc::new(PumpedHost::coordination_only());
    let scheduler = Scheduler::new(SchedulerConfig::default(), host).unwrap();
    let result = outcome();
    let sink = Arc::clone(&result);

    scheduler
        .sequence("no pool")
        .then(|| {})
        .with_execution_context(ExecutionContext::BackgroundThread)
        .on_failed(move |e| sink.lock().push(Err(e)))
        .run();

    let result = result.lock();
    assert!(matches!(result[0], Err(ChainError::HostUnavailable(_))));
}

#[test]
fn test_long_synchronous_chain_does_not_overflow() {
    let (_host, scheduler) = setup();
    let count = Arc::new(AtomicUsize::new(0));

    let mut chain = scheduler.sequence("long");
    for _ in 0..10_000 {
        let count = Arc::clone(&count);
        chain = chain.then(move || {
            count.fetch_add(1, Ordering::Relaxed);
        });
    }
    let handle = chain.run();

    assert!(handle.is_finished());
    assert_eq!(count.load(Ordering::Relaxed), 10_000);
}

// ============================================================================
// LOST SIGNALS AND LIFETIME
// ============================================================================

#[test]
fn test_signal_lost_in_panicking_worker_fails_chain() {
    let (_host, scheduler) = setup();
    let finalized = Arc::new(AtomicUsize::new(0));
    let finalizer = Arc::clone(&finalized);
    let (done_tx, done_rx) = flume::bounded(1);

    let handle = scheduler
        .sequence("worker handoff")
        .then_signal(|signal: StepSignal| {
            thread::spawn(move || {
                let _signal = signal;
                panic!("worker died");
            });
        })
        .with_finalizer(move || {
            finalizer.fetch_add(1, Ordering::SeqCst);
        })
        .on_failed(move |e| {
            let _ = done_tx.send(e);
        })
        .dont_log_errors()
        .run();

    let error = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(error, ChainError::StepPanicked { .. }), "got {error:?}");
    assert!(handle.is_finished());
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dropping_scheduler_fails_queued_steps_and_releases_host() {
    let (host, scheduler) = setup();
    let finalized = Arc::new(AtomicUsize::new(0));
    let finalizer = Arc::clone(&finalized);
    let result = outcome();
    let failed = Arc::clone(&result);

    let handle = scheduler
        .sequence("orphaned")
        .then(|| {})
        .with_execution_context(ExecutionContext::Tick(TickPhase::Late))
        .with_finalizer(move || {
            finalizer.fetch_add(1, Ordering::SeqCst);
        })
        .on_failed(move |e| failed.lock().push(Err(e)))
        .dont_log_errors()
        .run();
    assert!(!handle.is_finished());

    let weak_host = Arc::downgrade(&host);
    drop(host);
    drop(scheduler);

    assert!(handle.is_finished());
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    assert!(matches!(
        result.lock().as_slice(),
        [Err(ChainError::SignalDropped { .. })]
    ));
    assert!(weak_host.upgrade().is_none());
}

#[test]
fn test_dropping_scheduler_releases_pending_nested_chain() {
    let (host, scheduler) = setup();
    let result = outcome();
    let failed = Arc::clone(&result);

    let nested = scheduler.sequence("inner").then(|| {});
    scheduler
        .sequence("outer")
        .then(|| {})
        .with_execution_context(ExecutionContext::ForceSingleThread)
        .then_chain(nested)
        .on_failed(move |e| failed.lock().push(Err(e)))
        .dont_log_errors()
        .run();
    assert_eq!(host.pending(), 1);

    let weak_host = Arc::downgrade(&host);
    drop(host);
    drop(scheduler);

    assert_eq!(result.lock().len(), 1);
    assert!(weak_host.upgrade().is_none());
}

// ============================================================================
// LOG SEVERITY
// ============================================================================

#[test]
fn test_failure_logged_at_error_with_chain_and_step() {
    let (_host, scheduler) = setup();
    let logs = capture_logs(|| {
        scheduler
            .sequence("flaky upload")
            .then(|| {})
            .then_try(|| Err::<(), _>("disk full"))
            .run();
    });

    let line = logs.line_with("chain failed").unwrap();
    assert!(line.contains("ERROR"), "{line}");
    assert!(line.contains("chain=flaky upload"), "{line}");
    assert!(line.contains("step=Some(1)"), "{line}");
    assert!(line.contains("disk full"), "{line}");
}

#[test]
fn test_dont_log_errors_downgrades_failure_to_warn() {
    let (_host, scheduler) = setup();
    let logs = capture_logs(|| {
        scheduler
            .sequence("expected miss")
            .then_try(|| Err::<(), _>("cache miss"))
            .dont_log_errors()
            .run();
    });

    let line = logs.line_with("chain failed").unwrap();
    assert!(line.contains("WARN"), "{line}");
    assert!(!line.contains("ERROR"), "{line}");
}

#[test]
fn test_abort_severity_follows_log_errors_on_abort() {
    let (_host, scheduler) = setup();
    let quiet = capture_logs(|| {
        scheduler
            .sequence("quiet abort")
            .then(|| {})
            .with_abort_condition(|| true)
            .run();
    });
    let loud = capture_logs(|| {
        scheduler
            .sequence("loud abort")
            .then(|| {})
            .with_abort_condition(|| true)
            .log_errors_on_abort()
            .run();
    });

    let line = quiet.line_with("chain aborted").unwrap();
    assert!(line.contains("WARN") && !line.contains("ERROR"), "{line}");
    let line = loud.line_with("chain aborted").unwrap();
    assert!(line.contains("ERROR"), "{line}");
}

// ============================================================================
// ASYNC
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_async_reports_outcome() {
    let host = Arc::new(PumpedHost::new(tokio::runtime::Handle::current()));
    let scheduler = Scheduler::new(SchedulerConfig::default(), host).unwrap();

    let ok = scheduler
        .sequence("async ok")
        .delay(Duration::from_millis(5))
        .then_async(|| async { Ok::<(), String>(()) })
        .run_async()
        .await;
    assert_eq!(ok, Ok(()));

    let err = scheduler
        .sequence("async err")
        .then_async(|| async { Err::<(), _>("remote refused") })
        .dont_log_errors()
        .run_async()
        .await;
    assert_eq!(err, Err(ChainError::failed(0, "remote refused")));
}
