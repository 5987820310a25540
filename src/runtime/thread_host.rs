//! Host backed by dedicated OS threads.
//!
//! One coordination thread runs posted jobs in submission order. A fixed set
//! of worker threads runs background jobs, and a tokio runtime owned by the
//! host drives async steps and health monitors. Worker threads enter that
//! runtime, so background jobs may call `tokio::spawn`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::core::error::panic_message;
use crate::core::{AsyncJob, ChainError, ExecutionHost, Job, Rejected};

const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Host with its own coordination thread and background workers.
///
/// Call [`shutdown`](Self::shutdown) for a graceful stop; dropping the host
/// only closes the channels and detaches the threads.
pub struct ThreadHost {
    coordination_tx: Mutex<Option<Sender<Job>>>,
    coordination_id: ThreadId,
    background_tx: Mutex<Option<Sender<Job>>>,
    runtime: Mutex<Option<Runtime>>,
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
    shutdown: AtomicBool,
}

impl ThreadHost {
    /// Spawn the coordination thread, `config.background_workers` workers, and the async runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::HostUnavailable`] if a thread or the runtime cannot be created.
    pub fn new(config: &SchedulerConfig) -> Result<Self, ChainError> {
        let worker_count = config.background_workers.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_count)
            .thread_name("chain-async")
            .thread_stack_size(config.thread_stack_size)
            .enable_all()
            .build()
            .map_err(|e| ChainError::HostUnavailable(format!("async runtime: {e}")))?;

        let mut threads = Vec::with_capacity(worker_count + 1);

        let (coordination_tx, coordination_rx) = unbounded::<Job>();
        let coordinator = spawn_thread("chain-coordinator".to_string(), config.thread_stack_size, move || {
            run_jobs("chain-coordinator", &coordination_rx);
        })?;
        let coordination_id = coordinator.thread().id();
        threads.push(("chain-coordinator".to_string(), coordinator));

        let (background_tx, background_rx) = unbounded::<Job>();
        for worker_id in 0..worker_count {
            let name = format!("chain-worker-{worker_id}");
            let rx = background_rx.clone();
            let handle = runtime.handle().clone();
            let thread_name = name.clone();
            let worker = spawn_thread(name.clone(), config.thread_stack_size, move || {
                let _context = handle.enter();
                run_jobs(&thread_name, &rx);
            })?;
            threads.push((name, worker));
        }

        info!(worker_count, "thread host started");

        Ok(Self {
            coordination_tx: Mutex::new(Some(coordination_tx)),
            coordination_id,
            background_tx: Mutex::new(Some(background_tx)),
            runtime: Mutex::new(Some(runtime)),
            threads: Mutex::new(threads),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Host with `workers` background threads and otherwise default settings.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::HostUnavailable`] if a thread or the runtime cannot be created.
    pub fn with_workers(workers: usize) -> Result<Self, ChainError> {
        Self::new(&SchedulerConfig::default().with_background_workers(workers))
    }

    /// Stop accepting jobs and join every thread, waiting up to two seconds each.
    ///
    /// Threads that do not exit in time are detached. Called from inside a
    /// tokio runtime (an async step of this host included), the async runtime
    /// is shut down without waiting for its tasks.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down thread host");

        self.coordination_tx.lock().take();
        self.background_tx.lock().take();

        let threads = std::mem::take(&mut *self.threads.lock());
        let count = threads.len();
        for (name, thread) in threads {
            if thread.thread().id() == thread::current().id() {
                warn!(thread = %name, "shutdown called from a host thread; not joining it");
                continue;
            }
            join_with_timeout(&name, thread);
        }

        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            // Waiting on the runtime panics inside an async context, including its own tasks.
            if tokio::runtime::Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(JOIN_TIMEOUT);
            }
        }
        info!(threads = count, "thread host shut down");
    }

    fn send(slot: &Mutex<Option<Sender<Job>>>, job: Job, what: &str) -> Result<(), Rejected<Job>> {
        let guard = slot.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(Rejected::new(job, format!("{what} is shut down")));
        };
        tx.send(job)
            .map_err(|e| Rejected::new(e.into_inner(), format!("{what} stopped")))
    }
}

impl ExecutionHost for ThreadHost {
    fn post_to_coordination(&self, job: Job) -> Result<(), Rejected<Job>> {
        Self::send(&self.coordination_tx, job, "coordination thread")
    }

    fn is_coordination_context(&self) -> bool {
        thread::current().id() == self.coordination_id
    }

    fn spawn_background(&self, job: Job) -> Result<(), Rejected<Job>> {
        Self::send(&self.background_tx, job, "background pool")
    }

    fn spawn_async(&self, future: AsyncJob) -> Result<(), Rejected<AsyncJob>> {
        let runtime = self.runtime.lock();
        match runtime.as_ref() {
            Some(runtime) => {
                runtime.spawn(future);
                Ok(())
            }
            None => Err(Rejected::new(future, "async runtime is shut down")),
        }
    }
}

impl Drop for ThreadHost {
    fn drop(&mut self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.coordination_tx.get_mut().take();
            self.background_tx.get_mut().take();
            // Dropping a runtime blocks; that panics inside async contexts.
            if let Some(runtime) = self.runtime.get_mut().take() {
                runtime.shutdown_background();
            }
            debug!("ThreadHost dropped without explicit shutdown - threads will be detached");
        }
    }
}

impl std::fmt::Debug for ThreadHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHost")
            .field("threads", &self.threads.lock().len())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn spawn_thread<F>(name: String, stack_size: usize, body: F) -> Result<JoinHandle<()>, ChainError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .stack_size(stack_size)
        .spawn(body)
        .map_err(|e| ChainError::HostUnavailable(format!("failed to spawn {name}: {e}")))
}

// Blocks on recv; returns once every sender is gone.
fn run_jobs(thread: &str, rx: &Receiver<Job>) {
    debug!(thread, "host thread started");
    while let Ok(job) = rx.recv() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            error!(thread, panic = %panic_message(payload.as_ref()), "host job panicked");
        }
    }
    debug!(thread, "host thread exiting");
}

fn join_with_timeout(name: &str, thread: JoinHandle<()>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let joiner = thread::spawn(move || {
        let _ = tx.send(thread.join().is_ok());
    });

    match rx.recv_timeout(JOIN_TIMEOUT) {
        Ok(true) => debug!(thread = %name, "thread joined"),
        Ok(false) => warn!(thread = %name, "thread panicked"),
        Err(_) => {
            warn!(thread = %name, "thread did not exit within timeout - detaching");
            return;
        }
    }
    let _ = joiner.join();
}
