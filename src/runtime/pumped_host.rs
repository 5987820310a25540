//! Host whose coordination context is a thread the caller already owns.
//!
//! Fits game loops, UI loops, and tests: the thread that creates the host
//! becomes the coordination context and runs posted jobs whenever it calls
//! [`PumpedHost::pump`]. Background and async work go to a tokio runtime.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, ThreadId};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, error};

use crate::core::error::panic_message;
use crate::core::{AsyncJob, ExecutionHost, Job, Rejected};

/// Host pumped by its owning thread.
pub struct PumpedHost {
    owner: ThreadId,
    tx: Sender<Job>,
    rx: Receiver<Job>,
    handle: Option<Handle>,
    runtime: Mutex<Option<Runtime>>,
}

impl PumpedHost {
    /// Host using an existing tokio runtime for background and async work.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self::build(Some(handle), None)
    }

    /// Host owning a multi-threaded runtime with `worker_threads` workers.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the runtime cannot be built.
    pub fn with_worker_threads(worker_threads: usize) -> Result<Self, std::io::Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("pumped-host-worker")
            .enable_all()
            .build()?;
        Ok(Self::build(Some(runtime.handle().clone()), Some(runtime)))
    }

    /// Host with a coordination context only; background and async work is refused.
    #[must_use]
    pub fn coordination_only() -> Self {
        Self::build(None, None)
    }

    fn build(handle: Option<Handle>, runtime: Option<Runtime>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            owner: thread::current().id(),
            tx,
            rx,
            handle,
            runtime: Mutex::new(runtime),
        }
    }

    /// Run every job posted so far, in submission order. Returns how many ran.
    ///
    /// Jobs posted while pumping run on the next call. Only the owning thread
    /// may pump; other callers get 0.
    pub fn pump(&self) -> usize {
        if thread::current().id() != self.owner {
            error!("pump called off the owning thread; ignoring");
            return 0;
        }

        let batch = self.rx.len();
        let mut ran = 0;
        for _ in 0..batch {
            let Ok(job) = self.rx.try_recv() else {
                break;
            };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                error!(panic = %panic_message(payload.as_ref()), "coordination job panicked");
            }
            ran += 1;
        }
        if ran > 0 {
            debug!(ran, "pumped coordination jobs");
        }
        ran
    }

    /// Jobs waiting for the next [`pump`](Self::pump).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl ExecutionHost for PumpedHost {
    fn post_to_coordination(&self, job: Job) -> Result<(), Rejected<Job>> {
        self.tx
            .send(job)
            .map_err(|e| Rejected::new(e.into_inner(), "coordination queue closed"))
    }

    fn is_coordination_context(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn spawn_background(&self, job: Job) -> Result<(), Rejected<Job>> {
        match &self.handle {
            Some(handle) => {
                handle.spawn_blocking(job);
                Ok(())
            }
            None => Err(Rejected::new(job, "no background runtime configured")),
        }
    }

    fn spawn_async(&self, future: AsyncJob) -> Result<(), Rejected<AsyncJob>> {
        match &self.handle {
            Some(handle) => {
                handle.spawn(future);
                Ok(())
            }
            None => Err(Rejected::new(future, "no async runtime configured")),
        }
    }
}

impl Drop for PumpedHost {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for PumpedHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumpedHost")
            .field("owner", &self.owner)
            .field("pending", &self.pending())
            .field("has_runtime", &self.handle.is_some())
            .finish()
    }
}
