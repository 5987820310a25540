//! Host abstraction: the placement primitives a scheduler needs from its environment.
//!
//! The scheduler core never creates threads or runtimes itself. A host supplies
//! a coordination context (the one privileged thread), a background pool, and
//! a place to run futures. Tick phases are not part of the host: the host loop
//! drives them by calling [`Scheduler::tick`](crate::core::Scheduler::tick).

use std::fmt;

use futures::future::BoxFuture;

/// Boxed unit of work handed to a host.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Boxed future handed to a host.
pub type AsyncJob = BoxFuture<'static, ()>;

/// A job the host refused, returned so the caller can still fail cleanly.
pub struct Rejected<T> {
    /// The job that was not scheduled.
    pub payload: T,
    /// Why it was refused.
    pub reason: String,
}

impl<T> Rejected<T> {
    /// Wrap a refused job.
    pub fn new(payload: T, reason: impl Into<String>) -> Self {
        Self {
            payload,
            reason: reason.into(),
        }
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// Placement primitives provided by the host environment.
///
/// Implementations must be callable from any thread.
pub trait ExecutionHost: Send + Sync + 'static {
    /// Queue `job` to run on the coordination context.
    ///
    /// Must not run the job inline, even when called from the coordination context.
    ///
    /// # Errors
    ///
    /// Returns the job back when the coordination context is gone.
    fn post_to_coordination(&self, job: Job) -> Result<(), Rejected<Job>>;

    /// Whether the calling thread is the coordination context.
    fn is_coordination_context(&self) -> bool;

    /// Run `job` off the coordination context.
    ///
    /// # Errors
    ///
    /// Returns the job back when the background pool is shut down.
    fn spawn_background(&self, job: Job) -> Result<(), Rejected<Job>>;

    /// Drive `future` to completion off the coordination context. The future
    /// may use tokio timers.
    ///
    /// # Errors
    ///
    /// Returns the future back when no runtime is available.
    fn spawn_async(&self, future: AsyncJob) -> Result<(), Rejected<AsyncJob>>;
}
