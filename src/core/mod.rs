//! Scheduling core: steps, containers, dispatch, and chain builders.

pub mod context;
pub mod delegate_queue;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod host;
pub mod registry;
pub mod scheduler;
pub mod signal;
pub mod stats;

mod chain;
mod concurrent;
mod concurrent_action;
mod sequential;
mod sequential_action;

pub use chain::ChainHandle;
pub use concurrent_action::ConcurrentAction;
pub use context::{ExecutionContext, TickPhase};
pub use delegate_queue::{DelegateQueue, DrainReport, QueueJob, RepeatHandle, RepeatingJob};
pub use dispatcher::TickQueues;
pub use error::{AppResult, ChainError};
pub use health::HealthMonitor;
pub use host::{AsyncJob, ExecutionHost, Job, Rejected};
pub use registry::{AbortRegistry, Abortable};
pub use scheduler::Scheduler;
pub use sequential_action::SequentialAction;
pub use signal::{IntoStep, Step, StepOutcome, StepSignal};
pub use stats::SchedulerStats;
