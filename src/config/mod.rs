//! Configuration models for the scheduler and its tick queues.

pub mod scheduler;

pub use scheduler::{QueueConfig, SchedulerConfig, ENV_PREFIX};
