//! # Prometheus Action Chain
//!
//! Composable chains of steps that run in order or all at once, each step
//! placed on the execution context it asks for.
//!
//! A host application owns one privileged coordination context (a UI thread,
//! a game loop, a main thread) plus background capacity. Work that must touch
//! host state has to run on the coordination context or inside one of the
//! host's periodic tick phases, while slow work belongs in the background.
//! This crate lets that work be written as a single readable chain instead of
//! a ladder of callbacks.
//!
//! ## Key Features
//!
//! - **Sequential chains**: steps run strictly one after another; the first
//!   failure stops the chain
//! - **Concurrent batches**: every step launches at once; the batch settles on
//!   the last completion or the first failure
//! - **Execution contexts**: inline, forced or ensured coordination, background
//!   pool, or one of three tick phases
//! - **Budgeted tick queues**: per-phase queues drained with a rate cap and a
//!   time budget, plus repeating entries
//! - **Exactly-once terminals**: finalizer and callbacks run once on every path,
//!   including panics, dropped signals, and aborts
//! - **Aborts**: per-chain conditions, handle aborts, and scheduler-wide `abort_all`
//!
//! ## Example
//!
//! ```rust,no_run
//! use prometheus_action_chain::builders::SchedulerBuilder;
//! use prometheus_action_chain::core::{ExecutionContext, TickPhase};
//!
//! # fn main() -> Result<(), prometheus_action_chain::core::ChainError> {
//! let scheduler = SchedulerBuilder::new().build()?;
//!
//! scheduler
//!     .sequence("save game")
//!     .then(|| println!("snapshot world"))
//!     .with_execution_context(ExecutionContext::EnsureSingleThread)
//!     .then_try(|| std::fs::write("save.bin", b"world"))
//!     .with_execution_context(ExecutionContext::BackgroundThread)
//!     .then(|| println!("show toast"))
//!     .with_execution_context(ExecutionContext::Tick(TickPhase::Late))
//!     .on_failed(|e| eprintln!("save failed: {e}"))
//!     .run();
//!
//! // Host loop, once per frame:
//! scheduler.tick_all();
//! # Ok(())
//! # }
//! ```
//!
//! For complete scenarios, see `tests/`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Chains, steps, containers, queues, and the scheduler.
pub mod core;
/// Configuration models for queues, hosts, and timeouts.
pub mod config;
/// Builders to construct a scheduler from configuration.
pub mod builders;
/// Execution hosts.
pub mod runtime;
/// Shared utilities.
pub mod util;

pub use builders::SchedulerBuilder;
pub use config::{QueueConfig, SchedulerConfig};
pub use core::{
    ChainError, ChainHandle, ConcurrentAction, ExecutionContext, ExecutionHost, Scheduler, SequentialAction, Step,
    StepSignal, TickPhase,
};
pub use runtime::{PumpedHost, ThreadHost};
