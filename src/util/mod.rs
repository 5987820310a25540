//! Shared utilities: timing and tracing setup.

pub mod clock;
pub mod telemetry;

pub use clock::{millis, Stopwatch};
pub use telemetry::init_tracing;
