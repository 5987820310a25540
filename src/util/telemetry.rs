//! Tracing setup for binaries and tests embedding the scheduler.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "prometheus_action_chain=info";

/// Install an env-filtered fmt subscriber unless one is already set.
///
/// Reads `RUST_LOG`, falling back to [`DEFAULT_FILTER`]. Safe to call more
/// than once; later calls are no-ops.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
