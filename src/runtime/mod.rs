//! Execution hosts: a pumped host for caller-owned loops and a self-contained thread host.

pub mod pumped_host;
pub mod thread_host;

pub use pumped_host::PumpedHost;
pub use thread_host::ThreadHost;
