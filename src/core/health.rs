//! Stall watchdog for running chains.
//!
//! Diagnostic only: a tripped monitor logs once and stops; it never aborts
//! the chain it watches.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::core::host::ExecutionHost;

#[derive(Debug)]
struct MonitorState {
    chain: String,
    label: String,
    last_reset: Instant,
    timeout: Duration,
    stopped: bool,
    tripped: bool,
}

/// Watchdog that reports a chain stuck on one step for longer than its timeout.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    state: Arc<Mutex<MonitorState>>,
}

impl HealthMonitor {
    /// Create an idle monitor. Call [`start`](Self::start) to begin polling.
    #[must_use]
    pub fn new(chain: impl Into<String>, timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MonitorState {
                chain: chain.into(),
                label: String::from("<not started>"),
                last_reset: Instant::now(),
                timeout,
                stopped: false,
                tripped: false,
            })),
        }
    }

    /// Poll every `interval` on the host's async facility until stopped or tripped.
    ///
    /// Returns `false` when the host refused the polling task.
    pub fn start(&self, host: &dyn ExecutionHost, interval: Duration) -> bool {
        let monitor = self.clone();
        let task = Box::pin(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !monitor.poll_once() {
                    break;
                }
            }
        });

        match host.spawn_async(task) {
            Ok(()) => true,
            Err(rejected) => {
                error!(chain = %self.chain(), reason = %rejected.reason, "health monitor could not start");
                false
            }
        }
    }

    /// Mark progress: the chain moved on to `label`.
    pub fn reset(&self, label: &str) {
        let mut state = self.state.lock();
        label.clone_into(&mut state.label);
        state.last_reset = Instant::now();
    }

    /// Stop polling at the next interval.
    pub fn stop(&self) {
        self.state.lock().stopped = true;
    }

    /// Check once. Returns whether monitoring should continue.
    pub fn poll_once(&self) -> bool {
        let mut state = self.state.lock();
        if state.stopped {
            debug!(chain = %state.chain, "health monitor stopped");
            return false;
        }
        let stalled = state.last_reset.elapsed();
        if stalled > state.timeout {
            error!(
                chain = %state.chain,
                step = %state.label,
                stalled_ms = u64::try_from(stalled.as_millis()).unwrap_or(u64::MAX),
                timeout_ms = u64::try_from(state.timeout.as_millis()).unwrap_or(u64::MAX),
                "health monitor: chain made no progress within its timeout"
            );
            state.tripped = true;
            state.stopped = true;
            return false;
        }
        true
    }

    /// Whether the monitor reported a stall.
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.state.lock().tripped
    }

    fn chain(&self) -> String {
        self.state.lock().chain.clone()
    }
}
