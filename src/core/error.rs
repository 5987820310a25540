//! Error types for chain and queue operations.

use thiserror::Error;

/// Errors produced while building, dispatching, or awaiting chains.
///
/// Every failure a step or chain can observe is expressed through this type.
/// It is `Clone` so one failure can be handed to the finalizer log, the
/// terminal callback, and an enclosing chain's signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// A step signaled failure.
    #[error("step {step} failed: {reason}")]
    StepFailed {
        /// Index of the failing step, when known.
        step: usize,
        /// Caller-supplied reason.
        reason: String,
    },
    /// A step (or queue entry) panicked while running.
    #[error("`{label}` panicked: {message}")]
    StepPanicked {
        /// Registration label or source location of the step.
        label: String,
        /// Panic payload rendered as text.
        message: String,
    },
    /// A step dropped its signal without completing or failing.
    #[error("`{label}` dropped its signal without resolving")]
    SignalDropped {
        /// Registration label or source location of the step.
        label: String,
    },
    /// The chain was aborted before the given step dispatched.
    #[error("aborted before step {step}")]
    Aborted {
        /// Index of the step that never ran.
        step: usize,
    },
    /// An awaited result did not arrive in time.
    #[error("timed out after {waited_ms} ms")]
    Timeout {
        /// Milliseconds waited before giving up.
        waited_ms: u64,
    },
    /// An operation hit a container or entry that already reached a terminal state.
    #[error("already disposed: {0}")]
    Disposed(String),
    /// A concurrent batch was launched without steps.
    #[error("empty chain: {0}")]
    EmptyChain(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The execution host refused or lost a job.
    #[error("host unavailable: {0}")]
    HostUnavailable(String),
}

impl ChainError {
    /// Whether this error represents a cooperative abort rather than a failure.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Build a failure for an arbitrary displayable reason.
    pub fn failed(step: usize, reason: impl std::fmt::Display) -> Self {
        Self::StepFailed {
            step,
            reason: reason.to_string(),
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
