//! Execution placement requested by a step.

use serde::{Deserialize, Serialize};

/// Periodic tick phase driven by the host (early, fixed-step, late).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickPhase {
    /// First phase of a host tick.
    Early,
    /// Fixed-rate phase (physics-style).
    Fixed,
    /// Last phase of a host tick.
    Late,
}

impl TickPhase {
    /// All phases in their host drain order.
    pub const ALL: [Self; 3] = [Self::Early, Self::Fixed, Self::Late];

    /// Short name used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Early => "early",
            Self::Fixed => "fixed",
            Self::Late => "late",
        }
    }
}

/// Where a step runs once its turn comes.
///
/// Attached per step while the chain is built; immutable after `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    /// Run synchronously in whatever context advances the chain.
    #[default]
    Unconstrained,
    /// Always hop onto the coordination context, even if already there.
    ForceSingleThread,
    /// Run inline when already on the coordination context, otherwise hop.
    EnsureSingleThread,
    /// Run on the host's background pool.
    BackgroundThread,
    /// Run during the host's next drain of the given tick phase.
    Tick(TickPhase),
}

impl ExecutionContext {
    /// Short name used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unconstrained => "unconstrained",
            Self::ForceSingleThread => "force_single_thread",
            Self::EnsureSingleThread => "ensure_single_thread",
            Self::BackgroundThread => "background_thread",
            Self::Tick(phase) => phase.as_str(),
        }
    }
}
