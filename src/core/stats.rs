//! Scheduler-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time view of a scheduler's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Chains that called `run`.
    pub chains_started: u64,
    /// Chains that completed successfully.
    pub chains_completed: u64,
    /// Chains that failed (not counting aborts).
    pub chains_failed: u64,
    /// Chains that were aborted.
    pub chains_aborted: u64,
    /// Steps handed to the dispatcher.
    pub steps_dispatched: u64,
    /// Steps skipped by their skip condition.
    pub steps_skipped: u64,
    /// Duplicate or post-terminal signals detected.
    pub double_signals: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SchedulerCounters {
    pub chains_started: AtomicU64,
    pub chains_completed: AtomicU64,
    pub chains_failed: AtomicU64,
    pub chains_aborted: AtomicU64,
    pub steps_dispatched: AtomicU64,
    pub steps_skipped: AtomicU64,
    pub double_signals: AtomicU64,
}

impl SchedulerCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            chains_started: self.chains_started.load(Ordering::Relaxed),
            chains_completed: self.chains_completed.load(Ordering::Relaxed),
            chains_failed: self.chains_failed.load(Ordering::Relaxed),
            chains_aborted: self.chains_aborted.load(Ordering::Relaxed),
            steps_dispatched: self.steps_dispatched.load(Ordering::Relaxed),
            steps_skipped: self.steps_skipped.load(Ordering::Relaxed),
            double_signals: self.double_signals.load(Ordering::Relaxed),
        }
    }
}
