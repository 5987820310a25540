//! Scheduler root: one host, three tick queues, the abort registry, counters.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::info;

use crate::config::SchedulerConfig;
use crate::core::delegate_queue::{DelegateQueue, DrainReport, QueueJob};
use crate::core::dispatcher::{Dispatcher, TickQueues};
use crate::core::host::ExecutionHost;
use crate::core::registry::AbortRegistry;
use crate::core::stats::{SchedulerCounters, SchedulerStats};
use crate::core::{ChainError, ConcurrentAction, SequentialAction, TickPhase};

struct SchedulerInner {
    config: SchedulerConfig,
    dispatcher: Dispatcher,
    registry: AbortRegistry,
    counters: Arc<SchedulerCounters>,
}

/// Entry point for building and running chains.
///
/// Cheap to clone; every clone shares the same queues and registry. Chains
/// created from one scheduler are only affected by that scheduler's
/// [`abort_all`](Self::abort_all).
///
/// Running chains only hold the scheduler weakly. Dropping the last clone
/// drops every step still waiting in a tick queue or on the host, which
/// fails those steps with [`ChainError::SignalDropped`] and runs their
/// chains' finalizers and failure callbacks.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler over `host`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: SchedulerConfig, host: Arc<dyn ExecutionHost>) -> Result<Self, ChainError> {
        config.validate().map_err(ChainError::InvalidConfig)?;

        let queues = Arc::new(TickQueues::from_config(&config));
        info!(
            early_rate = config.early.processing_rate,
            fixed_rate = config.fixed.processing_rate,
            late_rate = config.late.processing_rate,
            fairness_yield_every = config.fairness_yield_every,
            "scheduler initialized"
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                dispatcher: Dispatcher::new(host, queues),
                config,
                registry: AbortRegistry::new(),
                counters: Arc::new(SchedulerCounters::default()),
            }),
        })
    }

    /// Start building an ordered chain.
    pub fn sequence(&self, name: impl Into<String>) -> SequentialAction {
        SequentialAction::new(self.clone(), name)
    }

    /// Start building a concurrent batch.
    pub fn concurrent(&self, name: impl Into<String>) -> ConcurrentAction {
        ConcurrentAction::new(self.clone(), name)
    }

    /// Drain the queue of `phase`. The host loop calls this once per phase per tick.
    pub fn tick(&self, phase: TickPhase) -> DrainReport {
        self.queue(phase).drain()
    }

    /// Drain all three phases in order.
    pub fn tick_all(&self) -> [DrainReport; 3] {
        TickPhase::ALL.map(|phase| self.tick(phase))
    }

    /// The queue for `phase`, for direct enqueueing.
    #[must_use]
    pub fn queue(&self, phase: TickPhase) -> &DelegateQueue {
        self.inner.dispatcher.queues().get(phase)
    }

    /// Run `job` during the next drain of `phase` and wait for its result.
    ///
    /// Waits up to the configured `execute_timeout_ms`.
    ///
    /// # Errors
    ///
    /// Returns the job's failure, or `Timeout` when no drain ran it in time.
    pub async fn execute_on(&self, phase: TickPhase, job: QueueJob) -> Result<(), ChainError> {
        let timeout = Duration::from_millis(self.inner.config.execute_timeout_ms);
        self.queue(phase).execute_async(job, timeout).await
    }

    /// Abort every running chain of this scheduler. Returns how many were asked.
    pub fn abort_all(&self) -> usize {
        self.inner.registry.abort_all()
    }

    /// Number of chains currently registered as running.
    #[must_use]
    pub fn active_chains(&self) -> usize {
        self.inner.registry.len()
    }

    /// Snapshot of the scheduler counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.inner.counters.snapshot()
    }

    /// Configuration this scheduler was built with.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// The host steps are placed on.
    #[must_use]
    pub fn host(&self) -> &Arc<dyn ExecutionHost> {
        self.inner.dispatcher.host()
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn registry(&self) -> &AbortRegistry {
        &self.inner.registry
    }

    pub(crate) fn counters(&self) -> &Arc<SchedulerCounters> {
        &self.inner.counters
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning scheduler reference held by running chains and pending nested builders.
#[derive(Clone)]
pub(crate) struct WeakScheduler {
    inner: Weak<SchedulerInner>,
}

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.inner.upgrade().map(|inner| Scheduler { inner })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("active_chains", &self.active_chains())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
