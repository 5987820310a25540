//! Build a scheduler from configuration.

use std::sync::Arc;

use tracing::debug;

use crate::config::SchedulerConfig;
use crate::core::{ChainError, ExecutionHost, Scheduler};
use crate::runtime::ThreadHost;

/// Assembles a [`Scheduler`] from a configuration and an optional host.
///
/// Without an explicit host, `build` starts a [`ThreadHost`] sized from the
/// configuration.
///
/// ```rust,no_run
/// use prometheus_action_chain::builders::SchedulerBuilder;
/// use prometheus_action_chain::config::SchedulerConfig;
///
/// # fn main() -> Result<(), prometheus_action_chain::core::ChainError> {
/// let scheduler = SchedulerBuilder::new()
///     .with_config(SchedulerConfig::default().with_background_workers(2))
///     .build()?;
/// scheduler.sequence("warmup").then(|| println!("ready")).run();
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    host: Option<Arc<dyn ExecutionHost>>,
}

impl SchedulerBuilder {
    /// Builder with default configuration and no host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Place steps on `host` instead of a fresh [`ThreadHost`].
    #[must_use]
    pub fn with_host(mut self, host: Arc<dyn ExecutionHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Validate the configuration and create the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::InvalidConfig`] for a bad configuration, or
    /// [`ChainError::HostUnavailable`] if the default host cannot start.
    pub fn build(self) -> Result<Scheduler, ChainError> {
        self.config.validate().map_err(ChainError::InvalidConfig)?;

        let host = match self.host {
            Some(host) => host,
            None => {
                debug!(workers = self.config.background_workers, "starting default thread host");
                Arc::new(ThreadHost::new(&self.config)?)
            }
        };
        Scheduler::new(self.config, host)
    }
}

impl std::fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("config", &self.config)
            .field("custom_host", &self.host.is_some())
            .finish()
    }
}
