//! Scheduler and tick-queue configuration structures.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::{AppResult, TickPhase};

/// Prefix for environment overrides read by [`SchedulerConfig::from_env`].
pub const ENV_PREFIX: &str = "ACTION_CHAIN_";

/// Drain limits for one tick-phase queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum one-shot entries executed per drain.
    pub processing_rate: usize,
    /// Wall-clock budget for one-shot entries per drain, in milliseconds.
    pub time_budget_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            processing_rate: 50,
            time_budget_ms: 30,
        }
    }
}

impl QueueConfig {
    /// Set the processing rate.
    #[must_use]
    pub const fn with_processing_rate(mut self, rate: usize) -> Self {
        self.processing_rate = rate;
        self
    }

    /// Set the time budget in milliseconds.
    #[must_use]
    pub const fn with_time_budget_ms(mut self, ms: u64) -> Self {
        self.time_budget_ms = ms;
        self
    }

    /// Time budget as a `Duration`.
    #[must_use]
    pub const fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }

    /// Validate queue limits.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.processing_rate == 0 {
            return Err("processing_rate must be greater than 0".into());
        }
        if self.time_budget_ms == 0 {
            return Err("time_budget_ms must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root scheduler configuration.
///
/// # Example
///
/// ```rust
/// use prometheus_action_chain::config::{QueueConfig, SchedulerConfig};
///
/// let config = SchedulerConfig::default()
///     .with_background_workers(2)
///     .with_late(QueueConfig::default().with_processing_rate(10));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Early tick-phase queue.
    pub early: QueueConfig,
    /// Fixed tick-phase queue.
    pub fixed: QueueConfig,
    /// Late tick-phase queue.
    pub late: QueueConfig,
    /// Background worker threads for hosts that own a pool.
    pub background_workers: usize,
    /// Stack size for host-owned threads, in bytes.
    pub thread_stack_size: usize,
    /// A sequence driving this many synchronous completions in a row yields its thread. 0 disables.
    pub fairness_yield_every: usize,
    /// How often health monitors poll, in milliseconds.
    pub health_poll_interval_ms: u64,
    /// Timeout used by `with_default_health_monitor`, in milliseconds.
    pub default_health_timeout_ms: u64,
    /// Default wait for [`Scheduler::execute_on`](crate::core::Scheduler::execute_on), in milliseconds.
    pub execute_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            early: QueueConfig::default(),
            fixed: QueueConfig::default(),
            late: QueueConfig::default(),
            background_workers: num_cpus::get(),
            thread_stack_size: 2 * 1024 * 1024,
            fairness_yield_every: 64,
            health_poll_interval_ms: 1000,
            default_health_timeout_ms: 10_000,
            execute_timeout_ms: 5000,
        }
    }
}

impl SchedulerConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the early-phase queue limits.
    #[must_use]
    pub const fn with_early(mut self, queue: QueueConfig) -> Self {
        self.early = queue;
        self
    }

    /// Set the fixed-phase queue limits.
    #[must_use]
    pub const fn with_fixed(mut self, queue: QueueConfig) -> Self {
        self.fixed = queue;
        self
    }

    /// Set the late-phase queue limits.
    #[must_use]
    pub const fn with_late(mut self, queue: QueueConfig) -> Self {
        self.late = queue;
        self
    }

    /// Set the number of background workers.
    #[must_use]
    pub const fn with_background_workers(mut self, count: usize) -> Self {
        self.background_workers = count;
        self
    }

    /// Set the thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Set the fairness yield interval.
    #[must_use]
    pub const fn with_fairness_yield_every(mut self, every: usize) -> Self {
        self.fairness_yield_every = every;
        self
    }

    /// Set the health monitor poll interval.
    #[must_use]
    pub const fn with_health_poll_interval_ms(mut self, ms: u64) -> Self {
        self.health_poll_interval_ms = ms;
        self
    }

    /// Set the default health monitor timeout.
    #[must_use]
    pub const fn with_default_health_timeout_ms(mut self, ms: u64) -> Self {
        self.default_health_timeout_ms = ms;
        self
    }

    /// Set the default `execute_on` wait.
    #[must_use]
    pub const fn with_execute_timeout_ms(mut self, ms: u64) -> Self {
        self.execute_timeout_ms = ms;
        self
    }

    /// Queue limits for a tick phase.
    #[must_use]
    pub const fn queue(&self, phase: TickPhase) -> &QueueConfig {
        match phase {
            TickPhase::Early => &self.early,
            TickPhase::Fixed => &self.fixed,
            TickPhase::Late => &self.late,
        }
    }

    fn queue_mut(&mut self, phase: TickPhase) -> &mut QueueConfig {
        match phase {
            TickPhase::Early => &mut self.early,
            TickPhase::Fixed => &mut self.fixed,
            TickPhase::Late => &mut self.late,
        }
    }

    /// Validate every field.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending field.
    pub fn validate(&self) -> Result<(), String> {
        for phase in TickPhase::ALL {
            self.queue(phase)
                .validate()
                .map_err(|e| format!("queue `{}` invalid: {e}", phase.as_str()))?;
        }
        if self.background_workers == 0 {
            return Err("background_workers must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        if self.health_poll_interval_ms == 0 {
            return Err("health_poll_interval_ms must be greater than 0".into());
        }
        if self.default_health_timeout_ms == 0 {
            return Err("default_health_timeout_ms must be greater than 0".into());
        }
        if self.execute_timeout_ms == 0 {
            return Err("execute_timeout_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `.env` if present, then apply `ACTION_CHAIN_*` overrides to the defaults.
    ///
    /// # Errors
    ///
    /// Fails when a variable does not parse or the result does not validate.
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (called with full `ACTION_CHAIN_*` names) to the defaults.
    ///
    /// # Errors
    ///
    /// Fails when a value does not parse or the result does not validate.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        for phase in TickPhase::ALL {
            let upper = phase.as_str().to_ascii_uppercase();
            if let Some(v) = read_var(&lookup, &format!("{upper}_PROCESSING_RATE"))? {
                cfg.queue_mut(phase).processing_rate = v;
            }
            if let Some(v) = read_var(&lookup, &format!("{upper}_TIME_BUDGET_MS"))? {
                cfg.queue_mut(phase).time_budget_ms = v;
            }
        }
        if let Some(v) = read_var(&lookup, "BACKGROUND_WORKERS")? {
            cfg.background_workers = v;
        }
        if let Some(v) = read_var(&lookup, "THREAD_STACK_SIZE")? {
            cfg.thread_stack_size = v;
        }
        if let Some(v) = read_var(&lookup, "FAIRNESS_YIELD_EVERY")? {
            cfg.fairness_yield_every = v;
        }
        if let Some(v) = read_var(&lookup, "HEALTH_POLL_INTERVAL_MS")? {
            cfg.health_poll_interval_ms = v;
        }
        if let Some(v) = read_var(&lookup, "DEFAULT_HEALTH_TIMEOUT_MS")? {
            cfg.default_health_timeout_ms = v;
        }
        if let Some(v) = read_var(&lookup, "EXECUTE_TIMEOUT_MS")? {
            cfg.execute_timeout_ms = v;
        }

        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }
}

fn read_var<F, T>(lookup: &F, suffix: &str) -> AppResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let key = format!("{ENV_PREFIX}{suffix}");
    lookup(&key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("{key}={raw} is not a valid value"))
        })
        .transpose()
}
