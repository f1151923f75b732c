//! # Configuration
//!
//! Typed configuration for the orchestration core. Every section has sane
//! defaults so an empty configuration is valid; [`ConfigManager`] layers
//! YAML files and `PIPELINE__`-prefixed environment variables on top.
//!
//! ```yaml
//! correlator:
//!   default_task_timeout_ms: 600000
//! dispatch:
//!   max_attempts: 5
//!   load_balancer: capacity_based
//! ```

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::dispatcher::LoadBalancer;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub correlator: CorrelatorConfig,
    pub dispatch: DispatchConfig,
    pub worker_pool: WorkerPoolConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        self.correlator.validate()?;
        self.dispatch.validate()?;
        self.worker_pool.validate()?;
        self.circuit_breaker.validate()?;

        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                "0",
                "broadcast channel capacity must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Pending wait timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    pub default_async_timeout_ms: u64,
    pub default_task_timeout_ms: u64,
    /// `None` lets children aggregates wait indefinitely
    pub default_children_timeout_ms: Option<u64>,
    /// How long a response for a not-yet-registered id is parked
    pub early_response_grace_ms: u64,
    /// How long resolved ids are remembered for duplicate detection
    pub tombstone_retention_ms: u64,
    /// Period of the background prune of tombstones and completed invocations
    pub prune_interval_ms: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            default_async_timeout_ms: 300_000,
            default_task_timeout_ms: 600_000,
            default_children_timeout_ms: None,
            early_response_grace_ms: 30_000,
            tombstone_retention_ms: 3_600_000,
            prune_interval_ms: 60_000,
        }
    }
}

impl CorrelatorConfig {
    pub fn default_async_timeout(&self) -> Duration {
        Duration::from_millis(self.default_async_timeout_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }

    pub fn default_children_timeout(&self) -> Option<Duration> {
        self.default_children_timeout_ms.map(Duration::from_millis)
    }

    pub fn early_response_grace(&self) -> Duration {
        Duration::from_millis(self.early_response_grace_ms)
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_millis(self.tombstone_retention_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.default_async_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "correlator.default_async_timeout_ms",
                "0",
                "timeout must be greater than 0",
            ));
        }
        if self.default_task_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "correlator.default_task_timeout_ms",
                "0",
                "timeout must be greater than 0",
            ));
        }
        if self.prune_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "correlator.prune_interval_ms",
                "0",
                "interval must be greater than 0",
            ));
        }
        if self.default_children_timeout_ms == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "correlator.default_children_timeout_ms",
                "0",
                "omit the field to wait indefinitely",
            ));
        }
        Ok(())
    }
}

/// Task dispatch retry policy and queue sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub queue_capacity: usize,
    pub load_balancer: LoadBalancer,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            queue_capacity: 1024,
            load_balancer: LoadBalancer::LeastLoad,
        }
    }
}

impl DispatchConfig {
    /// Backoff before retry number `retry` (1-based), capped at `max_delay_ms`
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let delay = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatch.max_attempts",
                "0",
                "at least one attempt is required",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "dispatch.backoff_multiplier",
                self.backoff_multiplier.to_string(),
                "multiplier must be at least 1.0",
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "dispatch.max_delay_ms",
                self.max_delay_ms.to_string(),
                "must not be lower than dispatch.base_delay_ms",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatch.queue_capacity",
                "0",
                "queue capacity must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    /// Workers without a heartbeat for this long are ineligible
    pub heartbeat_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 1000,
            heartbeat_timeout_ms: 30_000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_workers == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_pool.max_workers",
                "0",
                "max workers must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker around the task queue transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Successful half-open calls that close it again
    pub success_threshold: u32,
    /// Time spent open before probing
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.failure_threshold",
                "0",
                "threshold must be greater than 0",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.success_threshold",
                "0",
                "threshold must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Overrides the environment-derived default level
    pub level: Option<String>,
    pub json: bool,
}
