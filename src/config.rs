//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// What happens to a quarantined task when its durable clock fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantinePolicy {
    /// The durable tick reactivates the task and clears its failure count.
    AutoRecover,
    /// The durable tick only refreshes the lease; recovery requires an
    /// explicit `TaskHost::reset`.
    Manual,
}

impl FromStr for QuarantinePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" | "auto_recover" => Ok(Self::AutoRecover),
            "manual" => Ok(Self::Manual),
            other => Err(ConfigError::InvalidValue {
                key: "TASKBEAT_QUARANTINE_POLICY".to_string(),
                message: format!("unknown policy '{other}' (expected 'auto' or 'manual')"),
            }),
        }
    }
}

/// Task Unit configuration.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Volatile clock period (fast cadence, drives the task body).
    pub volatile_period: Duration,
    /// Durable clock period (slow cadence, pure resurrection signal).
    pub durable_period: Duration,
    /// How often the durable driver polls for due entries.
    pub durable_poll_interval: Duration,
    /// Consecutive failures before a task is quarantined.
    pub failure_threshold: u32,
    /// Quarantine re-entry policy.
    pub quarantine_policy: QuarantinePolicy,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            volatile_period: Duration::from_secs(5),
            durable_period: Duration::from_secs(1200), // 20 minutes
            durable_poll_interval: Duration::from_secs(5),
            failure_threshold: 3,
            quarantine_policy: QuarantinePolicy::AutoRecover,
        }
    }
}

impl TaskConfig {
    /// Build from `TASKBEAT_*` environment variables, falling back to defaults.
    ///
    /// Numeric variables fall back silently on parse failure; the quarantine
    /// policy is parsed strictly so a typo cannot silently become auto-recover.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let volatile_period: u64 = std::env::var("TASKBEAT_VOLATILE_PERIOD_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&s| s > 0)
            .unwrap_or(defaults.volatile_period.as_secs());

        let durable_period: u64 = std::env::var("TASKBEAT_DURABLE_PERIOD_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&s| s > 0)
            .unwrap_or(defaults.durable_period.as_secs());

        let durable_poll: u64 = std::env::var("TASKBEAT_DURABLE_POLL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&s| s > 0)
            .unwrap_or(defaults.durable_poll_interval.as_secs());

        let failure_threshold: u32 = std::env::var("TASKBEAT_FAILURE_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&t| t > 0)
            .unwrap_or(defaults.failure_threshold);

        let quarantine_policy = match std::env::var("TASKBEAT_QUARANTINE_POLICY") {
            Ok(s) => s.parse()?,
            Err(_) => defaults.quarantine_policy,
        };

        Ok(Self {
            volatile_period: Duration::from_secs(volatile_period),
            durable_period: Duration::from_secs(durable_period),
            durable_poll_interval: Duration::from_secs(durable_poll),
            failure_threshold,
            quarantine_policy,
        })
    }
}

/// Batch scheduler configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Fixed polling interval between batch cycles.
    pub poll_interval: Duration,
    /// Maximum simultaneous in-flight job executions per cycle.
    pub parallelism: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            parallelism: 4,
        }
    }
}

impl BatchConfig {
    /// Build from `TASKBEAT_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let poll_interval: u64 = std::env::var("TASKBEAT_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&s| s > 0)
            .unwrap_or(defaults.poll_interval.as_secs());

        let parallelism: usize = std::env::var("TASKBEAT_PARALLELISM")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&p| p > 0)
            .unwrap_or(defaults.parallelism);

        Self {
            poll_interval: Duration::from_secs(poll_interval),
            parallelism,
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the libSQL database file.
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/taskbeat.db".to_string(),
        }
    }
}

impl StoreConfig {
    /// Build from `TASKBEAT_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("TASKBEAT_DB_PATH")
                .unwrap_or_else(|_| Self::default().db_path),
        }
    }
}
