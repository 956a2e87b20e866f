// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Orchestrator configuration
//!
//! Loaded once at startup and passed explicitly to every component. A
//! redeploy builds a new configuration rather than mutating this one.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
}

/// Per data source admission limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceLimits {
    /// Maximum simultaneously active interactive items
    pub concurrency: usize,
    /// Maximum simultaneously active pre-aggregation builds
    pub build_concurrency: usize,
}

/// Query queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Interactive cap for data sources without an override
    pub default_concurrency: usize,

    /// Build cap for data sources without an override
    pub default_build_concurrency: usize,

    /// Per data source overrides; caps should not exceed the driver pool size
    pub data_sources: HashMap<String, DataSourceLimits>,

    /// Attempts before a transient failure is surfaced as fatal
    pub max_attempts: u32,

    /// First retry delay, doubled on each further attempt
    pub backoff_base: Duration,

    /// Upper bound for a single retry delay
    pub backoff_max: Duration,

    /// Timeout used by requests that do not carry one
    pub default_timeout: Duration,

    /// How often expired leases and orphaned items are swept
    pub lease_sweep_interval: Duration,

    /// How often an executing worker renews its lease
    pub lease_renew_interval: Duration,

    /// How long an active cancel waits for the driver before forcing
    pub cancel_grace: Duration,

    /// Pending items without waiters are dropped after this long
    pub orphaned_timeout: Duration,

    /// Bounded wait for a pooled connection
    pub acquire_timeout: Duration,

    /// Poll interval for items executed by another queue process
    pub result_poll_interval: Duration,

    /// How long finished outcomes stay readable in the queue store
    pub result_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 2,
            default_build_concurrency: 1,
            data_sources: HashMap::new(),
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            default_timeout: Duration::from_secs(600), // 10 minutes
            lease_sweep_interval: Duration::from_secs(5),
            lease_renew_interval: Duration::from_secs(1),
            cancel_grace: Duration::from_secs(5),
            orphaned_timeout: Duration::from_secs(120),
            acquire_timeout: Duration::from_secs(20),
            result_poll_interval: Duration::from_millis(100),
            result_retention: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    /// Limits that apply to a data source
    pub fn limits_for(&self, data_source: &str) -> DataSourceLimits {
        self.data_sources
            .get(data_source)
            .copied()
            .unwrap_or(DataSourceLimits {
                concurrency: self.default_concurrency,
                build_concurrency: self.default_build_concurrency,
            })
    }
}

/// How stale cache entries are renewed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenewalPolicy {
    /// Caller waits for a fresh execution
    Foreground,
    /// Stale entry is returned immediately and refreshed in the background
    StaleWhileRevalidate,
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable/disable result caching entirely
    pub enabled: bool,

    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,

    /// Maximum accounted bytes before LRU eviction
    pub max_bytes: usize,

    /// TTL for entries stored without an explicit one
    pub default_ttl: Duration,

    /// How long an entry outlives its TTL so it can be served stale
    pub stale_grace: Duration,

    pub renewal: RenewalPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            max_bytes: 1024 * 1024 * 256, // 256MB
            default_ttl: Duration::from_secs(24 * 3600),
            stale_grace: Duration::from_secs(3600),
            renewal: RenewalPolicy::Foreground,
        }
    }
}

/// Pre-aggregation scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,

    /// Interval between scheduling ticks
    pub tick_interval: Duration,

    /// How far back from now partitions are kept fresh
    pub history: Duration,

    /// How far ahead of now partitions are built
    pub future: Duration,

    /// Partitions ending before `now - retention` are dropped
    pub retention: Duration,

    /// Unreferenced staging tables older than this are garbage collected
    pub staging_max_age: Duration,

    /// Schema that receives pre-aggregation tables
    pub schema: String,

    /// IANA timezone used for bucket boundaries
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(30),
            history: Duration::from_secs(7 * 24 * 3600),
            future: Duration::ZERO,
            retention: Duration::from_secs(30 * 24 * 3600),
            staging_max_age: Duration::from_secs(3600),
            schema: "pre_aggregations".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn timezone(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| ConfigError::Invalid(format!("timezone '{}': {}", self.timezone, e)))
    }
}

impl OrchestratorConfig {
    /// Parse a JSON configuration document and validate it
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let queue = &self.queue;
        if queue.default_concurrency == 0 || queue.default_build_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "Queue concurrency caps must be > 0".to_string(),
            ));
        }
        for (name, limits) in &queue.data_sources {
            if limits.concurrency == 0 || limits.build_concurrency == 0 {
                return Err(ConfigError::Invalid(format!(
                    "Data source '{}' must have concurrency caps > 0",
                    name
                )));
            }
        }
        if queue.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be >= 1".to_string()));
        }
        if queue.backoff_base > queue.backoff_max {
            return Err(ConfigError::Invalid(format!(
                "backoff_base ({:?}) exceeds backoff_max ({:?})",
                queue.backoff_base, queue.backoff_max
            )));
        }
        if queue.lease_renew_interval.is_zero()
            || queue.lease_sweep_interval.is_zero()
            || queue.result_poll_interval.is_zero()
        {
            return Err(ConfigError::Invalid(
                "Lease and poll intervals must be non-zero".to_string(),
            ));
        }

        if self.cache.enabled && (self.cache.max_entries == 0 || self.cache.max_bytes == 0) {
            return Err(ConfigError::Invalid(
                "Cache must allow at least one entry and one byte".to_string(),
            ));
        }

        let scheduler = &self.scheduler;
        if scheduler.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("tick_interval must be non-zero".to_string()));
        }
        if scheduler.retention < scheduler.history {
            return Err(ConfigError::Invalid(format!(
                "retention ({:?}) is shorter than history ({:?})",
                scheduler.retention, scheduler.history
            )));
        }
        if scheduler.schema.is_empty() {
            return Err(ConfigError::Invalid(
                "Pre-aggregation schema must not be empty".to_string(),
            ));
        }
        scheduler.timezone()?;

        Ok(())
    }
}
