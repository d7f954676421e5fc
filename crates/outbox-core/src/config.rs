//! Engine configuration.
//!
//! Every tunable of the queue, scheduler, dispatcher and conflict handling
//! lives in one serde-friendly struct so hosts can load it from JSON and
//! override individual values with the `with_*` builders.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{Priority, ResolutionStrategy, DEFAULT_MAX_RETRIES};

/// Relative share of each tier in a scheduled batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierWeights {
    pub critical: u32,
    pub high: u32,
    pub normal: u32,
    pub low: u32,
}

impl Default for TierWeights {
    fn default() -> Self {
        Self {
            critical: 10,
            high: 5,
            normal: 3,
            low: 1,
        }
    }
}

impl TierWeights {
    pub const fn weight(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    pub const fn total(&self) -> u32 {
        self.critical + self.high + self.normal + self.low
    }
}

/// Configuration for the sync engine and its components
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of operations held by the durable queue
    pub max_queue_size: usize,
    /// Attempts granted to each operation at enqueue time
    pub max_retries: u32,
    /// Largest number of operations in one dispatched batch
    pub max_batch_size: usize,
    /// Batches executed in parallel within one sync run
    pub max_concurrent_batches: usize,
    /// Delay used to coalesce sync triggers
    pub sync_debounce_ms: u64,
    /// Timeout applied to every remote call
    pub remote_timeout_ms: u64,
    /// How often aging operations are escalated
    pub escalation_interval_secs: u64,
    /// Age after which a queued operation is promoted one tier
    pub escalation_threshold_secs: u64,
    pub tier_weights: TierWeights,
    /// Default priority per target, applied after the retry and delete rules
    pub target_priorities: BTreeMap<String, Priority>,
    /// Fields whose concurrent change is a high severity conflict
    pub critical_fields: BTreeSet<String>,
    /// Fields whose concurrent change is a medium severity conflict
    pub important_fields: BTreeSet<String>,
    /// Strategy used when findings can be resolved automatically
    pub resolution_strategy: ResolutionStrategy,
    /// Attempts an optimistic update gets before it is rolled back
    pub optimistic_max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_retries: DEFAULT_MAX_RETRIES,
            max_batch_size: 50,
            max_concurrent_batches: 5,
            sync_debounce_ms: 1000,
            remote_timeout_ms: 30_000,
            escalation_interval_secs: 60,
            escalation_threshold_secs: 30 * 60,
            tier_weights: TierWeights::default(),
            target_priorities: BTreeMap::new(),
            critical_fields: BTreeSet::new(),
            important_fields: BTreeSet::new(),
            resolution_strategy: ResolutionStrategy::default(),
            optimistic_max_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON, keeping defaults for absent keys
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_queue_size == 0 {
            return Err(crate::Error::InvalidInput(
                "max_queue_size must be greater than zero".into(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(crate::Error::InvalidInput(
                "max_batch_size must be greater than zero".into(),
            ));
        }
        if self.max_concurrent_batches == 0 {
            return Err(crate::Error::InvalidInput(
                "max_concurrent_batches must be greater than zero".into(),
            ));
        }
        if self.escalation_interval_secs == 0 {
            return Err(crate::Error::InvalidInput(
                "escalation_interval_secs must be greater than zero".into(),
            ));
        }
        if self.tier_weights.total() == 0 {
            return Err(crate::Error::InvalidInput(
                "tier_weights must not all be zero".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub const fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    #[must_use]
    pub const fn with_max_concurrent_batches(mut self, batches: usize) -> Self {
        self.max_concurrent_batches = batches;
        self
    }

    #[must_use]
    pub fn with_sync_debounce(mut self, debounce: Duration) -> Self {
        self.sync_debounce_ms = u64::try_from(debounce.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_target_priority(mut self, target: impl Into<String>, priority: Priority) -> Self {
        self.target_priorities.insert(target.into(), priority);
        self
    }

    #[must_use]
    pub fn with_critical_field(mut self, field: impl Into<String>) -> Self {
        self.critical_fields.insert(field.into());
        self
    }

    #[must_use]
    pub fn with_important_field(mut self, field: impl Into<String>) -> Self {
        self.important_fields.insert(field.into());
        self
    }

    #[must_use]
    pub const fn with_resolution_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.resolution_strategy = strategy;
        self
    }

    pub const fn sync_debounce(&self) -> Duration {
        Duration::from_millis(self.sync_debounce_ms)
    }

    pub const fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub const fn escalation_interval(&self) -> Duration {
        Duration::from_secs(self.escalation_interval_secs)
    }

    pub fn escalation_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.escalation_threshold_secs).unwrap_or(i64::MAX))
    }
}
