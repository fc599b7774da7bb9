//! Configuration for split planning and assignment.
//!
//! `SplitConfig` can be built in code with [`SplitConfig::builder`] or
//! deserialized from JSON; durations are expressed in milliseconds.
//!
//! ```json
//! {
//!   "chunk_sizing": { "target_rows": 250000 },
//!   "strategy": "auto",
//!   "strategy_overrides": { "shop.audit_log": "single" },
//!   "lease_timeout_ms": 120000
//! }
//! ```

use crate::context::ChunkSizing;
use crate::error::{Result, SplitError};
use crate::resilience::{RetryPolicy, DEFAULT_JITTER};
use crate::schema::CollectionId;
use crate::strategy::StrategySelection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for snapshot split planning and assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Chunk sizing (default: 10,000 rows per chunk)
    #[serde(default)]
    pub chunk_sizing: ChunkSizing,

    /// Default strategy selection
    #[serde(default)]
    pub strategy: StrategySelection,

    /// Per-collection strategy overrides, keyed by `database.collection`
    #[serde(default)]
    pub strategy_overrides: HashMap<String, StrategySelection>,

    /// Sampled keys drawn per desired chunk
    #[serde(default = "default_samples_per_chunk")]
    pub samples_per_chunk: usize,

    /// Upper bound on the sample size of one collection
    #[serde(default = "default_max_sample_size")]
    pub max_sample_size: usize,

    /// Lease age after which an assigned split is reclaimed
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,

    /// Period of the coordinator's reclaim tick
    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,

    /// Collections planned concurrently
    #[serde(default = "default_planning_concurrency")]
    pub planning_concurrency: usize,

    /// Retries per catalog/schema call before the collection fails
    #[serde(default = "default_planning_retries")]
    pub planning_retries: u32,

    /// Base retry delay
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Retry delay cap
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Coordinator command channel capacity
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_samples_per_chunk() -> usize {
    10
}

fn default_max_sample_size() -> usize {
    1_000
}

fn default_lease_timeout_ms() -> u64 {
    60_000
}

fn default_reclaim_interval_ms() -> u64 {
    5_000
}

fn default_planning_concurrency() -> usize {
    4
}

fn default_planning_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_command_buffer() -> usize {
    256
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            chunk_sizing: ChunkSizing::default(),
            strategy: StrategySelection::default(),
            strategy_overrides: HashMap::new(),
            samples_per_chunk: default_samples_per_chunk(),
            max_sample_size: default_max_sample_size(),
            lease_timeout_ms: default_lease_timeout_ms(),
            reclaim_interval_ms: default_reclaim_interval_ms(),
            planning_concurrency: default_planning_concurrency(),
            planning_retries: default_planning_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            command_buffer: default_command_buffer(),
        }
    }
}

impl SplitConfig {
    pub fn builder() -> SplitConfigBuilder {
        SplitConfigBuilder::default()
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SplitConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Large collections: bigger chunks, longer leases.
    pub fn large_collections() -> Self {
        Self {
            chunk_sizing: ChunkSizing::TargetRows(250_000),
            samples_per_chunk: 20,
            max_sample_size: 50_000,
            lease_timeout_ms: 10 * 60_000,
            planning_concurrency: 8,
            ..Default::default()
        }
    }

    /// Check settings that would make planning or assignment meaningless.
    pub fn validate(&self) -> Result<()> {
        match self.chunk_sizing {
            ChunkSizing::TargetRows(0) => {
                return Err(SplitError::config("chunk_sizing.target_rows must be > 0"))
            }
            ChunkSizing::ChunkCount(0) => {
                return Err(SplitError::config("chunk_sizing.chunk_count must be > 0"))
            }
            _ => {}
        }
        if self.samples_per_chunk == 0 || self.max_sample_size == 0 {
            return Err(SplitError::config("sample sizes must be > 0"));
        }
        if self.lease_timeout_ms == 0 {
            return Err(SplitError::config("lease_timeout_ms must be > 0"));
        }
        if self.reclaim_interval_ms == 0 {
            return Err(SplitError::config("reclaim_interval_ms must be > 0"));
        }
        for key in self.strategy_overrides.keys() {
            key.parse::<CollectionId>()?;
        }
        Ok(())
    }

    /// Strategy selection for a collection (override or default).
    pub fn strategy_for(&self, collection: &CollectionId) -> StrategySelection {
        self.strategy_overrides
            .get(&collection.to_string())
            .copied()
            .unwrap_or(self.strategy)
    }

    /// Sample size for a collection that wants `desired_chunks` chunks.
    pub fn sample_size(&self, desired_chunks: u32) -> usize {
        (desired_chunks as usize)
            .saturating_mul(self.samples_per_chunk)
            .min(self.max_sample_size)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    /// Bounded retry policy for planning calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.planning_retries,
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
        .with_jitter(DEFAULT_JITTER)
    }
}

/// Builder for SplitConfig.
#[derive(Default)]
pub struct SplitConfigBuilder {
    config: SplitConfig,
}

impl SplitConfigBuilder {
    pub fn target_chunk_rows(mut self, rows: u64) -> Self {
        self.config.chunk_sizing = ChunkSizing::TargetRows(rows.max(1));
        self
    }

    pub fn chunk_count(mut self, count: u32) -> Self {
        self.config.chunk_sizing = ChunkSizing::ChunkCount(count.max(1));
        self
    }

    pub fn strategy(mut self, strategy: StrategySelection) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Override the strategy for one collection.
    pub fn strategy_override(mut self, collection: &CollectionId, strategy: StrategySelection) -> Self {
        self.config
            .strategy_overrides
            .insert(collection.to_string(), strategy);
        self
    }

    pub fn samples_per_chunk(mut self, n: usize) -> Self {
        self.config.samples_per_chunk = n.max(1);
        self
    }

    pub fn max_sample_size(mut self, n: usize) -> Self {
        self.config.max_sample_size = n.max(1);
        self
    }

    pub fn lease_timeout(mut self, timeout: Duration) -> Self {
        self.config.lease_timeout_ms = (timeout.as_millis() as u64).max(1);
        self
    }

    pub fn reclaim_interval(mut self, interval: Duration) -> Self {
        self.config.reclaim_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }

    pub fn planning_concurrency(mut self, n: usize) -> Self {
        self.config.planning_concurrency = n.max(1);
        self
    }

    /// Retry settings for catalog/schema calls.
    pub fn planning_retries(mut self, retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.config.planning_retries = retries;
        self.config.retry_delay_ms = base_delay.as_millis() as u64;
        self.config.retry_max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    pub fn command_buffer(mut self, size: usize) -> Self {
        self.config.command_buffer = size.max(1);
        self
    }

    pub fn build(self) -> SplitConfig {
        self.config
    }
}
