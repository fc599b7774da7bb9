//! # Split Strategies
//!
//! Pure functions from a [`SplitContext`] to the ordered splits of one
//! collection.
//!
//! | Strategy | Description |
//! |----------|-------------|
//! | `Single` | One split covering `[MIN, MAX)` |
//! | `SampledRange` | Boundaries taken from a sorted random key sample |
//! | `ShardRange` | One split per existing source shard |
//!
//! The strategy is chosen once per collection at planning time from the
//! configured [`StrategySelection`]; there is no per-split dispatch.
//!
//! ```rust
//! use rivven_snapshot::{
//!     ChunkSizing, CollectionId, CollectionStats, KeySchema, KeyType, KeyValue,
//!     SplitContext, SplitStrategy,
//! };
//!
//! let ctx = SplitContext::new(
//!     CollectionId::new("shop", "orders"),
//!     KeySchema::single("_id", KeyType::Int),
//!     CollectionStats::with_rows(1000),
//! )
//! .with_chunk_sizing(ChunkSizing::TargetRows(250))
//! .with_samples((1..=1000).map(|v| vec![KeyValue::Int(v)]).collect());
//!
//! let splits = SplitStrategy::SampledRange.split(&ctx).unwrap();
//! assert_eq!(splits.len(), 4);
//! ```

use crate::catalog::CollectionStats;
use crate::context::{ChunkSizing, SplitContext};
use crate::error::{Result, SplitError};
use crate::key::{KeyBound, KeyValue};
use crate::split::SnapshotSplit;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Configured strategy choice for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategySelection {
    /// Pick from the collection's statistics (default)
    #[default]
    Auto,
    /// Never chunk
    Single,
    /// Always sample
    SampledRange,
    /// Follow source shards
    ShardRange,
}

impl StrategySelection {
    /// Parse a strategy selection from its string representation.
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "single" | "none" | "disabled" => Some(Self::Single),
            "sampled_range" | "sampled" | "sample" => Some(Self::SampledRange),
            "shard_range" | "sharded" | "shard" => Some(Self::ShardRange),
            _ => None,
        }
    }
}

/// Closed set of split strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    Single,
    SampledRange,
    ShardRange,
}

impl fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SplitStrategy {
    /// Resolve the configured selection against a collection's statistics.
    ///
    /// `Auto` picks Shard-Range for sharded collections, Single when the
    /// estimate is unknown or fits in one chunk, and Sampled-Range otherwise.
    pub fn select(selection: StrategySelection, stats: &CollectionStats, sizing: ChunkSizing) -> Self {
        match selection {
            StrategySelection::Single => SplitStrategy::Single,
            StrategySelection::SampledRange => SplitStrategy::SampledRange,
            StrategySelection::ShardRange => SplitStrategy::ShardRange,
            StrategySelection::Auto => {
                if stats.sharded {
                    SplitStrategy::ShardRange
                } else if stats.estimated_rows.is_none()
                    || sizing.desired_chunks(stats.estimated_rows) <= 1
                {
                    SplitStrategy::Single
                } else {
                    SplitStrategy::SampledRange
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SplitStrategy::Single => "single",
            SplitStrategy::SampledRange => "sampled_range",
            SplitStrategy::ShardRange => "shard_range",
        }
    }

    /// Check if the planner must fetch a key sample for this strategy.
    pub fn needs_sample(&self) -> bool {
        matches!(self, SplitStrategy::SampledRange)
    }

    /// Check if the planner must fetch shard metadata for this strategy.
    pub fn needs_shards(&self) -> bool {
        matches!(self, SplitStrategy::ShardRange)
    }

    /// Partition the collection described by `ctx`.
    ///
    /// Deterministic for a given context: the same context always yields
    /// the same bounds and split ids.
    pub fn split(&self, ctx: &SplitContext) -> Result<Vec<SnapshotSplit>> {
        match self {
            SplitStrategy::Single => Ok(single(ctx)),
            SplitStrategy::SampledRange => Ok(sampled_range(ctx)),
            SplitStrategy::ShardRange => shard_range(ctx),
        }
    }
}

fn single(ctx: &SplitContext) -> Vec<SnapshotSplit> {
    tile(ctx, Vec::new())
}

fn sampled_range(ctx: &SplitContext) -> Vec<SnapshotSplit> {
    let mut sample = ctx.samples.clone();
    sample.sort();
    tile(ctx, sample_boundaries(&sample, ctx.desired_chunks()))
}

/// Pick `desired - 1` boundary rows from a sorted sample.
///
/// Boundary `i` is the sample row at position `ceil(i * n / desired) - 1`.
/// Adjacent duplicates are collapsed, so a low-cardinality key yields fewer
/// splits than desired (a single value yields one). There is at most one
/// boundary per sample row: asking for more than `n + 1` chunks gives the
/// same boundaries as asking for `n + 1`.
pub fn sample_boundaries(sorted: &[Vec<KeyValue>], desired: u32) -> Vec<KeyBound> {
    let n = sorted.len() as u64;
    let desired = (desired as u64).min(n + 1);
    if n == 0 || desired <= 1 {
        return Vec::new();
    }

    let mut boundaries: Vec<KeyBound> = Vec::with_capacity(desired as usize - 1);
    for i in 1..desired {
        let position = (i * n).div_ceil(desired).max(1) - 1;
        let bound = KeyBound::Key(sorted[position as usize].clone());
        if boundaries.last() != Some(&bound) {
            boundaries.push(bound);
        }
    }
    boundaries
}

fn shard_range(ctx: &SplitContext) -> Result<Vec<SnapshotSplit>> {
    if ctx.shard_ranges.is_empty() {
        return Ok(single(ctx));
    }

    let mut shards = ctx.shard_ranges.clone();
    shards.sort_by(|a, b| a.lower.cmp(&b.lower));

    for pair in shards.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.upper != next.lower {
            let kind = if prev.upper < next.lower { "gap" } else { "overlap" };
            return Err(SplitError::invariant(
                &ctx.collection_id,
                format!(
                    "shard metadata has a {} between {} (ends {}) and {} (starts {})",
                    kind, prev.shard, prev.upper, next.shard, next.lower
                ),
            ));
        }
    }

    // Inner bounds come from the shards; the outer ends are opened up to the sentinels.
    let boundaries = shards[..shards.len() - 1]
        .iter()
        .map(|s| s.upper.clone())
        .collect();
    Ok(tile(ctx, boundaries))
}

/// Build contiguous splits `[MIN, b1) [b1, b2) ... [bn, MAX)`.
fn tile(ctx: &SplitContext, boundaries: Vec<KeyBound>) -> Vec<SnapshotSplit> {
    let mut lowers = Vec::with_capacity(boundaries.len() + 1);
    lowers.push(KeyBound::Min);
    lowers.extend(boundaries.iter().cloned());

    let mut uppers = boundaries;
    uppers.push(KeyBound::Max);

    lowers
        .into_iter()
        .zip(uppers)
        .enumerate()
        .map(|(seq, (lower, upper))| {
            SnapshotSplit::new(
                ctx.collection_id.clone(),
                seq as u32,
                ctx.key_schema.clone(),
                lower,
                upper,
                ctx.schema_snapshot.clone(),
            )
        })
        .collect()
}
