//! # Snapshot Splits
//!
//! A split is one bounded, half-open range `[lower_bound, upper_bound)` of a
//! collection's key domain, read as a single unit of snapshot work.
//!
//! ## Tiling
//!
//! The splits of one collection, ordered by `split_order`, must cover the whole
//! key domain with no gap and no overlap:
//!
//! ```text
//!  [MIN, k1) [k1, k2) [k2, k3) ... [kn, MAX)
//! ```
//!
//! [`validate_tiling`] checks this before a plan is handed to the assigner.

use crate::error::{Result, SplitError};
use crate::key::{KeyBound, KeySchema};
use crate::schema::{CollectionId, SchemaSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Deterministic split id for the `sequence`-th split of a collection.
pub fn split_id(collection: &CollectionId, sequence: u32) -> String {
    format!("{}:{}", collection, sequence)
}

/// The unit of assignable snapshot work.
///
/// Splits are immutable once created; assignment state lives in the assigner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSplit {
    pub collection_id: CollectionId,
    pub split_id: String,
    pub key_schema: KeySchema,
    /// Inclusive lower bound (`Min` for the first split)
    pub lower_bound: KeyBound,
    /// Exclusive upper bound (`Max` for the last split)
    pub upper_bound: KeyBound,
    /// Ordinal among the splits of the same collection
    pub split_order: Option<u32>,
    /// Schema of the collection as of split creation, shared by all its splits
    pub schema_snapshot: Arc<SchemaSnapshot>,
}

impl SnapshotSplit {
    pub fn new(
        collection_id: CollectionId,
        sequence: u32,
        key_schema: KeySchema,
        lower_bound: KeyBound,
        upper_bound: KeyBound,
        schema_snapshot: Arc<SchemaSnapshot>,
    ) -> Self {
        Self {
            split_id: split_id(&collection_id, sequence),
            collection_id,
            key_schema,
            lower_bound,
            upper_bound,
            split_order: Some(sequence),
            schema_snapshot,
        }
    }

    /// Ordering key used by the assigner's pending queue.
    pub fn order(&self) -> u32 {
        self.split_order.unwrap_or(0)
    }

    /// Check if a key falls inside `[lower_bound, upper_bound)`.
    pub fn contains(&self, key: &KeyBound) -> bool {
        *key >= self.lower_bound && *key < self.upper_bound
    }

    /// Check if this split covers the whole key domain.
    pub fn is_full_range(&self) -> bool {
        self.lower_bound.is_min() && self.upper_bound.is_max()
    }
}

/// Check that the splits of one collection tile its key domain.
///
/// Splits are examined in `split_order`. Rejects:
/// - an empty plan
/// - splits of another collection or with duplicate ids
/// - an empty or inverted range
/// - a first lower bound other than `Min` or a last upper bound other than `Max`
/// - any gap or overlap between consecutive splits
pub fn validate_tiling(collection: &CollectionId, splits: &[SnapshotSplit]) -> Result<()> {
    if splits.is_empty() {
        return Err(SplitError::invariant(collection, "strategy produced no splits"));
    }

    let mut ordered: Vec<&SnapshotSplit> = splits.iter().collect();
    ordered.sort_by_key(|s| s.order());

    let mut seen = std::collections::HashSet::with_capacity(splits.len());
    for split in &ordered {
        if split.collection_id != *collection {
            return Err(SplitError::invariant(
                collection,
                format!("split {} belongs to {}", split.split_id, split.collection_id),
            ));
        }
        if !seen.insert(split.split_id.as_str()) {
            return Err(SplitError::invariant(
                collection,
                format!("duplicate split id {}", split.split_id),
            ));
        }
        if split.lower_bound >= split.upper_bound {
            return Err(SplitError::invariant(
                collection,
                format!(
                    "split {} has empty range [{}, {})",
                    split.split_id, split.lower_bound, split.upper_bound
                ),
            ));
        }
    }

    let first = ordered[0];
    if !first.lower_bound.is_min() {
        return Err(SplitError::invariant(
            collection,
            format!("first split starts at {}, not MIN", first.lower_bound),
        ));
    }
    let last = ordered[ordered.len() - 1];
    if !last.upper_bound.is_max() {
        return Err(SplitError::invariant(
            collection,
            format!("last split ends at {}, not MAX", last.upper_bound),
        ));
    }

    for pair in ordered.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if prev.order() == next.order() {
            return Err(SplitError::invariant(
                collection,
                format!(
                    "splits {} and {} share order {}",
                    prev.split_id,
                    next.split_id,
                    prev.order()
                ),
            ));
        }
        if prev.upper_bound != next.lower_bound {
            let kind = if prev.upper_bound < next.lower_bound {
                "gap"
            } else {
                "overlap"
            };
            return Err(SplitError::invariant(
                collection,
                format!(
                    "{} between {} (ends {}) and {} (starts {})",
                    kind, prev.split_id, prev.upper_bound, next.split_id, next.lower_bound
                ),
            ));
        }
    }

    Ok(())
}
