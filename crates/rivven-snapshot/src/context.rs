//! Immutable description of one collection to be split.

use crate::catalog::{CollectionStats, ShardRange};
use crate::key::{KeySchema, KeyValue};
use crate::schema::{CollectionId, CollectionSchema, SchemaSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How large the chunks of one collection should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSizing {
    /// Target number of rows per chunk
    TargetRows(u64),
    /// Fixed number of chunks per collection
    ChunkCount(u32),
}

impl Default for ChunkSizing {
    fn default() -> Self {
        ChunkSizing::TargetRows(10_000)
    }
}

impl ChunkSizing {
    /// Number of chunks wanted for a collection of `estimated_rows` rows.
    ///
    /// Always at least 1; an unknown estimate yields 1 for `TargetRows`.
    pub fn desired_chunks(&self, estimated_rows: Option<u64>) -> u32 {
        match *self {
            ChunkSizing::ChunkCount(n) => n.max(1),
            ChunkSizing::TargetRows(target) => match estimated_rows {
                Some(rows) => {
                    let chunks = rows.div_ceil(target.max(1)).max(1);
                    u32::try_from(chunks).unwrap_or(u32::MAX)
                }
                None => 1,
            },
        }
    }
}

/// Everything a split strategy needs to partition one collection.
///
/// Built by the planner after statistics, samples and shard metadata have
/// been fetched, so strategies never perform I/O.
#[derive(Debug, Clone)]
pub struct SplitContext {
    pub collection_id: CollectionId,
    pub key_schema: KeySchema,
    pub stats: CollectionStats,
    pub chunk_sizing: ChunkSizing,
    /// Sampled key rows (unsorted); empty unless the strategy samples
    pub samples: Vec<Vec<KeyValue>>,
    /// Shard metadata; empty unless the collection is sharded
    pub shard_ranges: Vec<ShardRange>,
    /// Schema captured before split generation, attached to every split
    pub schema_snapshot: Arc<SchemaSnapshot>,
}

impl SplitContext {
    pub fn new(collection_id: CollectionId, key_schema: KeySchema, stats: CollectionStats) -> Self {
        Self {
            collection_id,
            key_schema,
            stats,
            chunk_sizing: ChunkSizing::default(),
            samples: Vec::new(),
            shard_ranges: Vec::new(),
            schema_snapshot: Arc::new(SchemaSnapshot::new()),
        }
    }

    pub fn with_chunk_sizing(mut self, sizing: ChunkSizing) -> Self {
        self.chunk_sizing = sizing;
        self
    }

    pub fn with_samples(mut self, samples: Vec<Vec<KeyValue>>) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_shard_ranges(mut self, shards: Vec<ShardRange>) -> Self {
        self.shard_ranges = shards;
        self
    }

    /// Attach the captured schema of this collection.
    pub fn with_schema(mut self, schema: CollectionSchema) -> Self {
        let mut snapshot = SchemaSnapshot::new();
        snapshot.insert(self.collection_id.clone(), schema);
        self.schema_snapshot = Arc::new(snapshot);
        self
    }

    /// Chunk count wanted for this collection.
    pub fn desired_chunks(&self) -> u32 {
        self.chunk_sizing.desired_chunks(self.stats.estimated_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyType;
    use crate::schema::FieldDefinition;

    #[test]
    fn test_desired_chunks() {
        let sizing = ChunkSizing::TargetRows(250);
        assert_eq!(sizing.desired_chunks(Some(1000)), 4);
        assert_eq!(sizing.desired_chunks(Some(1001)), 5);
        assert_eq!(sizing.desired_chunks(Some(0)), 1);
        assert_eq!(sizing.desired_chunks(None), 1);

        assert_eq!(ChunkSizing::ChunkCount(8).desired_chunks(None), 8);
        assert_eq!(ChunkSizing::ChunkCount(0).desired_chunks(Some(10)), 1);
    }

    #[test]
    fn test_context_attaches_schema() {
        let id = CollectionId::new("shop", "orders");
        let schema = CollectionSchema::new(id.clone(), vec![FieldDefinition::new("_id", "int64", 1).as_key()]);
        let ctx = SplitContext::new(
            id.clone(),
            KeySchema::single("_id", KeyType::Int),
            CollectionStats::with_rows(1000),
        )
        .with_chunk_sizing(ChunkSizing::TargetRows(250))
        .with_schema(schema);

        assert_eq!(ctx.desired_chunks(), 4);
        assert_eq!(ctx.schema_snapshot.len(), 1);
        assert!(ctx.schema_snapshot.contains_key(&id));
    }
}
