//! Source catalog collaborator: statistics, key samples and shard metadata.

use crate::error::{Result, SplitError};
use crate::key::{KeyBound, KeySchema, KeyValue};
use crate::schema::CollectionId;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Statistics snapshot of a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    /// Estimated row/document count (None if the source does not expose it)
    pub estimated_rows: Option<u64>,
    /// Estimated storage size in bytes
    pub size_bytes: Option<u64>,
    /// Collection is horizontally partitioned by the source
    pub sharded: bool,
}

impl CollectionStats {
    pub fn with_rows(rows: u64) -> Self {
        Self {
            estimated_rows: Some(rows),
            ..Default::default()
        }
    }

    pub fn sharded(mut self) -> Self {
        self.sharded = true;
        self
    }
}

/// One existing shard/chunk range from the source's partition catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    /// Shard name that owns the range
    pub shard: String,
    /// Inclusive lower bound
    pub lower: KeyBound,
    /// Exclusive upper bound
    pub upper: KeyBound,
}

impl ShardRange {
    pub fn new(shard: impl Into<String>, lower: KeyBound, upper: KeyBound) -> Self {
        Self {
            shard: shard.into(),
            lower,
            upper,
        }
    }
}

/// Trait for the source catalog consulted during planning.
///
/// Every call may block on I/O to the source; the planner retries
/// transient failures.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Fetch collection statistics.
    async fn collection_stats(&self, collection: &CollectionId) -> Result<CollectionStats>;

    /// Draw a random sample of at most `sample_size` key rows.
    async fn sample_keys(
        &self,
        collection: &CollectionId,
        key_schema: &KeySchema,
        sample_size: usize,
    ) -> Result<Vec<Vec<KeyValue>>>;

    /// Read existing shard boundaries (empty if the collection is not sharded).
    async fn shard_ranges(&self, collection: &CollectionId) -> Result<Vec<ShardRange>>;
}

#[derive(Debug, Clone, Default)]
struct MemoryCollection {
    keys: Vec<Vec<KeyValue>>,
    shards: Vec<ShardRange>,
    stats_unavailable: bool,
}

/// In-memory catalog for testing.
///
/// Sampling returns every key when the requested sample covers the
/// collection, and a uniform random subset otherwise.
#[derive(Default)]
pub struct MemoryCatalog {
    collections: RwLock<HashMap<CollectionId, MemoryCollection>>,
    failures: RwLock<HashMap<CollectionId, (u32, String)>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collection with its key rows.
    pub async fn insert_keys(&self, collection: CollectionId, keys: Vec<Vec<KeyValue>>) {
        self.collections
            .write()
            .await
            .entry(collection)
            .or_default()
            .keys = keys;
    }

    /// Register a collection keyed by a single integer field over `range`.
    pub async fn insert_int_range(&self, collection: CollectionId, range: std::ops::RangeInclusive<i64>) {
        let keys = range.map(|v| vec![KeyValue::Int(v)]).collect();
        self.insert_keys(collection, keys).await;
    }

    /// Register shard metadata (marks the collection as sharded).
    pub async fn insert_shards(&self, collection: CollectionId, shards: Vec<ShardRange>) {
        self.collections
            .write()
            .await
            .entry(collection)
            .or_default()
            .shards = shards;
    }

    /// Make statistics unavailable for a collection (estimate becomes unknown).
    pub async fn hide_stats(&self, collection: CollectionId) {
        self.collections
            .write()
            .await
            .entry(collection)
            .or_default()
            .stats_unavailable = true;
    }

    /// Fail the next `times` catalog calls for a collection.
    pub async fn fail_next(&self, collection: CollectionId, times: u32, message: impl Into<String>) {
        self.failures
            .write()
            .await
            .insert(collection, (times, message.into()));
    }

    async fn check_failure(&self, collection: &CollectionId) -> Result<()> {
        if let Some((remaining, message)) = self.failures.write().await.get_mut(collection) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SplitError::catalog(message.clone()));
            }
        }
        Ok(())
    }

    async fn get(&self, collection: &CollectionId) -> Result<MemoryCollection> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .ok_or_else(|| SplitError::catalog(format!("Collection {} not found", collection)))
    }
}

#[async_trait]
impl SourceCatalog for MemoryCatalog {
    async fn collection_stats(&self, collection: &CollectionId) -> Result<CollectionStats> {
        self.check_failure(collection).await?;
        let entry = self.get(collection).await?;
        Ok(CollectionStats {
            estimated_rows: (!entry.stats_unavailable).then_some(entry.keys.len() as u64),
            size_bytes: None,
            sharded: !entry.shards.is_empty(),
        })
    }

    async fn sample_keys(
        &self,
        collection: &CollectionId,
        key_schema: &KeySchema,
        sample_size: usize,
    ) -> Result<Vec<Vec<KeyValue>>> {
        self.check_failure(collection).await?;
        let entry = self.get(collection).await?;

        if let Some(bad) = entry.keys.iter().find(|row| !key_schema.accepts(row)) {
            return Err(SplitError::catalog(format!(
                "Key row {:?} of {} does not match key schema {:?}",
                bad,
                collection,
                key_schema.field_names()
            )));
        }

        if sample_size >= entry.keys.len() {
            return Ok(entry.keys);
        }

        let mut rng = rand::thread_rng();
        Ok(entry
            .keys
            .choose_multiple(&mut rng, sample_size)
            .cloned()
            .collect())
    }

    async fn shard_ranges(&self, collection: &CollectionId) -> Result<Vec<ShardRange>> {
        self.check_failure(collection).await?;
        Ok(self.get(collection).await?.shards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyType;

    #[tokio::test]
    async fn test_memory_catalog_stats_and_sample() {
        let catalog = MemoryCatalog::new();
        let id = CollectionId::new("shop", "orders");
        catalog.insert_int_range(id.clone(), 1..=1000).await;

        let stats = catalog.collection_stats(&id).await.unwrap();
        assert_eq!(stats.estimated_rows, Some(1000));
        assert!(!stats.sharded);

        let key_schema = KeySchema::single("_id", KeyType::Int);
        let sample = catalog.sample_keys(&id, &key_schema, 40).await.unwrap();
        assert_eq!(sample.len(), 40);

        let full = catalog.sample_keys(&id, &key_schema, 5000).await.unwrap();
        assert_eq!(full.len(), 1000);
    }

    #[tokio::test]
    async fn test_memory_catalog_rejects_mismatched_keys() {
        let catalog = MemoryCatalog::new();
        let id = CollectionId::new("shop", "orders");
        catalog.insert_int_range(id.clone(), 1..=10).await;

        let key_schema = KeySchema::single("sku", KeyType::String);
        assert!(catalog.sample_keys(&id, &key_schema, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_catalog_hidden_stats() {
        let catalog = MemoryCatalog::new();
        let id = CollectionId::new("shop", "orders");
        catalog.insert_int_range(id.clone(), 1..=10).await;
        catalog.hide_stats(id.clone()).await;

        let stats = catalog.collection_stats(&id).await.unwrap();
        assert_eq!(stats.estimated_rows, None);
    }

    #[tokio::test]
    async fn test_memory_catalog_injected_failure() {
        let catalog = MemoryCatalog::new();
        let id = CollectionId::new("shop", "orders");
        catalog.insert_int_range(id.clone(), 1..=10).await;
        catalog.fail_next(id.clone(), 2, "temporarily unavailable").await;

        assert!(catalog.collection_stats(&id).await.is_err());
        assert!(catalog.shard_ranges(&id).await.is_err());
        assert!(catalog.shard_ranges(&id).await.unwrap().is_empty());
    }
}
