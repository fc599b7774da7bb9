//! Test harness for snapshot split integration tests
//!
//! Provides in-memory source fixtures and logging setup.

use rivven_snapshot::{
    CollectionId, CollectionSpec, FieldDefinition, KeySchema, KeyType, MemoryCatalog,
    MemorySchemaProvider, SplitConfig,
};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_snapshot=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn orders() -> CollectionId {
    CollectionId::new("shop", "orders")
}

pub fn int_key() -> KeySchema {
    KeySchema::single("_id", KeyType::Int)
}

pub fn spec(collection: CollectionId) -> CollectionSpec {
    CollectionSpec::new(collection, int_key())
}

/// Planning config whose samples cover collections of up to 10k rows.
pub fn exact_sample_config(target_rows: u64, lease: Duration) -> SplitConfig {
    SplitConfig::builder()
        .target_chunk_rows(target_rows)
        .samples_per_chunk(10_000)
        .max_sample_size(10_000)
        .lease_timeout(lease)
        .reclaim_interval(Duration::from_millis(10))
        .planning_retries(3, Duration::from_millis(1), Duration::from_millis(5))
        .build()
}

/// Source with integer-keyed collections over `1..=rows`.
pub async fn int_source(
    collections: &[(CollectionId, i64)],
) -> (Arc<MemoryCatalog>, Arc<MemorySchemaProvider>) {
    let catalog = Arc::new(MemoryCatalog::new());
    let schemas = Arc::new(MemorySchemaProvider::new());
    for (id, rows) in collections {
        catalog.insert_int_range(id.clone(), 1..=*rows).await;
        schemas
            .insert(
                id.clone(),
                vec![
                    FieldDefinition::new("_id", "int64", 1).as_key(),
                    FieldDefinition::new("total", "decimal", 2),
                ],
            )
            .await;
    }
    (catalog, schemas)
}
