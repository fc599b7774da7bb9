//! Parallel snapshot demo
//!
//! Plans three in-memory collections, runs four readers against the
//! coordinator (one of which dies mid-split), and prints the completion
//! watermarks.
//!
//! Run with: RUST_LOG=rivven_snapshot=info cargo run -p rivven-snapshot --example parallel_snapshot

use rivven_snapshot::{
    AssignerActor, AssignerHandle, Assignment, CollectionId, CollectionSpec, FieldDefinition, KeyBound, KeySchema,
    KeyType, MemoryCatalog, MemorySchemaProvider, ShardRange, SnapshotPlanner,
    SnapshotSplitAssigner, SplitConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rivven_snapshot=info".parse()?),
        )
        .init();

    let orders = CollectionId::new("shop", "orders");
    let customers = CollectionId::new("shop", "customers");
    let events = CollectionId::new("analytics", "events");

    let catalog = Arc::new(MemoryCatalog::new());
    let schemas = Arc::new(MemorySchemaProvider::new());
    for id in [&orders, &customers, &events] {
        schemas
            .insert(
                id.clone(),
                vec![
                    FieldDefinition::new("_id", "int64", 1).as_key(),
                    FieldDefinition::new("doc", "document", 2),
                ],
            )
            .await;
    }
    catalog.insert_int_range(orders.clone(), 1..=20_000).await;
    catalog.insert_int_range(customers.clone(), 1..=800).await;
    catalog.insert_int_range(events.clone(), 1..=5_000).await;
    catalog
        .insert_shards(
            events.clone(),
            vec![
                ShardRange::new("shard-a", KeyBound::Min, KeyBound::value(2_500)),
                ShardRange::new("shard-b", KeyBound::value(2_500), KeyBound::Max),
            ],
        )
        .await;

    let config = SplitConfig::builder()
        .target_chunk_rows(2_000)
        .lease_timeout(Duration::from_millis(300))
        .reclaim_interval(Duration::from_millis(50))
        .build();

    let assigner = SnapshotSplitAssigner::new(&config, vec![orders.clone(), customers.clone(), events.clone()]);
    let (handle, task) = AssignerActor::spawn(assigner, &config);

    let readers: Vec<_> = (0..4)
        .map(|r| tokio::spawn(run_reader(handle.clone(), r)))
        .collect();

    let planner = SnapshotPlanner::new(config, catalog, schemas);
    let report = planner
        .plan_into(
            vec![
                CollectionSpec::new(orders, KeySchema::single("_id", KeyType::Int)),
                CollectionSpec::new(customers, KeySchema::single("_id", KeyType::Int)),
                CollectionSpec::new(events, KeySchema::single("_id", KeyType::Int)),
            ],
            &handle,
        )
        .await?;
    for plan in &report.planned {
        println!(
            "{:<20} strategy={:<14} splits={}",
            plan.collection_id.to_string(),
            plan.strategy.to_string(),
            plan.len()
        );
    }

    for (r, reader) in readers.into_iter().enumerate() {
        println!("reader-{} read {} splits", r, reader.await??);
    }

    let completion = handle.wait_for_completion().await?;
    for (collection, watermark) in &completion.watermarks {
        println!(
            "{:<20} last_key={} position={}",
            collection.to_string(),
            watermark.last_key,
            watermark.position.as_deref().unwrap_or("-")
        );
    }

    let stats = handle.stats().await?;
    println!(
        "assigned={} finished={} reclaimed={} duplicates={}",
        stats.assigned, stats.finished, stats.reclaimed, stats.duplicate_completions
    );

    handle.shutdown().await?;
    task.await?;
    Ok(())
}

async fn run_reader(handle: AssignerHandle, r: usize) -> rivven_snapshot::Result<usize> {
    let reader = format!("reader-{}", r);
    let mut read = 0;
    loop {
        match handle.request_next(reader.as_str()).await? {
            Assignment::Split(split) => {
                // reader-3 dies holding its first split; the lease expires
                if r == 3 {
                    info!(reader = %reader, split_id = %split.split_id, "Reader crashed");
                    return Ok(read);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                let position = format!("oplog-{}", split.split_id);
                handle
                    .report_finished(reader.as_str(), split.split_id, Some(position))
                    .await?;
                read += 1;
            }
            Assignment::Wait => tokio::time::sleep(Duration::from_millis(20)).await,
            Assignment::Done => return Ok(read),
        }
    }
}
