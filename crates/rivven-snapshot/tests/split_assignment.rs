//! Split Assignment Integration Tests
//!
//! End-to-end tests of planning, assignment, lease reclaim, completion and
//! checkpoint recovery against in-memory sources.
//!
//! Run with: cargo test -p rivven-snapshot --test split_assignment

mod harness;

use chrono::{DateTime, TimeZone, Utc};
use harness::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rivven_snapshot::{
    validate_tiling, AssignerActor, AssignerPhase, Assignment, CheckpointStore, CollectionId,
    FieldDefinition, FileCheckpointStore, FinishOutcome, KeyBound, KeyValue, MemoryCatalog,
    MemorySchemaProvider, SnapshotPlanner, SnapshotSplitAssigner, SplitConfig, SplitStrategy,
    StrategySelection,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

// ============================================================================
// Scenario
// ============================================================================

mod scenario_tests {
    use super::*;

    /// orders with ids 1..=1000, 250 rows per chunk, exact sample; a reader
    /// crashes holding the first split and reports late after a reclaim.
    #[tokio::test]
    async fn test_orders_reclaim_and_late_completion() {
        init_test_logging();
        let config = exact_sample_config(250, Duration::from_secs(30));
        let (catalog, schemas) = int_source(&[(orders(), 1000)]).await;
        let planner = SnapshotPlanner::new(config.clone(), catalog, schemas);

        let plan = planner.plan_collection(&spec(orders())).await.unwrap();
        assert_eq!(plan.strategy, SplitStrategy::SampledRange);
        let bounds: Vec<_> = plan
            .splits
            .iter()
            .map(|s| (s.lower_bound.clone(), s.upper_bound.clone()))
            .collect();
        assert_eq!(
            bounds,
            vec![
                (KeyBound::Min, KeyBound::value(250)),
                (KeyBound::value(250), KeyBound::value(500)),
                (KeyBound::value(500), KeyBound::value(750)),
                (KeyBound::value(750), KeyBound::Max),
            ]
        );

        let mut assigner = SnapshotSplitAssigner::new(&config, vec![orders()]);
        assigner.add_plan(plan).unwrap();
        assigner.close_planning();

        // reader-1 takes split 1 and crashes
        let split_1 = assigner.request_next("reader-1", at(0)).into_split().unwrap();
        assert_eq!(split_1.split_order, Some(0));

        // Lease expires; split 1 is handed out again
        assert_eq!(assigner.reclaim_expired_leases(at(45)), vec![split_1.split_id.clone()]);
        let again = assigner.request_next("reader-2", at(46)).into_split().unwrap();
        assert_eq!(again.split_id, split_1.split_id);

        // Late report from reader-1 is accepted once; reader-2's is a no-op
        assert_eq!(
            assigner.report_finished("reader-1", &split_1.split_id, None),
            FinishOutcome::Finished
        );
        assert_eq!(
            assigner.report_finished("reader-2", &split_1.split_id, None),
            FinishOutcome::AlreadyFinished
        );
        assert_eq!(assigner.assigned_count(), 0);

        let stats = assigner.stats();
        assert_eq!(stats.assigned, 2);
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.duplicate_completions, 1);
    }
}

// ============================================================================
// Tiling Properties
// ============================================================================

mod tiling_tests {
    use super::*;

    /// Every key of a collection falls into exactly one planned split.
    #[tokio::test]
    async fn test_random_collections_tile_key_domain() {
        init_test_logging();
        let mut rng = StdRng::seed_from_u64(7);

        for round in 0..20 {
            let id = CollectionId::new("prop", format!("c{}", round));
            let rows: usize = rng.gen_range(1..2000);
            let cardinality: i64 = rng.gen_range(1..500);
            let keys: Vec<Vec<KeyValue>> = (0..rows)
                .map(|_| vec![KeyValue::Int(rng.gen_range(0..cardinality))])
                .collect();
            let target: u64 = rng.gen_range(1..400);

            let catalog = Arc::new(MemoryCatalog::new());
            catalog.insert_keys(id.clone(), keys.clone()).await;
            let schemas = Arc::new(MemorySchemaProvider::new());
            schemas
                .insert(id.clone(), vec![FieldDefinition::new("_id", "int64", 1).as_key()])
                .await;

            let config = SplitConfig::builder()
                .target_chunk_rows(target)
                .samples_per_chunk(rng.gen_range(1..20))
                .max_sample_size(500)
                .build();
            let planner = SnapshotPlanner::new(config.clone(), catalog, schemas);
            let plan = planner.plan_collection(&spec(id.clone())).await.unwrap();

            validate_tiling(&id, &plan.splits).unwrap();
            let desired = config.chunk_sizing.desired_chunks(Some(rows as u64)) as usize;
            assert!(plan.len() <= desired.max(1), "round {}: {} > {}", round, plan.len(), desired);

            for key in &keys {
                let bound = KeyBound::Key(key.clone());
                let holders = plan.splits.iter().filter(|s| s.contains(&bound)).count();
                assert_eq!(holders, 1, "round {}: key {:?} in {} splits", round, key, holders);
            }
        }
    }

    #[tokio::test]
    async fn test_single_planning_is_stable() {
        let config = SplitConfig::builder()
            .strategy(StrategySelection::Single)
            .build();
        let (catalog, schemas) = int_source(&[(orders(), 50)]).await;
        let planner = SnapshotPlanner::new(config, catalog, schemas);

        let a = planner.plan_collection(&spec(orders())).await.unwrap();
        let b = planner.plan_collection(&spec(orders())).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a.splits[0].split_id, b.splits[0].split_id);
        assert_eq!(a.splits[0].lower_bound, b.splits[0].lower_bound);
        assert_eq!(a.splits[0].upper_bound, b.splits[0].upper_bound);
    }
}

// ============================================================================
// Coordinator
// ============================================================================

mod coordinator_tests {
    use super::*;

    #[tokio::test]
    async fn test_parallel_snapshot_with_planning_failure() {
        init_test_logging();
        let customers = CollectionId::new("shop", "customers");
        let broken = CollectionId::new("shop", "broken");
        let config = exact_sample_config(100, Duration::from_secs(60));
        let (catalog, schemas) = int_source(&[(orders(), 1000), (customers.clone(), 350)]).await;
        catalog.insert_int_range(broken.clone(), 1..=10).await;

        let assigner = SnapshotSplitAssigner::new(
            &config,
            vec![orders(), customers.clone(), broken.clone()],
        );
        let (handle, task) = AssignerActor::spawn(assigner, &config);

        let readers: Vec<_> = (0..4)
            .map(|r| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    let reader = format!("reader-{}", r);
                    let mut read = Vec::new();
                    loop {
                        match handle.request_next(reader.as_str()).await.unwrap() {
                            Assignment::Split(split) => {
                                let position = format!("ts-{}", split.split_id);
                                handle
                                    .report_finished(reader.as_str(), split.split_id.as_str(), Some(position))
                                    .await
                                    .unwrap();
                                read.push(split.split_id);
                            }
                            Assignment::Wait => tokio::time::sleep(Duration::from_millis(1)).await,
                            Assignment::Done => break,
                        }
                    }
                    read
                })
            })
            .collect();

        let planner = SnapshotPlanner::new(config, catalog, schemas);
        let report = planner
            .plan_into(vec![spec(orders()), spec(customers.clone()), spec(broken.clone())], &handle)
            .await
            .unwrap();
        assert_eq!(report.planned.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].collection_id, broken);

        let mut read = Vec::new();
        for reader in readers {
            read.extend(reader.await.unwrap());
        }
        let unique: HashSet<_> = read.iter().cloned().collect();
        assert_eq!(unique.len(), read.len());
        assert_eq!(read.len(), report.total_splits());
        assert_eq!(read.len(), 10 + 4);

        let completion = handle.wait_for_completion().await.unwrap();
        assert_eq!(completion.watermarks.len(), 2);
        assert!(completion.failed_collections.contains_key(&broken));
        assert_eq!(
            completion.watermarks[&orders()].position.as_deref(),
            Some("ts-shop.orders:9")
        );

        assert_eq!(handle.phase().await.unwrap(), AssignerPhase::SnapshotDone);
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_from_file_checkpoint() {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let config = exact_sample_config(250, Duration::from_secs(60));
        let (catalog, schemas) = int_source(&[(orders(), 1000)]).await;
        let planner = SnapshotPlanner::new(config.clone(), catalog, schemas);

        // First run: finish two splits, then the coordinator goes away
        let store = Arc::new(FileCheckpointStore::new(dir.path()).await.unwrap());
        let assigner = SnapshotSplitAssigner::new(&config, vec![orders()]);
        let (handle, task) = AssignerActor::spawn_with_store(assigner, &config, store.clone());
        planner.plan_into(vec![spec(orders())], &handle).await.unwrap();

        let mut finished = Vec::new();
        for _ in 0..2 {
            let split = handle.request_next("reader-1").await.unwrap().into_split().unwrap();
            handle
                .report_finished("reader-1", split.split_id.as_str(), None)
                .await
                .unwrap();
            finished.push(split.split_id);
        }
        let held = handle.request_next("reader-1").await.unwrap().into_split().unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        // Second run: re-plan deterministically and restore
        let reopened = FileCheckpointStore::new(dir.path()).await.unwrap();
        let checkpoint = reopened.load().await.unwrap().unwrap();
        let report = planner.plan_all(vec![spec(orders())]).await;
        let mut restored = SnapshotSplitAssigner::restore(&config, checkpoint, report.planned).unwrap();

        assert_eq!(restored.finished_count(), 2);
        assert_eq!(restored.assigned_count(), 1);
        assert_eq!(restored.leased_by("reader-1"), vec![held.split_id.clone()]);

        let remaining = restored.request_next("reader-2", Utc::now()).into_split().unwrap();
        assert!(!finished.contains(&remaining.split_id));
        assert_ne!(remaining.split_id, held.split_id);

        for id in finished {
            assert_eq!(
                restored.report_finished("reader-2", &id, None),
                FinishOutcome::AlreadyFinished
            );
        }
    }

    /// Sampled planning is random, so re-planning after a restart may move
    /// boundaries under the same split ids. Every key must still be read.
    #[tokio::test]
    async fn test_restore_against_resampled_plan_reads_every_key() {
        init_test_logging();
        let rows = 20_000;
        let config = SplitConfig::builder()
            .target_chunk_rows(2_000)
            .lease_timeout(Duration::from_secs(30))
            .build();
        let (catalog, schemas) = int_source(&[(orders(), rows)]).await;
        let planner = SnapshotPlanner::new(config.clone(), catalog, schemas);

        let first_plan = planner.plan_collection(&spec(orders())).await.unwrap();
        assert_eq!(first_plan.strategy, SplitStrategy::SampledRange);
        let mut assigner = SnapshotSplitAssigner::new(&config, vec![orders()]);
        assigner.add_plan(first_plan.clone()).unwrap();
        assigner.close_planning();

        let mut read = Vec::new();
        for _ in 0..3 {
            let split = assigner.request_next("reader-1", at(0)).into_split().unwrap();
            assigner.report_finished("reader-1", &split.split_id, None);
            read.push(split);
        }
        // Crashes holding a fourth split
        assigner.request_next("reader-1", at(0)).into_split().unwrap();
        let checkpoint = assigner.checkpoint();

        let second_plan = planner.plan_collection(&spec(orders())).await.unwrap();
        let mut restored = SnapshotSplitAssigner::restore(&config, checkpoint, vec![second_plan]).unwrap();
        for split in &first_plan.splits {
            let kept = restored.split(&split.split_id).unwrap();
            assert_eq!(kept.lower_bound, split.lower_bound);
            assert_eq!(kept.upper_bound, split.upper_bound);
        }

        restored.reclaim_expired_leases(at(60));
        while let Some(split) = restored.request_next("reader-2", at(61)).into_split() {
            restored.report_finished("reader-2", &split.split_id, None);
            read.push(split);
        }
        assert!(restored.is_done());

        let missed = (1..=rows)
            .filter(|k| {
                let key = KeyBound::value(*k);
                !read.iter().any(|s| s.contains(&key))
            })
            .count();
        assert_eq!(missed, 0, "{} keys never read", missed);
    }
}
