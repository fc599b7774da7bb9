//! # Snapshot Planning
//!
//! Turns the list of collections to snapshot into validated split plans.
//!
//! For each collection the planner:
//!
//! 1. fetches statistics and resolves the split strategy
//! 2. fetches a key sample or shard metadata if the strategy needs one
//! 3. captures the collection schema once, right before split generation
//! 4. runs the strategy and checks that the result tiles the key domain
//!
//! Catalog and schema calls are retried with backoff. Collections are
//! planned concurrently and independently: a failure is reported for its
//! collection only and never aborts sibling collections.

use crate::actor::AssignerHandle;
use crate::catalog::SourceCatalog;
use crate::config::SplitConfig;
use crate::context::SplitContext;
use crate::error::{Result, SplitError};
use crate::key::KeySchema;
use crate::metrics::SnapshotMetrics;
use crate::resilience::{retry_with_backoff, RetryPolicy};
use crate::schema::{CollectionId, SchemaProvider};
use crate::split::{validate_tiling, SnapshotSplit};
use crate::strategy::SplitStrategy;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A collection to be snapshotted and its shard key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub collection_id: CollectionId,
    pub key_schema: KeySchema,
}

impl CollectionSpec {
    pub fn new(collection_id: CollectionId, key_schema: KeySchema) -> Self {
        Self {
            collection_id,
            key_schema,
        }
    }
}

/// Validated splits of one collection.
#[derive(Debug, Clone)]
pub struct CollectionPlan {
    pub collection_id: CollectionId,
    pub strategy: SplitStrategy,
    pub estimated_rows: Option<u64>,
    /// Splits in `split_order`
    pub splits: Vec<SnapshotSplit>,
}

impl CollectionPlan {
    /// Build a plan from strategy output, rejecting anything that does not tile.
    pub fn new(
        collection_id: CollectionId,
        strategy: SplitStrategy,
        estimated_rows: Option<u64>,
        mut splits: Vec<SnapshotSplit>,
    ) -> Result<Self> {
        validate_tiling(&collection_id, &splits)?;
        splits.sort_by_key(|s| s.order());
        Ok(Self {
            collection_id,
            strategy,
            estimated_rows,
            splits,
        })
    }

    pub fn len(&self) -> usize {
        self.splits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }
}

/// A collection whose planning failed.
#[derive(Debug)]
pub struct PlanningFailure {
    pub collection_id: CollectionId,
    pub error: SplitError,
}

impl PlanningFailure {
    pub fn reason(&self) -> String {
        self.error.to_string()
    }
}

/// Outcome of planning a set of collections.
#[derive(Debug, Default)]
pub struct PlanningReport {
    pub planned: Vec<CollectionPlan>,
    pub failed: Vec<PlanningFailure>,
}

impl PlanningReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total_splits(&self) -> usize {
        self.planned.iter().map(|p| p.len()).sum()
    }

    pub fn plan(&self, collection: &CollectionId) -> Option<&CollectionPlan> {
        self.planned.iter().find(|p| &p.collection_id == collection)
    }

    pub fn failure(&self, collection: &CollectionId) -> Option<&PlanningFailure> {
        self.failed.iter().find(|f| &f.collection_id == collection)
    }
}

/// Plans snapshot splits against a source catalog and schema provider.
pub struct SnapshotPlanner {
    config: SplitConfig,
    retry: RetryPolicy,
    catalog: Arc<dyn SourceCatalog>,
    schemas: Arc<dyn SchemaProvider>,
}

impl SnapshotPlanner {
    pub fn new(
        config: SplitConfig,
        catalog: Arc<dyn SourceCatalog>,
        schemas: Arc<dyn SchemaProvider>,
    ) -> Self {
        let retry = config.retry_policy();
        Self {
            config,
            retry,
            catalog,
            schemas,
        }
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// Plan one collection.
    pub async fn plan_collection(&self, spec: &CollectionSpec) -> Result<CollectionPlan> {
        let started = Instant::now();
        let id = &spec.collection_id;

        if spec.key_schema.is_empty() {
            return Err(SplitError::config(format!("Collection {} has no shard key", id)));
        }

        let stats = retry_with_backoff(&self.retry, id, "collection_stats", || {
            self.catalog.collection_stats(id)
        })
        .await?;

        let sizing = self.config.chunk_sizing;
        let strategy = SplitStrategy::select(self.config.strategy_for(id), &stats, sizing);
        let mut ctx = SplitContext::new(id.clone(), spec.key_schema.clone(), stats)
            .with_chunk_sizing(sizing);

        if strategy.needs_sample() {
            let sample_size = self.config.sample_size(ctx.desired_chunks());
            let samples = retry_with_backoff(&self.retry, id, "sample_keys", || {
                self.catalog.sample_keys(id, &spec.key_schema, sample_size)
            })
            .await?;
            if let Some(bad) = samples.iter().find(|row| !spec.key_schema.accepts(row)) {
                return Err(SplitError::catalog(format!(
                    "Sampled key {:?} of {} does not match key schema {:?}",
                    bad,
                    id,
                    spec.key_schema.field_names()
                )));
            }
            debug!(
                collection = %id,
                requested = sample_size,
                sampled = samples.len(),
                "Sampled shard keys"
            );
            ctx = ctx.with_samples(samples);
        }

        if strategy.needs_shards() {
            let shards = retry_with_backoff(&self.retry, id, "shard_ranges", || {
                self.catalog.shard_ranges(id)
            })
            .await?;
            if shards.is_empty() {
                warn!(collection = %id, "No shard metadata, falling back to a single split");
            }
            ctx = ctx.with_shard_ranges(shards);
        }

        let schema = retry_with_backoff(&self.retry, id, "capture_schema", || {
            self.schemas.capture_schema(id)
        })
        .await?;
        for field in spec.key_schema.fields() {
            if !schema.fields.is_empty() && schema.field(&field.name).is_none() {
                return Err(SplitError::schema(format!(
                    "Shard key field '{}' not found in schema of {}",
                    field.name, id
                )));
            }
        }
        let estimated_rows = ctx.stats.estimated_rows;
        let ctx = ctx.with_schema(schema);

        let splits = strategy.split(&ctx)?;
        let plan = CollectionPlan::new(id.clone(), strategy, estimated_rows, splits)?;

        SnapshotMetrics::increment_collections_planned(strategy.as_str());
        SnapshotMetrics::add_splits_planned(plan.len() as u64);
        SnapshotMetrics::record_planning_duration(started.elapsed().as_secs_f64());
        info!(
            collection = %id,
            strategy = %strategy,
            splits = plan.len(),
            estimated_rows = ?estimated_rows,
            "Collection planned"
        );

        Ok(plan)
    }

    async fn plan_or_fail(&self, spec: CollectionSpec) -> std::result::Result<CollectionPlan, PlanningFailure> {
        self.plan_collection(&spec).await.map_err(|error| {
            SnapshotMetrics::increment_planning_failures();
            warn!(
                collection = %spec.collection_id,
                error = %error,
                "Collection planning failed"
            );
            PlanningFailure {
                collection_id: spec.collection_id,
                error,
            }
        })
    }

    /// Plan all collections concurrently (up to `planning_concurrency`).
    pub async fn plan_all(&self, specs: Vec<CollectionSpec>) -> PlanningReport {
        let results: Vec<_> = stream::iter(specs)
            .map(|spec| self.plan_or_fail(spec))
            .buffer_unordered(self.config.planning_concurrency.max(1))
            .collect()
            .await;

        let mut report = PlanningReport::default();
        for result in results {
            match result {
                Ok(plan) => report.planned.push(plan),
                Err(failure) => report.failed.push(failure),
            }
        }
        report.planned.sort_by(|a, b| a.collection_id.cmp(&b.collection_id));
        report.failed.sort_by(|a, b| a.collection_id.cmp(&b.collection_id));

        info!(
            planned = report.planned.len(),
            failed = report.failed.len(),
            splits = report.total_splits(),
            "Snapshot planning finished"
        );
        report
    }

    /// Plan all collections, feeding each result to the coordinator as soon
    /// as it is ready, then close planning.
    ///
    /// Readers can start on early collections while later ones are still
    /// being planned.
    pub async fn plan_into(&self, specs: Vec<CollectionSpec>, handle: &AssignerHandle) -> Result<PlanningReport> {
        let mut results = stream::iter(specs)
            .map(|spec| self.plan_or_fail(spec))
            .buffer_unordered(self.config.planning_concurrency.max(1));

        let mut report = PlanningReport::default();
        while let Some(result) = results.next().await {
            match result {
                Ok(plan) => {
                    handle.add_plan(plan.clone()).await?;
                    report.planned.push(plan);
                }
                Err(failure) => {
                    handle
                        .mark_planning_failed(failure.collection_id.clone(), failure.reason())
                        .await?;
                    report.failed.push(failure);
                }
            }
        }
        handle.close_planning().await?;

        info!(
            planned = report.planned.len(),
            failed = report.failed.len(),
            splits = report.total_splits(),
            "Snapshot planning finished"
        );
        Ok(report)
    }
}
