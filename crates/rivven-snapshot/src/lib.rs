//! # rivven-snapshot - Parallel Snapshot Splits for Rivven CDC
//!
//! Divides bounded collections into disjoint key-range chunks ("splits"),
//! hands each chunk to one parallel reader, tracks completion, recovers work
//! from failed readers and signals when the snapshot phase is over so the
//! source can switch to tailing its change log.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │SourceCatalog │   │SchemaProvider│
//! └──────┬───────┘   └──────┬───────┘
//!        │ stats / samples  │ schema (once per collection)
//!        ▼                  ▼
//! ┌──────────────────────────────────┐
//! │ SnapshotPlanner                  │
//! │  SplitContext → SplitStrategy    │
//! │  (Single | SampledRange |        │
//! │   ShardRange) → validate_tiling  │
//! └────────────────┬─────────────────┘
//!                  │ CollectionPlan
//!                  ▼
//! ┌──────────────────────────────────┐      ┌──────────────────┐
//! │ AssignerActor                    │─────▶│ SnapshotCompleted│──▶ streaming phase
//! │  SnapshotSplitAssigner           │      │ (watermarks)     │
//! │  + LeaseTracker                  │      └──────────────────┘
//! └────────────────┬─────────────────┘
//!                  ▲ request_next / report_finished
//!        ┌─────────┼─────────┐
//!     reader-1  reader-2  reader-N
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example(
//! #     catalog: std::sync::Arc<dyn rivven_snapshot::SourceCatalog>,
//! #     schemas: std::sync::Arc<dyn rivven_snapshot::SchemaProvider>,
//! # ) -> rivven_snapshot::Result<()> {
//! use rivven_snapshot::{
//!     AssignerActor, Assignment, CollectionId, CollectionSpec, KeySchema, KeyType,
//!     SnapshotPlanner, SnapshotSplitAssigner, SplitConfig,
//! };
//!
//! let config = SplitConfig::builder().target_chunk_rows(50_000).build();
//! let orders = CollectionId::new("shop", "orders");
//!
//! let assigner = SnapshotSplitAssigner::new(&config, vec![orders.clone()]);
//! let (handle, _task) = AssignerActor::spawn(assigner, &config);
//!
//! let planner = SnapshotPlanner::new(config, catalog, schemas);
//! let specs = vec![CollectionSpec::new(orders, KeySchema::single("_id", KeyType::Int))];
//! planner.plan_into(specs, &handle).await?;
//!
//! loop {
//!     match handle.request_next("reader-1").await? {
//!         Assignment::Split(split) => {
//!             // read [split.lower_bound, split.upper_bound) ...
//!             handle.report_finished("reader-1", split.split_id, None).await?;
//!         }
//!         Assignment::Wait => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
//!         Assignment::Done => break,
//!     }
//! }
//!
//! let completion = handle.wait_for_completion().await?;
//! # let _ = completion;
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! Splits, keys, the planner and the assigner with its coordinator.
//!
//! ### Tier 2: Collaborators and Persistence (crate root)
//! Catalog/schema traits with in-memory implementations, checkpoint stores.
//!
//! ### Tier 3: Building Blocks (modules)
//! Strategy helpers, lease tracking and metrics via their modules.

pub mod actor;
pub mod assigner;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod key;
pub mod lease;
pub mod metrics;
pub mod planner;
pub mod resilience;
pub mod schema;
pub mod split;
pub mod strategy;

// =============================================================================
// TIER 1: Core Types
// =============================================================================

pub use error::{ErrorCategory, Result, SplitError};

pub use key::{KeyBound, KeyField, KeySchema, KeyType, KeyValue};
pub use split::{split_id, validate_tiling, SnapshotSplit};

pub use context::{ChunkSizing, SplitContext};
pub use strategy::{SplitStrategy, StrategySelection};

pub use planner::{CollectionPlan, CollectionSpec, PlanningFailure, PlanningReport, SnapshotPlanner};

pub use actor::{AssignerActor, AssignerHandle};
pub use assigner::{
    AssignerPhase, AssignerStats, Assignment, CollectionWatermark, FinishOutcome,
    SnapshotCompleted, SnapshotSplitAssigner, SplitState,
};

pub use config::{SplitConfig, SplitConfigBuilder};
pub use resilience::RetryPolicy;

// =============================================================================
// TIER 2: Collaborators and Persistence
// =============================================================================

pub use catalog::{CollectionStats, MemoryCatalog, ShardRange, SourceCatalog};
pub use schema::{
    CollectionId, CollectionSchema, FieldDefinition, MemorySchemaProvider, SchemaProvider,
    SchemaSnapshot,
};

pub use checkpoint::{
    AssignerCheckpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};

// =============================================================================
// TIER 3: Building Blocks - available via modules
// =============================================================================
//   - strategy::sample_boundaries
//   - lease::{Lease, LeaseTracker}
//   - resilience::retry_with_backoff
//   - checkpoint::{SplitRecord, CHECKPOINT_VERSION}
//   - metrics::SnapshotMetrics
