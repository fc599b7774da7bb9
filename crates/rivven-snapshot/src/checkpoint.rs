//! # Assigner Checkpoints
//!
//! Serializable assigner state, sufficient to resume a snapshot after a
//! coordinator restart together with a deterministic re-run of planning.
//!
//! | Store | Use Case |
//! |-------|----------|
//! | `MemoryCheckpointStore` | Tests, single process |
//! | `FileCheckpointStore` | Single-node production |
//!
//! Each record stores the full split definition next to its state. Sampled
//! planning is not reproducible, so a re-run plan may reuse split ids for
//! different ranges; restore trusts the recorded ranges, not the ids.
//!
//! ```rust,ignore
//! let store = FileCheckpointStore::new("/var/lib/rivven/snapshot").await?;
//! store.save(&assigner.checkpoint()).await?;
//!
//! // After a restart
//! if let Some(checkpoint) = store.load().await? {
//!     let report = planner.plan_all(specs).await;
//!     let assigner = SnapshotSplitAssigner::restore(&config, checkpoint, report.planned)?;
//! }
//! ```

use crate::assigner::{AssignerPhase, AssignerStats, SplitState};
use crate::error::{Result, SplitError};
use crate::schema::CollectionId;
use crate::split::SnapshotSplit;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 2;

/// A split as planned, with its assignment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRecord {
    pub split: SnapshotSplit,
    pub state: SplitState,
}

/// Snapshot of the assigner's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignerCheckpoint {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub phase: AssignerPhase,
    /// Collections the snapshot covers
    pub expected_collections: BTreeSet<CollectionId>,
    /// Collections with an accepted plan
    pub planned_collections: BTreeSet<CollectionId>,
    /// Collections whose planning failed, with the reason
    pub failed_collections: BTreeMap<CollectionId, String>,
    /// Per-split state, ordered by collection and split order
    pub splits: Vec<SplitRecord>,
    pub planning_closed: bool,
    pub completion_emitted: bool,
    pub stats: AssignerStats,
}

impl AssignerCheckpoint {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let checkpoint: Self = serde_json::from_str(json)?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    /// Reject checkpoints written by an incompatible format version.
    pub fn validate(&self) -> Result<()> {
        if self.version != CHECKPOINT_VERSION {
            return Err(SplitError::invalid_state(format!(
                "Unsupported checkpoint version {} (expected {})",
                self.version, CHECKPOINT_VERSION
            )));
        }
        Ok(())
    }

    pub fn finished_count(&self) -> usize {
        self.splits
            .iter()
            .filter(|r| matches!(r.state, SplitState::Finished { .. }))
            .count()
    }
}

/// Persistence for assigner checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Replace the stored checkpoint.
    async fn save(&self, checkpoint: &AssignerCheckpoint) -> Result<()>;

    /// Load the stored checkpoint, if any.
    async fn load(&self) -> Result<Option<AssignerCheckpoint>>;

    /// Remove the stored checkpoint (forces a fresh snapshot).
    async fn clear(&self) -> Result<()>;
}

/// In-memory checkpoint store for testing.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoint: RwLock<Option<AssignerCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &AssignerCheckpoint) -> Result<()> {
        *self.checkpoint.write().await = Some(checkpoint.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<AssignerCheckpoint>> {
        Ok(self.checkpoint.read().await.clone())
    }

    async fn clear(&self) -> Result<()> {
        *self.checkpoint.write().await = None;
        Ok(())
    }
}

/// File-based checkpoint store.
///
/// Persists the checkpoint as pretty JSON:
/// ```text
/// dir/
///   snapshot-assigner.json
/// ```
///
/// Writes go to a temp file that is then renamed over the checkpoint.
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store in `dir`, creating the directory if needed.
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await.map_err(|e| {
            SplitError::config(format!("Failed to create checkpoint directory: {}", e))
        })?;
        Ok(Self {
            path: dir.join("snapshot-assigner.json"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &AssignerCheckpoint) -> Result<()> {
        let content = checkpoint.to_json()?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.path).await?;

        debug!(
            path = %self.path.display(),
            splits = checkpoint.splits.len(),
            finished = checkpoint.finished_count(),
            "Saved assigner checkpoint"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<AssignerCheckpoint>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(AssignerCheckpoint::from_json(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Cleared assigner checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyBound, KeySchema, KeyType};
    use crate::schema::SchemaSnapshot;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn split(collection: &CollectionId, seq: u32, lower: KeyBound, upper: KeyBound) -> SnapshotSplit {
        SnapshotSplit::new(
            collection.clone(),
            seq,
            KeySchema::single("_id", KeyType::Int),
            lower,
            upper,
            Arc::new(SchemaSnapshot::new()),
        )
    }

    fn sample() -> AssignerCheckpoint {
        let orders = CollectionId::new("shop", "orders");
        let started = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        AssignerCheckpoint {
            version: CHECKPOINT_VERSION,
            created_at: started,
            phase: AssignerPhase::Assigning,
            expected_collections: [orders.clone()].into_iter().collect(),
            planned_collections: [orders.clone()].into_iter().collect(),
            failed_collections: [(CollectionId::new("shop", "users"), "schema unavailable".to_string())]
                .into_iter()
                .collect(),
            splits: vec![
                SplitRecord {
                    split: split(&orders, 0, KeyBound::Min, KeyBound::value(500)),
                    state: SplitState::Finished {
                        position: Some("ts:42".into()),
                    },
                },
                SplitRecord {
                    split: split(&orders, 1, KeyBound::value(500), KeyBound::Max),
                    state: SplitState::Assigned {
                        reader: "reader-1".into(),
                        lease_start: started,
                    },
                },
            ],
            planning_closed: true,
            completion_emitted: false,
            stats: AssignerStats::default(),
        }
    }

    #[test]
    fn test_checkpoint_json() {
        let checkpoint = sample();
        let json = checkpoint.to_json().unwrap();
        assert!(json.contains("\"shop.orders\""));
        assert!(json.contains("lower_bound"));

        let back = AssignerCheckpoint::from_json(&json).unwrap();
        assert_eq!(back, checkpoint);
        assert_eq!(back.finished_count(), 1);
    }

    #[test]
    fn test_checkpoint_rejects_unknown_version() {
        let mut checkpoint = sample();
        checkpoint.version = 99;
        let json = serde_json::to_string(&checkpoint).unwrap();
        assert!(AssignerCheckpoint::from_json(&json).is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load().await.unwrap().is_none());

        store.save(&sample()).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().splits.len(), 2);

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        store.save(&sample()).await.unwrap();
        assert!(!store.path().with_extension("json.tmp").exists());

        let reopened = FileCheckpointStore::new(dir.path()).await.unwrap();
        let loaded = reopened.load().await.unwrap().unwrap();
        assert_eq!(loaded, sample());

        reopened.clear().await.unwrap();
        reopened.clear().await.unwrap();
        assert!(reopened.load().await.unwrap().is_none());
    }
}
