//! # Snapshot Split Assigner
//!
//! Central state machine owning the lifecycle of every split across all
//! collections of a snapshot.
//!
//! ## Split States
//!
//! ```text
//!            request_next                report_finished
//!  PENDING ───────────────▶ ASSIGNED ───────────────────▶ FINISHED
//!     ▲                        │
//!     └────────────────────────┘
//!      lease expired / reader failed
//! ```
//!
//! ## Assigner Phases
//!
//! `Planning → Assigning → SnapshotDone`. Readers may already receive splits
//! of planned collections while other collections are still being planned.
//! Once every expected collection is planned (or failed), planning is closed
//! and every planned split is finished, the assigner enters `SnapshotDone`
//! and produces a single [`SnapshotCompleted`] signal.
//!
//! ## Duplicate Reads
//!
//! A lease reclaim does not stop the original reader. If that reader was only
//! slow, two readers may read the same range and both report completion; the
//! first report finishes the split and later ones are no-ops. The downstream
//! write path must overwrite by key for such duplicate reads to be harmless.
//!
//! The assigner is synchronous and not thread-safe by itself; wrap it in
//! [`AssignerActor`](crate::actor::AssignerActor) to serve concurrent readers.

use crate::checkpoint::{AssignerCheckpoint, SplitRecord, CHECKPOINT_VERSION};
use crate::config::SplitConfig;
use crate::error::{Result, SplitError};
use crate::key::KeyBound;
use crate::lease::{Lease, LeaseTracker};
use crate::metrics::SnapshotMetrics;
use crate::planner::CollectionPlan;
use crate::schema::CollectionId;
use crate::split::{validate_tiling, SnapshotSplit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Assignment state of one split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SplitState {
    Pending,
    Assigned {
        reader: String,
        lease_start: DateTime<Utc>,
    },
    Finished {
        /// Source log position reported with the completion
        position: Option<String>,
    },
}

impl SplitState {
    pub fn is_finished(&self) -> bool {
        matches!(self, SplitState::Finished { .. })
    }
}

/// Global phase of the assigner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignerPhase {
    #[default]
    Planning,
    Assigning,
    SnapshotDone,
}

/// Reply to a reader asking for work.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    /// Read this split
    Split(SnapshotSplit),
    /// Nothing pending right now; ask again later
    Wait,
    /// Snapshot is complete; the reader can stop
    Done,
}

impl Assignment {
    pub fn is_done(&self) -> bool {
        matches!(self, Assignment::Done)
    }

    pub fn into_split(self) -> Option<SnapshotSplit> {
        match self {
            Assignment::Split(split) => Some(split),
            _ => None,
        }
    }
}

/// Result of a completion report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The split transitioned to finished
    Finished,
    /// The split was already finished; the report was ignored
    AlreadyFinished,
    /// No split with this id is known; the report was ignored
    Unknown,
}

/// Resume watermark of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionWatermark {
    /// Upper bound of the last split read
    pub last_key: KeyBound,
    /// Source position reported with the last split in split order, or
    /// with the closest preceding split that reported one
    pub position: Option<String>,
    pub splits: usize,
}

/// One-time signal that the snapshot phase is over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCompleted {
    pub completed_at: DateTime<Utc>,
    pub watermarks: BTreeMap<CollectionId, CollectionWatermark>,
    /// Collections that could not be planned; not covered by the snapshot
    pub failed_collections: BTreeMap<CollectionId, String>,
}

/// Assignment counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignerStats {
    pub assigned: u64,
    pub finished: u64,
    pub duplicate_completions: u64,
    pub reclaimed: u64,
    pub unknown_reports: u64,
}

type PendingKey = (CollectionId, u32, String);

fn pending_key(split: &SnapshotSplit) -> PendingKey {
    (split.collection_id.clone(), split.order(), split.split_id.clone())
}

fn same_range(a: &SnapshotSplit, b: &SnapshotSplit) -> bool {
    a.lower_bound == b.lower_bound && a.upper_bound == b.upper_bound
}

/// Choose the split definitions to enqueue for a collection and the
/// checkpointed state of each.
///
/// A checkpointed state is only meaningful for the exact range it was
/// recorded for. Re-planning may draw a different sample, so when the
/// checkpoint holds a complete tiling its definitions win over the new plan.
/// Otherwise a checkpointed state is kept only where id and bounds both
/// match; every other split of the new plan is read again.
fn reconcile_with_checkpoint(
    collection: &CollectionId,
    planned: Vec<SnapshotSplit>,
    records: Option<&Vec<SplitRecord>>,
) -> (Vec<SnapshotSplit>, HashMap<String, SplitState>) {
    let records = match records {
        Some(records) if !records.is_empty() => records,
        _ => return (planned, HashMap::new()),
    };

    let checkpointed: Vec<SnapshotSplit> = records.iter().map(|r| r.split.clone()).collect();
    if validate_tiling(collection, &checkpointed).is_ok() {
        let unchanged = planned.len() == checkpointed.len()
            && planned.iter().all(|p| {
                checkpointed
                    .iter()
                    .any(|c| c.split_id == p.split_id && same_range(c, p))
            });
        if !unchanged {
            warn!(
                collection = %collection,
                checkpointed = checkpointed.len(),
                planned = planned.len(),
                "Re-planned bounds differ from checkpoint, keeping checkpointed splits"
            );
        }
        let states = records
            .iter()
            .map(|r| (r.split.split_id.clone(), r.state.clone()))
            .collect();
        return (checkpointed, states);
    }

    let mut states = HashMap::new();
    for record in records {
        let id = &record.split.split_id;
        match planned.iter().find(|p| p.split_id == *id) {
            Some(split) if same_range(split, &record.split) => {
                states.insert(id.clone(), record.state.clone());
            }
            Some(split) => {
                if record.state != SplitState::Pending {
                    warn!(
                        collection = %collection,
                        split_id = %id,
                        checkpointed = %format!("[{}, {})", record.split.lower_bound, record.split.upper_bound),
                        planned = %format!("[{}, {})", split.lower_bound, split.upper_bound),
                        "Split bounds changed since checkpoint, split will be read again"
                    );
                }
            }
            None => {
                warn!(
                    collection = %collection,
                    split_id = %id,
                    "Checkpointed split is not part of the new plan, dropping"
                );
            }
        }
    }
    (planned, states)
}

/// Split assignment state machine.
pub struct SnapshotSplitAssigner {
    phase: AssignerPhase,
    splits: HashMap<String, SnapshotSplit>,
    states: HashMap<String, SplitState>,
    pending: BTreeSet<PendingKey>,
    leases: LeaseTracker,
    expected: BTreeSet<CollectionId>,
    /// Split ids of each planned collection, in split order
    planned: BTreeMap<CollectionId, Vec<String>>,
    failed: BTreeMap<CollectionId, String>,
    /// Checkpointed states waiting for their collection's plan
    restored: HashMap<CollectionId, Vec<SplitRecord>>,
    planning_closed: bool,
    unfinished: usize,
    completion_emitted: bool,
    completion: Option<SnapshotCompleted>,
    stats: AssignerStats,
}

impl SnapshotSplitAssigner {
    /// Create an assigner expecting plans for `collections`.
    pub fn new(config: &SplitConfig, collections: impl IntoIterator<Item = CollectionId>) -> Self {
        Self {
            phase: AssignerPhase::Planning,
            splits: HashMap::new(),
            states: HashMap::new(),
            pending: BTreeSet::new(),
            leases: LeaseTracker::new(config.lease_timeout()),
            expected: collections.into_iter().collect(),
            planned: BTreeMap::new(),
            failed: BTreeMap::new(),
            restored: HashMap::new(),
            planning_closed: false,
            unfinished: 0,
            completion_emitted: false,
            completion: None,
            stats: AssignerStats::default(),
        }
    }

    // ------------------------------------------------------------------
    // Planning hooks
    // ------------------------------------------------------------------

    /// Enqueue the splits of a planned collection.
    ///
    /// The plan is re-checked for tiling; a collection can be planned once.
    pub fn add_plan(&mut self, plan: CollectionPlan) -> Result<()> {
        let id = plan.collection_id.clone();
        if self.planned.contains_key(&id) {
            return Err(SplitError::invalid_state(format!("Collection {} is already planned", id)));
        }
        if self.failed.contains_key(&id) {
            return Err(SplitError::invalid_state(format!(
                "Collection {} was marked as failed",
                id
            )));
        }
        if self.planning_closed && !self.expected.contains(&id) {
            return Err(SplitError::invalid_state(format!(
                "Planning is closed; unexpected collection {}",
                id
            )));
        }
        let (mut splits, mut restored) = reconcile_with_checkpoint(&id, plan.splits, self.restored.get(&id));
        validate_tiling(&id, &splits)?;
        if let Some(clash) = splits.iter().find(|s| self.splits.contains_key(&s.split_id)) {
            return Err(SplitError::invalid_state(format!(
                "Split id {} is already known",
                clash.split_id
            )));
        }
        self.restored.remove(&id);
        splits.sort_by_key(|s| s.order());

        let mut ids = Vec::with_capacity(splits.len());
        for split in splits {
            let state = restored.remove(&split.split_id).unwrap_or(SplitState::Pending);
            match &state {
                SplitState::Pending => {
                    self.pending.insert(pending_key(&split));
                }
                SplitState::Assigned {
                    reader,
                    lease_start,
                } => {
                    self.leases.insert(Lease {
                        split_id: split.split_id.clone(),
                        reader: reader.clone(),
                        lease_start: *lease_start,
                    });
                }
                SplitState::Finished { .. } => {}
            }
            if !state.is_finished() {
                self.unfinished += 1;
            }
            ids.push(split.split_id.clone());
            self.states.insert(split.split_id.clone(), state);
            self.splits.insert(split.split_id.clone(), split);
        }

        info!(
            collection = %id,
            strategy = %plan.strategy,
            splits = ids.len(),
            "Collection enqueued for assignment"
        );
        self.expected.insert(id.clone());
        self.planned.insert(id, ids);
        self.update_gauges();
        self.update_phase();
        Ok(())
    }

    /// Record that a collection could not be planned.
    ///
    /// The collection is excluded from the snapshot; others are unaffected.
    pub fn mark_planning_failed(&mut self, collection: CollectionId, reason: impl Into<String>) -> Result<()> {
        if self.planned.contains_key(&collection) {
            return Err(SplitError::invalid_state(format!(
                "Collection {} is already planned",
                collection
            )));
        }
        let reason = reason.into();
        warn!(collection = %collection, reason = %reason, "Collection excluded from snapshot");
        self.restored.remove(&collection);
        self.expected.insert(collection.clone());
        self.failed.insert(collection, reason);
        self.update_phase();
        Ok(())
    }

    /// Declare that no collections beyond the expected ones will be planned.
    pub fn close_planning(&mut self) {
        if !self.planning_closed {
            debug!(expected = self.expected.len(), "Planning closed");
        }
        self.planning_closed = true;
        self.update_phase();
    }

    // ------------------------------------------------------------------
    // Reader operations
    // ------------------------------------------------------------------

    /// Hand the next pending split to `reader`.
    ///
    /// Pending splits are served by smallest `(collection, split_order)`.
    /// Never blocks.
    pub fn request_next(&mut self, reader: &str, now: DateTime<Utc>) -> Assignment {
        if self.phase == AssignerPhase::SnapshotDone {
            return Assignment::Done;
        }

        while let Some((_, _, split_id)) = self.pending.pop_first() {
            let split = match self.splits.get(&split_id) {
                Some(split) => split.clone(),
                None => {
                    warn!(split_id = %split_id, "Pending split has no definition, skipping");
                    continue;
                }
            };

            let lease = self.leases.grant(reader, &split_id, now);
            self.states.insert(
                split_id.clone(),
                SplitState::Assigned {
                    reader: lease.reader,
                    lease_start: lease.lease_start,
                },
            );
            self.stats.assigned += 1;
            SnapshotMetrics::increment_splits_assigned();
            self.update_gauges();

            debug!(
                reader,
                split_id = %split_id,
                lower = %split.lower_bound,
                upper = %split.upper_bound,
                "Split assigned"
            );
            return Assignment::Split(split);
        }

        Assignment::Wait
    }

    /// Record that `reader` finished reading a split.
    ///
    /// Idempotent: a report for an already finished split is a no-op. A
    /// report for a split whose lease was reclaimed is still accepted (and
    /// removes the split from the pending queue if it was not reassigned).
    pub fn report_finished(&mut self, reader: &str, split_id: &str, position: Option<String>) -> FinishOutcome {
        let state = match self.states.get(split_id) {
            Some(state) => state.clone(),
            None => {
                self.stats.unknown_reports += 1;
                warn!(reader, split_id, "Completion reported for unknown split");
                return FinishOutcome::Unknown;
            }
        };

        match state {
            SplitState::Finished { .. } => {
                self.stats.duplicate_completions += 1;
                SnapshotMetrics::increment_duplicate_completions();
                debug!(reader, split_id, "Duplicate completion ignored");
                return FinishOutcome::AlreadyFinished;
            }
            SplitState::Assigned { reader: holder, .. } => {
                self.leases.release(split_id);
                if holder != reader {
                    warn!(
                        reader,
                        holder = %holder,
                        split_id,
                        "Split finished by a reader that no longer holds its lease"
                    );
                }
            }
            SplitState::Pending => {
                if let Some(split) = self.splits.get(split_id) {
                    self.pending.remove(&pending_key(split));
                }
                debug!(reader, split_id, "Reclaimed split finished before reassignment");
            }
        }

        self.states
            .insert(split_id.to_string(), SplitState::Finished { position });
        self.unfinished = self.unfinished.saturating_sub(1);
        self.stats.finished += 1;
        SnapshotMetrics::increment_splits_finished();
        self.update_gauges();
        debug!(reader, split_id, "Split finished");

        if let Some(collection) = self.splits.get(split_id).map(|s| s.collection_id.clone()) {
            if self.collection_finished(&collection) {
                info!(collection = %collection, "Collection snapshot finished");
            }
        }

        self.update_phase();
        FinishOutcome::Finished
    }

    /// Requeue every assigned split whose lease is older than the timeout.
    ///
    /// Returns the reclaimed split ids. The original reader is not notified.
    pub fn reclaim_expired_leases(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired = self.leases.expired(now);
        for split_id in &expired {
            if let Some(lease) = self.leases.release(split_id) {
                warn!(
                    split_id = %split_id,
                    reader = %lease.reader,
                    age_ms = lease.age(now).as_millis() as u64,
                    "Lease expired, split requeued"
                );
            }
            self.requeue(split_id);
        }
        self.record_reclaimed(expired.len());
        expired
    }

    /// Requeue every split leased by a reader known to have died.
    pub fn reader_failed(&mut self, reader: &str) -> Vec<String> {
        let mut reclaimed: Vec<String> = self
            .leases
            .release_reader(reader)
            .into_iter()
            .map(|lease| lease.split_id)
            .collect();
        reclaimed.sort();
        for split_id in &reclaimed {
            self.requeue(split_id);
        }
        if !reclaimed.is_empty() {
            warn!(reader, splits = reclaimed.len(), "Reader failed, splits requeued");
        }
        self.record_reclaimed(reclaimed.len());
        reclaimed
    }

    fn requeue(&mut self, split_id: &str) {
        if let Some(split) = self.splits.get(split_id) {
            self.pending.insert(pending_key(split));
            self.states.insert(split_id.to_string(), SplitState::Pending);
        }
    }

    fn record_reclaimed(&mut self, count: usize) {
        if count > 0 {
            self.stats.reclaimed += count as u64;
            SnapshotMetrics::add_splits_reclaimed(count as u64);
            self.update_gauges();
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Take the completion signal. Returns `Some` exactly once.
    pub fn take_completion(&mut self) -> Option<SnapshotCompleted> {
        self.completion.take()
    }

    fn planning_resolved(&self) -> bool {
        self.planning_closed
            && self
                .expected
                .iter()
                .all(|c| self.planned.contains_key(c) || self.failed.contains_key(c))
    }

    fn update_phase(&mut self) {
        if self.phase == AssignerPhase::SnapshotDone {
            return;
        }
        if !self.planning_resolved() {
            self.phase = AssignerPhase::Planning;
            return;
        }
        if self.unfinished > 0 {
            if self.phase != AssignerPhase::Assigning {
                info!(
                    collections = self.planned.len(),
                    failed = self.failed.len(),
                    splits = self.splits.len(),
                    "All collections planned"
                );
            }
            self.phase = AssignerPhase::Assigning;
            return;
        }

        self.phase = AssignerPhase::SnapshotDone;
        if !self.completion_emitted {
            self.completion_emitted = true;
            let completion = self.build_completion();
            info!(
                collections = completion.watermarks.len(),
                failed = completion.failed_collections.len(),
                "Snapshot complete"
            );
            self.completion = Some(completion);
        }
    }

    fn build_completion(&self) -> SnapshotCompleted {
        let watermarks = self
            .planned
            .iter()
            .map(|(collection, ids)| {
                let last_key = ids
                    .last()
                    .and_then(|id| self.splits.get(id))
                    .map(|s| s.upper_bound.clone())
                    .unwrap_or(KeyBound::Max);
                let position = ids.iter().rev().find_map(|id| match self.states.get(id) {
                    Some(SplitState::Finished { position }) => position.clone(),
                    _ => None,
                });
                (
                    collection.clone(),
                    CollectionWatermark {
                        last_key,
                        position,
                        splits: ids.len(),
                    },
                )
            })
            .collect();

        SnapshotCompleted {
            completed_at: Utc::now(),
            watermarks,
            failed_collections: self.failed.clone(),
        }
    }

    fn update_gauges(&self) {
        SnapshotMetrics::set_pending_splits(self.pending.len());
        SnapshotMetrics::set_active_leases(self.leases.len());
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn phase(&self) -> AssignerPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == AssignerPhase::SnapshotDone
    }

    pub fn stats(&self) -> AssignerStats {
        self.stats
    }

    pub fn split_state(&self, split_id: &str) -> Option<&SplitState> {
        self.states.get(split_id)
    }

    pub fn split(&self, split_id: &str) -> Option<&SnapshotSplit> {
        self.splits.get(split_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn assigned_count(&self) -> usize {
        self.leases.len()
    }

    pub fn finished_count(&self) -> usize {
        self.splits.len() - self.unfinished
    }

    pub fn total_splits(&self) -> usize {
        self.splits.len()
    }

    /// Split ids currently leased by a reader.
    pub fn leased_by(&self, reader: &str) -> Vec<String> {
        self.leases.held_by(reader)
    }

    pub fn failed_collections(&self) -> &BTreeMap<CollectionId, String> {
        &self.failed
    }

    /// Check if every split of a planned collection is finished.
    pub fn collection_finished(&self, collection: &CollectionId) -> bool {
        self.planned.get(collection).is_some_and(|ids| {
            ids.iter()
                .all(|id| self.states.get(id).is_some_and(SplitState::is_finished))
        })
    }

    // ------------------------------------------------------------------
    // Checkpointing
    // ------------------------------------------------------------------

    /// Capture the assigner's state.
    pub fn checkpoint(&self) -> AssignerCheckpoint {
        let mut splits: Vec<SplitRecord> = self
            .planned
            .values()
            .flatten()
            .filter_map(|id| {
                Some(SplitRecord {
                    split: self.splits.get(id)?.clone(),
                    state: self.states.get(id)?.clone(),
                })
            })
            .collect();
        // Keep records of collections not yet re-planned after a restore
        splits.extend(self.restored.values().flatten().cloned());
        splits.sort_by(|a, b| {
            (&a.split.collection_id, a.split.order(), &a.split.split_id).cmp(&(
                &b.split.collection_id,
                b.split.order(),
                &b.split.split_id,
            ))
        });

        AssignerCheckpoint {
            version: CHECKPOINT_VERSION,
            created_at: Utc::now(),
            phase: self.phase,
            expected_collections: self.expected.clone(),
            planned_collections: self.planned.keys().cloned().collect(),
            failed_collections: self.failed.clone(),
            splits,
            planning_closed: self.planning_closed,
            completion_emitted: self.completion_emitted,
            stats: self.stats,
        }
    }

    /// Rebuild an assigner from a checkpoint and re-run plans.
    ///
    /// For a collection the checkpoint fully covers, the checkpointed split
    /// definitions replace the re-run plan, so recorded progress always
    /// refers to the ranges that were actually read. Otherwise a checkpointed
    /// state carries over only to a split with the same id and bounds, and
    /// the rest of the new plan starts out pending. Checkpointed leases are
    /// kept and expire through the normal timeout. Collections of the
    /// checkpoint without a plan here can be added later with
    /// [`add_plan`](Self::add_plan).
    pub fn restore(config: &SplitConfig, checkpoint: AssignerCheckpoint, plans: Vec<CollectionPlan>) -> Result<Self> {
        checkpoint.validate()?;

        let mut assigner = Self::new(config, checkpoint.expected_collections);
        assigner.failed = checkpoint.failed_collections;
        assigner.planning_closed = checkpoint.planning_closed;
        assigner.completion_emitted = checkpoint.completion_emitted;
        assigner.stats = checkpoint.stats;
        for record in checkpoint.splits {
            assigner
                .restored
                .entry(record.split.collection_id.clone())
                .or_default()
                .push(record);
        }

        for plan in plans {
            if assigner.failed.remove(&plan.collection_id).is_some() {
                info!(collection = %plan.collection_id, "Previously failed collection re-planned");
            }
            assigner.add_plan(plan)?;
        }
        assigner.update_phase();

        info!(
            phase = ?assigner.phase,
            splits = assigner.total_splits(),
            finished = assigner.finished_count(),
            assigned = assigner.assigned_count(),
            pending = assigner.pending_count(),
            "Assigner restored from checkpoint"
        );
        Ok(assigner)
    }
}
