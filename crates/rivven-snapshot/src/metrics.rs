//! Metrics for snapshot planning and split assignment.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding process installs a recorder.

/// Planning and assignment metrics.
pub struct SnapshotMetrics;

impl SnapshotMetrics {
    // ---- Planning ----

    /// Collection planned, labelled by strategy
    pub fn increment_collections_planned(strategy: &str) {
        metrics::counter!("rivven_snapshot_collections_planned_total", "strategy" => strategy.to_string())
            .increment(1);
    }

    /// Collection whose planning failed
    pub fn increment_planning_failures() {
        metrics::counter!("rivven_snapshot_planning_failures_total").increment(1);
    }

    /// Splits produced by planning
    pub fn add_splits_planned(count: u64) {
        metrics::counter!("rivven_snapshot_splits_planned_total").increment(count);
    }

    /// Planning duration of one collection
    pub fn record_planning_duration(seconds: f64) {
        metrics::histogram!("rivven_snapshot_planning_duration_seconds").record(seconds);
    }

    // ---- Assignment ----

    pub fn increment_splits_assigned() {
        metrics::counter!("rivven_snapshot_splits_assigned_total").increment(1);
    }

    pub fn increment_splits_finished() {
        metrics::counter!("rivven_snapshot_splits_finished_total").increment(1);
    }

    /// Completion report for an already finished split
    pub fn increment_duplicate_completions() {
        metrics::counter!("rivven_snapshot_duplicate_completions_total").increment(1);
    }

    /// Splits requeued after lease expiry or reader failure
    pub fn add_splits_reclaimed(count: u64) {
        metrics::counter!("rivven_snapshot_splits_reclaimed_total").increment(count);
    }

    // ---- Gauges ----

    pub fn set_pending_splits(count: usize) {
        metrics::gauge!("rivven_snapshot_pending_splits").set(count as f64);
    }

    pub fn set_active_leases(count: usize) {
        metrics::gauge!("rivven_snapshot_active_leases").set(count as f64);
    }
}
