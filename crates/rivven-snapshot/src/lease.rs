//! Reader lease bookkeeping.
//!
//! A lease records which reader holds an assigned split and since when.
//! Leases older than the configured timeout are reclaimed by the assigner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Time-bounded claim of a reader on one split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub split_id: String,
    pub reader: String,
    pub lease_start: DateTime<Utc>,
}

impl Lease {
    /// Age of the lease at `now` (zero if `now` precedes the start).
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.lease_start).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Tracks leases by split and by reader.
#[derive(Debug, Clone)]
pub struct LeaseTracker {
    timeout: Duration,
    by_split: HashMap<String, Lease>,
    by_reader: HashMap<String, BTreeSet<String>>,
}

impl LeaseTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            by_split: HashMap::new(),
            by_reader: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a lease, replacing any previous lease on the same split.
    pub fn grant(&mut self, reader: &str, split_id: &str, now: DateTime<Utc>) -> Lease {
        self.release(split_id);
        let lease = Lease {
            split_id: split_id.to_string(),
            reader: reader.to_string(),
            lease_start: now,
        };
        self.insert(lease.clone());
        lease
    }

    /// Re-insert a lease as-is (used when restoring from a checkpoint).
    pub fn insert(&mut self, lease: Lease) {
        self.by_reader
            .entry(lease.reader.clone())
            .or_default()
            .insert(lease.split_id.clone());
        self.by_split.insert(lease.split_id.clone(), lease);
    }

    /// Remove the lease on a split.
    pub fn release(&mut self, split_id: &str) -> Option<Lease> {
        let lease = self.by_split.remove(split_id)?;
        if let Some(held) = self.by_reader.get_mut(&lease.reader) {
            held.remove(split_id);
            if held.is_empty() {
                self.by_reader.remove(&lease.reader);
            }
        }
        Some(lease)
    }

    /// Remove every lease held by a reader.
    pub fn release_reader(&mut self, reader: &str) -> Vec<Lease> {
        let held = self.by_reader.remove(reader).unwrap_or_default();
        held.iter()
            .filter_map(|split_id| self.by_split.remove(split_id))
            .collect()
    }

    pub fn get(&self, split_id: &str) -> Option<&Lease> {
        self.by_split.get(split_id)
    }

    /// Split ids currently leased by a reader.
    pub fn held_by(&self, reader: &str) -> Vec<String> {
        self.by_reader
            .get(reader)
            .map(|held| held.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check if a lease has outlived the timeout at `now`.
    pub fn is_expired(&self, lease: &Lease, now: DateTime<Utc>) -> bool {
        lease.age(now) > self.timeout
    }

    /// Split ids whose lease is expired at `now`, sorted.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired: Vec<String> = self
            .by_split
            .values()
            .filter(|lease| self.is_expired(lease, now))
            .map(|lease| lease.split_id.clone())
            .collect();
        expired.sort();
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lease> {
        self.by_split.values()
    }

    pub fn len(&self) -> usize {
        self.by_split.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_split.is_empty()
    }

    /// Number of distinct readers holding at least one lease.
    pub fn reader_count(&self) -> usize {
        self.by_reader.len()
    }
}
