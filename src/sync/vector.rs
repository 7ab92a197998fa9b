//! Version-vector kernel.
//!
//! Per-device logical clocks providing causal ordering across the sync
//! mesh. All operations are total and pure — no I/O, no failure modes.
//!
//! The reserved key `_inactive` holds the summed counters of compacted
//! devices. It is bookkeeping: excluded from comparison entirely (it
//! must not induce false dominance), merged by max, and write-only
//! additive — its value only ever grows.

use crate::config::CompactionConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Reserved vector key for compacted device history.
pub const INACTIVE_KEY: &str = "_inactive";

/// Outcome of comparing two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrdering {
    /// Every coordinate of `a` ≥ `b`, at least one strictly greater.
    ADominates,
    /// Every coordinate of `b` ≥ `a`, at least one strictly greater.
    BDominates,
    /// Neither side dominates; a merge is required.
    Concurrent,
    /// Coordinate-wise identical.
    Equal,
}

/// Map from device-id to that device's per-node write counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    pub clocks: HashMap<String, u64>,
}

impl VersionVector {
    /// Get the clock value for a device. Missing entries read as zero.
    pub fn get(&self, device_id: &str) -> u64 {
        self.clocks.get(device_id).copied().unwrap_or(0)
    }

    /// Increment the clock for the given device. Unknown devices start at 1.
    pub fn increment(&mut self, device_id: &str) {
        let counter = self.clocks.entry(device_id.to_string()).or_insert(0);
        *counter += 1;
    }

    /// Compare against another vector over the union of device ids.
    ///
    /// `_inactive` is excluded: it sums absorbed history on each side
    /// independently and would otherwise fake dominance.
    pub fn compare(&self, other: &VersionVector) -> VectorOrdering {
        let mut a_greater = false;
        let mut b_greater = false;

        let devices: HashSet<&String> = self
            .clocks
            .keys()
            .chain(other.clocks.keys())
            .filter(|k| k.as_str() != INACTIVE_KEY)
            .collect();

        for device in devices {
            let a = self.get(device);
            let b = other.get(device);
            if a > b {
                a_greater = true;
            }
            if b > a {
                b_greater = true;
            }
        }

        match (a_greater, b_greater) {
            (false, false) => VectorOrdering::Equal,
            (true, true) => VectorOrdering::Concurrent,
            (true, false) => VectorOrdering::ADominates,
            (false, true) => VectorOrdering::BDominates,
        }
    }

    /// True if `self` is causally after `other`.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        self.compare(other) == VectorOrdering::ADominates
    }

    /// True if neither side dominates.
    pub fn is_concurrent_with(&self, other: &VersionVector) -> bool {
        self.compare(other) == VectorOrdering::Concurrent
    }

    /// Merge another vector (component-wise maximum).
    ///
    /// `_inactive` merges by max as well: each side's value is a lower
    /// bound on the absorbed history.
    pub fn merge(&mut self, other: &VersionVector) {
        for (device, clock) in &other.clocks {
            let current = self.clocks.entry(device.clone()).or_insert(0);
            *current = (*current).max(*clock);
        }
    }

    /// Merged copy of two vectors.
    pub fn merged(&self, other: &VersionVector) -> VersionVector {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Number of live device entries (excluding `_inactive`).
    pub fn active_len(&self) -> usize {
        self.clocks
            .keys()
            .filter(|k| k.as_str() != INACTIVE_KEY)
            .count()
    }

    /// Fold long-inactive devices into `_inactive`.
    ///
    /// A no-op while the active entry count is at or below the
    /// threshold. Above it, any device whose `last_active` is older
    /// than the configured window has its counter added to `_inactive`
    /// and its key removed. Devices with no known activity record are
    /// kept — inactivity cannot be proven for them. Re-running with
    /// the same input produces the same result.
    pub fn compact(
        &self,
        last_active: &HashMap<String, DateTime<Utc>>,
        config: &CompactionConfig,
        now: DateTime<Utc>,
    ) -> VersionVector {
        if self.active_len() <= config.threshold {
            return self.clone();
        }

        let cutoff = now - Duration::days(i64::from(config.inactive_days));
        let mut clocks = HashMap::new();
        let mut folded: u64 = self.get(INACTIVE_KEY);

        for (device, &clock) in &self.clocks {
            if device == INACTIVE_KEY {
                continue;
            }
            match last_active.get(device) {
                Some(&seen) if seen < cutoff => {
                    folded = folded.saturating_add(clock);
                    tracing::debug!(device = %device, clock, "Vector compaction folded device");
                }
                _ => {
                    clocks.insert(device.clone(), clock);
                }
            }
        }

        if folded > 0 {
            clocks.insert(INACTIVE_KEY.to_string(), folded);
        }

        VersionVector { clocks }
    }
}
