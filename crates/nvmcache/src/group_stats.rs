//! Per-file-group traffic counters and region eviction scoring.
//!
//! Groups bucket file numbers coarsely (see [`FileNum::group`]); the
//! counters feed capacity planning output and, together with per-region
//! access tracking, the eviction score. Nothing here is persisted: after
//! recovery the counters rebuild from traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use nvmcache_types::{FileNum, GroupId};
use parking_lot::RwLock;

use crate::region::RegionRuntime;

/// Which direction a recorded transfer went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOp {
    /// Payload read back out of the cache.
    Read,
    /// Payload written into the cache.
    Write,
}

#[derive(Debug, Default)]
struct GroupCounters {
    referenced_bytes: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
}

/// Fleet-wide group statistics and the logical clock regions are aged by.
///
/// Shared by every shard; all updates are per-field atomics behind a map
/// that only takes its write lock when a new group first appears.
#[derive(Debug, Default)]
pub struct GroupStats {
    tick: AtomicU64,
    groups: RwLock<HashMap<GroupId, GroupCounters>>,
}

impl GroupStats {
    /// Create empty statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the logical clock.
    ///
    /// Every cache read and write burns one tick; region age is measured in
    /// ticks since last access.
    pub fn tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record `bytes` of traffic for the group owning `file_num`.
    pub fn record(&self, file_num: FileNum, op: GroupOp, bytes: u64) {
        let group = file_num.group();
        {
            let groups = self.groups.read();
            if let Some(counters) = groups.get(&group) {
                Self::bump(counters, op, bytes);
                return;
            }
        }
        let mut groups = self.groups.write();
        let counters = groups.entry(group).or_default();
        Self::bump(counters, op, bytes);
    }

    fn bump(counters: &GroupCounters, op: GroupOp, bytes: u64) {
        counters.referenced_bytes.fetch_add(bytes, Ordering::Relaxed);
        match op {
            GroupOp::Read => counters.read_bytes.fetch_add(bytes, Ordering::Relaxed),
            GroupOp::Write => counters.write_bytes.fetch_add(bytes, Ordering::Relaxed),
        };
    }

    /// Eviction score for a region: its referenced bytes decayed by age.
    ///
    /// Monotone in referenced bytes, antitone in age; regions that were
    /// never read since (re)filling score lowest and go first.
    #[must_use]
    pub fn score_region(&self, rt: &RegionRuntime) -> f64 {
        let now = self.tick.load(Ordering::Relaxed);
        let age = now.saturating_sub(rt.last_access.load(Ordering::Relaxed));
        let referenced = rt.referenced_bytes.load(Ordering::Relaxed);
        referenced as f64 / (age as f64 + 1.0)
    }

    /// Human-readable summary against a capacity, for the facade's
    /// `Display` output.
    #[must_use]
    pub fn summary(&self, capacity_bytes: u64) -> String {
        let groups = self.groups.read();
        let mut referenced = 0u64;
        let mut read = 0u64;
        let mut written = 0u64;
        for counters in groups.values() {
            referenced += counters.referenced_bytes.load(Ordering::Relaxed);
            read += counters.read_bytes.load(Ordering::Relaxed);
            written += counters.write_bytes.load(Ordering::Relaxed);
        }
        format!(
            "{} file groups, referenced {}MB read {}MB written {}MB over {}GB capacity",
            groups.len(),
            referenced >> 20,
            read >> 20,
            written >> 20,
            capacity_bytes >> 30,
        )
    }
}
