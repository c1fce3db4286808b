//! Region state and the per-shard region allocator.
//!
//! A shard file is divided into `max_regions` equal slices. Regions are the
//! unit of allocation and eviction: payloads append to the single Writing
//! region until it fills, full regions serve reads until evicted, and
//! eviction recycles a region wholesale (no physical truncation; the byte
//! range simply becomes reusable).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use nvmcache_types::RegionId;

use crate::group_stats::GroupStats;

/// Lifecycle of a region.
///
/// ```text
/// Empty -> Writing -> Full -> Evicting -> Empty
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// No live data; available for promotion to Writing.
    Empty,
    /// Receiving appends from the shard's writer.
    Writing,
    /// Closed to appends; serving reads.
    Full,
    /// Being drained of index entries; transient within eviction.
    Evicting,
}

/// Allocator-side view of one region, guarded by the shard lock.
#[derive(Debug)]
pub struct Region {
    state: RegionState,
    /// Bytes appended so far (the append cursor).
    used: u64,
}

impl Region {
    fn new() -> Self {
        Self {
            state: RegionState::Empty,
            used: 0,
        }
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> RegionState {
        self.state
    }

    /// Bytes appended so far.
    #[inline]
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }
}

/// Lock-free per-region access tracking.
///
/// Lives outside the shard lock so readers can hold a region pinned across
/// a positional read without re-entering the lock, and so scoring can read
/// access history without blocking writers.
#[derive(Debug, Default)]
pub struct RegionRuntime {
    /// Readers currently copying bytes out of this region. A non-zero count
    /// blocks eviction.
    pub readers: AtomicU32,
    /// Logical-clock tick of the last hit or fill.
    pub last_access: AtomicU64,
    /// Bytes referenced (written or read back) since the region was last
    /// recycled.
    pub referenced_bytes: AtomicU64,
}

impl RegionRuntime {
    fn reset(&self) {
        self.readers.store(0, Ordering::Relaxed);
        self.last_access.store(0, Ordering::Relaxed);
        self.referenced_bytes.store(0, Ordering::Relaxed);
    }

    /// Record an access of `bytes` at logical time `tick`.
    pub fn touch(&self, tick: u64, bytes: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
        self.referenced_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Fixed-size region table plus the append cursor of the one Writing region.
#[derive(Debug)]
pub struct RegionAllocator {
    region_size: u64,
    regions: Vec<Region>,
    writing: Option<RegionId>,
}

impl RegionAllocator {
    /// Create an allocator with `max_regions` empty regions of `region_size`
    /// bytes each.
    #[must_use]
    pub fn new(region_size: u64, max_regions: u32) -> Self {
        Self {
            region_size,
            regions: (0..max_regions).map(|_| Region::new()).collect(),
            writing: None,
        }
    }

    /// Region size in bytes.
    #[inline]
    #[must_use]
    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    /// Number of regions in the table.
    #[inline]
    #[must_use]
    pub fn num_regions(&self) -> u32 {
        self.regions.len() as u32
    }

    /// Borrow a region record.
    #[must_use]
    pub fn region(&self, id: RegionId) -> &Region {
        &self.regions[id as usize]
    }

    /// All region records, in index order.
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// The current Writing region, promoting the lowest-index Empty region
    /// if none is open. Returns `None` when every region is Full (the caller
    /// evicts and retries).
    pub fn open_for_write(&mut self) -> Option<RegionId> {
        if let Some(id) = self.writing {
            return Some(id);
        }
        let id = self
            .regions
            .iter()
            .position(|r| r.state == RegionState::Empty)? as RegionId;
        let region = &mut self.regions[id as usize];
        debug_assert_eq!(region.used, 0);
        region.state = RegionState::Writing;
        self.writing = Some(id);
        Some(id)
    }

    /// Reserve `n` bytes at the append cursor of `id`.
    ///
    /// Returns the offset within the region, or `None` if the region cannot
    /// hold `n` more bytes (the caller closes it and opens a fresh one).
    pub fn append(&mut self, id: RegionId, n: u64) -> Option<u32> {
        let region = &mut self.regions[id as usize];
        debug_assert_eq!(region.state, RegionState::Writing);
        if region.used + n > self.region_size {
            return None;
        }
        let offset = region.used;
        region.used += n;
        Some(offset as u32)
    }

    /// Close the Writing region: Writing -> Full.
    pub fn close_writer(&mut self, id: RegionId) {
        let region = &mut self.regions[id as usize];
        debug_assert_eq!(region.state, RegionState::Writing);
        region.state = RegionState::Full;
        if self.writing == Some(id) {
            self.writing = None;
        }
    }

    /// Pick the eviction victim: the Full region with the lowest score,
    /// ties broken by the oldest last-access tick, then the lowest index.
    /// Regions with outstanding readers and regions in `exclude` are not
    /// candidates. The victim transitions Full -> Evicting; the caller
    /// drains the index and then calls [`RegionAllocator::finish_evict`].
    pub fn begin_evict(
        &mut self,
        rt: &[RegionRuntime],
        stats: &GroupStats,
        exclude: &HashSet<RegionId>,
    ) -> Option<RegionId> {
        let mut victim: Option<(RegionId, f64, u64)> = None;
        for (i, region) in self.regions.iter().enumerate() {
            let id = i as RegionId;
            if region.state != RegionState::Full || exclude.contains(&id) {
                continue;
            }
            if rt[i].readers.load(Ordering::Acquire) > 0 {
                continue;
            }
            let score = stats.score_region(&rt[i]);
            let last_access = rt[i].last_access.load(Ordering::Relaxed);
            let better = match victim {
                None => true,
                Some((_, best_score, best_access)) => {
                    match score.total_cmp(&best_score) {
                        std::cmp::Ordering::Less => true,
                        std::cmp::Ordering::Greater => false,
                        std::cmp::Ordering::Equal => last_access < best_access,
                    }
                }
            };
            if better {
                victim = Some((id, score, last_access));
            }
        }
        let (id, _, _) = victim?;
        self.regions[id as usize].state = RegionState::Evicting;
        Some(id)
    }

    /// Complete an eviction started by [`RegionAllocator::begin_evict`]:
    /// Evicting -> Empty with the cursor rewound.
    pub fn finish_evict(&mut self, id: RegionId, rt: &RegionRuntime) {
        let region = &mut self.regions[id as usize];
        debug_assert_eq!(region.state, RegionState::Evicting);
        region.state = RegionState::Empty;
        region.used = 0;
        rt.reset();
    }

    /// Restore a region from a checkpoint record.
    pub fn restore_full(&mut self, id: RegionId, used: u64) {
        let region = &mut self.regions[id as usize];
        debug_assert_eq!(region.state, RegionState::Empty);
        region.state = RegionState::Full;
        region.used = used;
    }

    /// Reset every region to Empty. Caller guarantees no writer is active.
    pub fn clear(&mut self, rt: &[RegionRuntime]) {
        for (region, runtime) in self.regions.iter_mut().zip(rt) {
            region.state = RegionState::Empty;
            region.used = 0;
            runtime.reset();
        }
        self.writing = None;
    }

    /// Sum of `used` over Full regions: the shard's cached-byte gauge.
    #[must_use]
    pub fn bytes_cached(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.state == RegionState::Full)
            .map(|r| r.used)
            .sum()
    }

    /// Number of Full regions.
    #[must_use]
    pub fn regions_cached(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.state == RegionState::Full)
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtimes(n: usize) -> Vec<RegionRuntime> {
        (0..n).map(|_| RegionRuntime::default()).collect()
    }

    #[test]
    fn promotes_lowest_empty_region() {
        let mut alloc = RegionAllocator::new(1024, 4);
        assert_eq!(alloc.open_for_write(), Some(0));
        // Idempotent while a writer is open.
        assert_eq!(alloc.open_for_write(), Some(0));
        alloc.close_writer(0);
        assert_eq!(alloc.open_for_write(), Some(1));
    }

    #[test]
    fn append_reserves_until_full() {
        let mut alloc = RegionAllocator::new(1024, 2);
        let id = alloc.open_for_write().unwrap();
        assert_eq!(alloc.append(id, 1000), Some(0));
        assert_eq!(alloc.append(id, 24), Some(1000));
        // Exactly full: the next append must open a new region.
        assert_eq!(alloc.append(id, 1), None);
        assert_eq!(alloc.region(id).used(), 1024);
    }

    #[test]
    fn evicts_lowest_scoring_region() {
        let stats = GroupStats::new();
        let rt = runtimes(3);
        let mut alloc = RegionAllocator::new(1024, 3);
        for id in 0..2u32 {
            let got = alloc.open_for_write().unwrap();
            assert_eq!(got, id);
            alloc.append(got, 1024).unwrap();
            alloc.close_writer(got);
        }
        // Region 1 is hot, region 0 cold.
        rt[1].touch(stats.tick(), 4096);

        let victim = alloc
            .begin_evict(&rt, &stats, &HashSet::new())
            .expect("a full region is evictable");
        assert_eq!(victim, 0);
        assert_eq!(alloc.region(0).state(), RegionState::Evicting);
        alloc.finish_evict(0, &rt[0]);
        assert_eq!(alloc.region(0).state(), RegionState::Empty);
        assert_eq!(alloc.region(0).used(), 0);
    }

    #[test]
    fn readers_block_eviction() {
        let stats = GroupStats::new();
        let rt = runtimes(1);
        let mut alloc = RegionAllocator::new(64, 1);
        let id = alloc.open_for_write().unwrap();
        alloc.append(id, 64).unwrap();
        alloc.close_writer(id);

        rt[0].readers.store(1, Ordering::Release);
        assert_eq!(alloc.begin_evict(&rt, &stats, &HashSet::new()), None);
        rt[0].readers.store(0, Ordering::Release);
        assert_eq!(alloc.begin_evict(&rt, &stats, &HashSet::new()), Some(0));
    }

    #[test]
    fn excluded_regions_are_not_candidates() {
        let stats = GroupStats::new();
        let rt = runtimes(2);
        let mut alloc = RegionAllocator::new(64, 2);
        for _ in 0..2 {
            let id = alloc.open_for_write().unwrap();
            alloc.append(id, 64).unwrap();
            alloc.close_writer(id);
        }
        let exclude: HashSet<RegionId> = [0u32].into_iter().collect();
        assert_eq!(alloc.begin_evict(&rt, &stats, &exclude), Some(1));
    }

    #[test]
    fn ties_break_by_oldest_access_then_index() {
        let stats = GroupStats::new();
        let rt = runtimes(3);
        let mut alloc = RegionAllocator::new(64, 3);
        for _ in 0..3 {
            let id = alloc.open_for_write().unwrap();
            alloc.append(id, 64).unwrap();
            alloc.close_writer(id);
        }
        // Equal scores (zero referenced bytes); region 2 accessed longest ago
        // still has tick 0 like the others, so the lowest index wins.
        assert_eq!(alloc.begin_evict(&rt, &stats, &HashSet::new()), Some(0));
    }

    #[test]
    fn bytes_cached_counts_full_regions_only() {
        let mut alloc = RegionAllocator::new(100, 3);
        let a = alloc.open_for_write().unwrap();
        alloc.append(a, 100).unwrap();
        alloc.close_writer(a);
        let b = alloc.open_for_write().unwrap();
        alloc.append(b, 40).unwrap();

        assert_eq!(alloc.bytes_cached(), 100);
        assert_eq!(alloc.regions_cached(), 1);
    }
}
