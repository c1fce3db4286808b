//! The per-shard entry index: fingerprint -> on-disk slot.
//!
//! Updated under the shard's write lock; looked up under the shared lock.
//! The index never touches the data file: erasure just forgets where a
//! payload lives, and the region allocator decides when the bytes become
//! reusable.

use std::collections::{HashMap, HashSet};

use nvmcache_types::{CacheKey, EntrySlot, FileNum, RegionId};

/// Result of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry was published.
    Inserted,
    /// The fingerprint already had an entry; the map is unchanged.
    AlreadyPresent,
}

/// Fingerprint-keyed map of cached payload locations.
#[derive(Debug, Default)]
pub struct EntryIndex {
    map: HashMap<CacheKey, EntrySlot>,
}

impl EntryIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the index is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether `key` has a live entry.
    #[inline]
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.map.contains_key(key)
    }

    /// Publish an entry. A re-insert of a present fingerprint is a no-op:
    /// the existing location stays authoritative.
    pub fn insert(&mut self, key: CacheKey, slot: EntrySlot) -> InsertOutcome {
        match self.map.entry(key) {
            std::collections::hash_map::Entry::Occupied(_) => InsertOutcome::AlreadyPresent,
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(slot);
                InsertOutcome::Inserted
            }
        }
    }

    /// Look up the slot for `key`.
    #[inline]
    #[must_use]
    pub fn lookup(&self, key: &CacheKey) -> Option<EntrySlot> {
        self.map.get(key).copied()
    }

    /// Erase one entry, returning its slot if it was present.
    pub fn erase(&mut self, key: &CacheKey) -> Option<EntrySlot> {
        self.map.remove(key)
    }

    /// Erase every entry located in `region`. Returns the number erased.
    pub fn erase_by_region(&mut self, region: RegionId) -> u64 {
        let mut count = 0u64;
        self.map.retain(|_, slot| {
            if slot.region == region {
                count += 1;
                false
            } else {
                true
            }
        });
        count
    }

    /// Erase every entry whose file is in `files`, except entries whose
    /// region is currently pinned by a reader; those are kept and their file
    /// number recorded in `retained`. Returns the number erased.
    pub fn erase_by_files(
        &mut self,
        files: &HashSet<FileNum>,
        pinned: impl Fn(RegionId) -> bool,
        retained: &mut HashSet<FileNum>,
    ) -> u64 {
        let mut erased = 0u64;
        self.map.retain(|key, slot| {
            if !files.contains(&key.file_num) {
                return true;
            }
            if pinned(slot.region) {
                retained.insert(key.file_num);
                return true;
            }
            erased += 1;
            false
        });
        erased
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Iterate all entries (checkpoint snapshots).
    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &EntrySlot)> {
        self.map.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(file: u64, offset: u64) -> CacheKey {
        CacheKey::new(FileNum::new(file), offset)
    }

    fn slot(region: RegionId, offset: u32, length: u32) -> EntrySlot {
        EntrySlot {
            region,
            offset_in_region: offset,
            length,
            checksum: 0xdead,
        }
    }

    #[test]
    fn reinsert_is_a_noop() {
        let mut index = EntryIndex::new();
        assert_eq!(
            index.insert(key(1, 0), slot(0, 0, 100)),
            InsertOutcome::Inserted
        );
        assert_eq!(
            index.insert(key(1, 0), slot(5, 500, 100)),
            InsertOutcome::AlreadyPresent
        );
        // The original location is still authoritative.
        assert_eq!(index.lookup(&key(1, 0)).unwrap().region, 0);
    }

    #[test]
    fn erase_by_region_drops_only_that_region() {
        let mut index = EntryIndex::new();
        index.insert(key(1, 0), slot(0, 0, 10));
        index.insert(key(1, 10), slot(1, 0, 20));
        index.insert(key(2, 0), slot(0, 10, 30));

        assert_eq!(index.erase_by_region(0), 2);
        assert_eq!(index.len(), 1);
        assert!(index.contains(&key(1, 10)));
    }

    #[test]
    fn erase_by_files_retains_pinned_regions() {
        let mut index = EntryIndex::new();
        index.insert(key(42, 0), slot(0, 0, 10));
        index.insert(key(42, 10), slot(1, 0, 20));
        index.insert(key(7, 0), slot(1, 20, 30));

        let files: HashSet<FileNum> = [FileNum::new(42)].into_iter().collect();
        let mut retained = HashSet::new();
        // Region 1 is pinned by a reader.
        let erased = index.erase_by_files(&files, |region| region == 1, &mut retained);

        assert_eq!(erased, 1);
        assert!(retained.contains(&FileNum::new(42)));
        // The pinned entry survives; the unrelated file is untouched.
        assert!(index.contains(&key(42, 10)));
        assert!(index.contains(&key(7, 0)));

        // After the reader releases, a second purge clears it.
        retained.clear();
        let erased = index.erase_by_files(&files, |_| false, &mut retained);
        assert_eq!(erased, 1);
        assert!(retained.is_empty());
        assert!(!index.contains(&key(42, 10)));
    }
}
