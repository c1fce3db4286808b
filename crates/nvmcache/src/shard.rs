//! One cache shard: a data file plus its region allocator, entry index,
//! and checkpoint machinery.
//!
//! Concurrency protocol: batch mutations (`write`, `remove_file_entries`,
//! `clear`) serialise on the writer mutex and take the state write lock in
//! short critical sections. Readers take the state read lock only to look up
//! a slot and pin its region; the positional read itself runs lockless, with
//! the per-region reader count blocking eviction until the pin drops.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nvmcache_error::{CacheError, Result};
use nvmcache_types::{CacheKey, CacheStats, EntrySlot, FileNum, Pin, ReadOutcome, RegionId};
use nvmcache_vfs::{OpenMode, SyncMode, Vfs, VfsFile};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::checkpoint::{
    CheckpointSnapshot, EntryRecord, RegionRecord, REGION_STATE_EMPTY, REGION_STATE_FULL,
};
use crate::group_stats::{GroupOp, GroupStats};
use crate::index::EntryIndex;
use crate::region::{RegionAllocator, RegionRuntime, RegionState};

/// Construction parameters for one shard.
#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub shard_id: u32,
    pub path: PathBuf,
    pub region_size: u64,
    pub max_regions: u32,
    /// Bytes written before a checkpoint is taken; 0 disables checkpointing.
    pub checkpoint_interval_bytes: u64,
    pub disable_file_cow: bool,
}

struct ShardState {
    allocator: RegionAllocator,
    index: EntryIndex,
    bytes_since_checkpoint: u64,
}

#[derive(Default)]
struct ShardCounters {
    bytes_written: AtomicU64,
    entries_written: AtomicU64,
    bytes_read: AtomicU64,
    entries_read: AtomicU64,
    regions_evicted: AtomicU64,
    entries_aged_out: AtomicU64,
    checkpoints_written: AtomicU64,
    write_errors: AtomicU64,
    read_errors: AtomicU64,
    checkpoint_errors: AtomicU64,
    corrupt_entries: AtomicU64,
}

/// Keeps a region's reader count raised for the duration of a read.
pub struct RegionReadPin<'a> {
    rt: &'a RegionRuntime,
}

impl Drop for RegionReadPin<'_> {
    fn drop(&mut self) {
        self.rt.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A planned allocation for one pin in a write batch.
struct WriteOp {
    pin: usize,
    region: RegionId,
    offset_in_region: u32,
    len: u32,
    checksum: u64,
}

/// One shard of the cache: backing file, index, regions, checkpoints.
pub struct ShardFile<V: Vfs> {
    shard_id: u32,
    path: PathBuf,
    region_size: u64,
    checkpoint_interval: u64,
    vfs: Arc<V>,
    file: V::File,
    writer: Mutex<()>,
    state: RwLock<ShardState>,
    regions_rt: Vec<RegionRuntime>,
    group_stats: Arc<GroupStats>,
    counters: ShardCounters,
}

impl<V: Vfs> ShardFile<V> {
    /// Open (or create) the shard's data file and replay its checkpoint.
    ///
    /// A missing, mismatched, or corrupt checkpoint starts the shard empty;
    /// a leftover checkpoint tmp file from an interrupted rewrite is
    /// removed.
    pub fn open(vfs: Arc<V>, options: ShardOptions, group_stats: Arc<GroupStats>) -> Result<Self> {
        let file = vfs.open(&options.path, OpenMode::CreateReadWrite)?;
        let capacity = options.region_size * u64::from(options.max_regions);
        if file.file_size()? < capacity {
            file.set_len(capacity)?;
        }
        if options.disable_file_cow {
            if let Err(e) = file.disable_cow() {
                warn!(
                    shard = options.shard_id,
                    error = %e,
                    "copy-on-write opt-out failed"
                );
            }
        }

        let mut allocator = RegionAllocator::new(options.region_size, options.max_regions);
        let mut index = EntryIndex::new();
        let regions_rt: Vec<RegionRuntime> = (0..options.max_regions)
            .map(|_| RegionRuntime::default())
            .collect();

        let tmp = tmp_checkpoint_path(&options.path);
        if vfs.exists(&tmp)? {
            let _ = vfs.delete(&tmp);
        }

        let cp = checkpoint_path(&options.path);
        if vfs.exists(&cp)? {
            match load_checkpoint(vfs.as_ref(), &cp) {
                Ok(snapshot)
                    if snapshot.shard_id == options.shard_id
                        && snapshot.region_size == options.region_size
                        && snapshot.regions.len() == options.max_regions as usize =>
                {
                    for (i, record) in snapshot.regions.iter().enumerate() {
                        if record.state == REGION_STATE_FULL {
                            allocator.restore_full(i as RegionId, record.used);
                            // Seed the access history from the persisted
                            // score; ticks restart at zero after reopen.
                            regions_rt[i]
                                .referenced_bytes
                                .store(record.score as u64, Ordering::Relaxed);
                        }
                    }
                    for entry in &snapshot.entries {
                        let key = CacheKey::new(FileNum::new(entry.file_num), entry.offset);
                        let slot = EntrySlot {
                            region: entry.region,
                            offset_in_region: entry.offset_in_region,
                            length: entry.length,
                            checksum: entry.checksum,
                        };
                        index.insert(key, slot);
                    }
                    info!(
                        shard = options.shard_id,
                        entries = index.len(),
                        "checkpoint loaded"
                    );
                }
                Ok(_) => {
                    warn!(
                        shard = options.shard_id,
                        "checkpoint does not match shard geometry; starting empty"
                    );
                }
                Err(e) => {
                    warn!(
                        shard = options.shard_id,
                        error = %e,
                        "discarding unreadable checkpoint"
                    );
                }
            }
        }

        Ok(Self {
            shard_id: options.shard_id,
            path: options.path,
            region_size: options.region_size,
            checkpoint_interval: options.checkpoint_interval_bytes,
            vfs,
            file,
            writer: Mutex::new(()),
            state: RwLock::new(ShardState {
                allocator,
                index,
                bytes_since_checkpoint: 0,
            }),
            regions_rt,
            group_stats,
            counters: ShardCounters::default(),
        })
    }

    /// This shard's id within the cache.
    #[inline]
    #[must_use]
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Path of the backing data file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a batch of pins to this shard.
    ///
    /// Pins whose fingerprint is already cached are skipped, as are pins
    /// larger than a region and pins for which no region can be freed.
    /// Adjacent allocations are coalesced into vectored writes. An I/O error
    /// drops the failing slice and everything after it in the batch (entries
    /// already on disk stay published) and is logged rather than propagated:
    /// losing a batch must not destabilise the caller.
    pub fn write(&self, pins: &[Box<dyn Pin>]) {
        let _writer = self.writer.lock();

        let ops = self.plan_batch(pins);
        if ops.is_empty() {
            return;
        }
        let published = self.write_batch(pins, &ops);
        self.publish(pins, &ops[..published]);
    }

    /// Allocate space for each storable pin, evicting regions as needed.
    fn plan_batch(&self, pins: &[Box<dyn Pin>]) -> Vec<WriteOp> {
        let mut state = self.state.write();
        let mut ops = Vec::with_capacity(pins.len());
        // Regions receiving this batch hold allocated-but-unwritten bytes
        // and must not be eviction candidates until the batch lands.
        let mut batch_regions: HashSet<RegionId> = HashSet::new();
        let mut planned: HashSet<CacheKey> = HashSet::new();

        for (i, pin) in pins.iter().enumerate() {
            let key = pin.key();
            let len = pin.size();
            if len == 0 {
                debug!(shard = self.shard_id, key = %key, "empty payload skipped");
                continue;
            }
            if len as u64 > self.region_size {
                warn!(
                    shard = self.shard_id,
                    key = %key,
                    size = len,
                    "payload exceeds region size; skipping"
                );
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if state.index.contains(&key) || !planned.insert(key) {
                continue;
            }

            let slot = loop {
                if let Some(region) = state.allocator.open_for_write() {
                    if let Some(offset) = state.allocator.append(region, len as u64) {
                        break Some((region, offset));
                    }
                    state.allocator.close_writer(region);
                    continue;
                }
                let Some(victim) =
                    state
                        .allocator
                        .begin_evict(&self.regions_rt, &self.group_stats, &batch_regions)
                else {
                    break None;
                };
                let aged = state.index.erase_by_region(victim);
                state
                    .allocator
                    .finish_evict(victim, &self.regions_rt[victim as usize]);
                self.counters.regions_evicted.fetch_add(1, Ordering::Relaxed);
                self.counters.entries_aged_out.fetch_add(aged, Ordering::Relaxed);
                debug!(
                    shard = self.shard_id,
                    region = victim,
                    entries = aged,
                    "region evicted"
                );
            };

            let Some((region, offset_in_region)) = slot else {
                warn!(
                    shard = self.shard_id,
                    key = %key,
                    "no evictable region; skipping payload"
                );
                planned.remove(&key);
                continue;
            };
            batch_regions.insert(region);
            let checksum = pin
                .checksum()
                .unwrap_or_else(|| u64::from(crc32c::crc32c(pin.bytes())));
            ops.push(WriteOp {
                pin: i,
                region,
                offset_in_region,
                len: len as u32,
                checksum,
            });
        }
        ops
    }

    /// Stream planned ops to disk, coalescing contiguous allocations.
    /// Returns how many ops landed; an I/O error stops the batch there.
    fn write_batch(&self, pins: &[Box<dyn Pin>], ops: &[WriteOp]) -> usize {
        let mut published = 0;
        let mut i = 0;
        while i < ops.len() {
            let run_region = ops[i].region;
            let mut end_offset = ops[i].offset_in_region + ops[i].len;
            let mut j = i + 1;
            while j < ops.len()
                && ops[j].region == run_region
                && ops[j].offset_in_region == end_offset
            {
                end_offset += ops[j].len;
                j += 1;
            }

            let bufs: Vec<&[u8]> = ops[i..j]
                .iter()
                .map(|op| &pins[op.pin].bytes()[..op.len as usize])
                .collect();
            let file_offset =
                u64::from(run_region) * self.region_size + u64::from(ops[i].offset_in_region);
            match self.file.write_vectored_at(&bufs, file_offset) {
                Ok(()) => published = j,
                Err(e) => {
                    warn!(
                        shard = self.shard_id,
                        error = %e,
                        dropped = ops.len() - published,
                        "write failed; dropping remainder of batch"
                    );
                    self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
            i = j;
        }
        published
    }

    /// Publish index entries for landed ops and settle counters; takes a
    /// checkpoint when the written-byte threshold is crossed.
    fn publish(&self, pins: &[Box<dyn Pin>], ops: &[WriteOp]) {
        let mut bytes_written = 0u64;
        let mut do_checkpoint = false;
        {
            let mut state = self.state.write();
            for op in ops {
                let key = pins[op.pin].key();
                let slot = EntrySlot {
                    region: op.region,
                    offset_in_region: op.offset_in_region,
                    length: op.len,
                    checksum: op.checksum,
                };
                state.index.insert(key, slot);
                let tick = self.group_stats.tick();
                self.regions_rt[op.region as usize].touch(tick, u64::from(op.len));
                self.group_stats
                    .record(key.file_num, GroupOp::Write, u64::from(op.len));
                bytes_written += u64::from(op.len);
            }
            self.counters
                .bytes_written
                .fetch_add(bytes_written, Ordering::Relaxed);
            self.counters
                .entries_written
                .fetch_add(ops.len() as u64, Ordering::Relaxed);

            if self.checkpoint_interval > 0 {
                state.bytes_since_checkpoint += bytes_written;
                if state.bytes_since_checkpoint >= self.checkpoint_interval {
                    state.bytes_since_checkpoint = 0;
                    do_checkpoint = true;
                }
            }
        }
        if do_checkpoint {
            if let Err(e) = self.checkpoint(false) {
                warn!(shard = self.shard_id, error = %e, "checkpoint failed");
            }
        }
    }

    /// Read the payload for `key` into `dst`.
    ///
    /// `dst` must hold at least the entry's length. A checksum mismatch
    /// erases the entry and reports [`ReadOutcome::Corrupt`]; callers treat
    /// that as a miss.
    pub fn read_into(&self, key: CacheKey, dst: &mut [u8]) -> Result<ReadOutcome> {
        let slot = {
            let state = self.state.read();
            let Some(slot) = state.index.lookup(&key) else {
                return Ok(ReadOutcome::Miss);
            };
            // Pin the region before releasing the lock; eviction observes
            // the count under the write lock.
            self.regions_rt[slot.region as usize]
                .readers
                .fetch_add(1, Ordering::AcqRel);
            slot
        };
        let pin = RegionReadPin {
            rt: &self.regions_rt[slot.region as usize],
        };

        let len = slot.length as usize;
        if dst.len() < len {
            return Err(CacheError::ShortRead {
                expected: len,
                actual: dst.len(),
            });
        }

        let file_offset = slot.file_offset(self.region_size);
        let read = match self.file.read_at(&mut dst[..len], file_offset) {
            Ok(n) => n,
            Err(e) => {
                self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if read != len || u64::from(crc32c::crc32c(&dst[..len])) != slot.checksum {
            drop(pin);
            warn!(shard = self.shard_id, key = %key, "checksum mismatch; erasing entry");
            self.counters.corrupt_entries.fetch_add(1, Ordering::Relaxed);
            let _ = self.state.write().index.erase(&key);
            return Ok(ReadOutcome::Corrupt);
        }

        let tick = self.group_stats.tick();
        pin.rt.touch(tick, len as u64);
        drop(pin);
        self.group_stats
            .record(key.file_num, GroupOp::Read, len as u64);
        self.counters.entries_read.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_read
            .fetch_add(len as u64, Ordering::Relaxed);
        Ok(ReadOutcome::Hit)
    }

    /// Erase all entries belonging to `files`.
    ///
    /// Drives the entry index only and never touches regions: space freed
    /// by a purge stays in its region's `used` span until the region is
    /// recycled by the eviction path. Entries whose region is pinned by an
    /// in-flight read survive; their file number lands in `retained` so the
    /// caller can retry later. Must only be called while holding a
    /// write-admission ticket.
    pub fn remove_file_entries(
        &self,
        files: &HashSet<FileNum>,
        retained: &mut HashSet<FileNum>,
    ) -> Result<()> {
        let _writer = self.writer.lock();
        let mut state = self.state.write();
        let rt = &self.regions_rt;
        let erased = state.index.erase_by_files(
            files,
            |region| rt[region as usize].readers.load(Ordering::Acquire) > 0,
            retained,
        );
        self.counters
            .entries_aged_out
            .fetch_add(erased, Ordering::Relaxed);
        debug!(shard = self.shard_id, erased, "file entries removed");
        Ok(())
    }

    /// Drop every entry and recycle every region.
    ///
    /// Not safe while writes are in flight: the caller guarantees
    /// quiescence (no admission ticket is taken here).
    pub fn clear(&self) {
        let _writer = self.writer.lock();
        let mut state = self.state.write();
        state.index.clear();
        state.allocator.clear(&self.regions_rt);
        state.bytes_since_checkpoint = 0;
    }

    /// Serialise the index and region table to the sibling checkpoint file.
    ///
    /// The snapshot is taken under the shard lock but written outside it;
    /// installation is tmp -> fsync -> rename, so a crash mid-rewrite leaves
    /// the previous checkpoint in place. `is_final` also syncs the data file
    /// (shutdown path).
    pub fn checkpoint(&self, is_final: bool) -> Result<()> {
        let result = self.checkpoint_inner(is_final);
        if result.is_err() {
            self.counters.checkpoint_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn checkpoint_inner(&self, is_final: bool) -> Result<()> {
        let snapshot = {
            let state = self.state.read();
            let regions = state
                .allocator
                .regions()
                .iter()
                .enumerate()
                .map(|(i, region)| {
                    debug_assert_ne!(region.state(), RegionState::Evicting);
                    let durable = region.used() > 0
                        && matches!(region.state(), RegionState::Full | RegionState::Writing);
                    RegionRecord {
                        used: if durable { region.used() } else { 0 },
                        score: self.group_stats.score_region(&self.regions_rt[i]),
                        state: if durable {
                            REGION_STATE_FULL
                        } else {
                            REGION_STATE_EMPTY
                        },
                    }
                })
                .collect();
            let entries = state
                .index
                .iter()
                .map(|(key, slot)| EntryRecord {
                    file_num: key.file_num.get(),
                    offset: key.offset,
                    length: slot.length,
                    region: slot.region,
                    offset_in_region: slot.offset_in_region,
                    checksum: slot.checksum,
                })
                .collect();
            CheckpointSnapshot {
                shard_id: self.shard_id,
                region_size: self.region_size,
                regions,
                entries,
            }
        };
        let bytes = snapshot.encode();

        if is_final {
            self.file.sync(SyncMode::Data)?;
        }

        let tmp = tmp_checkpoint_path(&self.path);
        let tmp_file = self.vfs.open(&tmp, OpenMode::CreateReadWrite)?;
        tmp_file.set_len(0)?;
        tmp_file.write_at(&bytes, 0)?;
        tmp_file.sync(SyncMode::All)?;
        self.vfs.rename(&tmp, &checkpoint_path(&self.path))?;

        self.counters
            .checkpoints_written
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            shard = self.shard_id,
            entries = snapshot.entries.len(),
            is_final,
            "checkpoint installed"
        );
        Ok(())
    }

    /// Fold this shard's counters and occupancy gauges into `stats`.
    pub fn update_stats(&self, stats: &mut CacheStats) {
        {
            let state = self.state.read();
            stats.bytes_cached += state.allocator.bytes_cached();
            stats.regions_cached += state.allocator.regions_cached();
            stats.entries_cached += state.index.len() as u64;
        }
        let c = &self.counters;
        stats.bytes_written += c.bytes_written.load(Ordering::Relaxed);
        stats.entries_written += c.entries_written.load(Ordering::Relaxed);
        stats.bytes_read += c.bytes_read.load(Ordering::Relaxed);
        stats.entries_read += c.entries_read.load(Ordering::Relaxed);
        stats.regions_evicted += c.regions_evicted.load(Ordering::Relaxed);
        stats.entries_aged_out += c.entries_aged_out.load(Ordering::Relaxed);
        stats.checkpoints_written += c.checkpoints_written.load(Ordering::Relaxed);
        stats.write_errors += c.write_errors.load(Ordering::Relaxed);
        stats.read_errors += c.read_errors.load(Ordering::Relaxed);
        stats.checkpoint_errors += c.checkpoint_errors.load(Ordering::Relaxed);
        stats.corrupt_entries += c.corrupt_entries.load(Ordering::Relaxed);
    }

    /// Remove the shard's data and checkpoint files (cache teardown).
    pub fn delete_file(&self) -> Result<()> {
        self.vfs.delete(&self.path)?;
        for path in [checkpoint_path(&self.path), tmp_checkpoint_path(&self.path)] {
            if self.vfs.exists(&path)? {
                self.vfs.delete(&path)?;
            }
        }
        Ok(())
    }

    /// Look up the slot for `key` without touching access stats.
    #[must_use]
    pub fn testing_lookup(&self, key: CacheKey) -> Option<EntrySlot> {
        self.state.read().index.lookup(&key)
    }

    /// Hold a reader pin on `region`, as an in-flight read would.
    #[must_use]
    pub fn testing_pin_region(&self, region: RegionId) -> RegionReadPin<'_> {
        let rt = &self.regions_rt[region as usize];
        rt.readers.fetch_add(1, Ordering::AcqRel);
        RegionReadPin { rt }
    }
}

/// Sibling checkpoint file for a shard data file.
pub(crate) fn checkpoint_path(data_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.cp", data_path.display()))
}

/// Temporary file a checkpoint is staged in before rename.
pub(crate) fn tmp_checkpoint_path(data_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.cp.tmp", data_path.display()))
}

fn load_checkpoint<V: Vfs>(vfs: &V, path: &Path) -> Result<CheckpointSnapshot> {
    let file = vfs.open(path, OpenMode::MustExist)?;
    let size = usize::try_from(file.file_size()?)
        .map_err(|_| CacheError::corrupt_checkpoint("checkpoint larger than memory"))?;
    let mut bytes = vec![0u8; size];
    let read = file.read_at(&mut bytes, 0)?;
    if read != size {
        return Err(CacheError::ShortRead {
            expected: size,
            actual: read,
        });
    }
    CheckpointSnapshot::decode(&bytes)
}

#[cfg(test)]
mod tests {
    use nvmcache_vfs::MemoryVfs;

    use super::*;
    use crate::fixtures::TestPin;

    const REGION: u64 = 4096;

    fn options(max_regions: u32) -> ShardOptions {
        ShardOptions {
            shard_id: 0,
            path: PathBuf::from("/cache/shard0"),
            region_size: REGION,
            max_regions,
            checkpoint_interval_bytes: 0,
            disable_file_cow: false,
        }
    }

    fn open_shard(vfs: &MemoryVfs, max_regions: u32) -> ShardFile<MemoryVfs> {
        ShardFile::open(
            Arc::new(vfs.clone()),
            options(max_regions),
            Arc::new(GroupStats::new()),
        )
        .unwrap()
    }

    fn pins(specs: &[(u64, u64, usize)]) -> Vec<Box<dyn Pin>> {
        specs
            .iter()
            .map(|&(file, offset, size)| {
                Box::new(TestPin::patterned(file, offset, size)) as Box<dyn Pin>
            })
            .collect()
    }

    #[test]
    fn write_then_read_roundtrip() {
        let vfs = MemoryVfs::new();
        let shard = open_shard(&vfs, 4);
        let batch = pins(&[(17, 0, 1024), (17, 4096, 512)]);
        shard.write(&batch);

        let mut buf = vec![0u8; 1024];
        let key = CacheKey::new(FileNum::new(17), 0);
        assert_eq!(shard.read_into(key, &mut buf).unwrap(), ReadOutcome::Hit);
        assert_eq!(&buf[..], batch[0].bytes());

        let mut buf = vec![0u8; 512];
        let key = CacheKey::new(FileNum::new(17), 4096);
        assert_eq!(shard.read_into(key, &mut buf).unwrap(), ReadOutcome::Hit);
        assert_eq!(&buf[..], batch[1].bytes());
    }

    #[test]
    fn missing_key_is_a_miss() {
        let vfs = MemoryVfs::new();
        let shard = open_shard(&vfs, 2);
        let mut buf = [0u8; 16];
        let outcome = shard
            .read_into(CacheKey::new(FileNum::new(1), 0), &mut buf)
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Miss);
    }

    #[test]
    fn rewrite_of_resident_key_keeps_location() {
        let vfs = MemoryVfs::new();
        let shard = open_shard(&vfs, 4);
        let key = CacheKey::new(FileNum::new(3), 100);

        shard.write(&pins(&[(3, 100, 256)]));
        let before = shard.testing_lookup(key).unwrap();
        shard.write(&pins(&[(3, 100, 256), (3, 400, 256)]));
        let after = shard.testing_lookup(key).unwrap();
        assert_eq!(before, after);

        let mut stats = CacheStats::default();
        shard.update_stats(&mut stats);
        assert_eq!(stats.entries_written, 2);
    }

    #[test]
    fn oversized_pin_skipped_others_proceed() {
        let vfs = MemoryVfs::new();
        let shard = open_shard(&vfs, 2);
        let batch = pins(&[(1, 0, REGION as usize + 1), (2, 0, 64)]);
        shard.write(&batch);

        assert!(shard
            .testing_lookup(CacheKey::new(FileNum::new(1), 0))
            .is_none());
        assert!(shard
            .testing_lookup(CacheKey::new(FileNum::new(2), 0))
            .is_some());

        let mut stats = CacheStats::default();
        shard.update_stats(&mut stats);
        assert_eq!(stats.write_errors, 1);
        assert_eq!(stats.entries_written, 1);
    }

    #[test]
    fn exact_region_fill_rolls_to_next_region() {
        let vfs = MemoryVfs::new();
        let shard = open_shard(&vfs, 2);
        shard.write(&pins(&[(1, 0, REGION as usize), (2, 0, 64)]));

        let a = shard
            .testing_lookup(CacheKey::new(FileNum::new(1), 0))
            .unwrap();
        let b = shard
            .testing_lookup(CacheKey::new(FileNum::new(2), 0))
            .unwrap();
        assert_eq!(a.region, 0);
        assert_eq!(b.region, 1);
    }

    #[test]
    fn capacity_pressure_evicts_exactly_one_region() {
        let vfs = MemoryVfs::new();
        let shard = open_shard(&vfs, 2);
        // Three region-sized payloads through a two-region shard.
        for i in 0..3u64 {
            shard.write(&pins(&[(i, 0, REGION as usize)]));
        }

        let mut stats = CacheStats::default();
        shard.update_stats(&mut stats);
        assert_eq!(stats.regions_evicted, 1);
        assert!(stats.bytes_cached <= 2 * REGION);
        // The evicted region's entry is gone from the index.
        assert_eq!(stats.entries_cached, 2);
        assert_eq!(stats.entries_aged_out, 1);
    }

    #[test]
    fn corrupt_payload_is_erased_and_reported() {
        let vfs = MemoryVfs::new();
        let shard = open_shard(&vfs, 2);
        shard.write(&pins(&[(9, 0, 128)]));
        let key = CacheKey::new(FileNum::new(9), 0);
        let slot = shard.testing_lookup(key).unwrap();

        // Flip a byte of the payload through a second handle.
        let raw = vfs
            .open(Path::new("/cache/shard0"), OpenMode::MustExist)
            .unwrap();
        let offset = slot.file_offset(REGION);
        let mut byte = [0u8; 1];
        raw.read_at(&mut byte, offset).unwrap();
        byte[0] ^= 0xff;
        raw.write_at(&byte, offset).unwrap();

        let mut buf = [0u8; 128];
        assert_eq!(shard.read_into(key, &mut buf).unwrap(), ReadOutcome::Corrupt);
        // Erased: the retry is a plain miss.
        assert_eq!(shard.read_into(key, &mut buf).unwrap(), ReadOutcome::Miss);

        let mut stats = CacheStats::default();
        shard.update_stats(&mut stats);
        assert_eq!(stats.corrupt_entries, 1);
    }

    #[test]
    fn remove_file_entries_respects_reader_pins() {
        let vfs = MemoryVfs::new();
        let shard = open_shard(&vfs, 2);
        shard.write(&pins(&[(42, 0, 64), (7, 0, 64)]));
        let slot = shard
            .testing_lookup(CacheKey::new(FileNum::new(42), 0))
            .unwrap();

        let files: HashSet<FileNum> = [FileNum::new(42)].into_iter().collect();
        let mut retained = HashSet::new();
        {
            let _pin = shard.testing_pin_region(slot.region);
            shard.remove_file_entries(&files, &mut retained).unwrap();
        }
        assert!(retained.contains(&FileNum::new(42)));
        assert!(shard
            .testing_lookup(CacheKey::new(FileNum::new(42), 0))
            .is_some());

        // Reader released: the purge now succeeds.
        retained.clear();
        shard.remove_file_entries(&files, &mut retained).unwrap();
        assert!(retained.is_empty());
        assert!(shard
            .testing_lookup(CacheKey::new(FileNum::new(42), 0))
            .is_none());
        // The unrelated file is untouched.
        assert!(shard
            .testing_lookup(CacheKey::new(FileNum::new(7), 0))
            .is_some());
    }

    #[test]
    fn clear_empties_index_and_regions() {
        let vfs = MemoryVfs::new();
        let shard = open_shard(&vfs, 2);
        shard.write(&pins(&[(1, 0, REGION as usize), (2, 0, 512)]));
        shard.clear();

        let mut stats = CacheStats::default();
        shard.update_stats(&mut stats);
        assert_eq!(stats.bytes_cached, 0);
        assert_eq!(stats.entries_cached, 0);
        assert_eq!(stats.regions_cached, 0);
    }

    #[test]
    fn checkpoint_reopen_recovers_entries() {
        let vfs = MemoryVfs::new();
        let batch = pins(&[(5, 0, 300), (6, 64, 200)]);
        {
            let shard = open_shard(&vfs, 4);
            shard.write(&batch);
            shard.checkpoint(true).unwrap();
        }

        let shard = open_shard(&vfs, 4);
        let mut buf = vec![0u8; 300];
        assert_eq!(
            shard
                .read_into(CacheKey::new(FileNum::new(5), 0), &mut buf)
                .unwrap(),
            ReadOutcome::Hit
        );
        assert_eq!(&buf[..], batch[0].bytes());

        let mut stats = CacheStats::default();
        shard.update_stats(&mut stats);
        assert_eq!(stats.entries_cached, 2);
    }

    #[test]
    fn unwritten_shard_reopens_empty() {
        let vfs = MemoryVfs::new();
        {
            let shard = open_shard(&vfs, 2);
            shard.write(&pins(&[(5, 0, 300)]));
            // No checkpoint taken: entries are lost on reopen.
        }
        let shard = open_shard(&vfs, 2);
        let mut buf = vec![0u8; 300];
        assert_eq!(
            shard
                .read_into(CacheKey::new(FileNum::new(5), 0), &mut buf)
                .unwrap(),
            ReadOutcome::Miss
        );
    }

    #[test]
    fn geometry_mismatch_discards_checkpoint() {
        let vfs = MemoryVfs::new();
        {
            let shard = open_shard(&vfs, 4);
            shard.write(&pins(&[(5, 0, 300)]));
            shard.checkpoint(true).unwrap();
        }
        // Same file, different region size: the checkpoint must not load.
        let mut opts = options(4);
        opts.region_size = REGION * 2;
        let shard = ShardFile::open(
            Arc::new(vfs.clone()),
            opts,
            Arc::new(GroupStats::new()),
        )
        .unwrap();
        assert!(shard
            .testing_lookup(CacheKey::new(FileNum::new(5), 0))
            .is_none());
    }

    #[test]
    fn stale_tmp_checkpoint_is_ignored() {
        let vfs = MemoryVfs::new();
        {
            let shard = open_shard(&vfs, 4);
            shard.write(&pins(&[(5, 0, 300)]));
            shard.checkpoint(true).unwrap();
        }
        // Simulate a crash mid-rewrite: garbage tmp next to a good checkpoint.
        let tmp = vfs
            .open(Path::new("/cache/shard0.cp.tmp"), OpenMode::CreateReadWrite)
            .unwrap();
        tmp.write_at(b"partial garbage", 0).unwrap();

        let shard = open_shard(&vfs, 4);
        assert!(shard
            .testing_lookup(CacheKey::new(FileNum::new(5), 0))
            .is_some());
        assert!(!vfs.exists(Path::new("/cache/shard0.cp.tmp")).unwrap());
    }

    #[test]
    fn delete_file_removes_data_and_checkpoint() {
        let vfs = MemoryVfs::new();
        let shard = open_shard(&vfs, 2);
        shard.write(&pins(&[(1, 0, 64)]));
        shard.checkpoint(true).unwrap();
        shard.delete_file().unwrap();
        assert!(!vfs.exists(Path::new("/cache/shard0")).unwrap());
        assert!(!vfs.exists(Path::new("/cache/shard0.cp")).unwrap());
    }
}
