//! The cache facade: shard fan-out, write admission, shutdown.
//!
//! `writes_in_progress` plays two roles at once. As a mutex it admits one
//! write batch fleet-wide: `start_write` bids `fetch_add(num_shards)` and
//! wins only if the prior value was zero, undoing the bid otherwise. As a
//! countdown it tracks outstanding per-shard work: each shard task (or
//! no-work shard) releases exactly one of the `num_shards` claims, and
//! shutdown spins until the counter drains.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nvmcache_error::Result;
use nvmcache_types::{CacheConfig, CacheStats, FileNum, Pin};
use nvmcache_vfs::Vfs;
use tracing::{error, info, warn};

use crate::executor::Executor;
use crate::group_stats::GroupStats;
use crate::shard::{ShardFile, ShardOptions};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Releases one per-shard claim on the admission counter when dropped, on
/// every exit path of a shard task. The task that releases the last claim
/// logs the batch rate.
struct BatchSlot {
    counter: Arc<AtomicI64>,
    bytes: u64,
    start: Instant,
}

impl Drop for BatchSlot {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            let secs = self.start.elapsed().as_secs_f64().max(1e-6);
            let megabytes = self.bytes >> 20;
            let mb_per_s = self.bytes as f64 / (1u64 << 20) as f64 / secs;
            info!(megabytes, mb_per_s = format_args!("{mb_per_s:.1}"), "ssd write batch complete");
        }
    }
}

/// A sharded, persistent SSD cache.
///
/// Owns `num_shards` shard files named `{prefix}{i}` and routes all work for
/// a file to `shards[file_num mod num_shards]`. The cache is a hint store:
/// any entry may disappear on crash, and no operation here ever fails a
/// caller for data loss; lost entries surface as misses.
pub struct NvmCache<V: Vfs + 'static> {
    shards: Vec<Arc<ShardFile<V>>>,
    num_shards: u32,
    executor: Arc<dyn Executor>,
    group_stats: Arc<GroupStats>,
    writes_in_progress: Arc<AtomicI64>,
    is_shutdown: AtomicBool,
    effective_max_bytes: u64,
}

impl<V: Vfs + 'static> NvmCache<V> {
    /// Construct the cache: validates the configuration, creates the parent
    /// directory of the prefix, and opens every shard (replaying whatever
    /// checkpoints survive).
    pub fn new(config: &CacheConfig, vfs: V, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;

        let vfs = Arc::new(vfs);
        if let Some(parent) = config.file_prefix.parent() {
            if !parent.as_os_str().is_empty() {
                vfs.create_dir_all(parent)?;
            }
        }

        let group_stats = Arc::new(GroupStats::new());
        let max_regions = config.file_max_regions();
        let per_shard_interval = config.checkpoint_interval_bytes / u64::from(config.num_shards);

        let mut shards = Vec::with_capacity(config.num_shards as usize);
        for i in 0..config.num_shards {
            let options = ShardOptions {
                shard_id: i,
                path: PathBuf::from(format!("{}{}", config.file_prefix.display(), i)),
                region_size: config.region_size,
                max_regions,
                checkpoint_interval_bytes: per_shard_interval,
                disable_file_cow: config.disable_file_cow,
            };
            shards.push(Arc::new(ShardFile::open(
                Arc::clone(&vfs),
                options,
                Arc::clone(&group_stats),
            )?));
        }

        Ok(Self {
            shards,
            num_shards: config.num_shards,
            executor,
            group_stats,
            writes_in_progress: Arc::new(AtomicI64::new(0)),
            is_shutdown: AtomicBool::new(false),
            effective_max_bytes: config.effective_max_bytes(),
        })
    }

    /// Number of shards.
    #[inline]
    #[must_use]
    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    /// Effective capacity in bytes (configured capacity rounded up to a
    /// whole number of regions per shard).
    #[inline]
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.effective_max_bytes
    }

    /// The shard that caches `file_num`.
    #[must_use]
    pub fn file(&self, file_num: FileNum) -> &ShardFile<V> {
        &self.shards[self.shard_index(file_num)]
    }

    fn shard_index(&self, file_num: FileNum) -> usize {
        (file_num.get() % u64::from(self.num_shards)) as usize
    }

    /// Claim a fleet-wide write batch.
    ///
    /// Returns `false` when the cache is shutting down or another batch is
    /// still in flight. A `true` return obligates the caller to follow with
    /// exactly one [`NvmCache::write`] (or the claim leaks and shutdown
    /// hangs).
    pub fn start_write(&self) -> bool {
        if self.is_shutdown.load(Ordering::Acquire) {
            return false;
        }
        if self
            .writes_in_progress
            .fetch_add(i64::from(self.num_shards), Ordering::AcqRel)
            == 0
        {
            // No write was pending; every shard slot is now claimed.
            return true;
        }
        // Lost the bid: undo the increment.
        self.writes_in_progress
            .fetch_sub(i64::from(self.num_shards), Ordering::AcqRel);
        false
    }

    /// Write a batch of pins, bucketed by shard and fanned out on the
    /// executor. Requires a successful [`NvmCache::start_write`].
    ///
    /// Does not block on completion; shard tasks release the admission
    /// counter as they finish, and shard-level I/O errors are logged inside
    /// the task rather than surfaced.
    pub fn write(&self, pins: Vec<Box<dyn Pin>>) {
        assert!(
            self.writes_in_progress.load(Ordering::Acquire) >= i64::from(self.num_shards),
            "write called without a start_write admission"
        );
        let start = Instant::now();
        let total_bytes: u64 = pins.iter().map(|p| p.size() as u64).sum();

        let mut buckets: Vec<Vec<Box<dyn Pin>>> =
            (0..self.num_shards).map(|_| Vec::new()).collect();
        for pin in pins {
            let index = self.shard_index(pin.key().file_num);
            buckets[index].push(pin);
        }

        let mut no_store = 0i64;
        for (i, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                no_store += 1;
                continue;
            }
            let shard = Arc::clone(&self.shards[i]);
            let slot = BatchSlot {
                counter: Arc::clone(&self.writes_in_progress),
                bytes: total_bytes,
                start,
            };
            self.executor.execute(Box::new(move || {
                let _slot = slot;
                shard.write(&bucket);
            }));
        }
        // Shards that received nothing release their claim synchronously.
        self.writes_in_progress
            .fetch_sub(no_store, Ordering::AcqRel);
    }

    /// Erase every cached entry belonging to `files_to_remove`, across all
    /// shards, synchronously.
    ///
    /// Files with entries pinned by in-flight reads are recorded in
    /// `retained` for a later retry. Returns `false` if admission failed or
    /// any shard reported an error.
    pub fn remove_file_entries(
        &self,
        files_to_remove: &HashSet<FileNum>,
        retained: &mut HashSet<FileNum>,
    ) -> bool {
        if !self.start_write() {
            return false;
        }

        let mut success = true;
        for shard in &self.shards {
            if let Err(e) = shard.remove_file_entries(files_to_remove, retained) {
                error!(
                    shard = shard.shard_id(),
                    error = %e,
                    "error removing file entries from ssd shard"
                );
                success = false;
            }
            self.writes_in_progress.fetch_sub(1, Ordering::AcqRel);
        }
        success
    }

    /// Snapshot cache-wide statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in &self.shards {
            shard.update_stats(&mut stats);
        }
        stats
    }

    /// Drop every cached entry in every shard.
    ///
    /// Synchronous; the caller guarantees no writes are in flight.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.clear();
        }
    }

    /// Shut the cache down: refuse new write admissions, wait for in-flight
    /// shard tasks to drain, then take a final checkpoint on every shard.
    ///
    /// May block indefinitely if a shard task is wedged; durability of the
    /// final checkpoint is worth the liveness trade here.
    pub fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::Release);
        while self.writes_in_progress.load(Ordering::Acquire) > 0 {
            std::thread::sleep(SHUTDOWN_POLL);
        }
        for shard in &self.shards {
            if let Err(e) = shard.checkpoint(true) {
                warn!(shard = shard.shard_id(), error = %e, "final checkpoint failed");
            }
        }
    }

    /// Remove every shard's files (test teardown).
    pub fn testing_delete_files(&self) {
        for shard in &self.shards {
            if let Err(e) = shard.delete_file() {
                warn!(shard = shard.shard_id(), error = %e, "failed to delete shard file");
            }
        }
    }
}

impl<V: Vfs + 'static> fmt::Debug for NvmCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvmCache")
            .field("num_shards", &self.num_shards)
            .field("effective_max_bytes", &self.effective_max_bytes)
            .field("is_shutdown", &self.is_shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V: Vfs + 'static> fmt::Display for NvmCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        writeln!(
            f,
            "Ssd cache IO: write {}MB read {}MB size {}GB occupied {}GB {}K entries",
            stats.bytes_written >> 20,
            stats.bytes_read >> 20,
            self.effective_max_bytes >> 30,
            stats.bytes_cached >> 30,
            stats.entries_cached >> 10,
        )?;
        write!(
            f,
            "GroupStats: {}",
            self.group_stats.summary(self.effective_max_bytes)
        )
    }
}
