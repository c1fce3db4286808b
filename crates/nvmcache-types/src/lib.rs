//! Shared types for the NvmCache SSD cache.
//!
//! Everything here is consumed by both the core crate and external
//! collaborators (the buffer pool producing [`Pin`]s, callers reading
//! [`CacheStats`] snapshots), so it lives in its own dependency-light crate.

use std::fmt;
use std::path::PathBuf;

use nvmcache_error::{CacheError, Result};

/// Default region size: 64 MiB.
pub const DEFAULT_REGION_SIZE: u64 = 1 << 26;

/// Shift applied to a file number to derive its file group.
///
/// Groups are coarse buckets over file identity; 1024 files per group keeps
/// the group table small while still separating workloads.
pub const GROUP_SHIFT: u32 = 10;

/// Stable 64-bit identifier for a user-visible file.
///
/// Assigned by an external file-id registry; opaque to the cache except for
/// shard routing (`file_num mod num_shards`) and group bucketing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct FileNum(u64);

impl FileNum {
    /// Create a file number from its raw registry value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The file group this file belongs to.
    #[inline]
    #[must_use]
    pub const fn group(self) -> GroupId {
        GroupId(self.0 >> GROUP_SHIFT)
    }
}

impl fmt::Display for FileNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file group: a coarse bucket of file numbers scored together for
/// region eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(transparent)]
pub struct GroupId(u64);

impl GroupId {
    /// Get the raw group value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// The cache's primary key: `(file_num, offset)`.
///
/// `offset` is the byte position within the user file that the cached
/// payload starts at. Payloads are always addressed by key, never by
/// on-disk location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub file_num: FileNum,
    pub offset: u64,
}

impl CacheKey {
    /// Create a key from a raw file number and file offset.
    #[inline]
    #[must_use]
    pub const fn new(file_num: FileNum, offset: u64) -> Self {
        Self { file_num, offset }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.file_num, self.offset)
    }
}

/// Index of a region within a shard's region vector.
pub type RegionId = u32;

/// Where a cached payload lives inside a shard file, plus its length and
/// payload checksum.
///
/// Immutable after publication; a payload is replaced by erase + re-insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySlot {
    /// Region holding the payload.
    pub region: RegionId,
    /// Byte offset of the payload within the region.
    pub offset_in_region: u32,
    /// Payload length in bytes.
    pub length: u32,
    /// CRC-32C of the payload, widened to u64.
    pub checksum: u64,
}

impl EntrySlot {
    /// Absolute byte offset of the payload within the shard file.
    #[inline]
    #[must_use]
    pub const fn file_offset(&self, region_size: u64) -> u64 {
        self.region as u64 * region_size + self.offset_in_region as u64
    }
}

/// Outcome of a positional cache read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The payload was found and copied into the destination.
    Hit,
    /// No entry for the key (or the entry was evicted).
    Miss,
    /// The entry was found but failed checksum verification; it has been
    /// erased. Callers should treat this as a miss.
    Corrupt,
}

impl ReadOutcome {
    /// Whether the destination buffer now holds valid payload bytes.
    #[inline]
    #[must_use]
    pub const fn is_hit(self) -> bool {
        matches!(self, Self::Hit)
    }
}

/// A borrow-handle on a buffer-pool entry awaiting SSD write.
///
/// The buffer pool owns the memory; the cache borrows pins for the duration
/// of one write call. Releasing is the pool's business (`Drop` on the
/// concrete type).
pub trait Pin: Send {
    /// The fingerprint this payload is addressed by.
    fn key(&self) -> CacheKey;

    /// Read-only view of the payload bytes.
    fn bytes(&self) -> &[u8];

    /// Payload size in bytes.
    fn size(&self) -> usize {
        self.bytes().len()
    }

    /// CRC-32C of the payload, if the producer precomputed one.
    fn checksum(&self) -> Option<u64> {
        None
    }
}

/// Construction-time cache configuration. The core is a library: no CLI,
/// no environment variables.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Absolute path prefix; shard files are created as `{prefix}{shard_id}`.
    pub file_prefix: PathBuf,
    /// Soft total capacity in bytes; rounded up so every shard holds the
    /// same whole number of regions.
    pub max_bytes: u64,
    /// Number of shards; fixes routing (`file_num mod num_shards`) and
    /// write parallelism.
    pub num_shards: u32,
    /// Bytes written cache-wide between checkpoints, split evenly across
    /// shards. Zero disables checkpointing.
    pub checkpoint_interval_bytes: u64,
    /// Ask the filesystem to exempt data files from copy-on-write.
    /// Advisory: unsupported filesystems are a logged no-op.
    pub disable_file_cow: bool,
    /// Region size in bytes. Fixed for the lifetime of the cache files;
    /// checkpoints recording a different value are discarded on load.
    pub region_size: u64,
}

impl CacheConfig {
    /// Configuration with required fields set and defaults elsewhere.
    #[must_use]
    pub fn new(file_prefix: impl Into<PathBuf>, max_bytes: u64, num_shards: u32) -> Self {
        Self {
            file_prefix: file_prefix.into(),
            max_bytes,
            num_shards,
            checkpoint_interval_bytes: 0,
            disable_file_cow: false,
            region_size: DEFAULT_REGION_SIZE,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.file_prefix.has_root() {
            return Err(CacheError::RelativePrefix {
                path: self.file_prefix.clone(),
            });
        }
        if self.num_shards == 0 {
            return Err(CacheError::config("num_shards must be > 0"));
        }
        if self.max_bytes == 0 {
            return Err(CacheError::config("max_bytes must be > 0"));
        }
        if self.region_size == 0 {
            return Err(CacheError::config("region_size must be > 0"));
        }
        // Region-relative offsets are 32-bit on disk.
        if self.region_size > u64::from(u32::MAX) {
            return Err(CacheError::config("region_size must fit in 32 bits"));
        }
        Ok(())
    }

    /// Number of regions per shard file.
    ///
    /// The capacity is rounded up to a multiple of
    /// `num_shards * region_size` so every shard has the same max size.
    #[must_use]
    pub fn file_max_regions(&self) -> u32 {
        let quantum = u64::from(self.num_shards) * self.region_size;
        let regions = self.max_bytes.div_ceil(quantum);
        u32::try_from(regions).unwrap_or(u32::MAX)
    }

    /// Effective capacity after rounding: always `>= max_bytes`.
    #[must_use]
    pub fn effective_max_bytes(&self) -> u64 {
        u64::from(self.num_shards) * u64::from(self.file_max_regions()) * self.region_size
    }
}

/// Snapshot of cache-wide counters, folded across shards.
///
/// All fields are cumulative since construction except `bytes_cached`,
/// `entries_cached`, and `regions_cached`, which are occupancy gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub bytes_written: u64,
    pub entries_written: u64,
    pub bytes_read: u64,
    pub entries_read: u64,
    pub bytes_cached: u64,
    pub entries_cached: u64,
    pub regions_cached: u64,
    pub regions_evicted: u64,
    pub entries_aged_out: u64,
    pub checkpoints_written: u64,
    pub write_errors: u64,
    pub read_errors: u64,
    pub checkpoint_errors: u64,
    pub corrupt_entries: u64,
}
