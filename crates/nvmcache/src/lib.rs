//! NvmCache: a sharded, persistent second-level cache.
//!
//! Backs an in-memory buffer pool with a pool of fixed-size local files on
//! fast block storage. Batches of evicted buffers ("pins") are appended to
//! large contiguous regions inside per-shard data files, indexed by
//! `(file_num, offset)` fingerprint for later positional reads, and
//! recovered across restarts from per-shard checkpoint files.
//!
//! The cache is a hint store: any entry may disappear on crash, individual
//! writes are never fsynced, and data loss surfaces to callers only as
//! misses.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nvmcache::{CacheConfig, InlineExecutor, NvmCache};
//! use nvmcache_vfs::UnixVfs;
//!
//! # fn main() -> nvmcache::Result<()> {
//! let config = CacheConfig::new("/var/cache/query/ssd", 16 << 30, 8);
//! let cache = NvmCache::new(&config, UnixVfs::new(), Arc::new(InlineExecutor))?;
//! if cache.start_write() {
//!     cache.write(Vec::new());
//! }
//! cache.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod checkpoint;
pub mod executor;
pub mod fixtures;
pub mod group_stats;
pub mod index;
pub mod region;
pub mod shard;

pub use cache::NvmCache;
pub use executor::{Executor, InlineExecutor, ThreadPoolExecutor};
pub use group_stats::{GroupOp, GroupStats};
pub use nvmcache_error::{CacheError, Result};
pub use nvmcache_types::{
    CacheConfig, CacheKey, CacheStats, EntrySlot, FileNum, Pin, ReadOutcome,
};
pub use shard::{ShardFile, ShardOptions};
