//! End-to-end cache scenarios against the in-memory VFS.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use nvmcache::checkpoint::CheckpointSnapshot;
use nvmcache::fixtures::{pin_batch, TestPin};
use nvmcache::{
    CacheConfig, CacheKey, FileNum, InlineExecutor, NvmCache, Pin, ReadOutcome,
};
use nvmcache_vfs::{MemoryVfs, OpenMode, Vfs, VfsFile};

const REGION: u64 = 64 * 1024;

fn config(num_shards: u32, max_bytes: u64) -> CacheConfig {
    let mut cfg = CacheConfig::new("/cache/shard", max_bytes, num_shards);
    cfg.region_size = REGION;
    cfg
}

fn open(vfs: &MemoryVfs, cfg: &CacheConfig) -> NvmCache<MemoryVfs> {
    NvmCache::new(cfg, vfs.clone(), Arc::new(InlineExecutor)).unwrap()
}

fn write_batch(cache: &NvmCache<MemoryVfs>, pins: Vec<Box<dyn Pin>>) {
    assert!(cache.start_write());
    cache.write(pins);
}

#[test]
fn single_pin_lands_on_its_routing_shard() {
    // S1: one 1 KiB pin for file 17 in a two-shard cache.
    let vfs = MemoryVfs::new();
    let cache = open(&vfs, &config(2, 4 * REGION));
    write_batch(&cache, pin_batch(&[(17, 0, 1024)]));

    let key = CacheKey::new(FileNum::new(17), 0);
    let mut buf = vec![0u8; 1024];
    let shard = cache.file(FileNum::new(17));
    assert_eq!(shard.shard_id(), 17 % 2);
    assert_eq!(shard.read_into(key, &mut buf).unwrap(), ReadOutcome::Hit);
    assert_eq!(buf, TestPin::patterned(17, 0, 1024).bytes());

    // The other shard never saw the fingerprint.
    let other = cache.file(FileNum::new(16));
    assert_eq!(other.read_into(key, &mut buf).unwrap(), ReadOutcome::Miss);
}

#[test]
fn crossing_checkpoint_threshold_writes_checkpoint_file() {
    // S2: 1 MiB cache-wide interval over four shards; 1.5 MiB of pins to
    // shard 0 crosses the per-shard threshold.
    let vfs = MemoryVfs::new();
    let mut cfg = config(4, 64 * REGION);
    cfg.checkpoint_interval_bytes = 1 << 20;
    let cache = open(&vfs, &cfg);

    let pin_size = 32 * 1024;
    for i in 0..48u64 {
        // file 4: routes to shard 0.
        write_batch(&cache, pin_batch(&[(4, i * pin_size as u64, pin_size)]));
    }

    let cp_path = Path::new("/cache/shard0.cp");
    assert!(vfs.exists(cp_path).unwrap());

    let file = vfs.open(cp_path, OpenMode::MustExist).unwrap();
    let mut bytes = vec![0u8; file.file_size().unwrap() as usize];
    file.read_at(&mut bytes, 0).unwrap();
    let snapshot = CheckpointSnapshot::decode(&bytes).unwrap();
    assert_eq!(snapshot.shard_id, 0);
    assert!(!snapshot.entries.is_empty());
}

#[test]
fn overflow_evicts_exactly_one_region() {
    // S3: a shard holding two regions absorbs three region-sized batches.
    let vfs = MemoryVfs::new();
    let cache = open(&vfs, &config(2, 4 * REGION));
    for i in 0..3u64 {
        // file numbers 0, 2, 4: all route to shard 0.
        write_batch(&cache, pin_batch(&[(i * 2, 0, REGION as usize)]));
    }

    let stats = cache.stats();
    assert_eq!(stats.regions_evicted, 1);
    assert!(stats.bytes_cached <= 2 * REGION);

    // The first batch was the eviction victim; its fingerprint is gone.
    let mut buf = vec![0u8; REGION as usize];
    assert_eq!(
        cache
            .file(FileNum::new(0))
            .read_into(CacheKey::new(FileNum::new(0), 0), &mut buf)
            .unwrap(),
        ReadOutcome::Miss
    );
    assert_eq!(
        cache
            .file(FileNum::new(4))
            .read_into(CacheKey::new(FileNum::new(4), 0), &mut buf)
            .unwrap(),
        ReadOutcome::Hit
    );
}

#[test]
fn purge_skips_files_with_reader_pins() {
    // S6: a purge racing an in-flight read retains the file, and a retry
    // after the reader releases clears it.
    let vfs = MemoryVfs::new();
    let cache = open(&vfs, &config(2, 4 * REGION));
    write_batch(&cache, pin_batch(&[(42, 0, 2048)]));

    let shard = cache.file(FileNum::new(42));
    let slot = shard
        .testing_lookup(CacheKey::new(FileNum::new(42), 0))
        .unwrap();
    let files: HashSet<FileNum> = [FileNum::new(42)].into_iter().collect();
    let mut retained = HashSet::new();

    {
        let _reader = shard.testing_pin_region(slot.region);
        assert!(cache.remove_file_entries(&files, &mut retained));
        assert!(retained.contains(&FileNum::new(42)));
        assert!(shard
            .testing_lookup(CacheKey::new(FileNum::new(42), 0))
            .is_some());
    }

    retained.clear();
    assert!(cache.remove_file_entries(&files, &mut retained));
    assert!(retained.is_empty());
    assert!(shard
        .testing_lookup(CacheKey::new(FileNum::new(42), 0))
        .is_none());
}

#[test]
fn purge_of_evicted_entry_succeeds_without_retention() {
    let vfs = MemoryVfs::new();
    let cache = open(&vfs, &config(2, 4 * REGION));
    // Fill shard 0 past capacity so file 0's entry is evicted.
    for i in 0..3u64 {
        write_batch(&cache, pin_batch(&[(i * 2, 0, REGION as usize)]));
    }
    let mut buf = vec![0u8; REGION as usize];
    assert_eq!(
        cache
            .file(FileNum::new(0))
            .read_into(CacheKey::new(FileNum::new(0), 0), &mut buf)
            .unwrap(),
        ReadOutcome::Miss
    );

    let files: HashSet<FileNum> = [FileNum::new(0)].into_iter().collect();
    let mut retained = HashSet::new();
    assert!(cache.remove_file_entries(&files, &mut retained));
    assert!(retained.is_empty());
}

#[test]
fn capacity_rounds_up_to_shard_quantum() {
    let vfs = MemoryVfs::new();
    let cache = open(&vfs, &config(2, 1));
    assert_eq!(cache.max_bytes(), 2 * REGION);
}

#[test]
fn relative_prefix_is_rejected() {
    let cfg = CacheConfig::new("cache/shard", 1 << 20, 2);
    let err = NvmCache::new(&cfg, MemoryVfs::new(), Arc::new(InlineExecutor)).unwrap_err();
    assert!(err.to_string().contains("does not start with '/'"));
}

#[test]
fn clear_then_write_then_clear_leaves_nothing() {
    let vfs = MemoryVfs::new();
    let cache = open(&vfs, &config(2, 8 * REGION));
    cache.clear();
    write_batch(
        &cache,
        pin_batch(&[(1, 0, 4096), (2, 0, 4096), (3, 0, 4096)]),
    );
    cache.clear();

    let stats = cache.stats();
    assert_eq!(stats.bytes_cached, 0);
    assert_eq!(stats.entries_cached, 0);
}

#[test]
fn stats_fold_is_additive_across_shards() {
    let vfs = MemoryVfs::new();
    let cache = open(&vfs, &config(4, 16 * REGION));
    write_batch(
        &cache,
        pin_batch(&[(0, 0, 1000), (1, 0, 2000), (2, 0, 3000), (3, 0, 4000)]),
    );

    let stats = cache.stats();
    assert_eq!(stats.entries_written, 4);
    assert_eq!(stats.bytes_written, 10_000);
    assert_eq!(stats.entries_cached, 4);
}

#[test]
fn delete_files_removes_all_shards() {
    let vfs = MemoryVfs::new();
    let cache = open(&vfs, &config(2, 4 * REGION));
    write_batch(&cache, pin_batch(&[(1, 0, 512)]));
    cache.shutdown();
    cache.testing_delete_files();
    assert!(!vfs.exists(Path::new("/cache/shard0")).unwrap());
    assert!(!vfs.exists(Path::new("/cache/shard1")).unwrap());
    assert!(!vfs.exists(Path::new("/cache/shard0.cp")).unwrap());
    assert!(!vfs.exists(Path::new("/cache/shard1.cp")).unwrap());
}
