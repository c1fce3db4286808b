//! Shard checkpoint serialization.
//!
//! The on-disk layout (all integers little-endian):
//!
//! ```text
//! Offset  Size  Description
//!   0       4   Magic "SSDC"
//!   4       4   Format version (currently 1)
//!   8       4   Shard id
//!  12       4   Region count
//!  16       8   Region size in bytes
//!  24     17*R  Region records: used (u64), score (f64), state (u8)
//!   ..      8   Entry count
//!   ..    36*E  Entry records: file_num (u64), offset (u64), length (u32),
//!               region (u32), offset_in_region (u32), checksum (u64)
//!  eof-4    4   CRC-32C over bytes [0, eof-4)
//! ```
//!
//! Anything that fails to verify (magic, version, CRC, structural bounds)
//! discards the whole file: a checkpoint is a hint, and starting empty is
//! always safe.

use nvmcache_error::{CacheError, Result};

/// Magic bytes at offset 0.
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"SSDC";

/// Current format version.
pub const CHECKPOINT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 24;
const REGION_RECORD_SIZE: usize = 17;
const ENTRY_RECORD_SIZE: usize = 36;
const TRAILER_SIZE: usize = 4;

/// Region state byte: no live data.
pub const REGION_STATE_EMPTY: u8 = 0;
/// Region state byte: holds indexed payloads.
pub const REGION_STATE_FULL: u8 = 1;

/// One region's checkpointed state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionRecord {
    pub used: u64,
    pub score: f64,
    pub state: u8,
}

/// One entry's checkpointed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRecord {
    pub file_num: u64,
    pub offset: u64,
    pub length: u32,
    pub region: u32,
    pub offset_in_region: u32,
    pub checksum: u64,
}

/// A complete shard snapshot, ready to encode or freshly decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSnapshot {
    pub shard_id: u32,
    pub region_size: u64,
    pub regions: Vec<RegionRecord>,
    pub entries: Vec<EntryRecord>,
}

impl CheckpointSnapshot {
    /// Serialize to the on-disk format, CRC trailer included.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let size = HEADER_SIZE
            + self.regions.len() * REGION_RECORD_SIZE
            + 8
            + self.entries.len() * ENTRY_RECORD_SIZE
            + TRAILER_SIZE;
        let mut buf = Vec::with_capacity(size);

        buf.extend_from_slice(&CHECKPOINT_MAGIC);
        buf.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.shard_id.to_le_bytes());
        buf.extend_from_slice(&(self.regions.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.region_size.to_le_bytes());

        for region in &self.regions {
            buf.extend_from_slice(&region.used.to_le_bytes());
            buf.extend_from_slice(&region.score.to_le_bytes());
            buf.push(region.state);
        }

        buf.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.file_num.to_le_bytes());
            buf.extend_from_slice(&entry.offset.to_le_bytes());
            buf.extend_from_slice(&entry.length.to_le_bytes());
            buf.extend_from_slice(&entry.region.to_le_bytes());
            buf.extend_from_slice(&entry.offset_in_region.to_le_bytes());
            buf.extend_from_slice(&entry.checksum.to_le_bytes());
        }

        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse and verify a checkpoint file.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + 8 + TRAILER_SIZE {
            return Err(CacheError::corrupt_checkpoint(format!(
                "file too small: {} bytes",
                bytes.len()
            )));
        }

        let body_end = bytes.len() - TRAILER_SIZE;
        let stored_crc = u32::from_le_bytes(bytes[body_end..].try_into().expect("4 bytes"));
        let computed_crc = crc32c::crc32c(&bytes[..body_end]);
        if stored_crc != computed_crc {
            return Err(CacheError::corrupt_checkpoint(format!(
                "crc mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
            )));
        }

        let mut cursor = Cursor::new(&bytes[..body_end]);
        let magic = cursor.take::<4>()?;
        if magic != CHECKPOINT_MAGIC {
            return Err(CacheError::corrupt_checkpoint(format!(
                "bad magic: {magic:02x?}"
            )));
        }
        let version = cursor.u32()?;
        if version != CHECKPOINT_VERSION {
            return Err(CacheError::corrupt_checkpoint(format!(
                "unsupported version {version} (expected {CHECKPOINT_VERSION})"
            )));
        }

        let shard_id = cursor.u32()?;
        let region_count = cursor.u32()? as usize;
        let region_size = cursor.u64()?;

        let mut regions = Vec::with_capacity(region_count);
        for i in 0..region_count {
            let used = cursor.u64()?;
            let score = f64::from_le_bytes(cursor.take::<8>()?);
            let state = cursor.u8()?;
            if state != REGION_STATE_EMPTY && state != REGION_STATE_FULL {
                return Err(CacheError::corrupt_checkpoint(format!(
                    "region {i}: invalid state byte {state}"
                )));
            }
            if used > region_size {
                return Err(CacheError::corrupt_checkpoint(format!(
                    "region {i}: used {used} exceeds region size {region_size}"
                )));
            }
            regions.push(RegionRecord { used, score, state });
        }

        let entry_count = cursor.u64()?;
        let entry_count = usize::try_from(entry_count)
            .map_err(|_| CacheError::corrupt_checkpoint("entry count exceeds usize"))?;
        if cursor.remaining() != entry_count * ENTRY_RECORD_SIZE {
            return Err(CacheError::corrupt_checkpoint(format!(
                "entry section length {} does not match entry count {entry_count}",
                cursor.remaining()
            )));
        }

        let mut entries = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let entry = EntryRecord {
                file_num: cursor.u64()?,
                offset: cursor.u64()?,
                length: cursor.u32()?,
                region: cursor.u32()?,
                offset_in_region: cursor.u32()?,
                checksum: cursor.u64()?,
            };
            let region = entry.region as usize;
            if region >= region_count {
                return Err(CacheError::corrupt_checkpoint(format!(
                    "entry {i}: region {region} out of range"
                )));
            }
            let span_end = u64::from(entry.offset_in_region) + u64::from(entry.length);
            if span_end > regions[region].used {
                return Err(CacheError::corrupt_checkpoint(format!(
                    "entry {i}: span ends at {span_end}, region used is {}",
                    regions[region].used
                )));
            }
            entries.push(entry);
        }

        Ok(Self {
            shard_id,
            region_size,
            regions,
            entries,
        })
    }
}

/// Bounds-checked little-endian reader.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.remaining() < N {
            return Err(CacheError::corrupt_checkpoint(format!(
                "truncated at byte {}",
                self.pos
            )));
        }
        let out: [u8; N] = self.bytes[self.pos..self.pos + N]
            .try_into()
            .expect("length checked");
        self.pos += N;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take::<8>()?))
    }
}
