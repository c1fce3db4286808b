//! In-memory VFS for tests.
//!
//! Files are named byte vectors in a shared registry; multiple handles to
//! the same path share storage, so a "reopened" cache sees what the previous
//! instance wrote. Nothing survives the [`MemoryVfs`] value itself, which is
//! exactly the crash model the recovery tests want.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nvmcache_error::{CacheError, Result};
use parking_lot::Mutex;

use crate::traits::{OpenMode, SyncMode, Vfs, VfsFile};

#[derive(Debug, Default)]
struct Registry {
    files: HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>,
}

/// An in-memory VFS.
///
/// Cloning shares the registry, so clones observe the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryVfs {
    inner: Arc<Mutex<Registry>>,
}

impl MemoryVfs {
    /// Create a new empty in-memory VFS.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::File> {
        let mut inner = self.inner.lock();
        let storage = match inner.files.get(path) {
            Some(existing) => Arc::clone(existing),
            None if mode == OpenMode::CreateReadWrite => {
                let storage = Arc::new(Mutex::new(Vec::new()));
                inner.files.insert(path.to_path_buf(), Arc::clone(&storage));
                storage
            }
            None => {
                return Err(CacheError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no such file: {}", path.display()),
                )));
            }
        };
        Ok(MemoryFile { storage })
    }

    fn delete(&self, path: &Path) -> Result<()> {
        if self.inner.lock().files.remove(path).is_none() {
            return Err(CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            )));
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.inner.lock().files.contains_key(path))
    }

    fn create_dir_all(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        let storage = inner.files.remove(from).ok_or_else(|| {
            CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {}", from.display()),
            ))
        })?;
        inner.files.insert(to.to_path_buf(), storage);
        Ok(())
    }
}

/// A file handle in the memory VFS.
#[derive(Debug)]
pub struct MemoryFile {
    storage: Arc<Mutex<Vec<u8>>>,
}

impl MemoryFile {
    fn write_span(data: &mut Vec<u8>, buf: &[u8], offset: usize) {
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
    }
}

impl VfsFile for MemoryFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.storage.lock();
        let offset = usize::try_from(offset)
            .map_err(|_| CacheError::internal("offset exceeds usize"))?;
        if offset >= data.len() {
            buf.fill(0);
            return Ok(0);
        }
        let available = data.len() - offset;
        let to_read = buf.len().min(available);
        buf[..to_read].copy_from_slice(&data[offset..offset + to_read]);
        if to_read < buf.len() {
            buf[to_read..].fill(0);
        }
        Ok(to_read)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let offset = usize::try_from(offset)
            .map_err(|_| CacheError::internal("offset exceeds usize"))?;
        Self::write_span(&mut self.storage.lock(), buf, offset);
        Ok(())
    }

    fn write_vectored_at(&self, bufs: &[&[u8]], offset: u64) -> Result<()> {
        let mut offset = usize::try_from(offset)
            .map_err(|_| CacheError::internal("offset exceeds usize"))?;
        let mut data = self.storage.lock();
        for buf in bufs {
            Self::write_span(&mut data, buf, offset);
            offset += buf.len();
        }
        Ok(())
    }

    fn set_len(&self, size: u64) -> Result<()> {
        let size = usize::try_from(size)
            .map_err(|_| CacheError::internal("size exceeds usize"))?;
        self.storage.lock().resize(size, 0);
        Ok(())
    }

    fn sync(&self, _mode: SyncMode) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.storage.lock().len() as u64)
    }
}
