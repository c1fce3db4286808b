use std::path::Path;

use nvmcache_error::Result;

/// How a file should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open read-write, creating the file if it does not exist.
    CreateReadWrite,
    /// Open read-write; fail if the file does not exist.
    MustExist,
}

/// What a sync call must make durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// File contents only (`fdatasync`).
    Data,
    /// Contents and metadata (`fsync`).
    All,
}

/// A filesystem implementation.
///
/// Abstracts the file operations the cache performs so tests can run against
/// in-memory storage and production against local files. The cache only ever
/// touches absolute local paths.
pub trait Vfs: Send + Sync {
    /// The file handle type produced by this VFS.
    type File: VfsFile;

    /// The name of this VFS (e.g. "unix", "memory").
    fn name(&self) -> &'static str;

    /// Open a file at `path`.
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::File>;

    /// Delete the file at `path`. Deleting a missing file is an error.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Whether a file exists at `path`.
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Create `path` and any missing parent directories.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Atomically replace `to` with `from`.
    ///
    /// Used to install checkpoints: on filesystems without atomic rename the
    /// worst case is a missing checkpoint after a crash, which the cache
    /// treats as starting empty.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
}

/// An open file handle.
///
/// All methods take `&self`: positional I/O carries no cursor, and the cache
/// issues concurrent reads against a shard file while a writer appends.
pub trait VfsFile: Send + Sync {
    /// Read up to `buf.len()` bytes starting at byte `offset`.
    ///
    /// Returns the number of bytes actually read; on a short read the
    /// remainder of `buf` is zero-filled.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write all of `buf` starting at byte `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Write the concatenation of `bufs` starting at byte `offset`.
    ///
    /// Equivalent to a sequence of [`VfsFile::write_at`] calls but allows
    /// the implementation to issue a single vectored syscall.
    fn write_vectored_at(&self, bufs: &[&[u8]], offset: u64) -> Result<()>;

    /// Truncate or extend the file to `size` bytes. Extension is sparse
    /// where the filesystem supports it.
    fn set_len(&self, size: u64) -> Result<()>;

    /// Flush file state to stable storage.
    fn sync(&self, mode: SyncMode) -> Result<()>;

    /// Current file size in bytes.
    fn file_size(&self) -> Result<u64>;

    /// Ask the filesystem to exempt this file from copy-on-write semantics.
    ///
    /// Advisory: implementations without the concept report
    /// [`nvmcache_error::CacheError::Unsupported`], which callers log and
    /// ignore.
    fn disable_cow(&self) -> Result<()> {
        Err(nvmcache_error::CacheError::Unsupported("disable_cow"))
    }
}
