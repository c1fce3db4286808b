//! Unix VFS implementation over POSIX positional I/O.
//!
//! Reads and writes go through `pread`/`pwrite` (`std::os::unix::fs::FileExt`)
//! so concurrent readers never contend on a file cursor. Batched cache writes
//! use `pwritev` via the `nix` crate. On Linux, [`VfsFile::disable_cow`] sets
//! `FS_NOCOW_FL` so copy-on-write filesystems (btrfs) do not fragment the
//! large, frequently-rewritten data files.

use std::fs::{File, OpenOptions};
use std::io::IoSlice;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use nvmcache_error::{CacheError, Result};

use crate::traits::{OpenMode, SyncMode, Vfs, VfsFile};

/// VFS backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixVfs;

impl UnixVfs {
    /// Create the Unix VFS.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Vfs for UnixVfs {
    type File = UnixFile;

    fn name(&self) -> &'static str {
        "unix"
    }

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::File> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if mode == OpenMode::CreateReadWrite {
            options.create(true);
        }
        let file = options.open(path).map_err(CacheError::Io)?;
        Ok(UnixFile {
            file,
            path: path.to_path_buf(),
        })
    }

    fn delete(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).map_err(CacheError::Io)
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.exists())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(CacheError::Io)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to).map_err(CacheError::Io)
    }
}

/// A file handle on the local filesystem.
#[derive(Debug)]
pub struct UnixFile {
    file: File,
    path: PathBuf,
}

impl UnixFile {
    /// The path this handle was opened with.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VfsFile for UnixFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(CacheError::Io(e)),
            }
        }
        if filled < buf.len() {
            buf[filled..].fill(0);
        }
        Ok(filled)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset).map_err(CacheError::Io)
    }

    fn write_vectored_at(&self, bufs: &[&[u8]], offset: u64) -> Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut written = 0usize;
        while written < total {
            // Rebuild the iovec array past the bytes already written; partial
            // pwritev can land mid-slice.
            let mut skip = written;
            let mut iov: Vec<IoSlice<'_>> = Vec::with_capacity(bufs.len());
            for buf in bufs {
                if skip >= buf.len() {
                    skip -= buf.len();
                    continue;
                }
                iov.push(IoSlice::new(&buf[skip..]));
                skip = 0;
            }
            if iov.is_empty() {
                break;
            }
            let off = i64::try_from(offset + written as u64)
                .map_err(|_| CacheError::internal("file offset exceeds i64"))?;
            match nix::sys::uio::pwritev(&self.file, &iov, off) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(CacheError::Io(e.into())),
            }
        }
        Ok(())
    }

    fn set_len(&self, size: u64) -> Result<()> {
        self.file.set_len(size).map_err(CacheError::Io)
    }

    fn sync(&self, mode: SyncMode) -> Result<()> {
        match mode {
            SyncMode::Data => self.file.sync_data().map_err(CacheError::Io),
            SyncMode::All => self.file.sync_all().map_err(CacheError::Io),
        }
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata().map_err(CacheError::Io)?.len())
    }

    #[cfg(target_os = "linux")]
    fn disable_cow(&self) -> Result<()> {
        use std::os::fd::AsRawFd;

        use tracing::debug;

        // Not exposed by the `libc` crate; value matches <linux/fs.h> FS_NOCOW_FL.
        const FS_NOCOW_FL: libc::c_long = 0x0080_0000;

        let fd = self.file.as_raw_fd();
        let mut flags: libc::c_long = 0;
        // SAFETY: FS_IOC_GETFLAGS/SETFLAGS read and write a c_long owned by
        // this stack frame; the fd is valid for the lifetime of `self.file`.
        let rc = unsafe { libc::ioctl(fd, libc::FS_IOC_GETFLAGS, &mut flags) };
        if rc != 0 {
            return Err(CacheError::Io(std::io::Error::last_os_error()));
        }
        flags |= FS_NOCOW_FL;
        let rc = unsafe { libc::ioctl(fd, libc::FS_IOC_SETFLAGS, &flags) };
        if rc != 0 {
            return Err(CacheError::Io(std::io::Error::last_os_error()));
        }
        debug!(path = %self.path.display(), "copy-on-write disabled");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn disable_cow(&self) -> Result<()> {
        Err(CacheError::Unsupported("disable_cow"))
    }
}
