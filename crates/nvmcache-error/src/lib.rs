use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for NvmCache operations.
///
/// Structured variants for the cases callers branch on, free-form detail
/// strings where they don't. The cache is a hint store: most I/O failures
/// are logged and absorbed at the shard boundary rather than propagated,
/// so the variants here skew toward construction and format problems.
#[derive(Error, Debug)]
pub enum CacheError {
    // === Configuration ===
    /// Invalid construction parameters.
    #[error("invalid cache configuration: {detail}")]
    Config { detail: String },

    /// Cache file prefix does not name an absolute local path.
    #[error("cache path '{path}' does not start with '/'")]
    RelativePrefix { path: PathBuf },

    // === I/O ===
    /// Underlying file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Short read (fewer bytes than expected).
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    // === Format / integrity ===
    /// Cached payload failed checksum verification.
    #[error("corrupt cache entry: {detail}")]
    CorruptEntry { detail: String },

    /// Checkpoint file failed to parse or verify.
    #[error("corrupt checkpoint: {detail}")]
    CorruptCheckpoint { detail: String },

    // === Lifecycle ===
    /// Operation refused because the cache is shutting down.
    #[error("cache is shutting down")]
    ShuttingDown,

    /// Operation is not supported by the current backend.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }

    /// Create a corrupt-entry error.
    pub fn corrupt_entry(detail: impl Into<String>) -> Self {
        Self::CorruptEntry {
            detail: detail.into(),
        }
    }

    /// Create a corrupt-checkpoint error.
    pub fn corrupt_checkpoint(detail: impl Into<String>) -> Self {
        Self::CorruptCheckpoint {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error indicates damaged on-disk state.
    ///
    /// Corruption is never fatal to the cache: corrupt entries are erased
    /// and corrupt checkpoints are discarded, both downgrading to misses.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptEntry { .. } | Self::CorruptCheckpoint { .. }
        )
    }

    /// Whether the failure may succeed if the caller retries later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ShortRead { .. })
    }
}

/// Result type alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
