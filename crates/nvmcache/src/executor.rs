//! Task-submission seam.
//!
//! The cache never owns threads; shard write batches are handed to an
//! external [`Executor`]. Production wires in a rayon pool, tests mostly use
//! [`InlineExecutor`] so batches complete before the call returns.

use nvmcache_error::{CacheError, Result};

/// A "submit task" capability.
///
/// Implementations must eventually run every submitted task; the cache's
/// shutdown path spins until in-flight tasks have drained.
pub trait Executor: Send + Sync {
    /// Submit a task for execution.
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs tasks synchronously on the submitting thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// A rayon-backed thread pool executor.
pub struct ThreadPoolExecutor {
    pool: rayon::ThreadPool,
}

impl ThreadPoolExecutor {
    /// Build a pool with `num_threads` workers.
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("nvmcache-io-{i}"))
            .build()
            .map_err(|e| CacheError::config(format!("failed to build I/O pool: {e}")))?;
        Ok(Self { pool })
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self.pool.spawn(task);
    }
}
