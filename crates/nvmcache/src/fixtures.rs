//! Test fixtures shared by unit and integration tests.

use nvmcache_types::{CacheKey, FileNum, Pin};

/// An owned, deterministic pin for tests.
#[derive(Debug, Clone)]
pub struct TestPin {
    key: CacheKey,
    data: Vec<u8>,
}

impl TestPin {
    /// A pin with explicit payload bytes.
    #[must_use]
    pub fn new(file: u64, offset: u64, data: Vec<u8>) -> Self {
        Self {
            key: CacheKey::new(FileNum::new(file), offset),
            data,
        }
    }

    /// A pin of `size` bytes whose payload is derived from its key, so two
    /// fixtures with the same key always carry identical bytes.
    #[must_use]
    pub fn patterned(file: u64, offset: u64, size: usize) -> Self {
        let data = (0..size)
            .map(|i| (file ^ offset ^ i as u64 ^ (i as u64 >> 8)) as u8)
            .collect();
        Self::new(file, offset, data)
    }
}

impl Pin for TestPin {
    fn key(&self) -> CacheKey {
        self.key
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Box a list of `(file, offset, size)` specs into a pin batch.
#[must_use]
pub fn pin_batch(specs: &[(u64, u64, usize)]) -> Vec<Box<dyn Pin>> {
    specs
        .iter()
        .map(|&(file, offset, size)| Box::new(TestPin::patterned(file, offset, size)) as Box<dyn Pin>)
        .collect()
}
