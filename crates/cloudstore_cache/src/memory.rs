//! In-memory journal backend.

use crate::backend::JournalBackend;
use crate::error::{CacheError, CacheResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// A journal kept in memory.
///
/// Clones share the same bytes, so a test can keep one handle, drop the
/// cache, and reopen a new cache from the same journal.
///
/// ```rust
/// use cloudstore_cache::{JournalBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let offset = backend.append(b"frame").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(backend.size().unwrap(), 5);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with pre-existing bytes.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl JournalBackend for InMemoryBackend {
    fn read_all(&self) -> CacheResult<Vec<u8>> {
        Ok(self.data.read().clone())
    }

    fn append(&mut self, new_data: &[u8]) -> CacheResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn sync(&mut self) -> CacheResult<()> {
        Ok(())
    }

    fn size(&self) -> CacheResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> CacheResult<()> {
        let mut data = self.data.write();
        let new_len = usize::try_from(new_size)
            .map_err(|_| CacheError::corrupted("truncate size out of range"))?;
        if new_len > data.len() {
            return Err(CacheError::corrupted(format!(
                "cannot truncate to {new_size} bytes, journal holds {}",
                data.len()
            )));
        }
        data.truncate(new_len);
        Ok(())
    }
}
