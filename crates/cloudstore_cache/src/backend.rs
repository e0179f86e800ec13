//! Journal backend trait definition.

use crate::error::CacheResult;

/// Byte store holding the commit journal.
///
/// Backends are opaque append-only byte stores; the journal owns the frame
/// format.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_all` returns exactly the bytes previously appended
/// - `sync` makes all appended data durable
pub trait JournalBackend: Send + Sync {
    /// Reads the whole journal.
    fn read_all(&self) -> CacheResult<Vec<u8>>;

    /// Appends data to the end of the journal, returning its offset.
    fn append(&mut self, data: &[u8]) -> CacheResult<u64>;

    /// Makes all appended data durable.
    fn sync(&mut self) -> CacheResult<()>;

    /// Returns the current size in bytes.
    fn size(&self) -> CacheResult<u64>;

    /// Drops everything after `new_size`; used to cut a torn tail.
    fn truncate(&mut self, new_size: u64) -> CacheResult<()>;
}
