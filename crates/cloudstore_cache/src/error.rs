//! Error types for cache operations.

use cloudstore_codec::CodecError;
use std::io;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur while reading, writing or replaying the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A journal frame failed its checksum.
    #[error("journal checksum mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Offset of the bad frame.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// The journal is corrupted.
    #[error("journal corrupted: {0}")]
    Corrupted(String),

    /// A frame payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A write referenced a row that does not exist.
    #[error("entity row {0} not found")]
    RowNotFound(u64),

    /// A write referenced a local record that does not exist.
    #[error("local record {0} not found")]
    RecordNotFound(String),
}

impl CacheError {
    /// Create a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
