//! # Cloudstore Cache
//!
//! The local backing cache of the sync engine.
//!
//! It stores three kinds of rows:
//!
//! - [`LocalRecord`]: the sync state of one remote record (version
//!   counters and the cached remote snapshot)
//! - [`EntityRow`]: one domain entity instance, owned by exactly one
//!   local record
//! - [`SyncMetadata`]: store identity and the change-feed token
//!
//! All writes go through [`BackingCache::transaction`], are appended to a
//! CRC-framed journal before they become visible, and are announced as a
//! [`CommitNotice`].
//!
//! ## Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral stores
//! - [`FileBackend`] - Journal file on disk
//!
//! ```rust
//! use cloudstore_cache::{BackingCache, CacheError, CommitOrigin, SyncMetadata};
//! use cloudstore_protocol::ZoneId;
//!
//! let cache = BackingCache::open_in_memory().unwrap();
//! cache
//!     .transaction(CommitOrigin::Maintenance, |txn| {
//!         txn.set_metadata(SyncMetadata::new(ZoneId::new("Notes")));
//!         Ok::<_, CacheError>(())
//!     })
//!     .unwrap();
//! assert!(cache.metadata().unwrap().change_token.is_none());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod cache;
mod error;
mod feed;
mod file;
mod journal;
mod memory;
mod model;

pub use backend::JournalBackend;
pub use cache::{BackingCache, CacheTransaction};
pub use error::{CacheError, CacheResult};
pub use feed::{ChangeFeed, CommitNotice, CommitOrigin};
pub use file::FileBackend;
pub use journal::{
    compute_crc32, decode_frames, encode_frame, CommitFrame, Journal, JournalOp, JOURNAL_MAGIC,
    JOURNAL_VERSION,
};
pub use memory::InMemoryBackend;
pub use model::{EntityRow, LocalRecord, RelationValue, RowId, SyncMetadata};
