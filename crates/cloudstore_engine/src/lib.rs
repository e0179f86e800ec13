//! # CloudStore Sync Engine
//!
//! Offline-first synchronization between a local backing cache and a
//! remote record store.
//!
//! This crate provides:
//! - Schema descriptors with relationship ownership rules
//! - Record/entity mapping and field-level diffing
//! - Three-way merge policies for concurrent edits
//! - A serial operation queue with bounded transient retries
//! - Pull and push reconcilers
//! - The [`SyncStore`] coordinator with account/zone bootstrap
//!
//! ## Architecture
//!
//! Local saves bump a per-record version. The push reconciler sends every
//! record whose version is ahead of its last confirmed version, as a diff
//! against the cached remote snapshot. The pull reconciler applies the
//! remote change feed from the stored change token and commits the new
//! token with the applied batch.
//!
//! ```rust,no_run
//! use cloudstore_codec::ScalarKind;
//! use cloudstore_engine::{AttributeDescriptor, EntityDescriptor, Schema, StoreConfig, SyncStore};
//! use cloudstore_protocol::DatabaseScope;
//! use cloudstore_server::{InMemoryRecordStore, ServerConfig};
//!
//! # async fn demo() -> cloudstore_engine::SyncResult<()> {
//! let schema = Schema::new(vec![EntityDescriptor::new("Note")
//!     .attribute(AttributeDescriptor::new("title", ScalarKind::String))])?;
//! let server = InMemoryRecordStore::new(ServerConfig::default());
//! let store = SyncStore::open(
//!     StoreConfig::new("iCloud.com.example", "Notes"),
//!     schema,
//!     server.connect(DatabaseScope::Private),
//! )?;
//!
//! store.save(|ctx| {
//!     let note = ctx.insert("Note")?;
//!     ctx.set(note, "title", "Groceries")
//! })?;
//! store.wait_idle().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Invariants
//!
//! - A record is dirty iff `version > cached_record_version` or `version == 0`
//! - The confirmed version only advances on a confirmed save or delete
//! - At most one pull and one push are in flight per store
//! - Network operations run one at a time
//! - Transient failures are retried at most [`RetryPolicy::limit`] times

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod coordinator;
mod error;
mod events;
mod graph;
mod mapper;
mod merge;
mod pull;
mod push;
mod queue;
mod resolver;
mod schema;

pub use config::{
    store_path, MergePolicy, RetryPolicy, StoreConfig, JOURNAL_EXTENSION, LOCAL_ACCOUNT_DIR,
};
pub use context::SaveContext;
pub use coordinator::{Availability, SyncStore};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, StoreEvent, DEFAULT_EVENT_CAPACITY};
pub use mapper::{
    DecodedRecord, DecodedRelation, FieldChange, RecordDiff, RecordIndex, RecordMapper, RecordRef,
};
pub use merge::merge_records;
pub use pull::{PullReconciler, PullReport, PullSession};
pub use push::{PushReconciler, PushReport};
pub use queue::{Operation, OperationHandle, OperationQueue, OperationState};
pub use schema::{
    AttributeDescriptor, Cardinality, DeleteRule, EntityDescriptor, RelationshipDescriptor, Schema,
};
