//! # Cloudstore Server
//!
//! In-memory reference implementation of the remote record store.
//!
//! This crate provides:
//! - Zones with a paginated, collapsing change feed
//! - Optimistic concurrency through server-assigned change tags
//! - Per-record modify outcomes (a batch is never rolled back)
//! - Zone subscriptions with change notifications
//! - Per-device fault injection (reachability, account status, queued errors)
//!
//! It backs the engine's tests and the `cloudstore` CLI simulator.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod server;
mod zone_log;

pub use config::ServerConfig;
pub use server::{InMemoryRecordStore, RecordStoreClient};
pub use zone_log::ZoneLog;
