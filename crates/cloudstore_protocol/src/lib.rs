//! # Cloudstore Protocol
//!
//! Data model and client contract of the remote record store.
//!
//! This crate provides:
//! - [`ZoneId`] / [`RecordId`] identifiers
//! - [`Record`] with scalar and reference fields
//! - The zone change feed ([`ChangeToken`], [`ZoneChangesPage`])
//! - Per-record modify outcomes ([`ModifyResult`])
//! - Typed remote errors with transient classification
//! - The [`RemoteDatabase`] trait every remote backend implements
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod account;
mod change_feed;
mod error;
mod ids;
mod record;
mod remote;

pub use account::{
    AccountStatus, DatabaseScope, RemoteNotification, Subscription, Zone,
    AUTO_UPDATE_SUBSCRIPTION_ID,
};
pub use change_feed::{ChangeToken, ZoneChange, ZoneChangesPage};
pub use error::{RemoteError, RemoteErrorCode, RemoteResult};
pub use ids::{RecordId, ZoneId, DEFAULT_OWNER_NAME};
pub use record::{FieldValue, Record};
pub use remote::{ModifyResult, RecordOutcome, RemoteDatabase};
