//! Error types for the sync engine.

use cloudstore_cache::{CacheError, RowId};
use cloudstore_codec::{CodecError, ScalarKind};
use cloudstore_protocol::RemoteError;
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Error reported by the remote record store.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Error from the local backing cache.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The configured zone cannot be used.
    #[error("invalid zone: {0}")]
    InvalidZone(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The backing cache could not be opened.
    #[error("unable to load backing store: {0}")]
    UnableToLoadBackingStore(String),

    /// The entity schema is inconsistent.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// No entity with this name is declared.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// The entity declares no attribute with this name.
    #[error("unknown attribute {attribute} on entity {entity}")]
    UnknownAttribute {
        /// Entity name.
        entity: String,
        /// Attribute name.
        attribute: String,
    },

    /// The entity declares no relationship with this name.
    #[error("unknown relationship {relationship} on entity {entity}")]
    UnknownRelationship {
        /// Entity name.
        entity: String,
        /// Relationship name.
        relationship: String,
    },

    /// A value cannot be stored in an attribute of the declared kind.
    #[error("cannot store {found} in {entity}.{attribute} of kind {expected}")]
    TypeMismatch {
        /// Entity name.
        entity: String,
        /// Attribute name.
        attribute: String,
        /// Declared kind.
        expected: ScalarKind,
        /// Kind of the rejected value.
        found: &'static str,
    },

    /// A relationship was pointed at a row of the wrong entity or shape.
    #[error("invalid target for {entity}.{relationship}: {message}")]
    InvalidRelationship {
        /// Entity name.
        entity: String,
        /// Relationship name.
        relationship: String,
        /// What was wrong.
        message: String,
    },

    /// The entity row does not exist.
    #[error("entity row not found: {0}")]
    RowNotFound(RowId),

    /// A local record with this name already exists.
    #[error("record {0} already exists")]
    DuplicateRecord(String),

    /// The store cannot currently talk to the remote store.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation queue stopped before the operation finished.
    #[error("operation queue closed")]
    QueueClosed,
}

impl SyncError {
    /// Creates an unknown attribute error.
    pub fn unknown_attribute(entity: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::UnknownAttribute {
            entity: entity.into(),
            attribute: attribute.into(),
        }
    }

    /// Creates an unknown relationship error.
    pub fn unknown_relationship(
        entity: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Self {
        Self::UnknownRelationship {
            entity: entity.into(),
            relationship: relationship.into(),
        }
    }

    /// Creates an invalid relationship error.
    pub fn invalid_relationship(
        entity: impl Into<String>,
        relationship: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidRelationship {
            entity: entity.into(),
            relationship: relationship.into(),
            message: message.into(),
        }
    }

    /// Returns true if the operation that failed should be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Remote(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns the delay the remote store asked for before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Remote(err) => err.retry_after,
            _ => None,
        }
    }

    /// Returns true for a record version conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Remote(err) if err.is_conflict())
    }
}
