//! Typed errors reported by the remote record store.

use crate::record::Record;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Classification of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorCode {
    /// No network connection.
    NetworkUnavailable,
    /// The connection dropped or timed out.
    NetworkFailure,
    /// The service is temporarily down.
    ServiceUnavailable,
    /// Too many requests; honour `retry_after`.
    RequestRateLimited,
    /// No authenticated account.
    NotAuthenticated,
    /// The record changed on the server since the given change tag.
    ServerRecordChanged,
    /// The zone does not exist.
    ZoneNotFound,
    /// The record or subscription does not exist.
    UnknownItem,
    /// The request was malformed.
    InvalidArguments,
    /// The account may not perform this operation.
    PermissionFailure,
    /// Some items of a batch failed; see the per-record outcomes.
    PartialFailure,
    /// The account is out of storage.
    QuotaExceeded,
    /// Unexpected server error.
    InternalError,
}

impl RemoteErrorCode {
    /// Returns true for failures worth retrying unchanged after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteErrorCode::NetworkUnavailable
                | RemoteErrorCode::NetworkFailure
                | RemoteErrorCode::ServiceUnavailable
                | RemoteErrorCode::RequestRateLimited
                | RemoteErrorCode::NotAuthenticated
        )
    }
}

impl fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteErrorCode::NetworkUnavailable => "network unavailable",
            RemoteErrorCode::NetworkFailure => "network failure",
            RemoteErrorCode::ServiceUnavailable => "service unavailable",
            RemoteErrorCode::RequestRateLimited => "request rate limited",
            RemoteErrorCode::NotAuthenticated => "not authenticated",
            RemoteErrorCode::ServerRecordChanged => "server record changed",
            RemoteErrorCode::ZoneNotFound => "zone not found",
            RemoteErrorCode::UnknownItem => "unknown item",
            RemoteErrorCode::InvalidArguments => "invalid arguments",
            RemoteErrorCode::PermissionFailure => "permission failure",
            RemoteErrorCode::PartialFailure => "partial failure",
            RemoteErrorCode::QuotaExceeded => "quota exceeded",
            RemoteErrorCode::InternalError => "internal error",
        };
        f.write_str(name)
    }
}

/// An error returned by the remote store.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct RemoteError {
    /// Failure class.
    pub code: RemoteErrorCode,
    /// Human readable detail.
    pub message: String,
    /// Server-suggested delay before retrying.
    pub retry_after: Option<Duration>,
    /// Current server copy of the record, for `ServerRecordChanged`.
    pub server_record: Option<Box<Record>>,
}

impl RemoteError {
    /// Creates an error with the given code.
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
            server_record: None,
        }
    }

    /// Creates a version conflict error carrying the server's record.
    pub fn server_record_changed(server_record: Record) -> Self {
        let message = format!("record {} changed on server", server_record.record_id);
        Self {
            code: RemoteErrorCode::ServerRecordChanged,
            message,
            retry_after: None,
            server_record: Some(Box::new(server_record)),
        }
    }

    /// Sets the retry delay.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Returns true if the failure is transient.
    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }

    /// Returns true for a version conflict.
    pub fn is_conflict(&self) -> bool {
        self.code == RemoteErrorCode::ServerRecordChanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{RecordId, ZoneId};

    #[test]
    fn transient_codes() {
        let transient = [
            RemoteErrorCode::NetworkUnavailable,
            RemoteErrorCode::NetworkFailure,
            RemoteErrorCode::ServiceUnavailable,
            RemoteErrorCode::RequestRateLimited,
            RemoteErrorCode::NotAuthenticated,
        ];
        for code in transient {
            assert!(code.is_transient(), "{code}");
        }

        let permanent = [
            RemoteErrorCode::ServerRecordChanged,
            RemoteErrorCode::ZoneNotFound,
            RemoteErrorCode::UnknownItem,
            RemoteErrorCode::InvalidArguments,
            RemoteErrorCode::PermissionFailure,
            RemoteErrorCode::PartialFailure,
            RemoteErrorCode::QuotaExceeded,
            RemoteErrorCode::InternalError,
        ];
        for code in permanent {
            assert!(!code.is_transient(), "{code}");
        }
    }

    #[test]
    fn conflict_carries_record() {
        let record = Record::new("T", RecordId::new("r1", ZoneId::new("Z")));
        let err = RemoteError::server_record_changed(record.clone());
        assert!(err.is_conflict());
        assert!(!err.is_transient());
        assert_eq!(err.server_record.as_deref(), Some(&record));
        assert_eq!(err.to_string(), "server record changed: record r1 changed on server");
    }

    #[test]
    fn retry_after() {
        let err = RemoteError::new(RemoteErrorCode::RequestRateLimited, "slow down")
            .with_retry_after(Duration::from_secs(7));
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
    }
}
