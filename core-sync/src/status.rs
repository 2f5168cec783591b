//! # Sync Status Codes
//!
//! Every asynchronous operation of the sync core completes with exactly one
//! [`SyncStatusCode`]. Callers branch on the code instead of on error types:
//!
//! - `Ok`, `NoChangeToSync`, `NoConflict`: success or nothing to do
//! - `Retry`: the caller should run the same operation again
//! - `Abort`: cancelled, not an error
//! - `NetworkError`, `ServiceTemporarilyUnavailable`: transient
//! - `AuthenticationFailed`, `AccessForbidden`: need re-authentication
//! - `DatabaseError*`: the local index cannot be trusted any more

use bridge_traits::{BridgeError, RemoteErrorCode};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatusCode {
    Ok,
    Unknown,
    Failed,
    Retry,
    Abort,
    NoChangeToSync,
    NoConflict,
    HasConflict,
    NetworkError,
    ServiceTemporarilyUnavailable,
    AuthenticationFailed,
    AccessForbidden,
    /// The change belongs to an app that is not registered or is disabled
    UnknownOrigin,
    FileErrorNotFound,
    FileErrorFailed,
    DatabaseErrorNotFound,
    DatabaseErrorCorruption,
    DatabaseErrorIoError,
    DatabaseErrorFailed,
}

impl SyncStatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "SYNC_STATUS_OK",
            Self::Unknown => "SYNC_STATUS_UNKNOWN",
            Self::Failed => "SYNC_STATUS_FAILED",
            Self::Retry => "SYNC_STATUS_RETRY",
            Self::Abort => "SYNC_STATUS_ABORT",
            Self::NoChangeToSync => "SYNC_STATUS_NO_CHANGE_TO_SYNC",
            Self::NoConflict => "SYNC_STATUS_NO_CONFLICT",
            Self::HasConflict => "SYNC_STATUS_HAS_CONFLICT",
            Self::NetworkError => "SYNC_STATUS_NETWORK_ERROR",
            Self::ServiceTemporarilyUnavailable => "SYNC_STATUS_SERVICE_TEMPORARILY_UNAVAILABLE",
            Self::AuthenticationFailed => "SYNC_STATUS_AUTHENTICATION_FAILED",
            Self::AccessForbidden => "SYNC_STATUS_ACCESS_FORBIDDEN",
            Self::UnknownOrigin => "SYNC_STATUS_UNKNOWN_ORIGIN",
            Self::FileErrorNotFound => "SYNC_FILE_ERROR_NOT_FOUND",
            Self::FileErrorFailed => "SYNC_FILE_ERROR_FAILED",
            Self::DatabaseErrorNotFound => "SYNC_DATABASE_ERROR_NOT_FOUND",
            Self::DatabaseErrorCorruption => "SYNC_DATABASE_ERROR_CORRUPTION",
            Self::DatabaseErrorIoError => "SYNC_DATABASE_ERROR_IO_ERROR",
            Self::DatabaseErrorFailed => "SYNC_DATABASE_ERROR_FAILED",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Errors after which the local index is no longer usable
    pub fn is_database_error(&self) -> bool {
        matches!(
            self,
            Self::DatabaseErrorCorruption | Self::DatabaseErrorIoError | Self::DatabaseErrorFailed
        )
    }
}

impl fmt::Display for SyncStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RemoteErrorCode> for SyncStatusCode {
    fn from(code: RemoteErrorCode) -> Self {
        match code {
            RemoteErrorCode::Unauthorized => Self::AuthenticationFailed,
            RemoteErrorCode::Forbidden => Self::AccessForbidden,
            RemoteErrorCode::NotFound => Self::FileErrorNotFound,
            RemoteErrorCode::ServiceUnavailable => Self::ServiceTemporarilyUnavailable,
            RemoteErrorCode::NoConnection => Self::NetworkError,
            RemoteErrorCode::Cancelled => Self::Abort,
            RemoteErrorCode::Conflict | RemoteErrorCode::PreconditionFailed => Self::HasConflict,
            RemoteErrorCode::Other(_) => Self::Failed,
        }
    }
}

impl From<&BridgeError> for SyncStatusCode {
    fn from(err: &BridgeError) -> Self {
        match err.remote_code() {
            Some(code) => code.into(),
            None => Self::Failed,
        }
    }
}
