use bridge_traits::BridgeError;
use thiserror::Error;

use crate::status::SyncStatusCode;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupted record {key}: {message}")]
    Corruption { key: String, message: String },

    #[error("Unsupported database version {0}")]
    UnsupportedVersion(i64),

    #[error("Storage error: {0}")]
    Storage(#[source] BridgeError),

    #[error("Remote service error: {0}")]
    Remote(#[source] BridgeError),

    #[error("Tracker conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Status code reported through task completion for this error
    pub fn status_code(&self) -> SyncStatusCode {
        match self {
            SyncError::NotFound(_) => SyncStatusCode::DatabaseErrorNotFound,
            SyncError::Corruption { .. } | SyncError::Serialization(_) => {
                SyncStatusCode::DatabaseErrorCorruption
            }
            SyncError::UnsupportedVersion(_) => SyncStatusCode::DatabaseErrorFailed,
            SyncError::Storage(_) => SyncStatusCode::DatabaseErrorIoError,
            SyncError::Remote(err) => SyncStatusCode::from(err),
            SyncError::Conflict(_) => SyncStatusCode::HasConflict,
            SyncError::InvalidState(_) => SyncStatusCode::Failed,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::RemoteErrorCode;

    #[test]
    fn test_storage_errors_are_database_io_errors() {
        let err = SyncError::Storage(BridgeError::DatabaseError("disk full".to_string()));
        assert_eq!(err.status_code(), SyncStatusCode::DatabaseErrorIoError);
    }

    #[test]
    fn test_remote_errors_keep_their_code() {
        let err = SyncError::Remote(BridgeError::remote(RemoteErrorCode::Unauthorized, "expired"));
        assert_eq!(err.status_code(), SyncStatusCode::AuthenticationFailed);
    }

    #[test]
    fn test_bad_json_is_corruption() {
        let json_err = serde_json::from_str::<i64>("not json").unwrap_err();
        let err: SyncError = json_err.into();
        assert_eq!(err.status_code(), SyncStatusCode::DatabaseErrorCorruption);
    }
}
