//! Local Change Application
//!
//! The sandboxed local file system lives outside the sync core. The core reads
//! its pending local changes and pushes resolved remote changes into it through
//! [`RemoteChangeProcessor`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Location of a file inside one application's synced tree.
///
/// `path` is relative to the app root and uses `/` separators; the empty
/// string denotes the app root itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncFileUrl {
    pub app_id: String,
    pub path: String,
}

impl SyncFileUrl {
    pub fn new(app_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            path: path.into(),
        }
    }

    /// Non-empty path components
    pub fn components(&self) -> Vec<&str> {
        self.path.split('/').filter(|c| !c.is_empty()).collect()
    }

    /// Last path component, empty for the app root
    pub fn base_name(&self) -> &str {
        self.components().last().copied().unwrap_or("")
    }
}

impl fmt::Display for SyncFileUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.app_id, self.path.trim_start_matches('/'))
    }
}

/// File type as seen by the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalFileType {
    /// Nothing exists at the path
    Unknown,
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileChangeKind {
    AddOrUpdate,
    Delete,
}

/// A pending or applied change to one local path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub kind: FileChangeKind,
    pub file_type: LocalFileType,
}

impl FileChange {
    pub fn add_or_update(file_type: LocalFileType) -> Self {
        Self {
            kind: FileChangeKind::AddOrUpdate,
            file_type,
        }
    }

    pub fn delete(file_type: LocalFileType) -> Self {
        Self {
            kind: FileChangeKind::Delete,
            file_type,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.kind == FileChangeKind::Delete
    }

    pub fn is_add_or_update(&self) -> bool {
        self.kind == FileChangeKind::AddOrUpdate
    }

    pub fn is_file(&self) -> bool {
        self.file_type == LocalFileType::File
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == LocalFileType::Directory
    }
}

/// State of a local path at the time a remote change is prepared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileMetadata {
    pub file_type: LocalFileType,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl LocalFileMetadata {
    pub fn missing() -> Self {
        Self {
            file_type: LocalFileType::Unknown,
            size: 0,
            last_modified: None,
        }
    }
}

/// Local state and queued local changes for a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedChange {
    pub metadata: LocalFileMetadata,
    pub local_changes: Vec<FileChange>,
}

/// Bridge into the local sandboxed file system
///
/// A remote sync of one path is bracketed by
/// [`prepare_for_remote_change`](Self::prepare_for_remote_change) and
/// [`finalize_remote_sync`](Self::finalize_remote_sync); the host is expected
/// to hold local writes to that path in between.
#[async_trait]
pub trait RemoteChangeProcessor: Send + Sync {
    async fn prepare_for_remote_change(&self, url: &SyncFileUrl) -> Result<PreparedChange>;

    /// Apply a change to the local tree. `content` carries the file body for
    /// file additions and updates.
    async fn apply_remote_change(
        &self,
        change: FileChange,
        content: Option<Bytes>,
        url: &SyncFileUrl,
    ) -> Result<()>;

    async fn finalize_remote_sync(&self, url: &SyncFileUrl, clear_local_changes: bool)
        -> Result<()>;

    /// Queue a synthetic local change so the local-to-remote phase revisits `url`
    async fn record_fake_local_change(&self, url: &SyncFileUrl, change: FileChange)
        -> Result<()>;
}
