//! # Index Records
//!
//! The three record kinds persisted by [`MetadataDatabase`](crate::MetadataDatabase):
//!
//! - [`FileMetadata`]: last known remote state of one remote file id
//! - [`FileTracker`]: one position of a remote file in the local mirror
//! - [`ServiceMetadata`]: singleton bookkeeping (change id, sync-root, id allocator)
//!
//! Records are plain data. Relations between them are expressed by ids only
//! (tracker id, parent tracker id, file id) and resolved through the
//! database's indexes.

use bridge_traits::{ChangeResource, FileResource, RemoteFileKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    #[default]
    Unsupported,
    File,
    Folder,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Unsupported => "unsupported",
            FileKind::File => "file",
            FileKind::Folder => "folder",
        }
    }
}

impl From<RemoteFileKind> for FileKind {
    fn from(kind: RemoteFileKind) -> Self {
        match kind {
            RemoteFileKind::File => FileKind::File,
            RemoteFileKind::Folder => FileKind::Folder,
            RemoteFileKind::Other => FileKind::Unsupported,
        }
    }
}

/// Remote attributes of a file, shared by metadata rows and tracker snapshots
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileDetails {
    pub parent_folder_ids: Vec<String>,
    pub title: String,
    pub file_kind: FileKind,
    /// Content hash, files only
    pub content_hash: Option<String>,
    pub etag: String,
    /// Milliseconds since the Unix epoch
    pub creation_time: i64,
    /// Milliseconds since the Unix epoch
    pub modification_time: i64,
    pub missing: bool,
    /// Change id the details were captured at
    pub change_id: i64,
}

impl FileDetails {
    /// Details describing a live remote resource. `change_id` is left at 0.
    pub fn from_resource(resource: &FileResource) -> Self {
        Self {
            parent_folder_ids: resource.parent_ids.clone(),
            title: resource.title.clone(),
            file_kind: resource.kind.into(),
            content_hash: resource.content_hash.clone(),
            etag: resource.etag.clone(),
            creation_time: resource.created_at.timestamp_millis(),
            modification_time: resource.modified_at.timestamp_millis(),
            missing: false,
            change_id: 0,
        }
    }

    pub fn has_parent(&self, file_id: &str) -> bool {
        self.parent_folder_ids.iter().any(|id| id == file_id)
    }

    pub fn is_folder(&self) -> bool {
        self.file_kind == FileKind::Folder
    }

    pub fn is_file(&self) -> bool {
        self.file_kind == FileKind::File
    }
}

/// Last known remote truth for one file id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub details: FileDetails,
}

impl FileMetadata {
    /// Metadata from a fetched resource, stamped with `change_id`.
    ///
    /// Trashed resources are recorded as missing with no other details.
    pub fn from_resource(change_id: i64, resource: &FileResource) -> Self {
        let details = if resource.trashed {
            FileDetails {
                missing: true,
                change_id,
                ..FileDetails::default()
            }
        } else {
            FileDetails {
                change_id,
                ..FileDetails::from_resource(resource)
            }
        };

        Self {
            file_id: resource.file_id.clone(),
            details,
        }
    }

    /// Metadata from one entry of the remote change feed
    pub fn from_change(change: &ChangeResource) -> Self {
        match &change.file {
            Some(file) if !change.deleted => Self {
                file_id: change.file_id.clone(),
                details: FileDetails {
                    change_id: change.change_id,
                    ..FileDetails::from_resource(file)
                },
            },
            _ => Self::deleted(change.change_id, &change.file_id),
        }
    }

    pub fn deleted(change_id: i64, file_id: &str) -> Self {
        Self {
            file_id: file_id.to_string(),
            details: FileDetails {
                missing: true,
                change_id,
                ..FileDetails::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    #[default]
    Regular,
    AppRoot,
    /// App-root of a disabled app; stays active so nothing else takes its place
    DisabledAppRoot,
}

impl TrackerKind {
    pub fn is_app_root(&self) -> bool {
        matches!(self, TrackerKind::AppRoot | TrackerKind::DisabledAppRoot)
    }
}

/// One position of a remote file in the local mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTracker {
    pub tracker_id: i64,
    /// 0 for the sync-root tracker
    pub parent_tracker_id: i64,
    pub file_id: String,
    /// Owning app, inherited from the app-root
    pub app_id: Option<String>,
    pub tracker_kind: TrackerKind,
    /// Details as of the last reconciliation, `None` until first synced
    pub synced_details: Option<FileDetails>,
    pub dirty: bool,
    pub active: bool,
    pub needs_folder_listing: bool,
}

impl FileTracker {
    /// Synced title, empty while the tracker has never been synced
    pub fn title(&self) -> &str {
        self.synced_details
            .as_ref()
            .map(|details| details.title.as_str())
            .unwrap_or("")
    }

    pub fn is_app_root(&self) -> bool {
        self.tracker_kind.is_app_root()
    }

    pub fn is_folder(&self) -> bool {
        self.synced_details
            .as_ref()
            .map(FileDetails::is_folder)
            .unwrap_or(false)
    }
}

/// Singleton bookkeeping row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    /// Largest remote change id applied to the index
    pub largest_change_id: i64,
    pub sync_root_tracker_id: Option<i64>,
    /// Next id handed out by the tracker id allocator
    pub next_tracker_id: i64,
}

impl Default for ServiceMetadata {
    fn default() -> Self {
        Self {
            largest_change_id: 0,
            sync_root_tracker_id: None,
            next_tracker_id: 1,
        }
    }
}

/// Titles that cannot be mapped onto a local path component
pub fn has_invalid_title(title: &str) -> bool {
    title.contains('/') || title.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn resource(trashed: bool) -> FileResource {
        FileResource {
            file_id: "file-1".to_string(),
            title: "notes.txt".to_string(),
            kind: RemoteFileKind::File,
            parent_ids: vec!["folder-1".to_string()],
            content_hash: Some("abc".to_string()),
            etag: "etag-1".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            modified_at: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            trashed,
        }
    }

    #[test]
    fn test_metadata_from_resource() {
        let file = FileMetadata::from_resource(42, &resource(false));
        assert_eq!(file.file_id, "file-1");
        assert_eq!(file.details.change_id, 42);
        assert_eq!(file.details.file_kind, FileKind::File);
        assert!(file.details.has_parent("folder-1"));
        assert!(!file.details.missing);
        assert!(file.details.creation_time < file.details.modification_time);
    }

    #[test]
    fn test_trashed_resource_is_missing() {
        let file = FileMetadata::from_resource(7, &resource(true));
        assert!(file.details.missing);
        assert!(file.details.title.is_empty());
        assert_eq!(file.details.change_id, 7);
    }

    #[test]
    fn test_deleted_change() {
        let change = ChangeResource {
            change_id: 9,
            file_id: "gone".to_string(),
            deleted: true,
            file: None,
        };
        let file = FileMetadata::from_change(&change);
        assert!(file.details.missing);
        assert_eq!(file.details.change_id, 9);
    }

    #[test]
    fn test_tracker_title_defaults_to_empty() {
        let tracker = FileTracker {
            tracker_id: 3,
            parent_tracker_id: 1,
            file_id: "f".to_string(),
            app_id: None,
            tracker_kind: TrackerKind::Regular,
            synced_details: None,
            dirty: true,
            active: false,
            needs_folder_listing: false,
        };
        assert_eq!(tracker.title(), "");
        assert!(!tracker.is_folder());
    }

    #[test]
    fn test_invalid_titles() {
        assert!(has_invalid_title("a/b"));
        assert!(has_invalid_title("a\\b"));
        assert!(!has_invalid_title("a.b"));
    }

    #[test]
    fn test_tracker_json_shape() {
        let json = serde_json::to_value(TrackerKind::DisabledAppRoot).unwrap();
        assert_eq!(json, "disabled_app_root");
    }
}
