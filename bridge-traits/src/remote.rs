//! Remote File Service Abstraction
//!
//! The remote storage service is treated as an opaque async collaborator. The
//! core only needs the resource shapes below and an error code per request;
//! wire protocol, auth refresh and timeouts belong to the implementation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Failure class reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorCode {
    NotFound,
    Conflict,
    PreconditionFailed,
    Unauthorized,
    Forbidden,
    ServiceUnavailable,
    NoConnection,
    Cancelled,
    /// Any other HTTP-like status
    Other(u16),
}

impl fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Conflict => write!(f, "conflict"),
            Self::PreconditionFailed => write!(f, "precondition failed"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::ServiceUnavailable => write!(f, "service unavailable"),
            Self::NoConnection => write!(f, "no connection"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Other(code) => write!(f, "status {}", code),
        }
    }
}

/// Kind of a remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteFileKind {
    File,
    Folder,
    /// Shortcuts, hosted documents and anything else the core cannot mirror
    Other,
}

/// Remote file or folder as reported by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResource {
    pub file_id: String,
    pub title: String,
    pub kind: RemoteFileKind,
    pub parent_ids: Vec<String>,
    /// Content digest, absent for folders
    pub content_hash: Option<String>,
    pub etag: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Moved to trash; treated as deleted by the core
    pub trashed: bool,
}

impl FileResource {
    pub fn is_folder(&self) -> bool {
        self.kind == RemoteFileKind::Folder
    }

    pub fn has_parent(&self, parent_id: &str) -> bool {
        self.parent_ids.iter().any(|id| id == parent_id)
    }
}

/// One entry of the remote change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeResource {
    pub change_id: i64,
    pub file_id: String,
    pub deleted: bool,
    /// Latest resource state; `None` when `deleted` is set
    pub file: Option<FileResource>,
}

/// Page of the change feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeList {
    pub items: Vec<ChangeResource>,
    pub largest_change_id: i64,
    pub next_page_token: Option<String>,
}

/// Page of a folder listing or search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList {
    pub items: Vec<FileResource>,
    pub next_page_token: Option<String>,
}

/// Account-level information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AboutResource {
    pub largest_change_id: i64,
    pub root_folder_id: String,
}

/// Remote file service trait
///
/// Every method performs one request/response round. Failures surface as
/// [`BridgeError::Remote`](crate::error::BridgeError::Remote) carrying a
/// [`RemoteErrorCode`].
///
/// Methods taking an `etag` perform a conditional request and fail with
/// [`RemoteErrorCode::PreconditionFailed`] when the resource changed since.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::remote::RemoteFileService;
///
/// async fn list_all(service: &dyn RemoteFileService, folder_id: &str) -> Result<Vec<String>> {
///     let mut ids = Vec::new();
///     let mut token = None;
///     loop {
///         let page = service.list_folder(folder_id, token.as_deref()).await?;
///         ids.extend(page.items.into_iter().map(|f| f.file_id));
///         match page.next_page_token {
///             Some(next) => token = Some(next),
///             None => return Ok(ids),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait RemoteFileService: Send + Sync {
    async fn get_about_resource(&self) -> Result<AboutResource>;

    async fn get_file_resource(&self, file_id: &str) -> Result<FileResource>;

    /// Changes with id >= `start_change_id`, one page at a time
    async fn list_changes(
        &self,
        start_change_id: i64,
        page_token: Option<&str>,
    ) -> Result<ChangeList>;

    /// Direct children of `folder_id`, one page at a time
    async fn list_folder(&self, folder_id: &str, page_token: Option<&str>) -> Result<FileList>;

    /// Non-trashed entries titled `title` directly under `parent_id`
    async fn search_by_title(&self, title: &str, parent_id: &str) -> Result<FileList>;

    async fn create_folder(&self, parent_id: &str, title: &str) -> Result<FileResource>;

    async fn upload_new_file(
        &self,
        parent_id: &str,
        title: &str,
        content: Bytes,
    ) -> Result<FileResource>;

    async fn upload_existing_file(
        &self,
        file_id: &str,
        content: Bytes,
        etag: Option<&str>,
    ) -> Result<FileResource>;

    async fn download_file(&self, file_id: &str) -> Result<Bytes>;

    async fn delete_file(&self, file_id: &str, etag: Option<&str>) -> Result<()>;

    /// Detach `file_id` from `parent_id`, leaving its other parents intact
    async fn remove_parent(&self, file_id: &str, parent_id: &str) -> Result<()>;

    /// Whether the service holds credentials it can refresh on its own
    fn has_refresh_token(&self) -> bool;
}
