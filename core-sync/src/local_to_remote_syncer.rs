//! # Local to Remote Syncer
//!
//! Pushes one local change of one path to the remote service.
//!
//! ## Overview
//!
//! The path is matched against the index from the app-root down. What is
//! done depends on how much of it is already tracked:
//!
//! - several components missing: the first missing folder is created and the
//!   run reports `Retry`, the caller re-submits the change
//! - only the last component missing: the file is uploaded or the folder
//!   created
//! - fully tracked: the remote file is updated, deleted or replaced
//!
//! When the tracker at the path is dirty the remote side changed too. A local
//! file is then uploaded as a new entry next to the remote one, and the
//! conflict resolver later picks the survivor.
//!
//! Uploads and deletes of known files are conditional on the synced etag. A
//! failed precondition means the remote copy moved on; the run asks for a
//! change listing and leaves the local change for later.

use bridge_traits::{
    BridgeError, FileChange, LocalFileType, RemoteErrorCode, RemoteFileService, SyncFileUrl,
};
use bytes::Bytes;
use core_runtime::events::SyncAction;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::error::SyncError;
use crate::folder_creator::FolderCreator;
use crate::metadata::FileTracker;
use crate::metadata_database::MetadataDatabase;
use crate::status::SyncStatusCode;
use crate::task_manager::SyncContext;

#[derive(Debug)]
pub struct LocalToRemoteSyncer {
    url: SyncFileUrl,
    local_change: FileChange,
    content: Option<Bytes>,
    target_path: Option<String>,
    sync_action: Option<SyncAction>,
    needs_remote_change_listing: bool,
    used_network: bool,
}

/// Result of one remote request, with the two outcomes callers care about
/// split out
enum RemoteWrite<T> {
    Done(T),
    /// Resource vanished remotely
    NotFound,
    /// Etag no longer matches
    Stale,
}

impl LocalToRemoteSyncer {
    pub fn new(url: SyncFileUrl, local_change: FileChange, content: Option<Bytes>) -> Self {
        Self {
            url,
            local_change,
            content,
            target_path: None,
            sync_action: None,
            needs_remote_change_listing: false,
            used_network: false,
        }
    }

    pub fn url(&self) -> &SyncFileUrl {
        &self.url
    }

    pub fn used_network(&self) -> bool {
        self.used_network
    }

    /// Path actually synced by the run. Differs from the requested path when
    /// only a parent folder was created.
    pub fn target_path(&self) -> Option<&str> {
        self.target_path.as_deref()
    }

    pub fn sync_action(&self) -> Option<SyncAction> {
        self.sync_action
    }

    /// The remote side changed under us and the change feed should be read
    /// before retrying.
    pub fn needs_remote_change_listing(&self) -> bool {
        self.needs_remote_change_listing
    }

    #[instrument(skip(self, ctx), fields(url = %self.url, change = ?self.local_change.kind))]
    pub async fn run(&mut self, ctx: &mut SyncContext) -> SyncStatusCode {
        let service = ctx.remote_service.clone();
        let Some(database) = ctx.metadata_database.as_mut() else {
            warn!("Metadata database is not initialized");
            return SyncStatusCode::Failed;
        };

        let status = self.sync(service.as_ref(), database).await;
        let status = self.sync_completed(status);
        info!(
            action = ?self.sync_action,
            target = ?self.target_path,
            status = %status,
            "Local to remote sync finished"
        );
        status
    }

    async fn sync(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
    ) -> SyncStatusCode {
        let local_missing = self.local_change.is_delete();
        if !local_missing && self.local_change.file_type == LocalFileType::Unknown {
            debug!("Stray change without a file type");
            return SyncStatusCode::Ok;
        }

        let Some((ancestor, ancestor_path)) =
            database.find_nearest_active_ancestor(&self.url.app_id, &self.url.path)
        else {
            debug!("App is not registered or disabled");
            return SyncStatusCode::UnknownOrigin;
        };

        let components: Vec<String> = self
            .url
            .components()
            .into_iter()
            .map(str::to_string)
            .collect();
        let matched = ancestor_path.split('/').filter(|c| !c.is_empty()).count();
        let missing = &components[matched..];

        if !missing.is_empty() {
            if local_missing {
                // Deleted locally and never reached the remote.
                return SyncStatusCode::Ok;
            }
            let title = missing[0].clone();
            let target = join_path(&ancestor_path, &title);

            if missing.len() > 1 {
                debug!(folder = %target, "Creating missing parent folder");
                if let Some(status) = self
                    .delete_blocking_file(service, database, &ancestor, &title)
                    .await
                {
                    return status;
                }
                return self
                    .create_remote_folder(service, database, &ancestor, &title, target)
                    .await;
            }

            return if self.local_change.is_file() {
                self.upload_new_file(service, database, &ancestor, &title, target)
                    .await
            } else {
                self.create_remote_folder(service, database, &ancestor, &title, target)
                    .await
            };
        }

        if ancestor.is_app_root() {
            debug!("Change on the app-root itself");
            return SyncStatusCode::Ok;
        }
        let Some(parent) = database
            .find_tracker_by_tracker_id(ancestor.parent_tracker_id)
            .cloned()
        else {
            warn!(tracker_id = ancestor.tracker_id, "Missing parent tracker");
            return SyncStatusCode::Failed;
        };
        self.target_path = Some(self.url.path.clone());

        if ancestor.dirty {
            return self
                .handle_conflict(service, database, &ancestor, &parent)
                .await;
        }
        self.handle_existing_remote_file(service, database, &ancestor, &parent)
            .await
    }

    /// The tracker at the path is dirty: both sides changed since the last
    /// sync.
    async fn handle_conflict(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
        remote: &FileTracker,
        parent: &FileTracker,
    ) -> SyncStatusCode {
        if self.local_change.is_delete() {
            // The remote version comes back down.
            return SyncStatusCode::Ok;
        }
        let title = self.url.base_name().to_string();
        let target = self.url.path.clone();

        if self.local_change.is_file() {
            info!(file_id = %remote.file_id, "Uploading conflicting local file");
            return self
                .upload_new_file(service, database, parent, &title, target)
                .await;
        }

        // A remote folder at the same position can be reused as is.
        let reusable = database
            .find_file_by_file_id(&remote.file_id)
            .map(|file| file.details.clone())
            .filter(|details| {
                details.is_folder()
                    && !details.missing
                    && details.title == remote.title()
                    && details.has_parent(&parent.file_id)
            });
        if let Some(details) = reusable {
            return match database.update_tracker(remote.tracker_id, &details).await {
                Ok(()) => SyncStatusCode::Ok,
                Err(e) => e.status_code(),
            };
        }

        self.create_remote_folder(service, database, parent, &title, target)
            .await
    }

    async fn handle_existing_remote_file(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
        remote: &FileTracker,
        parent: &FileTracker,
    ) -> SyncStatusCode {
        let title = self.url.base_name().to_string();
        let target = self.url.path.clone();

        if self.local_change.is_delete() {
            return match self.delete_remote_file(service, database, remote).await {
                Ok(RemoteWrite::Stale) => {
                    // Remote modification wins over the local deletion.
                    debug!("Remote file changed since last sync, keeping it");
                    self.needs_remote_change_listing = true;
                    SyncStatusCode::Ok
                }
                Ok(_) => {
                    self.sync_action = Some(SyncAction::Deleted);
                    SyncStatusCode::Ok
                }
                Err(status) => status,
            };
        }

        match (self.local_change.file_type, remote.is_folder()) {
            (LocalFileType::File, false) => {
                self.upload_existing_file(service, database, remote, parent)
                    .await
            }
            (LocalFileType::File, true) => {
                debug!("Local file replaces remote folder");
                match self.delete_remote_file(service, database, remote).await {
                    Ok(RemoteWrite::Stale) => self.request_change_listing(),
                    Ok(_) => {
                        self.upload_new_file(service, database, parent, &title, target)
                            .await
                    }
                    Err(status) => status,
                }
            }
            (LocalFileType::Directory, false) => {
                debug!("Local folder replaces remote file");
                match self.delete_remote_file(service, database, remote).await {
                    Ok(RemoteWrite::Stale) => self.request_change_listing(),
                    Ok(_) => {
                        self.create_remote_folder(service, database, parent, &title, target)
                            .await
                    }
                    Err(status) => status,
                }
            }
            (LocalFileType::Directory, true) => SyncStatusCode::Ok,
            (LocalFileType::Unknown, _) => SyncStatusCode::Ok,
        }
    }

    async fn upload_existing_file(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
        remote: &FileTracker,
        parent: &FileTracker,
    ) -> SyncStatusCode {
        let Some(content) = self.content.clone() else {
            warn!("No content for local file");
            return SyncStatusCode::FileErrorFailed;
        };

        let local_hash = format!("{:x}", Sha256::digest(&content));
        let synced = remote.synced_details.as_ref();
        if synced.and_then(|details| details.content_hash.as_deref()) == Some(local_hash.as_str()) {
            debug!("Local content matches last synced content");
            return SyncStatusCode::Ok;
        }

        let etag = synced.map(|details| details.etag.as_str()).filter(|etag| !etag.is_empty());
        self.used_network = true;
        let resource = match service
            .upload_existing_file(&remote.file_id, content, etag)
            .await
        {
            Ok(resource) => resource,
            Err(e) => {
                return match classify(e) {
                    Ok(RemoteWrite::NotFound | RemoteWrite::Stale) => {
                        self.refresh_remote_metadata(service, database, &remote.file_id)
                            .await
                    }
                    Ok(RemoteWrite::Done(())) => SyncStatusCode::Failed,
                    Err(status) => status,
                };
            }
        };

        if let Err(e) = database.update_by_file_resource(&resource).await {
            return e.status_code();
        }
        self.sync_action = Some(SyncAction::Updated);

        let Some(file) = database.find_file_by_file_id(&resource.file_id) else {
            return SyncStatusCode::Failed;
        };
        let details = file.details.clone();
        let still_here = !details.missing
            && details.is_file()
            && details.title == remote.title()
            && details.has_parent(&parent.file_id);
        if !still_here {
            // Moved or renamed remotely meanwhile.
            return SyncStatusCode::Retry;
        }

        match database.update_tracker(remote.tracker_id, &details).await {
            Ok(()) => SyncStatusCode::Ok,
            Err(e) => e.status_code(),
        }
    }

    async fn upload_new_file(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
        parent: &FileTracker,
        title: &str,
        target: String,
    ) -> SyncStatusCode {
        let Some(content) = self.content.clone() else {
            warn!("No content for local file");
            return SyncStatusCode::FileErrorFailed;
        };

        self.used_network = true;
        let resource = match service
            .upload_new_file(&parent.file_id, title, content)
            .await
        {
            Ok(resource) => resource,
            Err(e) => return SyncStatusCode::from(&e),
        };
        debug!(file_id = %resource.file_id, "Uploaded new file");

        if let Err(e) = database
            .replace_active_tracker_with_new_resource(parent.tracker_id, &resource)
            .await
        {
            return e.status_code();
        }
        self.sync_action = Some(SyncAction::Added);
        self.target_path = Some(target);
        SyncStatusCode::Ok
    }

    async fn create_remote_folder(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
        parent: &FileTracker,
        title: &str,
        target: String,
    ) -> SyncStatusCode {
        self.used_network = true;
        let folder_id = match FolderCreator::new(parent.file_id.clone(), title)
            .run(service, database)
            .await
        {
            Ok(folder_id) => folder_id,
            Err(e) => {
                // Not visible in the listing yet.
                if matches!(e, SyncError::NotFound(_))
                    || e.status_code() == SyncStatusCode::FileErrorNotFound
                {
                    self.needs_remote_change_listing = true;
                }
                return e.status_code();
            }
        };

        self.target_path = Some(target);
        self.sync_action = Some(SyncAction::Added);

        match database
            .try_no_side_effect_activation(parent.tracker_id, &folder_id)
            .await
        {
            Ok(true) => return SyncStatusCode::Ok,
            Ok(false) => {}
            Err(e) => return e.status_code(),
        }

        let tracked_elsewhere = database
            .find_trackers_by_file_id(&folder_id)
            .map(|set| set.has_active())
            .unwrap_or(false);
        if tracked_elsewhere {
            // The folder is already in use at another position; keep it out
            // of this parent.
            info!(file_id = %folder_id, "Detaching folder active elsewhere");
            self.sync_action = None;
            return match service.remove_parent(&folder_id, &parent.file_id).await {
                Ok(()) => SyncStatusCode::Retry,
                Err(e) => SyncStatusCode::from(&e),
            };
        }

        // The slot is held by an older entry; the new folder takes it over.
        let resource = match service.get_file_resource(&folder_id).await {
            Ok(resource) => resource,
            Err(e) => return SyncStatusCode::from(&e),
        };
        match database
            .replace_active_tracker_with_new_resource(parent.tracker_id, &resource)
            .await
        {
            Ok(()) => SyncStatusCode::Ok,
            Err(e) => e.status_code(),
        }
    }

    /// A remote file occupies the position of a folder that has to be
    /// created; the local folder wins.
    async fn delete_blocking_file(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
        parent: &FileTracker,
        title: &str,
    ) -> Option<SyncStatusCode> {
        let blocker = database
            .find_trackers_by_parent_and_title(parent.tracker_id, title)
            .and_then(|set| set.active_tracker())
            .and_then(|id| database.find_tracker_by_tracker_id(id))
            .filter(|tracker| !tracker.is_folder())
            .cloned()?;

        debug!(file_id = %blocker.file_id, "Deleting remote file in the way of a folder");
        match self.delete_remote_file(service, database, &blocker).await {
            Ok(RemoteWrite::Stale) => Some(self.request_change_listing()),
            Ok(_) => None,
            Err(status) => Some(status),
        }
    }

    async fn delete_remote_file(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
        remote: &FileTracker,
    ) -> Result<RemoteWrite<()>, SyncStatusCode> {
        let etag = remote
            .synced_details
            .as_ref()
            .map(|details| details.etag.as_str())
            .filter(|etag| !etag.is_empty());

        self.used_network = true;
        let outcome = match service.delete_file(&remote.file_id, etag).await {
            Ok(()) => RemoteWrite::Done(()),
            Err(e) => classify(e)?,
        };
        if matches!(outcome, RemoteWrite::Stale) {
            return Ok(outcome);
        }

        database
            .update_by_deleted_remote_file(&remote.file_id)
            .await
            .map_err(|e| e.status_code())?;
        Ok(outcome)
    }

    async fn refresh_remote_metadata(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
        file_id: &str,
    ) -> SyncStatusCode {
        self.needs_remote_change_listing = true;
        let result = match service.get_file_resource(file_id).await {
            Ok(resource) => database.update_by_file_resource(&resource).await,
            Err(e) if e.remote_code() == Some(RemoteErrorCode::NotFound) => {
                database.update_by_deleted_remote_file(file_id).await
            }
            Err(e) => return SyncStatusCode::from(&e),
        };
        match result {
            Ok(()) => SyncStatusCode::Retry,
            Err(e) => e.status_code(),
        }
    }

    fn request_change_listing(&mut self) -> SyncStatusCode {
        self.needs_remote_change_listing = true;
        SyncStatusCode::Retry
    }

    fn sync_completed(&self, status: SyncStatusCode) -> SyncStatusCode {
        match (&self.target_path, status) {
            (Some(target), SyncStatusCode::Ok) if *target != self.url.path => {
                // Only an intermediate folder was synced.
                SyncStatusCode::Retry
            }
            _ => status,
        }
    }
}

fn classify(err: BridgeError) -> Result<RemoteWrite<()>, SyncStatusCode> {
    match err.remote_code() {
        Some(RemoteErrorCode::NotFound) => Ok(RemoteWrite::NotFound),
        Some(RemoteErrorCode::PreconditionFailed | RemoteErrorCode::Conflict) => {
            Ok(RemoteWrite::Stale)
        }
        _ => Err(SyncStatusCode::from(&err)),
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}
