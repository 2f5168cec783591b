//! # Remote to Local Syncer
//!
//! Reconciles one dirty tracker with the last known remote state.
//!
//! ## Overview
//!
//! Each run picks the lowest-id normal priority dirty tracker and classifies
//! the difference between its synced details and the file's metadata:
//!
//! | Situation | Action |
//! |-----------|--------|
//! | no metadata | fetch the resource, retry later |
//! | inactive tracker or disabled app | record details only |
//! | sync-root changed | flag sync-root deletion |
//! | remote deleted, renamed or moved | delete locally |
//! | file content changed | download, verify, write locally |
//! | new folder | create locally |
//! | folder needs listing | list children into the index |
//!
//! A path with pending local changes is left alone and the tracker is moved
//! to low priority; the local-to-remote phase resolves it.

use bridge_traits::{
    BridgeError, FileChange, LocalFileType, PreparedChange, RemoteChangeProcessor,
    RemoteFileService, SyncFileUrl,
};
use core_runtime::events::SyncAction;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::metadata::{FileKind, FileMetadata, FileTracker};
use crate::metadata_database::MetadataDatabase;
use crate::status::SyncStatusCode;
use crate::task_manager::SyncContext;

#[derive(Debug, Default)]
pub struct RemoteToLocalSyncer {
    tracker_id: Option<i64>,
    remote_metadata: Option<FileMetadata>,
    url: Option<SyncFileUrl>,
    sync_action: Option<SyncAction>,
    prepared: bool,
    sync_root_deletion: bool,
    used_network: bool,
}

/// Local side of one path, read right before it is changed
struct LocalState {
    file_type: LocalFileType,
    missing: bool,
    has_pending_changes: bool,
}

impl From<PreparedChange> for LocalState {
    fn from(prepared: PreparedChange) -> Self {
        let last_is_delete = prepared
            .local_changes
            .last()
            .map(FileChange::is_delete)
            .unwrap_or(false);
        Self {
            file_type: prepared.metadata.file_type,
            missing: prepared.metadata.file_type == LocalFileType::Unknown || last_is_delete,
            has_pending_changes: !prepared.local_changes.is_empty(),
        }
    }
}

impl RemoteToLocalSyncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn used_network(&self) -> bool {
        self.used_network
    }

    /// Tracker picked by the last run
    pub fn tracker_id(&self) -> Option<i64> {
        self.tracker_id
    }

    /// Local location touched by the last run, if it got that far
    pub fn url(&self) -> Option<&SyncFileUrl> {
        self.url.as_ref()
    }

    /// What was done to the local file, `None` when nothing was
    pub fn sync_action(&self) -> Option<SyncAction> {
        self.sync_action
    }

    /// The sync-root was deleted, renamed or moved remotely; the whole index
    /// has to be rebuilt.
    pub fn sync_root_deletion(&self) -> bool {
        self.sync_root_deletion
    }

    #[instrument(skip(self, ctx))]
    pub async fn run(&mut self, ctx: &mut SyncContext) -> SyncStatusCode {
        let service = ctx.remote_service.clone();
        let processor = ctx.remote_change_processor.clone();
        let Some(database) = ctx.metadata_database.as_mut() else {
            warn!("Metadata database is not initialized");
            return SyncStatusCode::Failed;
        };
        let Some(processor) = processor else {
            warn!("No remote change processor");
            return SyncStatusCode::Failed;
        };

        let Some(tracker) = database.get_normal_priority_dirty_tracker().cloned() else {
            debug!("Nothing to sync");
            return SyncStatusCode::NoChangeToSync;
        };
        self.tracker_id = Some(tracker.tracker_id);
        debug!(tracker_id = tracker.tracker_id, file_id = %tracker.file_id, "Start");

        let status = self
            .resolve_remote_change(service.as_ref(), processor.as_ref(), database, &tracker)
            .await;
        let status = self.sync_completed(database, &tracker, status).await;

        info!(
            tracker_id = tracker.tracker_id,
            action = ?self.sync_action,
            status = %status,
            "Remote to local sync finished"
        );
        self.finalize(&processor, status).await
    }

    async fn resolve_remote_change(
        &mut self,
        service: &dyn RemoteFileService,
        processor: &dyn RemoteChangeProcessor,
        database: &mut MetadataDatabase,
        tracker: &FileTracker,
    ) -> SyncStatusCode {
        let Some(remote) = database.find_file_by_file_id(&tracker.file_id).cloned() else {
            debug!("Missing remote metadata");
            return self
                .handle_missing_remote_metadata(service, database, &tracker.file_id)
                .await;
        };
        self.remote_metadata = Some(remote.clone());
        let remote_details = &remote.details;

        if !tracker.active || database.has_disabled_app_root(tracker) {
            // Details are recorded when the sync completes.
            debug!("Inactive tracker");
            return SyncStatusCode::Ok;
        }

        let Some(synced) = tracker.synced_details.as_ref() else {
            warn!(tracker_id = tracker.tracker_id, "Active tracker without synced details");
            return SyncStatusCode::Failed;
        };

        if Some(tracker.tracker_id) == database.sync_root_tracker_id() {
            if remote_details.missing
                || synced.title != remote_details.title
                || synced.parent_folder_ids != remote_details.parent_folder_ids
            {
                warn!("Sync-root deleted or moved remotely");
                self.sync_root_deletion = true;
            }
            return SyncStatusCode::Ok;
        }

        if remote_details.missing {
            if !synced.missing {
                debug!("Remote file deletion");
                return self.handle_deletion(processor, database, tracker).await;
            }
            warn!(file_id = %tracker.file_id, "Stray missing tracker");
            return SyncStatusCode::Ok;
        }

        if synced.file_kind != remote_details.file_kind {
            warn!(
                local = synced.file_kind.as_str(),
                remote = remote_details.file_kind.as_str(),
                "Type mismatch between remote and local file"
            );
            return SyncStatusCode::Failed;
        }
        if synced.file_kind == FileKind::Unsupported {
            warn!(file_id = %tracker.file_id, "Unsupported active file");
            return SyncStatusCode::Failed;
        }

        // Rename and reorganize are handled as deletion; the new position gets
        // its own tracker.
        if synced.title != remote_details.title {
            debug!("Remote file rename");
            return self.handle_deletion(processor, database, tracker).await;
        }
        let Some(parent) = database.find_tracker_by_tracker_id(tracker.parent_tracker_id) else {
            warn!(tracker_id = tracker.tracker_id, "Missing parent tracker");
            return SyncStatusCode::Failed;
        };
        if !remote_details.has_parent(&parent.file_id) {
            debug!("Remote file reorganize");
            return self.handle_deletion(processor, database, tracker).await;
        }

        if synced.is_file() {
            if synced.content_hash != remote_details.content_hash {
                debug!("Remote content update");
                return self
                    .handle_content_update(service, processor, database, tracker)
                    .await;
            }
            return SyncStatusCode::Ok;
        }

        if synced.missing {
            debug!("Remote folder update");
            return self
                .handle_folder_update(service, processor, database, tracker)
                .await;
        }
        if tracker.needs_folder_listing {
            return self.list_folder_content(service, database, tracker).await;
        }
        SyncStatusCode::Ok
    }

    async fn handle_missing_remote_metadata(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
        file_id: &str,
    ) -> SyncStatusCode {
        self.used_network = true;
        let result = match service.get_file_resource(file_id).await {
            Ok(resource) => database.update_by_file_resource(&resource).await,
            Err(e) if e.remote_code() == Some(bridge_traits::RemoteErrorCode::NotFound) => {
                database.update_by_deleted_remote_file(file_id).await
            }
            Err(e) => return SyncStatusCode::from(&e),
        };

        match result {
            // The tracker is revisited with the fresh metadata.
            Ok(()) => SyncStatusCode::Retry,
            Err(e) => e.status_code(),
        }
    }

    async fn handle_deletion(
        &mut self,
        processor: &dyn RemoteChangeProcessor,
        database: &MetadataDatabase,
        tracker: &FileTracker,
    ) -> SyncStatusCode {
        let local = match self.prepare(processor, database, tracker).await {
            Ok(local) => local,
            Err(status) => return status,
        };

        if local.missing {
            return SyncStatusCode::Ok;
        }
        if local.has_pending_changes {
            // Locally updated, remotely deleted: the local update wins.
            debug!("Ignoring remote deletion of a locally modified file");
            return SyncStatusCode::Ok;
        }

        self.sync_action = Some(SyncAction::Deleted);
        self.apply(processor, FileChange::delete(LocalFileType::Unknown), None)
            .await
    }

    async fn handle_content_update(
        &mut self,
        service: &dyn RemoteFileService,
        processor: &dyn RemoteChangeProcessor,
        database: &mut MetadataDatabase,
        tracker: &FileTracker,
    ) -> SyncStatusCode {
        let local = match self.prepare(processor, database, tracker).await {
            Ok(local) => local,
            Err(status) => return status,
        };

        if local.missing {
            self.sync_action = Some(SyncAction::Added);
            return self.download_file(service, processor, database, tracker).await;
        }

        if !local.has_pending_changes {
            if local.file_type == LocalFileType::File {
                self.sync_action = Some(SyncAction::Updated);
                return self.download_file(service, processor, database, tracker).await;
            }

            // Remote file over a local folder: the folder wins and the
            // local-to-remote phase pushes it.
            database.lower_tracker_priority(tracker.tracker_id);
            if let Some(url) = &self.url {
                if let Err(e) = processor
                    .record_fake_local_change(url, FileChange::add_or_update(local.file_type))
                    .await
                {
                    return local_status(&e);
                }
            }
            return SyncStatusCode::Retry;
        }

        debug!("Local change pending, deferring tracker");
        database.lower_tracker_priority(tracker.tracker_id);
        SyncStatusCode::Retry
    }

    async fn handle_folder_update(
        &mut self,
        service: &dyn RemoteFileService,
        processor: &dyn RemoteChangeProcessor,
        database: &mut MetadataDatabase,
        tracker: &FileTracker,
    ) -> SyncStatusCode {
        let local = match self.prepare(processor, database, tracker).await {
            Ok(local) => local,
            Err(status) => return status,
        };

        if local.missing || local.file_type == LocalFileType::File {
            // A remote folder replaces a local file.
            self.sync_action = Some(SyncAction::Added);
            return self
                .apply(processor, FileChange::add_or_update(LocalFileType::Directory), None)
                .await;
        }

        let synced_missing = tracker
            .synced_details
            .as_ref()
            .map(|details| details.missing)
            .unwrap_or(true);
        if tracker.needs_folder_listing && !synced_missing {
            return self.list_folder_content(service, database, tracker).await;
        }
        SyncStatusCode::Ok
    }

    async fn list_folder_content(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
        tracker: &FileTracker,
    ) -> SyncStatusCode {
        self.used_network = true;
        let mut children = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = match service
                .list_folder(&tracker.file_id, page_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) => return SyncStatusCode::from(&e),
            };
            children.extend(page.items.into_iter().filter(|child| !child.trashed));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(children = children.len(), "Listed folder");
        if let Err(e) = database.update_by_file_resource_list(&children).await {
            return e.status_code();
        }
        let child_ids: Vec<String> = children.into_iter().map(|child| child.file_id).collect();
        match database
            .populate_folder_by_child_list(&tracker.file_id, &child_ids)
            .await
        {
            Ok(()) => SyncStatusCode::Ok,
            Err(e) => e.status_code(),
        }
    }

    async fn download_file(
        &mut self,
        service: &dyn RemoteFileService,
        processor: &dyn RemoteChangeProcessor,
        database: &mut MetadataDatabase,
        tracker: &FileTracker,
    ) -> SyncStatusCode {
        self.used_network = true;
        let content = match service.download_file(&tracker.file_id).await {
            Ok(content) => content,
            Err(e) => return SyncStatusCode::from(&e),
        };

        let hash = format!("{:x}", Sha256::digest(&content));
        let expected = self
            .remote_metadata
            .as_ref()
            .and_then(|file| file.details.content_hash.clone());
        if expected.as_deref() != Some(hash.as_str()) {
            // Modified again since the metadata was fetched.
            debug!(file_id = %tracker.file_id, "Downloaded content is newer than metadata");
            database.lower_tracker_priority(tracker.tracker_id);
            return SyncStatusCode::Retry;
        }

        let status = self
            .apply(processor, FileChange::add_or_update(LocalFileType::File), Some(content))
            .await;
        if status != SyncStatusCode::Ok {
            database.lower_tracker_priority(tracker.tracker_id);
        }
        status
    }

    async fn prepare(
        &mut self,
        processor: &dyn RemoteChangeProcessor,
        database: &MetadataDatabase,
        tracker: &FileTracker,
    ) -> Result<LocalState, SyncStatusCode> {
        let (Some(app_id), Some(path)) = (
            tracker.app_id.clone(),
            database.build_path_for_tracker(tracker.tracker_id),
        ) else {
            warn!(tracker_id = tracker.tracker_id, "Cannot build local path");
            return Err(SyncStatusCode::Failed);
        };

        let url = SyncFileUrl::new(app_id, path.trim_start_matches('/'));
        let prepared = processor
            .prepare_for_remote_change(&url)
            .await
            .map_err(|e| local_status(&e))?;
        self.url = Some(url);
        self.prepared = true;
        Ok(prepared.into())
    }

    async fn apply(
        &self,
        processor: &dyn RemoteChangeProcessor,
        change: FileChange,
        content: Option<bytes::Bytes>,
    ) -> SyncStatusCode {
        let Some(url) = &self.url else {
            return SyncStatusCode::Failed;
        };
        match processor.apply_remote_change(change, content, url).await {
            Ok(()) => SyncStatusCode::Ok,
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to apply remote change");
                local_status(&e)
            }
        }
    }

    async fn sync_completed(
        &mut self,
        database: &mut MetadataDatabase,
        tracker: &FileTracker,
        status: SyncStatusCode,
    ) -> SyncStatusCode {
        if self.sync_root_deletion || status == SyncStatusCode::Retry {
            return SyncStatusCode::Ok;
        }
        if status != SyncStatusCode::Ok {
            return status;
        }
        let Some(remote) = &self.remote_metadata else {
            return SyncStatusCode::Ok;
        };

        let mut updated = remote.details.clone();
        if !tracker.active || database.has_disabled_app_root(tracker) {
            // Content is not synced for inactive trackers.
            updated.content_hash = tracker
                .synced_details
                .as_ref()
                .and_then(|details| details.content_hash.clone());
            if !tracker.active {
                updated.content_hash = None;
                updated.missing = true;
            }
        }

        match database.update_tracker(tracker.tracker_id, &updated).await {
            Ok(()) => SyncStatusCode::Ok,
            Err(e) => e.status_code(),
        }
    }

    async fn finalize(
        &self,
        processor: &Arc<dyn RemoteChangeProcessor>,
        status: SyncStatusCode,
    ) -> SyncStatusCode {
        if let (true, Some(url)) = (self.prepared, &self.url) {
            if let Err(e) = processor.finalize_remote_sync(url, false).await {
                warn!(url = %url, error = %e, "Failed to finalize remote sync");
            }
        }
        status
    }
}

fn local_status(err: &BridgeError) -> SyncStatusCode {
    match err.remote_code() {
        Some(code) => code.into(),
        None => SyncStatusCode::FileErrorFailed,
    }
}
