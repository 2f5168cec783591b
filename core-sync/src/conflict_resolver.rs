//! # Conflict Resolver
//!
//! Repairs the remote tree once every tracker is clean.
//!
//! ## Overview
//!
//! Two kinds of conflict are fixed, one per run:
//!
//! - **Multi-parent files**: a file linked under several tracked folders is
//!   detached from every parent except the one holding its active tracker.
//! - **Name clashes**: several remote entries share a (parent, title) slot.
//!   One primary survives, chosen by [`ConflictPolicy`]; the rest are deleted
//!   remotely.
//!
//! Each fix is also recorded in the index so the next idle cycle does not see
//! the same conflict again. A run that finds nothing reports `NoConflict`.

use bridge_traits::{RemoteErrorCode, RemoteFileService};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info, instrument, warn};

use crate::metadata::FileMetadata;
use crate::metadata_database::MetadataDatabase;
use crate::status::SyncStatusCode;
use crate::task_manager::SyncContext;
use crate::tracker_set::TrackerSet;

/// Which entry of a name clash survives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Folders beat files, then earliest creation time, then lowest file id
    #[default]
    FolderThenOldest,
    /// Folders beat files; among files the last modified wins, among folders
    /// the first created
    LastModifiedFile,
}

impl ConflictPolicy {
    /// Orders two candidates so that the preferred one compares `Less`.
    fn compare(&self, a: &FileMetadata, b: &FileMetadata) -> Ordering {
        let kind = b.details.is_folder().cmp(&a.details.is_folder());
        if kind != Ordering::Equal {
            return kind;
        }

        let by_time = match self {
            ConflictPolicy::FolderThenOldest => {
                a.details.creation_time.cmp(&b.details.creation_time)
            }
            ConflictPolicy::LastModifiedFile if a.details.is_folder() => {
                a.details.creation_time.cmp(&b.details.creation_time)
            }
            ConflictPolicy::LastModifiedFile => b
                .details
                .modification_time
                .cmp(&a.details.modification_time),
        };
        by_time.then_with(|| a.file_id.cmp(&b.file_id))
    }
}

#[derive(Debug)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
    used_network: bool,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            used_network: false,
        }
    }

    pub fn used_network(&self) -> bool {
        self.used_network
    }

    #[instrument(skip(self, ctx), fields(policy = ?self.policy))]
    pub async fn run(&mut self, ctx: &mut SyncContext) -> SyncStatusCode {
        let service = ctx.remote_service.clone();
        let Some(database) = ctx.metadata_database.as_mut() else {
            warn!("Metadata database is not initialized");
            return SyncStatusCode::Failed;
        };

        // Resolution only runs on a clean tree.
        if database.has_dirty_tracker() {
            warn!(dirty = database.dirty_tracker_count(), "Refusing to resolve with dirty trackers");
            return SyncStatusCode::Failed;
        }

        if let Some((file_id, trackers)) = database.get_multi_parent_file_trackers() {
            return self
                .detach_from_non_primary_parents(service.as_ref(), database, &file_id, &trackers)
                .await;
        }

        if let Some(trackers) = database.get_conflicting_trackers() {
            return self
                .remove_non_primary_files(service.as_ref(), database, &trackers)
                .await;
        }

        debug!("No conflict found");
        SyncStatusCode::NoConflict
    }

    async fn detach_from_non_primary_parents(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
        file_id: &str,
        trackers: &TrackerSet,
    ) -> SyncStatusCode {
        let Some(active_id) = trackers.active_tracker() else {
            return SyncStatusCode::Failed;
        };
        let primary_parent = database
            .find_tracker_by_tracker_id(active_id)
            .and_then(|tracker| database.find_tracker_by_tracker_id(tracker.parent_tracker_id))
            .map(|parent| parent.file_id.clone());

        let mut parents_to_remove = Vec::new();
        for tracker_id in trackers.iter().filter(|id| *id != active_id) {
            let Some(parent) = database
                .find_tracker_by_tracker_id(tracker_id)
                .and_then(|tracker| database.find_tracker_by_tracker_id(tracker.parent_tracker_id))
            else {
                warn!(tracker_id, "Tracker without parent");
                return SyncStatusCode::Failed;
            };
            if Some(&parent.file_id) != primary_parent.as_ref()
                && !parents_to_remove.contains(&parent.file_id)
            {
                parents_to_remove.push(parent.file_id.clone());
            }
        }

        info!(file_id, parents = parents_to_remove.len(), "Detaching file from extra parents");
        self.used_network = true;
        for parent_id in &parents_to_remove {
            if let Err(e) = service.remove_parent(file_id, parent_id).await {
                if e.remote_code() != Some(RemoteErrorCode::NotFound) {
                    warn!(parent_id = %parent_id, error = %e, "Failed to detach parent");
                    return SyncStatusCode::from(&e);
                }
            }
        }

        match service.get_file_resource(file_id).await {
            Ok(resource) => match database.update_by_file_resource(&resource).await {
                Ok(()) => SyncStatusCode::Ok,
                Err(e) => e.status_code(),
            },
            Err(e) if e.remote_code() == Some(RemoteErrorCode::NotFound) => {
                match database.update_by_deleted_remote_file(file_id).await {
                    Ok(()) => SyncStatusCode::Ok,
                    Err(e) => e.status_code(),
                }
            }
            Err(e) => SyncStatusCode::from(&e),
        }
    }

    async fn remove_non_primary_files(
        &mut self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
        trackers: &TrackerSet,
    ) -> SyncStatusCode {
        let Some(primary) = self.pick_primary_file(database, trackers) else {
            warn!("No metadata for conflicting trackers");
            return SyncStatusCode::Failed;
        };

        // (file id, etag) of every loser, each file once.
        let mut non_primary: Vec<(String, Option<String>)> = Vec::new();
        for tracker_id in trackers.iter() {
            let Some(tracker) = database.find_tracker_by_tracker_id(tracker_id) else {
                continue;
            };
            if tracker.file_id == primary || non_primary.iter().any(|(id, _)| *id == tracker.file_id) {
                continue;
            }
            let etag = tracker
                .synced_details
                .as_ref()
                .map(|details| details.etag.clone())
                .filter(|etag| !etag.is_empty())
                .or_else(|| {
                    database
                        .find_file_by_file_id(&tracker.file_id)
                        .map(|file| file.details.etag.clone())
                        .filter(|etag| !etag.is_empty())
                });
            non_primary.push((tracker.file_id.clone(), etag));
        }

        info!(primary = %primary, losers = non_primary.len(), "Removing conflicting files");
        self.used_network = true;
        for (file_id, etag) in &non_primary {
            match service.delete_file(file_id, etag.as_deref()).await {
                Ok(()) => {}
                Err(e) => match e.remote_code() {
                    Some(RemoteErrorCode::NotFound) => {}
                    Some(RemoteErrorCode::PreconditionFailed | RemoteErrorCode::Conflict) => {
                        debug!(file_id = %file_id, "File changed since last sync");
                        return SyncStatusCode::Retry;
                    }
                    _ => return SyncStatusCode::from(&e),
                },
            }
            if let Err(e) = database.update_by_deleted_remote_file(file_id).await {
                return e.status_code();
            }
        }

        SyncStatusCode::Ok
    }

    fn pick_primary_file(&self, database: &MetadataDatabase, trackers: &TrackerSet) -> Option<String> {
        trackers
            .iter()
            .filter_map(|id| database.find_tracker_by_tracker_id(id))
            .filter_map(|tracker| database.find_file_by_file_id(&tracker.file_id))
            .min_by(|a, b| self.policy.compare(a, b))
            .map(|file| file.file_id.clone())
    }
}
