//! # Metadata Database
//!
//! Persistent index mirroring the remote file tree into per-app local views.
//!
//! ## Overview
//!
//! The database owns three record kinds (see [`crate::metadata`]) stored in an
//! ordered [`KeyValueStore`] and a set of derived in-memory indexes:
//!
//! - trackers by id, file metadata by file id
//! - trackers grouped by file id and by (parent tracker, title)
//! - app-root trackers by app id
//! - two dirty worksets, normal and low priority, ordered by tracker id
//!
//! Every mutation records which keys it touched while updating the in-memory
//! state; the write batch is then serialized from that same state and
//! committed atomically, so the store and the indexes never disagree.
//!
//! ## Invariants
//!
//! - every tracker hangs off the sync-root through a chain of active trackers
//! - at most one active tracker per file id
//! - at most one active tracker per (parent tracker, title)
//! - tracker ids are strictly increasing and never reused
//!
//! ## Usage
//!
//! ```ignore
//! use core_sync::MetadataDatabase;
//!
//! let mut db = MetadataDatabase::create(store).await?;
//! db.populate_initial_data(about.largest_change_id, &sync_root, &app_roots).await?;
//! db.register_app("example.com", &app_root.file_id).await?;
//! ```
//!
//! ## Errors
//!
//! Store failures surface as [`SyncError::Storage`] and map to
//! `DATABASE_ERROR_IO_ERROR`. The engine disables itself on those; there is
//! no attempt to repair the index in place.

use bridge_traits::{ChangeResource, FileResource, KeyValueStore, WriteBatch};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::metadata::{
    has_invalid_title, FileDetails, FileKind, FileMetadata, FileTracker, ServiceMetadata,
    TrackerKind,
};
use crate::tracker_set::TrackerSet;

pub const SERVICE_METADATA_KEY: &str = "service";
pub const FILE_METADATA_KEY_PREFIX: &str = "file:";
pub const FILE_TRACKER_KEY_PREFIX: &str = "tracker:";
pub const DATABASE_VERSION_KEY: &str = "version";
pub const CURRENT_DATABASE_VERSION: i64 = 1;

type TrackersByTitle = BTreeMap<String, TrackerSet>;

/// Keys touched by one mutation. The batch is built from the in-memory state
/// of these keys at commit time: present records are put, absent ones deleted.
#[derive(Debug, Default)]
struct PendingWrites {
    service_metadata: bool,
    files: BTreeSet<String>,
    trackers: BTreeSet<i64>,
}

#[derive(Debug, Default)]
struct DatabaseContents {
    service_metadata: Option<ServiceMetadata>,
    file_metadata: Vec<FileMetadata>,
    file_trackers: Vec<FileTracker>,
}

pub struct MetadataDatabase {
    store: Arc<dyn KeyValueStore>,
    service_metadata: ServiceMetadata,
    largest_known_change_id: i64,

    file_by_id: BTreeMap<String, FileMetadata>,
    tracker_by_id: BTreeMap<i64, FileTracker>,
    trackers_by_file_id: BTreeMap<String, TrackerSet>,
    trackers_by_parent_and_title: BTreeMap<i64, TrackersByTitle>,
    app_root_by_app_id: BTreeMap<String, i64>,

    dirty_trackers: BTreeSet<i64>,
    low_priority_dirty_trackers: BTreeSet<i64>,
}

impl std::fmt::Debug for MetadataDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataDatabase")
            .field("service_metadata", &self.service_metadata)
            .field("trackers", &self.tracker_by_id.len())
            .field("files", &self.file_by_id.len())
            .field("dirty", &self.dirty_tracker_count())
            .finish()
    }
}

impl MetadataDatabase {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens the index stored in `store`, creating it when the store is empty.
    ///
    /// Unreachable trackers and unreferenced metadata left over from an
    /// interrupted session are dropped before the indexes are built.
    #[instrument(skip(store))]
    pub async fn create(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let created = store.is_empty().await.map_err(SyncError::Storage)?;
        if created {
            store
                .put(
                    DATABASE_VERSION_KEY,
                    CURRENT_DATABASE_VERSION.to_string().as_bytes(),
                )
                .await
                .map_err(SyncError::Storage)?;
        } else {
            check_database_version(store.as_ref()).await?;
        }

        let mut contents = read_database_contents(store.as_ref()).await?;

        let mut batch = WriteBatch::new();
        initialize_service_metadata(&mut contents, &mut batch)?;
        remove_unreachable_items(&mut contents, &mut batch);
        if !batch.is_empty() {
            store.write(batch).await.map_err(SyncError::Storage)?;
        }

        let mut database = Self {
            store,
            service_metadata: ServiceMetadata::default(),
            largest_known_change_id: 0,
            file_by_id: BTreeMap::new(),
            tracker_by_id: BTreeMap::new(),
            trackers_by_file_id: BTreeMap::new(),
            trackers_by_parent_and_title: BTreeMap::new(),
            app_root_by_app_id: BTreeMap::new(),
            dirty_trackers: BTreeSet::new(),
            low_priority_dirty_trackers: BTreeSet::new(),
        };
        database.build_indexes(contents);

        info!(
            trackers = database.tracker_by_id.len(),
            files = database.file_by_id.len(),
            created,
            "Metadata database opened"
        );
        Ok(database)
    }

    /// Deletes every record of the index from the store.
    pub async fn clear_database(self) -> Result<()> {
        let entries = self.store.iterate().await.map_err(SyncError::Storage)?;
        let mut batch = WriteBatch::new();
        for (key, _) in entries {
            batch.delete(key);
        }
        info!(keys = batch.len(), "Clearing metadata database");
        self.store.write(batch).await.map_err(SyncError::Storage)
    }

    fn build_indexes(&mut self, contents: DatabaseContents) {
        self.service_metadata = contents.service_metadata.unwrap_or_default();
        self.update_largest_known_change_id(self.service_metadata.largest_change_id);

        for file in contents.file_metadata {
            self.file_by_id.insert(file.file_id.clone(), file);
        }

        for tracker in contents.file_trackers {
            let tracker_id = tracker.tracker_id;
            self.trackers_by_file_id
                .entry(tracker.file_id.clone())
                .or_default()
                .insert(tracker_id, tracker.active);

            if tracker.is_app_root() {
                if let Some(app_id) = &tracker.app_id {
                    self.app_root_by_app_id.insert(app_id.clone(), tracker_id);
                }
            }

            if tracker.parent_tracker_id != 0 {
                self.trackers_by_parent_and_title
                    .entry(tracker.parent_tracker_id)
                    .or_default()
                    .entry(tracker.title().to_string())
                    .or_default()
                    .insert(tracker_id, tracker.active);
            }

            if tracker.dirty {
                self.dirty_trackers.insert(tracker_id);
            }
            self.tracker_by_id.insert(tracker_id, tracker);
        }
    }

    // ========================================================================
    // Service metadata
    // ========================================================================

    pub fn largest_fetched_change_id(&self) -> i64 {
        self.service_metadata.largest_change_id
    }

    pub fn sync_root_tracker_id(&self) -> Option<i64> {
        self.service_metadata.sync_root_tracker_id
    }

    pub fn has_sync_root(&self) -> bool {
        self.service_metadata.sync_root_tracker_id.is_some()
    }

    pub fn largest_known_change_id(&self) -> i64 {
        self.largest_known_change_id
    }

    /// Raises the in-memory change id high-water mark; never lowers it.
    pub fn update_largest_known_change_id(&mut self, change_id: i64) {
        if self.largest_known_change_id < change_id {
            self.largest_known_change_id = change_id;
        }
    }

    /// Bootstraps an empty index with an active clean sync-root tracker and
    /// inactive clean trackers for each app-root candidate folder.
    ///
    /// A database that already has a sync-root is left untouched.
    #[instrument(skip(self, sync_root_folder, app_root_folders), fields(sync_root = %sync_root_folder.file_id))]
    pub async fn populate_initial_data(
        &mut self,
        largest_change_id: i64,
        sync_root_folder: &FileResource,
        app_root_folders: &[FileResource],
    ) -> Result<()> {
        if self.has_sync_root() {
            warn!("Sync-root already populated, skipping initial data");
            return Ok(());
        }

        let mut writes = PendingWrites::default();
        self.service_metadata.largest_change_id = largest_change_id;
        self.update_largest_known_change_id(largest_change_id);

        let sync_root_tracker_id = self.next_tracker_id(&mut writes);
        let details = FileDetails::from_resource(sync_root_folder);
        self.insert_initial_tracker(FileTracker {
            tracker_id: sync_root_tracker_id,
            parent_tracker_id: 0,
            file_id: sync_root_folder.file_id.clone(),
            app_id: None,
            tracker_kind: TrackerKind::Regular,
            synced_details: Some(details.clone()),
            dirty: false,
            active: true,
            needs_folder_listing: false,
        }, details, &mut writes);
        self.service_metadata.sync_root_tracker_id = Some(sync_root_tracker_id);

        for folder in app_root_folders {
            let tracker_id = self.next_tracker_id(&mut writes);
            let details = FileDetails::from_resource(folder);
            self.insert_initial_tracker(FileTracker {
                tracker_id,
                parent_tracker_id: sync_root_tracker_id,
                file_id: folder.file_id.clone(),
                app_id: None,
                tracker_kind: TrackerKind::Regular,
                synced_details: Some(details.clone()),
                dirty: false,
                active: false,
                needs_folder_listing: false,
            }, details, &mut writes);
        }

        info!(
            app_root_candidates = app_root_folders.len(),
            largest_change_id, "Populated initial data"
        );
        self.write_to_database(writes).await
    }

    fn insert_initial_tracker(
        &mut self,
        tracker: FileTracker,
        details: FileDetails,
        writes: &mut PendingWrites,
    ) {
        let tracker_id = tracker.tracker_id;
        let file_id = tracker.file_id.clone();

        self.trackers_by_file_id
            .entry(file_id.clone())
            .or_default()
            .insert(tracker_id, tracker.active);
        if tracker.parent_tracker_id != 0 {
            self.title_index_insert(
                tracker.parent_tracker_id,
                &details.title,
                tracker_id,
                tracker.active,
            );
        }

        self.file_by_id.insert(
            file_id.clone(),
            FileMetadata {
                file_id: file_id.clone(),
                details,
            },
        );
        self.tracker_by_id.insert(tracker_id, tracker);
        writes.files.insert(file_id);
        writes.trackers.insert(tracker_id);
        writes.service_metadata = true;
    }

    // ========================================================================
    // App registration
    // ========================================================================

    pub fn is_app_enabled(&self, app_id: &str) -> bool {
        self.find_app_root_tracker(app_id)
            .map(|tracker| tracker.tracker_kind == TrackerKind::AppRoot)
            .unwrap_or(false)
    }

    /// Turns the sync-root child tracking `folder_id` into the app-root of
    /// `app_id`. Registering an already registered app is a no-op.
    #[instrument(skip(self))]
    pub async fn register_app(&mut self, app_id: &str, folder_id: &str) -> Result<()> {
        if self.find_app_root_tracker(app_id).is_some() {
            debug!("App-root already registered");
            return Ok(());
        }

        let sync_root_tracker_id = self.sync_root_tracker_id().ok_or_else(|| {
            SyncError::NotFound("sync-root must be set up before registering apps".to_string())
        })?;
        let Some(trackers) = self.find_trackers_by_file_id(folder_id) else {
            warn!("Folder is missing from the index");
            return Err(SyncError::Conflict(format!(
                "cannot register {} on folder {}",
                app_id, folder_id
            )));
        };
        let tracker_id = trackers
            .iter()
            .find(|id| {
                self.tracker_by_id
                    .get(id)
                    .map(|tracker| tracker.parent_tracker_id == sync_root_tracker_id)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                SyncError::NotFound(format!("no sync-root child tracks folder {}", folder_id))
            })?;
        self.register_app_tracker(app_id, tracker_id).await
    }

    /// Turns the given sync-root child tracker into the app-root of `app_id`.
    #[instrument(skip(self))]
    pub async fn register_app_tracker(&mut self, app_id: &str, tracker_id: i64) -> Result<()> {
        if self.find_app_root_tracker(app_id).is_some() {
            debug!("App-root already registered");
            return Ok(());
        }

        let sync_root_tracker_id = self.sync_root_tracker_id().ok_or_else(|| {
            SyncError::NotFound("sync-root must be set up before registering apps".to_string())
        })?;
        let tracker = self
            .tracker_by_id
            .get(&tracker_id)
            .ok_or_else(|| SyncError::NotFound(format!("tracker {}", tracker_id)))?;
        if tracker.parent_tracker_id != sync_root_tracker_id {
            return Err(SyncError::InvalidState(format!(
                "tracker {} is not a sync-root child",
                tracker_id
            )));
        }
        let folder_tracked_elsewhere = self
            .find_trackers_by_file_id(&tracker.file_id)
            .map(|trackers| trackers.has_active())
            .unwrap_or(false);
        if folder_tracked_elsewhere {
            warn!("Folder is tracked by another tracker");
            return Err(SyncError::Conflict(format!(
                "cannot register {} on folder {}",
                app_id, tracker.file_id
            )));
        }

        let mut writes = PendingWrites::default();
        self.register_tracker_as_app_root(app_id, tracker_id, &mut writes);
        info!(tracker_id, "Registered app");
        self.write_to_database(writes).await
    }

    #[instrument(skip(self))]
    pub async fn disable_app(&mut self, app_id: &str) -> Result<()> {
        let tracker = self
            .find_app_root_tracker(app_id)
            .ok_or_else(|| SyncError::NotFound(format!("app {} is not registered", app_id)))?;
        if tracker.tracker_kind == TrackerKind::DisabledAppRoot {
            return Ok(());
        }
        let tracker_id = tracker.tracker_id;

        let mut writes = PendingWrites::default();
        // Stays active so no conflicting tracker can take its place.
        if let Some(tracker) = self.tracker_by_id.get_mut(&tracker_id) {
            tracker.tracker_kind = TrackerKind::DisabledAppRoot;
            writes.trackers.insert(tracker_id);
        }
        info!(tracker_id, "Disabled app");
        self.write_to_database(writes).await
    }

    #[instrument(skip(self))]
    pub async fn enable_app(&mut self, app_id: &str) -> Result<()> {
        let tracker = self
            .find_app_root_tracker(app_id)
            .filter(|tracker| tracker.tracker_kind != TrackerKind::Regular)
            .ok_or_else(|| SyncError::NotFound(format!("app {} is not registered", app_id)))?;
        if tracker.tracker_kind == TrackerKind::AppRoot {
            return Ok(());
        }
        let tracker_id = tracker.tracker_id;

        let mut writes = PendingWrites::default();
        if let Some(tracker) = self.tracker_by_id.get_mut(&tracker_id) {
            tracker.tracker_kind = TrackerKind::AppRoot;
            writes.trackers.insert(tracker_id);
        }
        // Anything may have changed while the app was disabled.
        self.recursive_mark_tracker_as_dirty(tracker_id, &mut writes);
        info!(tracker_id, "Enabled app");
        self.write_to_database(writes).await
    }

    /// Drops the app-root of `app_id` and its whole subtree. Unknown apps are
    /// a no-op.
    #[instrument(skip(self))]
    pub async fn unregister_app(&mut self, app_id: &str) -> Result<()> {
        let registered = self
            .find_app_root_tracker(app_id)
            .map(|tracker| tracker.tracker_kind != TrackerKind::Regular)
            .unwrap_or(false);
        if !registered {
            return Ok(());
        }

        let mut writes = PendingWrites::default();
        self.unregister_tracker_as_app_root(app_id, &mut writes);
        info!("Unregistered app");
        self.write_to_database(writes).await
    }

    pub fn registered_app_ids(&self) -> Vec<String> {
        self.app_root_by_app_id.keys().cloned().collect()
    }

    fn register_tracker_as_app_root(
        &mut self,
        app_id: &str,
        tracker_id: i64,
        writes: &mut PendingWrites,
    ) {
        let Some(tracker) = self.tracker_by_id.get_mut(&tracker_id) else {
            return;
        };
        tracker.app_id = Some(app_id.to_string());
        tracker.tracker_kind = TrackerKind::AppRoot;
        self.app_root_by_app_id.insert(app_id.to_string(), tracker_id);

        self.make_tracker_active(tracker_id, writes);
    }

    fn unregister_tracker_as_app_root(&mut self, app_id: &str, writes: &mut PendingWrites) {
        let Some(tracker_id) = self.app_root_by_app_id.remove(app_id) else {
            return;
        };
        let active = match self.tracker_by_id.get_mut(&tracker_id) {
            Some(tracker) => {
                tracker.app_id = None;
                tracker.tracker_kind = TrackerKind::Regular;
                tracker.active
            }
            None => return,
        };

        // Kind is regular again, so deactivation drops all descendants.
        if active {
            self.make_tracker_inactive(tracker_id, writes);
        } else {
            writes.trackers.insert(tracker_id);
        }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn find_app_root_tracker(&self, app_id: &str) -> Option<&FileTracker> {
        self.app_root_by_app_id
            .get(app_id)
            .and_then(|tracker_id| self.tracker_by_id.get(tracker_id))
    }

    pub fn find_file_by_file_id(&self, file_id: &str) -> Option<&FileMetadata> {
        self.file_by_id.get(file_id)
    }

    pub fn find_trackers_by_file_id(&self, file_id: &str) -> Option<&TrackerSet> {
        self.trackers_by_file_id.get(file_id)
    }

    pub fn find_trackers_by_parent_and_title(
        &self,
        parent_tracker_id: i64,
        title: &str,
    ) -> Option<&TrackerSet> {
        self.trackers_by_parent_and_title
            .get(&parent_tracker_id)
            .and_then(|by_title| by_title.get(title))
    }

    pub fn find_tracker_by_tracker_id(&self, tracker_id: i64) -> Option<&FileTracker> {
        self.tracker_by_id.get(&tracker_id)
    }

    /// Path of an active tracker relative to its app-root: `/` for the
    /// app-root itself, `/a/b` below it.
    ///
    /// Returns `None` when any link up to the app-root is inactive or untitled.
    pub fn build_path_for_tracker(&self, tracker_id: i64) -> Option<String> {
        let mut current = self.tracker_by_id.get(&tracker_id)?;
        if !current.active {
            return None;
        }

        let mut components = Vec::new();
        while !current.is_app_root() {
            let title = current.title();
            if title.is_empty() {
                return None;
            }
            components.push(title);
            current = self.tracker_by_id.get(&current.parent_tracker_id)?;
            if !current.active {
                return None;
            }
        }

        if components.is_empty() {
            return Some("/".to_string());
        }
        components.reverse();
        Some(format!("/{}", components.join("/")))
    }

    /// Best-effort path for logs and dumps, also for inactive trackers.
    pub fn build_display_path_for_tracker(&self, tracker: &FileTracker) -> String {
        if tracker.active {
            return self
                .build_path_for_tracker(tracker.tracker_id)
                .unwrap_or_default();
        }

        let base = self
            .build_path_for_tracker(tracker.parent_tracker_id)
            .unwrap_or_default();
        let title = match &tracker.synced_details {
            Some(details) => details.title.as_str(),
            None => "<unknown>",
        };
        if base.is_empty() {
            title.to_string()
        } else if base.ends_with('/') {
            format!("{}{}", base, title)
        } else {
            format!("{}/{}", base, title)
        }
    }

    /// Walks `path` (relative, `/` separated) down from the app-root of
    /// `app_id` through active trackers.
    ///
    /// Returns the deepest active tracker reached and the matched prefix of
    /// `path`. `None` when the path is absolute or the app is unknown or
    /// disabled.
    pub fn find_nearest_active_ancestor(
        &self,
        app_id: &str,
        path: &str,
    ) -> Option<(FileTracker, String)> {
        if path.starts_with('/') {
            return None;
        }
        let mut tracker = self.find_app_root_tracker(app_id)?;
        if tracker.tracker_kind == TrackerKind::DisabledAppRoot {
            return None;
        }

        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut matched = Vec::new();
        for (i, component) in components.iter().enumerate() {
            let Some(active) = self
                .find_trackers_by_parent_and_title(tracker.tracker_id, component)
                .and_then(TrackerSet::active_tracker)
                .and_then(|id| self.tracker_by_id.get(&id))
            else {
                break;
            };

            // A file can only be the last component.
            if !active.is_folder() && i != components.len() - 1 {
                break;
            }
            tracker = active;
            matched.push(*component);
        }

        Some((tracker.clone(), matched.join("/")))
    }

    // ========================================================================
    // Remote updates
    // ========================================================================

    /// Applies one page run of the remote change feed. Changes older than the
    /// stored metadata for the same file are skipped.
    #[instrument(skip(self, changes), fields(changes = changes.len()))]
    pub async fn update_by_change_list(
        &mut self,
        largest_change_id: i64,
        changes: &[ChangeResource],
    ) -> Result<()> {
        let mut writes = PendingWrites::default();
        for change in changes {
            if self.has_newer_file_metadata(&change.file_id, change.change_id) {
                debug!(file_id = %change.file_id, change_id = change.change_id, "Skipping stale change");
                continue;
            }
            self.update_by_file_metadata(FileMetadata::from_change(change), &mut writes);
        }

        self.update_largest_known_change_id(largest_change_id);
        self.service_metadata.largest_change_id = largest_change_id;
        writes.service_metadata = true;
        self.write_to_database(writes).await
    }

    pub async fn update_by_file_resource(&mut self, resource: &FileResource) -> Result<()> {
        let mut writes = PendingWrites::default();
        let file = FileMetadata::from_resource(self.largest_known_change_id, resource);
        self.update_by_file_metadata(file, &mut writes);
        self.write_to_database(writes).await
    }

    pub async fn update_by_file_resource_list(&mut self, resources: &[FileResource]) -> Result<()> {
        let mut writes = PendingWrites::default();
        for resource in resources {
            let file = FileMetadata::from_resource(self.largest_known_change_id, resource);
            self.update_by_file_metadata(file, &mut writes);
        }
        self.write_to_database(writes).await
    }

    pub async fn update_by_deleted_remote_file(&mut self, file_id: &str) -> Result<()> {
        let mut writes = PendingWrites::default();
        let file = FileMetadata::deleted(self.largest_known_change_id, file_id);
        self.update_by_file_metadata(file, &mut writes);
        self.write_to_database(writes).await
    }

    /// Registers a resource just created remotely under `parent_tracker_id`
    /// and makes its tracker the active one for that title, deactivating the
    /// previous holder.
    #[instrument(skip(self, resource), fields(file_id = %resource.file_id))]
    pub async fn replace_active_tracker_with_new_resource(
        &mut self,
        parent_tracker_id: i64,
        resource: &FileResource,
    ) -> Result<()> {
        let mut writes = PendingWrites::default();
        let file = FileMetadata::from_resource(self.largest_known_change_id, resource);
        let file_id = file.file_id.clone();
        let details = file.details.clone();

        self.maybe_add_trackers_for_new_file(&file, &mut writes);
        self.file_by_id.insert(file_id.clone(), file);
        writes.files.insert(file_id.clone());

        let new_tracker_id = self
            .trackers_by_file_id
            .get(&file_id)
            .and_then(|set| {
                set.iter().find(|id| {
                    self.tracker_by_id
                        .get(id)
                        .map(|t| t.parent_tracker_id == parent_tracker_id)
                        .unwrap_or(false)
                })
            })
            .ok_or_else(|| {
                SyncError::NotFound(format!(
                    "no tracker for {} under tracker {}",
                    file_id, parent_tracker_id
                ))
            })?;

        if let Some(active) = self
            .find_trackers_by_parent_and_title(parent_tracker_id, &details.title)
            .and_then(TrackerSet::active_tracker)
        {
            if active != new_tracker_id {
                self.make_tracker_inactive(active, &mut writes);
            }
        }

        self.set_synced_details(new_tracker_id, details);
        let is_active = self
            .tracker_by_id
            .get(&new_tracker_id)
            .map(|t| t.active)
            .unwrap_or(false);
        if !is_active {
            self.make_tracker_active(new_tracker_id, &mut writes);
        }

        if let Some(tracker) = self.tracker_by_id.get_mut(&new_tracker_id) {
            // Freshly created, so there is nothing to list.
            tracker.needs_folder_listing = false;
            tracker.dirty = false;
        }
        self.dirty_trackers.remove(&new_tracker_id);
        self.low_priority_dirty_trackers.remove(&new_tracker_id);
        writes.trackers.insert(new_tracker_id);

        debug!(tracker_id = new_tracker_id, "Activated tracker for new resource");
        self.write_to_database(writes).await
    }

    /// Public form of tracker creation for a known file id.
    pub async fn create_tracker_for_parent_and_file_id(
        &mut self,
        parent_tracker_id: i64,
        file_id: &str,
    ) -> Result<i64> {
        self.ensure_tracker_exists(parent_tracker_id)?;
        let mut writes = PendingWrites::default();
        let tracker_id = self.create_tracker_internal(parent_tracker_id, file_id, None, &mut writes);
        self.write_to_database(writes).await?;
        Ok(tracker_id)
    }

    /// Public form of tracker creation seeded with remote details.
    pub async fn create_tracker_for_parent_and_file_metadata(
        &mut self,
        parent_tracker_id: i64,
        file: &FileMetadata,
    ) -> Result<i64> {
        self.ensure_tracker_exists(parent_tracker_id)?;
        let mut writes = PendingWrites::default();
        let tracker_id = self.create_tracker_internal(
            parent_tracker_id,
            &file.file_id,
            Some(&file.details),
            &mut writes,
        );
        self.write_to_database(writes).await?;
        Ok(tracker_id)
    }

    /// Reconciles the children of the active tracker of `folder_id` with a
    /// complete remote listing: unknown children get trackers, children no
    /// longer listed are dropped, and the folder stops needing a listing.
    #[instrument(skip(self, child_file_ids), fields(children = child_file_ids.len()))]
    pub async fn populate_folder_by_child_list(
        &mut self,
        folder_id: &str,
        child_file_ids: &[String],
    ) -> Result<()> {
        // Inactive folders ignore content updates.
        let Some(folder_tracker_id) = self
            .find_trackers_by_file_id(folder_id)
            .and_then(TrackerSet::active_tracker)
        else {
            return Ok(());
        };

        let listed: BTreeSet<&str> = child_file_ids.iter().map(String::as_str).collect();
        let mut to_create: BTreeSet<&str> = listed.clone();
        let mut extraneous = Vec::new();
        for child_id in self.child_tracker_ids(folder_tracker_id) {
            if let Some(child) = self.tracker_by_id.get(&child_id) {
                if listed.contains(child.file_id.as_str()) {
                    to_create.remove(child.file_id.as_str());
                } else {
                    extraneous.push(child_id);
                }
            }
        }

        let mut writes = PendingWrites::default();
        for tracker_id in extraneous {
            self.remove_tracker(tracker_id, &mut writes);
        }
        for file_id in to_create {
            self.create_tracker_internal(folder_tracker_id, file_id, None, &mut writes);
        }

        if let Some(folder) = self.tracker_by_id.get_mut(&folder_tracker_id) {
            folder.needs_folder_listing = false;
        }
        self.clear_dirty_unless_needed(folder_tracker_id);
        writes.trackers.insert(folder_tracker_id);

        self.write_to_database(writes).await
    }

    /// Records that `tracker_id` has been reconciled to `updated_details`.
    ///
    /// A tracker whose file is gone, left its parent or was renamed is
    /// removed; other trackers take over those positions. Otherwise the
    /// tracker is activated when nothing else holds its file id or path.
    #[instrument(skip(self, updated_details), fields(title = %updated_details.title))]
    pub async fn update_tracker(
        &mut self,
        tracker_id: i64,
        updated_details: &FileDetails,
    ) -> Result<()> {
        let tracker = self
            .tracker_by_id
            .get(&tracker_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("tracker {}", tracker_id)))?;

        let mut writes = PendingWrites::default();

        if updated_details.missing {
            let remote_missing = self
                .file_by_id
                .get(&tracker.file_id)
                .map(|file| file.details.missing)
                .unwrap_or(true);
            if remote_missing {
                // Both sides agree the file is gone.
                self.remove_tracker(tracker_id, &mut writes);
                return self.write_to_database(writes).await;
            }
        }

        if Some(tracker_id) != self.sync_root_tracker_id() {
            let parent_file_id = self
                .tracker_by_id
                .get(&tracker.parent_tracker_id)
                .map(|parent| parent.file_id.clone())
                .ok_or_else(|| {
                    SyncError::NotFound(format!("parent tracker {}", tracker.parent_tracker_id))
                })?;

            if !updated_details.has_parent(&parent_file_id) {
                self.remove_tracker(tracker_id, &mut writes);
                return self.write_to_database(writes).await;
            }

            match &tracker.synced_details {
                Some(synced) if synced.title != updated_details.title => {
                    self.remove_tracker(tracker_id, &mut writes);
                    return self.write_to_database(writes).await;
                }
                Some(_) => {}
                None => {
                    let duplicate = self
                        .find_trackers_by_parent_and_title(
                            tracker.parent_tracker_id,
                            &updated_details.title,
                        )
                        .map(|set| {
                            set.iter().any(|id| {
                                self.tracker_by_id
                                    .get(&id)
                                    .map(|t| t.file_id == tracker.file_id)
                                    .unwrap_or(false)
                            })
                        })
                        .unwrap_or(false);
                    if duplicate {
                        self.remove_tracker(tracker_id, &mut writes);
                        return self.write_to_database(writes).await;
                    }
                }
            }
        }

        self.set_synced_details(tracker_id, updated_details.clone());

        if !tracker.active && self.can_activate_tracker(tracker_id) {
            self.make_tracker_active(tracker_id, &mut writes);
        }
        self.clear_dirty_unless_needed(tracker_id);
        writes.trackers.insert(tracker_id);

        self.write_to_database(writes).await
    }

    /// Activates the tracker of `file_id` under `parent_tracker_id` with the
    /// latest remote details, but only if that deactivates nothing else.
    ///
    /// Returns `Ok(false)` without touching the index when another tracker
    /// already holds the file id or the (parent, title) slot.
    #[instrument(skip(self))]
    pub async fn try_no_side_effect_activation(
        &mut self,
        parent_tracker_id: i64,
        file_id: &str,
    ) -> Result<bool> {
        let file = self
            .file_by_id
            .get(file_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("file {}", file_id)))?;
        let title = file.details.title.clone();

        let same_file_id = self
            .trackers_by_file_id
            .get(file_id)
            .cloned()
            .unwrap_or_default();

        let tracker_id = same_file_id
            .iter()
            .filter(|id| {
                self.tracker_by_id
                    .get(id)
                    .map(|t| {
                        t.parent_tracker_id == parent_tracker_id
                            && t.synced_details
                                .as_ref()
                                .map_or(true, |details| details.title == title)
                    })
                    .unwrap_or(false)
            })
            .last()
            .ok_or_else(|| {
                SyncError::NotFound(format!(
                    "no tracker for {} under tracker {}",
                    file_id, parent_tracker_id
                ))
            })?;

        let active = self
            .tracker_by_id
            .get(&tracker_id)
            .map(|t| t.active)
            .unwrap_or(false);
        if !active {
            if same_file_id.has_active() {
                return Ok(false);
            }
            let path_taken = self
                .find_trackers_by_parent_and_title(parent_tracker_id, &title)
                .map(TrackerSet::has_active)
                .unwrap_or(false);
            if path_taken {
                return Ok(false);
            }
        }

        let mut writes = PendingWrites::default();
        self.set_synced_details(tracker_id, file.details);
        if !active {
            self.make_tracker_active(tracker_id, &mut writes);
        }

        // A folder that already existed remotely still needs its children listed.
        if let Some(tracker) = self.tracker_by_id.get_mut(&tracker_id) {
            tracker.dirty = tracker.needs_folder_listing;
        }
        let still_dirty = self
            .tracker_by_id
            .get(&tracker_id)
            .map(|t| t.dirty)
            .unwrap_or(false);
        self.low_priority_dirty_trackers.remove(&tracker_id);
        if still_dirty {
            self.dirty_trackers.insert(tracker_id);
        } else {
            self.dirty_trackers.remove(&tracker_id);
        }
        writes.trackers.insert(tracker_id);

        self.write_to_database(writes).await?;
        Ok(true)
    }

    // ========================================================================
    // Dirty worksets
    // ========================================================================

    /// Moves a normal priority dirty tracker to the low priority set.
    pub fn lower_tracker_priority(&mut self, tracker_id: i64) {
        if self.dirty_trackers.remove(&tracker_id) {
            self.low_priority_dirty_trackers.insert(tracker_id);
        }
    }

    pub fn promote_lower_priority_trackers_to_normal(&mut self) {
        if self.dirty_trackers.is_empty() {
            std::mem::swap(&mut self.dirty_trackers, &mut self.low_priority_dirty_trackers);
            return;
        }
        self.dirty_trackers
            .append(&mut self.low_priority_dirty_trackers);
    }

    /// Lowest-id normal priority dirty tracker
    pub fn get_normal_priority_dirty_tracker(&self) -> Option<&FileTracker> {
        self.dirty_trackers
            .iter()
            .next()
            .and_then(|id| self.tracker_by_id.get(id))
    }

    pub fn get_low_priority_dirty_tracker(&self) -> Option<&FileTracker> {
        self.low_priority_dirty_trackers
            .iter()
            .next()
            .and_then(|id| self.tracker_by_id.get(id))
    }

    pub fn has_dirty_tracker(&self) -> bool {
        !self.dirty_trackers.is_empty() || !self.low_priority_dirty_trackers.is_empty()
    }

    pub fn dirty_tracker_count(&self) -> usize {
        self.dirty_trackers.len() + self.low_priority_dirty_trackers.len()
    }

    // ========================================================================
    // Conflict discovery
    // ========================================================================

    /// First file id tracked at several positions while one of them is active.
    pub fn get_multi_parent_file_trackers(&self) -> Option<(String, TrackerSet)> {
        self.trackers_by_file_id
            .iter()
            .find(|(_, set)| set.len() > 1 && set.has_active())
            .map(|(file_id, set)| (file_id.clone(), set.clone()))
    }

    /// First (parent, title) slot shared by several trackers while one is active.
    pub fn get_conflicting_trackers(&self) -> Option<TrackerSet> {
        self.trackers_by_parent_and_title
            .values()
            .flat_map(|by_title| by_title.values())
            .find(|set| set.len() > 1 && set.has_active())
            .cloned()
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Every tracker below the app-root of `app_id`.
    pub fn dump_files(&self, app_id: &str) -> Value {
        let Some(app_root) = self.find_app_root_tracker(app_id) else {
            return Value::Array(Vec::new());
        };

        let mut files = Vec::new();
        let mut stack = self.child_tracker_ids(app_root.tracker_id);
        while let Some(tracker_id) = stack.pop() {
            stack.extend(self.child_tracker_ids(tracker_id));
            let Some(tracker) = self.tracker_by_id.get(&tracker_id) else {
                continue;
            };

            let mut entry = json!({
                "path": self.build_display_path_for_tracker(tracker),
                "details": {
                    "file_id": tracker.file_id,
                    "active": tracker.active,
                    "dirty": tracker.dirty,
                },
            });
            if let Some(details) = &tracker.synced_details {
                entry["title"] = json!(details.title);
                entry["type"] = json!(details.file_kind.as_str());
                if details.file_kind == FileKind::File {
                    entry["details"]["content_hash"] = json!(details.content_hash);
                }
            }
            files.push(entry);
        }
        Value::Array(files)
    }

    /// All trackers followed by all file metadata.
    pub fn dump_database(&self) -> Value {
        json!([self.dump_trackers(), self.dump_metadata()])
    }

    fn dump_trackers(&self) -> Value {
        let trackers: Vec<Value> = self
            .tracker_by_id
            .values()
            .map(|tracker| {
                let kind = match tracker.tracker_kind {
                    TrackerKind::AppRoot => "AppRoot",
                    TrackerKind::DisabledAppRoot => "Disabled App",
                    TrackerKind::Regular
                        if Some(tracker.tracker_id) == self.sync_root_tracker_id() =>
                    {
                        "SyncRoot"
                    }
                    TrackerKind::Regular => "Regular",
                };
                let mut entry = json!({
                    "tracker_id": tracker.tracker_id,
                    "path": self.build_display_path_for_tracker(tracker),
                    "file_id": tracker.file_id,
                    "tracker_kind": kind,
                    "app_id": tracker.app_id,
                    "active": tracker.active,
                    "dirty": tracker.dirty,
                    "folder_listing": if tracker.needs_folder_listing { "needed" } else { "no" },
                });
                if let Some(details) = &tracker.synced_details {
                    append_details(&mut entry, details);
                }
                entry
            })
            .collect();

        json!({ "title": "Trackers", "entries": trackers })
    }

    fn dump_metadata(&self) -> Value {
        let files: Vec<Value> = self
            .file_by_id
            .values()
            .map(|file| {
                let mut entry = json!({ "file_id": file.file_id });
                append_details(&mut entry, &file.details);
                entry["parents"] = json!(file.details.parent_folder_ids.join(","));
                entry
            })
            .collect();

        json!({ "title": "Metadata", "entries": files })
    }

    // ========================================================================
    // Internal mutation helpers
    // ========================================================================

    fn next_tracker_id(&mut self, writes: &mut PendingWrites) -> i64 {
        let tracker_id = self.service_metadata.next_tracker_id;
        self.service_metadata.next_tracker_id = tracker_id + 1;
        writes.service_metadata = true;
        tracker_id
    }

    fn ensure_tracker_exists(&self, tracker_id: i64) -> Result<()> {
        if self.tracker_by_id.contains_key(&tracker_id) {
            Ok(())
        } else {
            Err(SyncError::NotFound(format!("tracker {}", tracker_id)))
        }
    }

    fn has_newer_file_metadata(&self, file_id: &str, change_id: i64) -> bool {
        self.file_by_id
            .get(file_id)
            .map(|file| file.details.change_id >= change_id)
            .unwrap_or(false)
    }

    fn update_by_file_metadata(&mut self, file: FileMetadata, writes: &mut PendingWrites) {
        debug!(
            file_id = %file.file_id,
            title = %file.details.title,
            missing = file.details.missing,
            "Updating file metadata"
        );

        let file_id = file.file_id.clone();
        if file.details.missing {
            let tracker_ids: Vec<i64> = self
                .trackers_by_file_id
                .get(&file_id)
                .map(|set| set.iter().collect())
                .unwrap_or_default();
            for tracker_id in tracker_ids {
                let unsynced = self
                    .tracker_by_id
                    .get(&tracker_id)
                    .map(|t| t.synced_details.as_ref().map_or(true, |d| d.missing))
                    .unwrap_or(false);
                if unsynced {
                    self.remove_tracker(tracker_id, writes);
                }
            }
        } else {
            self.maybe_add_trackers_for_new_file(&file, writes);
        }

        if self.trackers_by_file_id.contains_key(&file_id) {
            self.mark_trackers_dirty_by_file_id(&file_id, writes);
            self.file_by_id.insert(file_id.clone(), file);
            writes.files.insert(file_id);
        }
    }

    /// Creates a tracker under every active tracker of each remote parent,
    /// unless that parent already tracks the file under the same or an
    /// unknown title.
    fn maybe_add_trackers_for_new_file(&mut self, file: &FileMetadata, writes: &mut PendingWrites) {
        let mut parents_to_exclude = BTreeSet::new();
        if let Some(set) = self.trackers_by_file_id.get(&file.file_id) {
            for tracker_id in set.iter() {
                let Some(tracker) = self.tracker_by_id.get(&tracker_id) else {
                    continue;
                };
                if tracker.parent_tracker_id == 0 {
                    continue;
                }
                let same_title = tracker
                    .synced_details
                    .as_ref()
                    .map_or(true, |details| details.title == file.details.title);
                if same_title {
                    parents_to_exclude.insert(tracker.parent_tracker_id);
                }
            }
        }

        for parent_folder_id in &file.details.parent_folder_ids {
            let parent_tracker_ids: Vec<i64> = self
                .trackers_by_file_id
                .get(parent_folder_id)
                .map(|set| {
                    set.iter()
                        .filter(|id| {
                            self.tracker_by_id.get(id).map(|t| t.active).unwrap_or(false)
                                && !parents_to_exclude.contains(id)
                        })
                        .collect()
                })
                .unwrap_or_default();

            for parent_tracker_id in parent_tracker_ids {
                self.create_tracker_internal(
                    parent_tracker_id,
                    &file.file_id,
                    Some(&file.details),
                    writes,
                );
            }
        }
    }

    fn create_tracker_internal(
        &mut self,
        parent_tracker_id: i64,
        file_id: &str,
        details: Option<&FileDetails>,
        writes: &mut PendingWrites,
    ) -> i64 {
        let app_id = self
            .tracker_by_id
            .get(&parent_tracker_id)
            .and_then(|parent| parent.app_id.clone());
        let tracker_id = self.next_tracker_id(writes);

        // Not synced to local yet, hence missing and without content hash.
        let synced_details = details.map(|details| FileDetails {
            missing: true,
            content_hash: None,
            ..details.clone()
        });
        let title = synced_details
            .as_ref()
            .map(|details| details.title.clone())
            .unwrap_or_default();

        let tracker = FileTracker {
            tracker_id,
            parent_tracker_id,
            file_id: file_id.to_string(),
            app_id,
            tracker_kind: TrackerKind::Regular,
            synced_details,
            dirty: true,
            active: false,
            needs_folder_listing: false,
        };

        self.trackers_by_file_id
            .entry(file_id.to_string())
            .or_default()
            .insert(tracker_id, false);
        self.title_index_insert(parent_tracker_id, &title, tracker_id, false);
        self.dirty_trackers.insert(tracker_id);
        self.tracker_by_id.insert(tracker_id, tracker);
        writes.trackers.insert(tracker_id);

        debug!(tracker_id, parent_tracker_id, file_id, "Created tracker");
        tracker_id
    }

    fn make_tracker_active(&mut self, tracker_id: i64, writes: &mut PendingWrites) {
        let Some(tracker) = self.tracker_by_id.get_mut(&tracker_id) else {
            return;
        };
        tracker.active = true;
        tracker.needs_folder_listing = tracker.is_folder();
        tracker.dirty = true;
        let file_id = tracker.file_id.clone();
        let parent_tracker_id = tracker.parent_tracker_id;
        let title = tracker.title().to_string();

        if let Some(set) = self.trackers_by_file_id.get_mut(&file_id) {
            set.activate(tracker_id);
        }
        if parent_tracker_id != 0 {
            if let Some(set) = self.title_set_mut(parent_tracker_id, &title) {
                set.activate(tracker_id);
            }
        }

        // Newly active trackers are normal priority.
        self.low_priority_dirty_trackers.remove(&tracker_id);
        self.dirty_trackers.insert(tracker_id);
        writes.trackers.insert(tracker_id);
    }

    fn make_tracker_inactive(&mut self, tracker_id: i64, writes: &mut PendingWrites) {
        let Some(tracker) = self.tracker_by_id.get_mut(&tracker_id) else {
            return;
        };
        tracker.active = false;
        let file_id = tracker.file_id.clone();
        let parent_tracker_id = tracker.parent_tracker_id;
        let title = tracker.title().to_string();

        if let Some(set) = self.trackers_by_file_id.get_mut(&file_id) {
            set.inactivate(tracker_id);
        }
        if parent_tracker_id != 0 {
            if let Some(set) = self.title_set_mut(parent_tracker_id, &title) {
                set.inactivate(tracker_id);
            }
        }

        self.remove_all_descendant_trackers(tracker_id, writes);
        self.mark_trackers_dirty_by_file_id(&file_id, writes);
        if parent_tracker_id != 0 {
            self.mark_trackers_dirty_by_path(parent_tracker_id, &title, writes);
        }
        writes.trackers.insert(tracker_id);
    }

    fn remove_tracker(&mut self, tracker_id: i64, writes: &mut PendingWrites) {
        self.remove_tracker_internal(tracker_id, writes, false);
        self.remove_all_descendant_trackers(tracker_id, writes);
    }

    fn remove_tracker_internal(
        &mut self,
        tracker_id: i64,
        writes: &mut PendingWrites,
        ignoring_same_title: bool,
    ) {
        let Some(tracker) = self.tracker_by_id.remove(&tracker_id) else {
            return;
        };

        self.erase_tracker_from_file_id_index(&tracker, writes);
        if tracker.is_app_root() {
            if let Some(app_id) = &tracker.app_id {
                if self.app_root_by_app_id.get(app_id) == Some(&tracker_id) {
                    self.app_root_by_app_id.remove(app_id);
                }
            }
        }
        self.erase_tracker_from_path_index(&tracker);
        self.dirty_trackers.remove(&tracker_id);
        self.low_priority_dirty_trackers.remove(&tracker_id);

        self.mark_trackers_dirty_by_file_id(&tracker.file_id, writes);
        if !ignoring_same_title {
            self.mark_trackers_dirty_by_path(tracker.parent_tracker_id, tracker.title(), writes);
        }
        writes.trackers.insert(tracker_id);
        debug!(tracker_id, file_id = %tracker.file_id, "Removed tracker");
    }

    fn remove_all_descendant_trackers(&mut self, root_tracker_id: i64, writes: &mut PendingWrites) {
        let mut pending = self.child_tracker_ids(root_tracker_id);
        while let Some(tracker_id) = pending.pop() {
            pending.extend(self.child_tracker_ids(tracker_id));
            self.remove_tracker_internal(tracker_id, writes, true);
        }
    }

    fn erase_tracker_from_file_id_index(&mut self, tracker: &FileTracker, writes: &mut PendingWrites) {
        let Some(set) = self.trackers_by_file_id.get_mut(&tracker.file_id) else {
            return;
        };
        set.erase(tracker.tracker_id);
        if !set.is_empty() {
            return;
        }

        // Last tracker of this file id is gone, so is its metadata.
        self.trackers_by_file_id.remove(&tracker.file_id);
        if self.file_by_id.remove(&tracker.file_id).is_some() {
            writes.files.insert(tracker.file_id.clone());
        }
    }

    fn erase_tracker_from_path_index(&mut self, tracker: &FileTracker) {
        let parent_tracker_id = tracker.parent_tracker_id;
        let Some(by_title) = self.trackers_by_parent_and_title.get_mut(&parent_tracker_id) else {
            return;
        };
        let title = tracker.title();
        if let Some(set) = by_title.get_mut(title) {
            set.erase(tracker.tracker_id);
            if set.is_empty() {
                by_title.remove(title);
            }
        }
        if by_title.is_empty() {
            self.trackers_by_parent_and_title.remove(&parent_tracker_id);
        }
    }

    fn mark_single_tracker_dirty(&mut self, tracker_id: i64, writes: &mut PendingWrites) {
        let Some(tracker) = self.tracker_by_id.get_mut(&tracker_id) else {
            return;
        };
        if !tracker.dirty {
            tracker.dirty = true;
            writes.trackers.insert(tracker_id);
        }
        self.dirty_trackers.insert(tracker_id);
        self.low_priority_dirty_trackers.remove(&tracker_id);
    }

    fn mark_trackers_dirty_by_file_id(&mut self, file_id: &str, writes: &mut PendingWrites) {
        let tracker_ids: Vec<i64> = self
            .trackers_by_file_id
            .get(file_id)
            .map(|set| set.iter().collect())
            .unwrap_or_default();
        for tracker_id in tracker_ids {
            self.mark_single_tracker_dirty(tracker_id, writes);
        }
    }

    fn mark_trackers_dirty_by_path(
        &mut self,
        parent_tracker_id: i64,
        title: &str,
        writes: &mut PendingWrites,
    ) {
        let tracker_ids: Vec<i64> = self
            .find_trackers_by_parent_and_title(parent_tracker_id, title)
            .map(|set| set.iter().collect())
            .unwrap_or_default();
        for tracker_id in tracker_ids {
            self.mark_single_tracker_dirty(tracker_id, writes);
        }
    }

    fn recursive_mark_tracker_as_dirty(&mut self, root_tracker_id: i64, writes: &mut PendingWrites) {
        let mut stack = vec![root_tracker_id];
        while let Some(tracker_id) = stack.pop() {
            stack.extend(self.child_tracker_ids(tracker_id));
            let Some(tracker) = self.tracker_by_id.get_mut(&tracker_id) else {
                continue;
            };
            if !tracker.dirty {
                tracker.dirty = true;
                writes.trackers.insert(tracker_id);
                self.dirty_trackers.insert(tracker_id);
                self.low_priority_dirty_trackers.remove(&tracker_id);
            }
        }
    }

    /// Replaces synced details, moving the tracker between title groups when
    /// its title changes.
    fn set_synced_details(&mut self, tracker_id: i64, details: FileDetails) {
        let Some(tracker) = self.tracker_by_id.get_mut(&tracker_id) else {
            return;
        };
        let old_title = tracker.title().to_string();
        let new_title = details.title.clone();
        let parent_tracker_id = tracker.parent_tracker_id;
        let active = tracker.active;
        tracker.synced_details = Some(details);

        if parent_tracker_id != 0 && old_title != new_title {
            self.title_index_erase(parent_tracker_id, &old_title, tracker_id);
            self.title_index_insert(parent_tracker_id, &new_title, tracker_id, active);
        }
    }

    fn clear_dirty_unless_needed(&mut self, tracker_id: i64) {
        let dirty = self
            .tracker_by_id
            .get(&tracker_id)
            .map(|t| t.dirty)
            .unwrap_or(false);
        if !dirty || self.should_keep_dirty(tracker_id) {
            return;
        }
        if let Some(tracker) = self.tracker_by_id.get_mut(&tracker_id) {
            tracker.dirty = false;
        }
        self.dirty_trackers.remove(&tracker_id);
        self.low_priority_dirty_trackers.remove(&tracker_id);
    }

    fn can_activate_tracker(&self, tracker_id: i64) -> bool {
        let Some(tracker) = self.tracker_by_id.get(&tracker_id) else {
            return false;
        };

        if self.has_active_tracker_for_file_id(&tracker.file_id) {
            return false;
        }
        if tracker.app_id.is_none() && Some(tracker_id) != self.sync_root_tracker_id() {
            return false;
        }
        let Some(details) = &tracker.synced_details else {
            return false;
        };
        if details.file_kind == FileKind::Unsupported || has_invalid_title(&details.title) {
            return false;
        }

        !self.has_active_tracker_for_path(tracker.parent_tracker_id, &details.title)
    }

    fn should_keep_dirty(&self, tracker_id: i64) -> bool {
        let Some(tracker) = self.tracker_by_id.get(&tracker_id) else {
            return false;
        };
        if self.has_disabled_app_root(tracker) {
            return false;
        }

        let Some(local_details) = &tracker.synced_details else {
            return true;
        };
        let Some(file) = self.file_by_id.get(&tracker.file_id) else {
            return true;
        };
        let remote_details = &file.details;

        if tracker.active {
            if tracker.needs_folder_listing {
                return true;
            }
            if local_details.content_hash != remote_details.content_hash {
                return true;
            }
            if local_details.missing != remote_details.missing {
                return true;
            }
        }

        local_details.title != remote_details.title
    }

    pub(crate) fn has_disabled_app_root(&self, tracker: &FileTracker) -> bool {
        tracker
            .app_id
            .as_deref()
            .and_then(|app_id| self.find_app_root_tracker(app_id))
            .map(|app_root| app_root.tracker_kind == TrackerKind::DisabledAppRoot)
            .unwrap_or(false)
    }

    fn has_active_tracker_for_file_id(&self, file_id: &str) -> bool {
        self.trackers_by_file_id
            .get(file_id)
            .map(TrackerSet::has_active)
            .unwrap_or(false)
    }

    fn has_active_tracker_for_path(&self, parent_tracker_id: i64, title: &str) -> bool {
        self.find_trackers_by_parent_and_title(parent_tracker_id, title)
            .map(TrackerSet::has_active)
            .unwrap_or(false)
    }

    fn child_tracker_ids(&self, parent_tracker_id: i64) -> Vec<i64> {
        self.trackers_by_parent_and_title
            .get(&parent_tracker_id)
            .map(|by_title| by_title.values().flat_map(TrackerSet::iter).collect())
            .unwrap_or_default()
    }

    fn title_set_mut(&mut self, parent_tracker_id: i64, title: &str) -> Option<&mut TrackerSet> {
        self.trackers_by_parent_and_title
            .get_mut(&parent_tracker_id)
            .and_then(|by_title| by_title.get_mut(title))
    }

    fn title_index_insert(&mut self, parent_tracker_id: i64, title: &str, tracker_id: i64, active: bool) {
        self.trackers_by_parent_and_title
            .entry(parent_tracker_id)
            .or_default()
            .entry(title.to_string())
            .or_default()
            .insert(tracker_id, active);
    }

    fn title_index_erase(&mut self, parent_tracker_id: i64, title: &str, tracker_id: i64) {
        let Some(by_title) = self.trackers_by_parent_and_title.get_mut(&parent_tracker_id) else {
            return;
        };
        if let Some(set) = by_title.get_mut(title) {
            set.erase(tracker_id);
            if set.is_empty() {
                by_title.remove(title);
            }
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    async fn write_to_database(&mut self, writes: PendingWrites) -> Result<()> {
        let batch = self.build_batch(&writes)?;
        if batch.is_empty() {
            return Ok(());
        }
        self.store.write(batch).await.map_err(SyncError::Storage)
    }

    fn build_batch(&self, writes: &PendingWrites) -> Result<WriteBatch> {
        let mut batch = WriteBatch::new();
        if writes.service_metadata {
            batch.put(
                SERVICE_METADATA_KEY,
                serde_json::to_vec(&self.service_metadata)?,
            );
        }
        for file_id in &writes.files {
            let key = format!("{}{}", FILE_METADATA_KEY_PREFIX, file_id);
            match self.file_by_id.get(file_id) {
                Some(file) => batch.put(key, serde_json::to_vec(file)?),
                None => batch.delete(key),
            }
        }
        for tracker_id in &writes.trackers {
            let key = format!("{}{}", FILE_TRACKER_KEY_PREFIX, tracker_id);
            match self.tracker_by_id.get(tracker_id) {
                Some(tracker) => batch.put(key, serde_json::to_vec(tracker)?),
                None => batch.delete(key),
            }
        }
        Ok(batch)
    }
}

fn append_details(entry: &mut Value, details: &FileDetails) {
    entry["title"] = json!(details.title);
    entry["kind"] = json!(details.file_kind.as_str());
    entry["content_hash"] = json!(details.content_hash);
    entry["etag"] = json!(details.etag);
    entry["missing"] = json!(details.missing);
    entry["change_id"] = json!(details.change_id);
}

async fn check_database_version(store: &dyn KeyValueStore) -> Result<()> {
    let raw = store
        .get(DATABASE_VERSION_KEY)
        .await
        .map_err(SyncError::Storage)?;
    let version = match raw {
        Some(bytes) => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|text| text.trim().parse::<i64>().ok())
            .ok_or_else(|| SyncError::Corruption {
                key: DATABASE_VERSION_KEY.to_string(),
                message: "version is not an integer".to_string(),
            })?,
        None => 0,
    };

    if version != CURRENT_DATABASE_VERSION {
        return Err(SyncError::UnsupportedVersion(version));
    }
    Ok(())
}

async fn read_database_contents(store: &dyn KeyValueStore) -> Result<DatabaseContents> {
    let mut contents = DatabaseContents::default();
    for (key, value) in store.iterate().await.map_err(SyncError::Storage)? {
        if key == SERVICE_METADATA_KEY {
            contents.service_metadata = Some(decode_record(&key, &value)?);
        } else if key.starts_with(FILE_METADATA_KEY_PREFIX) {
            contents.file_metadata.push(decode_record(&key, &value)?);
        } else if let Some(id) = key.strip_prefix(FILE_TRACKER_KEY_PREFIX) {
            if id.parse::<i64>().is_err() {
                return Err(SyncError::Corruption {
                    key,
                    message: "tracker id is not an integer".to_string(),
                });
            }
            contents.file_trackers.push(decode_record(&key, &value)?);
        }
    }
    Ok(contents)
}

/// Undecodable records abort the open; nothing is dropped or rewritten.
fn decode_record<T: serde::de::DeserializeOwned>(key: &str, value: &[u8]) -> Result<T> {
    serde_json::from_slice(value).map_err(|e| {
        error!(key = %key, error = %e, "Corrupted record in metadata database");
        SyncError::Corruption {
            key: key.to_string(),
            message: e.to_string(),
        }
    })
}

fn initialize_service_metadata(
    contents: &mut DatabaseContents,
    batch: &mut WriteBatch,
) -> Result<()> {
    if contents.service_metadata.is_none() {
        let metadata = ServiceMetadata::default();
        batch.put(SERVICE_METADATA_KEY, serde_json::to_vec(&metadata)?);
        contents.service_metadata = Some(metadata);
    }
    Ok(())
}

/// Keeps trackers reachable from the sync-root through active trackers (an
/// inactive tracker is kept but its children are not), then keeps only the
/// metadata some kept tracker refers to.
fn remove_unreachable_items(contents: &mut DatabaseContents, batch: &mut WriteBatch) {
    let mut unvisited: BTreeMap<i64, FileTracker> = BTreeMap::new();
    let mut children_by_parent: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for tracker in contents.file_trackers.drain(..) {
        if tracker.parent_tracker_id != 0 {
            children_by_parent
                .entry(tracker.parent_tracker_id)
                .or_default()
                .push(tracker.tracker_id);
        }
        unvisited.insert(tracker.tracker_id, tracker);
    }

    let mut reachable = Vec::new();
    let mut pending: Vec<i64> = contents
        .service_metadata
        .as_ref()
        .and_then(|metadata| metadata.sync_root_tracker_id)
        .into_iter()
        .collect();
    while let Some(tracker_id) = pending.pop() {
        let Some(tracker) = unvisited.remove(&tracker_id) else {
            continue;
        };
        let active = tracker.active;
        reachable.push(tracker);
        if !active {
            continue;
        }
        if let Some(children) = children_by_parent.get(&tracker_id) {
            pending.extend(children.iter().copied());
        }
    }

    for tracker_id in unvisited.keys() {
        batch.delete(format!("{}{}", FILE_TRACKER_KEY_PREFIX, tracker_id));
    }
    if !unvisited.is_empty() {
        info!(count = unvisited.len(), "Dropped unreachable trackers");
    }

    let referenced: BTreeSet<&str> = reachable.iter().map(|t| t.file_id.as_str()).collect();
    let (kept, dropped): (Vec<FileMetadata>, Vec<FileMetadata>) = contents
        .file_metadata
        .drain(..)
        .partition(|file| referenced.contains(file.file_id.as_str()));
    for file in &dropped {
        batch.delete(format!("{}{}", FILE_METADATA_KEY_PREFIX, file.file_id));
    }

    contents.file_metadata = kept;
    contents.file_trackers = reachable;
}
