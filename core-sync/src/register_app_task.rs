use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::folder_creator::FolderCreator;
use crate::metadata::FileTracker;
use crate::metadata_database::MetadataDatabase;
use crate::status::SyncStatusCode;
use crate::task_manager::SyncContext;

/// How to choose among several inactive app-root folder candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AppRootSelection {
    /// Earliest creation time wins, lowest tracker id on ties
    #[default]
    OldestCreated,
    /// Latest creation time wins, lowest tracker id on ties
    NewestCreated,
}

/// Finds or creates the remote folder titled with the app id under the
/// sync-root and registers it as the app's root.
#[derive(Debug)]
pub struct RegisterAppTask {
    app_id: String,
    create_folder_retry_count: u32,
    used_network: bool,
}

impl RegisterAppTask {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            create_folder_retry_count: 0,
            used_network: false,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn used_network(&self) -> bool {
        self.used_network
    }

    #[instrument(skip(self, ctx), fields(app_id = %self.app_id))]
    pub async fn run(&mut self, ctx: &mut SyncContext) -> SyncStatusCode {
        let max_retry = ctx.config.max_register_retry;
        let selection = ctx.config.app_root_policy;
        let service = ctx.remote_service.clone();
        let Some(database) = ctx.metadata_database.as_mut() else {
            warn!("Metadata database is not initialized");
            return SyncStatusCode::Failed;
        };

        loop {
            if self.create_folder_retry_count >= max_retry {
                warn!(retries = self.create_folder_retry_count, "Giving up on app-root creation");
                return SyncStatusCode::Failed;
            }
            self.create_folder_retry_count += 1;

            let Some(sync_root_tracker_id) = database.sync_root_tracker_id() else {
                return SyncStatusCode::DatabaseErrorNotFound;
            };

            match find_app_root_candidate(database, sync_root_tracker_id, &self.app_id, selection) {
                Some(candidate) if candidate.active => {
                    debug!(tracker_id = candidate.tracker_id, "App-root already active");
                    return SyncStatusCode::Ok;
                }
                Some(candidate) => {
                    return match database
                        .register_app_tracker(&self.app_id, candidate.tracker_id)
                        .await
                    {
                        Ok(()) => {
                            info!(file_id = %candidate.file_id, "Registered app-root");
                            SyncStatusCode::Ok
                        }
                        Err(e) => e.status_code(),
                    };
                }
                None => {}
            }

            let Some(sync_root_file_id) = database
                .find_tracker_by_tracker_id(sync_root_tracker_id)
                .map(|tracker| tracker.file_id.clone())
            else {
                return SyncStatusCode::DatabaseErrorNotFound;
            };

            self.used_network = true;
            let creator = FolderCreator::new(sync_root_file_id, self.app_id.clone());
            if let Err(e) = creator.run(service.as_ref(), database).await {
                warn!(error = %e, "Failed to create app-root folder");
                return e.status_code();
            }
        }
    }
}

/// The active tracker titled `app_id` under the sync-root, or else the
/// preferred inactive one whose remote file is a live folder.
fn find_app_root_candidate(
    database: &MetadataDatabase,
    sync_root_tracker_id: i64,
    app_id: &str,
    selection: AppRootSelection,
) -> Option<FileTracker> {
    let trackers = database.find_trackers_by_parent_and_title(sync_root_tracker_id, app_id)?;
    if let Some(active) = trackers
        .active_tracker()
        .and_then(|id| database.find_tracker_by_tracker_id(id))
    {
        return Some(active.clone());
    }

    let candidates = trackers.iter().filter_map(|id| {
        let tracker = database.find_tracker_by_tracker_id(id)?;
        let file = database.find_file_by_file_id(&tracker.file_id)?;
        if file.details.missing || !file.details.is_folder() {
            return None;
        }
        let created = tracker
            .synced_details
            .as_ref()
            .map(|details| details.creation_time)
            .unwrap_or(file.details.creation_time);
        Some((created, tracker))
    });

    let chosen = match selection {
        AppRootSelection::OldestCreated => {
            candidates.min_by(|(a, ta), (b, tb)| a.cmp(b).then(ta.tracker_id.cmp(&tb.tracker_id)))
        }
        AppRootSelection::NewestCreated => {
            candidates.min_by(|(a, ta), (b, tb)| b.cmp(a).then(ta.tracker_id.cmp(&tb.tracker_id)))
        }
    };
    chosen.map(|(_, tracker)| tracker.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_engine::SyncEngineConfig;
    use crate::testing::FakeRemoteService;
    use bridge_desktop::MemoryKeyValueStore;
    use std::sync::Arc;

    const APP_ID: &str = "example.com";

    async fn context_with_sync_root(remote: Arc<FakeRemoteService>) -> SyncContext {
        let root = remote.add_folder(&remote.root_folder_id(), "Drive Sync Root");
        let mut ctx = SyncContext::new(
            Arc::new(MemoryKeyValueStore::new()),
            remote.clone(),
            None,
            SyncEngineConfig::default(),
        );
        let mut database = MetadataDatabase::create(ctx.key_value_store.clone())
            .await
            .unwrap();
        database
            .populate_initial_data(
                remote.largest_change_id(),
                &remote.resource(&root).unwrap(),
                &[],
            )
            .await
            .unwrap();
        ctx.metadata_database = Some(database);
        ctx
    }

    #[tokio::test]
    async fn test_creates_app_root_when_missing() {
        let remote = Arc::new(FakeRemoteService::new());
        let mut ctx = context_with_sync_root(remote.clone()).await;

        let mut task = RegisterAppTask::new(APP_ID);
        assert_eq!(task.run(&mut ctx).await, SyncStatusCode::Ok);
        assert!(task.used_network());

        let database = ctx.metadata_database().unwrap();
        let app_root = database.find_app_root_tracker(APP_ID).unwrap();
        assert!(app_root.active);
        assert!(remote.resource(&app_root.file_id).unwrap().is_folder());
    }

    #[tokio::test]
    async fn test_registering_twice_keeps_same_tracker() {
        let remote = Arc::new(FakeRemoteService::new());
        let mut ctx = context_with_sync_root(remote.clone()).await;

        assert_eq!(RegisterAppTask::new(APP_ID).run(&mut ctx).await, SyncStatusCode::Ok);
        let first = ctx
            .metadata_database()
            .unwrap()
            .find_app_root_tracker(APP_ID)
            .unwrap()
            .tracker_id;

        let mut again = RegisterAppTask::new(APP_ID);
        assert_eq!(again.run(&mut ctx).await, SyncStatusCode::Ok);
        assert!(!again.used_network());
        let second = ctx
            .metadata_database()
            .unwrap()
            .find_app_root_tracker(APP_ID)
            .unwrap()
            .tracker_id;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_oldest_candidate_wins() {
        let remote = Arc::new(FakeRemoteService::new());
        let root = remote.add_folder(&remote.root_folder_id(), "Drive Sync Root");
        let older = remote.add_folder(&root, APP_ID);
        let _newer = remote.add_folder(&root, APP_ID);

        let mut ctx = SyncContext::new(
            Arc::new(MemoryKeyValueStore::new()),
            remote.clone(),
            None,
            SyncEngineConfig::default(),
        );
        let mut database = MetadataDatabase::create(ctx.key_value_store.clone())
            .await
            .unwrap();
        database
            .populate_initial_data(
                remote.largest_change_id(),
                &remote.resource(&root).unwrap(),
                &remote.children(&root),
            )
            .await
            .unwrap();
        ctx.metadata_database = Some(database);

        let mut task = RegisterAppTask::new(APP_ID);
        assert_eq!(task.run(&mut ctx).await, SyncStatusCode::Ok);
        assert!(!task.used_network());
        let app_root = ctx
            .metadata_database()
            .unwrap()
            .find_app_root_tracker(APP_ID)
            .unwrap();
        assert_eq!(app_root.file_id, older);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let remote = Arc::new(FakeRemoteService::new());
        let mut ctx = context_with_sync_root(remote.clone()).await;
        ctx.config.max_register_retry = 0;

        let mut task = RegisterAppTask::new(APP_ID);
        assert_eq!(task.run(&mut ctx).await, SyncStatusCode::Failed);
    }

    #[tokio::test]
    async fn test_fails_without_database() {
        let remote = Arc::new(FakeRemoteService::new());
        let mut ctx = SyncContext::new(
            Arc::new(MemoryKeyValueStore::new()),
            remote,
            None,
            SyncEngineConfig::default(),
        );
        assert_eq!(
            RegisterAppTask::new(APP_ID).run(&mut ctx).await,
            SyncStatusCode::Failed
        );
    }
}
