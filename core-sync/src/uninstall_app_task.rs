use bridge_traits::RemoteErrorCode;
use tracing::{debug, info, instrument, warn};

use crate::status::SyncStatusCode;
use crate::task_manager::SyncContext;

/// Unregisters an app and, when purging, deletes its remote folder.
#[derive(Debug)]
pub struct UninstallAppTask {
    app_id: String,
    purge: bool,
    used_network: bool,
}

impl UninstallAppTask {
    pub fn new(app_id: impl Into<String>, purge: bool) -> Self {
        Self {
            app_id: app_id.into(),
            purge,
            used_network: false,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn used_network(&self) -> bool {
        self.used_network
    }

    #[instrument(skip(self, ctx), fields(app_id = %self.app_id, purge = self.purge))]
    pub async fn run(&mut self, ctx: &mut SyncContext) -> SyncStatusCode {
        let service = ctx.remote_service.clone();
        let Some(database) = ctx.metadata_database.as_mut() else {
            debug!("No metadata database, nothing to uninstall");
            return SyncStatusCode::Ok;
        };
        let Some(app_root) = database.find_app_root_tracker(&self.app_id).cloned() else {
            debug!("App is not registered");
            return SyncStatusCode::Ok;
        };

        if self.purge {
            self.used_network = true;
            if let Err(e) = service.delete_file(&app_root.file_id, None).await {
                if e.remote_code() != Some(RemoteErrorCode::NotFound) {
                    warn!(error = %e, "Failed to delete app-root folder");
                    return SyncStatusCode::from(&e);
                }
            }
        }

        if let Err(e) = database.unregister_app(&self.app_id).await {
            return e.status_code();
        }
        if self.purge {
            if let Err(e) = database.update_by_deleted_remote_file(&app_root.file_id).await {
                return e.status_code();
            }
        }

        info!(file_id = %app_root.file_id, "Uninstalled app");
        SyncStatusCode::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_database::MetadataDatabase;
    use crate::sync_engine::SyncEngineConfig;
    use crate::testing::FakeRemoteService;
    use bridge_desktop::MemoryKeyValueStore;
    use std::sync::Arc;

    const APP_ID: &str = "example.com";

    async fn context() -> (Arc<FakeRemoteService>, SyncContext, String) {
        let remote = Arc::new(FakeRemoteService::new());
        let sync_root = remote.add_folder(&remote.root_folder_id(), "Drive Sync Root");
        let app_root = remote.add_folder(&sync_root, APP_ID);
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
                &remote.resource(&sync_root).unwrap(),
                &[remote.resource(&app_root).unwrap()],
            )
            .await
            .unwrap();
        database.register_app(APP_ID, &app_root).await.unwrap();
        ctx.metadata_database = Some(database);
        (remote, ctx, app_root)
    }

    #[tokio::test]
    async fn test_purge_deletes_remote_folder() {
        let (remote, mut ctx, app_root) = context().await;

        let mut task = UninstallAppTask::new(APP_ID, true);
        assert_eq!(task.run(&mut ctx).await, SyncStatusCode::Ok);
        assert!(task.used_network());

        assert!(remote.resource(&app_root).is_none());
        assert!(ctx
            .metadata_database()
            .unwrap()
            .find_app_root_tracker(APP_ID)
            .is_none());
    }

    #[tokio::test]
    async fn test_uninstall_without_purge_keeps_remote_folder() {
        let (remote, mut ctx, app_root) = context().await;

        let mut task = UninstallAppTask::new(APP_ID, false);
        assert_eq!(task.run(&mut ctx).await, SyncStatusCode::Ok);
        assert!(!task.used_network());

        assert!(remote.resource(&app_root).is_some());
        let database = ctx.metadata_database().unwrap();
        assert!(database.find_app_root_tracker(APP_ID).is_none());
        assert!(!database.registered_app_ids().contains(&APP_ID.to_string()));
    }

    #[tokio::test]
    async fn test_unknown_app_is_noop() {
        let (_, mut ctx, _) = context().await;
        let mut task = UninstallAppTask::new("other.app", true);
        assert_eq!(task.run(&mut ctx).await, SyncStatusCode::Ok);
        assert!(!task.used_network());
    }
}
