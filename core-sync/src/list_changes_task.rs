use bridge_traits::ChangeResource;
use tracing::{debug, info, instrument, warn};

use crate::status::SyncStatusCode;
use crate::task_manager::SyncContext;

/// Pulls the remote change feed since the last fetched change id into the
/// index.
#[derive(Debug, Default)]
pub struct ListChangesTask {
    used_network: bool,
}

impl ListChangesTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn used_network(&self) -> bool {
        self.used_network
    }

    #[instrument(skip(self, ctx))]
    pub async fn run(&mut self, ctx: &mut SyncContext) -> SyncStatusCode {
        let service = ctx.remote_service.clone();
        let Some(database) = ctx.metadata_database.as_mut() else {
            warn!("Metadata database is not initialized");
            return SyncStatusCode::Failed;
        };

        let start_change_id = database.largest_fetched_change_id() + 1;
        let mut changes: Vec<ChangeResource> = Vec::new();
        let mut largest_change_id = database.largest_fetched_change_id();
        let mut page_token: Option<String> = None;

        self.used_network = true;
        loop {
            let page = match service
                .list_changes(start_change_id, page_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "Failed to list changes");
                    return SyncStatusCode::from(&e);
                }
            };

            largest_change_id = largest_change_id.max(page.largest_change_id);
            changes.extend(page.items);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
            debug!(fetched = changes.len(), "Fetching next change page");
        }

        info!(start_change_id, largest_change_id, changes = changes.len(), "Fetched remote changes");
        match database.update_by_change_list(largest_change_id, &changes).await {
            Ok(()) => SyncStatusCode::Ok,
            Err(e) => e.status_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_database::MetadataDatabase;
    use crate::sync_engine::SyncEngineConfig;
    use crate::testing::FakeRemoteService;
    use bridge_desktop::MemoryKeyValueStore;
    use bridge_traits::RemoteErrorCode;
    use std::sync::Arc;

    async fn context(remote: &Arc<FakeRemoteService>) -> (SyncContext, String) {
        let root = remote.add_folder(&remote.root_folder_id(), "Drive Sync Root");
        let app = remote.add_folder(&root, "example.com");
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
                &[remote.resource(&app).unwrap()],
            )
            .await
            .unwrap();
        database.register_app("example.com", &app).await.unwrap();
        ctx.metadata_database = Some(database);
        (ctx, app)
    }

    #[tokio::test]
    async fn test_changes_are_applied() {
        let remote = Arc::new(FakeRemoteService::new());
        let (mut ctx, app) = context(&remote).await;
        let file = remote.add_file(&app, "notes.txt", b"hello");

        let mut task = ListChangesTask::new();
        assert_eq!(task.run(&mut ctx).await, SyncStatusCode::Ok);
        assert!(task.used_network());

        let database = ctx.metadata_database().unwrap();
        assert_eq!(database.largest_fetched_change_id(), remote.largest_change_id());
        assert!(database.find_file_by_file_id(&file).is_some());
    }

    #[tokio::test]
    async fn test_fetch_resumes_after_last_change() {
        let remote = Arc::new(FakeRemoteService::new());
        remote.set_change_page_size(1);
        let (mut ctx, app) = context(&remote).await;
        remote.add_file(&app, "a.txt", b"a");
        remote.add_file(&app, "b.txt", b"b");

        assert_eq!(ListChangesTask::new().run(&mut ctx).await, SyncStatusCode::Ok);
        let first = ctx.metadata_database().unwrap().largest_fetched_change_id();

        remote.add_file(&app, "c.txt", b"c");
        assert_eq!(ListChangesTask::new().run(&mut ctx).await, SyncStatusCode::Ok);
        let second = ctx.metadata_database().unwrap().largest_fetched_change_id();
        assert!(second > first);
        assert_eq!(second, remote.largest_change_id());
    }

    #[tokio::test]
    async fn test_remote_error_is_mapped() {
        let remote = Arc::new(FakeRemoteService::new());
        let (mut ctx, _) = context(&remote).await;
        remote.fail_next(RemoteErrorCode::NoConnection);

        assert_eq!(
            ListChangesTask::new().run(&mut ctx).await,
            SyncStatusCode::NetworkError
        );
    }
}
