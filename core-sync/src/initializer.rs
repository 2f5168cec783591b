//! # Engine Initializer
//!
//! Opens the metadata index and bootstraps it on first use.
//!
//! ## Overview
//!
//! On an empty index the initializer:
//!
//! 1. reads the account's largest change id and root folder id
//! 2. finds the sync-root folder by title under the root, creating it when
//!    absent (the oldest wins when several exist)
//! 3. lists the sync-root's child folders as app-root candidates
//! 4. seeds the index with [`MetadataDatabase::populate_initial_data`]
//!
//! The change id is read before anything is listed, so a change racing with
//! the bootstrap is fetched again by the next change listing.

use bridge_traits::{FileResource, RemoteFileService};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::metadata_database::MetadataDatabase;
use crate::status::SyncStatusCode;
use crate::task_manager::SyncContext;

#[derive(Debug, Default)]
pub struct SyncEngineInitializer {
    used_network: bool,
}

impl SyncEngineInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn used_network(&self) -> bool {
        self.used_network
    }

    #[instrument(skip(self, ctx))]
    pub async fn run(&mut self, ctx: &mut SyncContext) -> SyncStatusCode {
        match self.initialize(ctx).await {
            Ok(()) => SyncStatusCode::Ok,
            Err(e) => {
                warn!(error = %e, "Initialization failed");
                e.status_code()
            }
        }
    }

    /// The index is handed to the context only once it has a sync-root, so a
    /// failed bootstrap leaves the engine without a database.
    async fn initialize(&mut self, ctx: &mut SyncContext) -> Result<()> {
        let mut database = match ctx.metadata_database.take() {
            Some(database) => database,
            None => MetadataDatabase::create(ctx.key_value_store.clone()).await?,
        };
        if !database.has_sync_root() {
            self.bootstrap(ctx, &mut database).await?;
        } else {
            debug!("Sync-root already known");
        }
        ctx.metadata_database = Some(database);
        Ok(())
    }

    async fn bootstrap(&mut self, ctx: &SyncContext, database: &mut MetadataDatabase) -> Result<()> {
        let service = ctx.remote_service.clone();
        let title = ctx.config.sync_root_title.as_str();

        self.used_network = true;
        let about = service
            .get_about_resource()
            .await
            .map_err(SyncError::Remote)?;

        let sync_root = match find_sync_root(service.as_ref(), title, &about.root_folder_id).await? {
            Some(folder) => folder,
            None => {
                info!(title = %title, "Creating sync-root folder");
                service
                    .create_folder(&about.root_folder_id, title)
                    .await
                    .map_err(SyncError::Remote)?;
                find_sync_root(service.as_ref(), title, &about.root_folder_id)
                    .await?
                    .ok_or_else(|| SyncError::NotFound(format!("sync-root {}", title)))?
            }
        };

        let app_roots = list_app_root_candidates(service.as_ref(), &sync_root.file_id).await?;
        info!(
            sync_root = %sync_root.file_id,
            app_roots = app_roots.len(),
            largest_change_id = about.largest_change_id,
            "Bootstrapping metadata database"
        );
        database
            .populate_initial_data(about.largest_change_id, &sync_root, &app_roots)
            .await
    }
}

async fn find_sync_root(
    service: &dyn RemoteFileService,
    title: &str,
    root_folder_id: &str,
) -> Result<Option<FileResource>> {
    let listing = service
        .search_by_title(title, root_folder_id)
        .await
        .map_err(SyncError::Remote)?;

    Ok(listing
        .items
        .into_iter()
        .filter(|resource| {
            resource.is_folder() && !resource.trashed && resource.has_parent(root_folder_id)
        })
        .min_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.file_id.cmp(&b.file_id))
        }))
}

async fn list_app_root_candidates(
    service: &dyn RemoteFileService,
    sync_root_id: &str,
) -> Result<Vec<FileResource>> {
    let mut candidates = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = service
            .list_folder(sync_root_id, page_token.as_deref())
            .await
            .map_err(SyncError::Remote)?;
        candidates.extend(
            page.items
                .into_iter()
                .filter(|resource| resource.is_folder() && !resource.trashed),
        );
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => return Ok(candidates),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_engine::SyncEngineConfig;
    use crate::testing::FakeRemoteService;
    use bridge_desktop::MemoryKeyValueStore;
    use bridge_traits::RemoteErrorCode;
    use std::sync::Arc;

    fn context(remote: &Arc<FakeRemoteService>) -> SyncContext {
        SyncContext::new(
            Arc::new(MemoryKeyValueStore::new()),
            remote.clone(),
            None,
            SyncEngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_creates_sync_root_on_empty_account() {
        let remote = Arc::new(FakeRemoteService::new());
        let mut ctx = context(&remote);

        let mut initializer = SyncEngineInitializer::new();
        assert_eq!(initializer.run(&mut ctx).await, SyncStatusCode::Ok);
        assert!(initializer.used_network());

        let roots = remote.children_titled(&remote.root_folder_id(), "Drive Sync Root");
        assert_eq!(roots.len(), 1);
        let database = ctx.metadata_database().unwrap();
        let sync_root = database
            .find_tracker_by_tracker_id(database.sync_root_tracker_id().unwrap())
            .unwrap();
        assert_eq!(sync_root.file_id, roots[0].file_id);
    }

    #[tokio::test]
    async fn test_reuses_existing_sync_root_and_app_roots() {
        let remote = Arc::new(FakeRemoteService::new());
        let root = remote.add_folder(&remote.root_folder_id(), "Drive Sync Root");
        let app = remote.add_folder(&root, "example.com");
        remote.add_file(&root, "stray.txt", b"not a folder");
        let mut ctx = context(&remote);

        assert_eq!(SyncEngineInitializer::new().run(&mut ctx).await, SyncStatusCode::Ok);

        let database = ctx.metadata_database().unwrap();
        let sync_root_id = database.sync_root_tracker_id().unwrap();
        assert_eq!(
            database.find_tracker_by_tracker_id(sync_root_id).unwrap().file_id,
            root
        );
        assert!(database.find_file_by_file_id(&app).is_some());
        assert!(database
            .find_trackers_by_parent_and_title(sync_root_id, "stray.txt")
            .is_none());
        assert_eq!(database.largest_fetched_change_id(), remote.largest_change_id());
    }

    #[tokio::test]
    async fn test_second_run_is_offline() {
        let remote = Arc::new(FakeRemoteService::new());
        let mut ctx = context(&remote);
        assert_eq!(SyncEngineInitializer::new().run(&mut ctx).await, SyncStatusCode::Ok);

        remote.fail_next(RemoteErrorCode::NoConnection);
        let mut again = SyncEngineInitializer::new();
        assert_eq!(again.run(&mut ctx).await, SyncStatusCode::Ok);
        assert!(!again.used_network());
    }

    #[tokio::test]
    async fn test_auth_failure_is_reported() {
        let remote = Arc::new(FakeRemoteService::new());
        remote.fail_next(RemoteErrorCode::Unauthorized);
        let mut ctx = context(&remote);

        assert_eq!(
            SyncEngineInitializer::new().run(&mut ctx).await,
            SyncStatusCode::AuthenticationFailed
        );
        assert!(ctx.metadata_database().is_none());

        assert_eq!(SyncEngineInitializer::new().run(&mut ctx).await, SyncStatusCode::Ok);
        assert!(ctx.metadata_database().unwrap().has_sync_root());
    }

    #[tokio::test]
    async fn test_failed_listing_keeps_database_out_of_context() {
        let remote = Arc::new(FakeRemoteService::new());
        remote.add_folder(&remote.root_folder_id(), "Drive Sync Root");
        let mut ctx = context(&remote);

        // about succeeds, the sync-root search fails
        remote.fail_after(1, RemoteErrorCode::NoConnection);
        assert_eq!(
            SyncEngineInitializer::new().run(&mut ctx).await,
            SyncStatusCode::NetworkError
        );
        assert!(ctx.metadata_database().is_none());
    }
}
