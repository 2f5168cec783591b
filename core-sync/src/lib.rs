//! # Sync Core
//!
//! Mirrors a remote file-storage tree into per-application local views.
//!
//! ## Overview
//!
//! The crate keeps a persistent index of the remote tree (the
//! [`MetadataDatabase`]), detects concurrent and conflicting remote
//! mutations, and serializes reconciliation between the remote truth and the
//! local mirror through a single task queue.
//!
//! ## Components
//!
//! - **Entities** (`metadata`, `tracker_set`): file metadata, trackers and
//!   tracker groups
//! - **Metadata Database** (`metadata_database`): exclusive owner of the index
//! - **Task Manager** (`task_manager`): one task at a time, by priority
//! - **Tasks**: [`SyncEngineInitializer`], [`RegisterAppTask`],
//!   [`UninstallAppTask`], [`ListChangesTask`], [`ConflictResolver`],
//!   [`RemoteToLocalSyncer`], [`LocalToRemoteSyncer`]
//! - **Sync Engine** (`sync_engine`): service state, polling and scheduling
//!
//! ## Usage
//!
//! ```ignore
//! use core_sync::{SyncEngine, SyncEngineConfig};
//!
//! let engine = SyncEngine::new(&core_config, SyncEngineConfig::default());
//! engine.start();
//! engine.set_sync_enabled(true).await;
//! engine.initialize().await;
//! engine.register_origin("example.com").await;
//! ```

pub mod conflict_resolver;
pub mod error;
pub mod folder_creator;
pub mod initializer;
pub mod list_changes_task;
pub mod local_to_remote_syncer;
pub mod metadata;
pub mod metadata_database;
pub mod register_app_task;
pub mod remote_to_local_syncer;
pub mod status;
pub mod sync_engine;
pub mod task_manager;
pub mod tracker_set;
pub mod uninstall_app_task;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use conflict_resolver::{ConflictPolicy, ConflictResolver};
pub use core_runtime::events::RemoteServiceState;
pub use error::{Result, SyncError};
pub use folder_creator::FolderCreator;
pub use initializer::SyncEngineInitializer;
pub use list_changes_task::ListChangesTask;
pub use local_to_remote_syncer::LocalToRemoteSyncer;
pub use metadata::{FileDetails, FileKind, FileMetadata, FileTracker, ServiceMetadata, TrackerKind};
pub use metadata_database::MetadataDatabase;
pub use register_app_task::{AppRootSelection, RegisterAppTask};
pub use remote_to_local_syncer::RemoteToLocalSyncer;
pub use status::SyncStatusCode;
pub use sync_engine::{SyncEngine, SyncEngineConfig};
pub use task_manager::{
    SyncContext, SyncTask, SyncTaskManager, SyncTaskManagerClient, TaskHandle, TaskId,
    TaskPriority,
};
pub use tracker_set::TrackerSet;
pub use uninstall_app_task::UninstallAppTask;
