//! Workspace facade crate.
//!
//! Re-exports the sync core and its runtime so host applications can depend on
//! `drive-sync-workspace` alone and pick features (`desktop-shims`,
//! `test-util`) without wiring each crate individually.

pub use core_runtime as runtime;
pub use core_sync as sync;

pub use core_sync::{
    MetadataDatabase, RemoteServiceState, SyncEngine, SyncEngineConfig, SyncStatusCode,
};
