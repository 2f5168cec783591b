//! # Host Bridge Traits
//!
//! Contracts between the sync core and everything it does not own.
//!
//! ## Overview
//!
//! The sync core mirrors a remote file tree into per-application local views.
//! It never talks to the network, the local file system or the host's app
//! list directly; each of those is a trait here, implemented per platform
//! (`bridge-desktop`) or by in-memory fakes in tests.
//!
//! ## Traits
//!
//! ### Remote side
//! - [`RemoteFileService`](remote::RemoteFileService) - Folder/file CRUD, change feed, search
//!
//! ### Local side
//! - [`RemoteChangeProcessor`](change_processor::RemoteChangeProcessor) - Applies resolved changes to the local sandbox
//! - [`AppRegistry`](apps::AppRegistry) - Installed/enabled application ids
//!
//! ### Persistence
//! - [`KeyValueStore`](storage::KeyValueStore) - Ordered store with atomic [`WriteBatch`](storage::WriteBatch)
//!
//! ### Platform Integration
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connectivity changes
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! Every bridge returns [`BridgeError`](error::BridgeError). Remote failures
//! carry a [`RemoteErrorCode`](remote::RemoteErrorCode) so the core can map
//! them onto its status taxonomy:
//!
//! ```ignore
//! match service.delete_file(&file_id, Some(&etag)).await {
//!     Ok(()) => {}
//!     Err(err) if err.remote_code() == Some(RemoteErrorCode::NotFound) => {}
//!     Err(err) => return Err(err),
//! }
//! ```
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so a single implementation can be
//! shared as `Arc<dyn Trait>` across the engine's tasks.

pub mod apps;
pub mod change_processor;
pub mod error;
pub mod network;
pub mod remote;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use apps::AppRegistry;
pub use change_processor::{
    FileChange, FileChangeKind, LocalFileMetadata, LocalFileType, PreparedChange,
    RemoteChangeProcessor, SyncFileUrl,
};
pub use network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
pub use remote::{
    AboutResource, ChangeList, ChangeResource, FileList, FileResource, RemoteErrorCode,
    RemoteFileKind, RemoteFileService,
};
pub use storage::{BatchOperation, KeyValueStore, WriteBatch};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
