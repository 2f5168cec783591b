//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - [`SqliteKeyValueStore`] - persistent ordered store for the metadata index (`sqlx`)
//! - [`MemoryKeyValueStore`] - ephemeral store for tests and throwaway sessions
//! - [`DesktopNetworkMonitor`] - TCP reachability probe with polled change stream
//!
//! The remote file service and the local change processor are host specific
//! and have no desktop default.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::SqliteKeyValueStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(SqliteKeyValueStore::open("/var/lib/drive-sync/index.db").await?);
//!     // Hand `store` to CoreConfig::builder().key_value_store(store)
//!     Ok(())
//! }
//! ```

mod kv_store;
mod memory_store;
mod network;

pub use kv_store::SqliteKeyValueStore;
pub use memory_store::MemoryKeyValueStore;
pub use network::DesktopNetworkMonitor;
