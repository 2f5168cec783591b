//! # Core Configuration Module
//!
//! Dependency and settings bundle handed to the sync engine.
//!
//! ## Overview
//!
//! `CoreConfig` is assembled with a builder and validated fail-fast, so a
//! missing bridge is reported at startup instead of on the first sync.
//!
//! ## Required Dependencies
//!
//! - `RemoteFileService` - the remote storage service
//! - `KeyValueStore` - persistence for the metadata index
//!
//! ## Optional Dependencies
//!
//! - `RemoteChangeProcessor` - local sandbox; without it remote changes are
//!   indexed but never applied locally
//! - `AppRegistry` - installed app list for app-root reconciliation
//! - `NetworkMonitor` - connectivity notifications
//! - `Clock` - defaults to the system clock
//!
//! With the `desktop-shims` feature, [`CoreConfigBuilder::with_desktop_store`]
//! opens a SQLite-backed store at `database_path`.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/var/lib/drive-sync/index.db")
//!     .remote_service(Arc::new(MyDriveClient::new()))
//!     .with_desktop_store()
//!     .await?
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::CoreConfig;
//!
//! // Panics: no remote service and no key-value store were provided
//! let config = CoreConfig::builder()
//!     .database_path("/tmp/index.db")
//!     .build()
//!     .expect("Should fail - missing required bridges");
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::{
    AppRegistry, Clock, KeyValueStore, NetworkMonitor, RemoteChangeProcessor, RemoteFileService,
    SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;

const MAX_EVENT_BUFFER_SIZE: usize = 10_000;

/// Everything the sync engine needs from its host.
#[derive(Clone)]
pub struct CoreConfig {
    /// Location of the metadata index
    pub database_path: PathBuf,

    pub remote_service: Arc<dyn RemoteFileService>,

    pub key_value_store: Arc<dyn KeyValueStore>,

    pub remote_change_processor: Option<Arc<dyn RemoteChangeProcessor>>,

    pub app_registry: Option<Arc<dyn AppRegistry>>,

    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    pub clock: Arc<dyn Clock>,

    /// Capacity of the engine's event bus
    pub event_buffer_size: usize,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("remote_service", &"RemoteFileService { ... }")
            .field("key_value_store", &"KeyValueStore { ... }")
            .field(
                "remote_change_processor",
                &self
                    .remote_change_processor
                    .as_ref()
                    .map(|_| "RemoteChangeProcessor { ... }"),
            )
            .field(
                "app_registry",
                &self.app_registry.as_ref().map(|_| "AppRegistry { ... }"),
            )
            .field(
                "network_monitor",
                &self
                    .network_monitor
                    .as_ref()
                    .map(|_| "NetworkMonitor { ... }"),
            )
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Checks settings that the builder cannot enforce by type.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.event_buffer_size > MAX_EVENT_BUFFER_SIZE {
            return Err(Error::Config(format!(
                "Event buffer size exceeds maximum of {}",
                MAX_EVENT_BUFFER_SIZE
            )));
        }

        Ok(())
    }
}

fn remote_service_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "RemoteFileService".to_string(),
        message: "A RemoteFileService implementation is required. \
                  Inject the host's client for the remote storage service with .remote_service()."
            .to_string(),
    }
}

fn key_value_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "KeyValueStore".to_string(),
        message: "A KeyValueStore implementation is required for the metadata index. \
                  Desktop: enable the 'desktop-shims' feature and call .with_desktop_store(). \
                  Other hosts: inject a store with .key_value_store()."
            .to_string(),
    }
}

/// Builder for [`CoreConfig`].
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    remote_service: Option<Arc<dyn RemoteFileService>>,
    key_value_store: Option<Arc<dyn KeyValueStore>>,
    remote_change_processor: Option<Arc<dyn RemoteChangeProcessor>>,
    app_registry: Option<Arc<dyn AppRegistry>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    event_buffer_size: Option<usize>,
}

impl CoreConfigBuilder {
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the remote file service (required).
    pub fn remote_service(mut self, service: Arc<dyn RemoteFileService>) -> Self {
        self.remote_service = Some(service);
        self
    }

    /// Sets the key-value store backing the metadata index (required).
    pub fn key_value_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.key_value_store = Some(store);
        self
    }

    /// Opens a SQLite store at the configured `database_path`.
    ///
    /// Call after [`database_path`](Self::database_path).
    #[cfg(feature = "desktop-shims")]
    pub async fn with_desktop_store(mut self) -> Result<Self> {
        use bridge_desktop::SqliteKeyValueStore;

        let path = self.database_path.clone().ok_or_else(|| {
            Error::Config(
                "Database path is required before opening the desktop store".to_string(),
            )
        })?;
        let store = SqliteKeyValueStore::open(&path).await?;
        self.key_value_store = Some(Arc::new(store));
        Ok(self)
    }

    pub fn remote_change_processor(mut self, processor: Arc<dyn RemoteChangeProcessor>) -> Self {
        self.remote_change_processor = Some(processor);
        self
    }

    pub fn app_registry(mut self, registry: Arc<dyn AppRegistry>) -> Self {
        self.app_registry = Some(registry);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    /// Uses the desktop TCP reachability probe for connectivity changes.
    #[cfg(feature = "desktop-shims")]
    pub fn with_desktop_network_monitor(mut self) -> Self {
        self.network_monitor = Some(Arc::new(bridge_desktop::DesktopNetworkMonitor::new()));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let remote_service = self
            .remote_service
            .ok_or_else(remote_service_missing_error)?;

        let key_value_store = self
            .key_value_store
            .ok_or_else(key_value_store_missing_error)?;

        let config = CoreConfig {
            database_path,
            remote_service,
            key_value_store,
            remote_change_processor: self.remote_change_processor,
            app_registry: self.app_registry,
            network_monitor: self.network_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::remote::{AboutResource, ChangeList, FileList, FileResource};
    use bridge_traits::storage::WriteBatch;
    use bytes::Bytes;

    struct NullRemote;

    #[async_trait]
    impl RemoteFileService for NullRemote {
        async fn get_about_resource(&self) -> BridgeResult<AboutResource> {
            unimplemented!()
        }
        async fn get_file_resource(&self, _file_id: &str) -> BridgeResult<FileResource> {
            unimplemented!()
        }
        async fn list_changes(&self, _start: i64, _token: Option<&str>) -> BridgeResult<ChangeList> {
            unimplemented!()
        }
        async fn list_folder(&self, _id: &str, _token: Option<&str>) -> BridgeResult<FileList> {
            unimplemented!()
        }
        async fn search_by_title(&self, _title: &str, _parent: &str) -> BridgeResult<FileList> {
            unimplemented!()
        }
        async fn create_folder(&self, _parent: &str, _title: &str) -> BridgeResult<FileResource> {
            unimplemented!()
        }
        async fn upload_new_file(
            &self,
            _parent: &str,
            _title: &str,
            _content: Bytes,
        ) -> BridgeResult<FileResource> {
            unimplemented!()
        }
        async fn upload_existing_file(
            &self,
            _file_id: &str,
            _content: Bytes,
            _etag: Option<&str>,
        ) -> BridgeResult<FileResource> {
            unimplemented!()
        }
        async fn download_file(&self, _file_id: &str) -> BridgeResult<Bytes> {
            unimplemented!()
        }
        async fn delete_file(&self, _file_id: &str, _etag: Option<&str>) -> BridgeResult<()> {
            unimplemented!()
        }
        async fn remove_parent(&self, _file_id: &str, _parent: &str) -> BridgeResult<()> {
            unimplemented!()
        }
        fn has_refresh_token(&self) -> bool {
            false
        }
    }

    struct NullStore;

    #[async_trait]
    impl KeyValueStore for NullStore {
        async fn get(&self, _key: &str) -> BridgeResult<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn put(&self, _key: &str, _value: &[u8]) -> BridgeResult<()> {
            Ok(())
        }
        async fn delete(&self, _key: &str) -> BridgeResult<()> {
            Ok(())
        }
        async fn iterate_prefix(&self, _prefix: &str) -> BridgeResult<Vec<(String, Vec<u8>)>> {
            Ok(Vec::new())
        }
        async fn write(&self, _batch: WriteBatch) -> BridgeResult<()> {
            Ok(())
        }
    }

    fn complete_builder() -> CoreConfigBuilder {
        CoreConfig::builder()
            .database_path("/tmp/index.db")
            .remote_service(Arc::new(NullRemote))
            .key_value_store(Arc::new(NullStore))
    }

    #[test]
    fn test_build_with_required_bridges() {
        let config = complete_builder().build().unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/index.db"));
        assert_eq!(config.event_buffer_size, DEFAULT_EVENT_BUFFER_SIZE);
        assert!(config.remote_change_processor.is_none());
        assert!(config.network_monitor.is_none());
    }

    #[test]
    fn test_missing_remote_service() {
        let result = CoreConfig::builder()
            .database_path("/tmp/index.db")
            .key_value_store(Arc::new(NullStore))
            .build();

        match result {
            Err(Error::CapabilityMissing { capability, .. }) => {
                assert_eq!(capability, "RemoteFileService")
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_key_value_store() {
        let result = CoreConfig::builder()
            .database_path("/tmp/index.db")
            .remote_service(Arc::new(NullRemote))
            .build();

        assert!(matches!(
            result,
            Err(Error::CapabilityMissing { ref capability, .. }) if capability == "KeyValueStore"
        ));
    }

    #[test]
    fn test_missing_database_path() {
        let result = CoreConfig::builder()
            .remote_service(Arc::new(NullRemote))
            .key_value_store(Arc::new(NullStore))
            .build();

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_event_buffer_bounds() {
        assert!(complete_builder().event_buffer_size(0).build().is_err());
        assert!(complete_builder().event_buffer_size(20_000).build().is_err());
        assert_eq!(
            complete_builder()
                .event_buffer_size(16)
                .build()
                .unwrap()
                .event_buffer_size,
            16
        );
    }

    #[cfg(feature = "desktop-shims")]
    #[tokio::test]
    async fn test_desktop_store_opens_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::builder()
            .database_path(dir.path().join("index.db"))
            .remote_service(Arc::new(NullRemote))
            .with_desktop_store()
            .await
            .unwrap()
            .build()
            .unwrap();

        config.key_value_store.put("version", b"1").await.unwrap();
        assert_eq!(
            config.key_value_store.get("version").await.unwrap(),
            Some(b"1".to_vec())
        );
    }
}
