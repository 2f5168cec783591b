//! Shared harness for the engine-level integration tests.

#![allow(dead_code)]

use bridge_desktop::MemoryKeyValueStore;
use bridge_traits::KeyValueStore;
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, Receiver};
use core_sync::testing::{
    FakeAppRegistry, FakeNetworkMonitor, FakeRemoteChangeProcessor, FakeRemoteService,
    ManualClock,
};
use core_sync::{MetadataDatabase, SyncEngine, SyncEngineConfig, SyncStatusCode};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const APP_ID: &str = "example.com";
pub const SYNC_ROOT_TITLE: &str = "Drive Sync Root";

pub struct Harness {
    pub remote: Arc<FakeRemoteService>,
    pub local: Arc<FakeRemoteChangeProcessor>,
    pub registry: Arc<FakeAppRegistry>,
    pub network: Arc<FakeNetworkMonitor>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryKeyValueStore>,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_remote(Arc::new(FakeRemoteService::new()))
    }

    /// Harness over a remote tree prepared by the test.
    pub fn with_remote(remote: Arc<FakeRemoteService>) -> Self {
        let local = Arc::new(FakeRemoteChangeProcessor::new());
        let registry = Arc::new(FakeAppRegistry::new());
        let network = Arc::new(FakeNetworkMonitor::new());
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryKeyValueStore::new());

        let core = CoreConfig::builder()
            .database_path("index.db")
            .remote_service(remote.clone())
            .key_value_store(store.clone())
            .remote_change_processor(local.clone())
            .app_registry(registry.clone())
            .network_monitor(network.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        let engine = SyncEngine::new(&core, SyncEngineConfig::default());

        Self {
            remote,
            local,
            registry,
            network,
            clock,
            store,
            engine,
        }
    }

    /// Starts the engine, enables sync and bootstraps the index.
    pub async fn start(&self) -> Receiver<CoreEvent> {
        let events = self.engine.subscribe();
        self.engine.start();
        self.engine.set_sync_enabled(true).await;
        assert_eq!(self.engine.initialize().await, SyncStatusCode::Ok);
        self.engine.wait_for_idle().await;
        events
    }

    /// Starts the engine and registers [`APP_ID`], returning its folder id.
    pub async fn start_with_app(&self) -> (Receiver<CoreEvent>, String) {
        self.registry.install(APP_ID, true);
        let events = self.start().await;
        assert_eq!(self.engine.register_origin(APP_ID).await, SyncStatusCode::Ok);
        self.drain_remote_changes().await;
        let app_root = self.app_root_id();
        (events, app_root)
    }

    pub fn sync_root_id(&self) -> String {
        let roots = self
            .remote
            .children_titled(&self.remote.root_folder_id(), SYNC_ROOT_TITLE);
        assert_eq!(roots.len(), 1, "expected exactly one sync-root folder");
        roots[0].file_id.clone()
    }

    pub fn app_root_id(&self) -> String {
        let roots = self.remote.children_titled(&self.sync_root_id(), APP_ID);
        assert_eq!(roots.len(), 1, "expected exactly one app-root folder");
        roots[0].file_id.clone()
    }

    /// Lists remote changes now and applies them to the index.
    pub async fn fetch_remote_changes(&self) {
        assert_eq!(self.engine.fetch_remote_changes().await, SyncStatusCode::Ok);
        self.engine.wait_for_idle().await;
    }

    /// Runs the remote-to-local syncer until nothing is dirty.
    pub async fn drain_remote_changes(&self) {
        let mut idle_rounds = 0;
        for _ in 0..256 {
            match self.engine.process_remote_change().await {
                SyncStatusCode::NoChangeToSync => {
                    // Deferred trackers are promoted after an empty round.
                    idle_rounds += 1;
                    if idle_rounds == 2 {
                        self.engine.wait_for_idle().await;
                        return;
                    }
                }
                SyncStatusCode::Ok | SyncStatusCode::Retry => idle_rounds = 0,
                status => panic!("remote to local sync failed: {}", status),
            }
        }
        panic!("remote to local sync did not converge");
    }

    /// Alternates conflict resolution and remote syncing until no conflict
    /// is left.
    pub async fn resolve_all_conflicts(&self) {
        for _ in 0..32 {
            self.drain_remote_changes().await;
            match self.engine.resolve_conflicts().await {
                SyncStatusCode::NoConflict => {
                    self.engine.wait_for_idle().await;
                    return;
                }
                SyncStatusCode::Ok | SyncStatusCode::Retry => {}
                status => panic!("conflict resolution failed: {}", status),
            }
        }
        panic!("conflict resolution did not converge");
    }

    /// Checks the index invariants on the engine's in-memory index, then
    /// verifies reopening the store drops nothing from it.
    pub async fn assert_invariants(&self) {
        let live = self
            .engine
            .inspect_metadata_database(|database| {
                assert_index_invariants(database);
                tracker_ids(database)
            })
            .await
            .expect("metadata database is open");

        let reopened = self.snapshot().await;
        assert_index_invariants(&reopened);
        assert_eq!(tracker_ids(&reopened), live, "reopening dropped trackers");
    }

    /// Index as persisted right now. Call while the engine is idle.
    pub async fn snapshot(&self) -> MetadataDatabase {
        let store: Arc<dyn KeyValueStore> = self.store.clone();
        MetadataDatabase::create(store).await.unwrap()
    }
}

pub fn drain_events(events: &mut Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub fn tracker_ids(database: &MetadataDatabase) -> Vec<i64> {
    database.dump_database()[0]["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["tracker_id"].as_i64().unwrap())
        .collect()
}

/// Checks reachability and the uniqueness of active trackers per file id and
/// per (parent, title).
pub fn assert_index_invariants(database: &MetadataDatabase) {
    let sync_root = database.sync_root_tracker_id().expect("sync-root tracker");
    let ids = tracker_ids(database);

    let mut active_by_file: BTreeMap<String, usize> = BTreeMap::new();
    let mut active_by_slot: BTreeMap<(i64, String), usize> = BTreeMap::new();
    let mut seen = BTreeSet::new();

    for id in &ids {
        assert!(seen.insert(*id), "tracker id {} appears twice", id);
        let tracker = database.find_tracker_by_tracker_id(*id).unwrap();
        if !tracker.active {
            continue;
        }

        *active_by_file.entry(tracker.file_id.clone()).or_default() += 1;
        if tracker.parent_tracker_id != 0 {
            *active_by_slot
                .entry((tracker.parent_tracker_id, tracker.title().to_string()))
                .or_default() += 1;
        }

        let mut current = tracker.clone();
        let mut hops = 0;
        while current.tracker_id != sync_root {
            let parent = database
                .find_tracker_by_tracker_id(current.parent_tracker_id)
                .unwrap_or_else(|| panic!("tracker {} has no parent", current.tracker_id));
            assert!(
                parent.active,
                "tracker {} hangs off inactive tracker {}",
                tracker.tracker_id, parent.tracker_id
            );
            current = parent.clone();
            hops += 1;
            assert!(hops <= ids.len(), "parent cycle at tracker {}", tracker.tracker_id);
        }
    }

    for (file_id, count) in active_by_file {
        assert!(count <= 1, "{} active trackers for file {}", count, file_id);
    }
    for ((parent, title), count) in active_by_slot {
        assert!(
            count <= 1,
            "{} active trackers titled {:?} under {}",
            count,
            title,
            parent
        );
    }
}
