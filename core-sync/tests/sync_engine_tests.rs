//! End-to-end tests for the sync engine
//!
//! Each test runs the engine against an in-memory remote account and an
//! in-memory local sandbox, then checks both sides and the emitted events.

mod common;

use bridge_traits::{FileChange, LocalFileType, SyncFileUrl};
use bytes::Bytes;
use common::{drain_events, Harness, APP_ID, SYNC_ROOT_TITLE};
use core_runtime::events::{
    CoreEvent, FileEvent, Receiver, RemoteServiceState, ServiceEvent, SyncAction, SyncDirection,
};
use core_sync::SyncStatusCode;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn synced_paths(events: &[CoreEvent], direction: SyncDirection) -> Vec<(String, SyncAction)> {
    events
        .iter()
        .filter_map(|event| match event {
            CoreEvent::File(FileEvent::Synced {
                path,
                action,
                direction: d,
                ..
            }) if *d == direction => Some((path.clone(), *action)),
            _ => None,
        })
        .collect()
}

/// Submits a local change until it is no longer asked to retry.
async fn push_local_change(
    h: &Harness,
    path: &str,
    change: FileChange,
    content: Option<&[u8]>,
) -> SyncStatusCode {
    for _ in 0..8 {
        let status = h
            .engine
            .apply_local_change(
                SyncFileUrl::new(APP_ID, path),
                change,
                content.map(Bytes::copy_from_slice),
            )
            .await;
        h.engine.wait_for_idle().await;
        if status != SyncStatusCode::Retry {
            return status;
        }
    }
    SyncStatusCode::Retry
}

/// Next service state reported on the event bus.
async fn next_state(events: &mut Receiver<CoreEvent>) -> RemoteServiceState {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no state change reported")
            .expect("event bus closed");
        if let CoreEvent::Service(ServiceEvent::StateChanged { state, .. }) = event {
            return state;
        }
    }
}

// ============================================================================
// Remote to local
// ============================================================================

#[tokio::test]
async fn test_remote_file_is_downloaded_and_reported() {
    let h = Harness::new();
    let (mut events, app_root) = h.start_with_app().await;
    drain_events(&mut events);

    let docs = h.remote.add_folder(&app_root, "docs");
    h.remote.add_file(&docs, "notes.txt", b"hello");
    h.fetch_remote_changes().await;
    h.drain_remote_changes().await;

    assert!(h.local.is_directory(APP_ID, "docs"));
    assert_eq!(
        h.local.file_content(APP_ID, "docs/notes.txt").as_deref(),
        Some(&b"hello"[..])
    );

    let synced = synced_paths(&drain_events(&mut events), SyncDirection::RemoteToLocal);
    assert!(synced.contains(&("docs".to_string(), SyncAction::Added)));
    assert!(synced.contains(&("docs/notes.txt".to_string(), SyncAction::Added)));
    assert_eq!(h.engine.service_state().await, RemoteServiceState::Ok);
}

#[tokio::test]
async fn test_remote_update_and_delete_reach_local_sandbox() {
    let h = Harness::new();
    let (mut events, app_root) = h.start_with_app().await;
    let file = h.remote.add_file(&app_root, "notes.txt", b"v1");
    h.fetch_remote_changes().await;
    h.drain_remote_changes().await;
    drain_events(&mut events);

    h.remote.update_file(&file, b"v2");
    h.fetch_remote_changes().await;
    h.drain_remote_changes().await;
    assert_eq!(
        h.local.file_content(APP_ID, "notes.txt").as_deref(),
        Some(&b"v2"[..])
    );

    h.remote.delete(&file);
    h.fetch_remote_changes().await;
    h.drain_remote_changes().await;
    assert!(h.local.file_content(APP_ID, "notes.txt").is_none());

    let synced = synced_paths(&drain_events(&mut events), SyncDirection::RemoteToLocal);
    let updated = synced
        .iter()
        .position(|entry| *entry == ("notes.txt".to_string(), SyncAction::Updated));
    let deleted = synced
        .iter()
        .position(|entry| *entry == ("notes.txt".to_string(), SyncAction::Deleted));
    assert!(updated.is_some());
    assert!(updated < deleted);
}

#[tokio::test]
async fn test_queue_size_is_reported() {
    let h = Harness::new();
    let (mut events, app_root) = h.start_with_app().await;
    h.remote.add_file(&app_root, "a.txt", b"a");
    h.remote.add_file(&app_root, "b.txt", b"b");
    drain_events(&mut events);

    h.fetch_remote_changes().await;
    let pending: Vec<usize> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            CoreEvent::Service(ServiceEvent::RemoteChangeQueueUpdated { pending }) => {
                Some(pending)
            }
            _ => None,
        })
        .collect();
    assert!(pending.last().copied().unwrap_or(0) >= 2);

    h.drain_remote_changes().await;
    assert!(!h.snapshot().await.has_dirty_tracker());
}

// ============================================================================
// Local to remote
// ============================================================================

#[tokio::test]
async fn test_local_file_is_uploaded_and_reported() {
    let h = Harness::new();
    let (mut events, app_root) = h.start_with_app().await;
    drain_events(&mut events);

    h.local.add_local_file(APP_ID, "notes.txt", b"hello");
    let status = push_local_change(
        &h,
        "notes.txt",
        FileChange::add_or_update(LocalFileType::File),
        Some(b"hello"),
    )
    .await;
    assert_eq!(status, SyncStatusCode::Ok);

    let uploaded = h.remote.children_titled(&app_root, "notes.txt");
    assert_eq!(uploaded.len(), 1);
    assert_eq!(
        h.remote.content(&uploaded[0].file_id).as_deref(),
        Some(&b"hello"[..])
    );

    let synced = synced_paths(&drain_events(&mut events), SyncDirection::LocalToRemote);
    assert_eq!(synced, vec![("notes.txt".to_string(), SyncAction::Added)]);
}

#[tokio::test]
async fn test_nested_local_file_creates_parents_one_by_one() {
    let h = Harness::new();
    let (mut events, app_root) = h.start_with_app().await;
    drain_events(&mut events);

    h.local.add_local_file(APP_ID, "a/b/c.txt", b"deep");
    let status = push_local_change(
        &h,
        "a/b/c.txt",
        FileChange::add_or_update(LocalFileType::File),
        Some(b"deep"),
    )
    .await;
    assert_eq!(status, SyncStatusCode::Ok);

    let a = h.remote.children_titled(&app_root, "a");
    assert_eq!(a.len(), 1);
    let b = h.remote.children_titled(&a[0].file_id, "b");
    assert_eq!(b.len(), 1);
    assert_eq!(h.remote.children_titled(&b[0].file_id, "c.txt").len(), 1);

    let synced = synced_paths(&drain_events(&mut events), SyncDirection::LocalToRemote);
    assert_eq!(
        synced,
        vec![
            ("a".to_string(), SyncAction::Added),
            ("a/b".to_string(), SyncAction::Added),
            ("a/b/c.txt".to_string(), SyncAction::Added),
        ]
    );
    h.assert_invariants().await;
}

#[tokio::test]
async fn test_stale_local_edit_triggers_change_listing() {
    let h = Harness::new();
    let (_, app_root) = h.start_with_app().await;
    h.local.add_local_file(APP_ID, "notes.txt", b"v1");
    push_local_change(
        &h,
        "notes.txt",
        FileChange::add_or_update(LocalFileType::File),
        Some(b"v1"),
    )
    .await;
    let file = h.remote.children_titled(&app_root, "notes.txt")[0].file_id.clone();
    let listed_before = h.snapshot().await.largest_fetched_change_id();

    h.remote.update_file(&file, b"remote edit");
    let status = h
        .engine
        .apply_local_change(
            SyncFileUrl::new(APP_ID, "notes.txt"),
            FileChange::add_or_update(LocalFileType::File),
            Some(Bytes::from_static(b"local edit")),
        )
        .await;
    assert_eq!(status, SyncStatusCode::Retry);
    h.engine.wait_for_idle().await;

    // The listing ran on its own and saw the remote edit.
    let database = h.snapshot().await;
    assert!(database.largest_fetched_change_id() > listed_before);
    assert_eq!(
        h.remote.content(&file).as_deref(),
        Some(&b"remote edit"[..])
    );
}

#[tokio::test]
async fn test_unknown_origin_registers_app() {
    let h = Harness::new();
    h.start().await;

    let status = h
        .engine
        .apply_local_change(
            SyncFileUrl::new(APP_ID, "notes.txt"),
            FileChange::add_or_update(LocalFileType::File),
            Some(Bytes::from_static(b"hello")),
        )
        .await;
    assert_eq!(status, SyncStatusCode::UnknownOrigin);
    h.engine.wait_for_idle().await;

    assert_eq!(
        h.engine.origin_status_map().await.get(APP_ID).map(String::as_str),
        Some("Enabled")
    );
    h.drain_remote_changes().await;
    let status = push_local_change(
        &h,
        "notes.txt",
        FileChange::add_or_update(LocalFileType::File),
        Some(b"hello"),
    )
    .await;
    assert_eq!(status, SyncStatusCode::Ok);
    assert_eq!(h.remote.children_titled(&h.app_root_id(), "notes.txt").len(), 1);
}

// ============================================================================
// App lifecycle
// ============================================================================

#[tokio::test]
async fn test_registered_apps_follow_registry() {
    let h = Harness::new();
    h.start_with_app().await;
    assert_eq!(
        h.engine.origin_status_map().await.get(APP_ID).map(String::as_str),
        Some("Enabled")
    );

    h.registry.set_enabled(APP_ID, false);
    assert_eq!(h.engine.initialize().await, SyncStatusCode::Ok);
    h.engine.wait_for_idle().await;
    assert_eq!(
        h.engine.origin_status_map().await.get(APP_ID).map(String::as_str),
        Some("Disabled")
    );

    h.registry.set_enabled(APP_ID, true);
    assert_eq!(h.engine.initialize().await, SyncStatusCode::Ok);
    h.engine.wait_for_idle().await;
    assert_eq!(
        h.engine.origin_status_map().await.get(APP_ID).map(String::as_str),
        Some("Enabled")
    );

    h.registry.uninstall(APP_ID);
    assert_eq!(h.engine.initialize().await, SyncStatusCode::Ok);
    h.engine.wait_for_idle().await;
    assert!(h.engine.origin_status_map().await.is_empty());
    assert!(h
        .remote
        .children_titled(&h.sync_root_id(), APP_ID)
        .is_empty());
}

#[tokio::test]
async fn test_disabled_app_is_not_synced() {
    let h = Harness::new();
    let (_, app_root) = h.start_with_app().await;
    assert_eq!(h.engine.disable_origin(APP_ID).await, SyncStatusCode::Ok);

    h.remote.add_file(&app_root, "notes.txt", b"hello");
    h.fetch_remote_changes().await;
    h.drain_remote_changes().await;
    assert!(h.local.file_content(APP_ID, "notes.txt").is_none());

    let status = h
        .engine
        .apply_local_change(
            SyncFileUrl::new(APP_ID, "local.txt"),
            FileChange::add_or_update(LocalFileType::File),
            Some(Bytes::from_static(b"x")),
        )
        .await;
    assert_eq!(status, SyncStatusCode::UnknownOrigin);

    assert_eq!(h.engine.enable_origin(APP_ID).await, SyncStatusCode::Ok);
    h.drain_remote_changes().await;
    assert_eq!(
        h.local.file_content(APP_ID, "notes.txt").as_deref(),
        Some(&b"hello"[..])
    );
}

#[tokio::test]
async fn test_uninstall_keeps_or_purges_remote_folder() {
    let h = Harness::new();
    let (_, app_root) = h.start_with_app().await;

    assert_eq!(h.engine.uninstall_origin(APP_ID, false).await, SyncStatusCode::Ok);
    assert!(h.remote.resource(&app_root).is_some());
    assert!(h.engine.origin_status_map().await.is_empty());
    assert!(h.snapshot().await.find_app_root_tracker(APP_ID).is_none());

    assert_eq!(h.engine.register_origin(APP_ID).await, SyncStatusCode::Ok);
    assert_eq!(h.app_root_id(), app_root);

    assert_eq!(h.engine.uninstall_origin(APP_ID, true).await, SyncStatusCode::Ok);
    assert!(h.remote.resource(&app_root).is_none());
}

#[tokio::test]
async fn test_remote_app_root_deletion_registers_again() {
    let h = Harness::new();
    let (_, app_root) = h.start_with_app().await;

    h.remote.delete(&app_root);
    h.fetch_remote_changes().await;
    h.drain_remote_changes().await;
    h.engine.wait_for_idle().await;

    let recreated = h.app_root_id();
    assert_ne!(recreated, app_root);
    assert_eq!(
        h.snapshot().await.find_app_root_tracker(APP_ID).map(|t| t.file_id.clone()),
        Some(recreated)
    );
}

// ============================================================================
// Sync-root lifecycle
// ============================================================================

#[tokio::test]
async fn test_sync_root_deletion_rebuilds_index() {
    let h = Harness::new();
    h.start_with_app().await;
    let old_sync_root = h.sync_root_id();

    h.remote.delete(&old_sync_root);
    h.engine.on_notification_received().await;
    h.engine.wait_for_idle().await;

    let mut rebuilt = false;
    for _ in 0..16 {
        h.engine.process_remote_change().await;
        h.engine.wait_for_idle().await;
        let roots = h
            .remote
            .children_titled(&h.remote.root_folder_id(), SYNC_ROOT_TITLE);
        if roots.len() == 1 && roots[0].file_id != old_sync_root {
            rebuilt = true;
            break;
        }
    }
    assert!(rebuilt, "sync-root was not recreated");

    let database = h.snapshot().await;
    let root_tracker = database
        .find_tracker_by_tracker_id(database.sync_root_tracker_id().unwrap())
        .unwrap();
    assert_eq!(root_tracker.file_id, h.sync_root_id());
}

#[tokio::test]
async fn test_dump_files_lists_synced_entries() {
    let h = Harness::new();
    assert!(h.engine.dump_database().await.is_null());

    let (_, app_root) = h.start_with_app().await;
    let docs = h.remote.add_folder(&app_root, "docs");
    h.remote.add_file(&docs, "notes.txt", b"hello");
    h.fetch_remote_changes().await;
    h.drain_remote_changes().await;

    let files = h.engine.dump_files(APP_ID).await;
    let paths: Vec<&str> = files
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|entry| entry["path"].as_str())
        .collect();
    assert!(paths.contains(&"/docs"));
    assert!(paths.contains(&"/docs/notes.txt"));
    assert_eq!(h.engine.dump_files("unknown.app").await, serde_json::json!([]));

    let dump = h.engine.dump_database().await;
    assert_eq!(dump[0]["title"], "Trackers");
    assert_eq!(dump[1]["title"], "Metadata");
}

// ============================================================================
// Service state
// ============================================================================

#[tokio::test]
async fn test_network_changes_drive_service_state() {
    let h = Harness::new();
    let (mut events, _) = h.start_with_app().await;
    h.network.wait_for_subscriber().await;
    drain_events(&mut events);

    h.network.set_connected(false);
    assert_eq!(
        next_state(&mut events).await,
        RemoteServiceState::TemporarilyUnavailable
    );

    h.network.set_connected(true);
    assert_eq!(next_state(&mut events).await, RemoteServiceState::Ok);
    h.engine.wait_for_idle().await;
    assert_eq!(h.engine.service_state().await, RemoteServiceState::Ok);
}

#[tokio::test]
async fn test_disabling_sync_reports_disabled() {
    let h = Harness::new();
    let mut events = h.start().await;
    drain_events(&mut events);

    h.engine.set_sync_enabled(false).await;
    assert_eq!(h.engine.service_state().await, RemoteServiceState::Disabled);
    let states: Vec<RemoteServiceState> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            CoreEvent::Service(ServiceEvent::StateChanged { state, .. }) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![RemoteServiceState::Disabled]);

    h.engine.set_sync_enabled(true).await;
    assert_eq!(h.engine.service_state().await, RemoteServiceState::Ok);
}

#[tokio::test]
async fn test_shutdown_aborts_new_tasks() {
    let h = Harness::new();
    h.start_with_app().await;
    h.engine.shutdown().await;

    assert_eq!(
        h.engine.process_remote_change().await,
        SyncStatusCode::Abort
    );
}
