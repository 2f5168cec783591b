//! Integration tests for conflict resolution
//!
//! Remote trees are prepared by "another client" before the engine starts,
//! then the engine is driven until no conflict is left.

mod common;

use common::{Harness, APP_ID, SYNC_ROOT_TITLE};
use core_sync::testing::FakeRemoteService;
use core_sync::{MetadataDatabase, SyncStatusCode};
use std::sync::Arc;

/// Remote account with a sync-root and an app-root already in place.
fn prepared_remote() -> (Arc<FakeRemoteService>, String) {
    let remote = Arc::new(FakeRemoteService::new());
    let sync_root = remote.add_folder(&remote.root_folder_id(), SYNC_ROOT_TITLE);
    let app_root = remote.add_folder(&sync_root, APP_ID);
    (remote, app_root)
}

fn trackers_titled(database: &MetadataDatabase, title: &str) -> usize {
    let app_root = database.find_app_root_tracker(APP_ID).unwrap().tracker_id;
    database
        .find_trackers_by_parent_and_title(app_root, title)
        .map(|set| set.len())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_name_clash_keeps_first_created_file() {
    let (remote, app_root) = prepared_remote();
    let first = remote.add_file(&app_root, "foo", b"1");
    remote.add_file(&app_root, "foo", b"2");
    remote.add_file(&app_root, "foo", b"3");
    remote.add_file(&app_root, "foo", b"4");

    let h = Harness::with_remote(remote);
    h.start_with_app().await;
    h.resolve_all_conflicts().await;

    let survivors = h.remote.children_titled(&app_root, "foo");
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].file_id, first);

    let database = h.snapshot().await;
    assert_eq!(trackers_titled(&database, "foo"), 1);
    let (tracker, _) = database.find_nearest_active_ancestor(APP_ID, "foo").unwrap();
    assert_eq!(tracker.file_id, first);
    h.assert_invariants().await;
}

#[tokio::test]
async fn test_multi_parent_file_keeps_one_parent() {
    let (remote, app_root) = prepared_remote();
    let a = remote.add_folder(&app_root, "a");
    let b = remote.add_folder(&app_root, "b");
    let c = remote.add_folder(&app_root, "c");
    let d = remote.add_folder(&app_root, "d");
    let file = remote.add_file(&a, "shared.txt", b"shared");
    remote.add_parent(&file, &b);
    remote.add_parent(&file, &c);
    remote.add_parent(&file, &d);

    let h = Harness::with_remote(remote);
    h.start_with_app().await;
    h.resolve_all_conflicts().await;

    let resource = h.remote.resource(&file).unwrap();
    assert_eq!(resource.parent_ids.len(), 1);

    let database = h.snapshot().await;
    assert_eq!(
        database.find_trackers_by_file_id(&file).map(|set| set.len()),
        Some(1)
    );
    h.assert_invariants().await;

    // Exactly one local copy survives, under the kept parent.
    let copies: Vec<String> = h
        .local
        .paths(APP_ID)
        .into_iter()
        .filter(|path| path.ends_with("shared.txt"))
        .collect();
    assert_eq!(copies.len(), 1);
}

#[tokio::test]
async fn test_folder_beats_file_of_same_name() {
    let (remote, app_root) = prepared_remote();
    let file = remote.add_file(&app_root, "x", b"file");
    let folder = remote.add_folder(&app_root, "x");

    let h = Harness::with_remote(remote);
    h.start_with_app().await;
    h.resolve_all_conflicts().await;

    assert!(h.remote.resource(&file).is_none());
    let survivors = h.remote.children_titled(&app_root, "x");
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].file_id, folder);

    let database = h.snapshot().await;
    let (tracker, _) = database.find_nearest_active_ancestor(APP_ID, "x").unwrap();
    assert_eq!(tracker.file_id, folder);
}

#[tokio::test]
async fn test_clean_tree_reports_no_conflict() {
    let (remote, app_root) = prepared_remote();
    remote.add_file(&app_root, "one", b"1");
    remote.add_file(&app_root, "two", b"2");

    let h = Harness::with_remote(remote);
    h.start_with_app().await;

    assert_eq!(h.engine.resolve_conflicts().await, SyncStatusCode::NoConflict);
    assert_eq!(h.remote.children(&app_root).len(), 2);
}

#[tokio::test]
async fn test_resolution_waits_for_dirty_trackers() {
    let (remote, app_root) = prepared_remote();
    remote.add_file(&app_root, "one", b"1");

    let h = Harness::with_remote(remote);
    h.start_with_app().await;

    // A fresh remote edit leaves a dirty tracker behind.
    h.remote.add_file(&app_root, "two", b"2");
    h.fetch_remote_changes().await;
    assert!(h.snapshot().await.has_dirty_tracker());
    assert_eq!(h.engine.resolve_conflicts().await, SyncStatusCode::Failed);

    h.drain_remote_changes().await;
    assert_eq!(h.engine.resolve_conflicts().await, SyncStatusCode::NoConflict);
}
