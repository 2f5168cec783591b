//! # In-Memory Fakes
//!
//! Deterministic stand-ins for every bridge the engine talks to, used by the
//! unit tests and available to downstream crates with the `test-util`
//! feature.
//!
//! - [`FakeRemoteService`]: remote tree with a change feed, etags and
//!   failure injection
//! - [`FakeRemoteChangeProcessor`]: local sandbox with queued local changes
//! - [`FakeAppRegistry`]: installed and enabled apps
//! - [`FakeNetworkMonitor`]: connectivity switch with a change stream
//! - [`ManualClock`]: time that only moves when told to
//! - [`FlakyKeyValueStore`]: in-memory store whose writes can be made to fail
//!
//! ## Usage
//!
//! ```ignore
//! let remote = Arc::new(FakeRemoteService::new());
//! let sync_root = remote.add_folder(&remote.root_folder_id(), "Drive Sync Root");
//! let app_root = remote.add_folder(&sync_root, "example.com");
//! remote.add_file(&app_root, "notes.txt", b"hello");
//! ```

use async_trait::async_trait;
use bridge_traits::{
    AboutResource, AppRegistry, BatchOperation, BridgeError, ChangeList, ChangeResource, Clock,
    FileChange, FileList, FileResource, KeyValueStore, LocalFileMetadata, LocalFileType,
    NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkType, PreparedChange,
    RemoteChangeProcessor, RemoteErrorCode, RemoteFileKind, RemoteFileService, SyncFileUrl,
    WriteBatch,
};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};

type BridgeResult<T> = bridge_traits::error::Result<T>;

const ROOT_FOLDER_ID: &str = "root";
const EPOCH_SECONDS: i64 = 1_700_000_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn content_hash(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

fn not_found(id: &str) -> BridgeError {
    BridgeError::remote(RemoteErrorCode::NotFound, format!("{} not found", id))
}

// ============================================================================
// Remote service
// ============================================================================

#[derive(Debug, Clone)]
struct RemoteEntry {
    resource: FileResource,
    content: Bytes,
}

#[derive(Debug)]
struct RemoteState {
    entries: BTreeMap<String, RemoteEntry>,
    /// Latest change id per file id; deleted files keep their entry
    changes: BTreeMap<String, i64>,
    largest_change_id: i64,
    next_id: u64,
    tick: i64,
    /// `None` lets a call through
    failures: Vec<Option<RemoteErrorCode>>,
    change_page_size: usize,
}

impl RemoteState {
    fn now(&mut self) -> DateTime<Utc> {
        self.tick += 1;
        DateTime::<Utc>::from_timestamp(EPOCH_SECONDS + self.tick, 0).unwrap_or_default()
    }

    fn record_change(&mut self, file_id: &str) {
        self.largest_change_id += 1;
        self.changes
            .insert(file_id.to_string(), self.largest_change_id);
    }

    fn take_failure(&mut self) -> BridgeResult<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        match self.failures.remove(0) {
            Some(code) => Err(BridgeError::remote(code, "injected failure")),
            None => Ok(()),
        }
    }

    fn create(&mut self, parent_id: &str, title: &str, content: Option<&[u8]>) -> BridgeResult<FileResource> {
        if !self.entries.contains_key(parent_id) {
            return Err(not_found(parent_id));
        }
        self.next_id += 1;
        let file_id = format!("file-{:04}", self.next_id);
        let now = self.now();
        let (kind, hash, content) = match content {
            Some(content) => (
                RemoteFileKind::File,
                Some(content_hash(content)),
                Bytes::copy_from_slice(content),
            ),
            None => (RemoteFileKind::Folder, None, Bytes::new()),
        };

        let resource = FileResource {
            file_id: file_id.clone(),
            title: title.to_string(),
            kind,
            parent_ids: vec![parent_id.to_string()],
            content_hash: hash,
            etag: format!("etag-{}", self.tick),
            created_at: now,
            modified_at: now,
            trashed: false,
        };
        self.entries.insert(
            file_id.clone(),
            RemoteEntry {
                resource: resource.clone(),
                content,
            },
        );
        self.record_change(&file_id);
        Ok(resource)
    }

    fn touch(&mut self, file_id: &str) -> BridgeResult<&mut RemoteEntry> {
        if !self.entries.contains_key(file_id) {
            return Err(not_found(file_id));
        }
        let now = self.now();
        let tick = self.tick;
        self.record_change(file_id);
        let entry = self.entries.get_mut(file_id).ok_or_else(|| not_found(file_id))?;
        entry.resource.modified_at = now;
        entry.resource.etag = format!("etag-{}", tick);
        Ok(entry)
    }

    fn update_content(&mut self, file_id: &str, content: &[u8]) -> BridgeResult<FileResource> {
        let entry = self.touch(file_id)?;
        entry.content = Bytes::copy_from_slice(content);
        entry.resource.content_hash = Some(content_hash(content));
        Ok(entry.resource.clone())
    }

    fn check_etag(&self, file_id: &str, etag: Option<&str>) -> BridgeResult<()> {
        let entry = self.entries.get(file_id).ok_or_else(|| not_found(file_id))?;
        match etag {
            Some(etag) if etag != entry.resource.etag => Err(BridgeError::remote(
                RemoteErrorCode::PreconditionFailed,
                format!("etag mismatch for {}", file_id),
            )),
            _ => Ok(()),
        }
    }

    /// Removes `file_id` and every child left without a parent.
    fn delete(&mut self, file_id: &str) {
        let mut pending = vec![file_id.to_string()];
        while let Some(id) = pending.pop() {
            if self.entries.remove(&id).is_none() {
                continue;
            }
            self.record_change(&id);

            let children: Vec<String> = self
                .entries
                .values()
                .filter(|entry| entry.resource.has_parent(&id))
                .map(|entry| entry.resource.file_id.clone())
                .collect();
            for child in children {
                let orphaned = match self.entries.get_mut(&child) {
                    Some(entry) => {
                        entry.resource.parent_ids.retain(|parent| *parent != id);
                        entry.resource.parent_ids.is_empty()
                    }
                    None => false,
                };
                if orphaned {
                    pending.push(child);
                } else {
                    self.record_change(&child);
                }
            }
        }
    }

    fn children(&self, parent_id: &str) -> Vec<FileResource> {
        self.entries
            .values()
            .filter(|entry| entry.resource.has_parent(parent_id))
            .map(|entry| entry.resource.clone())
            .collect()
    }
}

/// Remote tree held in memory.
///
/// File ids are allocated in increasing order (`file-0001`, `file-0002`, ...)
/// and every mutation advances a logical clock, so creation order, id order
/// and `created_at` order agree. Content hashes are SHA-256 hex digests.
#[derive(Debug)]
pub struct FakeRemoteService {
    state: Mutex<RemoteState>,
    has_refresh_token: AtomicBool,
}

impl Default for FakeRemoteService {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemoteService {
    pub fn new() -> Self {
        let root = FileResource {
            file_id: ROOT_FOLDER_ID.to_string(),
            title: String::new(),
            kind: RemoteFileKind::Folder,
            parent_ids: Vec::new(),
            content_hash: None,
            etag: "etag-0".to_string(),
            created_at: DateTime::<Utc>::from_timestamp(EPOCH_SECONDS, 0).unwrap_or_default(),
            modified_at: DateTime::<Utc>::from_timestamp(EPOCH_SECONDS, 0).unwrap_or_default(),
            trashed: false,
        };
        let mut entries = BTreeMap::new();
        entries.insert(
            ROOT_FOLDER_ID.to_string(),
            RemoteEntry {
                resource: root,
                content: Bytes::new(),
            },
        );

        Self {
            state: Mutex::new(RemoteState {
                entries,
                changes: BTreeMap::new(),
                largest_change_id: 0,
                next_id: 0,
                tick: 0,
                failures: Vec::new(),
                change_page_size: 100,
            }),
            has_refresh_token: AtomicBool::new(true),
        }
    }

    pub fn root_folder_id(&self) -> String {
        ROOT_FOLDER_ID.to_string()
    }

    /// Creates a folder as another client would. Panics on an unknown parent.
    pub fn add_folder(&self, parent_id: &str, title: &str) -> String {
        match lock(&self.state).create(parent_id, title, None) {
            Ok(resource) => resource.file_id,
            Err(e) => panic!("add_folder: {}", e),
        }
    }

    /// Creates a file as another client would. Panics on an unknown parent.
    pub fn add_file(&self, parent_id: &str, title: &str, content: &[u8]) -> String {
        match lock(&self.state).create(parent_id, title, Some(content)) {
            Ok(resource) => resource.file_id,
            Err(e) => panic!("add_file: {}", e),
        }
    }

    pub fn update_file(&self, file_id: &str, content: &[u8]) {
        if let Err(e) = lock(&self.state).update_content(file_id, content) {
            panic!("update_file: {}", e);
        }
    }

    pub fn rename(&self, file_id: &str, title: &str) {
        match lock(&self.state).touch(file_id) {
            Ok(entry) => entry.resource.title = title.to_string(),
            Err(e) => panic!("rename: {}", e),
        }
    }

    /// Links `file_id` under one more parent.
    pub fn add_parent(&self, file_id: &str, parent_id: &str) {
        match lock(&self.state).touch(file_id) {
            Ok(entry) => entry.resource.parent_ids.push(parent_id.to_string()),
            Err(e) => panic!("add_parent: {}", e),
        }
    }

    pub fn delete(&self, file_id: &str) {
        lock(&self.state).delete(file_id);
    }

    pub fn resource(&self, file_id: &str) -> Option<FileResource> {
        lock(&self.state)
            .entries
            .get(file_id)
            .map(|entry| entry.resource.clone())
    }

    pub fn content(&self, file_id: &str) -> Option<Bytes> {
        lock(&self.state)
            .entries
            .get(file_id)
            .map(|entry| entry.content.clone())
    }

    /// Children of `parent_id` in creation order
    pub fn children(&self, parent_id: &str) -> Vec<FileResource> {
        lock(&self.state).children(parent_id)
    }

    pub fn children_titled(&self, parent_id: &str, title: &str) -> Vec<FileResource> {
        self.children(parent_id)
            .into_iter()
            .filter(|child| child.title == title)
            .collect()
    }

    pub fn largest_change_id(&self) -> i64 {
        lock(&self.state).largest_change_id
    }

    /// Makes the next request fail with `code`. Calls queue up.
    pub fn fail_next(&self, code: RemoteErrorCode) {
        lock(&self.state).failures.push(Some(code));
    }

    /// Lets `calls` requests succeed, then fails the one after them.
    pub fn fail_after(&self, calls: usize, code: RemoteErrorCode) {
        let mut state = lock(&self.state);
        state.failures.extend(std::iter::repeat(None).take(calls));
        state.failures.push(Some(code));
    }

    pub fn set_change_page_size(&self, size: usize) {
        lock(&self.state).change_page_size = size.max(1);
    }

    pub fn set_refresh_token(&self, present: bool) {
        self.has_refresh_token.store(present, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteFileService for FakeRemoteService {
    async fn get_about_resource(&self) -> BridgeResult<AboutResource> {
        let mut state = lock(&self.state);
        state.take_failure()?;
        Ok(AboutResource {
            largest_change_id: state.largest_change_id,
            root_folder_id: ROOT_FOLDER_ID.to_string(),
        })
    }

    async fn get_file_resource(&self, file_id: &str) -> BridgeResult<FileResource> {
        let mut state = lock(&self.state);
        state.take_failure()?;
        state
            .entries
            .get(file_id)
            .map(|entry| entry.resource.clone())
            .ok_or_else(|| not_found(file_id))
    }

    async fn list_changes(
        &self,
        start_change_id: i64,
        page_token: Option<&str>,
    ) -> BridgeResult<ChangeList> {
        let mut state = lock(&self.state);
        state.take_failure()?;

        let mut pending: Vec<(i64, String)> = state
            .changes
            .iter()
            .filter(|(_, change_id)| **change_id >= start_change_id)
            .map(|(file_id, change_id)| (*change_id, file_id.clone()))
            .collect();
        pending.sort();

        let offset: usize = page_token.and_then(|token| token.parse().ok()).unwrap_or(0);
        let end = (offset + state.change_page_size).min(pending.len());
        let items = pending[offset.min(end)..end]
            .iter()
            .map(|(change_id, file_id)| {
                let file = state.entries.get(file_id).map(|entry| entry.resource.clone());
                ChangeResource {
                    change_id: *change_id,
                    file_id: file_id.clone(),
                    deleted: file.is_none(),
                    file,
                }
            })
            .collect();

        Ok(ChangeList {
            items,
            largest_change_id: state.largest_change_id,
            next_page_token: (end < pending.len()).then(|| end.to_string()),
        })
    }

    async fn list_folder(&self, folder_id: &str, _page_token: Option<&str>) -> BridgeResult<FileList> {
        let mut state = lock(&self.state);
        state.take_failure()?;
        if !state.entries.contains_key(folder_id) {
            return Err(not_found(folder_id));
        }
        Ok(FileList {
            items: state.children(folder_id),
            next_page_token: None,
        })
    }

    async fn search_by_title(&self, title: &str, parent_id: &str) -> BridgeResult<FileList> {
        let mut state = lock(&self.state);
        state.take_failure()?;
        Ok(FileList {
            items: state
                .children(parent_id)
                .into_iter()
                .filter(|child| child.title == title && !child.trashed)
                .collect(),
            next_page_token: None,
        })
    }

    async fn create_folder(&self, parent_id: &str, title: &str) -> BridgeResult<FileResource> {
        let mut state = lock(&self.state);
        state.take_failure()?;
        state.create(parent_id, title, None)
    }

    async fn upload_new_file(
        &self,
        parent_id: &str,
        title: &str,
        content: Bytes,
    ) -> BridgeResult<FileResource> {
        let mut state = lock(&self.state);
        state.take_failure()?;
        state.create(parent_id, title, Some(&content))
    }

    async fn upload_existing_file(
        &self,
        file_id: &str,
        content: Bytes,
        etag: Option<&str>,
    ) -> BridgeResult<FileResource> {
        let mut state = lock(&self.state);
        state.take_failure()?;
        state.check_etag(file_id, etag)?;
        state.update_content(file_id, &content)
    }

    async fn download_file(&self, file_id: &str) -> BridgeResult<Bytes> {
        let mut state = lock(&self.state);
        state.take_failure()?;
        state
            .entries
            .get(file_id)
            .map(|entry| entry.content.clone())
            .ok_or_else(|| not_found(file_id))
    }

    async fn delete_file(&self, file_id: &str, etag: Option<&str>) -> BridgeResult<()> {
        let mut state = lock(&self.state);
        state.take_failure()?;
        state.check_etag(file_id, etag)?;
        state.delete(file_id);
        Ok(())
    }

    async fn remove_parent(&self, file_id: &str, parent_id: &str) -> BridgeResult<()> {
        let mut state = lock(&self.state);
        state.take_failure()?;
        let entry = state.touch(file_id)?;
        entry.resource.parent_ids.retain(|parent| parent != parent_id);
        Ok(())
    }

    fn has_refresh_token(&self) -> bool {
        self.has_refresh_token.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Local sandbox
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalEntry {
    File(Bytes),
    Directory,
}

#[derive(Debug, Default)]
struct LocalState {
    entries: BTreeMap<SyncFileUrl, LocalEntry>,
    pending: BTreeMap<SyncFileUrl, Vec<FileChange>>,
    applied: Vec<(SyncFileUrl, FileChange)>,
    fail_apply: bool,
}

impl LocalState {
    fn ensure_parents(&mut self, url: &SyncFileUrl) {
        let components = url.components();
        for depth in 1..components.len() {
            let parent = SyncFileUrl::new(url.app_id.clone(), components[..depth].join("/"));
            self.entries.insert(parent, LocalEntry::Directory);
        }
    }

    /// Removes `url` and everything below it. The app root removes every
    /// entry of the app.
    fn remove_tree(&mut self, url: &SyncFileUrl) {
        let root = url.components().is_empty();
        let prefix = format!("{}/", url.path);
        self.entries.retain(|existing, _| {
            existing.app_id != url.app_id
                || (!root && existing.path != url.path && !existing.path.starts_with(&prefix))
        });
    }
}

/// Local file system of every app, keyed by [`SyncFileUrl`].
///
/// Local edits are simulated with [`add_local_file`](Self::add_local_file)
/// plus [`queue_local_change`](Self::queue_local_change); the queue is what
/// [`RemoteChangeProcessor::prepare_for_remote_change`] reports as pending.
#[derive(Debug, Default)]
pub struct FakeRemoteChangeProcessor {
    state: Mutex<LocalState>,
}

impl FakeRemoteChangeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_local_file(&self, app_id: &str, path: &str, content: &[u8]) {
        let url = SyncFileUrl::new(app_id, path);
        let mut state = lock(&self.state);
        state.ensure_parents(&url);
        state
            .entries
            .insert(url, LocalEntry::File(Bytes::copy_from_slice(content)));
    }

    pub fn add_local_directory(&self, app_id: &str, path: &str) {
        let url = SyncFileUrl::new(app_id, path);
        let mut state = lock(&self.state);
        state.ensure_parents(&url);
        state.entries.insert(url, LocalEntry::Directory);
    }

    pub fn remove_local(&self, app_id: &str, path: &str) {
        lock(&self.state).remove_tree(&SyncFileUrl::new(app_id, path));
    }

    pub fn queue_local_change(&self, app_id: &str, path: &str, change: FileChange) {
        lock(&self.state)
            .pending
            .entry(SyncFileUrl::new(app_id, path))
            .or_default()
            .push(change);
    }

    /// Drains every queued local change, oldest path first.
    pub fn take_pending_changes(&self) -> Vec<(SyncFileUrl, FileChange)> {
        let pending = std::mem::take(&mut lock(&self.state).pending);
        pending
            .into_iter()
            .filter_map(|(url, changes)| changes.last().copied().map(|change| (url, change)))
            .collect()
    }

    pub fn file_content(&self, app_id: &str, path: &str) -> Option<Bytes> {
        match lock(&self.state).entries.get(&SyncFileUrl::new(app_id, path)) {
            Some(LocalEntry::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn is_directory(&self, app_id: &str, path: &str) -> bool {
        matches!(
            lock(&self.state).entries.get(&SyncFileUrl::new(app_id, path)),
            Some(LocalEntry::Directory)
        )
    }

    /// Paths present for `app_id`, sorted
    pub fn paths(&self, app_id: &str) -> Vec<String> {
        lock(&self.state)
            .entries
            .keys()
            .filter(|url| url.app_id == app_id)
            .map(|url| url.path.clone())
            .collect()
    }

    /// Every remote change applied so far, in order
    pub fn applied_changes(&self) -> Vec<(SyncFileUrl, FileChange)> {
        lock(&self.state).applied.clone()
    }

    pub fn set_fail_apply(&self, fail: bool) {
        lock(&self.state).fail_apply = fail;
    }
}

#[async_trait]
impl RemoteChangeProcessor for FakeRemoteChangeProcessor {
    async fn prepare_for_remote_change(&self, url: &SyncFileUrl) -> BridgeResult<PreparedChange> {
        let state = lock(&self.state);
        let entry = if url.components().is_empty() {
            // The app root always exists locally.
            Some(&LocalEntry::Directory)
        } else {
            state.entries.get(url)
        };
        let metadata = match entry {
            Some(LocalEntry::File(content)) => LocalFileMetadata {
                file_type: LocalFileType::File,
                size: content.len() as u64,
                last_modified: None,
            },
            Some(LocalEntry::Directory) => LocalFileMetadata {
                file_type: LocalFileType::Directory,
                size: 0,
                last_modified: None,
            },
            None => LocalFileMetadata::missing(),
        };
        Ok(PreparedChange {
            metadata,
            local_changes: state.pending.get(url).cloned().unwrap_or_default(),
        })
    }

    async fn apply_remote_change(
        &self,
        change: FileChange,
        content: Option<Bytes>,
        url: &SyncFileUrl,
    ) -> BridgeResult<()> {
        let mut state = lock(&self.state);
        if state.fail_apply {
            return Err(BridgeError::OperationFailed(format!("cannot write {}", url)));
        }

        if change.is_delete() {
            state.remove_tree(url);
        } else {
            state.remove_tree(url);
            state.ensure_parents(url);
            let entry = match change.file_type {
                LocalFileType::Directory => LocalEntry::Directory,
                _ => LocalEntry::File(content.unwrap_or_default()),
            };
            state.entries.insert(url.clone(), entry);
        }
        state.applied.push((url.clone(), change));
        Ok(())
    }

    async fn finalize_remote_sync(
        &self,
        url: &SyncFileUrl,
        clear_local_changes: bool,
    ) -> BridgeResult<()> {
        if clear_local_changes {
            lock(&self.state).pending.remove(url);
        }
        Ok(())
    }

    async fn record_fake_local_change(
        &self,
        url: &SyncFileUrl,
        change: FileChange,
    ) -> BridgeResult<()> {
        lock(&self.state)
            .pending
            .entry(url.clone())
            .or_default()
            .push(change);
        Ok(())
    }
}

// ============================================================================
// App registry
// ============================================================================

/// Installed apps and their enabled flag
#[derive(Debug, Default)]
pub struct FakeAppRegistry {
    apps: Mutex<BTreeMap<String, bool>>,
}

impl FakeAppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, app_id: &str, enabled: bool) {
        lock(&self.apps).insert(app_id.to_string(), enabled);
    }

    pub fn uninstall(&self, app_id: &str) {
        lock(&self.apps).remove(app_id);
    }

    pub fn set_enabled(&self, app_id: &str, enabled: bool) {
        if let Some(flag) = lock(&self.apps).get_mut(app_id) {
            *flag = enabled;
        }
    }
}

#[async_trait]
impl AppRegistry for FakeAppRegistry {
    async fn installed_app_ids(&self) -> BridgeResult<Vec<String>> {
        Ok(lock(&self.apps).keys().cloned().collect())
    }

    async fn is_enabled(&self, app_id: &str) -> BridgeResult<bool> {
        Ok(lock(&self.apps).get(app_id).copied().unwrap_or(false))
    }
}

// ============================================================================
// Network
// ============================================================================

/// Connectivity switch. Every subscriber sees each [`set_connected`](Self::set_connected).
#[derive(Debug, Default)]
pub struct FakeNetworkMonitor {
    disconnected: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<NetworkInfo>>>,
    subscribed: Notify,
}

impl FakeNetworkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
        let info = self.current();
        lock(&self.subscribers).retain(|subscriber| subscriber.send(info.clone()).is_ok());
    }

    /// Resolves once somebody listens for connectivity changes.
    pub async fn wait_for_subscriber(&self) {
        loop {
            let subscribed = self.subscribed.notified();
            if !lock(&self.subscribers).is_empty() {
                return;
            }
            subscribed.await;
        }
    }

    fn current(&self) -> NetworkInfo {
        if self.disconnected.load(Ordering::SeqCst) {
            NetworkInfo::disconnected()
        } else {
            NetworkInfo::connected(NetworkType::Ethernet)
        }
    }
}

#[async_trait]
impl NetworkMonitor for FakeNetworkMonitor {
    async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
        Ok(self.current())
    }

    async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(sender);
        self.subscribed.notify_waiters();
        Ok(Box::new(ChannelChangeStream { receiver }))
    }
}

struct ChannelChangeStream {
    receiver: mpsc::UnboundedReceiver<NetworkInfo>,
}

#[async_trait]
impl NetworkChangeStream for ChannelChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        self.receiver.recv().await
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Clock that only moves through [`advance`](Self::advance).
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(
                DateTime::<Utc>::from_timestamp(EPOCH_SECONDS, 0).unwrap_or_default(),
            ),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Ordered in-memory store; [`fail_writes`](Self::fail_writes) makes every
/// later mutation fail with a database error.
#[derive(Debug, Default)]
pub struct FlakyKeyValueStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl FlakyKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> BridgeResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BridgeError::DatabaseError("write rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FlakyKeyValueStore {
    async fn get(&self, key: &str) -> BridgeResult<Option<Vec<u8>>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
        self.check_writable()?;
        lock(&self.entries).insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> BridgeResult<()> {
        self.check_writable()?;
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn iterate_prefix(&self, prefix: &str) -> BridgeResult<Vec<(String, Vec<u8>)>> {
        Ok(lock(&self.entries)
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn write(&self, batch: WriteBatch) -> BridgeResult<()> {
        self.check_writable()?;
        let mut entries = lock(&self.entries);
        for operation in batch.into_operations() {
            match operation {
                BatchOperation::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOperation::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_change_feed_reports_latest_state_per_file() {
        let remote = FakeRemoteService::new();
        let folder = remote.add_folder(&remote.root_folder_id(), "a");
        let file = remote.add_file(&folder, "b", b"1");
        remote.update_file(&file, b"2");
        remote.delete(&folder);

        let changes = remote.list_changes(1, None).await.unwrap();
        assert_eq!(changes.items.len(), 2);
        assert!(changes.items.iter().all(|change| change.deleted));
        assert_eq!(changes.largest_change_id, remote.largest_change_id());
    }

    #[tokio::test]
    async fn test_stale_etag_is_rejected() {
        let remote = FakeRemoteService::new();
        let file = remote.add_file(&remote.root_folder_id(), "a", b"1");
        let etag = remote.resource(&file).unwrap().etag;
        remote.update_file(&file, b"2");

        let err = remote
            .upload_existing_file(&file, Bytes::from_static(b"3"), Some(&etag))
            .await
            .unwrap_err();
        assert_eq!(err.remote_code(), Some(RemoteErrorCode::PreconditionFailed));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let remote = FakeRemoteService::new();
        remote.fail_next(RemoteErrorCode::NoConnection);
        assert!(remote.get_about_resource().await.is_err());
        assert!(remote.get_about_resource().await.is_ok());
    }

    #[tokio::test]
    async fn test_local_delete_removes_subtree() {
        let local = FakeRemoteChangeProcessor::new();
        local.add_local_file("app", "a/b.txt", b"x");
        assert!(local.is_directory("app", "a"));

        local
            .apply_remote_change(
                FileChange::delete(LocalFileType::Unknown),
                None,
                &SyncFileUrl::new("app", "a"),
            )
            .await
            .unwrap();
        assert!(local.paths("app").is_empty());
    }
}
