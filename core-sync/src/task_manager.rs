//! # Sync Task Manager
//!
//! Serializes every operation that touches the metadata index.
//!
//! ## Overview
//!
//! Tasks are queued with a [`TaskPriority`] and run one at a time by a single
//! worker. While a task runs it holds the [`SyncContext`] exclusively, so
//! database mutations are never concurrent. Within one priority class tasks
//! run in submission order.
//!
//! After each task the worker reports to its [`SyncTaskManagerClient`] (the
//! engine), which may queue follow-up work. When the queue drains the client
//! is asked once more whether anything else should be scheduled.
//!
//! ## Usage
//!
//! ```ignore
//! let manager = SyncTaskManager::new(context);
//! manager.start(Arc::downgrade(&client) as Weak<dyn SyncTaskManagerClient>);
//!
//! let handle = manager
//!     .schedule_task(SyncTask::ListChanges(ListChangesTask::new()), TaskPriority::Low)
//!     .await;
//! let status = handle.wait().await;
//! ```

use async_trait::async_trait;
use bridge_traits::{KeyValueStore, RemoteChangeProcessor, RemoteFileService};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::conflict_resolver::ConflictResolver;
use crate::initializer::SyncEngineInitializer;
use crate::list_changes_task::ListChangesTask;
use crate::local_to_remote_syncer::LocalToRemoteSyncer;
use crate::metadata_database::MetadataDatabase;
use crate::register_app_task::RegisterAppTask;
use crate::remote_to_local_syncer::RemoteToLocalSyncer;
use crate::status::SyncStatusCode;
use crate::sync_engine::SyncEngineConfig;
use crate::uninstall_app_task::UninstallAppTask;

// ============================================================================
// ID Types
// ============================================================================

/// Identifier of one scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Admission class of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum TaskPriority {
    /// Background polling: change listing, conflict resolution
    Low = 0,
    /// File syncing in either direction
    #[default]
    Normal = 1,
    /// App lifecycle and initialization
    High = 2,
}

// ============================================================================
// Context
// ============================================================================

/// State shared by all tasks; owned by the task manager and lent to one task
/// at a time.
pub struct SyncContext {
    pub(crate) key_value_store: Arc<dyn KeyValueStore>,
    pub(crate) metadata_database: Option<MetadataDatabase>,
    pub(crate) remote_service: Arc<dyn RemoteFileService>,
    pub(crate) remote_change_processor: Option<Arc<dyn RemoteChangeProcessor>>,
    pub(crate) config: SyncEngineConfig,
}

impl SyncContext {
    pub fn new(
        key_value_store: Arc<dyn KeyValueStore>,
        remote_service: Arc<dyn RemoteFileService>,
        remote_change_processor: Option<Arc<dyn RemoteChangeProcessor>>,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            key_value_store,
            metadata_database: None,
            remote_service,
            remote_change_processor,
            config,
        }
    }

    pub fn metadata_database(&self) -> Option<&MetadataDatabase> {
        self.metadata_database.as_ref()
    }

    pub fn metadata_database_mut(&mut self) -> Option<&mut MetadataDatabase> {
        self.metadata_database.as_mut()
    }

    /// Drops the in-memory index and deletes every stored record.
    pub async fn reset_metadata_database(&mut self) -> crate::Result<()> {
        match self.metadata_database.take() {
            Some(database) => database.clear_database().await,
            None => Ok(()),
        }
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }
}

impl fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("metadata_database", &self.metadata_database)
            .field("has_change_processor", &self.remote_change_processor.is_some())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Every kind of work the manager can run
#[derive(Debug)]
pub enum SyncTask {
    Initialize(SyncEngineInitializer),
    RegisterApp(RegisterAppTask),
    EnableApp(String),
    DisableApp(String),
    UninstallApp(UninstallAppTask),
    ListChanges(ListChangesTask),
    ResolveConflicts(ConflictResolver),
    RemoteToLocal(RemoteToLocalSyncer),
    LocalToRemote(LocalToRemoteSyncer),
}

impl SyncTask {
    pub fn name(&self) -> &'static str {
        match self {
            SyncTask::Initialize(_) => "initialize",
            SyncTask::RegisterApp(_) => "register_app",
            SyncTask::EnableApp(_) => "enable_app",
            SyncTask::DisableApp(_) => "disable_app",
            SyncTask::UninstallApp(_) => "uninstall_app",
            SyncTask::ListChanges(_) => "list_changes",
            SyncTask::ResolveConflicts(_) => "resolve_conflicts",
            SyncTask::RemoteToLocal(_) => "remote_to_local",
            SyncTask::LocalToRemote(_) => "local_to_remote",
        }
    }

    /// Whether the last run talked to the remote service. An `Ok` result only
    /// proves the service is reachable when it did.
    pub fn used_network(&self) -> bool {
        match self {
            SyncTask::Initialize(task) => task.used_network(),
            SyncTask::RegisterApp(task) => task.used_network(),
            SyncTask::EnableApp(_) | SyncTask::DisableApp(_) => false,
            SyncTask::UninstallApp(task) => task.used_network(),
            SyncTask::ListChanges(task) => task.used_network(),
            SyncTask::ResolveConflicts(task) => task.used_network(),
            SyncTask::RemoteToLocal(task) => task.used_network(),
            SyncTask::LocalToRemote(task) => task.used_network(),
        }
    }

    pub async fn run(&mut self, ctx: &mut SyncContext) -> SyncStatusCode {
        match self {
            SyncTask::Initialize(task) => task.run(ctx).await,
            SyncTask::RegisterApp(task) => task.run(ctx).await,
            SyncTask::EnableApp(app_id) => match ctx.metadata_database_mut() {
                Some(database) => match database.enable_app(app_id).await {
                    Ok(()) => SyncStatusCode::Ok,
                    Err(e) => e.status_code(),
                },
                None => SyncStatusCode::Failed,
            },
            SyncTask::DisableApp(app_id) => match ctx.metadata_database_mut() {
                Some(database) => match database.disable_app(app_id).await {
                    Ok(()) => SyncStatusCode::Ok,
                    Err(e) => e.status_code(),
                },
                None => SyncStatusCode::Failed,
            },
            SyncTask::UninstallApp(task) => task.run(ctx).await,
            SyncTask::ListChanges(task) => task.run(ctx).await,
            SyncTask::ResolveConflicts(task) => task.run(ctx).await,
            SyncTask::RemoteToLocal(task) => task.run(ctx).await,
            SyncTask::LocalToRemote(task) => task.run(ctx).await,
        }
    }
}

/// Receives task results from the manager's worker.
#[async_trait]
pub trait SyncTaskManagerClient: Send + Sync {
    /// Called after every task, before its waiter is woken.
    async fn did_finish_task(&self, task: &SyncTask, status: SyncStatusCode);

    /// Called whenever the queue runs empty after a task.
    async fn maybe_schedule_next_task(&self);
}

/// Completion handle of a scheduled task
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    completion: oneshot::Receiver<SyncStatusCode>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Waits for the task's status. A task dropped without running (manager
    /// shut down) reports `Abort`.
    pub async fn wait(self) -> SyncStatusCode {
        self.completion.await.unwrap_or(SyncStatusCode::Abort)
    }
}

// ============================================================================
// Manager
// ============================================================================

struct PendingTask {
    id: TaskId,
    priority: TaskPriority,
    sequence: u64,
    task: SyncTask,
    completion: oneshot::Sender<SyncStatusCode>,
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    // Max-heap: higher priority first, then lower sequence (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<PendingTask>,
    running: Option<TaskId>,
    next_sequence: u64,
}

struct Shared {
    queue: Mutex<QueueState>,
    wakeup: Notify,
    idle: watch::Sender<bool>,
    shutdown: CancellationToken,
}

/// Single-worker priority queue over [`SyncTask`]s.
pub struct SyncTaskManager {
    context: Arc<Mutex<SyncContext>>,
    shared: Arc<Shared>,
}

impl SyncTaskManager {
    pub fn new(context: SyncContext) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            context: Arc::new(Mutex::new(context)),
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState::default()),
                wakeup: Notify::new(),
                idle,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Spawns the worker. Results are reported to `client` while it is alive.
    pub fn start(&self, client: Weak<dyn SyncTaskManagerClient>) {
        let context = self.context.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_worker(context, shared, client).await;
        });
    }

    pub fn context(&self) -> &Arc<Mutex<SyncContext>> {
        &self.context
    }

    #[instrument(skip(self, task), fields(task = task.name()))]
    pub async fn schedule_task(&self, task: SyncTask, priority: TaskPriority) -> TaskHandle {
        let mut queue = self.shared.queue.lock().await;
        self.enqueue(&mut queue, task, priority)
    }

    /// Schedules `task` only when nothing is queued or running.
    pub async fn schedule_task_if_idle(
        &self,
        task: SyncTask,
        priority: TaskPriority,
    ) -> Option<TaskHandle> {
        let mut queue = self.shared.queue.lock().await;
        if queue.running.is_some() || !queue.pending.is_empty() {
            return None;
        }
        Some(self.enqueue(&mut queue, task, priority))
    }

    pub async fn is_idle(&self) -> bool {
        let queue = self.shared.queue.lock().await;
        queue.running.is_none() && queue.pending.is_empty()
    }

    pub async fn pending_task_count(&self) -> usize {
        self.shared.queue.lock().await.pending.len()
    }

    /// Resolves once the queue is empty, no task runs and the client has
    /// scheduled no follow-up work.
    pub async fn wait_for_idle(&self) {
        let mut idle = self.shared.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Stops the worker after the running task. Queued tasks report `Abort`.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let mut queue = self.shared.queue.lock().await;
        let dropped = queue.pending.len();
        queue.pending.clear();
        if dropped > 0 {
            info!(dropped, "Dropped queued sync tasks on shutdown");
        }
        self.shared.idle.send_replace(true);
    }

    fn enqueue(&self, queue: &mut QueueState, task: SyncTask, priority: TaskPriority) -> TaskHandle {
        let (completion, receiver) = oneshot::channel();
        let id = TaskId::new();
        if self.shared.shutdown.is_cancelled() {
            debug!(task_id = %id, task = task.name(), "Manager shut down, dropping task");
            return TaskHandle {
                id,
                completion: receiver,
            };
        }
        let sequence = queue.next_sequence;
        queue.next_sequence += 1;

        debug!(task_id = %id, task = task.name(), ?priority, "Scheduled sync task");
        queue.pending.push(PendingTask {
            id,
            priority,
            sequence,
            task,
            completion,
        });
        self.shared.idle.send_replace(false);
        self.shared.wakeup.notify_one();

        TaskHandle {
            id,
            completion: receiver,
        }
    }
}

impl Drop for SyncTaskManager {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn run_worker(
    context: Arc<Mutex<SyncContext>>,
    shared: Arc<Shared>,
    client: Weak<dyn SyncTaskManagerClient>,
) {
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        let next = {
            let mut queue = shared.queue.lock().await;
            let next = queue.pending.pop();
            match &next {
                Some(pending) => queue.running = Some(pending.id),
                None => {
                    shared.idle.send_replace(true);
                }
            }
            next
        };

        let Some(PendingTask {
            id,
            priority,
            mut task,
            completion,
            ..
        }) = next
        else {
            tokio::select! {
                _ = shared.wakeup.notified() => continue,
                _ = shared.shutdown.cancelled() => break,
            }
        };

        debug!(task_id = %id, task = task.name(), ?priority, "Running sync task");
        let status = {
            let mut ctx = context.lock().await;
            task.run(&mut ctx).await
        };
        if status.is_ok() {
            debug!(task_id = %id, task = task.name(), "Sync task finished");
        } else {
            info!(task_id = %id, task = task.name(), %status, "Sync task finished");
        }

        shared.queue.lock().await.running = None;

        let Some(client) = client.upgrade() else {
            warn!("Task manager client is gone");
            let _ = completion.send(status);
            continue;
        };
        client.did_finish_task(&task, status).await;
        let _ = completion.send(status);

        let drained = shared.queue.lock().await.pending.is_empty();
        if drained && !shared.shutdown.is_cancelled() {
            client.maybe_schedule_next_task().await;
        }
    }
    debug!("Sync task worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRemoteService;
    use bridge_desktop::MemoryKeyValueStore;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingClient {
        finished: StdMutex<Vec<(&'static str, SyncStatusCode)>>,
        idle_calls: StdMutex<usize>,
    }

    #[async_trait]
    impl SyncTaskManagerClient for RecordingClient {
        async fn did_finish_task(&self, task: &SyncTask, status: SyncStatusCode) {
            self.finished.lock().unwrap().push((task.name(), status));
        }

        async fn maybe_schedule_next_task(&self) {
            *self.idle_calls.lock().unwrap() += 1;
        }
    }

    fn manager() -> SyncTaskManager {
        let context = SyncContext::new(
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(FakeRemoteService::new()),
            None,
            SyncEngineConfig::default(),
        );
        SyncTaskManager::new(context)
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }

    #[tokio::test]
    async fn test_tasks_run_by_priority_then_fifo() {
        let manager = manager();
        let client = Arc::new(RecordingClient::default());

        // Queue everything before the worker starts so order is decided by the heap.
        let low = manager
            .schedule_task(SyncTask::ListChanges(ListChangesTask::new()), TaskPriority::Low)
            .await;
        let normal = manager
            .schedule_task(
                SyncTask::RemoteToLocal(RemoteToLocalSyncer::new()),
                TaskPriority::Normal,
            )
            .await;
        let first_high = manager
            .schedule_task(SyncTask::EnableApp("a".to_string()), TaskPriority::High)
            .await;
        let second_high = manager
            .schedule_task(SyncTask::DisableApp("a".to_string()), TaskPriority::High)
            .await;
        assert_eq!(manager.pending_task_count().await, 4);

        let weak: Weak<RecordingClient> = Arc::downgrade(&client);
        manager.start(weak);
        manager.wait_for_idle().await;

        // No database yet, so every task fails fast.
        assert_eq!(first_high.wait().await, SyncStatusCode::Failed);
        assert_eq!(second_high.wait().await, SyncStatusCode::Failed);
        normal.wait().await;
        low.wait().await;

        let names: Vec<&str> = client
            .finished
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| *name)
            .collect();
        assert_eq!(
            names,
            vec!["enable_app", "disable_app", "remote_to_local", "list_changes"]
        );
        assert_eq!(*client.idle_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_schedule_if_idle_refuses_when_busy() {
        let manager = manager();
        let _queued = manager
            .schedule_task(SyncTask::EnableApp("a".to_string()), TaskPriority::High)
            .await;

        assert!(!manager.is_idle().await);
        assert!(manager
            .schedule_task_if_idle(SyncTask::ListChanges(ListChangesTask::new()), TaskPriority::Low)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_queued_tasks() {
        let manager = manager();
        let handle = manager
            .schedule_task(SyncTask::EnableApp("a".to_string()), TaskPriority::High)
            .await;

        manager.shutdown().await;

        assert_eq!(handle.wait().await, SyncStatusCode::Abort);
        assert!(manager.is_idle().await);
    }
}
