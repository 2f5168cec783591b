//! # Sync Engine
//!
//! Top-level façade of the sync core.
//!
//! ## Overview
//!
//! The engine owns the [`SyncTaskManager`] (and through it the metadata
//! index), tracks the availability of the remote service and decides which
//! task runs next. Every state-affecting operation becomes a [`SyncTask`], so
//! index mutations never overlap.
//!
//! ## Service State
//!
//! | Task status | Resulting state |
//! |-------------|-----------------|
//! | `OK` after a network round | `Ok` |
//! | `AUTHENTICATION_FAILED`, `ACCESS_FORBIDDEN` | `AuthenticationRequired` |
//! | `NETWORK_ERROR`, `SERVICE_TEMPORARILY_UNAVAILABLE`, `ABORT`, `FAILED` | `TemporarilyUnavailable` (or `AuthenticationRequired` without a refresh token) |
//! | `DATABASE_ERROR_CORRUPTION`, `DATABASE_ERROR_IO_ERROR`, `DATABASE_ERROR_FAILED` | `Disabled` |
//!
//! A reconnect, or a push notification while `TemporarilyUnavailable`,
//! moves the service back to `Ok`.
//!
//! A host that switched sync off with [`SyncEngine::set_sync_enabled`] sees
//! `Disabled` regardless of the underlying state.
//!
//! ## Polling
//!
//! When the task queue drains the engine lists remote changes, but at most
//! once per `list_changes_retry_delay` unless a push notification, a
//! reconnect or a local-to-remote syncer asks for an immediate check. Inside
//! the cooldown, an engine without dirty trackers runs the conflict resolver
//! instead.
//!
//! ## Usage
//!
//! ```ignore
//! let engine = SyncEngine::new(&core_config, SyncEngineConfig::default());
//! engine.start();
//! engine.set_sync_enabled(true).await;
//! engine.initialize().await;
//!
//! engine.register_origin("example.com").await;
//! while engine.process_remote_change().await == SyncStatusCode::Ok {}
//! ```

use async_trait::async_trait;
use bridge_traits::{
    AppRegistry, Clock, FileChange, NetworkMonitor, RemoteFileService, SyncFileUrl,
};
use bytes::Bytes;
use core_runtime::config::CoreConfig;
use core_runtime::events::{
    CoreEvent, EventBus, FileEvent, Receiver, RemoteServiceState, ServiceEvent, SyncAction,
    SyncDirection,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::conflict_resolver::{ConflictPolicy, ConflictResolver};
use crate::initializer::SyncEngineInitializer;
use crate::list_changes_task::ListChangesTask;
use crate::local_to_remote_syncer::LocalToRemoteSyncer;
use crate::register_app_task::{AppRootSelection, RegisterAppTask};
use crate::remote_to_local_syncer::RemoteToLocalSyncer;
use crate::status::SyncStatusCode;
use crate::task_manager::{
    SyncContext, SyncTask, SyncTaskManager, SyncTaskManagerClient, TaskPriority,
};
use crate::uninstall_app_task::UninstallAppTask;

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Minimum time between two polling change listings
    pub list_changes_retry_delay: Duration,

    /// How many times app registration recreates a missing app-root folder
    pub max_register_retry: u32,

    /// Title of the remote folder holding every app-root
    pub sync_root_title: String,

    /// Survivor selection for entries clashing on (parent, title)
    pub conflict_policy: ConflictPolicy,

    /// Selection among several candidate app-root folders
    pub app_root_policy: AppRootSelection,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            list_changes_retry_delay: Duration::from_secs(5 * 60),
            max_register_retry: 5,
            sync_root_title: "Drive Sync Root".to_string(),
            conflict_policy: ConflictPolicy::default(),
            app_root_policy: AppRootSelection::default(),
        }
    }
}

#[derive(Debug)]
struct EngineState {
    service_state: RemoteServiceState,
    sync_enabled: bool,
    network_available: bool,
    should_check_conflict: bool,
    should_check_remote_change: bool,
    listing_remote_changes: bool,
    /// Unix millis before which polling listings are skipped
    time_to_check_changes: i64,
}

impl EngineState {
    fn current(&self) -> RemoteServiceState {
        if self.sync_enabled {
            self.service_state
        } else {
            RemoteServiceState::Disabled
        }
    }
}

/// Orchestrates every sync task against one remote account.
pub struct SyncEngine {
    config: SyncEngineConfig,
    task_manager: SyncTaskManager,
    remote_service: Arc<dyn RemoteFileService>,
    app_registry: Option<Arc<dyn AppRegistry>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    state: Mutex<EngineState>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    /// Builds an engine over the bridges in `core`. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(core: &CoreConfig, config: SyncEngineConfig) -> Arc<Self> {
        let context = SyncContext::new(
            core.key_value_store.clone(),
            core.remote_service.clone(),
            core.remote_change_processor.clone(),
            config.clone(),
        );

        Arc::new(Self {
            config,
            task_manager: SyncTaskManager::new(context),
            remote_service: core.remote_service.clone(),
            app_registry: core.app_registry.clone(),
            network_monitor: core.network_monitor.clone(),
            clock: core.clock.clone(),
            event_bus: EventBus::new(core.event_buffer_size),
            state: Mutex::new(EngineState {
                service_state: RemoteServiceState::TemporarilyUnavailable,
                sync_enabled: false,
                network_available: true,
                should_check_conflict: true,
                should_check_remote_change: true,
                listing_remote_changes: false,
                time_to_check_changes: 0,
            }),
            shutdown: CancellationToken::new(),
        })
    }

    /// Starts the task worker, the polling ticker and, when a network
    /// monitor is configured, the connectivity watch.
    pub fn start(self: &Arc<Self>) {
        let client: Weak<Self> = Arc::downgrade(self);
        self.task_manager.start(client);

        let delay = self
            .config
            .list_changes_retry_delay
            .max(Duration::from_millis(1));
        let engine = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + delay;
            let mut ticker = tokio::time::interval_at(start, delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(engine) = engine.upgrade() else { break };
                        engine.maybe_start_fetch_changes().await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        if let Some(monitor) = self.network_monitor.clone() {
            let engine = Arc::downgrade(self);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                watch_network(engine, monitor, shutdown).await;
            });
        }
        info!("Sync engine started");
    }

    /// Stops background work. Queued tasks report `ABORT`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.task_manager.shutdown().await;
        info!("Sync engine stopped");
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.event_bus.subscribe()
    }

    /// Resolves once no task is queued or running.
    pub async fn wait_for_idle(&self) {
        self.task_manager.wait_for_idle().await;
    }

    // ========================================================================
    // Host operations
    // ========================================================================

    /// Opens the index and bootstraps it against the remote account.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> SyncStatusCode {
        self.run_task(
            SyncTask::Initialize(SyncEngineInitializer::new()),
            TaskPriority::High,
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn register_origin(&self, app_id: &str) -> SyncStatusCode {
        self.run_task(
            SyncTask::RegisterApp(RegisterAppTask::new(app_id)),
            TaskPriority::High,
        )
        .await
    }

    pub async fn enable_origin(&self, app_id: &str) -> SyncStatusCode {
        self.run_task(SyncTask::EnableApp(app_id.to_string()), TaskPriority::High)
            .await
    }

    pub async fn disable_origin(&self, app_id: &str) -> SyncStatusCode {
        self.run_task(SyncTask::DisableApp(app_id.to_string()), TaskPriority::High)
            .await
    }

    /// Unregisters `app_id`; with `purge` its remote folder is deleted too.
    #[instrument(skip(self))]
    pub async fn uninstall_origin(&self, app_id: &str, purge: bool) -> SyncStatusCode {
        self.run_task(
            SyncTask::UninstallApp(UninstallAppTask::new(app_id, purge)),
            TaskPriority::High,
        )
        .await
    }

    /// Reconciles one dirty tracker into the local sandbox.
    ///
    /// Returns `NO_CHANGE_TO_SYNC` once nothing is left.
    pub async fn process_remote_change(&self) -> SyncStatusCode {
        self.run_task(
            SyncTask::RemoteToLocal(RemoteToLocalSyncer::new()),
            TaskPriority::Normal,
        )
        .await
    }

    /// Pushes one local change. On `RETRY` the caller submits the same
    /// change again.
    pub async fn apply_local_change(
        &self,
        url: SyncFileUrl,
        change: FileChange,
        content: Option<Bytes>,
    ) -> SyncStatusCode {
        self.run_task(
            SyncTask::LocalToRemote(LocalToRemoteSyncer::new(url, change, content)),
            TaskPriority::Normal,
        )
        .await
    }

    pub async fn resolve_conflicts(&self) -> SyncStatusCode {
        self.run_task(
            SyncTask::ResolveConflicts(ConflictResolver::new(self.config.conflict_policy)),
            TaskPriority::Low,
        )
        .await
    }

    /// Lists remote changes now, ignoring the polling cooldown.
    pub async fn fetch_remote_changes(&self) -> SyncStatusCode {
        {
            let mut state = self.state.lock().await;
            state.should_check_remote_change = false;
            state.listing_remote_changes = true;
            state.time_to_check_changes = self.next_check_time();
        }
        self.run_task(SyncTask::ListChanges(ListChangesTask::new()), TaskPriority::Low)
            .await
    }

    async fn run_task(&self, task: SyncTask, priority: TaskPriority) -> SyncStatusCode {
        self.task_manager
            .schedule_task(task, priority)
            .await
            .wait()
            .await
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Push notification from the remote service: something changed.
    pub async fn on_notification_received(&self) {
        debug!("Remote change notification received");
        let temporarily_unavailable = {
            let mut state = self.state.lock().await;
            state.should_check_remote_change = true;
            state.service_state == RemoteServiceState::TemporarilyUnavailable
        };
        if temporarily_unavailable {
            self.update_service_state(
                RemoteServiceState::Ok,
                "Got push notification for remote change",
            )
            .await;
        }
        self.maybe_start_fetch_changes().await;
    }

    /// The remote service accepted our credentials.
    pub async fn on_ready_to_send_requests(&self) {
        if self.state.lock().await.service_state == RemoteServiceState::Ok {
            return;
        }
        self.update_service_state(RemoteServiceState::Ok, "Authenticated")
            .await;

        if !self.has_metadata_database().await {
            self.task_manager
                .schedule_task(
                    SyncTask::Initialize(SyncEngineInitializer::new()),
                    TaskPriority::High,
                )
                .await;
            return;
        }
        self.state.lock().await.should_check_remote_change = true;
        self.maybe_start_fetch_changes().await;
    }

    pub async fn on_refresh_token_invalid(&self) {
        self.update_service_state(
            RemoteServiceState::AuthenticationRequired,
            "Found invalid refresh token",
        )
        .await;
    }

    pub async fn on_network_changed(&self, connected: bool) {
        {
            let mut state = self.state.lock().await;
            if state.network_available == connected {
                return;
            }
            state.network_available = connected;
            if connected {
                state.should_check_remote_change = true;
            }
        }

        if connected {
            info!("Network connected");
            self.update_service_state(RemoteServiceState::Ok, "Connected").await;
            self.maybe_start_fetch_changes().await;
        } else {
            self.update_service_state(RemoteServiceState::TemporarilyUnavailable, "Disconnected")
                .await;
        }
    }

    // ========================================================================
    // State & diagnostics
    // ========================================================================

    pub async fn set_sync_enabled(&self, enabled: bool) {
        let current = {
            let mut state = self.state.lock().await;
            if state.sync_enabled == enabled {
                return;
            }
            let old = state.current();
            state.sync_enabled = enabled;
            let current = state.current();
            (old != current).then_some(current)
        };

        if let Some(state) = current {
            let description = if enabled { "Sync enabled" } else { "Sync disabled" };
            self.notify_state_changed(state, description);
        }
        if enabled {
            self.maybe_start_fetch_changes().await;
        }
    }

    /// Service state as seen by the host
    pub async fn service_state(&self) -> RemoteServiceState {
        self.state.lock().await.current()
    }

    /// Every registered app and whether its root is enabled
    pub async fn origin_status_map(&self) -> BTreeMap<String, String> {
        let ctx = self.task_manager.context().lock().await;
        let Some(database) = ctx.metadata_database() else {
            return BTreeMap::new();
        };
        database
            .registered_app_ids()
            .into_iter()
            .map(|app_id| {
                let status = if database.is_app_enabled(&app_id) {
                    "Enabled"
                } else {
                    "Disabled"
                };
                (app_id, status.to_string())
            })
            .collect()
    }

    pub async fn dump_files(&self, app_id: &str) -> Value {
        let ctx = self.task_manager.context().lock().await;
        ctx.metadata_database()
            .map(|database| database.dump_files(app_id))
            .unwrap_or(Value::Null)
    }

    pub async fn dump_database(&self) -> Value {
        let ctx = self.task_manager.context().lock().await;
        ctx.metadata_database()
            .map(|database| database.dump_database())
            .unwrap_or(Value::Null)
    }

    /// Runs `inspect` against the in-memory index, if one is open.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn inspect_metadata_database<R>(
        &self,
        inspect: impl FnOnce(&crate::metadata_database::MetadataDatabase) -> R,
    ) -> Option<R> {
        let ctx = self.task_manager.context().lock().await;
        ctx.metadata_database().map(inspect)
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    async fn has_metadata_database(&self) -> bool {
        self.task_manager
            .context()
            .lock()
            .await
            .metadata_database()
            .is_some()
    }

    fn next_check_time(&self) -> i64 {
        let delay = i64::try_from(self.config.list_changes_retry_delay.as_millis())
            .unwrap_or(i64::MAX);
        self.clock.unix_timestamp_millis().saturating_add(delay)
    }

    /// Queues a change listing, or a conflict scan inside the cooldown,
    /// when nothing else is pending.
    async fn maybe_start_fetch_changes(&self) {
        if self.service_state().await == RemoteServiceState::Disabled {
            return;
        }
        if !self.task_manager.is_idle().await {
            return;
        }

        let has_dirty_tracker = {
            let ctx = self.task_manager.context().lock().await;
            match ctx.metadata_database() {
                Some(database) if database.has_sync_root() => database.has_dirty_tracker(),
                _ => return,
            }
        };

        let now = self.clock.unix_timestamp_millis();
        let mut state = self.state.lock().await;
        if !state.should_check_remote_change && now < state.time_to_check_changes {
            if !has_dirty_tracker && state.should_check_conflict {
                drop(state);
                self.task_manager
                    .schedule_task_if_idle(
                        SyncTask::ResolveConflicts(ConflictResolver::new(
                            self.config.conflict_policy,
                        )),
                        TaskPriority::Low,
                    )
                    .await;
            }
            return;
        }

        let scheduled = self
            .task_manager
            .schedule_task_if_idle(SyncTask::ListChanges(ListChangesTask::new()), TaskPriority::Low)
            .await;
        if scheduled.is_some() {
            state.should_check_remote_change = false;
            state.listing_remote_changes = true;
            state.time_to_check_changes = self.next_check_time();
        }
    }

    /// Brings registered app roots in line with the host's installed apps.
    async fn update_registered_apps(&self) {
        let Some(registry) = self.app_registry.clone() else {
            return;
        };
        let installed = match registry.installed_app_ids().await {
            Ok(installed) => installed,
            Err(e) => {
                warn!(error = %e, "Failed to read installed apps");
                return;
            }
        };

        let registered: Vec<(String, bool)> = {
            let ctx = self.task_manager.context().lock().await;
            let Some(database) = ctx.metadata_database() else {
                return;
            };
            database
                .registered_app_ids()
                .into_iter()
                .map(|app_id| {
                    let enabled = database.is_app_enabled(&app_id);
                    (app_id, enabled)
                })
                .collect()
        };

        for (app_id, root_enabled) in registered {
            if !installed.contains(&app_id) {
                info!(app_id = %app_id, "App uninstalled, purging its folder");
                self.task_manager
                    .schedule_task(
                        SyncTask::UninstallApp(UninstallAppTask::new(app_id, true)),
                        TaskPriority::High,
                    )
                    .await;
                continue;
            }

            let app_enabled = match registry.is_enabled(&app_id).await {
                Ok(enabled) => enabled,
                Err(e) => {
                    warn!(app_id = %app_id, error = %e, "Failed to read app status");
                    continue;
                }
            };
            if app_enabled && !root_enabled {
                self.task_manager
                    .schedule_task(SyncTask::EnableApp(app_id), TaskPriority::High)
                    .await;
            } else if !app_enabled && root_enabled {
                self.task_manager
                    .schedule_task(SyncTask::DisableApp(app_id), TaskPriority::High)
                    .await;
            }
        }
    }

    // ========================================================================
    // Task results
    // ========================================================================

    async fn did_initialize(&self, status: SyncStatusCode) {
        if !status.is_ok() {
            if self.remote_service.has_refresh_token() {
                self.update_service_state(
                    RemoteServiceState::TemporarilyUnavailable,
                    "Could not initialize remote service",
                )
                .await;
            } else {
                self.update_service_state(
                    RemoteServiceState::AuthenticationRequired,
                    "Authentication required",
                )
                .await;
            }
            return;
        }
        self.update_registered_apps().await;
    }

    async fn did_process_remote_change(
        &self,
        syncer: &RemoteToLocalSyncer,
        status: SyncStatusCode,
    ) {
        if syncer.sync_root_deletion() {
            warn!("Sync-root folder was deleted remotely, rebuilding the index");
            {
                let mut ctx = self.task_manager.context().lock().await;
                if let Err(e) = ctx.reset_metadata_database().await {
                    warn!(error = %e, "Failed to clear metadata database");
                }
            }
            self.task_manager
                .schedule_task(
                    SyncTask::Initialize(SyncEngineInitializer::new()),
                    TaskPriority::High,
                )
                .await;
            return;
        }

        if status == SyncStatusCode::NoChangeToSync {
            let mut ctx = self.task_manager.context().lock().await;
            if let Some(database) = ctx.metadata_database_mut() {
                database.promote_lower_priority_trackers_to_normal();
            }
            return;
        }
        if !status.is_ok() {
            return;
        }

        if let (Some(action), Some(url)) = (syncer.sync_action(), syncer.url()) {
            self.notify_file_synced(url, &url.path, action, SyncDirection::RemoteToLocal);
            if action == SyncAction::Deleted && url.path.is_empty() {
                info!(app_id = %url.app_id, "App-root folder deleted, registering again");
                self.task_manager
                    .schedule_task(
                        SyncTask::RegisterApp(RegisterAppTask::new(url.app_id.clone())),
                        TaskPriority::High,
                    )
                    .await;
            }
        }
        self.state.lock().await.should_check_conflict = true;
    }

    async fn did_apply_local_change(&self, syncer: &LocalToRemoteSyncer, status: SyncStatusCode) {
        let url = syncer.url();
        if matches!(status, SyncStatusCode::Ok | SyncStatusCode::Retry) {
            if let Some(action) = syncer.sync_action() {
                let path = syncer.target_path().unwrap_or(&url.path);
                self.notify_file_synced(url, path, action, SyncDirection::LocalToRemote);
            }
        }

        if status == SyncStatusCode::UnknownOrigin {
            let registered = {
                let ctx = self.task_manager.context().lock().await;
                ctx.metadata_database()
                    .map(|database| database.find_app_root_tracker(&url.app_id).is_some())
                    .unwrap_or(false)
            };
            if !registered {
                info!(app_id = %url.app_id, "Registering app on its first local change");
                self.task_manager
                    .schedule_task(
                        SyncTask::RegisterApp(RegisterAppTask::new(url.app_id.clone())),
                        TaskPriority::High,
                    )
                    .await;
            }
        }

        let mut state = self.state.lock().await;
        if syncer.needs_remote_change_listing() && !state.listing_remote_changes {
            self.task_manager
                .schedule_task(SyncTask::ListChanges(ListChangesTask::new()), TaskPriority::High)
                .await;
            state.should_check_remote_change = false;
            state.listing_remote_changes = true;
            state.time_to_check_changes = self.next_check_time();
        }
        if status.is_ok() {
            state.should_check_conflict = true;
        }
    }

    fn notify_file_synced(
        &self,
        url: &SyncFileUrl,
        path: &str,
        action: SyncAction,
        direction: SyncDirection,
    ) {
        debug!(app_id = %url.app_id, path, ?action, ?direction, "File synced");
        self.event_bus
            .emit(CoreEvent::File(FileEvent::Synced {
                app_id: url.app_id.clone(),
                path: path.to_string(),
                action,
                direction,
            }))
            .ok();
    }

    async fn update_service_state_from_status(&self, status: SyncStatusCode, used_network: bool) {
        match status {
            SyncStatusCode::Ok if used_network => {
                self.update_service_state(RemoteServiceState::Ok, "").await;
            }
            SyncStatusCode::AuthenticationFailed => {
                self.update_service_state(
                    RemoteServiceState::AuthenticationRequired,
                    "Authentication required",
                )
                .await;
            }
            SyncStatusCode::AccessForbidden => {
                self.update_service_state(
                    RemoteServiceState::AuthenticationRequired,
                    "Access forbidden",
                )
                .await;
            }
            SyncStatusCode::ServiceTemporarilyUnavailable
            | SyncStatusCode::NetworkError
            | SyncStatusCode::Abort
            | SyncStatusCode::Failed => {
                if self.remote_service.has_refresh_token() {
                    self.update_service_state(
                        RemoteServiceState::TemporarilyUnavailable,
                        "Network or temporary service error",
                    )
                    .await;
                } else {
                    self.update_service_state(
                        RemoteServiceState::AuthenticationRequired,
                        "Authentication required",
                    )
                    .await;
                }
            }
            SyncStatusCode::DatabaseErrorCorruption
            | SyncStatusCode::DatabaseErrorIoError
            | SyncStatusCode::DatabaseErrorFailed => {
                self.update_service_state(
                    RemoteServiceState::Disabled,
                    "Unrecoverable database error",
                )
                .await;
            }
            _ => {}
        }
    }

    async fn update_service_state(&self, new_state: RemoteServiceState, description: &str) {
        let changed = {
            let mut state = self.state.lock().await;
            if state.service_state == new_state {
                return;
            }
            let old = state.current();
            state.service_state = new_state;
            let current = state.current();
            (old != current).then_some((old, current))
        };

        if let Some((old, current)) = changed {
            info!(from = %old, to = %current, description, "Remote service state changed");
            self.notify_state_changed(current, description);
        }
    }

    fn notify_state_changed(&self, state: RemoteServiceState, description: &str) {
        self.event_bus
            .emit(CoreEvent::Service(ServiceEvent::StateChanged {
                state,
                description: description.to_string(),
            }))
            .ok();
    }

    async fn notify_queue_size(&self) {
        let pending = {
            let ctx = self.task_manager.context().lock().await;
            ctx.metadata_database()
                .map(|database| database.dirty_tracker_count())
                .unwrap_or(0)
        };
        self.event_bus
            .emit(CoreEvent::Service(ServiceEvent::RemoteChangeQueueUpdated {
                pending,
            }))
            .ok();
    }
}

#[async_trait]
impl SyncTaskManagerClient for SyncEngine {
    async fn did_finish_task(&self, task: &SyncTask, status: SyncStatusCode) {
        match task {
            SyncTask::Initialize(_) => self.did_initialize(status).await,
            SyncTask::RemoteToLocal(syncer) => self.did_process_remote_change(syncer, status).await,
            SyncTask::LocalToRemote(syncer) => self.did_apply_local_change(syncer, status).await,
            SyncTask::ResolveConflicts(_) => {
                if status == SyncStatusCode::NoConflict {
                    self.state.lock().await.should_check_conflict = false;
                }
            }
            SyncTask::ListChanges(_) => {
                let mut state = self.state.lock().await;
                state.listing_remote_changes = false;
                if status.is_ok() {
                    state.should_check_conflict = true;
                }
            }
            SyncTask::RegisterApp(_)
            | SyncTask::EnableApp(_)
            | SyncTask::DisableApp(_)
            | SyncTask::UninstallApp(_) => {}
        }

        self.update_service_state_from_status(status, task.used_network())
            .await;
        self.notify_queue_size().await;
    }

    async fn maybe_schedule_next_task(&self) {
        self.maybe_start_fetch_changes().await;
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("event_bus", &self.event_bus)
            .finish_non_exhaustive()
    }
}

async fn watch_network(
    engine: Weak<SyncEngine>,
    monitor: Arc<dyn NetworkMonitor>,
    shutdown: CancellationToken,
) {
    let mut changes = match monitor.subscribe_changes().await {
        Ok(changes) => changes,
        Err(e) => {
            warn!(error = %e, "Network change notifications unavailable");
            return;
        }
    };

    loop {
        tokio::select! {
            change = changes.next() => {
                let Some(info) = change else { break };
                let Some(engine) = engine.upgrade() else { break };
                engine.on_network_changed(info.is_connected()).await;
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("Network watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRemoteService, FlakyKeyValueStore, ManualClock};
    use bridge_desktop::MemoryKeyValueStore;
    use bridge_traits::{KeyValueStore, RemoteErrorCode};

    struct Harness {
        remote: Arc<FakeRemoteService>,
        clock: Arc<ManualClock>,
        engine: Arc<SyncEngine>,
    }

    fn harness_with_store(store: Arc<dyn KeyValueStore>) -> Harness {
        let remote = Arc::new(FakeRemoteService::new());
        let clock = Arc::new(ManualClock::new());
        let core = CoreConfig::builder()
            .database_path("index.db")
            .remote_service(remote.clone())
            .key_value_store(store)
            .clock(clock.clone())
            .build()
            .unwrap();
        let engine = SyncEngine::new(&core, SyncEngineConfig::default());
        engine.start();
        Harness {
            remote,
            clock,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with_store(Arc::new(MemoryKeyValueStore::new()))
    }

    #[tokio::test]
    async fn test_engine_reports_disabled_until_sync_is_enabled() {
        let h = harness();
        let mut events = h.engine.subscribe();
        assert_eq!(h.engine.service_state().await, RemoteServiceState::Disabled);

        h.engine.set_sync_enabled(true).await;
        assert_eq!(
            h.engine.service_state().await,
            RemoteServiceState::TemporarilyUnavailable
        );
        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Service(ServiceEvent::StateChanged {
                state: RemoteServiceState::TemporarilyUnavailable,
                description: "Sync enabled".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_initialize_bootstraps_and_lists_changes() {
        let h = harness();
        h.engine.set_sync_enabled(true).await;

        assert_eq!(h.engine.initialize().await, SyncStatusCode::Ok);
        h.engine.wait_for_idle().await;

        assert_eq!(h.engine.service_state().await, RemoteServiceState::Ok);
        let dump = h.engine.dump_database().await;
        assert!(!dump[0]["entries"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_requires_authentication() {
        let h = harness();
        h.engine.set_sync_enabled(true).await;
        h.remote.fail_next(RemoteErrorCode::Unauthorized);

        assert_eq!(
            h.engine.initialize().await,
            SyncStatusCode::AuthenticationFailed
        );
        h.engine.wait_for_idle().await;
        assert_eq!(
            h.engine.service_state().await,
            RemoteServiceState::AuthenticationRequired
        );
        assert!(h.engine.dump_database().await.is_null());
    }

    #[tokio::test]
    async fn test_network_error_without_refresh_token_requires_authentication() {
        let h = harness();
        h.engine.set_sync_enabled(true).await;
        h.remote.set_refresh_token(false);
        h.remote.fail_next(RemoteErrorCode::NoConnection);

        assert_eq!(h.engine.initialize().await, SyncStatusCode::NetworkError);
        h.engine.wait_for_idle().await;
        assert_eq!(
            h.engine.service_state().await,
            RemoteServiceState::AuthenticationRequired
        );
    }

    #[tokio::test]
    async fn test_ready_to_send_requests_initializes_lazily() {
        let h = harness();
        h.engine.set_sync_enabled(true).await;

        h.engine.on_ready_to_send_requests().await;
        h.engine.wait_for_idle().await;

        assert_eq!(h.engine.service_state().await, RemoteServiceState::Ok);
        assert!(h.engine.dump_database().await.is_array());
    }

    #[tokio::test]
    async fn test_refresh_token_invalid_requires_authentication() {
        let h = harness();
        h.engine.set_sync_enabled(true).await;
        h.engine.on_refresh_token_invalid().await;
        assert_eq!(
            h.engine.service_state().await,
            RemoteServiceState::AuthenticationRequired
        );
    }

    #[tokio::test]
    async fn test_disconnect_makes_service_unavailable() {
        let h = harness();
        h.engine.set_sync_enabled(true).await;
        h.engine.initialize().await;
        h.engine.wait_for_idle().await;

        h.engine.on_network_changed(false).await;
        assert_eq!(
            h.engine.service_state().await,
            RemoteServiceState::TemporarilyUnavailable
        );

        h.engine.on_network_changed(true).await;
        assert_eq!(h.engine.service_state().await, RemoteServiceState::Ok);
        h.engine.wait_for_idle().await;
        assert_eq!(h.engine.service_state().await, RemoteServiceState::Ok);
    }

    #[tokio::test]
    async fn test_push_notification_recovers_unavailable_service() {
        let h = harness();
        h.engine.set_sync_enabled(true).await;
        h.engine.initialize().await;
        h.engine.wait_for_idle().await;

        h.remote.fail_next(RemoteErrorCode::ServiceUnavailable);
        assert_eq!(
            h.engine.fetch_remote_changes().await,
            SyncStatusCode::ServiceTemporarilyUnavailable
        );
        h.engine.wait_for_idle().await;
        assert_eq!(
            h.engine.service_state().await,
            RemoteServiceState::TemporarilyUnavailable
        );

        h.engine.on_notification_received().await;
        assert_eq!(h.engine.service_state().await, RemoteServiceState::Ok);
    }

    #[tokio::test]
    async fn test_database_write_failure_disables_engine() {
        let store = Arc::new(FlakyKeyValueStore::new());
        let h = harness_with_store(store.clone());
        h.engine.set_sync_enabled(true).await;
        h.engine.initialize().await;
        h.engine.wait_for_idle().await;

        store.fail_writes(true);
        assert_eq!(
            h.engine.register_origin("example.com").await,
            SyncStatusCode::DatabaseErrorIoError
        );
        assert_eq!(h.engine.service_state().await, RemoteServiceState::Disabled);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_polling_until_notification() {
        let h = harness();
        h.engine.set_sync_enabled(true).await;
        h.engine.initialize().await;
        h.engine.wait_for_idle().await;

        let sync_root = h.remote.children_titled(&h.remote.root_folder_id(), "Drive Sync Root")[0]
            .file_id
            .clone();
        h.remote.add_folder(&sync_root, "example.com");

        // Inside the cooldown nothing is listed.
        h.engine.set_sync_enabled(false).await;
        h.engine.set_sync_enabled(true).await;
        h.engine.wait_for_idle().await;
        let before = h.engine.dump_database().await[1]["entries"].as_array().unwrap().len();

        h.engine.on_notification_received().await;
        h.engine.wait_for_idle().await;
        let after = h.engine.dump_database().await[1]["entries"].as_array().unwrap().len();
        assert_eq!(after, before + 1);

        // The next poll happens on its own once the cooldown elapsed.
        h.remote.add_folder(&sync_root, "other.app");
        h.clock.advance(chrono::Duration::minutes(6));
        h.engine.set_sync_enabled(false).await;
        h.engine.set_sync_enabled(true).await;
        h.engine.wait_for_idle().await;
        let polled = h.engine.dump_database().await[1]["entries"].as_array().unwrap().len();
        assert_eq!(polled, after + 1);
    }
}
