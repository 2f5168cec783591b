//! # Event Bus System
//!
//! Broadcasts sync engine notifications to any number of observers using
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **Event Types**: [`CoreEvent`] wraps service-level and file-level events
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Receiver wrapper with optional filtering
//!
//! The sync engine is the only producer. It emits:
//! - [`ServiceEvent::StateChanged`] whenever the remote service state flips
//! - [`ServiceEvent::RemoteChangeQueueUpdated`] after every finished task
//! - [`FileEvent::Synced`] for every file added, updated or deleted on either side
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, RemoteServiceState, ServiceEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Service(ServiceEvent::StateChanged {
//!         state: RemoteServiceState::Ok,
//!         description: "Authenticated".to_string(),
//!     }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert!(matches!(event, CoreEvent::Service(_)));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber fell behind and missed `n`
//!   events; it keeps receiving newer ones.
//! - **`RecvError::Closed`**: the engine and every other sender are gone.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Availability of the remote file service as seen by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteServiceState {
    Ok,
    /// Network or server trouble; the engine retries on its own
    TemporarilyUnavailable,
    /// Credentials were rejected and need user action
    AuthenticationRequired,
    /// Local index unusable or sync switched off
    Disabled,
}

impl RemoteServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::TemporarilyUnavailable => "TEMPORARILY_UNAVAILABLE",
            Self::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            Self::Disabled => "DISABLED",
        }
    }
}

impl fmt::Display for RemoteServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a file during a sync step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncAction {
    Added,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    LocalToRemote,
    RemoteToLocal,
}

/// Top-level event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Service(ServiceEvent),
    File(FileEvent),
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Service(ServiceEvent::StateChanged { .. }) => "Remote service state changed",
            CoreEvent::Service(ServiceEvent::RemoteChangeQueueUpdated { .. }) => {
                "Pending remote changes updated"
            }
            CoreEvent::File(FileEvent::Synced { .. }) => "File synced",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Service(ServiceEvent::StateChanged { state, .. }) => match state {
                RemoteServiceState::Ok => EventSeverity::Info,
                RemoteServiceState::TemporarilyUnavailable => EventSeverity::Warning,
                RemoteServiceState::AuthenticationRequired | RemoteServiceState::Disabled => {
                    EventSeverity::Error
                }
            },
            CoreEvent::File(_) => EventSeverity::Info,
            CoreEvent::Service(ServiceEvent::RemoteChangeQueueUpdated { .. }) => {
                EventSeverity::Debug
            }
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Engine-wide notifications
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ServiceEvent {
    StateChanged {
        state: RemoteServiceState,
        /// Why the state changed, for display
        description: String,
    },
    RemoteChangeQueueUpdated {
        /// Dirty trackers still waiting for remote-to-local sync
        pending: usize,
    },
}

/// Per-file notifications
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum FileEvent {
    Synced {
        app_id: String,
        /// Path relative to the app root
        path: String,
        action: SyncAction,
        direction: SyncDirection,
    },
}

/// Central event bus for publishing and subscribing to events.
///
/// Cloning shares the underlying channel. Subscribers only see events emitted
/// after they subscribed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Fails only when nobody is subscribed; producers usually ignore that.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` that skips events failing a filter.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let file_events = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::File(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Next event passing the filter
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Next buffered event passing the filter, `None` when nothing is buffered
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}
