//! # Event Bus System
//!
//! Observer channel for the cache engine, built on `tokio::sync::broadcast`.
//! Queries, mutations and the cache store publish typed events here so that
//! hosts can show notifications, collect telemetry or chain invalidations
//! without the engine knowing anything about UI.
//!
//! ```text
//! ┌─────────────┐     emit      ┌───────────┐
//! │   Query     ├──────────────>│           │     subscribe    ┌────────────┐
//! └─────────────┘               │ EventBus  ├─────────────────>│ Subscriber │
//! ┌─────────────┐     emit      │ (broadcast│                  └────────────┘
//! │  Mutation   ├──────────────>│  channel) │     subscribe    ┌────────────┐
//! └─────────────┘               │           ├─────────────────>│ Subscriber │
//! ┌─────────────┐     emit      │           │                  └────────────┘
//! │ CacheStore  ├──────────────>│           │
//! └─────────────┘               └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CacheEvent, CoreEvent, EventBus, EventStream};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut stream = EventStream::new(bus.subscribe())
//!     .filter(|event| matches!(event, CoreEvent::Cache(_)));
//!
//! bus.emit(CoreEvent::Cache(CacheEvent::Trimmed { removed: 3, critical: true })).ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Inactive entries trimmed");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber was too slow and missed `n`
//!   events. Non-fatal.
//! - **`RecvError::Closed`**: every sender was dropped. Treat as shutdown.
//!
//! Emitting with no subscribers returns `Err`; publishers in this workspace
//! ignore that case.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published through the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Query(QueryEvent),
    Mutation(MutationEvent),
    Cache(CacheEvent),
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Query(e) => e.description(),
            CoreEvent::Mutation(e) => e.description(),
            CoreEvent::Cache(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Query(QueryEvent::Failed { meta, .. })
            | CoreEvent::Mutation(MutationEvent::Failed { meta, .. })
                if meta.critical =>
            {
                EventSeverity::Error
            }
            CoreEvent::Query(QueryEvent::Failed { .. })
            | CoreEvent::Mutation(MutationEvent::Failed { .. }) => EventSeverity::Warning,
            CoreEvent::Mutation(MutationEvent::Exhausted { .. }) => EventSeverity::Error,
            CoreEvent::Cache(CacheEvent::PersistenceFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Cache(CacheEvent::KeyRotated { dropped, .. }) if !dropped.is_empty() => {
                EventSeverity::Warning
            }
            CoreEvent::Mutation(MutationEvent::Succeeded { .. })
            | CoreEvent::Mutation(MutationEvent::Queued { .. })
            | CoreEvent::Cache(CacheEvent::Trimmed { .. })
            | CoreEvent::Cache(CacheEvent::KeyRotated { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Caller-supplied metadata attached to query and mutation outcomes
///
/// Observers use it to pick a notification message, decide how loudly to
/// report a failure, or chain further invalidations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventMeta {
    /// Host-defined message identifier (e.g. a translation key)
    pub message_id: Option<String>,
    /// Query keys to invalidate after a success
    pub invalidate_keys: Vec<String>,
    /// Query keys to refetch after a success
    pub refetch_keys: Vec<String>,
    /// Failures with this flag are reported at error severity
    pub critical: bool,
}

impl EventMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn invalidates(mut self, key: impl Into<String>) -> Self {
        self.invalidate_keys.push(key.into());
        self
    }

    pub fn refetches(mut self, key: impl Into<String>) -> Self {
        self.refetch_keys.push(key.into());
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.message_id.is_none()
            && self.invalidate_keys.is_empty()
            && self.refetch_keys.is_empty()
            && !self.critical
    }
}

// ============================================================================
// Query Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum QueryEvent {
    /// A fetch started (foreground or background)
    Fetching { key: String, background: bool },
    /// Loading → Success
    Succeeded { key: String, meta: EventMeta },
    /// Loading → Error. Previously cached data is still served.
    Failed {
        key: String,
        message: String,
        meta: EventMeta,
    },
    Invalidated { keys: Vec<String> },
    /// Disposal delay elapsed with no listeners
    Disposed { key: String },
}

impl QueryEvent {
    fn description(&self) -> &str {
        match self {
            QueryEvent::Fetching { .. } => "Query fetching",
            QueryEvent::Succeeded { .. } => "Query succeeded",
            QueryEvent::Failed { .. } => "Query failed",
            QueryEvent::Invalidated { .. } => "Queries invalidated",
            QueryEvent::Disposed { .. } => "Query disposed",
        }
    }
}

// ============================================================================
// Mutation Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum MutationEvent {
    Succeeded {
        mutation_key: String,
        meta: EventMeta,
    },
    Failed {
        mutation_key: String,
        message: String,
        meta: EventMeta,
    },
    /// Connectivity failure; handed to the offline queue
    Queued {
        mutation_key: String,
        item_id: String,
    },
    /// Offline item replayed successfully
    Replayed {
        mutation_key: String,
        item_id: String,
    },
    /// Offline replay failed and the item stays queued
    RetryScheduled {
        mutation_key: String,
        item_id: String,
        attempt: u32,
        max_retries: u32,
    },
    /// Offline item exceeded its retry budget and was dropped
    Exhausted {
        mutation_key: String,
        item_id: String,
        attempts: u32,
        message: String,
    },
}

impl MutationEvent {
    fn description(&self) -> &str {
        match self {
            MutationEvent::Succeeded { .. } => "Mutation succeeded",
            MutationEvent::Failed { .. } => "Mutation failed",
            MutationEvent::Queued { .. } => "Mutation queued for offline replay",
            MutationEvent::Replayed { .. } => "Queued mutation replayed",
            MutationEvent::RetryScheduled { .. } => "Queued mutation will be retried",
            MutationEvent::Exhausted { .. } => "Queued mutation dropped after retries",
        }
    }
}

// ============================================================================
// Cache Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum CacheEvent {
    /// Budget enforcement removed an entry
    Evicted { key: String, policy: String },
    Trimmed { removed: usize, critical: bool },
    GarbageCollected { removed: usize },
    /// Persistence write/delete failed; memory copy remains authoritative
    PersistenceFailed { key: String, message: String },
    /// Encryption key rotated; `dropped` lists entries that could not be re-encrypted
    KeyRotated { rotated: usize, dropped: Vec<String> },
}

impl CacheEvent {
    fn description(&self) -> &str {
        match self {
            CacheEvent::Evicted { .. } => "Cache entry evicted",
            CacheEvent::Trimmed { .. } => "Inactive entries trimmed",
            CacheEvent::GarbageCollected { .. } => "Expired entries collected",
            CacheEvent::PersistenceFailed { .. } => "Cache persistence failed",
            CacheEvent::KeyRotated { .. } => "Encryption key rotated",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel.
///
/// Cloning is cheap; clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers that received the event.
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

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// Receiver with an optional predicate; non-matching events are skipped.
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

    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking receive. `None` when nothing matching is buffered.
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
