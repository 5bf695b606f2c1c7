//! # Offline Mutation Queue
//!
//! Mutations that fail for lack of connectivity are parked here and replayed
//! once the network comes back.
//!
//! ## Ordering
//!
//! Higher `priority` drains first; equal priorities drain in enqueue order.
//!
//! ## Retries
//!
//! Every failed replay increments `attempt`. An item whose attempts reach
//! `max_retries` is dropped and reported through
//! [`MutationEvent::Exhausted`]; anything else stays queued for the next
//! drain.
//!
//! ## Durability
//!
//! When a `KeyValueStore` is configured the whole queue is written as one
//! JSON snapshot after every change and reloaded by [`OfflineQueue::restore`].
//! Replay handlers are registered per mutation key, so restored items replay
//! as soon as a mutation with the same key exists.

use async_trait::async_trait;
use bridge_traits::{Clock, KeyValueStore, NetworkMonitor};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core_cache::FetchError;
use core_runtime::events::{CoreEvent, EventBus, MutationEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{QueryError, Result};

/// Storage key of the queue snapshot.
pub const OFFLINE_QUEUE_KEY: &str = "offline_queue/snapshot";

/// A mutation waiting for connectivity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: String,
    pub mutation_key: String,
    /// Serialized mutation variables
    pub variables: Value,
    /// Failed replays so far
    pub attempt: u32,
    pub max_retries: u32,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Enqueue order, used to keep equal priorities FIFO
    pub sequence: u64,
}

impl QueuedMutation {
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_retries
    }
}

/// Replays queued items for one mutation key.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    async fn replay(&self, item: &QueuedMutation) -> std::result::Result<(), FetchError>;

    /// Called once when `item` is dropped for good.
    fn exhausted(&self, item: &QueuedMutation, error: &QueryError);
}

/// Outcome of one [`OfflineQueue::drain`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub retried: usize,
    pub exhausted: usize,
    /// Items with no registered handler
    pub skipped: usize,
}

struct QueueInner {
    items: Mutex<Vec<QueuedMutation>>,
    handlers: Mutex<HashMap<String, Weak<dyn ReplayHandler>>>,
    storage: Option<Arc<dyn KeyValueStore>>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    next_sequence: AtomicU64,
    /// One drain at a time
    draining: tokio::sync::Mutex<()>,
    /// Held from taking a snapshot until it is written
    persisting: tokio::sync::Mutex<()>,
}

/// Durable priority queue of pending mutations.
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<QueueInner>,
}

fn drain_order(a: &QueuedMutation, b: &QueuedMutation) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.sequence.cmp(&b.sequence))
}

impl OfflineQueue {
    pub fn new(
        storage: Option<Arc<dyn KeyValueStore>>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                items: Mutex::new(Vec::new()),
                handlers: Mutex::new(HashMap::new()),
                storage,
                events,
                clock,
                next_sequence: AtomicU64::new(0),
                draining: tokio::sync::Mutex::new(()),
                persisting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn emit(&self, event: MutationEvent) {
        let _ = self.inner.events.emit(CoreEvent::Mutation(event));
    }

    /// Route replays of `mutation_key` to `handler`. Replaces any previous
    /// handler for the key.
    pub fn register_handler(&self, mutation_key: &str, handler: Weak<dyn ReplayHandler>) {
        self.inner
            .handlers
            .lock()
            .insert(mutation_key.to_string(), handler);
    }

    fn handler(&self, mutation_key: &str) -> Option<Arc<dyn ReplayHandler>> {
        let mut handlers = self.inner.handlers.lock();
        let handler = handlers.get(mutation_key)?.upgrade();
        if handler.is_none() {
            handlers.remove(mutation_key);
        }
        handler
    }

    /// Park a mutation and return its item id.
    #[instrument(skip(self, variables))]
    pub async fn enqueue(
        &self,
        mutation_key: &str,
        variables: Value,
        max_retries: u32,
        priority: i32,
    ) -> String {
        let item = QueuedMutation {
            id: Uuid::new_v4().to_string(),
            mutation_key: mutation_key.to_string(),
            variables,
            attempt: 0,
            max_retries,
            priority,
            enqueued_at: self.inner.clock.now(),
            sequence: self.inner.next_sequence.fetch_add(1, Ordering::SeqCst),
        };
        let id = item.id.clone();

        self.inner.items.lock().push(item);
        info!(item_id = %id, "Mutation queued for offline replay");
        self.emit(MutationEvent::Queued {
            mutation_key: mutation_key.to_string(),
            item_id: id.clone(),
        });
        self.persist().await;
        id
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }

    /// Pending items in drain order. Does not modify the queue.
    pub fn pending(&self) -> Vec<QueuedMutation> {
        let mut items = self.inner.items.lock().clone();
        items.sort_by(drain_order);
        items
    }

    pub fn pending_for(&self, mutation_key: &str) -> usize {
        self.inner
            .items
            .lock()
            .iter()
            .filter(|item| item.mutation_key == mutation_key)
            .count()
    }

    pub fn get(&self, item_id: &str) -> Option<QueuedMutation> {
        self.inner
            .items
            .lock()
            .iter()
            .find(|item| item.id == item_id)
            .cloned()
    }

    /// Drop an item without replaying it.
    pub async fn remove(&self, item_id: &str) -> Option<QueuedMutation> {
        let removed = {
            let mut items = self.inner.items.lock();
            let index = items.iter().position(|item| item.id == item_id)?;
            items.remove(index)
        };
        self.persist().await;
        Some(removed)
    }

    /// Replay every item that has a handler, in drain order.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> DrainReport {
        let _guard = self.inner.draining.lock().await;
        let mut report = DrainReport::default();

        for item in self.pending() {
            let Some(handler) = self.handler(&item.mutation_key) else {
                debug!(item_id = %item.id, mutation_key = %item.mutation_key, "No replay handler");
                report.skipped += 1;
                continue;
            };

            match handler.replay(&item).await {
                Ok(()) => {
                    self.take(&item.id);
                    report.replayed += 1;
                    info!(item_id = %item.id, "Queued mutation replayed");
                    self.emit(MutationEvent::Replayed {
                        mutation_key: item.mutation_key.clone(),
                        item_id: item.id.clone(),
                    });
                }
                Err(e) => {
                    let Some(updated) = self.record_failure(&item.id) else {
                        continue;
                    };

                    if updated.is_exhausted() {
                        self.take(&item.id);
                        report.exhausted += 1;
                        error!(
                            item_id = %item.id,
                            attempts = updated.attempt,
                            error = %e,
                            "Queued mutation exhausted its retries"
                        );
                        let terminal = QueryError::QueueExhausted {
                            item_id: updated.id.clone(),
                            attempts: updated.attempt,
                            message: e.to_string(),
                        };
                        handler.exhausted(&updated, &terminal);
                        self.emit(MutationEvent::Exhausted {
                            mutation_key: updated.mutation_key.clone(),
                            item_id: updated.id.clone(),
                            attempts: updated.attempt,
                            message: e.to_string(),
                        });
                    } else {
                        report.retried += 1;
                        warn!(
                            item_id = %item.id,
                            attempt = updated.attempt,
                            max_retries = updated.max_retries,
                            error = %e,
                            "Queued mutation replay failed"
                        );
                        self.emit(MutationEvent::RetryScheduled {
                            mutation_key: updated.mutation_key.clone(),
                            item_id: updated.id.clone(),
                            attempt: updated.attempt,
                            max_retries: updated.max_retries,
                        });
                    }
                }
            }
        }

        if report != DrainReport::default() {
            self.persist().await;
        }
        debug!(?report, "Offline queue drained");
        report
    }

    fn take(&self, item_id: &str) {
        self.inner.items.lock().retain(|item| item.id != item_id);
    }

    fn record_failure(&self, item_id: &str) -> Option<QueuedMutation> {
        let mut items = self.inner.items.lock();
        let item = items.iter_mut().find(|item| item.id == item_id)?;
        item.attempt = item.attempt.saturating_add(1);
        Some(item.clone())
    }

    /// Write the current queue. Snapshots are taken and written one at a
    /// time, so a later snapshot always lands after an earlier one.
    async fn persist(&self) {
        let Some(storage) = &self.inner.storage else {
            return;
        };

        let _writing = self.inner.persisting.lock().await;
        let snapshot = self.pending();
        let result = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => storage
                .write(OFFLINE_QUEUE_KEY, Bytes::from(bytes))
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(message) = result {
            warn!(error = %message, "Failed to persist offline queue");
        }
    }

    /// Merge the stored snapshot into the queue. Returns the number of items
    /// loaded.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize> {
        let Some(storage) = &self.inner.storage else {
            return Ok(0);
        };
        let Some(bytes) = storage
            .read(OFFLINE_QUEUE_KEY)
            .await
            .map_err(|e| QueryError::Cache(e.into()))?
        else {
            return Ok(0);
        };

        let stored: Vec<QueuedMutation> = match serde_json::from_slice(&bytes) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable offline queue snapshot");
                return Ok(0);
            }
        };

        let mut loaded = 0;
        {
            let mut items = self.inner.items.lock();
            for item in stored {
                if items.iter().any(|existing| existing.id == item.id) {
                    continue;
                }
                self.inner
                    .next_sequence
                    .fetch_max(item.sequence.saturating_add(1), Ordering::SeqCst);
                items.push(item);
                loaded += 1;
            }
        }

        info!(loaded, "Offline queue restored");
        Ok(loaded)
    }

    /// Drain on every transition to connected until `cancel` fires.
    pub fn watch_network(
        &self,
        monitor: Arc<dyn NetworkMonitor>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut changes = match monitor.subscribe_changes().await {
                Ok(changes) => changes,
                Err(e) => {
                    warn!(error = %e, "Network monitor unavailable; offline queue drains manually");
                    return;
                }
            };

            let mut online = monitor.is_connected().await;
            if online && !queue.is_empty() {
                queue.drain().await;
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.next() => match change {
                        Some(info) => {
                            let now_online = info.is_connected();
                            if now_online && !online {
                                info!(pending = queue.len(), "Back online; replaying queued mutations");
                                queue.drain().await;
                            }
                            online = now_online;
                        }
                        None => break,
                    },
                }
            }
            debug!("Network watcher stopped");
        })
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("len", &self.len())
            .field("durable", &self.inner.storage.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_desktop::InMemoryKeyValueStore;
    use bridge_traits::SystemClock;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        seen: Mutex<Vec<Value>>,
        failures_left: AtomicUsize,
        exhausted: AtomicUsize,
    }

    impl Recorder {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                failures_left: AtomicUsize::new(failures),
                exhausted: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ReplayHandler for Recorder {
        async fn replay(&self, item: &QueuedMutation) -> std::result::Result<(), FetchError> {
            self.seen.lock().push(item.variables.clone());
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(FetchError::network("still offline"));
            }
            Ok(())
        }

        fn exhausted(&self, _item: &QueuedMutation, _error: &QueryError) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn queue(storage: Option<Arc<dyn KeyValueStore>>) -> OfflineQueue {
        OfflineQueue::new(storage, EventBus::default(), Arc::new(SystemClock))
    }

    fn handler(recorder: &Arc<Recorder>) -> Weak<dyn ReplayHandler> {
        let handler: Arc<dyn ReplayHandler> = recorder.clone();
        Arc::downgrade(&handler)
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = queue(None);
        queue.enqueue("save", json!("low-1"), 3, 0).await;
        queue.enqueue("save", json!("high"), 3, 5).await;
        queue.enqueue("save", json!("low-2"), 3, 0).await;

        let order: Vec<Value> = queue.pending().into_iter().map(|i| i.variables).collect();
        assert_eq!(order, vec![json!("high"), json!("low-1"), json!("low-2")]);

        let recorder = Recorder::new(0);
        queue.register_handler("save", handler(&recorder));
        let report = queue.drain().await;

        assert_eq!(report.replayed, 3);
        assert_eq!(*recorder.seen.lock(), order);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_items_without_handler_stay_queued() {
        let queue = queue(None);
        queue.enqueue("orphan", json!(1), 3, 0).await;

        let report = queue.drain().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending()[0].attempt, 0);
    }

    #[tokio::test]
    async fn test_exhausted_items_are_dropped() {
        let queue = queue(None);
        let events = queue.inner.events.clone();
        let mut rx = events.subscribe();
        let recorder = Recorder::new(usize::MAX);
        queue.register_handler("save", handler(&recorder));
        let id = queue.enqueue("save", json!(1), 2, 0).await;

        assert_eq!(queue.drain().await.retried, 1);
        assert_eq!(queue.get(&id).unwrap().attempt, 1);
        assert_eq!(queue.drain().await.exhausted, 1);
        assert!(queue.is_empty());
        assert_eq!(recorder.exhausted.load(Ordering::SeqCst), 1);

        let mut saw_exhausted = false;
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::Mutation(MutationEvent::Exhausted { attempts, .. }) = event {
                assert_eq!(attempts, 2);
                saw_exhausted = true;
            }
        }
        assert!(saw_exhausted);
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());

        let first = queue(Some(storage.clone()));
        first.enqueue("save", json!({"title": "draft"}), 3, 1).await;
        first.enqueue("save", json!({"title": "second"}), 3, 0).await;

        let second = queue(Some(storage));
        assert_eq!(second.restore().await.unwrap(), 2);
        assert_eq!(second.pending(), first.pending());

        // New items continue the stored sequence
        second.enqueue("save", json!("third"), 3, 0).await;
        assert_eq!(second.pending().last().unwrap().variables, json!("third"));
    }

    /// Storage whose first write waits until `release` fires.
    struct GatedStorage {
        inner: InMemoryKeyValueStore,
        gate: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
        write_started: tokio::sync::Notify,
    }

    #[async_trait]
    impl KeyValueStore for GatedStorage {
        async fn read(&self, key: &str) -> bridge_traits::error::Result<Option<Bytes>> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, value: Bytes) -> bridge_traits::error::Result<()> {
            let gate = self.gate.lock().take();
            if let Some(gate) = gate {
                self.write_started.notify_one();
                let _ = gate.await;
            }
            self.inner.write(key, value).await
        }

        async fn delete(&self, key: &str) -> bridge_traits::error::Result<()> {
            self.inner.delete(key).await
        }

        async fn list_keys(&self, prefix: &str) -> bridge_traits::error::Result<Vec<String>> {
            self.inner.list_keys(prefix).await
        }
    }

    #[tokio::test]
    async fn test_snapshots_are_written_in_order() {
        let (release, gate) = tokio::sync::oneshot::channel();
        let storage = Arc::new(GatedStorage {
            inner: InMemoryKeyValueStore::new(),
            gate: Mutex::new(Some(gate)),
            write_started: tokio::sync::Notify::new(),
        });
        let queue = queue(Some(storage.clone() as Arc<dyn KeyValueStore>));

        // The enqueue snapshot stalls in storage while the item is removed
        let enqueue = tokio::spawn({
            let queue = queue.clone();
            async move { queue.enqueue("save", json!(1), 3, 0).await }
        });
        storage.write_started.notified().await;
        let id = queue.pending()[0].id.clone();
        let remove = tokio::spawn({
            let queue = queue.clone();
            async move { queue.remove(&id).await }
        });
        tokio::task::yield_now().await;

        release.send(()).unwrap();
        enqueue.await.unwrap();
        assert!(remove.await.unwrap().is_some());

        let bytes = storage.read(OFFLINE_QUEUE_KEY).await.unwrap().unwrap();
        let stored: Vec<QueuedMutation> = serde_json::from_slice(&bytes).unwrap();
        assert!(stored.is_empty());
    }
}
