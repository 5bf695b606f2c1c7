//! # Query
//!
//! Per-key orchestrator sitting between consumers and the [`CacheStore`].
//!
//! ## Fetch flow
//!
//! 1. Fresh entry: served as-is, no fetch
//! 2. Stale entry: served immediately, background refetch started
//! 3. Missing entry: `Loading`, then the shared (deduplicated) fetch result
//!
//! A failed fetch never touches the cached value.
//!
//! ## Lifecycle
//!
//! Listeners keep a query alive. When the last one leaves, a disposal timer
//! starts; adding a listener before it fires cancels it. Timer cancellation
//! and listener increments are serialized by one lock and an epoch counter,
//! so a timer can only dispose the query it was started for.

use core_cache::{CacheEntry, CacheStore, FetchError, SetOptions};
use core_runtime::events::{CoreEvent, EventBus, EventMeta, QueryEvent};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{QueryError, Result};
use crate::options::QueryOptions;
use crate::state::QueryState;

/// Values a query can hold.
pub trait QueryData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> QueryData for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Type-erased fetch function.
pub type QueryFn =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<Value, FetchError>> + Send + Sync>;

/// Wrap a typed fetch function so its result is stored as JSON.
pub fn erase_fetch<T, F, Fut>(fetch: F) -> QueryFn
where
    T: QueryData,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<T, FetchError>> + Send + 'static,
{
    Arc::new(move || {
        let pending = fetch();
        Box::pin(async move {
            let data = pending.await?;
            serde_json::to_value(data)
                .map_err(|e| FetchError::other(format!("Fetched value is not serializable: {}", e)))
        })
    })
}

/// Callbacks from a query back to the registry that owns it.
pub(crate) trait RegistryHooks: Send + Sync {
    /// The disposal timer fired with no listeners.
    fn query_disposed(&self, key: &str, query_id: u64);

    /// A disposed query got a listener again.
    fn query_revived(&self, query: Arc<dyn ErasedQuery>);

    /// Invalidate/refetch the keys named in a success `meta`.
    fn apply_meta(&self, origin: &str, meta: &EventMeta);
}

/// Registry view of a query, independent of its value type.
pub(crate) trait ErasedQuery: Send + Sync {
    fn id(&self) -> u64;
    fn key(&self) -> &str;
    fn listener_count(&self) -> usize;
    fn is_disposed(&self) -> bool;
    /// Cache options this query writes with.
    fn set_options(&self) -> SetOptions;
    /// Mark stale and refetch if anyone is listening.
    fn invalidated(self: Arc<Self>);
    fn refetch_detached(self: Arc<Self>);
    /// Republish whatever the store currently holds.
    fn sync_from_cache(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[derive(Default)]
struct Listeners {
    count: usize,
    /// Bumped on every change so a stale timer cannot dispose
    epoch: u64,
    timer: Option<JoinHandle<()>>,
    disposed: bool,
}

pub(crate) struct QueryParts<T> {
    pub id: u64,
    pub key: String,
    pub store: CacheStore,
    pub fetch_fn: QueryFn,
    pub options: QueryOptions<T>,
    pub events: EventBus,
    pub disposal_delay: Duration,
    pub hooks: Option<Weak<dyn RegistryHooks>>,
}

pub(crate) struct QueryInner<T> {
    id: u64,
    key: String,
    store: CacheStore,
    fetch_fn: QueryFn,
    options: QueryOptions<T>,
    set_options: SetOptions,
    enabled: AtomicBool,
    state: watch::Sender<QueryState<T>>,
    listeners: Mutex<Listeners>,
    disposal_delay: Duration,
    events: EventBus,
    hooks: Option<Weak<dyn RegistryHooks>>,
}

/// Handle to a query. Cloning is cheap; clones share state.
pub struct Query<T> {
    inner: Arc<QueryInner<T>>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("listeners", &self.inner.listeners.lock().count)
            .field("enabled", &self.inner.enabled.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: QueryData> Query<T> {
    pub(crate) fn from_parts(parts: QueryParts<T>) -> Result<Self> {
        let set_options = parts.options.set_options(parts.store.config());
        set_options.validate()?;

        let (state, _) = watch::channel(QueryState::idle());
        let inner = Arc::new(QueryInner {
            id: parts.id,
            key: parts.key,
            store: parts.store,
            fetch_fn: parts.fetch_fn,
            enabled: AtomicBool::new(parts.options.enabled),
            options: parts.options,
            set_options,
            state,
            listeners: Mutex::new(Listeners::default()),
            disposal_delay: parts.disposal_delay,
            events: parts.events,
            hooks: parts.hooks,
        });
        inner.sync_from_cache();
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<QueryInner<T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn erased(&self) -> Arc<dyn ErasedQuery> {
        Arc::clone(&self.inner) as Arc<dyn ErasedQuery>
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Current snapshot.
    pub fn state(&self) -> QueryState<T> {
        self.inner.state.borrow().clone()
    }

    /// State notifications without registering a listener.
    pub fn watch(&self) -> watch::Receiver<QueryState<T>> {
        self.inner.state.subscribe()
    }

    /// Register a listener and receive state notifications until the
    /// returned subscription is dropped.
    pub fn subscribe(&self) -> QuerySubscription<T> {
        let rx = self.inner.state.subscribe();
        self.add_listener();
        QuerySubscription {
            query: self.clone(),
            rx,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        debug!(key = %self.inner.key, enabled, "Query enabled flag changed");
    }

    pub fn options(&self) -> &QueryOptions<T> {
        &self.inner.options
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().count
    }

    /// Add a listener; cancels a pending disposal.
    pub fn add_listener(&self) -> usize {
        let (count, revived) = {
            let mut slot = self.inner.listeners.lock();
            slot.count += 1;
            slot.epoch += 1;
            if let Some(timer) = slot.timer.take() {
                timer.abort();
                debug!(key = %self.inner.key, "Disposal cancelled");
            }
            let revived = std::mem::replace(&mut slot.disposed, false);
            self.inner.store.retain(&self.inner.key);
            (slot.count, revived)
        };

        if revived {
            if let Some(hooks) = self.inner.hooks() {
                hooks.query_revived(self.erased());
            }
        }

        if self.inner.options.refetch_on_mount && self.is_enabled() {
            if let Ok(handle) = Handle::try_current() {
                let query = self.clone();
                handle.spawn(async move {
                    if let Err(e) = query.fetch().await {
                        debug!(key = %query.inner.key, error = %e, "Mount fetch failed");
                    }
                });
            }
        }

        count
    }

    /// Remove a listener. Extra calls are ignored; the count never goes
    /// below zero. Reaching zero starts the disposal timer.
    pub fn remove_listener(&self) -> usize {
        let mut slot = self.inner.listeners.lock();
        if slot.count == 0 {
            warn!(key = %self.inner.key, "remove_listener called with no listeners");
            return 0;
        }

        slot.count -= 1;
        self.inner.store.release(&self.inner.key);
        if slot.count > 0 {
            return slot.count;
        }

        slot.epoch += 1;
        let epoch = slot.epoch;
        let delay = self.inner.disposal_delay;

        if delay.is_zero() {
            drop(slot);
            self.inner.dispose_if_idle(epoch);
            return 0;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                slot.timer = Some(handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.dispose_if_idle(epoch);
                }));
                debug!(key = %self.inner.key, ?delay, "Disposal scheduled");
            }
            Err(_) => {
                drop(slot);
                warn!(key = %self.inner.key, "No runtime for the disposal timer; disposing now");
                self.inner.dispose_if_idle(epoch);
            }
        }
        0
    }

    /// Serve cached data when present, fetching when missing.
    ///
    /// Stale data is returned immediately and refreshed in the background.
    /// Disabled queries return `Ok(None)` without fetching.
    pub async fn fetch(&self) -> Result<Option<T>> {
        if !self.is_enabled() {
            debug!(key = %self.inner.key, "Query disabled; fetch skipped");
            return Ok(None);
        }

        let entry = if self.inner.store.is_persistent() {
            self.inner.store.restore(&self.inner.key).await?
        } else {
            self.inner.store.get(&self.inner.key)
        };

        match entry {
            Some(entry) => {
                let now = self.inner.store.clock().now();
                let data = self.inner.decode(&entry)?;
                let is_stale = entry.is_stale(now);
                self.inner.publish_cached(data.clone(), &entry, is_stale);
                if is_stale {
                    Arc::clone(&self.inner).spawn_fetch();
                }
                Ok(Some(data))
            }
            None => self.inner.run_fetch(false).await.map(Some),
        }
    }

    /// Fetch regardless of freshness.
    pub async fn refetch(&self) -> Result<Option<T>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let background = self.inner.state.borrow().data.is_some();
        self.inner.run_fetch(background).await.map(Some)
    }

    /// Drop the cached value so the next access fetches again.
    pub fn invalidate(&self) {
        self.inner.store.invalidate(&self.inner.key);
        self.erased().invalidated();
    }
}

impl<T: QueryData> QueryInner<T> {
    fn hooks(&self) -> Option<Arc<dyn RegistryHooks>> {
        self.hooks.as_ref().and_then(Weak::upgrade)
    }

    fn emit(&self, event: QueryEvent) {
        let _ = self.events.emit(CoreEvent::Query(event));
    }

    fn decode(&self, entry: &CacheEntry) -> Result<T> {
        serde_json::from_value(entry.data.clone())
            .map_err(|e| QueryError::type_mismatch(&self.key, e.to_string()))
    }

    fn publish_cached(&self, data: T, entry: &CacheEntry, is_stale: bool) {
        self.state.send_modify(|state| {
            let fetching = state.is_fetching;
            let mut next = QueryState::succeeded(data, entry.created_at, is_stale);
            if fetching {
                next = next.loading();
            }
            *state = next;
        });
    }

    fn spawn_fetch(self: Arc<Self>) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let background = self.state.borrow().data.is_some();
        tokio::spawn(async move {
            if let Err(e) = self.run_fetch(background).await {
                debug!(key = %self.key, error = %e, "Background fetch failed");
            }
        });
    }

    async fn run_fetch(&self, background: bool) -> Result<T> {
        let handle = self
            .store
            .deduplicate(&self.key, self.set_options, || (self.fetch_fn)())?;

        self.state
            .send_modify(|state| *state = std::mem::take(state).loading());
        self.emit(QueryEvent::Fetching {
            key: self.key.clone(),
            background,
        });

        let outcome = match handle.await {
            Ok(value) => serde_json::from_value::<T>(value)
                .map_err(|e| FetchError::other(format!("Fetched value has the wrong shape: {}", e))),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(data) => {
                let now = self.store.clock().now();
                let (updated_at, is_stale) = match self.store.peek(&self.key) {
                    Some(entry) => (entry.created_at, entry.is_stale(now)),
                    None => (now, self.set_options.stale_time.is_zero()),
                };
                self.state
                    .send_replace(QueryState::succeeded(data.clone(), updated_at, is_stale));

                info!(key = %self.key, background, "Query succeeded");
                self.emit(QueryEvent::Succeeded {
                    key: self.key.clone(),
                    meta: self.options.meta.clone(),
                });
                if let Some(on_success) = &self.options.on_success {
                    on_success(&data);
                }
                if !self.options.meta.invalidate_keys.is_empty()
                    || !self.options.meta.refetch_keys.is_empty()
                {
                    if let Some(hooks) = self.hooks() {
                        hooks.apply_meta(&self.key, &self.options.meta);
                    }
                }
                Ok(data)
            }
            Err(error) => {
                self.state
                    .send_modify(|state| *state = std::mem::take(state).failed(error.clone()));

                warn!(key = %self.key, background, error = %error, "Query failed");
                self.emit(QueryEvent::Failed {
                    key: self.key.clone(),
                    message: error.to_string(),
                    meta: self.options.meta.clone(),
                });
                if let Some(on_error) = &self.options.on_error {
                    on_error(&error);
                }
                Err(QueryError::Fetch(error))
            }
        }
    }

    fn dispose_if_idle(&self, epoch: u64) {
        {
            let mut slot = self.listeners.lock();
            if slot.count != 0 || slot.epoch != epoch || slot.disposed {
                return;
            }
            slot.timer = None;
            slot.disposed = true;
        }

        info!(key = %self.key, "Query disposed");
        self.emit(QueryEvent::Disposed {
            key: self.key.clone(),
        });
        if let Some(hooks) = self.hooks() {
            hooks.query_disposed(&self.key, self.id);
        }
    }
}

impl<T: QueryData> ErasedQuery for QueryInner<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn listener_count(&self) -> usize {
        self.listeners.lock().count
    }

    fn is_disposed(&self) -> bool {
        self.listeners.lock().disposed
    }

    fn set_options(&self) -> SetOptions {
        self.set_options
    }

    fn invalidated(self: Arc<Self>) {
        self.state
            .send_modify(|state| *state = std::mem::take(state).invalidated());
        if self.listener_count() > 0 {
            self.spawn_fetch();
        }
    }

    fn refetch_detached(self: Arc<Self>) {
        self.spawn_fetch();
    }

    fn sync_from_cache(&self) {
        let Some(entry) = self.store.peek(&self.key) else {
            return;
        };
        match self.decode(&entry) {
            Ok(data) => {
                let now = self.store.clock().now();
                let is_stale = entry.is_stale(now);
                self.publish_cached(data, &entry, is_stale);
            }
            Err(e) => debug!(key = %self.key, error = %e, "Cached value does not match query type"),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A registered listener. Dropping it removes the listener.
pub struct QuerySubscription<T: QueryData> {
    query: Query<T>,
    rx: watch::Receiver<QueryState<T>>,
}

impl<T: QueryData> QuerySubscription<T> {
    pub fn query(&self) -> &Query<T> {
        &self.query
    }

    pub fn current(&self) -> QueryState<T> {
        self.rx.borrow().clone()
    }

    /// Wait for the next state change.
    pub async fn next(&mut self) -> Option<QueryState<T>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

impl<T: QueryData> Drop for QuerySubscription<T> {
    fn drop(&mut self) {
        self.query.remove_listener();
    }
}
