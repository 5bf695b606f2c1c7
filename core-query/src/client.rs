//! # Query Client
//!
//! Explicitly constructed registry mapping keys to [`Query`] and
//! [`Mutation`] instances. It owns the [`CacheStore`], the
//! [`OfflineQueue`] and the [`MemoryPressureHandler`], and is the entry
//! point adapters use. Independent clients share nothing, so tests build
//! as many as they need.
//!
//! ## Usage
//!
//! ```ignore
//! use core_query::{QueryClient, QueryOptions};
//! use core_cache::{CacheConfig, FetchError};
//! use core_runtime::config::CoreConfig;
//!
//! let client = QueryClient::new(CacheConfig::default(), CoreConfig::in_memory())?;
//! client.initialize().await?;
//!
//! let user = client.get_query(
//!     "user:1",
//!     || async { Ok::<_, FetchError>("alice".to_string()) },
//!     QueryOptions::default(),
//! )?;
//! let mut subscription = user.subscribe();
//! while let Some(state) = subscription.next().await {
//!     println!("{:?}", state.data);
//! }
//! ```

use bridge_traits::MemoryPressureLevel;
use core_cache::{
    AesGcmEncryption, CacheConfig, CacheEntry, CacheInfo, CachePersistence, CacheStore,
    EncryptionKey, FetchError, MemoryPressureHandler, RotationReport, SetOptions,
};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, EventMeta, EventStream, QueryEvent};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{QueryError, Result};
use crate::mutation::{mutation_fn, Mutation, MutationVariables};
use crate::offline_queue::{DrainReport, OfflineQueue};
use crate::options::{MutationOptions, QueryOptions};
use crate::query::{
    erase_fetch, ErasedQuery, Query, QueryData, QueryFn, QueryInner, QueryParts, RegistryHooks,
};

/// One entry of [`QueryClient::prefetch_queries`].
#[derive(Clone)]
pub struct PrefetchRequest {
    key: String,
    fetch_fn: QueryFn,
    stale_time: Option<Duration>,
    cache_time: Option<Duration>,
}

impl PrefetchRequest {
    pub fn new<T, F, Fut>(key: impl Into<String>, fetch: F) -> Self
    where
        T: QueryData,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, FetchError>> + Send + 'static,
    {
        Self {
            key: key.into(),
            fetch_fn: erase_fetch(fetch),
            stale_time: None,
            cache_time: None,
        }
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for PrefetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchRequest")
            .field("key", &self.key)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .finish()
    }
}

struct ClientInner {
    config: CoreConfig,
    store: CacheStore,
    events: EventBus,
    queries: Mutex<HashMap<String, Arc<dyn ErasedQuery>>>,
    mutations: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    queue: OfflineQueue,
    memory: MemoryPressureHandler,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_query_id: AtomicU64,
    /// Set once every startup step has succeeded
    initialized: tokio::sync::Mutex<bool>,
    me: Weak<ClientInner>,
}

impl ClientInner {
    fn hooks(&self) -> Weak<dyn RegistryHooks> {
        let hooks: Weak<dyn RegistryHooks> = self.me.clone();
        hooks
    }

    /// Registered queries whose key passes `matches`. The registry lock is
    /// released before the caller touches any query.
    fn queries_where(&self, matches: impl Fn(&str) -> bool) -> Vec<Arc<dyn ErasedQuery>> {
        self.queries
            .lock()
            .values()
            .filter(|query| matches(query.key()))
            .cloned()
            .collect()
    }

    fn query(&self, key: &str) -> Option<Arc<dyn ErasedQuery>> {
        self.queries.lock().get(key).cloned()
    }

    /// Notify queries and observers about keys whose entries were dropped.
    fn announce_invalidated(
        &self,
        removed: Vec<String>,
        queries: Vec<Arc<dyn ErasedQuery>>,
    ) -> Vec<String> {
        let mut keys: BTreeSet<String> = removed.into_iter().collect();
        keys.extend(queries.iter().map(|query| query.key().to_string()));

        for query in queries {
            query.invalidated();
        }

        let keys: Vec<String> = keys.into_iter().collect();
        if !keys.is_empty() {
            debug!(count = keys.len(), "Queries invalidated");
            let _ = self
                .events
                .emit(CoreEvent::Query(QueryEvent::Invalidated { keys: keys.clone() }));
        }
        keys
    }

    fn invalidate_keys(&self, keys: &[String]) -> Vec<String> {
        let removed: Vec<String> = keys
            .iter()
            .filter(|key| self.store.invalidate(key))
            .cloned()
            .collect();
        let queries = self.queries_where(|key| keys.iter().any(|k| k == key));
        self.announce_invalidated(removed, queries)
    }
}

impl RegistryHooks for ClientInner {
    fn query_disposed(&self, key: &str, query_id: u64) {
        let mut queries = self.queries.lock();
        let current = queries
            .get(key)
            .is_some_and(|query| query.id() == query_id && query.is_disposed());
        if current {
            queries.remove(key);
            debug!(key, "Query removed from registry");
        }
    }

    fn query_revived(&self, query: Arc<dyn ErasedQuery>) {
        let key = query.key().to_string();
        self.queries.lock().entry(key).or_insert(query);
    }

    fn apply_meta(&self, origin: &str, meta: &EventMeta) {
        let invalidate: Vec<String> = meta
            .invalidate_keys
            .iter()
            .filter(|key| key.as_str() != origin)
            .cloned()
            .collect();
        if !invalidate.is_empty() {
            self.invalidate_keys(&invalidate);
        }

        let refetch = self.queries_where(|key| {
            key != origin && meta.refetch_keys.iter().any(|k| k == key)
        });
        for query in refetch {
            query.refetch_detached();
        }
    }
}

/// Registry and owner of every cache component.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    /// Build a client. Must be called inside a Tokio runtime.
    ///
    /// Background work (hydration, GC, queue restore, monitors) starts in
    /// [`initialize`](Self::initialize).
    pub fn new(cache_config: CacheConfig, config: CoreConfig) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(config.event_buffer_size);
        let store = CacheStore::new(cache_config, Arc::clone(&config.clock), events.clone())?;
        let memory = MemoryPressureHandler::new(config.memory_pressure_debounce);
        memory.register(&store);
        let queue = OfflineQueue::new(
            config.storage.clone(),
            events.clone(),
            Arc::clone(&config.clock),
        );

        let inner = Arc::new_cyclic(|me| ClientInner {
            config,
            store,
            events,
            queries: Mutex::new(HashMap::new()),
            mutations: Mutex::new(HashMap::new()),
            queue,
            memory,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            next_query_id: AtomicU64::new(1),
            initialized: tokio::sync::Mutex::new(false),
            me: me.clone(),
        });

        Ok(Self { inner })
    }

    /// Default cache limits, no host bridges.
    pub fn in_memory() -> Result<Self> {
        Self::new(CacheConfig::default(), CoreConfig::in_memory())
    }

    /// Open persistence, restore the offline queue and start background
    /// tasks. Calling it again after it succeeded is a no-op; after a
    /// failure it retries the steps that did not complete.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        let mut initialized = inner.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        let persistence = &inner.config.persistence;
        if persistence.enabled && !inner.store.is_persistent() {
            let storage = inner.config.storage.clone().ok_or_else(|| {
                core_runtime::Error::CapabilityMissing {
                    capability: "KeyValueStore".to_string(),
                    message: "Persistence is enabled but no KeyValueStore was provided".to_string(),
                }
            })?;
            let secure_store = inner.config.secure_store.clone().ok_or_else(|| {
                core_runtime::Error::CapabilityMissing {
                    capability: "SecureStore".to_string(),
                    message: "Persistence is enabled but no SecureStore was provided".to_string(),
                }
            })?;
            let explicit_key = persistence
                .encryption_key
                .as_deref()
                .map(EncryptionKey::from_hex)
                .transpose()?;

            let opened = CachePersistence::open(
                storage,
                secure_store,
                Arc::new(AesGcmEncryption),
                explicit_key,
                inner.events.clone(),
            )
            .await?;
            inner.store.attach_persistence(Arc::new(opened))?;
        }
        if inner.store.is_persistent() {
            let hydrated = inner.store.hydrate().await?;
            debug!(hydrated, "Persisted entries hydrated");
        }

        let restored = inner.queue.restore().await?;
        if restored > 0 {
            info!(restored, "Offline mutations waiting for replay");
        }

        // Background tasks start only once nothing above can fail
        if let Some(interval) = persistence.gc_interval {
            let gc = inner.store.spawn_gc(interval, inner.cancel.child_token());
            inner.tasks.lock().push(gc);
        }

        if let Some(monitor) = inner.config.memory_monitor.clone() {
            let listener = inner.memory.listen(monitor);
            inner.tasks.lock().push(listener);
        }

        if let Some(monitor) = inner.config.network_monitor.clone() {
            let watcher = inner.queue.watch_network(monitor, inner.cancel.child_token());
            inner.tasks.lock().push(watcher);
        }

        *initialized = true;
        info!(persistent = inner.store.is_persistent(), "Query client initialized");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Get the query registered under `key`, creating it on first use.
    ///
    /// An existing query keeps its original fetch function and options. It
    /// fails with [`QueryError::TypeMismatch`] if it was created with a
    /// different value type.
    pub fn get_query<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: QueryOptions<T>,
    ) -> Result<Query<T>>
    where
        T: QueryData,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, FetchError>> + Send + 'static,
    {
        core_cache::validate_key(key)?;

        let mut queries = self.inner.queries.lock();
        if let Some(existing) = queries.get(key).cloned() {
            drop(queries);
            return downcast_query(key, existing);
        }

        let query = Query::from_parts(QueryParts {
            id: self.inner.next_query_id.fetch_add(1, Ordering::Relaxed),
            key: key.to_string(),
            store: self.inner.store.clone(),
            fetch_fn: erase_fetch(fetch),
            options,
            events: self.inner.events.clone(),
            disposal_delay: self.inner.config.disposal_delay,
            hooks: Some(self.inner.hooks()),
        })?;
        queries.insert(key.to_string(), query.erased());
        debug!(key, "Query registered");
        Ok(query)
    }

    pub fn get_query_by_key<T: QueryData>(&self, key: &str) -> Result<Option<Query<T>>> {
        match self.inner.query(key) {
            Some(existing) => downcast_query(key, existing).map(Some),
            None => Ok(None),
        }
    }

    pub fn has_query(&self, key: &str) -> bool {
        self.inner.queries.lock().contains_key(key)
    }

    /// Unregister a query. Its cache entry stays.
    pub fn remove_query(&self, key: &str) -> bool {
        self.inner.queries.lock().remove(key).is_some()
    }

    pub fn query_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.queries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Unregister every query and empty the cache.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.inner.queries.lock());
        self.inner.store.clear();
        info!(queries = removed.len(), "Query client cleared");
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Drop the cached value of `key`. Registered queries with listeners
    /// refetch. Returns `false` when there was nothing to invalidate.
    pub fn invalidate_query(&self, key: &str) -> bool {
        !self.inner.invalidate_keys(&[key.to_string()]).is_empty()
    }

    /// Returns the keys that had an entry or a registered query.
    pub fn invalidate_queries<I, S>(&self, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        self.inner.invalidate_keys(&keys)
    }

    pub fn invalidate_queries_with_prefix(&self, prefix: &str) -> Vec<String> {
        let removed = self.inner.store.invalidate_with_prefix(prefix);
        let queries = self.inner.queries_where(|key| key.starts_with(prefix));
        self.inner.announce_invalidated(removed, queries)
    }

    /// Invalidate every cached entry matching `predicate`.
    pub fn invalidate_queries_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&str, &CacheEntry) -> bool,
    {
        let removed = self.inner.store.invalidate_where(predicate);
        let queries = self.inner.queries_where(|key| removed.iter().any(|k| k == key));
        self.inner.announce_invalidated(removed, queries)
    }

    // ------------------------------------------------------------------
    // Direct cache access
    // ------------------------------------------------------------------

    /// Write `data` under `key` and push it to a registered query.
    ///
    /// Uses the query's stale/cache times when one is registered, the cache
    /// defaults otherwise.
    pub fn set_query_data<T: Serialize>(&self, key: &str, data: &T) -> Result<()> {
        let query = self.inner.query(key);
        let options = query
            .as_ref()
            .map(|query| query.set_options())
            .unwrap_or_else(|| self.inner.store.config().default_set_options());

        self.inner.store.set_serialized(key, data, options)?;
        if let Some(query) = query {
            query.sync_from_cache();
        }
        Ok(())
    }

    pub fn get_query_data<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(entry) = self.inner.store.get(key) else {
            return Ok(None);
        };
        serde_json::from_value(entry.data)
            .map(Some)
            .map_err(|e| QueryError::type_mismatch(key, e.to_string()))
    }

    // ------------------------------------------------------------------
    // Prefetch
    // ------------------------------------------------------------------

    /// Warm the cache for `key`. Fresh entries are left alone; otherwise
    /// the fetch joins any in-flight request for the key.
    pub async fn prefetch_query<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: QueryOptions<T>,
    ) -> Result<()>
    where
        T: QueryData,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, FetchError>> + Send + 'static,
    {
        let set_options = options.set_options(self.inner.store.config());
        self.prefetch_erased(key, erase_fetch(fetch), set_options)
            .await
    }

    /// Run every prefetch concurrently. Results are in request order.
    pub async fn prefetch_queries(&self, requests: Vec<PrefetchRequest>) -> Vec<Result<()>> {
        let defaults = self.inner.store.config().default_set_options();
        join_all(requests.into_iter().map(|request| {
            let mut options = defaults;
            if let Some(stale_time) = request.stale_time {
                options = options.with_stale_time(stale_time);
            }
            if let Some(cache_time) = request.cache_time {
                options = options.with_cache_time(cache_time);
            }
            async move {
                self.prefetch_erased(&request.key, request.fetch_fn, options)
                    .await
            }
        }))
        .await
    }

    async fn prefetch_erased(
        &self,
        key: &str,
        fetch_fn: QueryFn,
        options: SetOptions,
    ) -> Result<()> {
        core_cache::validate_key(key)?;
        options.validate()?;

        let store = &self.inner.store;
        let cached = if store.is_persistent() {
            store.restore(key).await?
        } else {
            store.peek(key)
        };
        if cached.is_some_and(|entry| entry.is_fresh(store.clock().now())) {
            debug!(key, "Prefetch skipped; entry is fresh");
            return Ok(());
        }

        store.deduplicate(key, options, move || fetch_fn())?.await?;
        if let Some(query) = self.inner.query(key) {
            query.sync_from_cache();
        }
        debug!(key, "Prefetched");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn get_cache_info(&self) -> CacheInfo {
        self.inner.store.info()
    }

    pub fn get_cache_keys(&self) -> Vec<String> {
        self.inner.store.keys()
    }

    /// Entry snapshot without touching access bookkeeping.
    pub fn inspect_entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner.store.peek(key)
    }

    // ------------------------------------------------------------------
    // Mutations and the offline queue
    // ------------------------------------------------------------------

    /// Get the mutation registered under `key`, creating it on first use.
    ///
    /// Registering a mutation makes it the replay target for queued items
    /// with the same key. If such items are pending and the network is up,
    /// they are replayed right away.
    pub fn get_mutation<V, T, F, Fut>(
        &self,
        key: &str,
        mutate: F,
        options: MutationOptions<V, T>,
    ) -> Result<Mutation<V, T>>
    where
        V: MutationVariables,
        T: Clone + Send + Sync + 'static,
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, FetchError>> + Send + 'static,
    {
        core_cache::validate_key(key)?;

        let mutation = {
            let mut mutations = self.inner.mutations.lock();
            if let Some(existing) = mutations.get(key) {
                return existing
                    .downcast_ref::<Mutation<V, T>>()
                    .cloned()
                    .ok_or_else(|| {
                        QueryError::type_mismatch(key, "mutation registered with other types")
                    });
            }

            let mutation = Mutation::with_hooks(
                key.to_string(),
                mutation_fn(mutate),
                options,
                Some(self.inner.queue.clone()),
                self.inner.events.clone(),
                Some(self.inner.hooks()),
            );
            mutations.insert(key.to_string(), Arc::new(mutation.clone()));
            mutation
        };

        if self.inner.queue.pending_for(key) > 0 {
            if let Some(monitor) = self.inner.config.network_monitor.clone() {
                let queue = self.inner.queue.clone();
                tokio::spawn(async move {
                    if monitor.is_connected().await {
                        queue.drain().await;
                    }
                });
            }
        }

        Ok(mutation)
    }

    pub fn remove_mutation(&self, key: &str) -> bool {
        self.inner.mutations.lock().remove(key).is_some()
    }

    pub fn offline_queue(&self) -> &OfflineQueue {
        &self.inner.queue
    }

    /// Replay queued mutations now, regardless of reported connectivity.
    pub async fn replay_offline_queue(&self) -> DrainReport {
        self.inner.queue.drain().await
    }

    // ------------------------------------------------------------------
    // Persistence and memory
    // ------------------------------------------------------------------

    /// Re-encrypt persisted entries under `new_key`.
    pub async fn update_encryption_key(&self, new_key: EncryptionKey) -> Result<RotationReport> {
        Ok(self.inner.store.update_encryption_key(new_key).await?)
    }

    pub fn memory_pressure(&self) -> &MemoryPressureHandler {
        &self.inner.memory
    }

    /// Report a low-memory signal from the host.
    pub fn handle_memory_pressure(&self, level: MemoryPressureLevel) {
        self.inner.memory.signal(level);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe_events(&self) -> EventStream {
        EventStream::new(self.inner.events.subscribe())
    }

    /// Stop background tasks and flush pending persistence writes.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.memory.shutdown();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        }

        self.inner.store.flush().await;
        info!("Query client shut down");
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("queries", &self.inner.queries.lock().len())
            .field("mutations", &self.inner.mutations.lock().len())
            .field("store", &self.inner.store)
            .field("queue", &self.inner.queue)
            .finish()
    }
}

fn downcast_query<T: QueryData>(key: &str, query: Arc<dyn ErasedQuery>) -> Result<Query<T>> {
    query
        .into_any()
        .downcast::<QueryInner<T>>()
        .map(Query::from_inner)
        .map_err(|_| QueryError::type_mismatch(key, "query registered with another value type"))
}
