//! In-memory cache store
//!
//! [`CacheStore`] owns every [`CacheEntry`]. Entries are never mutated in
//! place: reads and writes build a new entry and swap it into the table under
//! a short synchronous lock, so no caller can observe a torn entry.
//!
//! The store also tracks hit/miss metrics, enforces the size and count budget
//! through the configured [`EvictionPolicy`](crate::EvictionPolicy), and
//! deduplicates concurrent fetches for the same key.

use crate::config::{CacheConfig, SetOptions};
use crate::entry::{validate_key, CacheEntry};
use crate::error::{CacheError, Result};
use crate::fetch::FetchError;
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::persistence::{CachePersistence, EncryptionKey, RotationReport};
use crate::size::estimate_size;
use bridge_traits::Clock;
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handle shared by every caller waiting on the same in-flight fetch.
pub type SharedFetch = Shared<BoxFuture<'static, std::result::Result<Value, FetchError>>>;

/// Snapshot returned by [`CacheStore::info`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheInfo {
    pub entry_count: usize,
    pub size_bytes: usize,
    pub max_cache_size: usize,
    pub max_entries: usize,
    pub metrics: MetricsSnapshot,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, CacheEntry>,
    /// Listener counts, kept even while the key has no entry
    refs: HashMap<String, u32>,
    total_size: usize,
    sequence: u64,
}

impl Table {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        self.total_size += entry.size_bytes;
        if let Some(old) = self.entries.insert(key, entry) {
            self.total_size -= old.size_bytes;
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key)?;
        self.total_size -= removed.size_bytes;
        Some(removed)
    }

    fn remove_matching<F>(&mut self, mut predicate: F) -> Vec<String>
    where
        F: FnMut(&str, &CacheEntry) -> bool,
    {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|&(key, entry)| predicate(key.as_str(), entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys
    }
}

struct InFlight {
    id: u64,
    future: SharedFetch,
}

struct StoreShared {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    table: RwLock<Table>,
    metrics: CacheMetrics,
    inflight: Mutex<HashMap<String, InFlight>>,
    next_fetch_id: AtomicU64,
    persistence: OnceLock<Arc<CachePersistence>>,
}

/// Keyed table of cache entries.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct CacheStore {
    shared: Arc<StoreShared>,
}

/// Non-owning handle used by background tasks.
#[derive(Clone)]
pub struct WeakCacheStore {
    shared: Weak<StoreShared>,
}

impl WeakCacheStore {
    pub fn upgrade(&self) -> Option<CacheStore> {
        self.shared.upgrade().map(|shared| CacheStore { shared })
    }
}

impl CacheStore {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>, events: EventBus) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(StoreShared {
                config,
                clock,
                events,
                table: RwLock::new(Table::default()),
                metrics: CacheMetrics::default(),
                inflight: Mutex::new(HashMap::new()),
                next_fetch_id: AtomicU64::new(1),
                persistence: OnceLock::new(),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    pub fn downgrade(&self) -> WeakCacheStore {
        WeakCacheStore {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Route writes and deletes to `persistence` from now on.
    pub fn attach_persistence(&self, persistence: Arc<CachePersistence>) -> Result<()> {
        self.shared
            .persistence
            .set(persistence)
            .map_err(|_| CacheError::Validation("Persistence is already attached".to_string()))
    }

    pub fn is_persistent(&self) -> bool {
        self.shared.persistence.get().is_some()
    }

    fn persistence(&self) -> Option<&Arc<CachePersistence>> {
        self.shared.persistence.get()
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.shared.events.emit(CoreEvent::Cache(event));
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Look up `key`, recording a hit or miss and advancing the entry's
    /// access bookkeeping. Expired entries are removed and count as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.shared.clock.now();
        let mut table = self.shared.table.write();
        let sequence = table.next_sequence();

        let lookup = table.entries.get(key).map(|current| {
            if current.is_expired(now) {
                Err(current.is_secure)
            } else {
                Ok(current.touched(now, sequence))
            }
        });

        match lookup {
            None => {
                drop(table);
                self.shared.metrics.record_miss();
                debug!(key, "Cache miss");
                None
            }
            Some(Err(was_secure)) => {
                table.remove(key);
                if !was_secure {
                    if let Some(persistence) = self.persistence() {
                        persistence.schedule_delete(key);
                    }
                }
                drop(table);
                self.shared.metrics.record_miss();
                debug!(key, "Cache entry expired");
                None
            }
            Some(Ok(next)) => {
                table.entries.insert(key.to_string(), next.clone());
                drop(table);
                self.shared.metrics.record_hit();
                debug!(key, stale = next.is_stale(now), "Cache hit");
                Some(next)
            }
        }
    }

    /// Look up `key` without touching metrics or access bookkeeping.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let now = self.shared.clock.now();
        self.shared
            .table
            .read()
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    /// Sorted keys of every live entry.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.table.read().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.shared.table.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.shared.table.read().total_size
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn info(&self) -> CacheInfo {
        let table = self.shared.table.read();
        CacheInfo {
            entry_count: table.entries.len(),
            size_bytes: table.total_size,
            max_cache_size: self.shared.config.max_cache_size,
            max_entries: self.shared.config.max_entries,
            metrics: self.shared.metrics.snapshot(),
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert or overwrite `key`, then evict until the store is back under
    /// budget. Non-secure entries are queued for persistence. A value larger
    /// than the whole cache is rejected.
    pub fn set(&self, key: &str, data: Value, options: SetOptions) -> Result<()> {
        validate_key(key)?;
        options.validate()?;

        let size = estimate_size(&data);
        let max_size = self.shared.config.max_cache_size;
        if size > max_size {
            return Err(CacheError::Validation(format!(
                "Value for {} is {} bytes, larger than the {} byte cache",
                key, size, max_size
            )));
        }

        let now = self.shared.clock.now();
        let mut entry = CacheEntry::new(
            data,
            now,
            options.stale_time,
            options.cache_time,
            options.is_secure,
            options.max_age,
        );
        entry.size_bytes = size;

        let mut table = self.shared.table.write();
        let sequence = table.next_sequence();
        entry.access_sequence = sequence;
        entry.insert_sequence = sequence;
        entry.reference_count = table.refs.get(key).copied().unwrap_or(0);

        // Queued under the table lock so persisted order matches memory order
        if let Some(persistence) = self.persistence() {
            if entry.is_secure {
                persistence.schedule_delete(key);
            } else {
                persistence.schedule_write(key, entry.clone());
            }
        }

        table.insert(key.to_string(), entry);
        let evicted = self.enforce_budget(&mut table, key);
        drop(table);

        debug!(key, size, "Cache entry written");
        self.report_evictions(evicted);
        Ok(())
    }

    /// Serialize `data` and [`set`](Self::set) it.
    pub fn set_serialized<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        options: SetOptions,
    ) -> Result<()> {
        let value = serde_json::to_value(data).map_err(|e| {
            CacheError::Validation(format!("Value for {} is not serializable: {}", key, e))
        })?;
        self.set(key, value, options)
    }

    /// Evict victims chosen by the policy until size and count fit. `protect`
    /// (the entry just written) is never chosen.
    fn enforce_budget(&self, table: &mut Table, protect: &str) -> Vec<String> {
        let config = &self.shared.config;
        let mut evicted = Vec::new();

        while table.total_size > config.max_cache_size || table.entries.len() > config.max_entries
        {
            let victim = config
                .eviction_policy
                .select_victim(table.entries.iter().filter(|(key, _)| key.as_str() != protect))
                .map(str::to_string);

            match victim {
                Some(victim) => {
                    table.remove(&victim);
                    evicted.push(victim);
                }
                None => {
                    warn!(
                        size = table.total_size,
                        entries = table.entries.len(),
                        "Cache over budget but every remaining entry is in use"
                    );
                    break;
                }
            }
        }

        evicted
    }

    fn report_evictions(&self, evicted: Vec<String>) {
        if evicted.is_empty() {
            return;
        }
        self.shared.metrics.record_evictions(evicted.len() as u64);
        let policy = self.shared.config.eviction_policy.short_name();
        for key in evicted {
            debug!(key = %key, policy, "Cache entry evicted");
            self.emit(CacheEvent::Evicted {
                key,
                policy: policy.to_string(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Delete `key` from memory and from persistence.
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        let mut table = self.shared.table.write();
        let removed = table.remove(key);
        if let Some(persistence) = self.persistence() {
            persistence.schedule_delete(key);
        }
        removed
    }

    /// Delete every entry from memory and from persistence. Listener counts
    /// survive.
    pub fn clear(&self) {
        let mut table = self.shared.table.write();
        table.entries.clear();
        table.total_size = 0;
        if let Some(persistence) = self.persistence() {
            persistence.schedule_clear();
        }
        drop(table);
        info!("Cache cleared");
    }

    fn remove_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: FnMut(&str, &CacheEntry) -> bool,
    {
        let mut table = self.shared.table.write();
        let removed = table.remove_matching(predicate);
        if let Some(persistence) = self.persistence() {
            for key in &removed {
                persistence.schedule_delete(key);
            }
        }
        removed
    }

    /// Drop `key` so the next access fetches again. Returns whether an entry
    /// was removed.
    pub fn invalidate(&self, key: &str) -> bool {
        !self.remove_where(|candidate, _| candidate == key).is_empty()
    }

    pub fn invalidate_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.remove_where(|key, _| key.starts_with(prefix))
    }

    pub fn invalidate_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&str, &CacheEntry) -> bool,
    {
        self.remove_where(|key, entry| predicate(key, entry))
    }

    /// Shed inactive entries from memory.
    ///
    /// Non-critical trims only remove stale entries; critical trims remove
    /// every entry without listeners. Persisted copies are kept so they can
    /// be restored later.
    pub fn trim(&self, critical: bool) -> usize {
        let now = self.shared.clock.now();
        let removed = self
            .shared
            .table
            .write()
            .remove_matching(|_, entry| {
                entry.reference_count == 0 && (critical || entry.is_stale(now))
            })
            .len();

        info!(removed, critical, "Cache trimmed");
        self.emit(CacheEvent::Trimmed { removed, critical });
        removed
    }

    /// Remove entries that are unreferenced and idle past their cache time,
    /// or past their max age.
    pub fn collect_garbage(&self) -> usize {
        let now = self.shared.clock.now();
        let removed = self.remove_where(|_, entry| {
            entry.is_eligible_for_gc(now) || entry.is_expired(now)
        });

        if !removed.is_empty() {
            debug!(removed = removed.len(), "Garbage collected cache entries");
            self.emit(CacheEvent::GarbageCollected {
                removed: removed.len(),
            });
        }
        removed.len()
    }

    /// Run [`collect_garbage`](Self::collect_garbage) every `interval` until
    /// `cancel` fires or the store is dropped.
    pub fn spawn_gc(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.downgrade();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else {
                            break;
                        };
                        store.collect_garbage();
                    }
                }
            }
            debug!("Cache GC task stopped");
        })
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    /// Register a listener on `key`. Referenced entries are never evicted,
    /// trimmed or collected.
    pub fn retain(&self, key: &str) -> u32 {
        let mut table = self.shared.table.write();
        let count = {
            let slot = table.refs.entry(key.to_string()).or_insert(0);
            *slot = slot.saturating_add(1);
            *slot
        };
        Self::sync_reference_count(&mut table, key, count);
        count
    }

    /// Unregister a listener on `key`. Saturates at zero.
    pub fn release(&self, key: &str) -> u32 {
        let mut table = self.shared.table.write();
        let count = match table.refs.get_mut(key) {
            Some(slot) => {
                *slot = slot.saturating_sub(1);
                *slot
            }
            None => 0,
        };
        if count == 0 {
            table.refs.remove(key);
        }
        Self::sync_reference_count(&mut table, key, count);
        count
    }

    pub fn reference_count(&self, key: &str) -> u32 {
        self.shared.table.read().refs.get(key).copied().unwrap_or(0)
    }

    fn sync_reference_count(table: &mut Table, key: &str, count: u32) {
        if let Some(entry) = table.entries.get(key) {
            let next = entry.with_reference_count(count);
            table.entries.insert(key.to_string(), next);
        }
    }

    // ------------------------------------------------------------------
    // Deduplication
    // ------------------------------------------------------------------

    /// Share one execution of `fetch` between every concurrent caller for
    /// `key`.
    ///
    /// The first caller starts `fetch` on a spawned task; later callers get
    /// the same handle until it settles. A successful result is written to
    /// the store with `options` before the handle resolves. The registration
    /// is removed exactly once, by the task that created it.
    ///
    /// `fetch` is called while the in-flight table is locked and must not
    /// call back into the store before returning its future.
    pub fn deduplicate<F, Fut>(
        &self,
        key: &str,
        options: SetOptions,
        fetch: F,
    ) -> Result<SharedFetch>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Value, FetchError>> + Send + 'static,
    {
        validate_key(key)?;
        options.validate()?;

        let mut inflight = self.shared.inflight.lock();
        if let Some(existing) = inflight.get(key) {
            debug!(key, "Joining in-flight fetch");
            return Ok(existing.future.clone());
        }

        let id = self.shared.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let owned_key = key.to_string();
        let store = self.clone();
        let pending = fetch();

        let task = tokio::spawn(async move {
            let result = pending.await;
            match &result {
                Ok(value) => {
                    if let Err(e) = store.set(&owned_key, value.clone(), options) {
                        warn!(key = %owned_key, error = %e, "Fetched value could not be cached");
                    }
                }
                Err(e) => debug!(key = %owned_key, error = %e, "Fetch failed"),
            }
            store.finish_fetch(&owned_key, id);
            result
        });

        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(FetchError::other(format!("Fetch task failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        inflight.insert(
            key.to_string(),
            InFlight {
                id,
                future: future.clone(),
            },
        );
        debug!(key, fetch_id = id, "Fetch started");
        Ok(future)
    }

    fn finish_fetch(&self, key: &str, id: u64) {
        let mut inflight = self.shared.inflight.lock();
        if inflight.get(key).is_some_and(|current| current.id == id) {
            inflight.remove(key);
        }
    }

    pub fn is_fetching(&self, key: &str) -> bool {
        self.shared.inflight.lock().contains_key(key)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// In-memory lookup that falls back to the persisted copy.
    pub async fn restore(&self, key: &str) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.get(key) {
            return Ok(Some(entry));
        }
        let Some(persistence) = self.persistence() else {
            return Ok(None);
        };
        let Some(entry) = persistence.load(key).await? else {
            return Ok(None);
        };

        let now = self.shared.clock.now();
        if entry.is_expired(now) {
            persistence.schedule_delete(key);
            return Ok(None);
        }

        // A write that landed while loading wins
        match self.insert_restored(key, entry, true) {
            Some(restored) => {
                debug!(key, "Cache entry restored from persistence");
                Ok(Some(restored))
            }
            None => Ok(self.peek(key)),
        }
    }

    /// Load every persisted entry that is not already in memory.
    #[instrument(skip(self))]
    pub async fn hydrate(&self) -> Result<usize> {
        let Some(persistence) = self.persistence() else {
            return Ok(0);
        };

        let now = self.shared.clock.now();
        let mut restored = 0;
        for (key, entry) in persistence.load_all().await? {
            if entry.is_expired(now) {
                persistence.schedule_delete(&key);
                continue;
            }
            if self.insert_restored(&key, entry, false).is_some() {
                restored += 1;
            }
        }

        info!(restored, "Cache hydrated from persistence");
        Ok(restored)
    }

    /// Put a persisted entry back in memory unless `key` is already there.
    /// With `touch` the insert also counts as an access, but not as a hit.
    fn insert_restored(
        &self,
        key: &str,
        mut entry: CacheEntry,
        touch: bool,
    ) -> Option<CacheEntry> {
        if entry.size_bytes > self.shared.config.max_cache_size {
            warn!(key, size = entry.size_bytes, "Persisted entry larger than the cache; skipped");
            return None;
        }

        let now = self.shared.clock.now();
        let mut table = self.shared.table.write();
        if table.entries.contains_key(key) {
            return None;
        }
        let sequence = table.next_sequence();
        entry.insert_sequence = sequence;
        entry.reference_count = table.refs.get(key).copied().unwrap_or(0);
        let entry = if touch {
            entry.touched(now, sequence)
        } else {
            entry.access_sequence = sequence;
            entry
        };
        table.insert(key.to_string(), entry.clone());
        let evicted = self.enforce_budget(&mut table, key);
        drop(table);
        self.report_evictions(evicted);
        Some(entry)
    }

    /// Wait for queued persistence writes to land.
    pub async fn flush(&self) {
        if let Some(persistence) = self.persistence() {
            persistence.flush().await;
        }
    }

    /// Re-encrypt persisted entries under `new_key`. See
    /// [`CachePersistence::rotate_key`].
    pub async fn update_encryption_key(&self, new_key: EncryptionKey) -> Result<RotationReport> {
        let persistence = self.persistence().ok_or_else(|| {
            CacheError::Validation("Persistence is not enabled".to_string())
        })?;
        persistence.rotate_key(new_key).await
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.shared.table.read();
        f.debug_struct("CacheStore")
            .field("entries", &table.entries.len())
            .field("size_bytes", &table.total_size)
            .field("persistent", &self.is_persistent())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::EvictionPolicy;
    use bridge_traits::ManualClock;
    use chrono::Utc;
    use serde_json::json;

    fn store_with(config: CacheConfig) -> (CacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = CacheStore::new(config, clock.clone(), EventBus::default()).unwrap();
        (store, clock)
    }

    fn options() -> SetOptions {
        SetOptions::new(Duration::from_secs(60), Duration::from_secs(300))
    }

    #[test]
    fn test_get_records_hits_and_misses() {
        let (store, _) = store_with(CacheConfig::default());

        assert!(store.get("user:1").is_none());
        store.set("user:1", json!("alice"), options()).unwrap();

        let entry = store.get("user:1").unwrap();
        assert_eq!(entry.data, json!("alice"));
        assert_eq!(entry.access_count, 2);

        let metrics = store.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hit_rate(), 0.5);
    }

    #[test]
    fn test_overwrite_resets_access_count() {
        let (store, _) = store_with(CacheConfig::default());
        store.set("k", json!(1), options()).unwrap();
        store.get("k");
        store.get("k");
        store.set("k", json!(2), options()).unwrap();

        let entry = store.peek("k").unwrap();
        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.data, json!(2));
        assert_eq!(store.size_bytes(), 8);
    }

    #[test]
    fn test_access_time_never_precedes_creation() {
        let (store, clock) = store_with(CacheConfig::default());
        store.set("k", json!("v"), options()).unwrap();
        clock.advance(Duration::from_secs(10));

        let entry = store.get("k").unwrap();
        assert!(entry.last_accessed_at >= entry.created_at);
        assert_eq!(entry.idle_time(clock.now()), Duration::ZERO);
    }

    #[test]
    fn test_rejects_invalid_writes() {
        let (store, _) = store_with(CacheConfig::default());

        assert!(matches!(
            store.set("", json!(1), options()),
            Err(CacheError::Validation(_))
        ));

        let mut secure = options();
        secure.is_secure = true;
        assert!(matches!(
            store.set("token", json!("x"), secure),
            Err(CacheError::Validation(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let (store, clock) = store_with(CacheConfig::default());
        store
            .set("session", json!("abc"), options().secure(Duration::from_secs(30)))
            .unwrap();

        assert!(store.get("session").is_some());
        clock.advance(Duration::from_secs(30));
        assert!(store.get("session").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_eviction_skips_referenced_entries() {
        let config = CacheConfig::new()
            .with_max_entries(2)
            .with_eviction_policy(EvictionPolicy::FirstInFirstOut);
        let (store, _) = store_with(config);

        store.retain("a");
        store.set("a", json!(1), options()).unwrap();
        store.set("b", json!(2), options()).unwrap();
        store.set("c", json!(3), options()).unwrap();

        assert_eq!(store.keys(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(store.metrics().evictions, 1);
    }

    #[test]
    fn test_reference_counts_never_go_negative() {
        let (store, _) = store_with(CacheConfig::default());
        store.set("k", json!(1), options()).unwrap();

        assert_eq!(store.retain("k"), 1);
        assert_eq!(store.retain("k"), 2);
        assert_eq!(store.peek("k").unwrap().reference_count, 2);
        assert_eq!(store.release("k"), 1);
        assert_eq!(store.release("k"), 0);
        assert_eq!(store.release("k"), 0);
        assert_eq!(store.peek("k").unwrap().reference_count, 0);
    }

    #[test]
    fn test_invalidation_variants() {
        let (store, _) = store_with(CacheConfig::default());
        for key in ["user:1", "user:2", "post:1", "post:2"] {
            store.set(key, json!(key), options()).unwrap();
        }

        assert!(store.invalidate("post:2"));
        assert!(!store.invalidate("post:2"));

        let mut removed = store.invalidate_with_prefix("user:");
        removed.sort();
        assert_eq!(removed, vec!["user:1".to_string(), "user:2".to_string()]);

        let removed = store.invalidate_where(|_, entry| entry.data == json!("post:1"));
        assert_eq!(removed, vec!["post:1".to_string()]);
        assert!(store.is_empty());
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn test_collect_garbage_respects_references() {
        let (store, clock) = store_with(CacheConfig::default());
        store
            .set("idle", json!(1), SetOptions::new(Duration::ZERO, Duration::from_secs(10)))
            .unwrap();
        store
            .set("held", json!(2), SetOptions::new(Duration::ZERO, Duration::from_secs(10)))
            .unwrap();
        store.retain("held");

        assert_eq!(store.collect_garbage(), 0);
        clock.advance(Duration::from_secs(10));
        assert_eq!(store.collect_garbage(), 1);
        assert_eq!(store.keys(), vec!["held".to_string()]);
    }

    #[tokio::test]
    async fn test_deduplicate_writes_result_before_resolving() {
        let (store, _) = store_with(CacheConfig::default());

        let handle = store
            .deduplicate("k", options(), || async { Ok(json!("fetched")) })
            .unwrap();
        assert!(store.is_fetching("k"));

        assert_eq!(handle.await.unwrap(), json!("fetched"));
        assert_eq!(store.peek("k").unwrap().data, json!("fetched"));
        assert!(!store.is_fetching("k"));
    }

    #[tokio::test]
    async fn test_deduplicate_failure_keeps_previous_value() {
        let (store, _) = store_with(CacheConfig::default());
        store.set("k", json!("good"), options()).unwrap();

        let result = store
            .deduplicate("k", options(), || async { Err(FetchError::server("boom")) })
            .unwrap()
            .await;

        assert_eq!(result, Err(FetchError::server("boom")));
        assert_eq!(store.peek("k").unwrap().data, json!("good"));
        assert!(!store.is_fetching("k"));
    }
}
