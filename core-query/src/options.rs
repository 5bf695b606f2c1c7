//! Per-query and per-mutation options

use core_cache::{CacheConfig, FetchError, SetOptions};
use core_runtime::events::EventMeta;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// Options recognized by [`QueryClient::get_query`](crate::QueryClient::get_query).
pub struct QueryOptions<T> {
    /// Disabled queries never fetch and stay `Idle`
    pub enabled: bool,
    /// Falls back to the cache's `default_stale_time`
    pub stale_time: Option<Duration>,
    /// Falls back to the cache's `default_cache_time`
    pub cache_time: Option<Duration>,
    /// Fetch stale or missing data when a listener is added
    pub refetch_on_mount: bool,
    /// Keep the value out of persistence; requires `max_age`
    pub is_secure: bool,
    pub max_age: Option<Duration>,
    pub on_success: Option<SuccessCallback<T>>,
    pub on_error: Option<ErrorCallback>,
    pub meta: EventMeta,
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_time: None,
            cache_time: None,
            refetch_on_mount: true,
            is_secure: false,
            max_age: None,
            on_success: None,
            on_error: None,
            meta: EventMeta::default(),
        }
    }
}

impl<T> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            enabled: self.enabled,
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            refetch_on_mount: self.refetch_on_mount,
            is_secure: self.is_secure,
            max_age: self.max_age,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            meta: self.meta.clone(),
        }
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("is_secure", &self.is_secure)
            .field("max_age", &self.max_age)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("meta", &self.meta)
            .finish()
    }
}

impl<T> QueryOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    pub fn refetch_on_mount(mut self, refetch: bool) -> Self {
        self.refetch_on_mount = refetch;
        self
    }

    pub fn secure(mut self, max_age: Duration) -> Self {
        self.is_secure = true;
        self.max_age = Some(max_age);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&FetchError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn with_meta(mut self, meta: EventMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Cache write options, filling gaps from `defaults`.
    pub fn set_options(&self, defaults: &CacheConfig) -> SetOptions {
        SetOptions {
            stale_time: self.stale_time.unwrap_or(defaults.default_stale_time),
            cache_time: self.cache_time.unwrap_or(defaults.default_cache_time),
            is_secure: self.is_secure,
            max_age: self.max_age,
        }
    }
}

/// Default replay budget for queued mutations.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub type MutateCallback<V> = Arc<dyn Fn(&V) + Send + Sync>;
pub type MutationSuccessCallback<T, V> = Arc<dyn Fn(&T, &V) + Send + Sync>;
pub type MutationErrorCallback<V> = Arc<dyn Fn(&FetchError, &V) + Send + Sync>;
pub type QueuedCallback<V> = Arc<dyn Fn(&V, &str) + Send + Sync>;

/// Options recognized by [`QueryClient::get_mutation`](crate::QueryClient::get_mutation).
pub struct MutationOptions<V, T> {
    /// Hand connectivity failures to the offline queue instead of failing
    pub queue_when_offline: bool,
    /// Replay attempts before a queued item is dropped
    pub max_retries: u32,
    /// Higher priorities replay first
    pub priority: i32,
    /// Runs before the mutation function, typically for optimistic writes
    pub on_mutate: Option<MutateCallback<V>>,
    pub on_success: Option<MutationSuccessCallback<T, V>>,
    pub on_error: Option<MutationErrorCallback<V>>,
    /// Receives the variables and the queue item id
    pub on_queued: Option<QueuedCallback<V>>,
    pub meta: EventMeta,
}

impl<V, T> Default for MutationOptions<V, T> {
    fn default() -> Self {
        Self {
            queue_when_offline: false,
            max_retries: DEFAULT_MAX_RETRIES,
            priority: 0,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_queued: None,
            meta: EventMeta::default(),
        }
    }
}

impl<V, T> Clone for MutationOptions<V, T> {
    fn clone(&self) -> Self {
        Self {
            queue_when_offline: self.queue_when_offline,
            max_retries: self.max_retries,
            priority: self.priority,
            on_mutate: self.on_mutate.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_queued: self.on_queued.clone(),
            meta: self.meta.clone(),
        }
    }
}

impl<V, T> fmt::Debug for MutationOptions<V, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("queue_when_offline", &self.queue_when_offline)
            .field("max_retries", &self.max_retries)
            .field("priority", &self.priority)
            .field("on_mutate", &self.on_mutate.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_queued", &self.on_queued.is_some())
            .field("meta", &self.meta)
            .finish()
    }
}

impl<V, T> MutationOptions<V, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_when_offline(mut self, queue: bool) -> Self {
        self.queue_when_offline = queue;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_mutate(mut self, callback: impl Fn(&V) + Send + Sync + 'static) -> Self {
        self.on_mutate = Some(Arc::new(callback));
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&T, &V) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&FetchError, &V) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_queued(mut self, callback: impl Fn(&V, &str) + Send + Sync + 'static) -> Self {
        self.on_queued = Some(Arc::new(callback));
        self
    }

    pub fn with_meta(mut self, meta: EventMeta) -> Self {
        self.meta = meta;
        self
    }
}
