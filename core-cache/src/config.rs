//! Cache configuration

use crate::error::{CacheError, Result};
use crate::policy::EvictionPolicy;
use std::time::Duration;

/// Budget and default lifetimes for a [`CacheStore`](crate::CacheStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum estimated size in bytes (default: 50 MiB)
    pub max_cache_size: usize,

    /// Maximum number of entries (default: 1,000)
    pub max_entries: usize,

    /// How long a written entry counts as fresh (default: 0, always stale)
    pub default_stale_time: Duration,

    /// How long an unreferenced entry survives without reads (default: 5 min)
    pub default_cache_time: Duration,

    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 50 * 1024 * 1024,
            max_entries: 1_000,
            default_stale_time: Duration::ZERO,
            default_cache_time: Duration::from_secs(5 * 60),
            eviction_policy: EvictionPolicy::LeastRecentlyUsed,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_cache_size(mut self, bytes: usize) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn with_max_entries(mut self, entries: usize) -> Self {
        self.max_entries = entries;
        self
    }

    pub fn with_default_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    pub fn with_default_cache_time(mut self, cache_time: Duration) -> Self {
        self.default_cache_time = cache_time;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_cache_size == 0 {
            return Err(CacheError::Validation(
                "max_cache_size must be greater than 0".to_string(),
            ));
        }

        if self.max_entries == 0 {
            return Err(CacheError::Validation(
                "max_entries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Write options carrying this config's default lifetimes.
    pub fn default_set_options(&self) -> SetOptions {
        SetOptions::new(self.default_stale_time, self.default_cache_time)
    }
}

/// Per-write options for [`CacheStore::set`](crate::CacheStore::set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOptions {
    pub stale_time: Duration,
    pub cache_time: Duration,
    /// Never persisted; requires `max_age`
    pub is_secure: bool,
    pub max_age: Option<Duration>,
}

impl SetOptions {
    pub fn new(stale_time: Duration, cache_time: Duration) -> Self {
        Self {
            stale_time,
            cache_time,
            is_secure: false,
            max_age: None,
        }
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn secure(mut self, max_age: Duration) -> Self {
        self.is_secure = true;
        self.max_age = Some(max_age);
        self
    }

    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn validate(&self) -> Result<()> {
        match self.max_age {
            Some(max_age) if max_age.is_zero() => Err(CacheError::Validation(
                "max_age must be greater than 0".to_string(),
            )),
            None if self.is_secure => Err(CacheError::Validation(
                "Secure entries must carry a max_age".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
