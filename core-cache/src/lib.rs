//! # Core Cache
//!
//! Keyed in-memory cache engine with staleness tracking, budget-driven
//! eviction, request deduplication and optional encrypted persistence.
//!
//! ## Overview
//!
//! - [`CacheStore`] owns all [`CacheEntry`] values and is the only way to
//!   read or change them
//! - [`EvictionPolicy`] picks victims when the store is over budget
//! - [`CachePersistence`] mirrors non-secure entries into a
//!   `KeyValueStore`, encrypted with AES-256-GCM
//! - [`MemoryPressureHandler`] trims stores on host low-memory signals
//!
//! ## Usage
//!
//! ```ignore
//! use core_cache::{CacheConfig, CacheStore, SetOptions};
//! use std::time::Duration;
//!
//! let store = CacheStore::new(CacheConfig::default(), clock, events)?;
//! store.set("user:1", json!("alice"), SetOptions::new(Duration::from_secs(300), Duration::from_secs(600)))?;
//!
//! let entry = store.get("user:1").unwrap();
//! assert!(!entry.is_stale(clock.now()));
//! ```

pub mod config;
pub mod entry;
pub mod error;
pub mod fetch;
pub mod memory_pressure;
pub mod metrics;
pub mod persistence;
pub mod policy;
pub mod size;
pub mod store;

pub use config::{CacheConfig, SetOptions};
pub use entry::{validate_key, CacheEntry};
pub use error::{CacheError, Result};
pub use fetch::{FetchError, FetchErrorKind};
pub use memory_pressure::MemoryPressureHandler;
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use persistence::{
    AesGcmEncryption, CachePersistence, EncryptionKey, EncryptionProvider, RotationReport,
};
pub use policy::EvictionPolicy;
pub use size::estimate_size;
pub use store::{CacheInfo, CacheStore, SharedFetch, WeakCacheStore};
