//! # Core Configuration Module
//!
//! Builder-based configuration for the query cache engine.
//!
//! ## Overview
//!
//! [`CoreConfig`] collects every host capability the engine uses plus the
//! runtime tunables that are not per-cache (disposal delay, memory pressure
//! debounce, event buffer). Validation is fail-fast: a configuration that
//! enables persistence without the bridges persistence needs is rejected at
//! build time with an actionable message.
//!
//! ## Capabilities
//!
//! | Bridge                  | Required when              | Desktop default        |
//! |-------------------------|----------------------------|------------------------|
//! | `KeyValueStore`         | persistence enabled        | `FileKeyValueStore`    |
//! | `SecureStore`           | persistence enabled        | `KeyringSecureStore`   |
//! | `NetworkMonitor`        | never (offline replay off) | none                   |
//! | `MemoryPressureMonitor` | never (manual signals)     | none                   |
//! | `Clock`                 | never                      | `SystemClock`          |
//!
//! Defaults are injected only with the `desktop-shims` feature.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, PersistenceOptions};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = CoreConfig::builder()
//!     .persistence(PersistenceOptions::enabled().with_gc_interval(Duration::from_secs(60)))
//!     .storage(Arc::new(MyStorage))
//!     .secure_store(Arc::new(MyKeychain))
//!     .network_monitor(Arc::new(MyReachability))
//!     .build()?;
//! ```
//!
//! ```ignore
//! // Without desktop-shims there is no storage to fall back on
//! let err = CoreConfig::builder()
//!     .persistence(PersistenceOptions::enabled())
//!     .build()
//!     .unwrap_err();
//! assert!(matches!(err, Error::CapabilityMissing { .. }));
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::{
    Clock, KeyValueStore, MemoryPressureMonitor, NetworkMonitor, SecureStore, SystemClock,
};
use std::sync::Arc;
use std::time::Duration;

/// Default delay between a query losing its last listener and being disposed.
pub const DEFAULT_DISPOSAL_DELAY: Duration = Duration::from_secs(5);

/// Default window in which memory pressure signals collapse into one trim.
pub const DEFAULT_MEMORY_PRESSURE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Encrypted persistence settings
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PersistenceOptions {
    pub enabled: bool,
    /// Hex-encoded 256-bit key. When absent the key is loaded from the
    /// `SecureStore`, or generated and saved there on first use.
    pub encryption_key: Option<String>,
    /// Period of the background garbage-collection sweep. `None` disables it.
    pub gc_interval: Option<Duration>,
}

impl PersistenceOptions {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_encryption_key(mut self, key_hex: impl Into<String>) -> Self {
        self.encryption_key = Some(key_hex.into());
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = Some(interval);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(key) = &self.encryption_key {
            let decoded = hex::decode(key)
                .map_err(|e| Error::Config(format!("Encryption key is not valid hex: {}", e)))?;
            if decoded.len() != 32 {
                return Err(Error::Config(format!(
                    "Encryption key must be 32 bytes (64 hex characters), got {} bytes",
                    decoded.len()
                )));
            }
        }

        if self.gc_interval == Some(Duration::ZERO) {
            return Err(Error::Config(
                "GC interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for PersistenceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceOptions")
            .field("enabled", &self.enabled)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("gc_interval", &self.gc_interval)
            .finish()
    }
}

/// Runtime configuration shared by every component of a query client.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Durable storage for persisted entries and the offline queue
    pub storage: Option<Arc<dyn KeyValueStore>>,

    /// Encryption key storage
    pub secure_store: Option<Arc<dyn SecureStore>>,

    /// Drives offline queue replay. Without it the queue only drains when
    /// asked explicitly.
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    /// Host low-memory notifications
    pub memory_monitor: Option<Arc<dyn MemoryPressureMonitor>>,

    pub clock: Arc<dyn Clock>,

    pub persistence: PersistenceOptions,

    /// Zero disposes queries as soon as the last listener leaves
    pub disposal_delay: Duration,

    pub memory_pressure_debounce: Duration,

    pub event_buffer_size: usize,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("storage", &self.storage.as_ref().map(|_| "KeyValueStore { ... }"))
            .field(
                "secure_store",
                &self.secure_store.as_ref().map(|_| "SecureStore { ... }"),
            )
            .field(
                "network_monitor",
                &self
                    .network_monitor
                    .as_ref()
                    .map(|_| "NetworkMonitor { ... }"),
            )
            .field(
                "memory_monitor",
                &self
                    .memory_monitor
                    .as_ref()
                    .map(|_| "MemoryPressureMonitor { ... }"),
            )
            .field("persistence", &self.persistence)
            .field("disposal_delay", &self.disposal_delay)
            .field("memory_pressure_debounce", &self.memory_pressure_debounce)
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// In-memory configuration with no host bridges, suitable for tests.
    pub fn in_memory() -> Self {
        Self {
            storage: None,
            secure_store: None,
            network_monitor: None,
            memory_monitor: None,
            clock: Arc::new(SystemClock),
            persistence: PersistenceOptions::disabled(),
            disposal_delay: DEFAULT_DISPOSAL_DELAY,
            memory_pressure_debounce: DEFAULT_MEMORY_PRESSURE_DEBOUNCE,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Persistence options are well-formed
    /// - Persistence has both a `KeyValueStore` and a `SecureStore`
    /// - The event buffer can hold at least one event
    pub fn validate(&self) -> Result<()> {
        self.persistence.validate()?;

        if self.persistence.enabled {
            if self.storage.is_none() {
                return Err(storage_missing_error());
            }
            if self.secure_store.is_none() {
                return Err(secure_store_missing_error());
            }
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn storage_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "KeyValueStore".to_string(),
        message: "Persistence is enabled but no KeyValueStore was provided. \
                 Desktop: enable the 'desktop-shims' feature to use FileKeyValueStore. \
                 Mobile: inject sandboxed file or SQLite storage. \
                 Tests: use InMemoryKeyValueStore."
            .to_string(),
    }
}

fn secure_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SecureStore".to_string(),
        message: "Persistence is enabled but no SecureStore was provided for the encryption key. \
                 Desktop: enable the 'desktop-shims' feature to use KeyringSecureStore. \
                 Mobile: inject Keychain/Keystore storage."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_storage() -> Option<Arc<dyn KeyValueStore>> {
    let store: Arc<dyn KeyValueStore> = Arc::new(bridge_desktop::FileKeyValueStore::new());
    Some(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_storage() -> Option<Arc<dyn KeyValueStore>> {
    None
}

#[cfg(feature = "desktop-shims")]
fn provide_default_secure_store() -> Option<Arc<dyn SecureStore>> {
    let store: Arc<dyn SecureStore> = Arc::new(bridge_desktop::KeyringSecureStore::new());
    Some(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_secure_store() -> Option<Arc<dyn SecureStore>> {
    None
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    storage: Option<Arc<dyn KeyValueStore>>,
    secure_store: Option<Arc<dyn SecureStore>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    memory_monitor: Option<Arc<dyn MemoryPressureMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    persistence: PersistenceOptions,
    disposal_delay: Option<Duration>,
    memory_pressure_debounce: Option<Duration>,
    event_buffer_size: Option<usize>,
}

impl CoreConfigBuilder {
    pub fn storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub fn memory_monitor(mut self, monitor: Arc<dyn MemoryPressureMonitor>) -> Self {
        self.memory_monitor = Some(monitor);
        self
    }

    /// Inject a time source. Tests pass a `ManualClock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn persistence(mut self, options: PersistenceOptions) -> Self {
        self.persistence = options;
        self
    }

    pub fn disposal_delay(mut self, delay: Duration) -> Self {
        self.disposal_delay = Some(delay);
        self
    }

    pub fn memory_pressure_debounce(mut self, debounce: Duration) -> Self {
        self.memory_pressure_debounce = Some(debounce);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds the final `CoreConfig`.
    ///
    /// When persistence is enabled and a bridge is missing, the desktop
    /// default is injected (with `desktop-shims`) or
    /// [`Error::CapabilityMissing`] is returned.
    pub fn build(self) -> Result<CoreConfig> {
        let (storage, secure_store) = if self.persistence.enabled {
            (
                self.storage.or_else(provide_default_storage),
                self.secure_store.or_else(provide_default_secure_store),
            )
        } else {
            (self.storage, self.secure_store)
        };

        let config = CoreConfig {
            storage,
            secure_store,
            network_monitor: self.network_monitor,
            memory_monitor: self.memory_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            persistence: self.persistence,
            disposal_delay: self.disposal_delay.unwrap_or(DEFAULT_DISPOSAL_DELAY),
            memory_pressure_debounce: self
                .memory_pressure_debounce
                .unwrap_or(DEFAULT_MEMORY_PRESSURE_DEBOUNCE),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;
        Ok(config)
    }
}
