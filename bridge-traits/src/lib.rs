//! # Host Bridge Traits
//!
//! Platform abstraction traits that the query cache engine depends on.
//!
//! ## Overview
//!
//! The engine never touches the disk, the OS keychain, or the network stack
//! directly. Every such capability is expressed here as a trait and injected at
//! construction time, so hosts (desktop, mobile, tests) can supply their own
//! adapters.
//!
//! ## Traits
//!
//! ### Storage
//! - [`KeyValueStore`](storage::KeyValueStore) - Durable byte storage for persisted cache entries
//! - [`SecureStore`](storage::SecureStore) - Encryption key storage (Keychain/Keystore)
//!
//! ### Platform Signals
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connectivity changes that drive offline replay
//! - [`MemoryPressureMonitor`](memory::MemoryPressureMonitor) - Low-memory notifications
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! The core fails fast with descriptive errors when a required capability is missing:
//!
//! ```ignore
//! use core_runtime::error::Error;
//!
//! let storage = config.storage
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "KeyValueStore".to_string(),
//!         message: "Persistence is enabled but no storage adapter was provided.".to_string(),
//!     })?;
//! ```
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so adapters can be shared across
//! async tasks behind an `Arc`.

pub mod error;
pub mod memory;
pub mod network;
pub mod storage;
pub mod time;

pub use error::BridgeError;

pub use memory::{MemoryPressureLevel, MemoryPressureMonitor, MemoryPressureStream};
pub use network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
pub use storage::{KeyValueStore, SecureStore};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
