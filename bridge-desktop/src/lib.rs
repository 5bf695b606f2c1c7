//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux), plus in-memory adapters used by tests and by
//! hosts that do not want anything written to disk.
//!
//! - `KeyValueStore` using `tokio::fs` ([`FileKeyValueStore`]) or a map ([`InMemoryKeyValueStore`])
//! - `SecureStore` using the `keyring` crate ([`KeyringSecureStore`]) or a map ([`InMemorySecureStore`])
//! - `NetworkMonitor` using a TCP reachability probe ([`DesktopNetworkMonitor`])
//!   or driven by hand ([`ManualNetworkMonitor`])
//! - `MemoryPressureMonitor` driven by hand ([`ManualMemoryPressureMonitor`]);
//!   desktop operating systems do not deliver low-memory notifications to
//!   ordinary processes
//!
//! ## Feature Flags
//!
//! - `secure-store`: Enable OS keychain integration (default)
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{FileKeyValueStore, KeyringSecureStore};
//! use std::sync::Arc;
//!
//! let storage = Arc::new(FileKeyValueStore::new());
//! let keys = Arc::new(KeyringSecureStore::new());
//! ```

mod filesystem;
mod memory;
mod network;
mod pressure;

#[cfg(feature = "secure-store")]
mod secure_store;

pub use filesystem::FileKeyValueStore;
pub use memory::{InMemoryKeyValueStore, InMemorySecureStore};
pub use network::{DesktopNetworkMonitor, ManualNetworkMonitor};
pub use pressure::ManualMemoryPressureMonitor;

#[cfg(feature = "secure-store")]
pub use secure_store::KeyringSecureStore;
