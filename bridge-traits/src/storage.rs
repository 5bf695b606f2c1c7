//! Storage Abstractions
//!
//! Durable byte storage for persisted cache entries and secure storage for the
//! key material that protects them. The two are kept separate so that the data
//! store never sees an encryption key.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Durable key-value byte storage
///
/// Backs the persistence layer of the cache:
/// - Desktop: one file per key under the application data directory
/// - iOS/Android: app sandbox files or SQLite
/// - Web: IndexedDB
///
/// Values are opaque to the store. The cache only ever writes ciphertext.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::KeyValueStore;
///
/// async fn persist(store: &dyn KeyValueStore, payload: Vec<u8>) -> Result<()> {
///     store.write("query_cache/user:1", payload.into()).await
/// }
/// ```
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    ///
    /// Returns `Ok(None)` if the key doesn't exist.
    async fn read(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write `value` under `key`, replacing any previous value
    async fn write(&self, key: &str, value: Bytes) -> Result<()>;

    /// Delete the value stored under `key`
    ///
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List every stored key starting with `prefix`
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete every stored key starting with `prefix`
    async fn clear_prefix(&self, prefix: &str) -> Result<()> {
        for key in self.list_keys(prefix).await? {
            self.delete(&key).await?;
        }
        Ok(())
    }
}

/// Secure credential storage trait
///
/// Abstracts secure storage mechanisms:
/// - macOS/iOS: Keychain
/// - Android: Keystore (hardware-backed when available)
/// - Windows: Credential Manager
/// - Linux: Secret Service / libsecret
///
/// # Security Requirements
///
/// Implementations MUST:
/// - Encrypt data at rest
/// - Use platform-provided secure storage when available
/// - Never log or expose sensitive data
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::SecureStore;
///
/// async fn store_key(store: &dyn SecureStore, key_hex: &str) -> Result<()> {
///     store.set_secret("query_cache.encryption_key", key_hex.as_bytes()).await
/// }
/// ```
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Store a secret value
    ///
    /// Previous value is replaced if it exists.
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Retrieve a secret value
    ///
    /// Returns `Ok(None)` if the key doesn't exist. Returned data must not
    /// be logged.
    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a secret
    async fn delete_secret(&self, key: &str) -> Result<()>;

    /// Check if a secret exists without retrieving it
    async fn has_secret(&self, key: &str) -> Result<bool> {
        Ok(self.get_secret(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    struct MapStore(Mutex<BTreeMap<String, Bytes>>);

    #[async_trait]
    impl KeyValueStore for MapStore {
        async fn read(&self, key: &str) -> Result<Option<Bytes>> {
            Ok(self.0.lock().get(key).cloned())
        }

        async fn write(&self, key: &str, value: Bytes) -> Result<()> {
            self.0.lock().insert(key.to_string(), value);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.0.lock().remove(key);
            Ok(())
        }

        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .0
                .lock()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn test_clear_prefix_only_touches_matching_keys() {
        let store = MapStore(Mutex::new(BTreeMap::new()));
        store.write("cache/a", Bytes::from_static(b"1")).await.unwrap();
        store.write("cache/b", Bytes::from_static(b"2")).await.unwrap();
        store.write("queue/a", Bytes::from_static(b"3")).await.unwrap();

        store.clear_prefix("cache/").await.unwrap();

        assert!(store.list_keys("cache/").await.unwrap().is_empty());
        assert_eq!(store.list_keys("queue/").await.unwrap(), vec!["queue/a"]);
    }
}
