//! Encrypted persistence for cache entries
//!
//! Three independent capabilities are combined here:
//! - [`KeyValueStore`] holds ciphertext under `query_cache/<key>`
//! - [`SecureStore`] holds the hex-encoded key (and, during rotation, the
//!   previous one)
//! - [`EncryptionProvider`] encrypts and decrypts
//!
//! Writes and deletes are queued to a single writer task and applied in
//! order, so the cache never waits on storage. Failures are logged, reported
//! as [`CacheEvent::PersistenceFailed`] and otherwise ignored: memory stays
//! authoritative.

pub mod encryption;

pub use encryption::{
    decrypt_payload, encrypt_payload, AesGcmEncryption, EncryptionKey, EncryptionProvider,
    BLOCKING_THRESHOLD_BYTES,
};

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use bridge_traits::{KeyValueStore, SecureStore};
use bytes::Bytes;
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, instrument, warn};

/// Prefix of every persisted record in the `KeyValueStore`.
pub const STORAGE_PREFIX: &str = "query_cache/";

/// `SecureStore` id of the active key.
pub const CURRENT_KEY_ID: &str = "query_cache.encryption_key";

/// `SecureStore` id of the key being rotated away from.
pub const PREVIOUS_KEY_ID: &str = "query_cache.encryption_key.previous";

fn storage_key(key: &str) -> String {
    format!("{}{}", STORAGE_PREFIX, key)
}

/// Cache key of a listed record, `None` for anything outside the prefix.
fn cache_key(storage_key: &str) -> Option<&str> {
    storage_key.strip_prefix(STORAGE_PREFIX)
}

/// Outcome of a successful key rotation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    /// Entries re-encrypted under the new key
    pub rotated: usize,
    /// Entries that could not be re-encrypted and were deleted
    pub dropped: Vec<String>,
}

struct KeyRing {
    current: EncryptionKey,
    /// Still accepted for reads until a rotation has fully landed
    previous: Option<EncryptionKey>,
}

enum PersistCommand {
    Write {
        key: String,
        entry: Box<CacheEntry<Value>>,
    },
    Delete {
        key: String,
    },
    Clear,
    Flush(oneshot::Sender<()>),
}

struct PersistenceCore {
    storage: Arc<dyn KeyValueStore>,
    secure_store: Arc<dyn SecureStore>,
    provider: Arc<dyn EncryptionProvider>,
    keys: RwLock<KeyRing>,
    events: EventBus,
}

/// Handle to the persistence layer. Dropping it stops the writer task once
/// queued operations are applied.
pub struct CachePersistence {
    core: Arc<PersistenceCore>,
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl CachePersistence {
    /// Load or create the encryption key and start the writer task.
    ///
    /// Key precedence: `explicit_key`, then the key in `secure_store`, then a
    /// freshly generated key that is saved to `secure_store`.
    pub async fn open(
        storage: Arc<dyn KeyValueStore>,
        secure_store: Arc<dyn SecureStore>,
        provider: Arc<dyn EncryptionProvider>,
        explicit_key: Option<EncryptionKey>,
        events: EventBus,
    ) -> Result<Self> {
        let current = match explicit_key {
            Some(key) => key,
            None => match load_key(secure_store.as_ref(), CURRENT_KEY_ID).await? {
                Some(key) => {
                    debug!("Loaded persistence key from secure store");
                    key
                }
                None => {
                    let key = provider.generate_key()?;
                    secure_store
                        .set_secret(CURRENT_KEY_ID, key.to_hex().as_bytes())
                        .await
                        .map_err(|e| {
                            CacheError::Persistence(format!("Failed to save new key: {}", e))
                        })?;
                    info!("Generated new persistence key");
                    key
                }
            },
        };

        let previous = match load_key(secure_store.as_ref(), PREVIOUS_KEY_ID).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable previous key");
                None
            }
        };
        if previous.is_some() {
            warn!("Found previous key; an earlier rotation did not complete");
        }

        let core = Arc::new(PersistenceCore {
            storage,
            secure_store,
            provider,
            keys: RwLock::new(KeyRing { current, previous }),
            events,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(Arc::clone(&core), rx));

        Ok(Self { core, tx })
    }

    fn send(&self, command: PersistCommand) {
        if self.tx.send(command).is_err() {
            error!("Persistence writer has stopped; dropping operation");
        }
    }

    /// Queue an encrypted write. Secure entries are refused here as well as
    /// in the store.
    pub fn schedule_write(&self, key: &str, entry: CacheEntry<Value>) {
        if entry.is_secure {
            self.schedule_delete(key);
            return;
        }
        self.send(PersistCommand::Write {
            key: key.to_string(),
            entry: Box::new(entry),
        });
    }

    pub fn schedule_delete(&self, key: &str) {
        self.send(PersistCommand::Delete {
            key: key.to_string(),
        });
    }

    pub fn schedule_clear(&self) {
        self.send(PersistCommand::Clear);
    }

    /// Wait until every operation queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(PersistCommand::Flush(done_tx));
        // A stopped writer has nothing left to apply
        let _ = done_rx.await;
    }

    /// Read and decrypt one entry. Undecodable records are deleted.
    pub async fn load(&self, key: &str) -> Result<Option<CacheEntry<Value>>> {
        let Some(ciphertext) = self.core.storage.read(&storage_key(key)).await? else {
            return Ok(None);
        };

        match self.core.decode(ciphertext).await {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(key, error = %e, "Discarding unreadable persisted entry");
                self.schedule_delete(key);
                Ok(None)
            }
        }
    }

    /// Every persisted entry that can still be decrypted.
    #[instrument(skip(self))]
    pub async fn load_all(&self) -> Result<Vec<(String, CacheEntry<Value>)>> {
        let mut loaded = Vec::new();
        for storage_key in self.core.storage.list_keys(STORAGE_PREFIX).await? {
            let Some(key) = cache_key(&storage_key) else {
                continue;
            };
            if let Some(entry) = self.load(key).await? {
                loaded.push((key.to_string(), entry));
            }
        }
        debug!(count = loaded.len(), "Loaded persisted entries");
        Ok(loaded)
    }

    /// Keys of every persisted record.
    pub async fn persisted_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .core
            .storage
            .list_keys(STORAGE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|k| cache_key(&k).map(str::to_string))
            .collect())
    }

    /// Re-encrypt every persisted entry under `new_key`.
    ///
    /// All re-encryption is staged in memory first. The new key is then
    /// saved (with the old key kept as "previous"); if either key write
    /// fails the rotation is abandoned, the old key stays active and no
    /// record has been touched. Entries that cannot be decrypted or
    /// re-encrypted are deleted and listed in the report.
    #[instrument(skip(self, new_key))]
    pub async fn rotate_key(&self, new_key: EncryptionKey) -> Result<RotationReport> {
        self.flush().await;
        let mut ring = self.core.keys.write().await;
        let old_key = ring.current.clone();

        let mut staged: Vec<(String, Bytes)> = Vec::new();
        let mut dropped: Vec<String> = Vec::new();

        for storage_key in self.core.storage.list_keys(STORAGE_PREFIX).await? {
            let Some(key) = cache_key(&storage_key).map(str::to_string) else {
                continue;
            };
            match self.core.reencrypt(&ring, &storage_key, &new_key).await {
                Ok(Some(ciphertext)) => staged.push((storage_key, ciphertext)),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Entry cannot be re-encrypted; dropping");
                    dropped.push(key);
                }
            }
        }

        if let Err(e) = self
            .core
            .secure_store
            .set_secret(PREVIOUS_KEY_ID, old_key.to_hex().as_bytes())
            .await
        {
            error!(error = %e, "Failed to stash previous key; rotation abandoned");
            return Err(CacheError::Persistence(format!(
                "Key storage write failed: {}",
                e
            )));
        }

        if let Err(e) = self
            .core
            .secure_store
            .set_secret(CURRENT_KEY_ID, new_key.to_hex().as_bytes())
            .await
        {
            error!(error = %e, "Failed to save new key; rotation rolled back");
            if ring.previous.is_none() {
                if let Err(cleanup) = self.core.secure_store.delete_secret(PREVIOUS_KEY_ID).await {
                    warn!(error = %cleanup, "Failed to remove stashed previous key");
                }
            }
            return Err(CacheError::Persistence(format!(
                "Key storage write failed: {}",
                e
            )));
        }

        ring.previous = Some(old_key);
        ring.current = new_key;

        let mut complete = true;
        let mut rotated = 0usize;
        for (storage_key, ciphertext) in staged {
            match self.core.storage.write(&storage_key, ciphertext).await {
                Ok(()) => rotated += 1,
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "Failed to write re-encrypted entry");
                    if let Some(key) = cache_key(&storage_key) {
                        dropped.push(key.to_string());
                    }
                }
            }
        }

        for key in &dropped {
            if let Err(e) = self.core.storage.delete(&storage_key(key)).await {
                warn!(key = %key, error = %e, "Failed to delete dropped entry");
                complete = false;
            }
        }

        if complete {
            match self.core.secure_store.delete_secret(PREVIOUS_KEY_ID).await {
                Ok(()) => ring.previous = None,
                Err(e) => warn!(error = %e, "Failed to remove previous key after rotation"),
            }
        }

        dropped.sort();
        dropped.dedup();
        info!(rotated, dropped = dropped.len(), "Encryption key rotated");
        self.core.emit(CacheEvent::KeyRotated {
            rotated,
            dropped: dropped.clone(),
        });

        Ok(RotationReport { rotated, dropped })
    }

    /// Whether a previous key is still held for reads.
    pub async fn has_previous_key(&self) -> bool {
        self.core.keys.read().await.previous.is_some()
    }
}

async fn load_key(store: &dyn SecureStore, id: &str) -> Result<Option<EncryptionKey>> {
    let Some(raw) = store
        .get_secret(id)
        .await
        .map_err(|e| CacheError::Persistence(format!("Failed to read key {}: {}", id, e)))?
    else {
        return Ok(None);
    };
    let hex = String::from_utf8(raw)
        .map_err(|_| CacheError::Encryption(format!("Stored key {} is not UTF-8", id)))?;
    EncryptionKey::from_hex(&hex).map(Some)
}

impl PersistenceCore {
    fn emit(&self, event: CacheEvent) {
        let _ = self.events.emit(CoreEvent::Cache(event));
    }

    async fn encode(&self, entry: &CacheEntry<Value>) -> Result<Bytes> {
        let plaintext = serde_json::to_vec(entry)?;
        let key = self.keys.read().await.current.clone();
        encrypt_payload(Arc::clone(&self.provider), key, plaintext).await
    }

    async fn decode(&self, ciphertext: Bytes) -> Result<CacheEntry<Value>> {
        let (current, previous) = {
            let ring = self.keys.read().await;
            (ring.current.clone(), ring.previous.clone())
        };
        self.decode_with(ciphertext, current, previous).await
    }

    async fn decode_with(
        &self,
        ciphertext: Bytes,
        current: EncryptionKey,
        previous: Option<EncryptionKey>,
    ) -> Result<CacheEntry<Value>> {
        let plaintext =
            match decrypt_payload(Arc::clone(&self.provider), current, ciphertext.clone()).await {
                Ok(plaintext) => plaintext,
                Err(e) => match previous {
                    Some(previous) => {
                        decrypt_payload(Arc::clone(&self.provider), previous, ciphertext).await?
                    }
                    None => return Err(e),
                },
            };
        let mut entry: CacheEntry<Value> = serde_json::from_slice(&plaintext)?;
        entry.size_bytes = crate::size::estimate_size(&entry.data);
        Ok(entry)
    }

    /// `Ok(None)` when the record vanished while rotating.
    async fn reencrypt(
        &self,
        ring: &KeyRing,
        storage_key: &str,
        new_key: &EncryptionKey,
    ) -> Result<Option<Bytes>> {
        let Some(ciphertext) = self.storage.read(storage_key).await? else {
            return Ok(None);
        };
        let entry = self
            .decode_with(ciphertext, ring.current.clone(), ring.previous.clone())
            .await?;
        let plaintext = serde_json::to_vec(&entry)?;
        encrypt_payload(Arc::clone(&self.provider), new_key.clone(), plaintext)
            .await
            .map(Some)
    }

    async fn apply(&self, command: PersistCommand) {
        match command {
            PersistCommand::Write { key, entry } => {
                let result = match self.encode(&entry).await {
                    Ok(ciphertext) => self
                        .storage
                        .write(&storage_key(&key), ciphertext)
                        .await
                        .map_err(CacheError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(key = %key, error = %e, "Persisting cache entry failed");
                    self.emit(CacheEvent::PersistenceFailed {
                        key,
                        message: e.to_string(),
                    });
                }
            }
            PersistCommand::Delete { key } => {
                if let Err(e) = self.storage.delete(&storage_key(&key)).await {
                    warn!(key = %key, error = %e, "Deleting persisted entry failed");
                    self.emit(CacheEvent::PersistenceFailed {
                        key,
                        message: e.to_string(),
                    });
                }
            }
            PersistCommand::Clear => {
                if let Err(e) = self.storage.clear_prefix(STORAGE_PREFIX).await {
                    warn!(error = %e, "Clearing persisted entries failed");
                    self.emit(CacheEvent::PersistenceFailed {
                        key: STORAGE_PREFIX.to_string(),
                        message: e.to_string(),
                    });
                }
            }
            PersistCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn run_writer(core: Arc<PersistenceCore>, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
    while let Some(command) = rx.recv().await {
        core.apply(command).await;
    }
    debug!("Persistence writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_desktop::{InMemoryKeyValueStore, InMemorySecureStore};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn entry(data: Value) -> CacheEntry<Value> {
        CacheEntry::new(data, Utc::now(), Duration::from_secs(60), Duration::from_secs(60), false, None)
    }

    async fn open(
        storage: Arc<InMemoryKeyValueStore>,
        keys: Arc<InMemorySecureStore>,
    ) -> CachePersistence {
        CachePersistence::open(storage, keys, Arc::new(AesGcmEncryption), None, EventBus::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_generates_and_reuses_key() {
        let storage = Arc::new(InMemoryKeyValueStore::new());
        let keys = Arc::new(InMemorySecureStore::new());

        let first = open(storage.clone(), keys.clone()).await;
        first.schedule_write("user:1", entry(json!("alice")));
        first.flush().await;
        assert!(keys.has_secret(CURRENT_KEY_ID).await.unwrap());
        drop(first);

        // Reopening picks up the stored key and can read the record
        let second = open(storage.clone(), keys).await;
        let loaded = second.load("user:1").await.unwrap().unwrap();
        assert_eq!(loaded.data, json!("alice"));
        assert_eq!(loaded.size_bytes, 5);
    }

    #[tokio::test]
    async fn test_records_are_ciphertext() {
        let storage = Arc::new(InMemoryKeyValueStore::new());
        let persistence = open(storage.clone(), Arc::new(InMemorySecureStore::new())).await;

        persistence.schedule_write("user:1", entry(json!("alice-secret-name")));
        persistence.flush().await;

        let raw = storage.read("query_cache/user:1").await.unwrap().unwrap();
        assert!(!raw.windows(5).any(|w| w == b"alice"));
    }

    #[tokio::test]
    async fn test_secure_entries_are_never_written() {
        let storage = Arc::new(InMemoryKeyValueStore::new());
        let persistence = open(storage.clone(), Arc::new(InMemorySecureStore::new())).await;

        let mut secure = entry(json!("token"));
        secure.is_secure = true;
        secure.max_age = Some(Duration::from_secs(30));
        persistence.schedule_write("session", secure);
        persistence.flush().await;

        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_emits_event() {
        let storage = Arc::new(InMemoryKeyValueStore::new());
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let persistence = CachePersistence::open(
            storage.clone(),
            Arc::new(InMemorySecureStore::new()),
            Arc::new(AesGcmEncryption),
            None,
            events,
        )
        .await
        .unwrap();

        storage.set_fail_writes(true);
        persistence.schedule_write("user:1", entry(json!(1)));
        persistence.flush().await;

        match rx.recv().await.unwrap() {
            CoreEvent::Cache(CacheEvent::PersistenceFailed { key, .. }) => assert_eq!(key, "user:1"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecryptable_records_are_discarded() {
        let storage = Arc::new(InMemoryKeyValueStore::new());
        storage
            .write("query_cache/junk", Bytes::from_static(b"not ciphertext at all, clearly"))
            .await
            .unwrap();
        let persistence = open(storage.clone(), Arc::new(InMemorySecureStore::new())).await;

        assert!(persistence.load_all().await.unwrap().is_empty());
        persistence.flush().await;
        assert!(!storage.contains_key("query_cache/junk"));
    }

    #[tokio::test]
    async fn test_rotation_reencrypts_everything() {
        let storage = Arc::new(InMemoryKeyValueStore::new());
        let keys = Arc::new(InMemorySecureStore::new());
        let persistence = open(storage.clone(), keys.clone()).await;

        persistence.schedule_write("a", entry(json!("one")));
        persistence.schedule_write("b", entry(json!("two")));

        let new_key = AesGcmEncryption.generate_key().unwrap();
        let report = persistence.rotate_key(new_key.clone()).await.unwrap();
        assert_eq!(report.rotated, 2);
        assert!(report.dropped.is_empty());
        assert!(!persistence.has_previous_key().await);
        assert!(!keys.has_secret(PREVIOUS_KEY_ID).await.unwrap());

        let raw = storage.read("query_cache/a").await.unwrap().unwrap();
        let plaintext = AesGcmEncryption.decrypt(&new_key, &raw).unwrap();
        let restored: CacheEntry<Value> = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(restored.data, json!("one"));
    }

    #[tokio::test]
    async fn test_rotation_drops_and_reports_corrupt_records() {
        let storage = Arc::new(InMemoryKeyValueStore::new());
        let persistence = open(storage.clone(), Arc::new(InMemorySecureStore::new())).await;

        persistence.schedule_write("good", entry(json!("ok")));
        persistence.flush().await;
        storage
            .write("query_cache/bad", Bytes::from(vec![7u8; 64]))
            .await
            .unwrap();

        let report = persistence
            .rotate_key(AesGcmEncryption.generate_key().unwrap())
            .await
            .unwrap();

        assert_eq!(report.rotated, 1);
        assert_eq!(report.dropped, vec!["bad".to_string()]);
        assert!(!storage.contains_key("query_cache/bad"));
        assert!(persistence.load("good").await.unwrap().is_some());
    }

    /// Storage whose listing ignores the prefix filter.
    struct UnfilteredListing(Arc<InMemoryKeyValueStore>);

    #[async_trait::async_trait]
    impl KeyValueStore for UnfilteredListing {
        async fn read(&self, key: &str) -> bridge_traits::error::Result<Option<Bytes>> {
            self.0.read(key).await
        }

        async fn write(&self, key: &str, value: Bytes) -> bridge_traits::error::Result<()> {
            self.0.write(key, value).await
        }

        async fn delete(&self, key: &str) -> bridge_traits::error::Result<()> {
            self.0.delete(key).await
        }

        async fn list_keys(&self, _prefix: &str) -> bridge_traits::error::Result<Vec<String>> {
            self.0.list_keys("").await
        }
    }

    #[tokio::test]
    async fn test_foreign_records_are_ignored() {
        let inner = Arc::new(InMemoryKeyValueStore::new());
        inner
            .write("settings/theme", Bytes::from_static(b"dark"))
            .await
            .unwrap();
        let persistence = CachePersistence::open(
            Arc::new(UnfilteredListing(inner.clone())),
            Arc::new(InMemorySecureStore::new()),
            Arc::new(AesGcmEncryption),
            None,
            EventBus::default(),
        )
        .await
        .unwrap();

        persistence.schedule_write("user:1", entry(json!("alice")));
        persistence.flush().await;

        assert_eq!(persistence.persisted_keys().await.unwrap(), vec!["user:1".to_string()]);
        let loaded = persistence.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "user:1");

        let report = persistence
            .rotate_key(AesGcmEncryption.generate_key().unwrap())
            .await
            .unwrap();
        assert_eq!(report.rotated, 1);
        assert!(report.dropped.is_empty());
        assert!(inner.contains_key("settings/theme"));
    }
}
