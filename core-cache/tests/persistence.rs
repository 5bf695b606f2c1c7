//! Encrypted persistence wired through the store

use async_trait::async_trait;
use bridge_desktop::{InMemoryKeyValueStore, InMemorySecureStore};
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::{KeyValueStore, ManualClock, SecureStore};
use bytes::Bytes;
use chrono::Utc;
use core_cache::persistence::{CURRENT_KEY_ID, PREVIOUS_KEY_ID};
use core_cache::{
    AesGcmEncryption, CacheConfig, CacheError, CachePersistence, CacheStore, EncryptionProvider,
    SetOptions,
};
use core_runtime::events::EventBus;
use mockall::mock;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub KeyStore {}

    #[async_trait]
    impl SecureStore for KeyStore {
        async fn set_secret(&self, key: &str, value: &[u8]) -> BridgeResult<()>;
        async fn get_secret(&self, key: &str) -> BridgeResult<Option<Vec<u8>>>;
        async fn delete_secret(&self, key: &str) -> BridgeResult<()>;
    }
}

fn options() -> SetOptions {
    SetOptions::new(Duration::from_secs(300), Duration::from_secs(600))
}

async fn persistent_store(
    storage: Arc<dyn KeyValueStore>,
    keys: Arc<dyn SecureStore>,
) -> CacheStore {
    let events = EventBus::default();
    let persistence =
        CachePersistence::open(storage, keys, Arc::new(AesGcmEncryption), None, events.clone())
            .await
            .unwrap();
    let store = CacheStore::new(
        CacheConfig::default(),
        Arc::new(ManualClock::new(Utc::now())),
        events,
    )
    .unwrap();
    store.attach_persistence(Arc::new(persistence)).unwrap();
    store
}

#[tokio::test]
async fn secure_entries_never_reach_storage() {
    let storage = Arc::new(InMemoryKeyValueStore::new());
    let store = persistent_store(storage.clone(), Arc::new(InMemorySecureStore::new())).await;

    store.set("profile", json!({"name": "alice"}), options()).unwrap();
    store
        .set("token", json!("bearer abc"), options().secure(Duration::from_secs(60)))
        .unwrap();
    store.flush().await;

    assert!(storage.contains_key("query_cache/profile"));
    assert!(!storage.contains_key("query_cache/token"));

    // Overwriting a persisted key with a secure value removes the old copy
    store
        .set("profile", json!("now secret"), options().secure(Duration::from_secs(60)))
        .unwrap();
    store.flush().await;
    assert!(storage.is_empty());
}

#[tokio::test]
async fn large_payloads_survive_a_restart() {
    let storage = Arc::new(InMemoryKeyValueStore::new());
    let keys = Arc::new(InMemorySecureStore::new());
    let big = "x".repeat(60 * 1024);

    let first = persistent_store(storage.clone(), keys.clone()).await;
    first.set("blob", json!(big), options()).unwrap();
    first.flush().await;
    drop(first);

    let second = persistent_store(storage, keys).await;
    assert!(second.get("blob").is_none());
    let restored = second.restore("blob").await.unwrap().unwrap();
    assert_eq!(restored.data, json!(big));
    assert_eq!(restored.size_bytes, 60 * 1024);
}

#[tokio::test]
async fn hydrate_loads_everything_persisted() {
    let storage = Arc::new(InMemoryKeyValueStore::new());
    let keys = Arc::new(InMemorySecureStore::new());

    let first = persistent_store(storage.clone(), keys.clone()).await;
    first.set("a", json!(1), options()).unwrap();
    first.set("b", json!(2), options()).unwrap();
    first.remove("a");
    first.flush().await;

    let second = persistent_store(storage, keys).await;
    assert_eq!(second.hydrate().await.unwrap(), 1);
    assert_eq!(second.keys(), vec!["b"]);
}

#[tokio::test]
async fn trimmed_entries_stay_restorable() {
    let storage = Arc::new(InMemoryKeyValueStore::new());
    let store = persistent_store(storage.clone(), Arc::new(InMemorySecureStore::new())).await;

    store.set("a", json!("kept on disk"), options()).unwrap();
    store.trim(true);
    store.flush().await;

    assert!(store.is_empty());
    assert!(storage.contains_key("query_cache/a"));
    assert_eq!(
        store.restore("a").await.unwrap().unwrap().data,
        json!("kept on disk")
    );
}

#[tokio::test]
async fn rotation_reports_dropped_entries() {
    let storage = Arc::new(InMemoryKeyValueStore::new());
    let store = persistent_store(storage.clone(), Arc::new(InMemorySecureStore::new())).await;

    store.set("a", json!("one"), options()).unwrap();
    store.set("b", json!("two"), options()).unwrap();
    store.flush().await;
    storage
        .write("query_cache/corrupt", Bytes::from(vec![0u8; 48]))
        .await
        .unwrap();

    let report = store
        .update_encryption_key(AesGcmEncryption.generate_key().unwrap())
        .await
        .unwrap();

    assert_eq!(report.rotated, 2);
    assert_eq!(report.dropped, vec!["corrupt"]);
    assert_eq!(storage.len(), 2);

    store.trim(true);
    assert_eq!(store.restore("b").await.unwrap().unwrap().data, json!("two"));
}

#[tokio::test]
async fn rotation_without_persistence_is_rejected() {
    let store = CacheStore::new(
        CacheConfig::default(),
        Arc::new(ManualClock::new(Utc::now())),
        EventBus::default(),
    )
    .unwrap();

    let result = store
        .update_encryption_key(AesGcmEncryption.generate_key().unwrap())
        .await;
    assert!(matches!(result, Err(CacheError::Validation(_))));
}

#[tokio::test]
async fn failed_key_write_rolls_rotation_back() {
    let secrets: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::default();
    let fail_current = Arc::new(AtomicBool::new(false));

    let mut keys = MockKeyStore::new();
    {
        let secrets = Arc::clone(&secrets);
        keys.expect_get_secret()
            .returning(move |key| Ok(secrets.lock().get(key).cloned()));
    }
    {
        let secrets = Arc::clone(&secrets);
        let fail_current = Arc::clone(&fail_current);
        keys.expect_set_secret().returning(move |key, value| {
            if fail_current.load(Ordering::SeqCst) && key == CURRENT_KEY_ID {
                return Err(BridgeError::OperationFailed("keychain locked".to_string()));
            }
            secrets.lock().insert(key.to_string(), value.to_vec());
            Ok(())
        });
    }
    {
        let secrets = Arc::clone(&secrets);
        keys.expect_delete_secret().returning(move |key| {
            secrets.lock().remove(key);
            Ok(())
        });
    }

    let storage = Arc::new(InMemoryKeyValueStore::new());
    let store = persistent_store(storage.clone(), Arc::new(keys)).await;
    store.set("a", json!("one"), options()).unwrap();
    store.set("b", json!("two"), options()).unwrap();
    store.flush().await;

    let key_before = secrets.lock().get(CURRENT_KEY_ID).cloned().unwrap();
    let a_before = storage.read("query_cache/a").await.unwrap().unwrap();

    fail_current.store(true, Ordering::SeqCst);
    let result = store
        .update_encryption_key(AesGcmEncryption.generate_key().unwrap())
        .await;
    assert!(matches!(result, Err(CacheError::Persistence(_))));

    // Key state and persisted bytes are untouched
    assert_eq!(secrets.lock().get(CURRENT_KEY_ID), Some(&key_before));
    assert!(!secrets.lock().contains_key(PREVIOUS_KEY_ID));
    assert_eq!(storage.read("query_cache/a").await.unwrap().unwrap(), a_before);

    // And the old key still decrypts them
    store.trim(true);
    assert_eq!(store.restore("a").await.unwrap().unwrap().data, json!("one"));
}

#[tokio::test]
async fn read_through_counts_as_one_lookup() {
    let storage = Arc::new(InMemoryKeyValueStore::new());
    let keys = Arc::new(InMemorySecureStore::new());

    let first = persistent_store(storage.clone(), keys.clone()).await;
    first.set("profile", json!("alice"), options()).unwrap();
    first.flush().await;
    drop(first);

    let second = persistent_store(storage, keys).await;
    let restored = second.restore("profile").await.unwrap().unwrap();
    assert_eq!(restored.data, json!("alice"));
    assert_eq!(restored.access_count, 2);

    let metrics = second.metrics();
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.hits, 0);

    // Served from memory from now on
    second.restore("profile").await.unwrap();
    assert_eq!(second.metrics().hits, 1);
}
