//! Store behavior under concurrency, budgets and a simulated clock

use bridge_traits::{Clock, ManualClock};
use chrono::Utc;
use core_cache::{CacheConfig, CacheError, CacheStore, EvictionPolicy, FetchError, SetOptions};
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use futures::future::join_all;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn store(config: CacheConfig) -> (CacheStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = CacheStore::new(config, clock.clone(), EventBus::default()).unwrap();
    (store, clock)
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_fetch() {
    let (store, _) = store(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let callers = (0..16).map(|_| {
        let store = store.clone();
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            let handle = store
                .deduplicate("user:1", SetOptions::new(minutes(5), minutes(10)), move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!("alice"))
                    }
                })
                .unwrap();
            handle.await
        })
    });

    let results = join_all(callers).await;
    for result in results {
        assert_eq!(result.unwrap(), Ok(json!("alice")));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!store.is_fetching("user:1"));
}

#[tokio::test]
async fn registration_is_cleared_after_failure() {
    let (store, _) = store(CacheConfig::default());
    let options = SetOptions::new(minutes(5), minutes(10));

    let first = store
        .deduplicate("k", options, || async { Err(FetchError::network("offline")) })
        .unwrap();
    assert!(first.await.unwrap_err().is_connectivity());

    // A new call starts a fresh fetch instead of replaying the failure
    let second = store
        .deduplicate("k", options, || async { Ok(json!(42)) })
        .unwrap();
    assert_eq!(second.await, Ok(json!(42)));
}

#[test]
fn entry_goes_stale_after_stale_time() {
    let (store, clock) = store(CacheConfig::default());
    store
        .set("user:1", json!("alice"), SetOptions::new(minutes(5), minutes(10)))
        .unwrap();

    let entry = store.get("user:1").unwrap();
    assert_eq!(entry.data, json!("alice"));
    assert!(!entry.is_stale(clock.now()));

    clock.advance(minutes(5));
    let entry = store.get("user:1").unwrap();
    assert_eq!(entry.data, json!("alice"));
    assert!(entry.is_stale(clock.now()));
    assert_eq!(entry.is_fresh(clock.now()), !entry.is_stale(clock.now()));
}

#[test]
fn lru_evicts_least_recently_read() {
    let config = CacheConfig::new().with_max_entries(3);
    let (store, _) = store(config);
    let options = SetOptions::new(minutes(5), minutes(10));

    store.set("A", json!(1), options).unwrap();
    store.set("B", json!(2), options).unwrap();
    store.set("C", json!(3), options).unwrap();
    store.get("A");

    store.set("D", json!(4), options).unwrap();
    assert!(!store.contains_key("B"));
    assert!(store.contains_key("C"));

    store.set("E", json!(5), options).unwrap();
    assert!(!store.contains_key("C"));
    assert_eq!(store.keys(), vec!["A", "D", "E"]);
}

#[test]
fn referenced_entries_survive_every_policy() {
    for policy in [
        EvictionPolicy::LeastRecentlyUsed,
        EvictionPolicy::LeastFrequentlyUsed,
        EvictionPolicy::FirstInFirstOut,
    ] {
        let (store, _) = store(CacheConfig::new().with_max_entries(2).with_eviction_policy(policy));
        let options = SetOptions::new(minutes(5), minutes(10));

        store.set("pinned", json!(0), options).unwrap();
        store.retain("pinned");
        for i in 0..10 {
            store.set(&format!("k{}", i), json!(i), options).unwrap();
        }

        assert!(store.contains_key("pinned"), "{:?} evicted a referenced entry", policy);
        assert_eq!(store.len(), 2);
    }
}

#[test]
fn size_budget_is_enforced() {
    let (store, _) = store(CacheConfig::new().with_max_cache_size(100));
    let options = SetOptions::new(minutes(5), minutes(10));

    for i in 0..20 {
        let value = format!("{:0>40}", i);
        store.set(&format!("item:{}", i), json!(value), options).unwrap();
    }

    let info = store.info();
    assert!(info.entry_count < 20);
    assert!(info.size_bytes <= 100);
    assert_eq!(info.metrics.evictions as usize, 20 - info.entry_count);
}

#[test]
fn value_larger_than_the_cache_is_rejected() {
    let (store, _) = store(CacheConfig::new().with_max_cache_size(100));
    let options = SetOptions::new(minutes(5), minutes(10));

    store.set("small", json!("s".repeat(40)), options).unwrap();
    let result = store.set("big", json!("b".repeat(200)), options);

    assert!(matches!(result, Err(CacheError::Validation(_))));
    assert_eq!(store.keys(), vec!["small"]);
    assert_eq!(store.size_bytes(), 40);
    assert_eq!(store.metrics().evictions, 0);

    // A value that fills the budget exactly still fits
    store.set("exact", json!("e".repeat(100)), options).unwrap();
    assert_eq!(store.keys(), vec!["exact"]);
    assert!(store.size_bytes() <= 100);
}

#[test]
fn trim_respects_staleness_unless_critical() {
    let (store, clock) = store(CacheConfig::default());

    store
        .set("stale", json!(1), SetOptions::new(Duration::from_secs(1), minutes(10)))
        .unwrap();
    store
        .set("fresh", json!(2), SetOptions::new(minutes(5), minutes(10)))
        .unwrap();
    store
        .set("active", json!(3), SetOptions::new(Duration::ZERO, minutes(10)))
        .unwrap();
    store.retain("active");
    clock.advance(Duration::from_secs(2));

    assert_eq!(store.trim(false), 1);
    assert_eq!(store.keys(), vec!["active", "fresh"]);

    assert_eq!(store.trim(true), 1);
    assert_eq!(store.keys(), vec!["active"]);
}

#[test]
fn eviction_is_reported_on_the_event_bus() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = CacheStore::new(
        CacheConfig::new()
            .with_max_entries(1)
            .with_eviction_policy(EvictionPolicy::FirstInFirstOut),
        clock,
        events,
    )
    .unwrap();

    let options = SetOptions::new(minutes(5), minutes(10));
    store.set("old", json!(1), options).unwrap();
    store.set("new", json!(2), options).unwrap();

    match rx.try_recv().unwrap() {
        CoreEvent::Cache(CacheEvent::Evicted { key, policy }) => {
            assert_eq!(key, "old");
            assert_eq!(policy, "FIFO");
        }
        other => panic!("unexpected event {:?}", other),
    }
}
