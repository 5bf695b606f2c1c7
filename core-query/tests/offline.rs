use bridge_desktop::{InMemoryKeyValueStore, ManualNetworkMonitor};
use bridge_traits::{KeyValueStore, NetworkStatus};
use core_cache::{CacheConfig, FetchError};
use core_query::{MutationOptions, MutationState, QueryClient};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventMeta, MutationEvent};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Mutation function that fails with a connectivity error until `online`
/// is set.
fn flaky_save(
    online: &Arc<AtomicBool>,
    calls: &Arc<AtomicUsize>,
) -> impl Fn(String) -> futures::future::Ready<Result<String, FetchError>> + Send + Sync + 'static
{
    let online = Arc::clone(online);
    let calls = Arc::clone(calls);
    move |note: String| {
        calls.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(if online.load(Ordering::SeqCst) {
            Ok(format!("saved {}", note))
        } else {
            Err(FetchError::network("no route to host"))
        })
    }
}

#[tokio::test]
async fn queued_mutation_replays_when_network_returns() {
    let network = Arc::new(ManualNetworkMonitor::new(NetworkStatus::Disconnected));
    let config = CoreConfig::builder()
        .network_monitor(network.clone())
        .build()
        .unwrap();
    let client = QueryClient::new(CacheConfig::default(), config).unwrap();
    client.initialize().await.unwrap();

    let online = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let mutation = client
        .get_mutation(
            "notes.save",
            flaky_save(&online, &calls),
            MutationOptions::new().queue_when_offline(true),
        )
        .unwrap();

    assert_eq!(mutation.mutate("hello".to_string()).await.unwrap(), None);
    assert!(mutation.state().is_queued());
    assert_eq!(client.offline_queue().len(), 1);
    assert_eq!(client.offline_queue().pending()[0].variables, "hello");

    let mut replayed = client.subscribe_events().filter(|event| {
        matches!(event, CoreEvent::Mutation(MutationEvent::Replayed { .. }))
    });
    online.store(true, Ordering::SeqCst);
    network.set_online();

    tokio::time::timeout(Duration::from_secs(1), replayed.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(client.offline_queue().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        mutation.state(),
        MutationState::Success {
            data: "saved hello".to_string()
        }
    );

    client.shutdown().await;
}

#[tokio::test]
async fn exhausted_mutation_reports_a_terminal_event() {
    let client = QueryClient::in_memory().unwrap();
    let online = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&failures);
    let mutation = client
        .get_mutation(
            "notes.save",
            flaky_save(&online, &calls),
            MutationOptions::new()
                .queue_when_offline(true)
                .with_max_retries(2)
                .on_error(move |_: &FetchError, _: &String| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();
    let mut events = client.subscribe_events().filter(|event| {
        matches!(
            event,
            CoreEvent::Mutation(
                MutationEvent::RetryScheduled { .. } | MutationEvent::Exhausted { .. }
            )
        )
    });

    mutation.mutate("draft".to_string()).await.unwrap();

    let first = client.replay_offline_queue().await;
    assert_eq!(first.retried, 1);
    assert!(matches!(
        events.try_recv(),
        Some(Ok(CoreEvent::Mutation(MutationEvent::RetryScheduled { attempt: 1, .. })))
    ));

    let second = client.replay_offline_queue().await;
    assert_eq!(second.exhausted, 1);
    match events.try_recv() {
        Some(Ok(CoreEvent::Mutation(MutationEvent::Exhausted { attempts, .. }))) => {
            assert_eq!(attempts, 2);
        }
        other => panic!("expected exhaustion event, got {:?}", other),
    }

    assert!(client.offline_queue().is_empty());
    assert!(mutation.state().error().is_some());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn higher_priority_items_replay_first() {
    let client = QueryClient::in_memory().unwrap();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let online = Arc::new(AtomicBool::new(false));

    let make = |key: &str, priority: i32| {
        let order = Arc::clone(&order);
        let online = Arc::clone(&online);
        let key_name = key.to_string();
        client
            .get_mutation(
                key,
                move |n: u32| {
                    let ok = online.load(Ordering::SeqCst);
                    if ok {
                        order.lock().push((key_name.clone(), n));
                    }
                    futures::future::ready(if ok {
                        Ok(n)
                    } else {
                        Err(FetchError::timeout("gateway"))
                    })
                },
                MutationOptions::new()
                    .queue_when_offline(true)
                    .with_priority(priority),
            )
            .unwrap()
    };
    let low = make("sync.low", 0);
    let high = make("sync.high", 10);

    low.mutate(1).await.unwrap();
    low.mutate(2).await.unwrap();
    high.mutate(3).await.unwrap();
    assert_eq!(client.offline_queue().len(), 3);

    online.store(true, Ordering::SeqCst);
    assert_eq!(client.replay_offline_queue().await.replayed, 3);
    assert_eq!(
        *order.lock(),
        vec![
            ("sync.high".to_string(), 3),
            ("sync.low".to_string(), 1),
            ("sync.low".to_string(), 2),
        ]
    );
}

#[tokio::test]
async fn queue_survives_restart_and_replays_on_registration() {
    let storage = Arc::new(InMemoryKeyValueStore::new());
    let online = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));

    {
        let config = CoreConfig::builder()
            .storage(storage.clone())
            .build()
            .unwrap();
        let client = QueryClient::new(CacheConfig::default(), config).unwrap();
        client.initialize().await.unwrap();
        let mutation = client
            .get_mutation(
                "notes.save",
                flaky_save(&online, &calls),
                MutationOptions::new().queue_when_offline(true),
            )
            .unwrap();
        mutation.mutate("persisted".to_string()).await.unwrap();
        client.shutdown().await;
    }
    assert!(storage
        .read(core_query::OFFLINE_QUEUE_KEY)
        .await
        .unwrap()
        .is_some());

    let network = Arc::new(ManualNetworkMonitor::new(NetworkStatus::Connected));
    let config = CoreConfig::builder()
        .storage(storage.clone())
        .network_monitor(network)
        .build()
        .unwrap();
    let client = QueryClient::new(CacheConfig::default(), config).unwrap();
    let mut replayed = client.subscribe_events().filter(|event| {
        matches!(event, CoreEvent::Mutation(MutationEvent::Replayed { .. }))
    });
    client.initialize().await.unwrap();
    assert_eq!(client.offline_queue().len(), 1);

    online.store(true, Ordering::SeqCst);
    client
        .get_mutation(
            "notes.save",
            flaky_save(&online, &calls),
            MutationOptions::new().queue_when_offline(true),
        )
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), replayed.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(client.offline_queue().is_empty());
}

#[tokio::test]
async fn mutation_meta_invalidates_queries() {
    let client = QueryClient::in_memory().unwrap();
    client.set_query_data("notes", &vec!["old".to_string()]).unwrap();

    let mutation = client
        .get_mutation(
            "notes.create",
            |title: String| async move { Ok::<_, FetchError>(title) },
            MutationOptions::new().with_meta(EventMeta::new().invalidates("notes")),
        )
        .unwrap();

    assert_eq!(
        mutation.mutate("new".to_string()).await.unwrap().as_deref(),
        Some("new")
    );
    assert!(client.get_cache_keys().is_empty());
}

#[tokio::test]
async fn mutation_lookup_rejects_other_types() {
    let client = QueryClient::in_memory().unwrap();
    client
        .get_mutation(
            "counter.bump",
            |n: u32| async move { Ok::<_, FetchError>(n + 1) },
            MutationOptions::new(),
        )
        .unwrap();

    let err = client
        .get_mutation(
            "counter.bump",
            |s: String| async move { Ok::<_, FetchError>(s) },
            MutationOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, core_query::QueryError::TypeMismatch { .. }));
}
