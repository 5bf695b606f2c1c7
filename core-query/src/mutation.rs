//! # Mutation
//!
//! One-shot write operations. Mutations are never cached or shared: every
//! [`Mutation::mutate`] call invokes the mutation function once.
//!
//! With `queue_when_offline`, a connectivity failure parks the variables in
//! the [`OfflineQueue`] and the mutation moves to `Queued` instead of
//! `Error`. The queue later replays the item through this mutation's
//! [`ReplayHandler`] implementation.

use async_trait::async_trait;
use core_cache::FetchError;
use core_runtime::events::{CoreEvent, EventBus, MutationEvent};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{QueryError, Result};
use crate::offline_queue::{OfflineQueue, QueuedMutation, ReplayHandler};
use crate::options::MutationOptions;
use crate::query::RegistryHooks;
use crate::state::MutationState;

/// Variables a mutation accepts.
pub trait MutationVariables: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<V> MutationVariables for V where V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{}

pub type MutationFn<V, T> =
    Arc<dyn Fn(V) -> BoxFuture<'static, std::result::Result<T, FetchError>> + Send + Sync>;

/// Box a typed mutation function.
pub fn mutation_fn<V, T, F, Fut>(mutate: F) -> MutationFn<V, T>
where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, FetchError>> + Send + 'static,
{
    Arc::new(move |variables| Box::pin(mutate(variables)))
}

struct MutationInner<V, T> {
    key: String,
    mutate_fn: MutationFn<V, T>,
    options: MutationOptions<V, T>,
    state: watch::Sender<MutationState<T>>,
    queue: Option<OfflineQueue>,
    events: EventBus,
    hooks: Option<Weak<dyn RegistryHooks>>,
}

/// Handle to a mutation. Cloning is cheap; clones share state.
pub struct Mutation<V, T> {
    inner: Arc<MutationInner<V, T>>,
}

impl<V, T> Clone for Mutation<V, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, T> std::fmt::Debug for Mutation<V, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("key", &self.inner.key)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl<V, T> Mutation<V, T>
where
    V: MutationVariables,
    T: Clone + Send + Sync + 'static,
{
    /// Standalone mutation. Pass a queue to enable offline replay.
    pub fn new(
        key: impl Into<String>,
        mutate_fn: MutationFn<V, T>,
        options: MutationOptions<V, T>,
        queue: Option<OfflineQueue>,
        events: EventBus,
    ) -> Self {
        Self::with_hooks(key.into(), mutate_fn, options, queue, events, None)
    }

    pub(crate) fn with_hooks(
        key: String,
        mutate_fn: MutationFn<V, T>,
        options: MutationOptions<V, T>,
        queue: Option<OfflineQueue>,
        events: EventBus,
        hooks: Option<Weak<dyn RegistryHooks>>,
    ) -> Self {
        let (state, _) = watch::channel(MutationState::Idle);
        let inner = Arc::new(MutationInner {
            key,
            mutate_fn,
            options,
            state,
            queue,
            events,
            hooks,
        });

        if let Some(queue) = &inner.queue {
            let handler: Arc<dyn ReplayHandler> = inner.clone();
            queue.register_handler(&inner.key, Arc::downgrade(&handler));
        }

        Self { inner }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn state(&self) -> MutationState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<MutationState<T>> {
        self.inner.state.subscribe()
    }

    /// Back to `Idle`. Items already queued stay queued.
    pub fn reset(&self) {
        self.inner.state.send_replace(MutationState::Idle);
    }

    /// Run the mutation once.
    ///
    /// Returns `Ok(None)` when the call failed for lack of connectivity and
    /// was queued for replay instead.
    pub async fn mutate(&self, variables: V) -> Result<Option<T>> {
        let inner = &self.inner;
        inner.state.send_replace(MutationState::Loading);
        if let Some(on_mutate) = &inner.options.on_mutate {
            on_mutate(&variables);
        }

        match (inner.mutate_fn)(variables.clone()).await {
            Ok(data) => {
                inner.succeeded(&data, &variables);
                Ok(Some(data))
            }
            Err(error) if error.is_connectivity() && inner.options.queue_when_offline => {
                let Some(queue) = &inner.queue else {
                    warn!(key = %inner.key, "No offline queue configured; reporting failure");
                    inner.failed(&error, &variables);
                    return Err(QueryError::Fetch(error));
                };

                let payload = serde_json::to_value(&variables).map_err(|e| {
                    QueryError::Validation(format!("Mutation variables are not serializable: {}", e))
                })?;
                let item_id = queue
                    .enqueue(
                        &inner.key,
                        payload,
                        inner.options.max_retries,
                        inner.options.priority,
                    )
                    .await;

                inner.state.send_replace(MutationState::Queued {
                    item_id: item_id.clone(),
                });
                if let Some(on_queued) = &inner.options.on_queued {
                    on_queued(&variables, &item_id);
                }
                Ok(None)
            }
            Err(error) => {
                inner.failed(&error, &variables);
                Err(QueryError::Fetch(error))
            }
        }
    }
}

impl<V, T> MutationInner<V, T>
where
    T: Clone,
{
    fn emit(&self, event: MutationEvent) {
        let _ = self.events.emit(CoreEvent::Mutation(event));
    }

    fn succeeded(&self, data: &T, variables: &V) {
        self.state.send_replace(MutationState::Success { data: data.clone() });
        info!(key = %self.key, "Mutation succeeded");
        self.emit(MutationEvent::Succeeded {
            mutation_key: self.key.clone(),
            meta: self.options.meta.clone(),
        });
        if let Some(on_success) = &self.options.on_success {
            on_success(data, variables);
        }
        if !self.options.meta.invalidate_keys.is_empty() || !self.options.meta.refetch_keys.is_empty()
        {
            if let Some(hooks) = self.hooks.as_ref().and_then(Weak::upgrade) {
                hooks.apply_meta(&self.key, &self.options.meta);
            }
        }
    }

    fn failed(&self, error: &FetchError, variables: &V) {
        self.state.send_replace(MutationState::Error {
            error: error.clone(),
        });
        warn!(key = %self.key, error = %error, "Mutation failed");
        self.emit(MutationEvent::Failed {
            mutation_key: self.key.clone(),
            message: error.to_string(),
            meta: self.options.meta.clone(),
        });
        if let Some(on_error) = &self.options.on_error {
            on_error(error, variables);
        }
    }

    fn is_waiting_on(&self, item_id: &str) -> bool {
        matches!(&*self.state.borrow(), MutationState::Queued { item_id: queued } if queued == item_id)
    }
}

#[async_trait]
impl<V, T> ReplayHandler for MutationInner<V, T>
where
    V: MutationVariables,
    T: Clone + Send + Sync + 'static,
{
    async fn replay(&self, item: &QueuedMutation) -> std::result::Result<(), FetchError> {
        let variables: V = serde_json::from_value(item.variables.clone()).map_err(|e| {
            FetchError::other(format!("Queued variables no longer match the mutation: {}", e))
        })?;

        debug!(key = %self.key, item_id = %item.id, attempt = item.attempt, "Replaying mutation");
        let data = (self.mutate_fn)(variables.clone()).await?;

        if self.is_waiting_on(&item.id) {
            self.succeeded(&data, &variables);
        } else if let Some(on_success) = &self.options.on_success {
            on_success(&data, &variables);
        }
        Ok(())
    }

    fn exhausted(&self, item: &QueuedMutation, error: &QueryError) {
        let fetch_error = FetchError::other(error.to_string());
        if self.is_waiting_on(&item.id) {
            self.state.send_replace(MutationState::Error {
                error: fetch_error.clone(),
            });
        }
        if let Some(on_error) = &self.options.on_error {
            match serde_json::from_value::<V>(item.variables.clone()) {
                Ok(variables) => on_error(&fetch_error, &variables),
                Err(e) => debug!(key = %self.key, error = %e, "Cannot decode exhausted variables"),
            }
        }
    }
}
