//! # Core Query
//!
//! Query and mutation orchestration on top of `core-cache`.
//!
//! - [`Query`]: per-key fetch orchestration with stale-while-revalidate,
//!   listener reference counting and delayed disposal
//! - [`Mutation`]: one-shot writes with optional offline queueing
//! - [`OfflineQueue`]: durable priority queue replayed on reconnect
//! - [`QueryClient`]: the registry tying them to one [`core_cache::CacheStore`]
//!
//! State is published through `tokio::sync::watch` channels as immutable
//! snapshots ([`QueryState`], [`MutationState`]). Transitions are also
//! broadcast as [`core_runtime::events::CoreEvent`]s on the client's
//! event bus.

pub mod client;
pub mod error;
pub mod mutation;
pub mod offline_queue;
pub mod options;
pub mod query;
pub mod state;

pub use client::{PrefetchRequest, QueryClient};
pub use error::{QueryError, Result};
pub use mutation::{mutation_fn, Mutation, MutationFn, MutationVariables};
pub use offline_queue::{
    DrainReport, OfflineQueue, QueuedMutation, ReplayHandler, OFFLINE_QUEUE_KEY,
};
pub use options::{MutationOptions, QueryOptions, DEFAULT_MAX_RETRIES};
pub use query::{erase_fetch, Query, QueryData, QueryFn, QuerySubscription};
pub use state::{MutationState, QueryState, QueryStatus};
