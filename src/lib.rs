//! Workspace entry crate.
//!
//! Re-exports the query cache crates under one name so host applications
//! depend on `query-cache-workspace` alone. The default `desktop-shims`
//! feature pulls in `bridge-desktop` and lets `CoreConfig::builder()` fall
//! back to file storage and the OS keychain when persistence is enabled.

pub use bridge_traits as bridge;
pub use core_cache as cache;
pub use core_query as query;
pub use core_runtime as runtime;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop as desktop;

pub use core_cache::{CacheConfig, CacheEntry, EvictionPolicy, FetchError, SetOptions};
pub use core_query::{
    Mutation, MutationOptions, MutationState, Query, QueryClient, QueryError, QueryOptions,
    QueryState,
};
pub use core_runtime::{CoreConfig, EventMeta, PersistenceOptions};
