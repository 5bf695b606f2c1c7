//! # Core Runtime Module
//!
//! Runtime infrastructure shared by the cache engine crates:
//! - Logging and tracing initialization
//! - Configuration and capability validation
//! - Event bus for query, mutation and cache events
//!
//! Other crates depend on this one for their conventions; it has no
//! knowledge of cache entries or queries itself.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{CoreConfig, CoreConfigBuilder, PersistenceOptions};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus, EventMeta, EventStream};
