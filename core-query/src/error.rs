use core_cache::{CacheError, FetchError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    /// Malformed key or options, or variables that cannot be serialized.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A key is already registered (or cached) with a different type.
    #[error("Type mismatch for {key}: {message}")]
    TypeMismatch { key: String, message: String },

    /// A queued mutation ran out of replay attempts and was dropped.
    #[error("Queued mutation {item_id} dropped after {attempts} attempts: {message}")]
    QueueExhausted {
        item_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),
}

impl QueryError {
    pub(crate) fn type_mismatch(key: &str, message: impl Into<String>) -> Self {
        QueryError::TypeMismatch {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// The underlying fetch error, if this failure came from a fetch.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            QueryError::Fetch(e) | QueryError::Cache(CacheError::Fetch(e)) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
