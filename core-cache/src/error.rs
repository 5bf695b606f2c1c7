use crate::fetch::FetchError;
use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Malformed key, invalid options or a value that cannot be serialized.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid or mismatched key; the in-memory cache stays authoritative.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Storage I/O failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

impl From<BridgeError> for CacheError {
    fn from(err: BridgeError) -> Self {
        CacheError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
