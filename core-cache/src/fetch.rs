//! Failures reported by caller-supplied fetch functions

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse classification of a fetch failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// No route to the server (offline, DNS, connection refused)
    Network,
    Timeout,
    /// The server answered with an error
    Server,
    Other,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FetchErrorKind::Network => "network error",
            FetchErrorKind::Timeout => "timed out",
            FetchErrorKind::Server => "server error",
            FetchErrorKind::Other => "error",
        };
        f.write_str(label)
    }
}

/// Error value produced by a fetch or mutation function.
///
/// Cloneable so one failure can be handed to every caller sharing a
/// deduplicated fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Timeout, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Server, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Other, message)
    }

    /// Whether the failure means the host is offline.
    ///
    /// Mutations configured to queue offline only queue on these.
    pub fn is_connectivity(&self) -> bool {
        matches!(self.kind, FetchErrorKind::Network | FetchErrorKind::Timeout)
    }
}
