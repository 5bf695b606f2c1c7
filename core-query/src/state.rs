//! Immutable state snapshots published by queries and mutations

use chrono::{DateTime, Utc};
use core_cache::FetchError;
use serde::{Deserialize, Serialize};

/// Phase of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Snapshot of a query.
///
/// `data` is the last good value and survives both refetches and failed
/// refetches; only a failed first fetch leaves it empty.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    pub status: QueryStatus,
    pub data: Option<T>,
    pub data_updated_at: Option<DateTime<Utc>>,
    pub error: Option<FetchError>,
    /// A fetch is running while `data` (if any) is still served
    pub is_fetching: bool,
    pub is_stale: bool,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

impl<T> QueryState<T> {
    pub fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            data_updated_at: None,
            error: None,
            is_fetching: false,
            is_stale: true,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// Error with nothing cached to fall back on.
    pub fn has_visible_error(&self) -> bool {
        self.is_error() && self.data.is_none()
    }

    /// Enter `Loading`, keeping previous data visible.
    pub(crate) fn loading(self) -> Self {
        Self {
            status: QueryStatus::Loading,
            is_fetching: true,
            ..self
        }
    }

    pub(crate) fn succeeded(data: T, updated_at: DateTime<Utc>, is_stale: bool) -> Self {
        Self {
            status: QueryStatus::Success,
            data: Some(data),
            data_updated_at: Some(updated_at),
            error: None,
            is_fetching: false,
            is_stale,
        }
    }

    pub(crate) fn failed(self, error: FetchError) -> Self {
        Self {
            status: QueryStatus::Error,
            error: Some(error),
            is_fetching: false,
            ..self
        }
    }

    pub(crate) fn invalidated(self) -> Self {
        Self {
            is_stale: true,
            ..self
        }
    }
}

/// Snapshot of a mutation
#[derive(Debug, Clone, PartialEq)]
pub enum MutationState<T> {
    Idle,
    Loading,
    Success { data: T },
    Error { error: FetchError },
    /// Failed for lack of connectivity and waiting in the offline queue
    Queued { item_id: String },
}

impl<T> Default for MutationState<T> {
    fn default() -> Self {
        MutationState::Idle
    }
}

impl<T> MutationState<T> {
    pub fn is_idle(&self) -> bool {
        matches!(self, MutationState::Idle)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, MutationState::Loading)
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, MutationState::Queued { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            MutationState::Success { data } => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            MutationState::Error { error } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refetch_keeps_previous_data() {
        let now = Utc::now();
        let state = QueryState::succeeded("alice", now, false);

        let loading = state.clone().loading();
        assert!(loading.is_loading());
        assert!(loading.is_fetching);
        assert_eq!(loading.data, Some("alice"));

        let failed = loading.failed(FetchError::network("offline"));
        assert!(failed.is_error());
        assert!(!failed.is_fetching);
        assert_eq!(failed.data, Some("alice"));
        assert!(!failed.has_visible_error());
    }

    #[test]
    fn test_first_failure_is_visible() {
        let state: QueryState<u32> = QueryState::idle().loading();
        assert!(state.data.is_none());

        let failed = state.failed(FetchError::server("500"));
        assert!(failed.has_visible_error());
    }
}
