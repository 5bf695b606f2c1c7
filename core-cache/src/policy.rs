//! Eviction policies
//!
//! Pure victim selection over entry metadata. Entries that are still
//! referenced by a live query are never candidates.

use crate::entry::CacheEntry;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Policy for choosing which entry to evict when the cache is over budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Smallest `last_accessed_at`
    #[default]
    LeastRecentlyUsed,

    /// Smallest `access_count`, ties broken by smallest `last_accessed_at`
    LeastFrequentlyUsed,

    /// Smallest `created_at`
    FirstInFirstOut,
}

impl EvictionPolicy {
    pub fn description(&self) -> &'static str {
        match self {
            EvictionPolicy::LeastRecentlyUsed => "Remove entries that haven't been read recently",
            EvictionPolicy::LeastFrequentlyUsed => "Remove entries that have been read the least",
            EvictionPolicy::FirstInFirstOut => "Remove the oldest entries first",
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            EvictionPolicy::LeastRecentlyUsed => "LRU",
            EvictionPolicy::LeastFrequentlyUsed => "LFU",
            EvictionPolicy::FirstInFirstOut => "FIFO",
        }
    }

    /// Ordering where the entry to evict first compares smallest.
    ///
    /// Timestamp ties fall back to the store's monotonic sequence numbers so
    /// that the order is total even when the clock does not move.
    fn compare<T>(&self, a: &CacheEntry<T>, b: &CacheEntry<T>) -> Ordering {
        match self {
            EvictionPolicy::LeastRecentlyUsed => a
                .last_accessed_at
                .cmp(&b.last_accessed_at)
                .then(a.access_sequence.cmp(&b.access_sequence)),
            EvictionPolicy::LeastFrequentlyUsed => a
                .access_count
                .cmp(&b.access_count)
                .then(a.last_accessed_at.cmp(&b.last_accessed_at))
                .then(a.access_sequence.cmp(&b.access_sequence)),
            EvictionPolicy::FirstInFirstOut => a
                .created_at
                .cmp(&b.created_at)
                .then(a.insert_sequence.cmp(&b.insert_sequence)),
        }
    }

    /// Pick the victim among unreferenced entries, or `None` if every
    /// candidate is still referenced.
    pub fn select_victim<'a, T: 'a, I>(&self, entries: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = (&'a String, &'a CacheEntry<T>)>,
    {
        entries
            .into_iter()
            .filter(|(_, entry)| entry.reference_count == 0)
            .min_by(|(_, a), (_, b)| self.compare(a, b))
            .map(|(key, _)| key.as_str())
    }
}
