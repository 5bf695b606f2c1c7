//! Cache entries
//!
//! A [`CacheEntry`] is an immutable value-with-metadata record. Reads and
//! writes never modify an entry in place; they build a new entry and swap it
//! into the store's table.

use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Elapsed time between two instants, clamped at zero when `to` is earlier.
pub(crate) fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T = Value> {
    pub data: T,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub stale_time: Duration,
    pub cache_time: Duration,
    pub reference_count: u32,
    pub is_secure: bool,
    pub max_age: Option<Duration>,
    /// Estimated footprint used for budget accounting
    #[serde(skip)]
    pub size_bytes: usize,
    /// Store-wide sequence of the last read or write
    #[serde(skip)]
    pub(crate) access_sequence: u64,
    /// Store-wide sequence of the write that created this entry
    #[serde(skip)]
    pub(crate) insert_sequence: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(
        data: T,
        now: DateTime<Utc>,
        stale_time: Duration,
        cache_time: Duration,
        is_secure: bool,
        max_age: Option<Duration>,
    ) -> Self {
        Self {
            data,
            created_at: now,
            last_accessed_at: now,
            access_count: 1,
            stale_time,
            cache_time,
            reference_count: 0,
            is_secure,
            max_age,
            size_bytes: 0,
            access_sequence: 0,
            insert_sequence: 0,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.created_at, now)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now) < self.stale_time
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        !self.is_fresh(now)
    }

    /// Past `max_age`; treated as absent on access.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.max_age.is_some_and(|max_age| self.age(now) >= max_age)
    }

    pub fn idle_time(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.last_accessed_at, now)
    }

    pub fn is_eligible_for_gc(&self, now: DateTime<Utc>) -> bool {
        self.reference_count == 0 && self.idle_time(now) >= self.cache_time
    }
}

impl<T: Clone> CacheEntry<T> {
    /// Copy with access bookkeeping advanced.
    pub(crate) fn touched(&self, now: DateTime<Utc>, sequence: u64) -> Self {
        let mut next = self.clone();
        next.access_count = self.access_count.saturating_add(1);
        next.last_accessed_at = now.max(self.last_accessed_at);
        next.access_sequence = sequence;
        next
    }

    pub(crate) fn with_reference_count(&self, reference_count: u32) -> Self {
        let mut next = self.clone();
        next.reference_count = reference_count;
        next
    }
}

impl CacheEntry<Value> {
    /// Deserialize the payload into a typed entry.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<CacheEntry<T>> {
        let data = serde_json::from_value(self.data.clone())?;
        Ok(CacheEntry {
            data,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            access_count: self.access_count,
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            reference_count: self.reference_count,
            is_secure: self.is_secure,
            max_age: self.max_age,
            size_bytes: self.size_bytes,
            access_sequence: self.access_sequence,
            insert_sequence: self.insert_sequence,
        })
    }
}

/// Rejects empty keys and keys containing control characters.
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(CacheError::Validation(
            "Cache key cannot be empty".to_string(),
        ));
    }
    if key.chars().any(char::is_control) {
        return Err(CacheError::Validation(format!(
            "Cache key {:?} contains control characters",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_freshness_boundary() {
        let entry = CacheEntry::new(
            "alice",
            t0(),
            Duration::from_secs(300),
            Duration::from_secs(600),
            false,
            None,
        );

        for secs in [0, 1, 299] {
            assert!(entry.is_fresh(at(secs)));
            assert!(!entry.is_stale(at(secs)));
        }
        // age == staleTime is already stale
        assert!(entry.is_stale(at(300)));
        assert!(!entry.is_fresh(at(301)));
    }

    #[test]
    fn test_zero_stale_time_is_immediately_stale() {
        let entry = CacheEntry::new(1, t0(), Duration::ZERO, Duration::ZERO, false, None);
        assert!(entry.is_stale(t0()));
    }

    #[test]
    fn test_touched_produces_new_copy() {
        let entry = CacheEntry::new(1, t0(), Duration::ZERO, Duration::ZERO, false, None);
        let next = entry.touched(at(10), 7);

        assert_eq!(entry.access_count, 1);
        assert_eq!(next.access_count, 2);
        assert_eq!(next.last_accessed_at, at(10));
        assert_eq!(next.created_at, entry.created_at);
        assert_eq!(next.access_sequence, 7);
        assert!(next.last_accessed_at >= next.created_at);
    }

    #[test]
    fn test_gc_eligibility_requires_no_references() {
        let entry = CacheEntry::new(1, t0(), Duration::ZERO, Duration::from_secs(60), false, None);

        assert!(!entry.is_eligible_for_gc(at(59)));
        assert!(entry.is_eligible_for_gc(at(60)));
        assert!(!entry.with_reference_count(1).is_eligible_for_gc(at(600)));
    }

    #[test]
    fn test_max_age_expiry() {
        let entry = CacheEntry::new(
            "token",
            t0(),
            Duration::from_secs(30),
            Duration::from_secs(30),
            true,
            Some(Duration::from_secs(10)),
        );
        assert!(!entry.is_expired(at(9)));
        assert!(entry.is_expired(at(10)));

        let no_limit = CacheEntry::new(1, t0(), Duration::ZERO, Duration::ZERO, false, None);
        assert!(!no_limit.is_expired(at(1_000_000)));
    }

    #[test]
    fn test_decode_typed_payload() {
        let entry = CacheEntry::new(
            serde_json::json!({"id": 1, "name": "alice"}),
            t0(),
            Duration::ZERO,
            Duration::ZERO,
            false,
            None,
        );

        #[derive(Deserialize)]
        struct User {
            id: u32,
            name: String,
        }

        let typed: CacheEntry<User> = entry.decode().unwrap();
        assert_eq!(typed.data.id, 1);
        assert_eq!(typed.data.name, "alice");
        assert!(entry.decode::<Vec<u8>>().is_err());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("user:1").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("   ").is_err());
        assert!(validate_key("user\n1").is_err());
    }
}
