//! Cache Entry Types
//!
//! The unit stored by every tier: an encoded payload plus metadata that can
//! be read without touching the payload.

use std::collections::BTreeSet;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::key::CacheKey;

/// Caller-supplied labels for bulk invalidation
pub type TagSet = BTreeSet<String>;

/// Longest TTL an entry can carry, in hours (100 years)
pub const MAX_TTL_HOURS: u64 = 36_525 * 24;

/// Shortest TTL an entry can carry; keeps `expires_at > created_at`
pub fn min_ttl() -> Duration {
    Duration::milliseconds(1)
}

pub fn max_ttl() -> Duration {
    Duration::hours(MAX_TTL_HOURS as i64)
}

/// Metadata stored next to each payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Namespace of the key (recorded so durable records are self-describing)
    #[serde(default)]
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: TagSet,
    /// Exact encoded payload length used for capacity accounting
    pub size_bytes: u64,
    #[serde(default)]
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
}

impl EntryMetadata {
    /// Create metadata for a freshly written payload
    pub fn new(
        namespace: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
        tags: TagSet,
        size_bytes: u64,
    ) -> Self {
        let ttl = ttl.clamp(min_ttl(), max_ttl());
        Self {
            namespace: namespace.into(),
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            tags,
            size_bytes,
            access_count: 0,
            last_access: now,
        }
    }

    /// Check if entry has expired
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Record an access; never moves `last_access` backwards
    pub fn record_access(&mut self, now: DateTime<Utc>) -> u64 {
        self.access_count = self.access_count.saturating_add(1);
        if now > self.last_access {
            self.last_access = now;
        }
        self.access_count
    }

    /// True if any of `tags` is carried by this entry
    pub fn has_any_tag(&self, tags: &TagSet) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }

    /// Check that a decoded record is internally consistent
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.expires_at <= self.created_at {
            return Err(format!(
                "expires_at {} not after created_at {}",
                self.expires_at, self.created_at
            ));
        }
        Ok(())
    }
}

/// Cache entry containing payload and metadata
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Encoded value (see [`super::value::CacheValue::encode`])
    pub payload: Bytes,
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: Bytes, metadata: EntryMetadata) -> Self {
        Self {
            key,
            payload,
            metadata,
        }
    }

    /// Payload size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.metadata.size_bytes
    }

    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.metadata.is_expired(now)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> TagSet {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_metadata_expiry_window() {
        let now = Utc::now();
        let meta = EntryMetadata::new("ns", now, Duration::hours(1), TagSet::new(), 10);
        assert!(meta.expires_at > meta.created_at);
        assert!(!meta.is_expired(now));
        assert!(!meta.is_expired(now + Duration::minutes(59)));
        assert!(meta.is_expired(now + Duration::hours(1)));
    }

    #[test]
    fn test_zero_ttl_is_clamped() {
        let now = Utc::now();
        let meta = EntryMetadata::new("ns", now, Duration::zero(), TagSet::new(), 1);
        assert_eq!(meta.expires_at - meta.created_at, min_ttl());
        assert!(meta.check().is_ok());
        assert!(meta.is_expired(now + Duration::seconds(1)));
    }

    #[test]
    fn test_huge_ttl_is_clamped() {
        let now = Utc::now();
        let meta = EntryMetadata::new("ns", now, Duration::days(365 * 1_000_000), TagSet::new(), 1);
        assert_eq!(meta.expires_at - meta.created_at, max_ttl());
        assert!(!meta.is_expired(now + Duration::days(365 * 99)));

        let meta = EntryMetadata::new("ns", now, Duration::weeks(1_000_000_000), TagSet::new(), 1);
        assert_eq!(meta.expires_at - meta.created_at, max_ttl());
    }

    #[test]
    fn test_expiry_saturates_near_the_end_of_time() {
        let now = DateTime::<Utc>::MAX_UTC - Duration::hours(1);
        let meta = EntryMetadata::new("ns", now, Duration::days(1), TagSet::new(), 1);
        assert_eq!(meta.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!meta.is_expired(now));
    }

    #[test]
    fn test_access_tracking_is_monotonic() {
        let now = Utc::now();
        let mut meta = EntryMetadata::new("ns", now, Duration::hours(1), TagSet::new(), 1);
        assert_eq!(meta.record_access(now + Duration::seconds(5)), 1);
        // An earlier timestamp must not rewind last_access
        assert_eq!(meta.record_access(now), 2);
        assert_eq!(meta.last_access, now + Duration::seconds(5));
    }

    #[test]
    fn test_tag_intersection() {
        let meta = EntryMetadata::new("ns", Utc::now(), Duration::hours(1), tags(&["x", "y"]), 1);
        assert!(meta.has_any_tag(&tags(&["y", "z"])));
        assert!(!meta.has_any_tag(&tags(&["z"])));
        assert!(!meta.has_any_tag(&TagSet::new()));
    }

    #[test]
    fn test_metadata_json_roundtrip_tolerates_missing_optional_fields() {
        let now = Utc::now();
        let meta = EntryMetadata::new("ns", now, Duration::hours(1), tags(&["x"]), 42);
        let mut value = serde_json::to_value(&meta).unwrap();
        value.as_object_mut().unwrap().remove("access_count");
        let parsed: EntryMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.access_count, 0);
        assert_eq!(parsed.size_bytes, 42);
    }

    #[test]
    fn test_check_rejects_inverted_window() {
        let now = Utc::now();
        let mut meta = EntryMetadata::new("ns", now, Duration::hours(1), TagSet::new(), 1);
        meta.expires_at = now - Duration::hours(1);
        assert!(meta.check().is_err());
    }
}
