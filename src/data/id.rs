//! Time-ordered entity identifiers
//!
//! Layout (64 bits, stored as SQLite INTEGER):
//!
//! ```text
//! | 48 bits: milliseconds since Unix epoch | 16 bits: random |
//! ```
//!
//! IDs sort by creation time and the creation time can be recovered from
//! the ID alone. Two IDs minted in the same millisecond collide with
//! probability 2^-16; callers that insert rows retry with a fresh ID on a
//! primary key violation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const RANDOM_BITS: u32 = 16;
const TIMESTAMP_MASK: i64 = (1 << 48) - 1;

/// Entity ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl EntityId {
    /// Mint an ID for the current instant
    pub fn new() -> Self {
        Self::from_time(Utc::now())
    }

    /// Mint an ID for an externally supplied timestamp
    ///
    /// Used for federated objects so they sort by their `published` time.
    /// Timestamps before the epoch are clamped to zero.
    pub fn from_time(time: DateTime<Utc>) -> Self {
        let millis = time.timestamp_millis().max(0) & TIMESTAMP_MASK;
        let random = i64::from(rand::random::<u16>());
        Self((millis << RANDOM_BITS) | random)
    }

    /// Mint an ID from an RFC 3339 timestamp, falling back to now
    pub fn from_published(published: Option<&str>) -> Self {
        published
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|value| Self::from_time(value.with_timezone(&Utc)))
            .unwrap_or_default()
    }

    /// Recover the creation time encoded in the high bits
    pub fn created_at(&self) -> DateTime<Utc> {
        let millis = (self.0 >> RANDOM_BITS) & TIMESTAMP_MASK;
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<EntityId> for i64 {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn created_at_inverts_from_time_at_millisecond_precision() {
        let time = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid date")
            + chrono::Duration::microseconds(123_456);

        let id = EntityId::from_time(time);

        assert_eq!(id.created_at().timestamp_millis(), time.timestamp_millis());
        assert_eq!(id.created_at().timestamp_subsec_millis(), 123);
    }

    #[test]
    fn ids_sort_by_time() {
        let earlier = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let later = Utc.timestamp_millis_opt(1_700_000_000_001).unwrap();

        for _ in 0..64 {
            assert!(EntityId::from_time(earlier) < EntityId::from_time(later));
        }
    }

    #[test]
    fn ids_are_positive() {
        assert!(EntityId::new().0 > 0);
    }

    #[test]
    fn pre_epoch_time_clamps_to_zero() {
        let time = Utc.with_ymd_and_hms(1960, 1, 1, 0, 0, 0).unwrap();
        let id = EntityId::from_time(time);
        assert_eq!(id.created_at(), DateTime::<Utc>::default());
    }

    #[test]
    fn from_published_uses_timestamp_when_present() {
        let id = EntityId::from_published(Some("2024-01-01T00:00:00Z"));
        assert_eq!(id.created_at().to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn from_published_falls_back_to_now() {
        let before = Utc::now().timestamp_millis();
        let id = EntityId::from_published(Some("not a date"));
        assert!(id.created_at().timestamp_millis() >= before);
    }
}
