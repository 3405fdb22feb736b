//! Domain Events
//!
//! Events carried by the invalidation bus. They are ephemeral: consumed once
//! by every subscriber and never persisted.

use chrono::{DateTime, Utc};

use crate::cache::CacheKey;

/// "Key changed" notification.
///
/// Every local copy of `key` whose version is below `source_version` is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub key: CacheKey,
    pub source_version: u64,
    pub issued_at: DateTime<Utc>,
    /// Process that published the event
    pub publisher_id: String,
}

impl InvalidationEvent {
    /// Create an event stamped with the given epoch-millis time
    pub fn new(
        key: CacheKey,
        source_version: u64,
        issued_at_millis: u64,
        publisher_id: impl Into<String>,
    ) -> Self {
        let issued_at = DateTime::<Utc>::from_timestamp_millis(issued_at_millis as i64)
            .unwrap_or_else(Utc::now);
        Self {
            key,
            source_version,
            issued_at,
            publisher_id: publisher_id.into(),
        }
    }

    /// True if a local copy at `version` must be dropped
    pub fn supersedes(&self, version: u64) -> bool {
        version < self.source_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supersedes() {
        let event = InvalidationEvent::new(CacheKey::from("user:42"), 2, 0, "proc-a");
        assert!(event.supersedes(1));
        assert!(!event.supersedes(2));
        assert!(!event.supersedes(3));
    }

    #[test]
    fn test_issued_at() {
        let event = InvalidationEvent::new(CacheKey::from("k"), 1, 1_700_000_000_000, "p");
        assert_eq!(event.issued_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(event.publisher_id, "p");
    }
}
