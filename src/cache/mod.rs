//! Distributed Multi-Level Cache
//!
//! Read-through caching across a fleet of processes: a process-local L1 in
//! front of a sharded shared tier (L2), with per-key leases so a missing key
//! is recomputed once per stampede window.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          TieredCache (per process)                        │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1Cache            │ StampedeGuard           │ SharedTier (L2 client)     │
//! │  ┌───────────────┐  │ ┌─────────────────────┐ │ ┌────────────────────────┐ │
//! │  │ ShardedMap    │  │ │ in-process flights  │ │ │ ShardRouter (ArcSwap)  │ │
//! │  │ LRU / LFU     │  │ │ + cross-process     │ │ │ retries, failover      │ │
//! │  │ short TTL     │  │ │   lease             │ │ │ publishes invalidation │ │
//! │  └───────────────┘  │ └─────────────────────┘ │ └────────────────────────┘ │
//! │         ▲                                                  │               │
//! │         └──────────────── invalidation bus ◀───────────────┘               │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Consistency
//!
//! - Every shared-tier write carries a per-key version; L1 never goes back
//!   to a lower one and discards invalidations older than its copy
//! - A delete revokes the key's lease, so a recompute that started before the
//!   delete cannot write its result back
//! - L1 entries expire on their own short TTL, bounding staleness when the
//!   bus drops events

mod deadline;
mod entry;
mod l1;
mod l2;
mod manager;
mod metrics;
mod policy;
mod proptest;
mod router;
mod shard;
mod stampede;

pub use deadline::Deadline;
pub use entry::{
    millis, stable_hash, CacheEntry, CacheKey, CacheValue, FailedLoad, Lease, NodeId,
};
pub use l1::{
    GapPolicy, InvalidationOutcome, L1Cache, L1Config, L1Stats, DEFAULT_L1_MAX_BYTES,
    DEFAULT_L1_MAX_ENTRIES, DEFAULT_L1_SHARDS, DEFAULT_L1_TTL,
};
pub use l2::{L2Config, L2Stats, SharedTier};
pub use manager::{BusConfig, CacheConfig, TieredCache, TieredCacheBuilder};
pub use metrics::{CacheMetrics, PrometheusExporter, StatsSnapshot};
pub use policy::{EvictionPolicy, EvictionPolicyKind, LfuPolicy, LruPolicy};
pub use router::{RouterConfig, ShardMap, ShardRouter, DEFAULT_VIRTUAL_NODES};
pub use shard::{Shard, ShardedMap};
pub use stampede::{DegradePolicy, StampedeConfig, StampedeGuard};

/// Serde adapter for `Duration` as whole milliseconds, the unit used by
/// every config file field.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(super::millis(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Wrapper {
        #[serde(with = "duration_ms")]
        ttl: Duration,
    }

    #[test]
    fn test_duration_ms_serde() {
        let parsed: Wrapper = serde_json::from_str(r#"{"ttl":1500}"#).unwrap();
        assert_eq!(parsed.ttl, Duration::from_millis(1500));
        assert_eq!(serde_json::to_string(&parsed).unwrap(), r#"{"ttl":1500}"#);
    }

    #[test]
    fn test_default_shard_count_is_power_of_two() {
        assert!(DEFAULT_L1_SHARDS.is_power_of_two());
    }
}
