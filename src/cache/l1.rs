//! L1 Cache - Process-Local Tier
//!
//! Bounded, sharded in-memory copy of entries fetched from the shared tier.
//! Never the source of truth and never calls the loader.
//!
//! # Design
//!
//! - `ShardedMap` with a pluggable eviction policy (LRU default, LFU optional)
//! - Entry-count and byte budgets split evenly across shards
//! - Every entry carries a short local TTL, capped by its shared-tier expiry,
//!   so a lost invalidation heals within `ttl`
//! - Versions only move forward: a put never replaces a newer live copy, and
//!   an invalidated or fenced version stays a per-key floor for one local TTL
//!   after the copy itself is gone

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::entry::{millis, CacheEntry, CacheKey};
use super::policy::EvictionPolicyKind;
use super::shard::ShardedMap;
use crate::domain::events::InvalidationEvent;
use crate::domain::ports::Clock;

/// Default local TTL
pub const DEFAULT_L1_TTL: Duration = Duration::from_secs(5);

/// Default maximum number of entries
pub const DEFAULT_L1_MAX_ENTRIES: usize = 100_000;

/// Default byte budget (256 MiB)
pub const DEFAULT_L1_MAX_BYTES: u64 = 256 * 1024 * 1024;

/// Default shard count
pub const DEFAULT_L1_SHARDS: usize = 64;

/// L1 Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L1Config {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum size in bytes (keys + values)
    pub max_bytes: u64,
    /// Local TTL, independent of and much shorter than the shared-tier TTL
    #[serde(with = "super::duration_ms")]
    pub ttl: Duration,
    /// Eviction policy
    pub policy: EvictionPolicyKind,
    /// Requested shard count. Lowered so every shard can hold at least one
    /// entry; set to 1 for exact global LRU/LFU ordering.
    pub shard_count_hint: usize,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_L1_MAX_ENTRIES,
            max_bytes: DEFAULT_L1_MAX_BYTES,
            ttl: DEFAULT_L1_TTL,
            policy: EvictionPolicyKind::Lru,
            shard_count_hint: DEFAULT_L1_SHARDS,
        }
    }
}

/// What L1 does when the invalidation stream had a gap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Drop every local entry
    #[default]
    Clear,
    /// Cap the remaining local TTL of every entry
    ShortenTo(#[serde(with = "super::duration_ms")] Duration),
}

/// Result of applying an invalidation event to L1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationOutcome {
    /// A stale local copy was evicted
    Applied,
    /// The local copy is as new as or newer than the event; discarded
    Stale,
    /// Nothing cached for the key
    Absent,
}

/// Local copy plus its local expiry
#[derive(Debug, Clone)]
struct L1Item {
    entry: CacheEntry,
    local_expires_at: u64,
}

impl L1Item {
    #[inline]
    fn is_expired(&self, now: u64) -> bool {
        now >= self.local_expires_at
    }
}

/// L1 Cache - process-local tier
pub struct L1Cache {
    storage: ShardedMap<CacheKey, L1Item>,
    config: L1Config,
    clock: Arc<dyn Clock>,
    max_entries_per_shard: usize,
    max_bytes_per_shard: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    rejected_puts: AtomicU64,
    invalidations_applied: AtomicU64,
    invalidations_stale: AtomicU64,
}

impl L1Cache {
    /// Create a new L1 cache with the given configuration
    pub fn new(config: L1Config, clock: Arc<dyn Clock>) -> Self {
        let max_entries = config.max_entries.max(1);
        let requested = config.shard_count_hint.clamp(1, max_entries);
        // Largest power of two not above the request, so no shard is zero-sized
        let shard_count = 1usize << (usize::BITS - 1 - requested.leading_zeros());

        Self {
            storage: ShardedMap::new(shard_count, config.policy),
            max_entries_per_shard: max_entries / shard_count,
            max_bytes_per_shard: config.max_bytes / shard_count as u64,
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            rejected_puts: AtomicU64::new(0),
            invalidations_applied: AtomicU64::new(0),
            invalidations_stale: AtomicU64::new(0),
        }
    }

    /// Get a live local copy
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.clock.now_millis();

        let found = self.storage.shard_for(key).read(|s| {
            let expired = s.peek(key)?.is_expired(now);
            if expired {
                s.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            s.get(key).map(|item| item.entry.clone())
        });

        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Store a copy of a shared-tier entry. Returns false if it was not stored
    /// (too large, already expired, older than the live local copy, or below
    /// the key's version floor).
    pub fn put(&self, entry: CacheEntry) -> bool {
        let now = self.clock.now_millis();
        let size = entry.size();

        if entry.is_expired(now) || size > self.max_bytes_per_shard {
            return false;
        }

        let key = entry.key.clone();
        let item = L1Item {
            local_expires_at: now
                .saturating_add(millis(self.config.ttl))
                .min(entry.expires_at),
            entry,
        };

        let (stored, evicted) = self.storage.shard_for(&key).write(|s| {
            if s.floor(&key, now).is_some_and(|floor| item.entry.version < floor) {
                return (false, 0u64);
            }
            if let Some(existing) = s.peek(&key) {
                if existing.entry.version > item.entry.version && !existing.is_expired(now) {
                    return (false, 0u64);
                }
            }

            // Make room before inserting
            let mut evicted = 0u64;
            loop {
                let (present, old_size) = match s.peek(&key) {
                    Some(old) => (true, old.entry.size()),
                    None => (false, 0),
                };
                let entries_after = s.len() + usize::from(!present);
                let bytes_after = s.size_bytes() - old_size + size;
                if entries_after <= self.max_entries_per_shard
                    && bytes_after <= self.max_bytes_per_shard
                {
                    break;
                }
                match s.pop_candidate() {
                    Some((victim, _)) if victim != key => evicted += 1,
                    Some(_) => {}
                    None => break,
                }
            }

            s.insert(key.clone(), item, size);
            (true, evicted)
        });

        if stored {
            self.inserts.fetch_add(1, Ordering::Relaxed);
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        } else {
            self.rejected_puts.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Kept newer local copy");
        }
        stored
    }

    /// Unconditionally drop a key
    pub fn evict(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.storage
            .shard_for(key)
            .write(|s| s.remove(key))
            .map(|item| item.entry)
    }

    /// Drop a copy older than `version` and refuse such copies for one local
    /// TTL. Returns true if a resident copy was dropped.
    pub fn fence(&self, key: &CacheKey, version: u64) -> bool {
        let until = self.floor_expiry();
        let evicted = self.storage.shard_for(key).write(|s| {
            let stale = s.peek(key).is_some_and(|item| item.entry.version < version);
            if stale {
                s.remove(key);
            }
            s.raise_floor(key.clone(), version, until, self.max_entries_per_shard);
            stale
        });
        if evicted {
            self.invalidations_applied.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Apply an invalidation event, discarding it if the local copy is current
    pub fn invalidate(&self, event: &InvalidationEvent) -> InvalidationOutcome {
        let until = self.floor_expiry();
        let outcome = self.storage.shard_for(&event.key).write(|s| {
            let resident = s.peek(&event.key).map(|item| item.entry.version);
            let outcome = match resident {
                Some(version) if event.supersedes(version) => {
                    s.remove(&event.key);
                    InvalidationOutcome::Applied
                }
                Some(_) => return InvalidationOutcome::Stale,
                None => InvalidationOutcome::Absent,
            };
            // A read that fetched the old value before this event must not
            // land after it
            s.raise_floor(
                event.key.clone(),
                event.source_version,
                until,
                self.max_entries_per_shard,
            );
            outcome
        });

        match outcome {
            InvalidationOutcome::Applied => {
                self.invalidations_applied.fetch_add(1, Ordering::Relaxed);
            }
            InvalidationOutcome::Stale => {
                self.invalidations_stale.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = %event.key,
                    version = event.source_version,
                    publisher = %event.publisher_id,
                    "Discarded stale invalidation"
                );
            }
            InvalidationOutcome::Absent => {}
        }
        outcome
    }

    /// Cap the local TTL of every entry; returns the number of entries shortened
    pub fn shorten_ttl(&self, max_remaining: Duration) -> usize {
        let deadline = self
            .clock
            .now_millis()
            .saturating_add(millis(max_remaining));
        let mut shortened = 0;
        for shard in self.storage.shards() {
            shard.write(|s| {
                s.retain(|_, item| {
                    if item.local_expires_at > deadline {
                        item.local_expires_at = deadline;
                        shortened += 1;
                    }
                    true
                })
            });
        }
        shortened
    }

    /// React to an invalidation gap
    pub fn on_gap(&self, policy: GapPolicy) {
        match policy {
            GapPolicy::Clear => self.clear(),
            GapPolicy::ShortenTo(ttl) => {
                self.shorten_ttl(ttl);
            }
        }
    }

    /// Drop expired entries and version floors; returns how many entries
    /// were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let purged: usize = self
            .storage
            .shards()
            .map(|shard| {
                shard.write(|s| {
                    s.purge_floors(now);
                    s.retain(|_, item| !item.is_expired(now))
                })
            })
            .sum();
        self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// Drop every entry. Version floors are kept.
    pub fn clear(&self) {
        self.storage.clear();
    }

    /// Drop every entry and every version floor, for when versions seen so
    /// far are no longer comparable with new ones
    pub fn reset(&self) {
        for shard in self.storage.shards() {
            shard.clear();
            shard.write(|s| s.clear_floors());
        }
    }

    /// Version floors currently held
    pub fn floor_count(&self) -> usize {
        self.storage
            .shards()
            .map(|shard| shard.read(|s| s.floor_count()))
            .sum()
    }

    fn floor_expiry(&self) -> u64 {
        self.clock
            .now_millis()
            .saturating_add(millis(self.config.ttl))
    }

    pub fn config(&self) -> &L1Config {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Current size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.storage.size_bytes()
    }

    pub fn shard_count(&self) -> usize {
        self.storage.shard_count()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> L1Stats {
        L1Stats {
            entries: self.len(),
            size_bytes: self.size_bytes(),
            max_entries: self.config.max_entries,
            max_bytes: self.config.max_bytes,
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions(),
            expirations: self.expirations.load(Ordering::Relaxed),
            rejected_puts: self.rejected_puts.load(Ordering::Relaxed),
            invalidations_applied: self.invalidations_applied.load(Ordering::Relaxed),
            invalidations_stale: self.invalidations_stale.load(Ordering::Relaxed),
        }
    }
}

/// L1 cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct L1Stats {
    pub entries: usize,
    pub size_bytes: u64,
    pub max_entries: usize,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    pub inserts: u64,
    /// Capacity evictions
    pub evictions: u64,
    /// Entries dropped for local TTL expiry
    pub expirations: u64,
    /// Puts refused because a newer copy was live
    pub rejected_puts: u64,
    pub invalidations_applied: u64,
    pub invalidations_stale: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheValue;
    use crate::domain::ports::ManualClock;
    use bytes::Bytes;

    const NOW: u64 = 1_000_000;

    fn cache(config: L1Config) -> (Arc<ManualClock>, L1Cache) {
        let clock = Arc::new(ManualClock::new(NOW));
        let cache = L1Cache::new(config, clock.clone());
        (clock, cache)
    }

    fn exact(max_entries: usize, policy: EvictionPolicyKind) -> L1Config {
        L1Config {
            max_entries,
            policy,
            shard_count_hint: 1,
            ..Default::default()
        }
    }

    fn entry(key: &str, data: &[u8], version: u64) -> CacheEntry {
        CacheEntry {
            key: CacheKey::from(key),
            value: CacheValue::Present(Bytes::copy_from_slice(data)),
            created_at: NOW,
            expires_at: NOW + 300_000,
            version,
        }
    }

    #[test]
    fn test_l1_cache_creation() {
        let (_clock, cache) = cache(L1Config::default());
        assert!(cache.is_empty());
        assert_eq!(cache.size_bytes(), 0);
        assert_eq!(cache.shard_count(), DEFAULT_L1_SHARDS);
    }

    #[test]
    fn test_shard_count_never_exceeds_entries() {
        let (_clock, cache) = cache(L1Config {
            max_entries: 3,
            ..Default::default()
        });
        assert_eq!(cache.shard_count(), 2);
    }

    #[test]
    fn test_l1_cache_put_get() {
        let (_clock, cache) = cache(L1Config::default());

        assert!(cache.put(entry("user:1", b"Hello, World!", 1)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size_bytes(), 6 + 13);

        let got = cache.get(&CacheKey::from("user:1")).unwrap();
        assert_eq!(got.value.as_bytes().unwrap().as_ref(), b"Hello, World!");
        assert_eq!(got.version, 1);
    }

    #[test]
    fn test_l1_cache_hit_tracking() {
        let (_clock, cache) = cache(L1Config::default());
        let key = CacheKey::from("k");

        assert!(cache.get(&key).is_none());
        cache.put(entry("k", b"data", 1));
        cache.get(&key);
        cache.get(&key);
        cache.get(&key);

        assert_eq!(cache.hits(), 3);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hit_ratio(), 0.75);
    }

    #[test]
    fn test_local_ttl_expiry() {
        let (clock, cache) = cache(L1Config {
            ttl: Duration::from_secs(2),
            ..Default::default()
        });
        let key = CacheKey::from("k");
        cache.put(entry("k", b"v", 1));

        clock.advance(Duration::from_millis(1_999));
        assert!(cache.get(&key).is_some());

        clock.advance(Duration::from_millis(1));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_local_ttl_capped_by_shared_expiry() {
        let (clock, cache) = cache(L1Config {
            ttl: Duration::from_secs(60),
            ..Default::default()
        });
        let mut e = entry("k", b"v", 1);
        e.expires_at = NOW + 1_000;
        cache.put(e);

        clock.advance(Duration::from_secs(1));
        assert!(cache.get(&CacheKey::from("k")).is_none());
    }

    #[test]
    fn test_expired_entry_not_stored() {
        let (_clock, cache) = cache(L1Config::default());
        let mut e = entry("k", b"v", 1);
        e.expires_at = NOW;
        assert!(!cache.put(e));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_at_bound() {
        let (_clock, cache) = cache(exact(2, EvictionPolicyKind::Lru));

        cache.put(entry("a", b"1", 1));
        cache.put(entry("b", b"2", 1));
        cache.get(&CacheKey::from("a"));
        cache.put(entry("c", b"3", 1));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&CacheKey::from("a")).is_some());
        assert!(cache.get(&CacheKey::from("b")).is_none());
        assert!(cache.get(&CacheKey::from("c")).is_some());
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_lfu_eviction_at_bound() {
        let (_clock, cache) = cache(exact(2, EvictionPolicyKind::Lfu));

        cache.put(entry("a", b"1", 1));
        cache.put(entry("b", b"2", 1));
        for _ in 0..3 {
            cache.get(&CacheKey::from("b"));
        }
        cache.get(&CacheKey::from("a"));
        cache.put(entry("c", b"3", 1));

        assert!(cache.get(&CacheKey::from("b")).is_some());
        assert!(cache.get(&CacheKey::from("a")).is_none());
        assert!(cache.get(&CacheKey::from("c")).is_some());
    }

    #[test]
    fn test_byte_budget() {
        let (_clock, cache) = cache(L1Config {
            max_bytes: 10,
            shard_count_hint: 1,
            ..Default::default()
        });

        assert!(cache.put(entry("a", b"1234", 1)));
        assert!(cache.put(entry("b", b"1234", 1)));
        assert!(cache.put(entry("c", b"1234", 1)));
        assert!(cache.size_bytes() <= 10);
        assert_eq!(cache.len(), 2);

        // Larger than the whole budget
        assert!(!cache.put(entry("d", b"0123456789", 1)));
    }

    #[test]
    fn test_replace_keeps_size_accounting() {
        let (_clock, cache) = cache(exact(1, EvictionPolicyKind::Lru));

        cache.put(entry("k", b"original", 1));
        cache.put(entry("k", b"replaced content", 2));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size_bytes(), 1 + 16);
        assert_eq!(cache.evictions(), 0);
    }

    #[test]
    fn test_monotonic_versions() {
        let (_clock, cache) = cache(L1Config::default());
        let key = CacheKey::from("k");

        assert!(cache.put(entry("k", b"new", 3)));
        assert!(!cache.put(entry("k", b"old", 2)));
        assert_eq!(cache.get(&key).unwrap().version, 3);

        assert!(cache.put(entry("k", b"same", 3)));
        assert_eq!(cache.stats().rejected_puts, 1);
    }

    #[test]
    fn test_invalidate_by_version() {
        let (_clock, cache) = cache(L1Config::default());
        let key = CacheKey::from("user:42");
        cache.put(entry("user:42", b"v2", 2));

        let stale = InvalidationEvent::new(key.clone(), 2, NOW, "other");
        assert_eq!(cache.invalidate(&stale), InvalidationOutcome::Stale);
        assert!(cache.get(&key).is_some());

        let fresh = InvalidationEvent::new(key.clone(), 3, NOW, "other");
        assert_eq!(cache.invalidate(&fresh), InvalidationOutcome::Applied);
        assert!(cache.get(&key).is_none());

        assert_eq!(cache.invalidate(&fresh), InvalidationOutcome::Absent);

        let stats = cache.stats();
        assert_eq!(stats.invalidations_applied, 1);
        assert_eq!(stats.invalidations_stale, 1);
    }

    #[test]
    fn test_invalidated_version_stays_a_floor() {
        let (clock, cache) = cache(L1Config {
            ttl: Duration::from_secs(2),
            ..Default::default()
        });
        let key = CacheKey::from("user:42");
        assert!(cache.put(entry("user:42", b"v2", 2)));
        assert!(cache.get(&key).is_some());

        let event = InvalidationEvent::new(key.clone(), 3, NOW, "other");
        assert_eq!(cache.invalidate(&event), InvalidationOutcome::Applied);

        // A late read of an older version cannot repopulate
        assert!(!cache.put(entry("user:42", b"v1", 1)));
        assert!(!cache.put(entry("user:42", b"v2", 2)));
        assert!(cache.get(&key).is_none());
        assert!(cache.put(entry("user:42", b"v3", 3)));
        assert_eq!(cache.get(&key).unwrap().version, 3);

        // The floor ages out with the local TTL
        cache.evict(&key);
        clock.advance(Duration::from_secs(2));
        assert!(cache.put(entry("user:42", b"v1", 1)));
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.floor_count(), 0);
    }

    #[test]
    fn test_event_for_absent_key_sets_floor() {
        let (_clock, cache) = cache(L1Config::default());
        let key = CacheKey::from("k");

        let event = InvalidationEvent::new(key.clone(), 5, NOW, "other");
        assert_eq!(cache.invalidate(&event), InvalidationOutcome::Absent);
        assert!(!cache.put(entry("k", b"old", 4)));
        assert!(cache.put(entry("k", b"new", 5)));
    }

    #[test]
    fn test_fence() {
        let (_clock, cache) = cache(L1Config::default());
        let key = CacheKey::from("k");

        // No resident copy: the floor alone keeps older copies out
        assert!(!cache.fence(&key, 4));
        assert!(!cache.put(entry("k", b"old", 3)));
        assert!(cache.put(entry("k", b"next", 4)));

        // Resident copy below the fence is dropped
        assert!(cache.fence(&key, 5));
        assert!(cache.get(&key).is_none());
        assert!(!cache.fence(&key, 5));

        cache.reset();
        assert_eq!(cache.floor_count(), 0);
        assert!(cache.put(entry("k", b"moved", 1)));
    }

    #[test]
    fn test_evict() {
        let (_clock, cache) = cache(L1Config::default());
        cache.put(entry("k", b"v", 1));

        assert!(cache.evict(&CacheKey::from("k")).is_some());
        assert!(cache.evict(&CacheKey::from("k")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_gap_policies() {
        let (clock, cache) = cache(L1Config {
            ttl: Duration::from_secs(30),
            ..Default::default()
        });
        cache.put(entry("a", b"1", 1));
        cache.put(entry("b", b"2", 1));

        cache.on_gap(GapPolicy::ShortenTo(Duration::from_secs(1)));
        assert_eq!(cache.len(), 2);
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.purge_expired(), 2);

        cache.put(entry("c", b"3", 1));
        cache.on_gap(GapPolicy::Clear);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_config_from_yaml() {
        let config: L1Config = serde_yaml::from_str("max_entries: 10\nttl: 1500\npolicy: lfu\n").unwrap();
        assert_eq!(config.max_entries, 10);
        assert_eq!(config.ttl, Duration::from_millis(1500));
        assert_eq!(config.policy, EvictionPolicyKind::Lfu);
        assert_eq!(config.max_bytes, DEFAULT_L1_MAX_BYTES);

        let policy: GapPolicy = serde_yaml::from_str("shorten_to: 250").unwrap();
        assert_eq!(policy, GapPolicy::ShortenTo(Duration::from_millis(250)));
    }
}
