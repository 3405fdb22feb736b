//! Cache Entry Types
//!
//! Keys, values, versioned entries and leases shared by every tier.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier of a physical shard node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Cache key - raw bytes with a pre-computed local hash
#[derive(Clone, Eq)]
pub struct CacheKey {
    /// Local (process) hash, used for L1 sharding
    local_hash: u64,
    /// Raw key bytes
    bytes: Bytes,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let local_hash = fx_hash(&bytes);
        Self { local_hash, bytes }
    }

    /// Get raw key bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the L1 shard index for this key (shard_count must be a power of two)
    #[inline]
    pub fn shard_index(&self, shard_count: usize) -> usize {
        (self.local_hash as usize) & (shard_count - 1)
    }

    /// Position of this key on the consistent-hash ring
    #[inline]
    pub fn ring_position(&self) -> u64 {
        stable_hash(&self.bytes)
    }

    /// Length of the key in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        // Fast path: compare hashes first
        self.local_hash == other.local_hash && self.bytes == other.bytes
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.local_hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:?})", String::from_utf8_lossy(&self.bytes))
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(Bytes::from(s))
    }
}

impl From<Vec<u8>> for CacheKey {
    fn from(v: Vec<u8>) -> Self {
        Self::new(Bytes::from(v))
    }
}

/// Fast non-cryptographic hash (FxHash algorithm), process-local use only
#[inline]
pub(crate) fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Stable 64-bit hash used for ring placement.
///
/// FNV-1a followed by the murmur3 finalizer. Must produce identical output in
/// every process of the fleet, so it never depends on a random seed.
#[inline]
pub fn stable_hash(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51afd7ed558ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ceb9fe1a85ec53);
    hash ^= hash >> 33;
    hash
}

/// Value stored for a key: real bytes, or the marker for "known absent upstream"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Present(Bytes),
    Negative,
}

impl CacheValue {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            CacheValue::Present(b) => Some(b),
            CacheValue::Negative => None,
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, CacheValue::Negative)
    }

    /// Size in bytes counted against memory budgets
    pub fn size(&self) -> u64 {
        match self {
            CacheValue::Present(b) => b.len() as u64,
            CacheValue::Negative => 0,
        }
    }
}

/// A versioned cache entry as owned by the shared tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: CacheValue,
    /// Creation time (epoch millis)
    pub created_at: u64,
    /// Expiry time (epoch millis)
    pub expires_at: u64,
    /// Incremented on every write to the same key
    pub version: u64,
}

impl CacheEntry {
    /// Check if the entry has expired at `now`
    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Time left before hard expiry
    pub fn remaining_ttl(&self, now: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now))
    }

    /// TTL the entry was written with
    pub fn requested_ttl(&self) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(self.created_at))
    }

    pub fn is_negative(&self) -> bool {
        self.value.is_negative()
    }

    /// Entry size (key + value bytes)
    pub fn size(&self) -> u64 {
        self.key.len() as u64 + self.value.size()
    }
}

/// Exclusive, time-bounded right to recompute one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: CacheKey,
    /// Process that holds the lease
    pub holder_id: String,
    /// Store-unique token, distinguishes successive leases of one holder
    pub token: u64,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl Lease {
    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Same holder and same token
    pub fn is_same_grant(&self, other: &Lease) -> bool {
        self.holder_id == other.holder_id && self.token == other.token
    }
}

/// Record left in place of a lease whose recompute failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedLoad {
    pub key: CacheKey,
    pub holder_id: String,
    pub token: u64,
    pub reason: String,
    pub failed_at: u64,
    pub expires_at: u64,
}

impl FailedLoad {
    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Convert a duration to whole milliseconds, saturating
#[inline]
pub fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_equality() {
        let key1 = CacheKey::from("user:42");
        let key2 = CacheKey::from(String::from("user:42"));
        let key3 = CacheKey::from("user:43");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
        assert_eq!(key1.to_string(), "user:42");
    }

    #[test]
    fn test_shard_index_distribution() {
        let mut shard_counts = vec![0usize; 64];

        for i in 0..10000 {
            let key = CacheKey::from(format!("key-{}", i));
            let idx = key.shard_index(64);
            assert!(idx < 64);
            shard_counts[idx] += 1;
        }

        // Expected ~156 per shard
        let max_count = *shard_counts.iter().max().unwrap();
        assert!(max_count < 300, "Uneven distribution: max count {}", max_count);
    }

    #[test]
    fn test_stable_hash_is_deterministic() {
        assert_eq!(stable_hash(b"shard-a#0"), stable_hash(b"shard-a#0"));
        assert_ne!(stable_hash(b"shard-a#0"), stable_hash(b"shard-a#1"));
        assert_eq!(
            CacheKey::from("user:42").ring_position(),
            stable_hash(b"user:42")
        );
    }

    #[test]
    fn test_entry_ttl_accounting() {
        let entry = CacheEntry {
            key: CacheKey::from("k"),
            value: CacheValue::Present(Bytes::from_static(b"v")),
            created_at: 1_000,
            expires_at: 11_000,
            version: 1,
        };

        assert_eq!(entry.requested_ttl(), Duration::from_secs(10));
        assert_eq!(entry.remaining_ttl(6_000), Duration::from_secs(5));
        assert_eq!(entry.remaining_ttl(20_000), Duration::ZERO);
        assert!(!entry.is_expired(10_999));
        assert!(entry.is_expired(11_000));
        assert_eq!(entry.size(), 2);
    }

    #[test]
    fn test_negative_value() {
        let value = CacheValue::Negative;
        assert!(value.is_negative());
        assert_eq!(value.size(), 0);
        assert!(value.as_bytes().is_none());
    }

    #[test]
    fn test_lease_grant_identity() {
        let lease = Lease {
            key: CacheKey::from("k"),
            holder_id: "proc-1".into(),
            token: 7,
            acquired_at: 0,
            expires_at: 10_000,
        };
        let mut other = lease.clone();
        assert!(lease.is_same_grant(&other));
        other.token = 8;
        assert!(!lease.is_same_grant(&other));
        assert!(lease.is_expired(10_000));
    }
}
