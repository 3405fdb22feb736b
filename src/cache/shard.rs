//! Sharded Map Implementation
//!
//! Concurrent hashmap split into power-of-two shards. Each shard owns its
//! entries, its eviction policy and its byte accounting behind one lock, so
//! eviction decisions are approximate across the whole map (per-shard LRU/LFU)
//! but never need a global lock.
//!
//! # Design
//!
//! - Each shard has its own Mutex, minimizing contention
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Shards are cache-line aligned to prevent false sharing
//! - Each shard can hold a bounded set of per-key version floors that outlive
//!   the entries they guard

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::policy::{EvictionPolicy, EvictionPolicyKind};

/// Entries, policy and accounting of one shard (guarded by the shard lock)
pub struct ShardState<K, V> {
    map: HashMap<K, (V, u64)>,
    policy: Box<dyn EvictionPolicy<K>>,
    size_bytes: u64,
    /// Lowest acceptable version per key, with its expiry
    floors: HashMap<K, (u64, u64)>,
}

impl<K: Clone + Hash + Eq, V> ShardState<K, V> {
    /// Look up a value and record the access with the policy
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.map.contains_key(key) {
            self.policy.on_access(key);
        }
        self.map.get(key).map(|(v, _)| v)
    }

    /// Look up without touching recency/frequency
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.map.get(key).map(|(v, _)| v)
    }

    /// Mutable access without touching recency/frequency
    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key).map(|(v, _)| v)
    }

    /// Insert a value, returning the old value if present
    pub fn insert(&mut self, key: K, value: V, size: u64) -> Option<V> {
        self.policy.on_insert(&key);
        self.size_bytes += size;
        let old = self.map.insert(key, (value, size));
        old.map(|(v, old_size)| {
            self.size_bytes -= old_size;
            v
        })
    }

    /// Remove a value, returning it if present
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, size) = self.map.remove(key)?;
        self.policy.on_remove(key);
        self.size_bytes -= size;
        Some(value)
    }

    /// Remove the policy's eviction candidate
    pub fn pop_candidate(&mut self) -> Option<(K, V)> {
        let key = self.policy.eviction_candidate()?;
        match self.remove(&key) {
            Some(value) => Some((key, value)),
            None => {
                // Policy tracked a key the map no longer holds
                self.policy.on_remove(&key);
                None
            }
        }
    }

    /// Remove every entry matching the predicate
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        let mut dropped = Vec::new();
        for (key, (value, _)) in self.map.iter_mut() {
            if !keep(key, value) {
                dropped.push(key.clone());
            }
        }
        for key in &dropped {
            self.remove(key);
        }
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Live version floor for a key; an expired floor is dropped
    pub fn floor(&mut self, key: &K, now: u64) -> Option<u64> {
        match self.floors.get(key).copied() {
            Some((_, expires_at)) if now >= expires_at => {
                self.floors.remove(key);
                None
            }
            Some((version, _)) => Some(version),
            None => None,
        }
    }

    /// Raise a key's floor to at least `version` until `expires_at`. At most
    /// `limit` floors are held; the one closest to expiry makes room.
    pub fn raise_floor(&mut self, key: K, version: u64, expires_at: u64, limit: usize) {
        if let Some(floor) = self.floors.get_mut(&key) {
            floor.0 = floor.0.max(version);
            floor.1 = floor.1.max(expires_at);
            return;
        }
        if limit == 0 {
            return;
        }
        if self.floors.len() >= limit {
            let oldest = self
                .floors
                .iter()
                .min_by_key(|(_, &(_, expires))| expires)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.floors.remove(&oldest);
            }
        }
        self.floors.insert(key, (version, expires_at));
    }

    /// Drop expired floors; returns how many were removed
    pub fn purge_floors(&mut self, now: u64) -> usize {
        let before = self.floors.len();
        self.floors.retain(|_, &mut (_, expires_at)| now < expires_at);
        before - self.floors.len()
    }

    pub fn floor_count(&self) -> usize {
        self.floors.len()
    }

    pub fn clear_floors(&mut self) {
        self.floors.clear();
    }

    fn clear(&mut self) {
        self.map.clear();
        self.policy.clear();
        self.size_bytes = 0;
    }
}

/// Single shard containing its state and statistics
#[repr(align(64))]
pub struct Shard<K, V> {
    state: Mutex<ShardState<K, V>>,
    /// Number of reads
    reads: AtomicU64,
    /// Number of writes
    writes: AtomicU64,
}

impl<K: Clone + Hash + Eq + Send + 'static, V> Shard<K, V> {
    /// Create a new empty shard
    pub fn new(policy: EvictionPolicyKind) -> Self {
        Self {
            state: Mutex::new(ShardState {
                map: HashMap::new(),
                policy: policy.build(),
                size_bytes: 0,
                floors: HashMap::new(),
            }),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }
}

impl<K: Clone + Hash + Eq, V> Shard<K, V> {
    /// Run a read-path closure under the shard lock
    pub fn read<R>(&self, f: impl FnOnce(&mut ShardState<K, V>) -> R) -> R {
        self.reads.fetch_add(1, Ordering::Relaxed);
        f(&mut self.state.lock())
    }

    /// Run a write-path closure under the shard lock
    pub fn write<R>(&self, f: impl FnOnce(&mut ShardState<K, V>) -> R) -> R {
        self.writes.fetch_add(1, Ordering::Relaxed);
        f(&mut self.state.lock())
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.state.lock().size_bytes()
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.state.lock().clear();
    }
}

/// Sharded map with a power-of-two shard count
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
}

impl<K: Clone + Hash + Eq + Send + 'static, V> ShardedMap<K, V> {
    /// Create a sharded map; `shard_count` is rounded up to a power of two
    pub fn new(shard_count: usize, policy: EvictionPolicyKind) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        let shards: Vec<Shard<K, V>> = (0..count).map(|_| Shard::new(policy)).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }
}

impl<K: Clone + Hash + Eq, V> ShardedMap<K, V> {
    /// Get the shard count
    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Compute shard index from hash
    #[inline]
    pub fn shard_index(&self, key: &K) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (self.shards.len() - 1)
    }

    /// Shard owning a key
    #[inline]
    pub fn shard_for(&self, key: &K) -> &Shard<K, V> {
        &self.shards[self.shard_index(key)]
    }

    /// Get a reference to a specific shard
    #[inline]
    pub fn shard(&self, index: usize) -> &Shard<K, V> {
        &self.shards[index & (self.shards.len() - 1)]
    }

    /// Iterate over shards
    pub fn shards(&self) -> impl Iterator<Item = &Shard<K, V>> {
        self.shards.iter()
    }

    /// Get total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Get total size in bytes across all shards
    pub fn size_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.size_bytes()).sum()
    }

    pub fn total_reads(&self) -> u64 {
        self.shards.iter().map(|s| s.read_count()).sum()
    }

    pub fn total_writes(&self) -> u64 {
        self.shards.iter().map(|s| s.write_count()).sum()
    }

    /// Clear all shards
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_rounded_to_power_of_two() {
        let map: ShardedMap<String, u32> = ShardedMap::new(10, EvictionPolicyKind::Lru);
        assert_eq!(map.shard_count(), 16);
        assert!(map.is_empty());

        let map: ShardedMap<String, u32> = ShardedMap::new(0, EvictionPolicyKind::Lru);
        assert_eq!(map.shard_count(), 1);
    }

    #[test]
    fn test_insert_get_remove() {
        let map: ShardedMap<String, u32> = ShardedMap::new(4, EvictionPolicyKind::Lru);
        let key = "alpha".to_string();

        let old = map.shard_for(&key).write(|s| s.insert(key.clone(), 1, 10));
        assert!(old.is_none());
        assert_eq!(map.len(), 1);
        assert_eq!(map.size_bytes(), 10);

        let old = map.shard_for(&key).write(|s| s.insert(key.clone(), 2, 4));
        assert_eq!(old, Some(1));
        assert_eq!(map.size_bytes(), 4);

        let got = map.shard_for(&key).read(|s| s.get(&key).copied());
        assert_eq!(got, Some(2));

        let removed = map.shard_for(&key).write(|s| s.remove(&key));
        assert_eq!(removed, Some(2));
        assert!(map.is_empty());
        assert_eq!(map.size_bytes(), 0);
        assert_eq!(map.total_writes(), 3);
        assert_eq!(map.total_reads(), 1);
    }

    #[test]
    fn test_pop_candidate_follows_policy() {
        let map: ShardedMap<u32, u32> = ShardedMap::new(1, EvictionPolicyKind::Lru);
        let shard = map.shard(0);
        shard.write(|s| {
            s.insert(1, 10, 1);
            s.insert(2, 20, 1);
            s.insert(3, 30, 1);
        });
        shard.read(|s| s.get(&1).copied());

        let evicted = shard.write(|s| s.pop_candidate());
        assert_eq!(evicted, Some((2, 20)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_retain() {
        let map: ShardedMap<u32, u32> = ShardedMap::new(1, EvictionPolicyKind::Lfu);
        map.shard(0).write(|s| {
            for i in 0..10 {
                s.insert(i, i, 1);
            }
        });

        let dropped = map.shard(0).write(|s| s.retain(|_, v| *v % 2 == 0));
        assert_eq!(dropped, 5);
        assert_eq!(map.len(), 5);
        assert_eq!(map.size_bytes(), 5);
    }

    #[test]
    fn test_floors_expire_and_stay_bounded() {
        let map: ShardedMap<u32, u32> = ShardedMap::new(1, EvictionPolicyKind::Lru);
        map.shard(0).write(|s| {
            s.raise_floor(1, 5, 100, 2);
            s.raise_floor(1, 3, 100, 2);
            assert_eq!(s.floor(&1, 50), Some(5));

            s.raise_floor(2, 7, 200, 2);
            // Full: the floor closest to expiry goes
            s.raise_floor(3, 9, 300, 2);
            assert_eq!(s.floor_count(), 2);
            assert_eq!(s.floor(&1, 50), None);
            assert_eq!(s.floor(&3, 50), Some(9));

            assert_eq!(s.floor(&2, 200), None);
            assert_eq!(s.purge_floors(300), 1);
            assert_eq!(s.floor_count(), 0);
        });
    }

    #[test]
    fn test_clear() {
        let map: ShardedMap<u32, u32> = ShardedMap::new(8, EvictionPolicyKind::Lru);
        for i in 0..100u32 {
            map.shard_for(&i).write(|s| s.insert(i, i, 2));
        }
        assert_eq!(map.len(), 100);
        assert_eq!(map.size_bytes(), 200);

        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.size_bytes(), 0);
    }
}
