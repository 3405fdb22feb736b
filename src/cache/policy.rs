//! Cache Eviction Policies
//!
//! Eviction is a capability (`on_insert` / `on_access` / `on_remove` /
//! `eviction_candidate`) so the local tier can swap LRU for LFU without
//! branching on the policy itself.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Eviction policy capability
pub trait EvictionPolicy<K>: Send {
    /// Policy name for logs and stats
    fn name(&self) -> &'static str;

    /// A key was inserted (or overwritten)
    fn on_insert(&mut self, key: &K);

    /// A key was read
    fn on_access(&mut self, key: &K);

    /// A key left the cache for any reason
    fn on_remove(&mut self, key: &K);

    /// Key that should be evicted next, if any
    fn eviction_candidate(&self) -> Option<K>;

    /// Number of tracked keys
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every key
    fn clear(&mut self);
}

/// Which policy the local tier uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicyKind {
    /// Least recently used (default)
    #[default]
    Lru,
    /// Least frequently used, LRU among equal frequencies
    Lfu,
}

impl EvictionPolicyKind {
    /// Instantiate the policy
    pub fn build<K>(&self) -> Box<dyn EvictionPolicy<K>>
    where
        K: Clone + Hash + Eq + Send + 'static,
    {
        match self {
            EvictionPolicyKind::Lru => Box::new(LruPolicy::new()),
            EvictionPolicyKind::Lfu => Box::new(LfuPolicy::new()),
        }
    }
}

impl fmt::Display for EvictionPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicyKind::Lru => write!(f, "LRU"),
            EvictionPolicyKind::Lfu => write!(f, "LFU"),
        }
    }
}

impl std::str::FromStr for EvictionPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicyKind::Lru),
            "lfu" => Ok(EvictionPolicyKind::Lfu),
            other => Err(format!("unknown eviction policy: {}", other)),
        }
    }
}

// =============================================================================
// LRU
// =============================================================================

/// Least-recently-used ordering via a logical clock
pub struct LruPolicy<K> {
    tick: u64,
    ticks: HashMap<K, u64>,
    order: BTreeMap<u64, K>,
}

impl<K> Default for LruPolicy<K> {
    fn default() -> Self {
        Self {
            tick: 0,
            ticks: HashMap::new(),
            order: BTreeMap::new(),
        }
    }
}

impl<K: Clone + Hash + Eq> LruPolicy<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self, key: &K) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(old) = self.ticks.insert(key.clone(), tick) {
            self.order.remove(&old);
        }
        self.order.insert(tick, key.clone());
    }
}

impl<K: Clone + Hash + Eq + Send> EvictionPolicy<K> for LruPolicy<K> {
    fn name(&self) -> &'static str {
        "LRU"
    }

    fn on_insert(&mut self, key: &K) {
        self.touch(key);
    }

    fn on_access(&mut self, key: &K) {
        if self.ticks.contains_key(key) {
            self.touch(key);
        }
    }

    fn on_remove(&mut self, key: &K) {
        if let Some(tick) = self.ticks.remove(key) {
            self.order.remove(&tick);
        }
    }

    fn eviction_candidate(&self) -> Option<K> {
        self.order.values().next().cloned()
    }

    fn len(&self) -> usize {
        self.ticks.len()
    }

    fn clear(&mut self) {
        self.ticks.clear();
        self.order.clear();
    }
}

// =============================================================================
// LFU
// =============================================================================

/// Least-frequently-used ordering; recency breaks ties
pub struct LfuPolicy<K> {
    tick: u64,
    meta: HashMap<K, (u64, u64)>,
    order: BTreeMap<(u64, u64), K>,
}

impl<K> Default for LfuPolicy<K> {
    fn default() -> Self {
        Self {
            tick: 0,
            meta: HashMap::new(),
            order: BTreeMap::new(),
        }
    }
}

impl<K: Clone + Hash + Eq> LfuPolicy<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&mut self, key: &K, reset: bool) {
        self.tick += 1;
        let tick = self.tick;
        let freq = match self.meta.get(key) {
            Some(&(freq, old_tick)) => {
                self.order.remove(&(freq, old_tick));
                if reset {
                    1
                } else {
                    freq.saturating_add(1)
                }
            }
            None => 1,
        };
        self.meta.insert(key.clone(), (freq, tick));
        self.order.insert((freq, tick), key.clone());
    }

    /// Access frequency tracked for a key
    pub fn frequency(&self, key: &K) -> Option<u64> {
        self.meta.get(key).map(|&(freq, _)| freq)
    }
}

impl<K: Clone + Hash + Eq + Send> EvictionPolicy<K> for LfuPolicy<K> {
    fn name(&self) -> &'static str {
        "LFU"
    }

    fn on_insert(&mut self, key: &K) {
        // Overwrite keeps accumulated frequency
        let reset = !self.meta.contains_key(key);
        self.bump(key, reset);
    }

    fn on_access(&mut self, key: &K) {
        if self.meta.contains_key(key) {
            self.bump(key, false);
        }
    }

    fn on_remove(&mut self, key: &K) {
        if let Some(pos) = self.meta.remove(key) {
            self.order.remove(&pos);
        }
    }

    fn eviction_candidate(&self) -> Option<K> {
        self.order.values().next().cloned()
    }

    fn len(&self) -> usize {
        self.meta.len()
    }

    fn clear(&mut self) {
        self.meta.clear();
        self.order.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_evicts_least_recent() {
        let mut policy = LruPolicy::new();
        policy.on_insert(&"a");
        policy.on_insert(&"b");
        policy.on_insert(&"c");

        assert_eq!(policy.eviction_candidate(), Some("a"));

        policy.on_access(&"a");
        assert_eq!(policy.eviction_candidate(), Some("b"));

        policy.on_remove(&"b");
        assert_eq!(policy.eviction_candidate(), Some("c"));
        assert_eq!(policy.len(), 2);
    }

    #[test]
    fn test_lru_access_of_unknown_key_is_ignored() {
        let mut policy = LruPolicy::new();
        policy.on_access(&"ghost");
        assert!(policy.is_empty());
        assert_eq!(policy.eviction_candidate(), None);
    }

    #[test]
    fn test_lfu_evicts_least_frequent() {
        let mut policy = LfuPolicy::new();
        policy.on_insert(&"hot");
        policy.on_insert(&"cold");

        for _ in 0..5 {
            policy.on_access(&"hot");
        }

        assert_eq!(policy.frequency(&"hot"), Some(6));
        assert_eq!(policy.eviction_candidate(), Some("cold"));
    }

    #[test]
    fn test_lfu_ties_broken_by_recency() {
        let mut policy = LfuPolicy::new();
        policy.on_insert(&"first");
        policy.on_insert(&"second");

        assert_eq!(policy.eviction_candidate(), Some("first"));

        policy.on_access(&"first");
        policy.on_access(&"second");
        assert_eq!(policy.eviction_candidate(), Some("first"));
    }

    #[test]
    fn test_lfu_overwrite_keeps_frequency() {
        let mut policy = LfuPolicy::new();
        policy.on_insert(&"k");
        policy.on_access(&"k");
        policy.on_insert(&"k");
        assert_eq!(policy.frequency(&"k"), Some(3));
    }

    #[test]
    fn test_policy_kind_build_and_parse() {
        let lru: Box<dyn EvictionPolicy<u32>> = EvictionPolicyKind::Lru.build();
        let lfu: Box<dyn EvictionPolicy<u32>> = EvictionPolicyKind::Lfu.build();
        assert_eq!(lru.name(), "LRU");
        assert_eq!(lfu.name(), "LFU");

        assert_eq!("LFU".parse::<EvictionPolicyKind>(), Ok(EvictionPolicyKind::Lfu));
        assert!("arc".parse::<EvictionPolicyKind>().is_err());
        assert_eq!(EvictionPolicyKind::default(), EvictionPolicyKind::Lru);
    }

    #[test]
    fn test_clear() {
        let mut policy = LfuPolicy::new();
        policy.on_insert(&1);
        policy.on_insert(&2);
        policy.clear();
        assert!(policy.is_empty());
        assert_eq!(policy.eviction_candidate(), None);
    }
}
