//! Property-Based Tests for the Shard Router
//!
//! # Test Properties
//!
//! 1. **Determinism**: the same membership always routes a key to the same node
//! 2. **Ring Order**: ring points are strictly increasing
//! 3. **Minimal Movement on Join**: keys only ever move to the joining node
//! 4. **Minimal Movement on Leave**: only keys owned by the leaving node move

#![cfg(test)]

use std::collections::BTreeSet;

use proptest::prelude::*;

use super::entry::{CacheKey, NodeId};
use super::router::ShardMap;

// =============================================================================
// Property Strategies
// =============================================================================

/// 1-8 distinct node names
fn members_strategy() -> impl Strategy<Value = BTreeSet<NodeId>> {
    prop::collection::btree_set("[a-z]{1,6}-[0-9]{1,2}", 1..=8)
        .prop_map(|names| names.into_iter().map(NodeId::from).collect())
}

/// Arbitrary byte keys
fn keys_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 1..200)
}

fn virtual_nodes_strategy() -> impl Strategy<Value = usize> {
    8usize..=64
}

// =============================================================================
// Routing Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: routing depends only on membership, never on build order or epoch.
    #[test]
    fn prop_route_is_deterministic(
        members in members_strategy(),
        keys in keys_strategy(),
        vnodes in virtual_nodes_strategy(),
    ) {
        let a = ShardMap::build(&members, vnodes, 1);
        let b = ShardMap::build(&members, vnodes, 99);

        for raw in keys {
            let key = CacheKey::from(raw);
            let owner = a.route(&key);
            prop_assert!(owner.is_some());
            prop_assert!(members.contains(owner.unwrap()));
            prop_assert_eq!(owner, b.route(&key));
        }
    }

    /// Property: the ring is strictly hash-ordered.
    #[test]
    fn prop_ring_is_ordered(
        members in members_strategy(),
        vnodes in virtual_nodes_strategy(),
    ) {
        let map = ShardMap::build(&members, vnodes, 1);
        let points: Vec<u64> = map.points().map(|(hash, _)| hash).collect();
        prop_assert!(points.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(map.len() <= members.len() * vnodes);
    }

    /// Property: when a node joins, every remapped key lands on the new node.
    #[test]
    fn prop_join_moves_keys_only_to_newcomer(
        members in members_strategy(),
        keys in keys_strategy(),
        vnodes in virtual_nodes_strategy(),
    ) {
        let newcomer = NodeId::from("joining-node");
        prop_assume!(!members.contains(&newcomer));

        let before = ShardMap::build(&members, vnodes, 1);
        let mut grown = members.clone();
        grown.insert(newcomer.clone());
        let after = ShardMap::build(&grown, vnodes, 2);

        for raw in keys {
            let key = CacheKey::from(raw);
            let old = before.route(&key);
            let new = after.route(&key);
            if old != new {
                prop_assert_eq!(new, Some(&newcomer));
            }
        }
    }

    /// Property: when a node leaves, only its keys move.
    #[test]
    fn prop_leave_moves_only_departed_keys(
        members in members_strategy(),
        keys in keys_strategy(),
        vnodes in virtual_nodes_strategy(),
    ) {
        prop_assume!(members.len() >= 2);
        let leaving = members.iter().next().cloned().unwrap();

        let before = ShardMap::build(&members, vnodes, 1);
        let mut shrunk = members.clone();
        shrunk.remove(&leaving);
        let after = ShardMap::build(&shrunk, vnodes, 2);

        for raw in keys {
            let key = CacheKey::from(raw);
            let old = before.route(&key).cloned();
            let new = after.route(&key).cloned();
            if old != new {
                prop_assert_eq!(old, Some(leaving.clone()));
            }
        }
    }

    /// Property: the preference list visits every member exactly once.
    #[test]
    fn prop_preference_list_covers_members(
        members in members_strategy(),
        keys in keys_strategy(),
    ) {
        let map = ShardMap::build(&members, 16, 1);
        for raw in keys {
            let key = CacheKey::from(raw);
            let list = map.preference_list(&key);
            prop_assert_eq!(list.len(), members.len());
            let distinct: BTreeSet<&NodeId> = list.iter().copied().collect();
            prop_assert_eq!(distinct.len(), members.len());
            prop_assert_eq!(Some(list[0]), map.route(&key));
        }
    }
}
