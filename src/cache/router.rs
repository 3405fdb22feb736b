//! Shard Router
//!
//! Consistent hashing with virtual nodes. Each physical node is hashed onto a
//! 64-bit ring at `virtual_nodes` positions (`"<node>#<i>"`); a key is owned
//! by the first position clockwise from its own hash.
//!
//! ```text
//!            0 ─────────────── key ──▶ shard-b#17 ──────────── 2^64
//!                 shard-a#3        (owner)          shard-c#90
//! ```
//!
//! Membership is an immutable [`ShardMap`] snapshot behind an `ArcSwap`.
//! Readers load one snapshot per request and never block on a rebuild; an old
//! map lives until the last request holding it finishes.
//!
//! A node marked degraded is skipped: the key moves to the next distinct
//! physical node clockwise (its secondary position) until the node recovers.
//!
//! Every change that can move a key to another node (membership, degrade,
//! recovery) bumps the placement generation. Versions are per node, so local
//! copies taken under one placement are not comparable with the next.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::entry::{stable_hash, CacheKey, NodeId};
use crate::domain::ports::MembershipSource;
use crate::error::{Error, Result};

/// Default virtual nodes per physical node
pub const DEFAULT_VIRTUAL_NODES: usize = 160;

/// Router configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Ring positions per physical node (100-200 recommended)
    pub virtual_nodes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

// =============================================================================
// ShardMap
// =============================================================================

/// Immutable hash ring for one membership epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMap {
    epoch: u64,
    virtual_nodes: usize,
    /// Sorted by hash, one owner per position
    ring: Vec<(u64, NodeId)>,
    members: BTreeSet<NodeId>,
}

impl ShardMap {
    /// Map with no nodes
    pub fn empty(virtual_nodes: usize) -> Self {
        Self {
            epoch: 0,
            virtual_nodes,
            ring: Vec::new(),
            members: BTreeSet::new(),
        }
    }

    /// Build the ring for a membership set
    pub fn build(members: &BTreeSet<NodeId>, virtual_nodes: usize, epoch: u64) -> Self {
        let virtual_nodes = virtual_nodes.max(1);
        let mut ring: Vec<(u64, NodeId)> = Vec::with_capacity(members.len() * virtual_nodes);
        for node in members {
            for i in 0..virtual_nodes {
                let point = format!("{}#{}", node, i);
                ring.push((stable_hash(point.as_bytes()), node.clone()));
            }
        }

        // Ties keep the lexicographically smaller node
        ring.sort();
        ring.dedup_by_key(|(hash, _)| *hash);

        Self {
            epoch,
            virtual_nodes,
            ring,
            members: members.clone(),
        }
    }

    /// Owner of a key, or None on an empty ring
    pub fn route(&self, key: &CacheKey) -> Option<&NodeId> {
        if self.ring.is_empty() {
            return None;
        }
        let idx = self.start_index(key.ring_position());
        Some(&self.ring[idx].1)
    }

    /// Distinct physical nodes in clockwise order from the key; the first is the owner
    pub fn preference_list(&self, key: &CacheKey) -> Vec<&NodeId> {
        let mut nodes: Vec<&NodeId> = Vec::with_capacity(self.members.len());
        if self.ring.is_empty() {
            return nodes;
        }

        let start = self.start_index(key.ring_position());
        for offset in 0..self.ring.len() {
            let node = &self.ring[(start + offset) % self.ring.len()].1;
            if !nodes.contains(&node) {
                nodes.push(node);
                if nodes.len() == self.members.len() {
                    break;
                }
            }
        }
        nodes
    }

    /// First ring index clockwise from `hash`, wrapping at the top
    fn start_index(&self, hash: u64) -> usize {
        let idx = self.ring.partition_point(|(point, _)| *point < hash);
        if idx == self.ring.len() {
            0
        } else {
            idx
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    pub fn members(&self) -> &BTreeSet<NodeId> {
        &self.members
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    /// Number of ring positions
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Ring positions owned by a node
    pub fn positions_of(&self, node: &NodeId) -> usize {
        self.ring.iter().filter(|(_, owner)| owner == node).count()
    }

    /// Ring points in order
    pub fn points(&self) -> impl Iterator<Item = (u64, &NodeId)> {
        self.ring.iter().map(|(hash, node)| (*hash, node))
    }
}

// =============================================================================
// ShardRouter
// =============================================================================

/// Routes keys against the current [`ShardMap`] snapshot
pub struct ShardRouter {
    config: RouterConfig,
    map: ArcSwap<ShardMap>,
    degraded: DashMap<NodeId, String>,
    /// Bumped whenever key placement may have changed
    placement: AtomicU64,
    /// Serializes membership changes
    update_lock: Mutex<()>,
}

impl ShardRouter {
    /// Create a router over an initial membership
    pub fn new<I, N>(config: RouterConfig, members: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        let members: BTreeSet<NodeId> = members.into_iter().map(Into::into).collect();
        let map = ShardMap::build(&members, config.virtual_nodes, 1);
        Self {
            config,
            map: ArcSwap::from_pointee(map),
            degraded: DashMap::new(),
            placement: AtomicU64::new(1),
            update_lock: Mutex::new(()),
        }
    }

    /// Current snapshot; hold it for the duration of one request
    pub fn snapshot(&self) -> Arc<ShardMap> {
        self.map.load_full()
    }

    /// Owner of a key, ignoring node health
    pub fn route(&self, key: &CacheKey) -> Option<NodeId> {
        self.map.load().route(key).cloned()
    }

    /// Owner of a key among healthy nodes
    pub fn route_healthy(&self, key: &CacheKey) -> Result<NodeId> {
        let map = self.map.load();
        if map.is_empty() {
            return Err(Error::ShardUnavailable("no shard nodes".into()));
        }
        map.preference_list(key)
            .into_iter()
            .find(|node| !self.degraded.contains_key(*node))
            .cloned()
            .ok_or_else(|| Error::ShardUnavailable("all shard nodes degraded".into()))
    }

    /// Replace membership; returns the new map
    pub fn rebuild<I, N>(&self, members: I) -> Arc<ShardMap>
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        let members: BTreeSet<NodeId> = members.into_iter().map(Into::into).collect();
        let _guard = self.update_lock.lock();
        self.install(members)
    }

    /// Add a node; false if already a member
    pub fn add_node(&self, node: impl Into<NodeId>) -> bool {
        let node = node.into();
        let _guard = self.update_lock.lock();
        let mut members = self.map.load().members().clone();
        if !members.insert(node.clone()) {
            return false;
        }
        let map = self.install(members);
        info!(node = %node, epoch = map.epoch(), "Shard node added");
        true
    }

    /// Remove a node; false if not a member
    pub fn remove_node(&self, node: &NodeId) -> bool {
        let _guard = self.update_lock.lock();
        let mut members = self.map.load().members().clone();
        if !members.remove(node) {
            return false;
        }
        self.degraded.remove(node);
        let map = self.install(members);
        info!(node = %node, epoch = map.epoch(), "Shard node removed");
        true
    }

    /// Fetch membership from a source. On failure the current map keeps
    /// serving and the error is returned. `Ok(true)` if the map changed.
    pub async fn refresh_from(&self, source: &dyn MembershipSource) -> Result<bool> {
        let members = match source.fetch_members().await {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, epoch = self.map.load().epoch(), "Membership fetch failed, keeping last-known-good shard map");
                return Err(e);
            }
        };

        let _guard = self.update_lock.lock();
        if self.map.load().members() == &members {
            return Ok(false);
        }
        self.degraded.retain(|node, _| members.contains(node));
        let map = self.install(members);
        info!(epoch = map.epoch(), members = map.members().len(), "Shard map refreshed");
        Ok(true)
    }

    /// Build and swap in a map; caller holds `update_lock`
    fn install(&self, members: BTreeSet<NodeId>) -> Arc<ShardMap> {
        let epoch = self.map.load().epoch() + 1;
        let map = Arc::new(ShardMap::build(&members, self.config.virtual_nodes, epoch));
        self.map.store(map.clone());
        self.placement.fetch_add(1, Ordering::AcqRel);
        map
    }

    /// Route around a node; true if it was healthy before
    pub fn mark_degraded(&self, node: &NodeId, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let newly = self.degraded.insert(node.clone(), reason.clone()).is_none();
        if newly {
            self.placement.fetch_add(1, Ordering::AcqRel);
            warn!(node = %node, reason = %reason, "Shard node marked degraded");
        }
        newly
    }

    /// Route to a node again; true if it was degraded
    pub fn mark_healthy(&self, node: &NodeId) -> bool {
        let restored = self.degraded.remove(node).is_some();
        if restored {
            self.placement.fetch_add(1, Ordering::AcqRel);
            info!(node = %node, "Shard node healthy again");
        }
        restored
    }

    pub fn is_degraded(&self, node: &NodeId) -> bool {
        self.degraded.contains_key(node)
    }

    /// Degraded nodes with the reason they were marked
    pub fn degraded_nodes(&self) -> Vec<(NodeId, String)> {
        let mut nodes: Vec<_> = self
            .degraded
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        nodes.sort();
        nodes
    }

    pub fn members(&self) -> BTreeSet<NodeId> {
        self.map.load().members().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.map.load().epoch()
    }

    /// Changes whenever a key may now route to a different node
    pub fn placement_generation(&self) -> u64 {
        self.placement.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }
}

impl std::fmt::Debug for ShardRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.map.load();
        f.debug_struct("ShardRouter")
            .field("epoch", &map.epoch())
            .field("members", map.members())
            .field("degraded", &self.degraded.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
