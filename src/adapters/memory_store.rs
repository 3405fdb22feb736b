//! In-Memory Shard Store
//!
//! Implements the `ShardTransport` port as a shard node living in the same
//! process. Per-key state (entry, version counter, lease, failure record)
//! sits in one DashMap slot so every conditional operation is atomic under
//! the slot's shard lock.
//!
//! Fault injection (`set_available`, `set_latency`) lets tests and the demo
//! binary exercise degraded-node and deadline paths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::cache::{millis, CacheEntry, CacheKey, CacheValue, FailedLoad, Lease, NodeId};
use crate::domain::ports::{Clock, DeleteOutcome, SetOutcome, ShardConnector, ShardTransport};
use crate::error::{Error, Result};

/// How long an empty slot keeps its version counter after the last write
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(60);

/// Per-key state. The version counter survives deletes until the slot has
/// been idle for the tombstone TTL.
#[derive(Debug, Default)]
struct KeySlot {
    entry: Option<CacheEntry>,
    last_version: u64,
    lease: Option<Lease>,
    failure: Option<FailedLoad>,
    touched_at: u64,
}

impl KeySlot {
    fn is_idle(&self, now: u64, tombstone_ttl: u64) -> bool {
        self.entry.is_none()
            && self.lease.is_none()
            && self.failure.is_none()
            && now.saturating_sub(self.touched_at) >= tombstone_ttl
    }
}

/// Shard store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardStoreStats {
    /// Live entries
    pub entries: u64,
    /// Slots held, including tombstones
    pub slots: u64,
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub lease_grants: u64,
    pub lease_denials: u64,
    pub lease_rejections: u64,
}

/// In-memory shard node
pub struct InMemoryShardStore {
    node_id: NodeId,
    clock: Arc<dyn Clock>,
    slots: DashMap<CacheKey, KeySlot>,
    tombstone_ttl: Duration,
    next_token: AtomicU64,
    available: AtomicBool,
    latency_ms: AtomicU64,
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    lease_grants: AtomicU64,
    lease_denials: AtomicU64,
    lease_rejections: AtomicU64,
}

impl InMemoryShardStore {
    /// Create a new shard node
    pub fn new(node_id: impl Into<NodeId>, clock: Arc<dyn Clock>) -> Self {
        Self {
            node_id: node_id.into(),
            clock,
            slots: DashMap::new(),
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            next_token: AtomicU64::new(1),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            lease_grants: AtomicU64::new(0),
            lease_denials: AtomicU64::new(0),
            lease_rejections: AtomicU64::new(0),
        }
    }

    /// Keep empty slots (and their version counters) for `ttl` after the last write
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    /// Simulate the node going down / coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Add artificial latency to every call
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(millis(latency), Ordering::SeqCst);
    }

    /// Drop expired entries, leases and failure records, then slots idle
    /// past the tombstone TTL. Returns the number of entries dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let tombstone_ttl = millis(self.tombstone_ttl);
        let mut purged = 0;
        self.slots.retain(|_, slot| {
            if slot.entry.as_ref().is_some_and(|e| e.is_expired(now)) {
                slot.entry = None;
                purged += 1;
            }
            if slot.lease.as_ref().is_some_and(|l| l.is_expired(now)) {
                slot.lease = None;
            }
            if slot.failure.as_ref().is_some_and(|f| f.is_expired(now)) {
                slot.failure = None;
            }
            !slot.is_idle(now, tombstone_ttl)
        });
        if purged > 0 {
            debug!(node = %self.node_id, purged, slots = self.slots.len(), "Purged expired entries");
        }
        purged
    }

    /// Get store statistics
    pub fn stats(&self) -> ShardStoreStats {
        let now = self.clock.now_millis();
        let entries = self
            .slots
            .iter()
            .filter(|s| s.entry.as_ref().is_some_and(|e| !e.is_expired(now)))
            .count() as u64;

        ShardStoreStats {
            entries,
            slots: self.slots.len() as u64,
            gets: self.gets.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            lease_grants: self.lease_grants.load(Ordering::Relaxed),
            lease_denials: self.lease_denials.load(Ordering::Relaxed),
            lease_rejections: self.lease_rejections.load(Ordering::Relaxed),
        }
    }

    /// Fail fast when down, otherwise apply injected latency
    async fn enter(&self) -> Result<()> {
        if !self.is_available() {
            return Err(Error::transport(&self.node_id, "node unavailable"));
        }
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
            if !self.is_available() {
                return Err(Error::transport(&self.node_id, "node unavailable"));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryShardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryShardStore")
            .field("node_id", &self.node_id)
            .field("available", &self.is_available())
            .field("slots", &self.slots.len())
            .finish()
    }
}

#[async_trait]
impl ShardTransport for InMemoryShardStore {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        self.enter().await?;
        self.gets.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now_millis();
        Ok(self
            .slots
            .get(key)
            .and_then(|slot| slot.entry.clone())
            .filter(|entry| !entry.is_expired(now)))
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Duration,
        lease: Option<&Lease>,
    ) -> Result<SetOutcome> {
        self.enter().await?;
        self.sets.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now_millis();
        let mut slot = self.slots.entry(key.clone()).or_default();

        if let Some(presented) = lease {
            let live = slot
                .lease
                .as_ref()
                .is_some_and(|held| held.is_same_grant(presented) && !held.is_expired(now));
            if !live {
                self.lease_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(node = %self.node_id, key = %key, token = presented.token, "Rejected write under stale lease");
                return Ok(SetOutcome::LeaseRejected);
            }
        } else if slot.lease.take().is_some() {
            // A recompute started before this write must not land after it
            debug!(node = %self.node_id, key = %key, "Revoked lease on unconditional write");
        }

        let version = slot.last_version + 1;
        slot.last_version = version;
        slot.failure = None;
        slot.touched_at = now;
        slot.entry = Some(CacheEntry {
            key: key.clone(),
            value,
            created_at: now,
            expires_at: now.saturating_add(millis(ttl)),
            version,
        });

        Ok(SetOutcome::Stored { version })
    }

    async fn delete(&self, key: &CacheKey) -> Result<DeleteOutcome> {
        self.enter().await?;
        self.deletes.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now_millis();
        match self.slots.get_mut(key) {
            Some(mut slot) => {
                let existed = slot
                    .entry
                    .take()
                    .is_some_and(|entry| !entry.is_expired(now));
                // Revoke: an in-flight recompute must not write back a value
                // computed before this delete
                slot.lease = None;
                slot.failure = None;
                slot.touched_at = now;
                Ok(DeleteOutcome {
                    existed,
                    fence_version: slot.last_version + 1,
                })
            }
            None => Ok(DeleteOutcome {
                existed: false,
                fence_version: 1,
            }),
        }
    }

    async fn set_lease_if_absent(
        &self,
        key: &CacheKey,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        self.enter().await?;

        let now = self.clock.now_millis();
        let mut slot = self.slots.entry(key.clone()).or_default();

        if slot.lease.as_ref().is_some_and(|l| !l.is_expired(now)) {
            self.lease_denials.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let lease = Lease {
            key: key.clone(),
            holder_id: holder_id.to_string(),
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            acquired_at: now,
            expires_at: now.saturating_add(millis(ttl)),
        };
        slot.lease = Some(lease.clone());
        slot.failure = None;
        slot.touched_at = now;
        self.lease_grants.fetch_add(1, Ordering::Relaxed);

        Ok(Some(lease))
    }

    async fn delete_lease_if_owner(&self, lease: &Lease) -> Result<bool> {
        self.enter().await?;

        match self.slots.get_mut(&lease.key) {
            Some(mut slot) => {
                if slot.lease.as_ref().is_some_and(|held| held.is_same_grant(lease)) {
                    slot.lease = None;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => Ok(false),
        }
    }

    async fn get_lease(&self, key: &CacheKey) -> Result<Option<Lease>> {
        self.enter().await?;

        let now = self.clock.now_millis();
        Ok(self
            .slots
            .get(key)
            .and_then(|slot| slot.lease.clone())
            .filter(|lease| !lease.is_expired(now)))
    }

    async fn fail_lease_if_owner(
        &self,
        lease: &Lease,
        reason: &str,
        retain: Duration,
    ) -> Result<bool> {
        self.enter().await?;

        let now = self.clock.now_millis();
        match self.slots.get_mut(&lease.key) {
            Some(mut slot) => {
                if !slot.lease.as_ref().is_some_and(|held| held.is_same_grant(lease)) {
                    return Ok(false);
                }
                slot.lease = None;
                slot.failure = Some(FailedLoad {
                    key: lease.key.clone(),
                    holder_id: lease.holder_id.clone(),
                    token: lease.token,
                    reason: reason.to_string(),
                    failed_at: now,
                    expires_at: now.saturating_add(millis(retain)),
                });
                slot.touched_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_failure(&self, key: &CacheKey) -> Result<Option<FailedLoad>> {
        self.enter().await?;

        let now = self.clock.now_millis();
        Ok(self
            .slots
            .get(key)
            .and_then(|slot| slot.failure.clone())
            .filter(|failure| !failure.is_expired(now)))
    }

    async fn ping(&self) -> Result<()> {
        self.enter().await
    }
}

// =============================================================================
// In-Memory Cluster
// =============================================================================

/// Set of in-memory shard nodes shared by every simulated process.
///
/// `connect` hands out the same store for a node id on every call, creating
/// it on first use, so several caches built on one cluster see one shared tier.
#[derive(Debug)]
pub struct InMemoryCluster {
    clock: Arc<dyn Clock>,
    nodes: DashMap<NodeId, Arc<InMemoryShardStore>>,
}

impl InMemoryCluster {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            nodes: DashMap::new(),
        }
    }

    /// Store for a node, created if missing
    pub fn node(&self, node: impl Into<NodeId>) -> Arc<InMemoryShardStore> {
        let node = node.into();
        self.nodes
            .entry(node.clone())
            .or_insert_with(|| Arc::new(InMemoryShardStore::new(node, self.clock.clone())))
            .clone()
    }

    /// Store for a node, if it was ever created
    pub fn get(&self, node: &NodeId) -> Option<Arc<InMemoryShardStore>> {
        self.nodes.get(node).map(|n| n.value().clone())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|n| n.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Purge expired entries on every node
    pub fn purge_expired(&self) -> usize {
        self.nodes.iter().map(|n| n.purge_expired()).sum()
    }
}

impl ShardConnector for InMemoryCluster {
    fn connect(&self, node: &NodeId) -> Result<Arc<dyn ShardTransport>> {
        let store: Arc<dyn ShardTransport> = self.node(node.clone());
        Ok(store)
    }
}

// =============================================================================
// Tests
// =============================================================================
