//! L2 Cache - Shared Tier Client
//!
//! Talks to the shard node a key routes to. Owns TTL bookkeeping, negative
//! caching and invalidation publishing.
//!
//! # Failure handling
//!
//! ```text
//! call ──▶ owner ──(transient error)──▶ retry with backoff ──▶ ... ──▶ mark degraded
//!                                                                          │
//!          secondary owner ◀──────────────── route_healthy ◀───────────────┘
//! ```
//!
//! Every call is bounded by the caller's [`Deadline`]. When all nodes are
//! degraded the call fails with `ShardUnavailable` and the caller decides
//! whether to fall back to the loader.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::deadline::Deadline;
use super::entry::{CacheEntry, CacheKey, CacheValue, FailedLoad, Lease, NodeId};
use super::router::ShardRouter;
use crate::domain::events::InvalidationEvent;
use crate::domain::ports::{
    Clock, DeleteOutcome, InvalidationTransport, SetOutcome, ShardTransport,
};
use crate::error::{Error, Result};

/// L2 configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct L2Config {
    /// TTL for values when the caller gives none
    #[serde(with = "super::duration_ms")]
    pub default_ttl: Duration,
    /// TTL for "not found upstream" markers
    #[serde(with = "super::duration_ms")]
    pub negative_ttl: Duration,
    /// Upper bound for one round trip
    #[serde(with = "super::duration_ms")]
    pub call_timeout: Duration,
    /// Retries on the same node before it is marked degraded
    pub max_retries: u32,
    /// First backoff; doubles per retry
    #[serde(with = "super::duration_ms")]
    pub retry_backoff: Duration,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(30),
            call_timeout: Duration::from_millis(250),
            max_retries: 2,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Default)]
struct L2Counters {
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    negative_hits: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    lease_rejections: AtomicU64,
    transport_errors: AtomicU64,
    retries: AtomicU64,
    failovers: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
}

/// L2 statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct L2Stats {
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub negative_hits: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Populates refused because the lease was revoked or expired
    pub lease_rejections: u64,
    pub transport_errors: u64,
    pub retries: u64,
    /// Times a node was given up on and routing moved to the next one
    pub failovers: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub degraded_nodes: Vec<String>,
}

/// Shared tier client
pub struct SharedTier {
    config: L2Config,
    router: Arc<ShardRouter>,
    nodes: DashMap<NodeId, Arc<dyn ShardTransport>>,
    bus: Arc<dyn InvalidationTransport>,
    clock: Arc<dyn Clock>,
    publisher_id: String,
    counters: L2Counters,
}

impl SharedTier {
    /// Create a client. Membership comes from `router`; transports are
    /// registered separately with [`SharedTier::register_node`].
    pub fn new(
        config: L2Config,
        router: Arc<ShardRouter>,
        bus: Arc<dyn InvalidationTransport>,
        clock: Arc<dyn Clock>,
        publisher_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            router,
            nodes: DashMap::new(),
            bus,
            clock,
            publisher_id: publisher_id.into(),
            counters: L2Counters::default(),
        }
    }

    /// Register a transport and add its node to the ring
    pub fn register_node(&self, transport: Arc<dyn ShardTransport>) -> bool {
        let node = transport.node_id().clone();
        self.nodes.insert(node.clone(), transport);
        self.router.add_node(node)
    }

    /// Make a transport known without changing membership
    pub fn attach_transport(&self, transport: Arc<dyn ShardTransport>) {
        self.nodes.insert(transport.node_id().clone(), transport);
    }

    /// Remove a node from the ring and drop its transport
    pub fn unregister_node(&self, node: &NodeId) -> bool {
        self.nodes.remove(node);
        self.router.remove_node(node)
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    pub fn config(&self) -> &L2Config {
        &self.config
    }

    pub fn publisher_id(&self) -> &str {
        &self.publisher_id
    }

    /// Transport for a node, if attached
    pub fn transport(&self, node: &NodeId) -> Option<Arc<dyn ShardTransport>> {
        self.nodes.get(node).map(|t| t.value().clone())
    }

    // =========================================================================
    // Entry operations
    // =========================================================================

    /// Fetch a live entry (value or negative marker)
    pub async fn get(&self, key: &CacheKey, deadline: Deadline) -> Result<Option<CacheEntry>> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let entry = self.call(key, deadline, |t| async move { t.get(key).await }).await?;

        match &entry {
            Some(e) if e.is_negative() => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.counters.negative_hits.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(entry)
    }

    /// Store a value; `None` ttl uses the default. Returns the new version.
    pub async fn set(
        &self,
        key: &CacheKey,
        value: Bytes,
        ttl: Option<Duration>,
        deadline: Deadline,
    ) -> Result<u64> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.store(key, CacheValue::Present(value), ttl, deadline).await
    }

    /// Store a "not found upstream" marker; `None` ttl uses the negative TTL
    pub async fn set_negative(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        deadline: Deadline,
    ) -> Result<u64> {
        let ttl = ttl.unwrap_or(self.config.negative_ttl);
        self.store(key, CacheValue::Negative, ttl, deadline).await
    }

    async fn store(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<u64> {
        let outcome = self
            .call(key, deadline, |t| {
                let value = value.clone();
                async move { t.set(key, value, ttl, None).await }
            })
            .await?;

        match outcome {
            SetOutcome::Stored { version } => {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
                self.publish(key, version).await;
                Ok(version)
            }
            SetOutcome::LeaseRejected => Err(Error::Internal(format!(
                "unconditional write to {} was rejected",
                key
            ))),
        }
    }

    /// Delete an entry and revoke any live lease
    pub async fn delete(&self, key: &CacheKey, deadline: Deadline) -> Result<DeleteOutcome> {
        let outcome = self
            .call(key, deadline, |t| async move { t.delete(key).await })
            .await?;

        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.publish(key, outcome.fence_version).await;
        Ok(outcome)
    }

    // =========================================================================
    // Lease operations
    // =========================================================================

    /// Try to become the single recomputer for a key
    pub async fn try_acquire_lease(
        &self,
        key: &CacheKey,
        holder_id: &str,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<Option<Lease>> {
        self.call(key, deadline, |t| async move {
            t.set_lease_if_absent(key, holder_id, ttl).await
        })
        .await
    }

    /// Release a lease if still held; false if it expired or was revoked
    pub async fn release_lease(&self, lease: &Lease, deadline: Deadline) -> Result<bool> {
        self.call(&lease.key, deadline, |t| async move {
            t.delete_lease_if_owner(lease).await
        })
        .await
    }

    /// Current live lease for a key
    pub async fn get_lease(&self, key: &CacheKey, deadline: Deadline) -> Result<Option<Lease>> {
        self.call(key, deadline, |t| async move { t.get_lease(key).await })
            .await
    }

    /// Give up a lease after a failed recompute, leaving the reason visible
    /// to waiters for `retain`; false if the lease was no longer held
    pub async fn fail_lease(
        &self,
        lease: &Lease,
        reason: &str,
        retain: Duration,
        deadline: Deadline,
    ) -> Result<bool> {
        self.call(&lease.key, deadline, |t| async move {
            t.fail_lease_if_owner(lease, reason, retain).await
        })
        .await
    }

    /// Failure left by the last recompute of a key
    pub async fn get_failure(
        &self,
        key: &CacheKey,
        deadline: Deadline,
    ) -> Result<Option<FailedLoad>> {
        self.call(key, deadline, |t| async move { t.get_failure(key).await })
            .await
    }

    /// Populate under a lease. Publishes on success.
    pub async fn set_with_lease(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Option<Duration>,
        lease: &Lease,
        deadline: Deadline,
    ) -> Result<SetOutcome> {
        let ttl = ttl.unwrap_or(match value {
            CacheValue::Present(_) => self.config.default_ttl,
            CacheValue::Negative => self.config.negative_ttl,
        });

        let outcome = self
            .call(key, deadline, |t| {
                let value = value.clone();
                async move { t.set(key, value, ttl, Some(lease)).await }
            })
            .await?;

        match outcome {
            SetOutcome::Stored { version } => {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
                self.publish(key, version).await;
            }
            SetOutcome::LeaseRejected => {
                self.counters.lease_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, token = lease.token, "Populate rejected, lease no longer held");
            }
        }
        Ok(outcome)
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Ping every degraded node and restore the ones that answer
    pub async fn probe_degraded(&self) -> Vec<NodeId> {
        let mut restored = Vec::new();
        for (node, _) in self.router.degraded_nodes() {
            let Some(transport) = self.transport(&node) else {
                continue;
            };
            let ping = tokio::time::timeout(self.config.call_timeout, transport.ping()).await;
            if matches!(ping, Ok(Ok(()))) && self.router.mark_healthy(&node) {
                restored.push(node);
            }
        }
        restored
    }

    /// Ping one node
    pub async fn ping(&self, node: &NodeId) -> Result<()> {
        let transport = self
            .transport(node)
            .ok_or_else(|| Error::ShardUnavailable(format!("no transport for {}", node)))?;
        match tokio::time::timeout(self.config.call_timeout, transport.ping()).await {
            Ok(result) => result,
            Err(_) => Err(Error::transport(node, "ping timed out")),
        }
    }

    pub fn stats(&self) -> L2Stats {
        let c = &self.counters;
        L2Stats {
            gets: c.gets.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            negative_hits: c.negative_hits.load(Ordering::Relaxed),
            sets: c.sets.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            lease_rejections: c.lease_rejections.load(Ordering::Relaxed),
            transport_errors: c.transport_errors.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            failovers: c.failovers.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            publish_failures: c.publish_failures.load(Ordering::Relaxed),
            degraded_nodes: self
                .router
                .degraded_nodes()
                .into_iter()
                .map(|(node, _)| node.0)
                .collect(),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Emit an invalidation. Failure is logged, never surfaced: the shared
    /// tier already holds the truth and L1 TTLs bound the staleness.
    async fn publish(&self, key: &CacheKey, version: u64) {
        let event = InvalidationEvent::new(
            key.clone(),
            version,
            self.clock.now_millis(),
            self.publisher_id.clone(),
        );
        match self.bus.publish(event).await {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, version, error = %e, "Failed to publish invalidation");
            }
        }
    }

    /// Run one operation against the healthy owner of `key`, retrying
    /// transient failures and failing over to the next node.
    async fn call<T, F, Fut>(&self, key: &CacheKey, deadline: Deadline, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn ShardTransport>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let node = self.router.route_healthy(key)?;
            let Some(transport) = self.transport(&node) else {
                self.router.mark_degraded(&node, "no transport attached");
                self.counters.failovers.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let mut attempt: u32 = 0;
            let last_error = loop {
                let remaining = deadline.remaining();
                if remaining.is_zero() {
                    return Err(deadline.exceeded(key));
                }

                let budget = remaining.min(self.config.call_timeout);
                let error = match tokio::time::timeout(budget, op(transport.clone())).await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(e)) if e.is_transient() => e,
                    Ok(Err(e)) => return Err(e),
                    Err(_) if budget < self.config.call_timeout => {
                        return Err(deadline.exceeded(key));
                    }
                    Err(_) => Error::transport(&node, "call timed out"),
                };

                self.counters.transport_errors.fetch_add(1, Ordering::Relaxed);
                if attempt >= self.config.max_retries {
                    break error;
                }

                let backoff = self.config.retry_backoff.saturating_mul(1 << attempt.min(16));
                attempt += 1;
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                debug!(node = %node, key = %key, attempt, error = %error, "Retrying shard call");
                tokio::time::sleep(backoff.min(deadline.remaining())).await;
            };

            if self.router.mark_degraded(&node, last_error.to_string()) {
                self.counters.failovers.fetch_add(1, Ordering::Relaxed);
                info!(node = %node, key = %key, "Failing over to next shard node");
            }
        }
    }
}

impl std::fmt::Debug for SharedTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTier")
            .field("publisher_id", &self.publisher_id)
            .field("nodes", &self.nodes.len())
            .field("router", &self.router)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
