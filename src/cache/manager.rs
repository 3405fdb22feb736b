//! Cache Manager - Tiered Read-Through Cache
//!
//! Facade a service embeds: L1 in front of the shared tier, with the stampede
//! guard in between and the invalidation bus feeding L1.
//!
//! # Read path
//!
//! ```text
//! get(key, loader)
//!   │
//!   ├─▶ L1 hit ──────────────────────────────▶ value  (maybe early refresh)
//!   │
//!   └─▶ L1 miss ─▶ StampedeGuard ─▶ L2 hit ──▶ value  (L1 filled)
//!                        │
//!                        └──▶ lease ─▶ loader ─▶ L2 set ─▶ publish ─▶ value
//! ```
//!
//! # Write path
//!
//! Writes to the source of truth are followed by [`TieredCache::delete`] or
//! [`TieredCache::set`]. Both revoke any recompute lease in flight, so a
//! value loaded before the write is never cached after it.
//!
//! # Placement
//!
//! Versions are assigned per shard node. When the router moves keys (node
//! added, removed, degraded or recovered) every local copy and version floor
//! is dropped, since versions from the old owner say nothing about the new one.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::deadline::Deadline;
use super::entry::{millis, CacheEntry, CacheKey, CacheValue, NodeId};
use super::l1::{GapPolicy, InvalidationOutcome, L1Cache, L1Config};
use super::l2::{L2Config, L2Stats, SharedTier};
use super::metrics::{CacheMetrics, StatsSnapshot};
use super::router::{RouterConfig, ShardRouter};
use super::stampede::{DegradePolicy, StampedeConfig, StampedeGuard};
use crate::adapters::{BroadcastBus, DEFAULT_BUS_CAPACITY};
use crate::domain::events::InvalidationEvent;
use crate::domain::ports::{
    Clock, InvalidationHandler, InvalidationTransport, Loader, MembershipSource,
    ShardConnector, ShardTransport, SubscriptionHandle, SystemClock,
};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Invalidation bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Events buffered per subscriber before it lags
    pub capacity: usize,
    /// What L1 does after missing events
    pub on_gap: GapPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUS_CAPACITY,
            on_gap: GapPolicy::Clear,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1: L1Config,
    pub l2: L2Config,
    pub router: RouterConfig,
    pub stampede: StampedeConfig,
    pub bus: BusConfig,
    /// Deadline for reads that do not pass their own
    #[serde(with = "super::duration_ms")]
    pub default_deadline: Duration,
    /// Behaviour when the cache cannot answer before the deadline
    pub degrade: DegradePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: L1Config::default(),
            l2: L2Config::default(),
            router: RouterConfig::default(),
            stampede: StampedeConfig::default(),
            bus: BusConfig::default(),
            default_deadline: Duration::from_secs(1),
            degrade: DegradePolicy::FallbackToLoader,
        }
    }
}

impl CacheConfig {
    /// Parse a YAML document. Missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Invalid cache config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject values the cache cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.router.virtual_nodes == 0 {
            return Err(Error::Config("router.virtual_nodes must be > 0".into()));
        }
        if self.l1.max_entries == 0 || self.l1.max_bytes == 0 {
            return Err(Error::Config("l1 budgets must be > 0".into()));
        }
        if self.l1.ttl.is_zero() {
            return Err(Error::Config("l1.ttl must be > 0".into()));
        }
        if self.stampede.lease_ttl.is_zero() || self.stampede.poll_interval.is_zero() {
            return Err(Error::Config(
                "stampede.lease_ttl and stampede.poll_interval must be > 0".into(),
            ));
        }
        let beta = self.stampede.early_refresh_beta;
        if !beta.is_finite() || beta < 0.0 {
            return Err(Error::Config(format!(
                "stampede.early_refresh_beta must be a finite non-negative number, got {}",
                beta
            )));
        }
        if self.bus.capacity == 0 {
            return Err(Error::Config("bus.capacity must be > 0".into()));
        }
        if self.default_deadline.is_zero() {
            return Err(Error::Config("default_deadline must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Bus -> L1
// =============================================================================

/// Applies bus events to this process's L1
struct L1InvalidationHandler {
    l1: Arc<L1Cache>,
    metrics: Arc<CacheMetrics>,
    on_gap: GapPolicy,
}

impl InvalidationHandler for L1InvalidationHandler {
    fn on_event(&self, event: &InvalidationEvent) {
        match self.l1.invalidate(event) {
            InvalidationOutcome::Applied => {
                self.metrics.record_invalidation(true);
                debug!(key = %event.key, version = event.source_version, "Evicted stale local copy");
            }
            InvalidationOutcome::Stale => {
                self.metrics.record_invalidation(false);
                debug!(
                    key = %event.key,
                    version = event.source_version,
                    publisher = %event.publisher_id,
                    "Discarding stale invalidation"
                );
            }
            InvalidationOutcome::Absent => {}
        }
    }

    fn on_gap(&self, missed: u64) {
        self.metrics.record_bus_gap();
        warn!(missed, policy = ?self.on_gap, "Invalidation stream gap, local state unknown");
        self.l1.on_gap(self.on_gap);
    }
}

// =============================================================================
// TieredCache
// =============================================================================

/// Builder for [`TieredCache`]
pub struct TieredCacheBuilder {
    config: CacheConfig,
    clock: Option<Arc<dyn Clock>>,
    bus: Option<Arc<dyn InvalidationTransport>>,
    connector: Option<Arc<dyn ShardConnector>>,
    transports: Vec<Arc<dyn ShardTransport>>,
    members: Vec<NodeId>,
    holder_id: Option<String>,
}

impl TieredCacheBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shared invalidation bus. Without one the cache gets a private bus,
    /// which only makes sense for a single process.
    pub fn bus(mut self, bus: Arc<dyn InvalidationTransport>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Used to reach nodes added later by id
    pub fn connector(mut self, connector: Arc<dyn ShardConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Add a shard node to the initial membership
    pub fn node(mut self, transport: Arc<dyn ShardTransport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Add a shard node by id, connected through the connector
    pub fn node_id(mut self, node: impl Into<NodeId>) -> Self {
        self.members.push(node.into());
        self
    }

    /// Lease holder and publisher id; a random UUID by default
    pub fn holder_id(mut self, id: impl Into<String>) -> Self {
        self.holder_id = Some(id.into());
        self
    }

    /// Build and subscribe to the bus. Must run inside a tokio runtime.
    pub fn build(self) -> Result<TieredCache> {
        self.config.validate()?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let bus: Arc<dyn InvalidationTransport> = match self.bus {
            Some(bus) => bus,
            None => Arc::new(BroadcastBus::new(self.config.bus.capacity)),
        };
        let holder_id = self
            .holder_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut transports = self.transports;
        for node in &self.members {
            let connector = self.connector.as_ref().ok_or_else(|| {
                Error::Config(format!("node {} given by id but no connector set", node))
            })?;
            transports.push(connector.connect(node)?);
        }

        let router = Arc::new(ShardRouter::new(
            self.config.router.clone(),
            transports.iter().map(|t| t.node_id().clone()),
        ));
        let l2 = Arc::new(SharedTier::new(
            self.config.l2.clone(),
            router,
            bus.clone(),
            clock.clone(),
            holder_id.clone(),
        ));
        for transport in transports {
            l2.attach_transport(transport);
        }

        let l1 = Arc::new(L1Cache::new(self.config.l1.clone(), clock.clone()));
        let metrics = Arc::new(CacheMetrics::new());
        let guard = Arc::new(StampedeGuard::new(
            self.config.stampede.clone(),
            self.config.degrade,
            l1.clone(),
            l2.clone(),
            metrics.clone(),
            clock.clone(),
            holder_id.clone(),
        ));

        let subscription = bus.subscribe(Arc::new(L1InvalidationHandler {
            l1: l1.clone(),
            metrics: metrics.clone(),
            on_gap: self.config.bus.on_gap,
        }))?;

        info!(
            holder_id = %holder_id,
            nodes = l2.router().members().len(),
            "Tiered cache ready"
        );
        let placement_seen = AtomicU64::new(l2.router().placement_generation());

        Ok(TieredCache {
            config: self.config,
            l1,
            l2,
            guard,
            metrics,
            bus,
            clock,
            connector: self.connector,
            holder_id,
            placement_seen,
            subscription: Mutex::new(Some(subscription)),
        })
    }
}

/// Tiered read-through cache for one process
pub struct TieredCache {
    config: CacheConfig,
    l1: Arc<L1Cache>,
    l2: Arc<SharedTier>,
    guard: Arc<StampedeGuard>,
    metrics: Arc<CacheMetrics>,
    bus: Arc<dyn InvalidationTransport>,
    clock: Arc<dyn Clock>,
    connector: Option<Arc<dyn ShardConnector>>,
    holder_id: String,
    /// Router placement generation the local tier was filled under
    placement_seen: AtomicU64,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl TieredCache {
    pub fn builder(config: CacheConfig) -> TieredCacheBuilder {
        TieredCacheBuilder {
            config,
            clock: None,
            bus: None,
            connector: None,
            transports: Vec::new(),
            members: Vec::new(),
            holder_id: None,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read through the cache with the default deadline.
    ///
    /// `Ok(None)` means the loader reported the key as not found (possibly
    /// answered from a negative cache entry).
    pub async fn get(&self, key: &CacheKey, loader: &Arc<dyn Loader>) -> Result<Option<Bytes>> {
        self.get_with_deadline(key, loader, Deadline::after(self.config.default_deadline))
            .await
    }

    /// Read through the cache, bounded by `deadline`
    pub async fn get_with_deadline(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn Loader>,
        deadline: Deadline,
    ) -> Result<Option<Bytes>> {
        let started = Instant::now();
        self.metrics.record_request();

        let result = self.lookup(key, loader, deadline).await;
        self.metrics.record_get_latency(started.elapsed());

        result.map(|value| match value {
            CacheValue::Present(bytes) => Some(bytes),
            CacheValue::Negative => None,
        })
    }

    async fn lookup(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn Loader>,
        deadline: Deadline,
    ) -> Result<CacheValue> {
        self.sync_placement();
        if let Some(entry) = self.l1.get(key) {
            self.metrics.record_l1_hit();
            if entry.is_negative() {
                self.metrics.record_negative_hit();
            }
            self.guard.maybe_refresh(&entry, loader);
            return Ok(entry.value);
        }
        self.metrics.record_l1_miss();

        let value = self.guard.get_or_load(key, loader, deadline).await;
        self.sync_placement();
        value
    }

    /// Local copy of a key, without touching the shared tier
    pub fn peek_local(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.sync_placement();
        self.l1.get(key)
    }

    /// Drop the local tier if keys may have moved since it was filled
    fn sync_placement(&self) {
        let current = self.l2.router().placement_generation();
        let seen = self.placement_seen.swap(current, Ordering::AcqRel);
        if seen == current {
            return;
        }
        let dropped = self.l1.len();
        self.l1.reset();
        info!(
            generation = current,
            dropped, "Shard placement changed, local tier reset"
        );
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a value in the shared tier and locally. Returns the new version.
    pub async fn set(&self, key: &CacheKey, value: Bytes, ttl: Option<Duration>) -> Result<u64> {
        let deadline = Deadline::after(self.config.default_deadline);
        let ttl = ttl.unwrap_or(self.config.l2.default_ttl);
        let now = self.clock.now_millis();

        let version = self.l2.set(key, value.clone(), Some(ttl), deadline).await?;
        self.sync_placement();
        self.l1.put(CacheEntry {
            key: key.clone(),
            value: CacheValue::Present(value),
            created_at: now,
            expires_at: now.saturating_add(millis(ttl)),
            version,
        });
        Ok(version)
    }

    /// Drop a key everywhere. Returns true if the shared tier held it.
    pub async fn delete(&self, key: &CacheKey) -> Result<bool> {
        self.l1.evict(key);
        let deadline = Deadline::after(self.config.default_deadline);
        let outcome = self.l2.delete(key, deadline).await?;
        self.sync_placement();
        self.l1.fence(key, outcome.fence_version);
        Ok(outcome.existed)
    }

    /// Operator override: fence every copy of `key` in the fleet. Returns the
    /// fence version carried by the published event.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<u64> {
        self.l1.evict(key);
        let deadline = Deadline::after(self.config.default_deadline);
        let outcome = self.l2.delete(key, deadline).await?;
        self.sync_placement();
        self.l1.fence(key, outcome.fence_version);
        info!(key = %key, fence_version = outcome.fence_version, "Manual invalidation");
        Ok(outcome.fence_version)
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Add a shard node to the ring. False if it was already a member.
    pub fn add_shard(&self, transport: Arc<dyn ShardTransport>) -> bool {
        let added = self.l2.register_node(transport);
        self.sync_placement();
        added
    }

    /// Add a shard node by id through the connector
    pub fn add_shard_by_id(&self, node: &NodeId) -> Result<bool> {
        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| Error::Config("no shard connector configured".into()))?;
        Ok(self.add_shard(connector.connect(node)?))
    }

    /// Remove a shard node from the ring. False if it was not a member.
    pub fn remove_shard(&self, node: &NodeId) -> bool {
        let removed = self.l2.unregister_node(node);
        self.sync_placement();
        removed
    }

    /// Re-read membership from a source, connecting to newly listed nodes.
    /// On failure the current ring keeps serving.
    pub async fn refresh_membership(&self, source: &dyn MembershipSource) -> Result<bool> {
        let changed = self.l2.router().refresh_from(source).await?;
        if changed {
            if let Some(connector) = &self.connector {
                for node in self.l2.router().members() {
                    if self.l2.transport(&node).is_none() {
                        self.l2.attach_transport(connector.connect(&node)?);
                    }
                }
            }
            self.sync_placement();
        }
        Ok(changed)
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.l2.router().members().into_iter().collect()
    }

    pub fn membership_epoch(&self) -> u64 {
        self.l2.router().epoch()
    }

    pub fn degraded_nodes(&self) -> Vec<(NodeId, String)> {
        self.l2.router().degraded_nodes()
    }

    /// Ping degraded nodes and restore the ones that answer
    pub async fn probe_degraded(&self) -> Vec<NodeId> {
        let restored = self.l2.probe_degraded().await;
        for node in &restored {
            info!(node = %node, "Shard node recovered");
        }
        self.sync_placement();
        restored
    }

    /// Ping one node
    pub async fn ping(&self, node: &NodeId) -> Result<()> {
        self.l2.ping(node).await
    }

    // =========================================================================
    // Stats & maintenance
    // =========================================================================

    pub fn stats(&self) -> StatsSnapshot {
        self.metrics.snapshot(&self.l1.stats())
    }

    pub fn l2_stats(&self) -> L2Stats {
        self.l2.stats()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Drop every local copy
    pub fn clear_local(&self) {
        self.l1.clear();
    }

    /// Periodic housekeeping: purge expired local entries and probe degraded
    /// nodes, until `shutdown` is cancelled.
    pub async fn run_maintenance(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = self.l1.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Purged expired local entries");
                    }
                    self.probe_degraded().await;
                }
            }
        }
        debug!("Maintenance loop stopped");
    }

    /// True while L1 receives invalidations
    pub fn is_subscribed(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Stop receiving invalidations. Also done on drop.
    pub fn shutdown(&self) {
        if let Some(handle) = self.subscription.lock().take() {
            self.bus.unsubscribe(handle);
        }
    }
}

impl Drop for TieredCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("holder_id", &self.holder_id)
            .field("l2", &self.l2)
            .field("l1_entries", &self.l1.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
