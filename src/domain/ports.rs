//! Domain Ports (Port/Adapter Pattern)
//!
//! Core abstractions the cache layer depends on. Infrastructure adapters
//! implement these traits; the cache never knows the concrete transport,
//! loader or membership source.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Cache Layer                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │ Loader │ ShardTransport │ InvalidationTransport │ …  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │ InMemoryShardStore │ BroadcastBus │ StaticMembership │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::events::InvalidationEvent;
use crate::cache::{CacheEntry, CacheKey, CacheValue, FailedLoad, Lease, NodeId};
use crate::error::{LoaderError, Result};

// =============================================================================
// Clock Port
// =============================================================================

/// Source of wall-clock time in epoch milliseconds.
///
/// Entry and lease expiry are absolute timestamps shared between processes,
/// so they are measured with this clock rather than `Instant`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually advanced clock for deterministic tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(crate::cache::millis(by), Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Loader Port
// =============================================================================

/// Outcome of a load: `Ok(Some)` value, `Ok(None)` not found upstream, `Err` failure
pub type LoadResult = std::result::Result<Option<Bytes>, LoaderError>;

/// Caller-supplied recompute function for a key.
///
/// Idempotency is not required: it may run more than once over the lifetime
/// of the fleet, but at most once per concurrent stampede window.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, key: &CacheKey) -> LoadResult;
}

/// Adapts an async closure into a [`Loader`]
pub struct FnLoader<F>(F);

#[async_trait]
impl<F, Fut> Loader for FnLoader<F>
where
    F: Fn(CacheKey) -> Fut + Send + Sync,
    Fut: Future<Output = LoadResult> + Send,
{
    async fn load(&self, key: &CacheKey) -> LoadResult {
        (self.0)(key.clone()).await
    }
}

/// Build a shared loader from an async closure
pub fn loader_fn<F, Fut>(f: F) -> Arc<dyn Loader>
where
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = LoadResult> + Send + 'static,
{
    Arc::new(FnLoader(f))
}

// =============================================================================
// Shard Transport Port
// =============================================================================

/// Result of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Value stored under the given version
    Stored { version: u64 },
    /// The lease presented is no longer the live lease for the key
    LeaseRejected,
}

/// Result of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// An entry was present
    pub existed: bool,
    /// Every local copy with a version below this is stale
    pub fence_version: u64,
}

/// Request/response protocol to one shard node.
///
/// `set_lease_if_absent` is SET-IF-ABSENT-WITH-TTL on the lease record;
/// `delete_lease_if_owner` is DELETE-IF-OWNER. Both are atomic at the node.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// Node this transport talks to
    fn node_id(&self) -> &NodeId;

    /// Fetch a live (non-expired) entry
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Store a value under the next version. With a lease, only if the lease
    /// is still live; without one, any live lease is revoked.
    async fn set(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Duration,
        lease: Option<&Lease>,
    ) -> Result<SetOutcome>;

    /// Delete the entry and revoke any live lease
    async fn delete(&self, key: &CacheKey) -> Result<DeleteOutcome>;

    /// Create a lease only if no live lease exists
    async fn set_lease_if_absent(
        &self,
        key: &CacheKey,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>>;

    /// Delete the lease only if it is still this grant
    async fn delete_lease_if_owner(&self, lease: &Lease) -> Result<bool>;

    /// Current live lease, if any
    async fn get_lease(&self, key: &CacheKey) -> Result<Option<Lease>>;

    /// Replace the lease with a failure record kept for `retain`, only if it
    /// is still this grant
    async fn fail_lease_if_owner(
        &self,
        lease: &Lease,
        reason: &str,
        retain: Duration,
    ) -> Result<bool>;

    /// Live failure record left by the last recompute, if any
    async fn get_failure(&self, key: &CacheKey) -> Result<Option<FailedLoad>>;

    /// Liveness probe
    async fn ping(&self) -> Result<()>;
}

/// Opens transports to shard nodes by id, for membership changes that name
/// a node the process has not talked to yet
pub trait ShardConnector: Send + Sync {
    fn connect(&self, node: &NodeId) -> Result<Arc<dyn ShardTransport>>;
}

// =============================================================================
// Invalidation Transport Port
// =============================================================================

/// Receiver side of the invalidation bus
pub trait InvalidationHandler: Send + Sync {
    /// An invalidation was delivered
    fn on_event(&self, event: &InvalidationEvent);

    /// Delivery was interrupted and `missed` events (0 = unknown) were lost
    fn on_gap(&self, missed: u64);
}

/// Handle returned by `subscribe`, consumed by `unsubscribe`
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub(crate) id: u64,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Publish/subscribe channel for "key changed" events.
///
/// Delivery is at-least-once; events from one publisher for one key arrive in
/// publish order.
#[async_trait]
pub trait InvalidationTransport: Send + Sync {
    async fn publish(&self, event: InvalidationEvent) -> Result<()>;

    /// Register a handler; must be called inside a tokio runtime
    fn subscribe(&self, handler: Arc<dyn InvalidationHandler>) -> Result<SubscriptionHandle>;

    /// Stop delivery to a handler; false if the handle was unknown
    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool;
}

// =============================================================================
// Membership Port
// =============================================================================

/// Source of the current set of physical shard nodes
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn fetch_members(&self) -> Result<BTreeSet<NodeId>>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);

        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_millis(), 3_000);

        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn test_system_clock_is_epoch_millis() {
        let now = SystemClock.now_millis();
        // After 2020-01-01
        assert!(now > 1_577_836_800_000);
    }

    #[tokio::test]
    async fn test_loader_fn() {
        let loader = loader_fn(|key: CacheKey| async move {
            if key.as_bytes() == b"missing" {
                Ok(None)
            } else {
                Ok(Some(Bytes::from(format!("value-of-{}", key))))
            }
        });

        let value = loader.load(&CacheKey::from("a")).await.unwrap();
        assert_eq!(value, Some(Bytes::from("value-of-a")));

        let value = loader.load(&CacheKey::from("missing")).await.unwrap();
        assert_eq!(value, None);
    }
}
