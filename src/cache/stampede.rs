//! Stampede Guard
//!
//! Ensures a missing key is recomputed at most once per stampede window,
//! across every process sharing the shared tier.
//!
//! # Coordination
//!
//! ```text
//!   callers (one process)          shared tier                 other processes
//!   ─────────────────────          ───────────                 ───────────────
//!   leader ─┐  followers wait      get(key) ── miss
//!           │  on a watch channel  set_lease_if_absent ── won ─▶ losers poll get(key)
//!           │                      loader.load(key)
//!           └──────────────────▶   set(key, lease) ─ publish    ◀── value appears
//!                                  delete_lease_if_owner
//! ```
//!
//! Per key the state moves `ABSENT → LEASED → POPULATED → (expired) → ABSENT`.
//! Inside a process only the flight leader talks to the shared tier; the rest
//! receive the leader's result, including its error. A lease winner whose
//! loader fails leaves a short-lived failure record in place of its lease, so
//! processes that lost the lease get the same error instead of loading again.
//!
//! Early refresh uses the same lease record as a hard-miss recompute, so a
//! background refresh and a miss never load the same key concurrently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use super::deadline::Deadline;
use super::entry::{millis, CacheEntry, CacheKey, CacheValue, Lease};
use super::l1::L1Cache;
use super::l2::SharedTier;
use super::metrics::CacheMetrics;
use crate::domain::ports::{Clock, Loader, SetOutcome};
use crate::error::{Error, Result};

/// Stampede guard configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StampedeConfig {
    /// How long a recompute lease stays valid if never released
    #[serde(with = "super::duration_ms")]
    pub lease_ttl: Duration,
    /// How often a process that lost the lease checks for the winner's value
    #[serde(with = "super::duration_ms")]
    pub poll_interval: Duration,
    /// β in `P(refresh) = exp(-β · remaining / requested)`
    pub early_refresh_beta: f64,
    pub early_refresh_enabled: bool,
    /// How long processes waiting on a failed recompute can see its error
    #[serde(with = "super::duration_ms")]
    pub failure_retention: Duration,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(10),
            poll_interval: Duration::from_millis(20),
            early_refresh_beta: 10.0,
            early_refresh_enabled: true,
            failure_retention: Duration::from_millis(200),
        }
    }
}

/// What a read does when the cache cannot answer in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradePolicy {
    /// Call the loader directly, bypassing the cache
    #[default]
    FallbackToLoader,
    /// Return the cache error to the caller
    Fail,
}

type FlightResult = Option<Result<CacheValue>>;

/// Removes a flight when its leader finishes or is cancelled
struct FlightGuard<'a> {
    flights: &'a DashMap<CacheKey, watch::Receiver<FlightResult>>,
    key: CacheKey,
    receiver: watch::Receiver<FlightResult>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flights
            .remove_if(&self.key, |_, rx| rx.same_channel(&self.receiver));
    }
}

enum Role {
    Leader(watch::Sender<FlightResult>, watch::Receiver<FlightResult>),
    Follower(watch::Receiver<FlightResult>),
}

/// Outcome of waiting on another process's lease
enum Waited {
    Found(CacheEntry),
    /// The lease is gone without a value; try to acquire it
    Retry,
}

/// Per-key recompute coordination
pub struct StampedeGuard {
    config: StampedeConfig,
    degrade: DegradePolicy,
    l1: Arc<L1Cache>,
    l2: Arc<SharedTier>,
    metrics: Arc<CacheMetrics>,
    clock: Arc<dyn Clock>,
    holder_id: String,
    flights: DashMap<CacheKey, watch::Receiver<FlightResult>>,
    refreshing: DashSet<CacheKey>,
}

impl StampedeGuard {
    pub fn new(
        config: StampedeConfig,
        degrade: DegradePolicy,
        l1: Arc<L1Cache>,
        l2: Arc<SharedTier>,
        metrics: Arc<CacheMetrics>,
        clock: Arc<dyn Clock>,
        holder_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            degrade,
            l1,
            l2,
            metrics,
            clock,
            holder_id: holder_id.into(),
            flights: DashMap::new(),
            refreshing: DashSet::new(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn config(&self) -> &StampedeConfig {
        &self.config
    }

    /// Keys with an in-process recompute running
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Resolve a key that missed L1: shared tier, then lease and loader.
    ///
    /// Concurrent callers in this process share one execution and one result.
    #[instrument(skip(self, loader, deadline), fields(key = %key))]
    pub async fn get_or_load(
        self: &Arc<Self>,
        key: &CacheKey,
        loader: &Arc<dyn Loader>,
        deadline: Deadline,
    ) -> Result<CacheValue> {
        loop {
            let role = match self.flights.entry(key.clone()) {
                Entry::Occupied(flight) => Role::Follower(flight.get().clone()),
                Entry::Vacant(slot) => {
                    let (tx, rx) = watch::channel(None);
                    slot.insert(rx.clone());
                    Role::Leader(tx, rx)
                }
            };

            match role {
                Role::Leader(tx, rx) => {
                    let _guard = FlightGuard {
                        flights: &self.flights,
                        key: key.clone(),
                        receiver: rx,
                    };
                    let result = self.resolve(key, loader, deadline).await;
                    tx.send_replace(Some(result.clone()));
                    return result;
                }
                Role::Follower(mut rx) => {
                    self.metrics.record_coalesced_wait();
                    let waited = tokio::time::timeout_at(deadline.at(), async {
                        rx.wait_for(Option::is_some)
                            .await
                            .map(|shared| shared.clone())
                    })
                    .await;

                    match waited {
                        Ok(Ok(Some(result))) => return result,
                        // Leader was cancelled before finishing; take over
                        Ok(Ok(None)) | Ok(Err(_)) => continue,
                        Err(_) => {
                            return self.degrade(key, loader, deadline.exceeded(key)).await;
                        }
                    }
                }
            }
        }
    }

    /// Leader path
    async fn resolve(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn Loader>,
        deadline: Deadline,
    ) -> Result<CacheValue> {
        loop {
            match self.l2.get(key, deadline).await {
                Ok(Some(entry)) => {
                    self.metrics.record_l2_hit();
                    if entry.is_negative() {
                        self.metrics.record_negative_hit();
                    }
                    self.l1.put(entry.clone());
                    return Ok(entry.value);
                }
                Ok(None) => self.metrics.record_l2_miss(),
                Err(e) if is_cache_failure(&e) => return self.degrade(key, loader, e).await,
                Err(e) => return Err(e),
            }

            let acquired = self
                .l2
                .try_acquire_lease(key, &self.holder_id, self.config.lease_ttl, deadline)
                .await;

            match acquired {
                Ok(Some(lease)) => {
                    self.metrics.record_lease_acquired();
                    return self.recompute(key, loader, lease, deadline).await;
                }
                Ok(None) => {
                    self.metrics.record_lease_contended();
                    debug!(key = %key, "Lease held elsewhere, waiting for its value");
                    match self.wait_for_winner(key, deadline).await {
                        Ok(Waited::Found(entry)) => {
                            self.l1.put(entry.clone());
                            return Ok(entry.value);
                        }
                        Ok(Waited::Retry) => continue,
                        Err(e) if is_cache_failure(&e) => {
                            return self.degrade(key, loader, e).await
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if is_cache_failure(&e) => return self.degrade(key, loader, e).await,
                Err(e) => return Err(e),
            }
        }
    }

    /// Lease winner: re-check, load, populate, release
    async fn recompute(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn Loader>,
        lease: Lease,
        deadline: Deadline,
    ) -> Result<CacheValue> {
        // A previous holder may have populated between our miss and our grant
        if let Ok(Some(entry)) = self.l2.get(key, deadline).await {
            self.release(&lease, deadline).await;
            self.l1.put(entry.clone());
            return Ok(entry.value);
        }

        self.populate(key, loader, &lease, deadline).await
    }

    /// Run the loader under a lease and write the result back
    async fn populate(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn Loader>,
        lease: &Lease,
        deadline: Deadline,
    ) -> Result<CacheValue> {
        let value = match self.load(key, loader).await {
            Ok(value) => value,
            Err(e) => {
                // Waiters elsewhere see the error; the next caller retries
                // now rather than after the lease TTL
                self.fail(lease, &e, deadline).await;
                return Err(e);
            }
        };

        let ttl = match value {
            CacheValue::Present(_) => self.l2.config().default_ttl,
            CacheValue::Negative => self.l2.config().negative_ttl,
        };
        let now = self.clock.now_millis();

        match self
            .l2
            .set_with_lease(key, value.clone(), Some(ttl), lease, deadline)
            .await
        {
            Ok(SetOutcome::Stored { version }) => {
                self.l1.put(CacheEntry {
                    key: key.clone(),
                    value: value.clone(),
                    created_at: now,
                    expires_at: now.saturating_add(millis(ttl)),
                    version,
                });
                self.release(lease, deadline).await;
            }
            Ok(SetOutcome::LeaseRejected) => {
                // Revoked by a delete or expired: the value may predate the
                // change, so hand it to the waiting callers without caching it
                self.metrics.record_lease_revoked();
                debug!(key = %key, "Lease revoked during recompute, value not cached");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to populate shared tier");
                self.release(lease, deadline).await;
            }
        }

        Ok(value)
    }

    /// Poll the shared tier until the lease holder's value appears
    async fn wait_for_winner(&self, key: &CacheKey, deadline: Deadline) -> Result<Waited> {
        let mut last_seen: Option<Lease> = None;
        loop {
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                self.metrics.record_lease_timeout();
                return Err(Error::LeaseTimeout {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;

            if let Some(entry) = self.l2.get(key, deadline).await? {
                return Ok(Waited::Found(entry));
            }

            match self.l2.get_lease(key, deadline).await? {
                Some(lease) => last_seen = Some(lease),
                None => {
                    if let Some(failure) = self.l2.get_failure(key, deadline).await? {
                        debug!(key = %key, holder = %failure.holder_id, "Lease holder failed to load");
                        return Err(Error::Loader {
                            key: key.to_string(),
                            reason: failure.reason,
                        });
                    }
                    let now = self.clock.now_millis();
                    if last_seen.is_some_and(|l| l.is_expired(now)) {
                        self.metrics.record_lease_timeout();
                        debug!(key = %key, "Lease holder timed out, retrying acquisition");
                    }
                    return Ok(Waited::Retry);
                }
            }
        }
    }

    /// Apply the degrade policy after a cache failure
    async fn degrade(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn Loader>,
        cause: Error,
    ) -> Result<CacheValue> {
        match self.degrade {
            DegradePolicy::FallbackToLoader => {
                warn!(key = %key, error = %cause, "Cache unavailable, loading directly");
                self.metrics.record_degraded_load();
                self.load(key, loader).await
            }
            DegradePolicy::Fail => Err(cause),
        }
    }

    async fn load(&self, key: &CacheKey, loader: &Arc<dyn Loader>) -> Result<CacheValue> {
        let started = Instant::now();
        let loaded = loader.load(key).await;
        self.metrics
            .record_loader_call(started.elapsed(), loaded.is_err());

        match loaded {
            Ok(Some(bytes)) => Ok(CacheValue::Present(bytes)),
            Ok(None) => Ok(CacheValue::Negative),
            Err(e) => Err(Error::Loader {
                key: key.to_string(),
                reason: e.message,
            }),
        }
    }

    async fn release(&self, lease: &Lease, deadline: Deadline) {
        match self.l2.release_lease(lease, deadline).await {
            Ok(true) => {}
            Ok(false) => debug!(key = %lease.key, "Lease already gone at release"),
            Err(e) => debug!(key = %lease.key, error = %e, "Lease release failed, it will expire"),
        }
    }

    async fn fail(&self, lease: &Lease, cause: &Error, deadline: Deadline) {
        let reason = match cause {
            Error::Loader { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        match self
            .l2
            .fail_lease(lease, &reason, self.config.failure_retention, deadline)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(key = %lease.key, "Lease already gone at failure"),
            Err(e) => debug!(key = %lease.key, error = %e, "Recording load failure failed, lease will expire"),
        }
    }

    // =========================================================================
    // Early refresh
    // =========================================================================

    /// `exp(-β · remaining / requested)`
    pub fn refresh_probability(&self, entry: &CacheEntry, now: u64) -> f64 {
        let requested = entry.requested_ttl().as_secs_f64();
        if requested <= 0.0 {
            return 1.0;
        }
        let remaining = entry.remaining_ttl(now).as_secs_f64();
        (-self.config.early_refresh_beta * remaining / requested).exp()
    }

    /// Roll for an early refresh of a live entry; on success refresh it in the
    /// background. Returns true if a refresh was started.
    pub fn maybe_refresh(self: &Arc<Self>, entry: &CacheEntry, loader: &Arc<dyn Loader>) -> bool {
        if !self.config.early_refresh_enabled || entry.is_negative() {
            return false;
        }

        let now = self.clock.now_millis();
        if rand::random::<f64>() >= self.refresh_probability(entry, now) {
            return false;
        }
        if self.flights.contains_key(&entry.key) || !self.refreshing.insert(entry.key.clone()) {
            return false;
        }

        self.metrics.record_early_refresh();
        let guard = Arc::clone(self);
        let loader = Arc::clone(loader);
        let key = entry.key.clone();
        tokio::spawn(async move {
            guard.refresh(&key, &loader).await;
            guard.refreshing.remove(&key);
        });
        true
    }

    async fn refresh(&self, key: &CacheKey, loader: &Arc<dyn Loader>) {
        let deadline = Deadline::after(self.config.lease_ttl);
        match self
            .l2
            .try_acquire_lease(key, &self.holder_id, self.config.lease_ttl, deadline)
            .await
        {
            Ok(Some(lease)) => {
                self.metrics.record_lease_acquired();
                if let Err(e) = self.populate(key, loader, &lease, deadline).await {
                    warn!(key = %key, error = %e, "Early refresh failed");
                }
            }
            Ok(None) => {
                self.metrics.record_lease_contended();
                debug!(key = %key, "Refresh already running elsewhere");
            }
            Err(e) => debug!(key = %key, error = %e, "Early refresh skipped"),
        }
    }
}

/// Failures of the cache itself, as opposed to the loader's
fn is_cache_failure(e: &Error) -> bool {
    e.is_transient() || matches!(e, Error::DeadlineExceeded { .. })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{BroadcastBus, InMemoryShardStore};
    use crate::cache::l1::L1Config;
    use crate::cache::l2::L2Config;
    use crate::cache::router::{RouterConfig, ShardRouter};
    use crate::domain::ports::{loader_fn, ManualClock, ShardTransport};
    use crate::error::LoaderError;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryShardStore>,
        l1: Arc<L1Cache>,
        metrics: Arc<CacheMetrics>,
        guard: Arc<StampedeGuard>,
    }

    fn fixture(config: StampedeConfig, degrade: DegradePolicy) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(InMemoryShardStore::new("shard-a", clock.clone()));
        let router = Arc::new(ShardRouter::new(RouterConfig::default(), ["shard-a"]));
        let l2 = Arc::new(SharedTier::new(
            L2Config {
                retry_backoff: Duration::from_millis(1),
                max_retries: 0,
                ..Default::default()
            },
            router,
            Arc::new(BroadcastBus::new(64)),
            clock.clone(),
            "proc-a",
        ));
        l2.attach_transport(store.clone());

        let l1 = Arc::new(L1Cache::new(L1Config::default(), clock.clone()));
        let metrics = Arc::new(CacheMetrics::new());
        let guard = Arc::new(StampedeGuard::new(
            config,
            degrade,
            l1.clone(),
            l2,
            metrics.clone(),
            clock.clone(),
            "proc-a",
        ));

        Fixture {
            clock,
            store,
            l1,
            metrics,
            guard,
        }
    }

    fn counting_loader(calls: Arc<AtomicUsize>, value: Option<&'static str>) -> Arc<dyn Loader> {
        loader_fn(move |_key| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(value.map(|s| Bytes::from_static(s.as_bytes())))
            }
        })
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_concurrent_misses_load_once() {
        let f = fixture(StampedeConfig::default(), DegradePolicy::FallbackToLoader);
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone(), Some("{\"name\":\"Ada\"}"));
        let key = CacheKey::from("user:42");

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let guard = f.guard.clone();
                let loader = loader.clone();
                let key = key.clone();
                tokio::spawn(async move { guard.get_or_load(&key, &loader, deadline()).await })
            })
            .collect();

        for task in tasks {
            let value = task.await.unwrap().unwrap();
            assert_eq!(value, CacheValue::Present(Bytes::from_static(b"{\"name\":\"Ada\"}")));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.guard.in_flight(), 0);
        assert_eq!(f.l1.get(&key).unwrap().version, 1);
        assert!(f.store.get_lease(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_loader_error_shared_and_lease_released() {
        let f = fixture(StampedeConfig::default(), DegradePolicy::FallbackToLoader);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let loader = loader_fn(move |_key| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(LoaderError::new("db down"))
            }
        });
        let key = CacheKey::from("k");

        let (a, b) = tokio::join!(
            f.guard.get_or_load(&key, &loader, deadline()),
            f.guard.get_or_load(&key, &loader, deadline())
        );

        assert_matches!(a, Err(Error::Loader { ref reason, .. }) if reason == "db down");
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(f.store.get_lease(&key).await.unwrap().is_none());
        assert!(f.store.get(&key).await.unwrap().is_none());
        assert_eq!(f.store.get_failure(&key).await.unwrap().unwrap().reason, "db down");
    }

    #[tokio::test]
    async fn test_not_found_is_cached_negative() {
        let f = fixture(StampedeConfig::default(), DegradePolicy::FallbackToLoader);
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone(), None);
        let key = CacheKey::from("missing:1");

        let value = f.guard.get_or_load(&key, &loader, deadline()).await.unwrap();
        assert_eq!(value, CacheValue::Negative);

        let stored = f.store.get(&key).await.unwrap().unwrap();
        assert!(stored.is_negative());
        assert_eq!(stored.requested_ttl(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_loser_waits_for_remote_winner() {
        let f = fixture(StampedeConfig::default(), DegradePolicy::FallbackToLoader);
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone(), Some("local"));
        let key = CacheKey::from("k");

        // Another process holds the lease
        let remote = f
            .store
            .set_lease_if_absent(&key, "proc-b", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        let store = f.store.clone();
        let remote_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            store
                .set(&remote_key, CacheValue::Present(Bytes::from_static(b"remote")), Duration::from_secs(60), Some(&remote))
                .await
                .unwrap();
            store.delete_lease_if_owner(&remote).await.unwrap();
        });

        let value = f.guard.get_or_load(&key, &loader, deadline()).await.unwrap();
        assert_eq!(value, CacheValue::Present(Bytes::from_static(b"remote")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.metrics.snapshot(&f.l1.stats()).leases_contended, 1);
    }

    #[tokio::test]
    async fn test_remote_loader_failure_is_shared() {
        let f = fixture(StampedeConfig::default(), DegradePolicy::FallbackToLoader);
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone(), Some("local"));
        let key = CacheKey::from("k");

        let remote = f
            .store
            .set_lease_if_absent(&key, "proc-b", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        let store = f.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            store
                .fail_lease_if_owner(&remote, "db down", Duration::from_secs(1))
                .await
                .unwrap();
        });

        let err = f.guard.get_or_load(&key, &loader, deadline()).await.unwrap_err();
        assert_matches!(err, Error::Loader { ref reason, .. } if reason == "db down");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(f.l1.get(&key).is_none());

        // A later caller starts a fresh recompute
        let value = f.guard.get_or_load(&key, &loader, deadline()).await.unwrap();
        assert_eq!(value, CacheValue::Present(Bytes::from_static(b"local")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_remote_lease_is_taken_over() {
        let f = fixture(StampedeConfig::default(), DegradePolicy::FallbackToLoader);
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone(), Some("mine"));
        let key = CacheKey::from("k");

        f.store
            .set_lease_if_absent(&key, "crashed", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        let clock = f.clock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            clock.advance(Duration::from_secs(10));
        });

        let value = f.guard.get_or_load(&key, &loader, deadline()).await.unwrap();
        assert_eq!(value, CacheValue::Present(Bytes::from_static(b"mine")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snapshot = f.metrics.snapshot(&f.l1.stats());
        assert_eq!(snapshot.lease_timeouts, 1);
        assert_eq!(snapshot.leases_acquired, 1);
    }

    #[tokio::test]
    async fn test_lease_wait_bounded_by_deadline() {
        let f = fixture(StampedeConfig::default(), DegradePolicy::Fail);
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone(), Some("v"));
        let key = CacheKey::from("k");

        f.store
            .set_lease_if_absent(&key, "hung", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        let err = f
            .guard
            .get_or_load(&key, &loader, Deadline::after(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseTimeout { .. } | Error::DeadlineExceeded { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_during_recompute_skips_caching() {
        let f = fixture(StampedeConfig::default(), DegradePolicy::FallbackToLoader);
        let store = f.store.clone();
        let loader = loader_fn(move |key: CacheKey| {
            let store = store.clone();
            async move {
                // A writer deletes the key while we are loading
                store.delete(&key).await.unwrap();
                Ok(Some(Bytes::from_static(b"computed-before-write")))
            }
        });
        let key = CacheKey::from("k");

        let value = f.guard.get_or_load(&key, &loader, deadline()).await.unwrap();
        assert_eq!(value, CacheValue::Present(Bytes::from_static(b"computed-before-write")));
        assert!(f.store.get(&key).await.unwrap().is_none());
        assert!(f.l1.get(&key).is_none());
        assert_eq!(f.metrics.snapshot(&f.l1.stats()).leases_revoked, 1);
    }

    #[tokio::test]
    async fn test_degrade_policies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone(), Some("direct"));
        let key = CacheKey::from("k");

        let f = fixture(StampedeConfig::default(), DegradePolicy::FallbackToLoader);
        f.store.set_available(false);
        let value = f.guard.get_or_load(&key, &loader, deadline()).await.unwrap();
        assert_eq!(value, CacheValue::Present(Bytes::from_static(b"direct")));
        assert_eq!(f.metrics.snapshot(&f.l1.stats()).degraded_loads, 1);

        let f = fixture(StampedeConfig::default(), DegradePolicy::Fail);
        f.store.set_available(false);
        let err = f.guard.get_or_load(&key, &loader, deadline()).await.unwrap_err();
        assert_matches!(err, Error::ShardUnavailable(_));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refresh_probability() {
        let f = fixture(StampedeConfig::default(), DegradePolicy::FallbackToLoader);
        let entry = CacheEntry {
            key: CacheKey::from("k"),
            value: CacheValue::Present(Bytes::from_static(b"v")),
            created_at: 0,
            expires_at: 100_000,
            version: 1,
        };

        let fresh = f.guard.refresh_probability(&entry, 0);
        let half = f.guard.refresh_probability(&entry, 50_000);
        let late = f.guard.refresh_probability(&entry, 99_000);

        assert!(fresh < 0.001);
        assert!((half - (-5.0f64).exp()).abs() < 1e-9);
        assert!(late > 0.9);
        assert!(fresh < half && half < late);
    }

    #[tokio::test]
    async fn test_early_refresh_bumps_version() {
        let config = StampedeConfig {
            early_refresh_beta: 0.0,
            ..Default::default()
        };
        let f = fixture(config, DegradePolicy::FallbackToLoader);
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone(), Some("fresh"));
        let key = CacheKey::from("k");

        f.store
            .set(&key, CacheValue::Present(Bytes::from_static(b"old")), Duration::from_secs(60), None)
            .await
            .unwrap();
        let entry = f.store.get(&key).await.unwrap().unwrap();

        assert!(f.guard.maybe_refresh(&entry, &loader));
        // Already refreshing
        assert!(!f.guard.maybe_refresh(&entry, &loader));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let refreshed = f.store.get(&key).await.unwrap().unwrap();
        assert_eq!(refreshed.version, 2);
        assert_eq!(f.l1.get(&key).unwrap().version, 2);
        assert!(f.store.get_lease(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_early_refresh_disabled() {
        let config = StampedeConfig {
            early_refresh_beta: 0.0,
            early_refresh_enabled: false,
            ..Default::default()
        };
        let f = fixture(config, DegradePolicy::FallbackToLoader);
        let loader = counting_loader(Arc::new(AtomicUsize::new(0)), Some("v"));
        let entry = CacheEntry {
            key: CacheKey::from("k"),
            value: CacheValue::Present(Bytes::from_static(b"v")),
            created_at: 0,
            expires_at: u64::MAX,
            version: 1,
        };
        assert!(!f.guard.maybe_refresh(&entry, &loader));
    }
}
