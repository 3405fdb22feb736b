//! Broadcast Invalidation Bus
//!
//! Implements the `InvalidationTransport` port on top of a
//! `tokio::sync::broadcast` channel. Every `TieredCache` sharing one bus
//! behaves like a separate process subscribed to the same topic.
//!
//! Each subscription runs a delivery task that forwards events to its
//! handler. A receiver that falls more than `capacity` events behind loses
//! messages; the handler is told through `on_gap` so it can treat its local
//! tier as unknown state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::events::InvalidationEvent;
use crate::domain::ports::{InvalidationHandler, InvalidationTransport, SubscriptionHandle};
use crate::error::{Error, Result};

/// Default channel capacity per subscriber
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Bus statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    /// Events dropped while delivery was disabled
    pub dropped: u64,
    pub delivered: u64,
    pub gaps: u64,
    pub subscribers: usize,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    gaps: AtomicU64,
}

struct Subscription {
    handler: Arc<dyn InvalidationHandler>,
    cancel: CancellationToken,
}

/// In-process invalidation bus
pub struct BroadcastBus {
    sender: broadcast::Sender<InvalidationEvent>,
    subscriptions: DashMap<u64, Subscription>,
    next_id: AtomicU64,
    delivery_enabled: AtomicBool,
    counters: Arc<Counters>,
}

impl BroadcastBus {
    /// Create a bus whose subscribers buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            delivery_enabled: AtomicBool::new(true),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Silently drop every published event while disabled (lossy transport)
    pub fn set_delivery_enabled(&self, enabled: bool) {
        self.delivery_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "Invalidation delivery toggled");
    }

    pub fn is_delivery_enabled(&self) -> bool {
        self.delivery_enabled.load(Ordering::SeqCst)
    }

    /// Tell every subscriber that delivery was interrupted, as a reconnect would
    pub fn report_gap(&self) {
        for sub in self.subscriptions.iter() {
            self.counters.gaps.fetch_add(1, Ordering::Relaxed);
            sub.handler.on_gap(0);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            gaps: self.counters.gaps.load(Ordering::Relaxed),
            subscribers: self.subscriptions.len(),
        }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl Drop for BroadcastBus {
    fn drop(&mut self) {
        for sub in self.subscriptions.iter() {
            sub.cancel.cancel();
        }
    }
}

#[async_trait]
impl InvalidationTransport for BroadcastBus {
    async fn publish(&self, event: InvalidationEvent) -> Result<()> {
        if !self.is_delivery_enabled() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(key = %event.key, version = event.source_version, "Invalidation dropped");
            return Ok(());
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        // No receivers is not a failure: nobody holds a copy to invalidate
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self, handler: Arc<dyn InvalidationHandler>) -> Result<SubscriptionHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::BusUnavailable(format!("no async runtime: {}", e)))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let mut receiver = self.sender.subscribe();

        let task_handler = handler.clone();
        let task_cancel = cancel.clone();
        let counters = self.counters.clone();

        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) => {
                            counters.delivered.fetch_add(1, Ordering::Relaxed);
                            task_handler.on_event(&event);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            counters.gaps.fetch_add(1, Ordering::Relaxed);
                            warn!(subscription = id, missed, "Invalidation subscriber lagged");
                            task_handler.on_gap(missed);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!(subscription = id, "Invalidation delivery stopped");
        });

        self.subscriptions.insert(id, Subscription { handler, cancel });
        debug!(subscription = id, "Invalidation subscriber registered");

        Ok(SubscriptionHandle { id })
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        match self.subscriptions.remove(&handle.id) {
            Some((_, sub)) => {
                sub.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, u64)>>,
        gaps: Mutex<Vec<u64>>,
    }

    impl InvalidationHandler for Recorder {
        fn on_event(&self, event: &InvalidationEvent) {
            self.events
                .lock()
                .push((event.key.to_string(), event.source_version));
        }

        fn on_gap(&self, missed: u64) {
            self.gaps.lock().push(missed);
        }
    }

    fn event(key: &str, version: u64) -> InvalidationEvent {
        InvalidationEvent::new(CacheKey::from(key), version, 0, "test")
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let bus = BroadcastBus::new(16);
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        bus.subscribe(a.clone()).unwrap();
        bus.subscribe(b.clone()).unwrap();

        bus.publish(event("k", 1)).await.unwrap();
        bus.publish(event("k", 2)).await.unwrap();
        settle().await;

        let expected = vec![("k".to_string(), 1), ("k".to_string(), 2)];
        assert_eq!(*a.events.lock(), expected);
        assert_eq!(*b.events.lock(), expected);
        assert_eq!(bus.stats().delivered, 4);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = BroadcastBus::new(16);
        let recorder = Arc::new(Recorder::default());
        let handle = bus.subscribe(recorder.clone()).unwrap();
        let id = handle.id();

        assert!(bus.unsubscribe(handle));
        assert!(!bus.unsubscribe(SubscriptionHandle { id }));
        settle().await;

        bus.publish(event("k", 1)).await.unwrap();
        settle().await;
        assert!(recorder.events.lock().is_empty());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_delivery_drops_events() {
        let bus = BroadcastBus::new(16);
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(recorder.clone()).unwrap();

        bus.set_delivery_enabled(false);
        bus.publish(event("k", 1)).await.unwrap();
        settle().await;

        assert!(recorder.events.lock().is_empty());
        assert_eq!(bus.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_sees_gap() {
        let bus = BroadcastBus::new(2);
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(recorder.clone()).unwrap();

        // Publish without yielding so the delivery task falls behind
        for v in 1..=6 {
            bus.publish(event("k", v)).await.unwrap();
        }
        settle().await;

        assert!(!recorder.gaps.lock().is_empty());
        assert!(bus.stats().gaps >= 1);
    }

    #[tokio::test]
    async fn test_report_gap() {
        let bus = BroadcastBus::new(4);
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(recorder.clone()).unwrap();

        bus.report_gap();
        assert_eq!(*recorder.gaps.lock(), vec![0]);
    }

    #[test]
    fn test_subscribe_outside_runtime_fails() {
        let bus = BroadcastBus::default();
        let err = bus.subscribe(Arc::new(Recorder::default())).unwrap_err();
        assert!(matches!(err, Error::BusUnavailable(_)));
    }
}
