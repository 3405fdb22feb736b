//! Cache Metrics Collection
//!
//! Counters for the read path, the stampede guard and the invalidation bus,
//! plus a serializable snapshot and a Prometheus text exporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::{Encoder, Gauge, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use super::l1::L1Stats;
use crate::error::{Error, Result};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Read path
    requests: AtomicU64,
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    negative_hits: AtomicU64,

    // Loader
    loader_calls: AtomicU64,
    loader_errors: AtomicU64,

    // Stampede guard
    leases_acquired: AtomicU64,
    leases_contended: AtomicU64,
    lease_timeouts: AtomicU64,
    leases_revoked: AtomicU64,
    coalesced_waits: AtomicU64,
    early_refreshes: AtomicU64,
    degraded_loads: AtomicU64,

    // Invalidation
    invalidations_applied: AtomicU64,
    invalidations_stale: AtomicU64,
    bus_gaps: AtomicU64,

    // Latencies (microseconds, exponential moving average)
    get_latency_us: AtomicU64,
    loader_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1_miss(&self) {
        self.l1_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_hit(&self) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_miss(&self) {
        self.l2_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negative_hit(&self) {
        self.negative_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_loader_call(&self, duration: Duration, failed: bool) {
        self.loader_calls.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.loader_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.update_latency_ema(&self.loader_latency_us, duration);
    }

    pub fn record_lease_acquired(&self) {
        self.leases_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_contended(&self) {
        self.leases_contended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_timeout(&self) {
        self.lease_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_revoked(&self) {
        self.leases_revoked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced_wait(&self) {
        self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_early_refresh(&self) {
        self.early_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded_load(&self) {
        self.degraded_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self, applied: bool) {
        if applied {
            self.invalidations_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.invalidations_stale.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_bus_gap(&self) {
        self.bus_gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_latency(&self, duration: Duration) {
        self.update_latency_ema(&self.get_latency_us, duration);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn loader_calls(&self) -> u64 {
        self.loader_calls.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Snapshot combined with the local tier's own statistics
    pub fn snapshot(&self, l1: &L1Stats) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let requests = load(&self.requests);
        let l1_hits = load(&self.l1_hits);
        let l2_hits = load(&self.l2_hits);
        let leases_acquired = load(&self.leases_acquired);
        let leases_contended = load(&self.leases_contended);

        StatsSnapshot {
            requests,
            l1_hits,
            l1_misses: load(&self.l1_misses),
            l2_hits,
            l2_misses: load(&self.l2_misses),
            negative_hits: load(&self.negative_hits),
            loader_calls: load(&self.loader_calls),
            loader_errors: load(&self.loader_errors),
            leases_acquired,
            leases_contended,
            lease_timeouts: load(&self.lease_timeouts),
            leases_revoked: load(&self.leases_revoked),
            coalesced_waits: load(&self.coalesced_waits),
            early_refreshes: load(&self.early_refreshes),
            degraded_loads: load(&self.degraded_loads),
            invalidations_applied: load(&self.invalidations_applied),
            invalidations_stale: load(&self.invalidations_stale),
            bus_gaps: load(&self.bus_gaps),
            l1_entries: l1.entries as u64,
            l1_size_bytes: l1.size_bytes,
            l1_inserts: l1.inserts,
            l1_evictions: l1.evictions,
            get_latency_us: load(&self.get_latency_us),
            loader_latency_us: load(&self.loader_latency_us),
            hit_rate: ratio(l1_hits + l2_hits, requests),
            eviction_rate: ratio(l1.evictions, l1.inserts),
            lease_contention: ratio(leases_contended, leases_acquired + leases_contended),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Point-in-time view of all cache metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub negative_hits: u64,
    pub loader_calls: u64,
    pub loader_errors: u64,
    pub leases_acquired: u64,
    /// Lease attempts lost to another holder
    pub leases_contended: u64,
    pub lease_timeouts: u64,
    /// Populates refused because a delete revoked the lease
    pub leases_revoked: u64,
    /// Callers served by another caller's in-process recompute
    pub coalesced_waits: u64,
    pub early_refreshes: u64,
    /// Reads answered by the loader because the cache was unavailable
    pub degraded_loads: u64,
    pub invalidations_applied: u64,
    pub invalidations_stale: u64,
    pub bus_gaps: u64,
    pub l1_entries: u64,
    pub l1_size_bytes: u64,
    pub l1_inserts: u64,
    pub l1_evictions: u64,
    pub get_latency_us: u64,
    pub loader_latency_us: u64,
    /// Requests answered by L1 or L2
    pub hit_rate: f64,
    /// L1 evictions per L1 insert
    pub eviction_rate: f64,
    /// Share of lease attempts that found the lease taken
    pub lease_contention: f64,
}

// =============================================================================
// Prometheus export
// =============================================================================

/// Renders snapshots in the Prometheus text format
pub struct PrometheusExporter {
    registry: Registry,
    counters: Vec<(&'static str, IntGauge)>,
    ratios: Vec<(&'static str, Gauge)>,
}

impl PrometheusExporter {
    /// Create an exporter whose metric names start with `namespace`
    pub fn new(namespace: &str) -> Result<Self> {
        let registry = Registry::new();
        let mut counters = Vec::new();
        let mut ratios = Vec::new();

        for (name, help) in COUNTER_METRICS {
            let gauge = IntGauge::with_opts(Opts::new(*name, *help).namespace(namespace))
                .map_err(metrics_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
            counters.push((*name, gauge));
        }
        for (name, help) in RATIO_METRICS {
            let gauge = Gauge::with_opts(Opts::new(*name, *help).namespace(namespace))
                .map_err(metrics_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
            ratios.push((*name, gauge));
        }

        Ok(Self {
            registry,
            counters,
            ratios,
        })
    }

    /// Update every gauge from a snapshot and encode the registry
    pub fn render(&self, snapshot: &StatsSnapshot) -> Result<String> {
        for (name, gauge) in &self.counters {
            gauge.set(counter_value(snapshot, name) as i64);
        }
        for (name, gauge) in &self.ratios {
            gauge.set(ratio_value(snapshot, name));
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

const COUNTER_METRICS: &[(&str, &str)] = &[
    ("requests_total", "Cache get requests"),
    ("l1_hits_total", "Local tier hits"),
    ("l1_misses_total", "Local tier misses"),
    ("l2_hits_total", "Shared tier hits"),
    ("l2_misses_total", "Shared tier misses"),
    ("negative_hits_total", "Hits on not-found markers"),
    ("loader_calls_total", "Loader invocations"),
    ("loader_errors_total", "Loader failures"),
    ("leases_acquired_total", "Recompute leases won"),
    ("leases_contended_total", "Recompute leases found taken"),
    ("lease_timeouts_total", "Lease waits that ended in a timeout"),
    ("leases_revoked_total", "Populates rejected after revocation"),
    ("coalesced_waits_total", "Callers served by an in-process recompute"),
    ("early_refreshes_total", "Probabilistic early refreshes"),
    ("degraded_loads_total", "Loads that bypassed the cache"),
    ("invalidations_applied_total", "Invalidations that evicted a local copy"),
    ("invalidations_stale_total", "Invalidations discarded as stale"),
    ("bus_gaps_total", "Invalidation delivery gaps"),
    ("l1_entries", "Entries in the local tier"),
    ("l1_size_bytes", "Bytes in the local tier"),
    ("l1_evictions_total", "Local tier capacity evictions"),
    ("get_latency_microseconds", "Get latency moving average"),
    ("loader_latency_microseconds", "Loader latency moving average"),
];

const RATIO_METRICS: &[(&str, &str)] = &[
    ("hit_rate", "Share of requests answered by a cache tier"),
    ("eviction_rate", "Local tier evictions per insert"),
    ("lease_contention", "Share of lease attempts that found the lease taken"),
];

fn counter_value(s: &StatsSnapshot, name: &str) -> u64 {
    match name {
        "requests_total" => s.requests,
        "l1_hits_total" => s.l1_hits,
        "l1_misses_total" => s.l1_misses,
        "l2_hits_total" => s.l2_hits,
        "l2_misses_total" => s.l2_misses,
        "negative_hits_total" => s.negative_hits,
        "loader_calls_total" => s.loader_calls,
        "loader_errors_total" => s.loader_errors,
        "leases_acquired_total" => s.leases_acquired,
        "leases_contended_total" => s.leases_contended,
        "lease_timeouts_total" => s.lease_timeouts,
        "leases_revoked_total" => s.leases_revoked,
        "coalesced_waits_total" => s.coalesced_waits,
        "early_refreshes_total" => s.early_refreshes,
        "degraded_loads_total" => s.degraded_loads,
        "invalidations_applied_total" => s.invalidations_applied,
        "invalidations_stale_total" => s.invalidations_stale,
        "bus_gaps_total" => s.bus_gaps,
        "l1_entries" => s.l1_entries,
        "l1_size_bytes" => s.l1_size_bytes,
        "l1_evictions_total" => s.l1_evictions,
        "get_latency_microseconds" => s.get_latency_us,
        "loader_latency_microseconds" => s.loader_latency_us,
        _ => 0,
    }
}

fn ratio_value(s: &StatsSnapshot, name: &str) -> f64 {
    match name {
        "hit_rate" => s.hit_rate,
        "eviction_rate" => s.eviction_rate,
        "lease_contention" => s.lease_contention,
        _ => 0.0,
    }
}

// =============================================================================
// Tests
// =============================================================================
