//! Administrative Surface
//!
//! Operator-facing operations on one cache process: shard membership,
//! cache statistics, manual invalidation and health. Transport-agnostic;
//! the binary serves it over HTTP.

mod health;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::Serialize;
use tracing::info;

pub use health::{HealthCheckResult, HealthResponse, HealthStatus};

use crate::cache::{CacheKey, NodeId, PrometheusExporter, StatsSnapshot, TieredCache};
use crate::error::{Error, Result};

/// Namespace for exported metric names
pub const METRICS_NAMESPACE: &str = "shardcache";

/// Membership operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipOp {
    Add,
    Remove,
}

impl FromStr for MembershipOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(MembershipOp::Add),
            "remove" => Ok(MembershipOp::Remove),
            other => Err(Error::Config(format!("unknown membership operation '{}'", other))),
        }
    }
}

/// Result of a membership operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipChange {
    pub op: MembershipOp,
    pub node: String,
    /// False when the node was already in (add) or out of (remove) the ring
    pub changed: bool,
    pub epoch: u64,
    pub members: Vec<String>,
}

/// `cacheStats()` answer: the three headline rates plus every counter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatsReport {
    pub hit_rate: f64,
    pub eviction_rate: f64,
    pub lease_contention: f64,
    pub details: StatsSnapshot,
}

impl From<StatsSnapshot> for CacheStatsReport {
    fn from(details: StatsSnapshot) -> Self {
        Self {
            hit_rate: details.hit_rate,
            eviction_rate: details.eviction_rate,
            lease_contention: details.lease_contention,
            details,
        }
    }
}

/// Result of a manual invalidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub key: String,
    /// Every copy below this version is dropped fleet-wide
    pub fence_version: u64,
}

/// Admin operations for one cache process
pub struct AdminService {
    cache: Arc<TieredCache>,
    exporter: PrometheusExporter,
    started: Instant,
}

impl AdminService {
    pub fn new(cache: Arc<TieredCache>) -> Result<Self> {
        Ok(Self {
            cache,
            exporter: PrometheusExporter::new(METRICS_NAMESPACE)?,
            started: Instant::now(),
        })
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// `shardMembership(add|remove nodeId)`
    pub fn shard_membership(&self, op: MembershipOp, node: &NodeId) -> Result<MembershipChange> {
        if node.as_str().is_empty() {
            return Err(Error::Config("node id must not be empty".into()));
        }

        let changed = match op {
            MembershipOp::Add => self.cache.add_shard_by_id(node)?,
            MembershipOp::Remove => self.cache.remove_shard(node),
        };
        info!(op = ?op, node = %node, changed, "Shard membership change requested");

        Ok(MembershipChange {
            op,
            node: node.to_string(),
            changed,
            epoch: self.cache.membership_epoch(),
            members: self.cache.members().into_iter().map(|n| n.0).collect(),
        })
    }

    /// `cacheStats()`
    pub fn cache_stats(&self) -> CacheStatsReport {
        self.cache.stats().into()
    }

    /// `invalidate(key)`
    pub async fn invalidate(&self, key: &CacheKey) -> Result<InvalidationReport> {
        let fence_version = self.cache.invalidate(key).await?;
        Ok(InvalidationReport {
            key: key.to_string(),
            fence_version,
        })
    }

    /// Prometheus text exposition of the current stats
    pub fn metrics_text(&self) -> Result<String> {
        self.exporter.render(&self.cache.stats())
    }

    pub fn metrics_content_type(&self) -> String {
        self.exporter.content_type()
    }

    /// Ping every member and report per-node, tier and bus status.
    ///
    /// The tier is degraded while any node is, and unhealthy when no node
    /// answers (reads then fall back to the loader, if so configured).
    pub async fn health(&self) -> HealthResponse {
        let members = self.cache.members();
        let degraded = self.cache.degraded_nodes();

        let mut checks = join_all(members.iter().map(|node| {
            let degraded = &degraded;
            async move {
                let started = Instant::now();
                let name = format!("shard:{}", node);
                let check = match self.cache.ping(node).await {
                    Ok(()) => match degraded.iter().find(|(n, _)| n == node) {
                        Some((_, reason)) => HealthCheckResult::degraded(name, reason.clone()),
                        None => HealthCheckResult::healthy(name),
                    },
                    Err(e) => HealthCheckResult::unhealthy(name, e.to_string()),
                };
                check.with_duration(started.elapsed())
            }
        }))
        .await;

        let reachable = checks
            .iter()
            .filter(|c| c.status != HealthStatus::Unhealthy)
            .count();

        let tier = if members.is_empty() {
            HealthCheckResult::unhealthy("shard_tier", "no shard nodes")
        } else if reachable == 0 {
            HealthCheckResult::unhealthy("shard_tier", "no shard node reachable")
        } else if reachable < members.len() || !degraded.is_empty() {
            HealthCheckResult::degraded(
                "shard_tier",
                format!("{}/{} shard nodes reachable", reachable, members.len()),
            )
        } else {
            HealthCheckResult::healthy("shard_tier")
        };
        checks.push(tier);

        checks.push(if self.cache.is_subscribed() {
            HealthCheckResult::healthy("invalidation_bus")
        } else {
            HealthCheckResult::unhealthy("invalidation_bus", "not subscribed")
        });

        HealthResponse::new(checks, self.started.elapsed(), self.cache.membership_epoch())
    }
}

// =============================================================================
// Tests
// =============================================================================
