//! Health Checks
//!
//! Per-node and per-component status for the admin surface.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but reads still succeed
    Degraded,
    /// Component is unhealthy
    Unhealthy,
}

impl HealthStatus {
    /// Healthy or degraded
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }

    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Result of one check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Check name (`shard:<node>`, `shard_tier`, `invalidation_bus`)
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    /// Duration of check
    pub duration_ms: u64,
}

impl HealthCheckResult {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            duration_ms: 0,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    /// Set duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status among the checks
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub version: String,
    pub uptime_seconds: u64,
    /// Shard map epoch the checks ran against
    pub membership_epoch: u64,
}

impl HealthResponse {
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration, membership_epoch: u64) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max_by_key(HealthStatus::severity)
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
            membership_epoch,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
