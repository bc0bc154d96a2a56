//! Core data model shared by every Rampart component.
//!
//! Every component keeps its own registration table keyed by [`TargetId`];
//! these types are the snapshots they hand out, never shared mutable state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::duration_ms;

/// Opaque identifier of a protected backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TargetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Descriptive metadata for a target. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: TargetId,

    /// Display name (e.g., "claude-sonnet-primary")
    pub name: String,

    /// Backend provider (e.g., "anthropic", "openai", "local")
    pub provider: String,

    /// Model or deployment version
    #[serde(default)]
    pub version: String,
}

impl TargetInfo {
    pub fn new(
        id: impl Into<TargetId>,
        name: impl Into<String>,
        provider: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: provider.into(),
            version: version.into(),
        }
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Failing fast until the retry time passes
    Open,

    /// Letting trial calls through to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub target: TargetId,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_retry_time: Option<DateTime<Utc>>,
}

/// Health status derived from probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Available,
    Degraded,
    Unavailable,
}

impl HealthStatus {
    /// Whether the target may receive traffic.
    pub fn is_usable(&self) -> bool {
        !matches!(self, HealthStatus::Unavailable)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Available => write!(f, "available"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Per-target health record maintained by the health checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHealth {
    pub target: TargetId,
    pub status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,

    /// Latency of the last successful probe
    #[serde(with = "duration_ms")]
    pub response_time: Duration,

    /// Exponential moving average of probe failures (0.0 - 1.0)
    pub error_rate: f64,

    /// Consecutive failed checks
    pub failure_count: u32,

    /// Message of the last probe failure, if any
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ModelHealth {
    /// Initial record for a freshly registered target.
    pub fn new(target: TargetId) -> Self {
        Self {
            target,
            status: HealthStatus::Available,
            last_health_check: None,
            response_time: Duration::ZERO,
            error_rate: 0.0,
            failure_count: 0,
            last_error: None,
        }
    }
}

/// Live load counters kept by the load balancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLoadStats {
    pub active_connections: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,

    /// Running mean of completed request latency, in milliseconds
    pub average_response_time: f64,

    /// active_connections / max_connections
    pub current_load: f64,

    /// Derived fitness indicator (0.0 - 1.0)
    pub health_score: f64,
}

impl Default for ModelLoadStats {
    fn default() -> Self {
        Self {
            active_connections: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            average_response_time: 0.0,
            current_load: 0.0,
            health_score: 1.0,
        }
    }
}

impl ModelLoadStats {
    /// Fraction of completed requests that succeeded (1.0 when none completed).
    pub fn success_rate(&self) -> f64 {
        let completed = self.successful_requests + self.failed_requests;
        if completed == 0 {
            1.0
        } else {
            self.successful_requests as f64 / completed as f64
        }
    }
}

/// Geographic coordinates in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    /// Mean Earth radius in kilometres.
    pub const EARTH_RADIUS_KM: f64 = 6371.0;

    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in kilometres (haversine formula).
    pub fn distance_km(&self, other: &GeoLocation) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        Self::EARTH_RADIUS_KM * c
    }
}

/// Aggregate performance snapshot evaluated by the degradation controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,

    #[serde(with = "duration_ms")]
    pub average_response_time: Duration,

    /// Fraction of failed requests (0.0 - 1.0)
    pub error_rate: f64,

    /// Fraction of targets able to serve traffic (0.0 - 1.0)
    pub availability: f64,

    #[serde(default)]
    pub cpu_utilization: f64,

    #[serde(default)]
    pub memory_utilization: f64,

    /// Completed requests per second
    #[serde(default)]
    pub throughput: f64,

    pub active_models: usize,
    pub total_models: usize,
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            average_response_time: Duration::ZERO,
            error_rate: 0.0,
            availability: 1.0,
            cpu_utilization: 0.0,
            memory_utilization: 0.0,
            throughput: 0.0,
            active_models: 0,
            total_models: 0,
        }
    }
}

/// Failure categories produced by classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Transient,
    Persistent,
    Intermittent,
    Cascading,
    Unknown,
}

/// Failure severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    /// A single target
    Target,
    /// Several targets of the same provider
    Provider,
    /// A large share of the fleet
    System,
}

/// Derived view of why a target is failing. Never stored long-term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureClassification {
    pub failure_type: FailureType,
    pub severity: Severity,
    pub scope: FailureScope,
    pub contributing_factors: Vec<String>,
}

/// Global degradation tiers, ordered from none to critical.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    #[default]
    None,
    Minimal,
    Moderate,
    Severe,
    Critical,
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DegradationLevel::None => "none",
            DegradationLevel::Minimal => "minimal",
            DegradationLevel::Moderate => "moderate",
            DegradationLevel::Severe => "severe",
            DegradationLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // London -> Paris is roughly 344 km
        let london = GeoLocation::new(51.5074, -0.1278);
        let paris = GeoLocation::new(48.8566, 2.3522);
        let d = london.distance_km(&paris);
        assert!((d - 343.5).abs() < 5.0, "unexpected distance {d}");
    }

    #[test]
    fn test_haversine_zero_for_same_point() {
        let p = GeoLocation::new(37.77, -122.41);
        assert!(p.distance_km(&p).abs() < 1e-9);
    }

    #[test]
    fn test_degradation_level_ordering() {
        assert!(DegradationLevel::None < DegradationLevel::Minimal);
        assert!(DegradationLevel::Moderate < DegradationLevel::Severe);
        assert!(DegradationLevel::Severe < DegradationLevel::Critical);
    }

    #[test]
    fn test_success_rate_without_traffic() {
        let stats = ModelLoadStats::default();
        assert_eq!(stats.success_rate(), 1.0);
        assert_eq!(stats.health_score, 1.0);
    }

    #[test]
    fn test_target_id_serializes_transparently() {
        let id = TargetId::new("gpt-primary");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"gpt-primary\"");
    }
}
