//! Runtime configuration loaded from YAML or JSON.
//!
//! Every threshold the components use is a field here with its default,
//! so heuristics stay tunable and testable. Durations are written as
//! human-readable strings (`"30s"`, `"250ms"`).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::degradation::{default_strategies, DegradationStrategy};

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Serde helpers for human-readable durations.
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde helpers for optional human-readable durations.
pub mod option_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Serde helpers for durations reported as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures before opening the circuit
    pub failure_threshold: u32,

    /// Consecutive half-open successes needed to close the circuit
    pub success_threshold: u32,

    /// Time an open circuit waits before allowing a trial call
    #[serde(with = "duration_str")]
    pub recovery_timeout: Duration,

    /// Per-call timeout; a timeout counts as a failure
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Retry engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    #[serde(with = "duration_str")]
    pub base_delay: Duration,

    #[serde(with = "duration_str")]
    pub max_delay: Duration,

    pub multiplier: f64,

    /// Perturb each delay by up to +/-10%
    pub jitter: bool,

    /// Error codes retried in addition to transient network codes
    pub retryable_codes: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            retryable_codes: vec![
                "TIMEOUT".to_string(),
                "RATE_LIMITED".to_string(),
                "SERVICE_UNAVAILABLE".to_string(),
            ],
        }
    }
}

/// Alert thresholds evaluated on every health update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub error_rate: f64,

    #[serde(with = "duration_str")]
    pub response_time: Duration,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            response_time: Duration::from_secs(10),
        }
    }
}

/// Health checker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,

    /// Per-attempt probe timeout
    #[serde(with = "duration_str")]
    pub timeout: Duration,

    /// Probe retries after the first attempt
    pub retries: u32,

    /// First backoff delay between probe attempts
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,

    /// Latency above this fraction of `timeout` marks the target degraded
    pub degraded_latency_ratio: f64,

    /// Smoothing factor of the error-rate moving average
    pub error_rate_alpha: f64,

    pub alerts: AlertThresholds,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retries: 3,
            retry_delay: Duration::from_secs(1),
            degraded_latency_ratio: 0.8,
            error_rate_alpha: 0.1,
            alerts: AlertThresholds::default(),
        }
    }
}

/// Load balancing algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    WeightedLeastConnections,
    LeastResponseTime,
    ResourceBased,
    Geographic,
    PriorityBased,
    #[default]
    Adaptive,
}

/// Weights of the adaptive composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveWeights {
    pub response_time: f64,
    pub load: f64,
    pub health: f64,
    pub weight: f64,
    pub resource: f64,
    pub learning: f64,
}

impl AdaptiveWeights {
    pub fn total(&self) -> f64 {
        self.response_time + self.load + self.health + self.weight + self.resource + self.learning
    }

    fn is_well_formed(&self) -> bool {
        [
            self.response_time,
            self.load,
            self.health,
            self.weight,
            self.resource,
            self.learning,
        ]
        .iter()
        .all(|w| w.is_finite() && *w >= 0.0)
    }
}

impl Default for AdaptiveWeights {
    fn default() -> Self {
        Self {
            response_time: 0.25,
            load: 0.20,
            health: 0.20,
            weight: 0.15,
            resource: 0.10,
            learning: 0.10,
        }
    }
}

/// Load balancer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub algorithm: LoadBalancingAlgorithm,

    pub session_affinity: bool,

    /// Idle time after which a session forgets its target
    #[serde(with = "duration_str")]
    pub session_timeout: Duration,

    pub max_sessions: u64,

    /// Derived health score below which a target is not selected
    pub min_health_score: f64,

    /// Completions required before the health score gates eligibility
    pub min_samples: u64,

    /// Lifetime of the completion window behind the derived health score.
    /// A target excluded by its score is readmitted once its window expires.
    #[serde(with = "duration_str")]
    pub score_window: Duration,

    /// Latency treated as the worst case when normalising scores
    #[serde(with = "duration_str")]
    pub response_time_ceiling: Duration,

    /// Smoothing factor of the adaptive learning score
    pub learning_rate: f64,

    pub adaptive_weights: AdaptiveWeights,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: LoadBalancingAlgorithm::default(),
            session_affinity: false,
            session_timeout: Duration::from_secs(30 * 60),
            max_sessions: 10_000,
            min_health_score: 0.3,
            min_samples: 5,
            score_window: Duration::from_secs(60),
            response_time_ceiling: Duration::from_secs(10),
            learning_rate: 0.1,
            adaptive_weights: AdaptiveWeights::default(),
        }
    }
}

/// Recovery strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Immediate,
    Gradual,
    Progressive,
    Conservative,
    #[default]
    Adaptive,
}

/// Health conditions that start a recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerCriteria {
    pub error_rate: f64,

    #[serde(with = "duration_str")]
    pub response_time: Duration,

    pub consecutive_failures: u32,
}

impl Default for TriggerCriteria {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            response_time: Duration::from_secs(30),
            consecutive_failures: 10,
        }
    }
}

/// Severity bands for failure classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    #[serde(with = "duration_str")]
    pub critical_response_time: Duration,
    pub critical_error_rate: f64,
    pub critical_failures: u32,

    #[serde(with = "duration_str")]
    pub high_response_time: Duration,
    pub high_error_rate: f64,
    pub high_failures: u32,

    #[serde(with = "duration_str")]
    pub medium_response_time: Duration,
    pub medium_error_rate: f64,
    pub medium_failures: u32,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            critical_response_time: Duration::from_secs(60),
            critical_error_rate: 0.9,
            critical_failures: 20,
            high_response_time: Duration::from_secs(30),
            high_error_rate: 0.7,
            high_failures: 10,
            medium_response_time: Duration::from_secs(10),
            medium_error_rate: 0.5,
            medium_failures: 5,
        }
    }
}

/// Failure classification heuristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    /// Health records inspected per classification
    pub window: usize,

    /// Error rate above which a non-outage failure is transient
    pub transient_error_rate: f64,

    /// Unavailable targets needed before a failure counts as cascading
    pub cascade_min_targets: usize,

    pub severity: SeverityThresholds,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            window: 5,
            transient_error_rate: 0.3,
            cascade_min_targets: 3,
            severity: SeverityThresholds::default(),
        }
    }
}

/// Conditions a recovered target must meet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuccessCriteria {
    #[serde(with = "duration_str")]
    pub max_response_time: Duration,

    pub min_success_rate: f64,

    pub consecutive_successes: u32,
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self {
            max_response_time: Duration::from_secs(5),
            min_success_rate: 0.8,
            consecutive_successes: 1,
        }
    }
}

/// Auto-recovery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// React to health updates automatically
    pub enabled: bool,

    pub strategy: RecoveryStrategy,

    pub max_concurrent_recoveries: usize,

    pub triggers: TriggerCriteria,

    pub classification: ClassificationConfig,

    #[serde(with = "duration_str")]
    pub action_timeout: Duration,

    /// Attempts for actions marked retryable
    pub action_max_attempts: u32,

    pub success_criteria: SuccessCriteria,

    /// Smoothing factor of per-action effectiveness
    pub learning_rate: f64,

    /// Effectiveness assumed for actions never executed
    pub initial_effectiveness: f64,

    /// Archived execution results kept
    pub history_size: usize,

    /// Health records kept per target
    pub health_history_size: usize,

    #[serde(with = "duration_str")]
    pub monitor_interval: Duration,

    /// Plans running longer than this are aborted by the monitor
    #[serde(with = "duration_str")]
    pub plan_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: RecoveryStrategy::default(),
            max_concurrent_recoveries: 3,
            triggers: TriggerCriteria::default(),
            classification: ClassificationConfig::default(),
            action_timeout: Duration::from_secs(30),
            action_max_attempts: 2,
            success_criteria: SuccessCriteria::default(),
            learning_rate: 0.1,
            initial_effectiveness: 0.5,
            history_size: 100,
            health_history_size: 50,
            monitor_interval: Duration::from_secs(10),
            plan_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Degradation controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    pub enabled: bool,

    #[serde(with = "duration_str")]
    pub evaluation_interval: Duration,

    /// Strategies, least severe first
    pub strategies: Vec<DegradationStrategy>,

    /// Transition events kept for audit
    pub history_size: usize,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval: Duration::from_secs(30),
            strategies: default_strategies(),
            history_size: 100,
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub health: HealthCheckConfig,
    pub load_balancer: LoadBalancerConfig,
    pub recovery: RecoveryConfig,
    pub degradation: DegradationConfig,
}

impl RuntimeConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "loading runtime config");
        let raw = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&raw),
            _ => Self::from_yaml(&raw),
        }
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.success_threshold == 0 {
            return Err(invalid("circuit_breaker thresholds must be at least 1"));
        }
        if cb.timeout.is_zero() {
            return Err(invalid("circuit_breaker.timeout must be positive"));
        }

        let retry = &self.retry;
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be >= 1.0"));
        }
        if retry.max_delay < retry.base_delay {
            return Err(invalid("retry.max_delay must be >= retry.base_delay"));
        }

        let health = &self.health;
        if health.interval.is_zero() || health.timeout.is_zero() {
            return Err(invalid("health.interval and health.timeout must be positive"));
        }
        check_fraction("health.degraded_latency_ratio", health.degraded_latency_ratio)?;
        check_smoothing("health.error_rate_alpha", health.error_rate_alpha)?;

        let lb = &self.load_balancer;
        check_smoothing("load_balancer.learning_rate", lb.learning_rate)?;
        check_fraction("load_balancer.min_health_score", lb.min_health_score)?;
        if lb.score_window.is_zero() {
            return Err(invalid("load_balancer.score_window must be positive"));
        }
        if !lb.adaptive_weights.is_well_formed() {
            return Err(invalid("load_balancer.adaptive_weights must be finite and non-negative"));
        }
        if (lb.adaptive_weights.total() - 1.0).abs() > 0.01 {
            return Err(invalid("load_balancer.adaptive_weights must sum to 1.0"));
        }

        let recovery = &self.recovery;
        if recovery.max_concurrent_recoveries == 0 {
            return Err(invalid("recovery.max_concurrent_recoveries must be at least 1"));
        }
        if recovery.classification.window == 0 {
            return Err(invalid("recovery.classification.window must be at least 1"));
        }
        check_smoothing("recovery.learning_rate", recovery.learning_rate)?;
        check_fraction("recovery.initial_effectiveness", recovery.initial_effectiveness)?;

        let mut previous = None;
        for strategy in &self.degradation.strategies {
            if let Some(prev) = previous {
                if strategy.level <= prev {
                    return Err(invalid(
                        "degradation.strategies must be ordered from least to most severe",
                    ));
                }
            }
            previous = Some(strategy.level);
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}

fn check_fraction(name: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

fn check_smoothing(name: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{name} must be within (0, 1], got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DegradationLevel;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
circuit_breaker:
  failure_threshold: 3
  recovery_timeout: "10s"
retry:
  base_delay: "100ms"
  jitter: false
load_balancer:
  algorithm: least_connections
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(10));
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert_eq!(config.retry.base_delay, Duration::from_millis(100));
        assert!(!config.retry.jitter);
        assert_eq!(
            config.load_balancer.algorithm,
            LoadBalancingAlgorithm::LeastConnections
        );
        assert_eq!(config.health.interval, Duration::from_secs(30));
        assert_eq!(config.degradation.strategies.len(), 4);
    }

    #[test]
    fn test_rejects_zero_failure_threshold() {
        let yaml = "circuit_breaker:\n  failure_threshold: 0\n";
        assert!(matches!(
            RuntimeConfig::from_yaml(yaml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_rejects_bad_adaptive_weights() {
        let mut config = RuntimeConfig::default();
        config.load_balancer.adaptive_weights.learning = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_finite_numbers() {
        let mut config = RuntimeConfig::default();
        config.retry.multiplier = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.retry.multiplier = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.load_balancer.adaptive_weights.health = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.load_balancer.adaptive_weights.weight = -0.15;
        config.load_balancer.adaptive_weights.load = 0.50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unordered_strategies() {
        let mut config = RuntimeConfig::default();
        config.degradation.strategies.reverse();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_duration_string() {
        let yaml = "health:\n  interval: \"soon\"\n";
        assert!(matches!(
            RuntimeConfig::from_yaml(yaml),
            Err(ConfigError::YamlError(_))
        ));
    }

    #[test]
    fn test_json_round_trip_keeps_levels() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = RuntimeConfig::from_json(&json).unwrap();
        assert_eq!(parsed.degradation.strategies[1].level, DegradationLevel::Moderate);
        assert_eq!(parsed, config);
    }
}
