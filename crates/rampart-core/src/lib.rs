//! # rampart-core
//!
//! Deterministic building blocks of the Rampart resilience runtime.
//!
//! This crate holds everything that does not need a clock or an executor:
//! - the data model shared by every component ([`types`])
//! - the error taxonomy and retryability rules ([`error`])
//! - configuration with documented defaults ([`config`])
//! - backoff arithmetic, failure classification, selection scoring and
//!   degradation threshold evaluation
//!
//! The async components live in `rampart-runtime`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rampart_core::{RuntimeConfig, backoff::Backoff};
//!
//! let config = RuntimeConfig::from_yaml_file("rampart.yaml")?;
//! let backoff = Backoff::from(&config.retry);
//! println!("{:?}", backoff.schedule(config.retry.max_retries));
//! ```

pub mod backoff;
pub mod classify;
pub mod config;
pub mod degradation;
pub mod error;
pub mod scoring;
pub mod types;

pub use config::{
    AdaptiveWeights, AlertThresholds, CircuitBreakerConfig, ClassificationConfig, ConfigError,
    DegradationConfig, HealthCheckConfig, LoadBalancerConfig, LoadBalancingAlgorithm,
    RecoveryConfig, RecoveryStrategy, RetryConfig, RuntimeConfig, SeverityThresholds,
    SuccessCriteria, TriggerCriteria,
};
pub use degradation::{
    DegradationAction, DegradationActionKind, DegradationStrategy, PerformanceThreshold,
};
pub use error::{is_retryable, CallError, Classify, RampartError, RetryError};
pub use types::{
    CircuitSnapshot, CircuitState, DegradationLevel, FailureClassification, FailureScope,
    FailureType, GeoLocation, HealthStatus, ModelHealth, ModelLoadStats, Severity, SystemMetrics,
    TargetId, TargetInfo,
};
