//! # rampart-runtime
//!
//! Async resilience runtime for fleets of AI model backends.
//!
//! Each component works on its own and is built from its section of
//! [`rampart_core::RuntimeConfig`]:
//!
//! - [`CircuitBreaker`] / [`CircuitBreakerRegistry`]: per-target failure isolation
//! - [`RetryManager`]: exponential backoff with jitter for transient failures
//! - [`HealthChecker`]: periodic probing with alerting
//! - [`LoadBalancer`]: target selection across nine algorithms
//! - [`AutoRecovery`]: classification-driven recovery plans
//! - [`DegradationController`]: level-based service degradation
//!
//! [`ResilienceRuntime`] wires them together around a single `execute`
//! entry point.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rampart_runtime::{ResilienceRuntime, FnProbe, ModelConfig, SelectionRequest};
//! use rampart_core::{RuntimeConfig, TargetInfo};
//!
//! let runtime = ResilienceRuntime::builder(RuntimeConfig::from_yaml_file("rampart.yaml")?).build()?;
//! runtime.register_target(
//!     TargetInfo::new("sonnet-a", "claude-sonnet-primary", "anthropic", "1"),
//!     Arc::new(FnProbe::new(|| async { Ok(()) })),
//!     ModelConfig::default(),
//! );
//! runtime.start();
//!
//! let reply = runtime
//!     .execute(&SelectionRequest::for_task("summarize"), |target| client.complete(target, prompt))
//!     .await?;
//! ```

pub mod balancer;
pub mod degradation;
pub mod health;
pub mod listeners;
pub mod orchestrator;
pub mod recovery;
pub mod resilience;

pub use balancer::{
    LoadBalancer, LoadBalancerEvent, LoadStatistics, ModelConfig, ModelStatistics,
    PerformanceReport, SelectionRequest, TargetGate,
};
pub use degradation::{
    ActuatorError, DegradationActuator, DegradationController, DegradationEvent, DegradationStatus,
    MetricsSource,
};
pub use health::{
    AlertKind, FnProbe, HealthAlert, HealthChecker, HealthEvent, HealthSource, Probe, ProbeError,
    SystemHealth,
};
pub use listeners::{ListenerId, Listeners};
pub use orchestrator::{
    RecoveryHook, ResilienceRuntime, ResilienceRuntimeBuilder, RuntimeMetricsSource,
    RuntimeRecoveryActions,
};
pub use recovery::{
    ActionError, AutoRecovery, RecoveryActionExecutor, RecoveryActionKind, RecoveryEvent,
    RecoveryExecutionResult, RecoveryOutcome, RecoveryPlan, RecoveryStatistics,
};
pub use resilience::{CircuitBreaker, CircuitBreakerRegistry, RetryManager, RetryOptions};
