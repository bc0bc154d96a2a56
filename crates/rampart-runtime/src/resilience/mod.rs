//! Call-level resilience patterns.
//!
//! This module provides:
//! - Circuit breakers, one per target, behind an explicit registry
//! - Retry with exponential backoff and jitter

mod circuit_breaker;
mod registry;
mod retry;

pub use circuit_breaker::{BreakerEvent, CircuitBreaker, ExecutionOutcome};
pub use registry::CircuitBreakerRegistry;
pub use retry::{RetryEvent, RetryManager, RetryOptions};
