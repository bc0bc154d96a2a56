//! Exponential backoff arithmetic.
//!
//! Delays are computed in nanoseconds so that exact schedules such as
//! 100ms, 200ms, 400ms come out exact.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Maximum relative perturbation applied when jitter is enabled.
pub const JITTER_RATIO: f64 = 0.1;

/// `min(base * multiplier^attempt, max)`.
pub fn exponential_delay(base: Duration, multiplier: f64, max: Duration, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = base.as_nanos() as f64 * multiplier.powi(exponent);
    let max_nanos = max.as_nanos() as f64;

    if !raw.is_finite() || raw >= max_nanos {
        max
    } else {
        Duration::from_nanos(raw.round() as u64)
    }
}

/// Scale `delay` by `1 + JITTER_RATIO * offset`, with `offset` clamped to [-1, 1].
pub fn perturb(delay: Duration, offset: f64) -> Duration {
    let offset = offset.clamp(-1.0, 1.0);
    let nanos = delay.as_nanos() as f64 * (1.0 + JITTER_RATIO * offset);
    Duration::from_nanos(nanos.max(0.0).round() as u64)
}

/// Backoff schedule derived from retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Backoff {
    /// Delay to wait after failed attempt `attempt` (0-based).
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base(attempt);
        if self.jitter {
            perturb(delay, rng.gen_range(-1.0..=1.0))
        } else {
            delay
        }
    }

    /// Delay before jitter.
    pub fn base(&self, attempt: u32) -> Duration {
        exponential_delay(self.base_delay, self.multiplier, self.max_delay, attempt)
    }

    /// Unjittered schedule for `retries` retries.
    pub fn schedule(&self, retries: u32) -> Vec<Duration> {
        (0..retries).map(|n| self.base(n)).collect()
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}
