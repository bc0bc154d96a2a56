//! Periodic health checking of registered targets.
//!
//! This module provides:
//! - The [`Probe`] seam with closure and HTTP implementations
//! - A factory registry that builds probes from JSON config
//! - The [`HealthChecker`] that schedules probes and derives status

mod checker;
mod probe;

pub use checker::{AlertKind, HealthAlert, HealthChecker, HealthEvent, HealthSource, SystemHealth};
pub use probe::{FnProbe, Probe, ProbeError, ProbeFactory, ProbeRegistry};

#[cfg(feature = "http")]
pub use probe::{HttpProbe, HttpProbeFactory};
