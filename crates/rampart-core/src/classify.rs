//! Failure classification from recent health records.

use std::time::Duration;

use crate::config::{ClassificationConfig, SeverityThresholds};
use crate::types::{
    FailureClassification, FailureScope, FailureType, HealthStatus, ModelHealth, Severity,
};

/// Fleet-wide facts that widen a single target's failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetContext {
    /// Tracked targets currently unavailable, including this one
    pub unavailable_targets: usize,

    /// Other targets of the same provider currently unavailable
    pub unavailable_same_provider: usize,
}

/// Classify a target's failure. `history` is oldest first.
pub fn classify_failure(
    history: &[ModelHealth],
    fleet: FleetContext,
    config: &ClassificationConfig,
) -> FailureClassification {
    let start = history.len().saturating_sub(config.window);
    let window = &history[start..];

    let Some(latest) = window.last() else {
        return FailureClassification {
            failure_type: FailureType::Unknown,
            severity: Severity::Low,
            scope: FailureScope::Target,
            contributing_factors: vec!["no health history".to_string()],
        };
    };

    let mut factors = Vec::new();
    let unavailable = window
        .iter()
        .filter(|h| h.status == HealthStatus::Unavailable)
        .count();

    let failure_type = if fleet.unavailable_targets >= config.cascade_min_targets {
        factors.push(format!(
            "{} targets unavailable across the fleet",
            fleet.unavailable_targets
        ));
        FailureType::Cascading
    } else if unavailable == window.len() {
        factors.push(format!("unavailable in all {} recent checks", window.len()));
        FailureType::Persistent
    } else if unavailable > 0 {
        factors.push(format!(
            "unavailable in {unavailable} of {} recent checks",
            window.len()
        ));
        FailureType::Intermittent
    } else if latest.error_rate > config.transient_error_rate {
        factors.push(format!("error rate {:.2}", latest.error_rate));
        FailureType::Transient
    } else {
        FailureType::Unknown
    };

    let scope = if failure_type == FailureType::Cascading {
        FailureScope::System
    } else if fleet.unavailable_same_provider > 0 {
        factors.push(format!(
            "{} other targets of the same provider unavailable",
            fleet.unavailable_same_provider
        ));
        FailureScope::Provider
    } else {
        FailureScope::Target
    };

    let mut severity = assess_severity(latest, &config.severity);
    if failure_type == FailureType::Cascading {
        severity = severity.max(Severity::High);
    }

    if let Some(err) = &latest.last_error {
        factors.push(format!("last error: {err}"));
    }

    FailureClassification {
        failure_type,
        severity,
        scope,
        contributing_factors: factors,
    }
}

/// Severity of the most extreme signal in a health record.
pub fn assess_severity(health: &ModelHealth, thresholds: &SeverityThresholds) -> Severity {
    let exceeds = |rt: Duration, er: f64, failures: u32| {
        health.response_time >= rt || health.error_rate >= er || health.failure_count >= failures
    };

    if exceeds(
        thresholds.critical_response_time,
        thresholds.critical_error_rate,
        thresholds.critical_failures,
    ) {
        Severity::Critical
    } else if exceeds(
        thresholds.high_response_time,
        thresholds.high_error_rate,
        thresholds.high_failures,
    ) {
        Severity::High
    } else if exceeds(
        thresholds.medium_response_time,
        thresholds.medium_error_rate,
        thresholds.medium_failures,
    ) {
        Severity::Medium
    } else {
        Severity::Low
    }
}
