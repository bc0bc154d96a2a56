//! Degradation strategies and threshold evaluation.
//!
//! Strategies are evaluated from least to most severe; the first whose
//! trigger threshold is exceeded and whose optional ceiling is not wins.
//! The controller that applies the chosen strategy lives in the runtime.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::option_duration_str;
use crate::types::{DegradationLevel, SystemMetrics, TargetId};

/// Bounds on a metrics snapshot. Unset bounds are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PerformanceThreshold {
    #[serde(with = "option_duration_str", skip_serializing_if = "Option::is_none")]
    pub max_response_time: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_error_rate: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_availability: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cpu_utilization: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_utilization: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_throughput: Option<f64>,
}

impl PerformanceThreshold {
    /// Threshold over latency, error rate and availability.
    pub fn new(max_response_time: Duration, max_error_rate: f64, min_availability: f64) -> Self {
        Self {
            max_response_time: Some(max_response_time),
            max_error_rate: Some(max_error_rate),
            min_availability: Some(min_availability),
            ..Self::default()
        }
    }

    /// Whether any bound is violated.
    pub fn is_exceeded(&self, metrics: &SystemMetrics) -> bool {
        !self.violations(metrics).is_empty()
    }

    /// Human-readable list of violated bounds.
    pub fn violations(&self, metrics: &SystemMetrics) -> Vec<String> {
        let mut violated = Vec::new();

        if let Some(max) = self.max_response_time {
            if metrics.average_response_time > max {
                violated.push(format!(
                    "response time {}ms > {}ms",
                    metrics.average_response_time.as_millis(),
                    max.as_millis()
                ));
            }
        }
        if let Some(max) = self.max_error_rate {
            if metrics.error_rate > max {
                violated.push(format!("error rate {:.3} > {:.3}", metrics.error_rate, max));
            }
        }
        if let Some(min) = self.min_availability {
            if metrics.availability < min {
                violated.push(format!(
                    "availability {:.3} < {:.3}",
                    metrics.availability, min
                ));
            }
        }
        if let Some(max) = self.max_cpu_utilization {
            if metrics.cpu_utilization > max {
                violated.push(format!("cpu {:.3} > {:.3}", metrics.cpu_utilization, max));
            }
        }
        if let Some(max) = self.max_memory_utilization {
            if metrics.memory_utilization > max {
                violated.push(format!(
                    "memory {:.3} > {:.3}",
                    metrics.memory_utilization, max
                ));
            }
        }
        if let Some(min) = self.min_throughput {
            if metrics.throughput < min {
                violated.push(format!("throughput {:.1} < {:.1}", metrics.throughput, min));
            }
        }

        violated
    }
}

/// Mitigation applied while a level is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DegradationActionKind {
    /// Turn off named optional features
    DisableFeatures { features: Vec<String> },

    /// Scale response quality (1.0 = full quality)
    ReduceQuality { factor: f64 },

    /// Serve cached responses for longer
    IncreaseCaching {
        #[serde(with = "crate::config::duration_str")]
        ttl: Duration,
    },

    /// Cap admitted requests per second
    RateLimit { requests_per_second: u32 },

    /// Only targets with at least this priority stay eligible
    RestrictToPriority { min_priority: u32 },

    /// Remove specific targets from rotation
    DisableModels { targets: Vec<TargetId> },

    /// Route everything to one target
    FallbackToModel { target: TargetId },
}

impl DegradationActionKind {
    /// Whether this action changes which targets are eligible.
    pub fn restricts_targets(&self) -> bool {
        matches!(
            self,
            DegradationActionKind::RestrictToPriority { .. }
                | DegradationActionKind::DisableModels { .. }
                | DegradationActionKind::FallbackToModel { .. }
        )
    }

    /// Short name used in logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            DegradationActionKind::DisableFeatures { .. } => "disable_features",
            DegradationActionKind::ReduceQuality { .. } => "reduce_quality",
            DegradationActionKind::IncreaseCaching { .. } => "increase_caching",
            DegradationActionKind::RateLimit { .. } => "rate_limit",
            DegradationActionKind::RestrictToPriority { .. } => "restrict_to_priority",
            DegradationActionKind::DisableModels { .. } => "disable_models",
            DegradationActionKind::FallbackToModel { .. } => "fallback_to_model",
        }
    }
}

fn default_reversible() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationAction {
    pub kind: DegradationActionKind,

    /// Reverted automatically when the level clears
    #[serde(default = "default_reversible")]
    pub reversible: bool,
}

impl DegradationAction {
    pub fn reversible(kind: DegradationActionKind) -> Self {
        Self {
            kind,
            reversible: true,
        }
    }

    pub fn permanent(kind: DegradationActionKind) -> Self {
        Self {
            kind,
            reversible: false,
        }
    }
}

/// Binds a level to its trigger, optional ceiling, revert threshold and actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationStrategy {
    pub level: DegradationLevel,

    /// Exceeding this activates the strategy
    pub threshold: PerformanceThreshold,

    /// Exceeding this hands over to a more severe strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceiling: Option<PerformanceThreshold>,

    /// Metrics must be back within this before the level reverts
    pub revert_threshold: PerformanceThreshold,

    #[serde(default)]
    pub actions: Vec<DegradationAction>,
}

impl DegradationStrategy {
    /// Whether the snapshot falls inside this strategy's band.
    pub fn matches(&self, metrics: &SystemMetrics) -> bool {
        self.threshold.is_exceeded(metrics)
            && !self
                .ceiling
                .as_ref()
                .map(|c| c.is_exceeded(metrics))
                .unwrap_or(false)
    }

    /// Whether metrics are back within the revert threshold.
    pub fn is_cleared(&self, metrics: &SystemMetrics) -> bool {
        !self.revert_threshold.is_exceeded(metrics)
    }

    /// Whether every action of this strategy can be reverted.
    pub fn is_reversible(&self) -> bool {
        self.actions.iter().all(|a| a.reversible)
    }
}

/// First strategy, in order, that matches the snapshot.
///
/// Strategies are listed from least to most severe. A strategy matches when
/// its trigger is exceeded and its ceiling, if any, is not. With the default
/// bands every ceiling is the next level's trigger, so at most one strategy
/// matches and it is the most severe level whose trigger is exceeded.
/// Strategies without ceilings fall back to the least severe match.
pub fn select_strategy<'a>(
    strategies: &'a [DegradationStrategy],
    metrics: &SystemMetrics,
) -> Option<&'a DegradationStrategy> {
    strategies.iter().find(|s| s.matches(metrics))
}

/// Default bands: each level's ceiling is the next level's trigger.
pub fn default_strategies() -> Vec<DegradationStrategy> {
    let minimal = PerformanceThreshold::new(Duration::from_secs(2), 0.05, 0.90);
    let moderate = PerformanceThreshold::new(Duration::from_secs(5), 0.15, 0.75);
    let severe = PerformanceThreshold::new(Duration::from_secs(10), 0.30, 0.50);
    let critical = PerformanceThreshold::new(Duration::from_secs(30), 0.50, 0.25);

    vec![
        DegradationStrategy {
            level: DegradationLevel::Minimal,
            threshold: minimal,
            ceiling: Some(moderate.clone()),
            revert_threshold: PerformanceThreshold::new(Duration::from_millis(1500), 0.03, 0.95),
            actions: vec![
                DegradationAction::reversible(DegradationActionKind::IncreaseCaching {
                    ttl: Duration::from_secs(5 * 60),
                }),
                DegradationAction::reversible(DegradationActionKind::DisableFeatures {
                    features: vec!["analytics".to_string(), "recommendations".to_string()],
                }),
            ],
        },
        DegradationStrategy {
            level: DegradationLevel::Moderate,
            threshold: moderate,
            ceiling: Some(severe.clone()),
            revert_threshold: PerformanceThreshold::new(Duration::from_secs(3), 0.10, 0.85),
            actions: vec![
                DegradationAction::reversible(DegradationActionKind::ReduceQuality {
                    factor: 0.8,
                }),
                DegradationAction::reversible(DegradationActionKind::IncreaseCaching {
                    ttl: Duration::from_secs(15 * 60),
                }),
            ],
        },
        DegradationStrategy {
            level: DegradationLevel::Severe,
            threshold: severe,
            ceiling: Some(critical.clone()),
            revert_threshold: PerformanceThreshold::new(Duration::from_secs(7), 0.20, 0.65),
            actions: vec![
                DegradationAction::reversible(DegradationActionKind::ReduceQuality {
                    factor: 0.5,
                }),
                DegradationAction::reversible(DegradationActionKind::RateLimit {
                    requests_per_second: 50,
                }),
            ],
        },
        DegradationStrategy {
            level: DegradationLevel::Critical,
            threshold: critical,
            ceiling: None,
            revert_threshold: PerformanceThreshold::new(Duration::from_secs(15), 0.35, 0.40),
            actions: vec![
                DegradationAction::permanent(DegradationActionKind::RateLimit {
                    requests_per_second: 10,
                }),
                DegradationAction::permanent(DegradationActionKind::DisableFeatures {
                    features: vec!["non_essential".to_string()],
                }),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn metrics(rt_ms: u64, error_rate: f64, availability: f64) -> SystemMetrics {
        SystemMetrics {
            average_response_time: Duration::from_millis(rt_ms),
            error_rate,
            availability,
            ..SystemMetrics::default()
        }
    }

    #[test]
    fn test_healthy_metrics_select_nothing() {
        let strategies = default_strategies();
        assert!(select_strategy(&strategies, &metrics(200, 0.01, 1.0)).is_none());
    }

    #[test]
    fn test_moderate_band_selects_moderate() {
        let strategies = default_strategies();
        let selected = select_strategy(&strategies, &metrics(6_000, 0.01, 1.0)).unwrap();
        assert_eq!(selected.level, DegradationLevel::Moderate);

        let selected = select_strategy(&strategies, &metrics(100, 0.2, 1.0)).unwrap();
        assert_eq!(selected.level, DegradationLevel::Moderate);
    }

    #[test]
    fn test_without_ceiling_first_match_wins() {
        let mut strategies = default_strategies();
        for s in &mut strategies {
            s.ceiling = None;
        }
        let selected = select_strategy(&strategies, &metrics(40_000, 0.9, 0.1)).unwrap();
        assert_eq!(selected.level, DegradationLevel::Minimal);
    }

    #[test]
    fn test_violations_describe_bounds() {
        let threshold = PerformanceThreshold::new(Duration::from_secs(1), 0.1, 0.9);
        let violated = threshold.violations(&metrics(2_000, 0.5, 0.5));
        assert_eq!(violated.len(), 3);
        assert!(violated[0].starts_with("response time"));
    }

    #[test]
    fn test_critical_defaults_are_permanent() {
        let strategies = default_strategies();
        let critical = strategies.last().unwrap();
        assert_eq!(critical.level, DegradationLevel::Critical);
        assert!(!critical.is_reversible());
        assert!(strategies[..3].iter().all(|s| s.is_reversible()));
    }

    #[test]
    fn test_action_kind_is_tagged() {
        let action = DegradationAction::reversible(DegradationActionKind::RateLimit {
            requests_per_second: 5,
        });
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"]["type"], "rate_limit");
        assert_eq!(json["reversible"], true);
    }

    proptest! {
        #[test]
        fn default_bands_pick_most_severe_exceeded_trigger(
            rt_ms in 0u64..60_000,
            error_rate in 0.0f64..1.0,
            availability in 0.0f64..1.0,
        ) {
            let strategies = default_strategies();
            let m = metrics(rt_ms, error_rate, availability);
            let expected = strategies
                .iter()
                .filter(|s| s.threshold.is_exceeded(&m))
                .map(|s| s.level)
                .max();
            let selected = select_strategy(&strategies, &m).map(|s| s.level);
            prop_assert_eq!(selected, expected);
        }
    }
}
