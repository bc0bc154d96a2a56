//! Recovery plans and how they are built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use rampart_core::config::duration_ms;
use rampart_core::{
    FailureClassification, FailureType, RecoveryConfig, RecoveryStrategy, Severity,
    SuccessCriteria, TargetId,
};

/// Remediation steps a plan can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    /// Probe the target again right away
    HealthRevalidation,
    ClearCache,
    ResetCircuitBreaker,
    /// Shift traffic away from the target
    ReduceTraffic,
    /// Undo a traffic reduction
    RestoreTraffic,
    /// Full restart of the backend, through a caller-supplied hook
    Restart,
}

impl RecoveryActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryActionKind::HealthRevalidation => "health_revalidation",
            RecoveryActionKind::ClearCache => "clear_cache",
            RecoveryActionKind::ResetCircuitBreaker => "reset_circuit_breaker",
            RecoveryActionKind::ReduceTraffic => "reduce_traffic",
            RecoveryActionKind::RestoreTraffic => "restore_traffic",
            RecoveryActionKind::Restart => "restart",
        }
    }

    /// Whether a failed attempt may be repeated.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RecoveryActionKind::ReduceTraffic | RecoveryActionKind::Restart
        )
    }

    /// Action that undoes this one, for actions that change routing.
    pub fn rollback(&self) -> Option<RecoveryActionKind> {
        match self {
            RecoveryActionKind::ReduceTraffic => Some(RecoveryActionKind::RestoreTraffic),
            _ => None,
        }
    }
}

impl fmt::Display for RecoveryActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub kind: RecoveryActionKind,

    #[serde(with = "duration_ms")]
    pub timeout: Duration,

    pub retryable: bool,

    /// Attempts allowed when `retryable`
    pub max_attempts: u32,
}

impl RecoveryAction {
    pub fn new(kind: RecoveryActionKind, config: &RecoveryConfig) -> Self {
        Self {
            kind,
            timeout: config.action_timeout,
            retryable: kind.is_retryable(),
            max_attempts: config.action_max_attempts.max(1),
        }
    }

    /// Attempts this action gets before it counts as failed.
    pub fn attempts_allowed(&self) -> u32 {
        if self.retryable {
            self.max_attempts.max(1)
        } else {
            1
        }
    }
}

/// Named group of consecutive actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPhase {
    pub name: String,
    pub actions: Vec<RecoveryActionKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: String,

    /// Concrete strategy the plan was built with
    pub strategy: RecoveryStrategy,
    pub target: TargetId,
    pub reason: String,
    pub classification: FailureClassification,
    pub phases: Vec<RecoveryPhase>,

    /// Every action in execution order
    pub actions: Vec<RecoveryAction>,
    pub success_criteria: SuccessCriteria,

    /// Undoes routing changes; `None` when the plan changes no routing
    pub rollback_plan: Option<Vec<RecoveryAction>>,
    pub estimated_success_rate: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Failed,
    /// The executor does not support this action
    Skipped,
}

/// How one action went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: RecoveryActionKind,
    pub status: ActionStatus,
    pub attempts: u32,
    pub error: Option<String>,

    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Succeeded,
    Failed,
    Cancelled,
    /// Aborted by the monitor after running past the plan timeout
    TimedOut,
}

/// Archived outcome of an executed plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryExecutionResult {
    pub plan_id: String,
    pub target: TargetId,
    pub strategy: RecoveryStrategy,
    pub outcome: RecoveryOutcome,
    pub actions: Vec<ActionRecord>,
    pub rolled_back: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RecoveryExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == RecoveryOutcome::Succeeded
    }
}

/// Concrete strategy for a failure. `Adaptive` picks one from the classification.
pub fn resolve_strategy(
    strategy: RecoveryStrategy,
    classification: &FailureClassification,
) -> RecoveryStrategy {
    if strategy != RecoveryStrategy::Adaptive {
        return strategy;
    }

    if classification.severity == Severity::Critical {
        return RecoveryStrategy::Immediate;
    }
    match classification.failure_type {
        FailureType::Persistent => RecoveryStrategy::Progressive,
        FailureType::Intermittent | FailureType::Cascading => RecoveryStrategy::Gradual,
        FailureType::Transient | FailureType::Unknown => RecoveryStrategy::Conservative,
    }
}

/// Phases for a concrete strategy, mildest first.
pub fn plan_phases(strategy: RecoveryStrategy, severity: Severity) -> Vec<RecoveryPhase> {
    use RecoveryActionKind::*;

    let phase = |name: &str, actions: Vec<RecoveryActionKind>| RecoveryPhase {
        name: name.to_string(),
        actions,
    };

    let mut phases = vec![phase("revalidate", vec![HealthRevalidation])];

    let (reset, reduce_traffic) = match strategy {
        RecoveryStrategy::Conservative => (vec![ResetCircuitBreaker], severity >= Severity::High),
        RecoveryStrategy::Progressive => (
            vec![ClearCache, ResetCircuitBreaker],
            severity >= Severity::Medium,
        ),
        RecoveryStrategy::Gradual => (vec![ClearCache, ResetCircuitBreaker], true),
        RecoveryStrategy::Immediate | RecoveryStrategy::Adaptive => {
            (vec![ClearCache, ResetCircuitBreaker], false)
        }
    };
    phases.push(phase("reset", reset));

    if reduce_traffic {
        phases.push(phase("shed_traffic", vec![ReduceTraffic]));
    }

    let restart = match strategy {
        RecoveryStrategy::Immediate => true,
        RecoveryStrategy::Conservative => false,
        _ => severity == Severity::Critical,
    };
    if restart {
        phases.push(phase("restart", vec![Restart]));
    }

    phases.push(phase("verify", vec![HealthRevalidation]));
    phases
}

/// Build a plan for `target` without scheduling it.
pub fn build_plan(
    id: String,
    target: TargetId,
    reason: String,
    classification: FailureClassification,
    config: &RecoveryConfig,
    effectiveness: &HashMap<RecoveryActionKind, f64>,
) -> RecoveryPlan {
    let strategy = resolve_strategy(config.strategy, &classification);
    let phases = plan_phases(strategy, classification.severity);

    let actions: Vec<_> = phases
        .iter()
        .flat_map(|p| p.actions.iter())
        .map(|kind| RecoveryAction::new(*kind, config))
        .collect();

    let rollback: Vec<_> = actions
        .iter()
        .rev()
        .filter_map(|a| a.kind.rollback())
        .map(|kind| RecoveryAction {
            retryable: true,
            ..RecoveryAction::new(kind, config)
        })
        .collect();

    let estimated_success_rate =
        estimate_success_rate(&actions, effectiveness, config.initial_effectiveness);

    RecoveryPlan {
        id,
        strategy,
        target,
        reason,
        classification,
        phases,
        actions,
        success_criteria: config.success_criteria.clone(),
        rollback_plan: (!rollback.is_empty()).then_some(rollback),
        estimated_success_rate,
        created_at: Utc::now(),
    }
}

/// Mean learned effectiveness over the distinct action kinds of a plan.
pub fn estimate_success_rate(
    actions: &[RecoveryAction],
    effectiveness: &HashMap<RecoveryActionKind, f64>,
    initial: f64,
) -> f64 {
    let mut kinds: Vec<_> = actions.iter().map(|a| a.kind).collect();
    kinds.sort();
    kinds.dedup();

    if kinds.is_empty() {
        return initial;
    }
    let total: f64 = kinds
        .iter()
        .map(|k| effectiveness.get(k).copied().unwrap_or(initial))
        .sum();
    total / kinds.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::FailureScope;
    use RecoveryActionKind::*;

    fn classification(failure_type: FailureType, severity: Severity) -> FailureClassification {
        FailureClassification {
            failure_type,
            severity,
            scope: FailureScope::Target,
            contributing_factors: vec![],
        }
    }

    fn kinds(plan: &RecoveryPlan) -> Vec<RecoveryActionKind> {
        plan.actions.iter().map(|a| a.kind).collect()
    }

    fn plan_for(strategy: RecoveryStrategy, c: FailureClassification) -> RecoveryPlan {
        let config = RecoveryConfig {
            strategy,
            ..RecoveryConfig::default()
        };
        build_plan(
            "p".into(),
            TargetId::new("t"),
            "test".into(),
            c,
            &config,
            &HashMap::new(),
        )
    }

    #[test]
    fn test_immediate_restarts() {
        let plan = plan_for(
            RecoveryStrategy::Immediate,
            classification(FailureType::Transient, Severity::Low),
        );
        assert_eq!(
            kinds(&plan),
            vec![HealthRevalidation, ClearCache, ResetCircuitBreaker, Restart, HealthRevalidation]
        );
        assert!(plan.rollback_plan.is_none());
    }

    #[test]
    fn test_gradual_sheds_traffic_with_rollback() {
        let plan = plan_for(
            RecoveryStrategy::Gradual,
            classification(FailureType::Intermittent, Severity::Medium),
        );
        assert!(kinds(&plan).contains(&ReduceTraffic));
        assert!(!kinds(&plan).contains(&Restart));

        let rollback = plan.rollback_plan.expect("rollback");
        assert_eq!(rollback.len(), 1);
        assert_eq!(rollback[0].kind, RestoreTraffic);
    }

    #[test]
    fn test_conservative_never_restarts() {
        let plan = plan_for(
            RecoveryStrategy::Conservative,
            classification(FailureType::Persistent, Severity::Critical),
        );
        assert!(!kinds(&plan).contains(&Restart));
        assert!(kinds(&plan).contains(&ReduceTraffic));
        assert!(!kinds(&plan).contains(&ClearCache));
    }

    #[test]
    fn test_adaptive_resolution() {
        let critical = classification(FailureType::Transient, Severity::Critical);
        assert_eq!(
            resolve_strategy(RecoveryStrategy::Adaptive, &critical),
            RecoveryStrategy::Immediate
        );
        let persistent = classification(FailureType::Persistent, Severity::Medium);
        assert_eq!(
            resolve_strategy(RecoveryStrategy::Adaptive, &persistent),
            RecoveryStrategy::Progressive
        );
        let transient = classification(FailureType::Transient, Severity::Low);
        assert_eq!(
            resolve_strategy(RecoveryStrategy::Adaptive, &transient),
            RecoveryStrategy::Conservative
        );
        assert_eq!(
            resolve_strategy(RecoveryStrategy::Gradual, &critical),
            RecoveryStrategy::Gradual
        );
    }

    #[test]
    fn test_plan_always_starts_and_ends_with_revalidation() {
        for strategy in [
            RecoveryStrategy::Immediate,
            RecoveryStrategy::Gradual,
            RecoveryStrategy::Progressive,
            RecoveryStrategy::Conservative,
            RecoveryStrategy::Adaptive,
        ] {
            let plan = plan_for(strategy, classification(FailureType::Unknown, Severity::High));
            let kinds = kinds(&plan);
            assert_eq!(kinds.first(), Some(&HealthRevalidation));
            assert_eq!(kinds.last(), Some(&HealthRevalidation));
        }
    }

    #[test]
    fn test_non_retryable_actions_get_one_attempt() {
        let config = RecoveryConfig::default();
        assert_eq!(RecoveryAction::new(Restart, &config).attempts_allowed(), 1);
        assert_eq!(
            RecoveryAction::new(ClearCache, &config).attempts_allowed(),
            config.action_max_attempts
        );
    }

    #[test]
    fn test_estimate_uses_learned_effectiveness() {
        let config = RecoveryConfig::default();
        let actions = vec![
            RecoveryAction::new(HealthRevalidation, &config),
            RecoveryAction::new(Restart, &config),
            RecoveryAction::new(HealthRevalidation, &config),
        ];
        assert_eq!(estimate_success_rate(&actions, &HashMap::new(), 0.5), 0.5);

        let learned = HashMap::from([(Restart, 0.9)]);
        let estimate = estimate_success_rate(&actions, &learned, 0.5);
        assert!((estimate - 0.7).abs() < 1e-9);
    }
}
