//! Process-wide graceful degradation.
//!
//! One [`DegradationController`] owns the degradation level. Metrics
//! snapshots are matched against the configured strategies; a more severe
//! match escalates, and the active strategy's revert threshold brings the
//! level back to `none`. Strategies with non-reversible actions (the default
//! `critical`) only leave through [`DegradationController::manual_reset`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use rampart_core::degradation::select_strategy;
use rampart_core::{
    DegradationAction, DegradationActionKind, DegradationConfig, DegradationLevel,
    DegradationStrategy, RampartError, SystemMetrics, TargetId,
};

use crate::balancer::TargetGate;
use crate::listeners::{ListenerId, Listeners};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActuatorError {
    #[error("Degradation action not supported: {0}")]
    Unsupported(String),

    #[error("Degradation action failed: {0}")]
    Failed(String),
}

/// Applies degradation actions to the host application.
#[async_trait]
pub trait DegradationActuator: Send + Sync {
    async fn apply(&self, action: &DegradationAction) -> Result<(), ActuatorError>;

    async fn revert(&self, action: &DegradationAction) -> Result<(), ActuatorError>;
}

/// Produces the snapshots the periodic evaluation reads.
pub trait MetricsSource: Send + Sync {
    fn system_metrics(&self) -> SystemMetrics;
}

/// Current degradation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationStatus {
    pub level: DegradationLevel,
    pub active_actions: Vec<DegradationAction>,
    pub triggered_by: Option<String>,

    /// Registered targets excluded by the active actions
    pub affected_models: Vec<TargetId>,
    pub since: DateTime<Utc>,
}

impl Default for DegradationStatus {
    fn default() -> Self {
        Self {
            level: DegradationLevel::None,
            active_actions: Vec::new(),
            triggered_by: None,
            affected_models: Vec::new(),
            since: Utc::now(),
        }
    }
}

/// Record of one level transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationEvent {
    pub previous_level: DegradationLevel,
    pub new_level: DegradationLevel,
    pub reason: String,

    /// Actions applied on escalation, or reverted on recovery
    pub actions: Vec<DegradationAction>,
    pub metrics: Option<SystemMetrics>,

    #[serde(default)]
    pub actuator_errors: Vec<String>,
    pub at: DateTime<Utc>,
}

enum Transition {
    Escalate {
        strategy: DegradationStrategy,
        reason: String,
    },
    Revert {
        reason: String,
        // Manual resets also undo non-reversible actions
        include_permanent: bool,
    },
}

#[derive(Default)]
struct ControllerState {
    status: DegradationStatus,
    active_strategy: Option<DegradationStrategy>,
    history: VecDeque<DegradationEvent>,
    last_metrics: Option<SystemMetrics>,
}

pub struct DegradationController {
    config: DegradationConfig,
    state: Mutex<ControllerState>,
    // Serializes transitions across actuator awaits
    transitions: tokio::sync::Mutex<()>,
    models: RwLock<BTreeMap<TargetId, u32>>,
    actuator: Option<Arc<dyn DegradationActuator>>,
    listeners: Listeners<DegradationEvent>,
    timer: Mutex<Option<CancellationToken>>,
}

impl DegradationController {
    pub fn new(config: DegradationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ControllerState::default()),
            transitions: tokio::sync::Mutex::new(()),
            models: RwLock::new(BTreeMap::new()),
            actuator: None,
            listeners: Listeners::new(),
            timer: Mutex::new(None),
        }
    }

    pub fn with_actuator(mut self, actuator: Arc<dyn DegradationActuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    pub fn config(&self) -> &DegradationConfig {
        &self.config
    }

    /// Track a target so priority restrictions can be resolved.
    pub fn register_model(&self, target: TargetId, priority: u32) {
        self.models.write().insert(target, priority);
    }

    pub fn unregister_model(&self, target: &TargetId) -> bool {
        self.models.write().remove(target).is_some()
    }

    /// Evaluate a metrics snapshot, escalating or reverting as needed.
    pub async fn update_metrics(&self, metrics: SystemMetrics) -> Option<DegradationEvent> {
        let _serial = self.transitions.lock().await;
        let transition = {
            let mut state = self.state.lock();
            state.last_metrics = Some(metrics.clone());
            self.evaluate(&state, &metrics)
        }?;
        Some(self.transition(transition, Some(metrics)).await)
    }

    /// Escalate to `level` by hand.
    ///
    /// Levels at or below the current one are ignored; `None` resets.
    pub async fn trigger_degradation(
        &self,
        level: DegradationLevel,
        reason: impl Into<String>,
    ) -> Result<Option<DegradationEvent>, RampartError> {
        let reason = reason.into();
        if level == DegradationLevel::None {
            return Ok(self.manual_reset(reason).await);
        }

        let strategy = self
            .config
            .strategies
            .iter()
            .find(|s| s.level == level)
            .cloned()
            .ok_or_else(|| {
                RampartError::InvalidConfig(format!("no degradation strategy for level {level}"))
            })?;

        let _serial = self.transitions.lock().await;
        let (current, metrics) = {
            let state = self.state.lock();
            (state.status.level, state.last_metrics.clone())
        };
        if level <= current {
            tracing::debug!(%level, %current, "Degradation already at or above requested level");
            return Ok(None);
        }

        let event = self
            .transition(Transition::Escalate { strategy, reason }, metrics)
            .await;
        Ok(Some(event))
    }

    /// Return to `none`, reverting every active action.
    pub async fn manual_reset(&self, reason: impl Into<String>) -> Option<DegradationEvent> {
        let _serial = self.transitions.lock().await;
        let (idle, metrics) = {
            let state = self.state.lock();
            (
                state.status.level == DegradationLevel::None
                    && state.status.active_actions.is_empty(),
                state.last_metrics.clone(),
            )
        };
        if idle {
            return None;
        }

        let transition = Transition::Revert {
            reason: reason.into(),
            include_permanent: true,
        };
        Some(self.transition(transition, metrics).await)
    }

    pub fn status(&self) -> DegradationStatus {
        self.state.lock().status.clone()
    }

    pub fn level(&self) -> DegradationLevel {
        self.state.lock().status.level
    }

    /// Transition events, oldest first.
    pub fn history(&self) -> Vec<DegradationEvent> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn last_metrics(&self) -> Option<SystemMetrics> {
        self.state.lock().last_metrics.clone()
    }

    /// Evaluate metrics from `source` every `evaluation_interval`.
    pub fn start(self: &Arc<Self>, source: Arc<dyn MetricsSource>) {
        if !self.config.enabled {
            return;
        }
        let token = {
            let mut timer = self.timer.lock();
            if timer.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *timer = Some(token.clone());
            token
        };

        let controller = Arc::downgrade(self);
        let interval = self.config.evaluation_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(controller) = controller.upgrade() else { break };
                let metrics = source.system_metrics();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = controller.update_metrics(metrics) => {}
                }
            }
        });
        tracing::info!(?interval, "Degradation evaluation started");
    }

    pub fn stop(&self) {
        if let Some(token) = self.timer.lock().take() {
            token.cancel();
            tracing::info!("Degradation evaluation stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DegradationEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn evaluate(&self, state: &ControllerState, metrics: &SystemMetrics) -> Option<Transition> {
        if !self.config.enabled {
            return None;
        }

        let current = state.status.level;
        if let Some(strategy) = select_strategy(&self.config.strategies, metrics) {
            if strategy.level > current {
                return Some(Transition::Escalate {
                    strategy: strategy.clone(),
                    reason: strategy.threshold.violations(metrics).join(", "),
                });
            }
        }

        let active = state.active_strategy.as_ref()?;
        if active.level == DegradationLevel::Critical || !active.is_reversible() {
            return None;
        }
        active.is_cleared(metrics).then(|| Transition::Revert {
            reason: format!("metrics within {} revert threshold", active.level),
            include_permanent: false,
        })
    }

    async fn transition(
        &self,
        transition: Transition,
        metrics: Option<SystemMetrics>,
    ) -> DegradationEvent {
        let models = self.models.read().clone();

        let (previous_level, new_level, reason, applied, reverted) = {
            let mut state = self.state.lock();
            let previous_level = state.status.level;

            let (reason, applied, reverted) = match transition {
                Transition::Escalate { strategy, reason } => {
                    let applied = strategy.actions.clone();
                    state.status.active_actions.extend(applied.iter().cloned());
                    state.status.level = strategy.level;
                    state.active_strategy = Some(strategy);
                    (reason, applied, Vec::new())
                }
                Transition::Revert {
                    reason,
                    include_permanent,
                } => {
                    let (mut reverted, kept): (Vec<_>, Vec<_>) = state
                        .status
                        .active_actions
                        .drain(..)
                        .partition(|a| a.reversible || include_permanent);
                    reverted.reverse();
                    state.status.active_actions = kept;
                    state.status.level = DegradationLevel::None;
                    state.active_strategy = None;
                    (reason, Vec::new(), reverted)
                }
            };

            state.status.triggered_by = Some(reason.clone());
            state.status.since = Utc::now();
            state.status.affected_models = excluded_models(&models, &state.status.active_actions);
            (previous_level, state.status.level, reason, applied, reverted)
        };

        let mut actuator_errors = Vec::new();
        if let Some(actuator) = &self.actuator {
            for action in &reverted {
                if let Err(err) = actuator.revert(action).await {
                    tracing::warn!(action = action.kind.name(), error = %err, "Failed to revert degradation action");
                    actuator_errors.push(format!("revert {}: {err}", action.kind.name()));
                }
            }
            for action in &applied {
                if let Err(err) = actuator.apply(action).await {
                    tracing::warn!(action = action.kind.name(), error = %err, "Failed to apply degradation action");
                    actuator_errors.push(format!("apply {}: {err}", action.kind.name()));
                }
            }
        }

        if new_level > previous_level {
            tracing::warn!(from = %previous_level, to = %new_level, reason = %reason, "Degradation escalated");
        } else {
            tracing::info!(from = %previous_level, to = %new_level, reason = %reason, "Degradation reverted");
        }

        let event = DegradationEvent {
            previous_level,
            new_level,
            reason,
            actions: if applied.is_empty() { reverted } else { applied },
            metrics,
            actuator_errors,
            at: Utc::now(),
        };

        {
            let mut state = self.state.lock();
            state.history.push_back(event.clone());
            while state.history.len() > self.config.history_size.max(1) {
                state.history.pop_front();
            }
        }
        self.listeners.emit(&event);
        event
    }
}

/// Whether the active actions let `target` with `priority` take traffic.
fn admitted(actions: &[DegradationAction], target: &TargetId, priority: u32) -> bool {
    actions.iter().all(|action| match &action.kind {
        DegradationActionKind::RestrictToPriority { min_priority } => priority >= *min_priority,
        DegradationActionKind::DisableModels { targets } => !targets.contains(target),
        DegradationActionKind::FallbackToModel { target: fallback } => fallback == target,
        _ => true,
    })
}

fn excluded_models(models: &BTreeMap<TargetId, u32>, actions: &[DegradationAction]) -> Vec<TargetId> {
    if !actions.iter().any(|a| a.kind.restricts_targets()) {
        return Vec::new();
    }
    models
        .iter()
        .filter(|(target, priority)| !admitted(actions, target, **priority))
        .map(|(target, _)| target.clone())
        .collect()
}

impl TargetGate for DegradationController {
    fn admits(&self, target: &TargetId, priority: u32) -> bool {
        let priority = self.models.read().get(target).copied().unwrap_or(priority);
        let state = self.state.lock();
        admitted(&state.status.active_actions, target, priority)
    }

    fn name(&self) -> &'static str {
        "degradation"
    }
}

impl Default for DegradationController {
    fn default() -> Self {
        Self::new(DegradationConfig::default())
    }
}

impl Drop for DegradationController {
    fn drop(&mut self) {
        if let Some(token) = self.timer.get_mut().take() {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for DegradationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationController")
            .field("level", &self.level())
            .field("strategies", &self.config.strategies.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::PerformanceThreshold;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingActuator {
        calls: Mutex<Vec<(&'static str, &'static str)>>,
        failing: Option<&'static str>,
    }

    #[async_trait]
    impl DegradationActuator for RecordingActuator {
        async fn apply(&self, action: &DegradationAction) -> Result<(), ActuatorError> {
            self.calls.lock().push(("apply", action.kind.name()));
            if self.failing == Some(action.kind.name()) {
                return Err(ActuatorError::Failed("cache offline".to_string()));
            }
            Ok(())
        }

        async fn revert(&self, action: &DegradationAction) -> Result<(), ActuatorError> {
            self.calls.lock().push(("revert", action.kind.name()));
            Ok(())
        }
    }

    fn metrics(response_ms: u64, error_rate: f64, availability: f64) -> SystemMetrics {
        SystemMetrics {
            average_response_time: Duration::from_millis(response_ms),
            error_rate,
            availability,
            ..SystemMetrics::default()
        }
    }

    fn healthy() -> SystemMetrics {
        metrics(100, 0.0, 1.0)
    }

    #[tokio::test]
    async fn test_moderate_band_escalates_to_exactly_moderate() {
        let controller = DegradationController::default();
        let event = controller
            .update_metrics(metrics(6_000, 0.0, 1.0))
            .await
            .unwrap();

        assert_eq!(event.previous_level, DegradationLevel::None);
        assert_eq!(event.new_level, DegradationLevel::Moderate);
        assert_eq!(controller.level(), DegradationLevel::Moderate);
        assert_eq!(controller.status().active_actions.len(), 2);
    }

    #[tokio::test]
    async fn test_healthy_metrics_change_nothing() {
        let controller = DegradationController::default();
        assert!(controller.update_metrics(healthy()).await.is_none());
        assert_eq!(controller.level(), DegradationLevel::None);
        assert!(controller.last_metrics().is_some());
    }

    #[tokio::test]
    async fn test_escalation_only_moves_up_until_cleared() {
        let controller = DegradationController::default();
        controller.update_metrics(metrics(12_000, 0.0, 1.0)).await;
        assert_eq!(controller.level(), DegradationLevel::Severe);

        // Back in the moderate band but above the severe revert threshold
        assert!(controller
            .update_metrics(metrics(8_000, 0.0, 1.0))
            .await
            .is_none());
        assert_eq!(controller.level(), DegradationLevel::Severe);

        let event = controller.update_metrics(healthy()).await.unwrap();
        assert_eq!(event.new_level, DegradationLevel::None);
        assert!(controller.status().active_actions.is_empty());
    }

    #[tokio::test]
    async fn test_revert_undoes_actions_in_reverse() {
        let actuator = Arc::new(RecordingActuator::default());
        let controller = DegradationController::default().with_actuator(actuator.clone());

        controller.update_metrics(metrics(3_000, 0.0, 1.0)).await;
        assert_eq!(controller.level(), DegradationLevel::Minimal);

        // Between trigger and revert thresholds: hold
        assert!(controller
            .update_metrics(metrics(1_800, 0.0, 1.0))
            .await
            .is_none());

        let event = controller.update_metrics(healthy()).await.unwrap();
        assert_eq!(event.actions.len(), 2);
        assert_eq!(
            *actuator.calls.lock(),
            vec![
                ("apply", "increase_caching"),
                ("apply", "disable_features"),
                ("revert", "disable_features"),
                ("revert", "increase_caching"),
            ]
        );
    }

    #[tokio::test]
    async fn test_critical_requires_manual_reset() {
        let actuator = Arc::new(RecordingActuator::default());
        let controller = DegradationController::default().with_actuator(actuator.clone());

        controller.update_metrics(metrics(40_000, 0.6, 0.1)).await;
        assert_eq!(controller.level(), DegradationLevel::Critical);

        assert!(controller.update_metrics(healthy()).await.is_none());
        assert_eq!(controller.level(), DegradationLevel::Critical);

        let event = controller.manual_reset("operator").await.unwrap();
        assert_eq!(event.previous_level, DegradationLevel::Critical);
        assert_eq!(event.new_level, DegradationLevel::None);
        assert!(controller.status().active_actions.is_empty());
        assert_eq!(controller.status().triggered_by.as_deref(), Some("operator"));
        assert!(actuator.calls.lock().iter().any(|(op, _)| *op == "revert"));

        assert!(controller.manual_reset("again").await.is_none());
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let controller = DegradationController::default();
        let event = controller
            .trigger_degradation(DegradationLevel::Severe, "load test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.reason, "load test");
        assert_eq!(controller.level(), DegradationLevel::Severe);

        let lower = controller
            .trigger_degradation(DegradationLevel::Minimal, "ignored")
            .await
            .unwrap();
        assert!(lower.is_none());
        assert_eq!(controller.level(), DegradationLevel::Severe);

        controller
            .trigger_degradation(DegradationLevel::None, "done")
            .await
            .unwrap();
        assert_eq!(controller.level(), DegradationLevel::None);
        assert_eq!(controller.history().len(), 2);
    }

    #[tokio::test]
    async fn test_unconfigured_level_is_rejected() {
        let controller = DegradationController::new(DegradationConfig {
            strategies: vec![],
            ..DegradationConfig::default()
        });
        let err = controller
            .trigger_degradation(DegradationLevel::Moderate, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, RampartError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_actuator_failure_is_recorded_not_thrown() {
        let actuator = Arc::new(RecordingActuator {
            failing: Some("increase_caching"),
            ..RecordingActuator::default()
        });
        let controller = DegradationController::default().with_actuator(actuator);
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = events.clone();
        controller.subscribe(move |e| seen.lock().push(e.clone()));

        let event = controller
            .update_metrics(metrics(3_000, 0.0, 1.0))
            .await
            .unwrap();
        assert_eq!(event.actuator_errors.len(), 1);
        assert!(event.actuator_errors[0].contains("increase_caching"));
        assert_eq!(controller.level(), DegradationLevel::Minimal);
        assert_eq!(events.lock().len(), 1);
    }

    fn gated(kind: DegradationActionKind) -> DegradationController {
        let strategy = DegradationStrategy {
            level: DegradationLevel::Moderate,
            threshold: PerformanceThreshold::new(Duration::from_secs(5), 0.15, 0.75),
            ceiling: None,
            revert_threshold: PerformanceThreshold::new(Duration::from_secs(3), 0.10, 0.85),
            actions: vec![DegradationAction::reversible(kind)],
        };
        DegradationController::new(DegradationConfig {
            strategies: vec![strategy],
            ..DegradationConfig::default()
        })
    }

    #[tokio::test]
    async fn test_priority_restriction_gates_targets() {
        let controller = gated(DegradationActionKind::RestrictToPriority { min_priority: 5 });
        controller.register_model(TargetId::new("premium"), 10);
        controller.register_model(TargetId::new("batch"), 1);

        assert!(controller.admits(&TargetId::new("batch"), 1));
        controller.update_metrics(metrics(6_000, 0.0, 1.0)).await;

        assert!(controller.admits(&TargetId::new("premium"), 0));
        assert!(!controller.admits(&TargetId::new("batch"), 0));
        assert_eq!(
            controller.status().affected_models,
            vec![TargetId::new("batch")]
        );

        controller.update_metrics(healthy()).await;
        assert!(controller.admits(&TargetId::new("batch"), 1));
        assert!(controller.status().affected_models.is_empty());
    }

    #[tokio::test]
    async fn test_disable_and_fallback_gates() {
        let controller = gated(DegradationActionKind::DisableModels {
            targets: vec![TargetId::new("flaky")],
        });
        controller.update_metrics(metrics(6_000, 0.0, 1.0)).await;
        assert!(!controller.admits(&TargetId::new("flaky"), 9));
        assert!(controller.admits(&TargetId::new("steady"), 0));

        let controller = gated(DegradationActionKind::FallbackToModel {
            target: TargetId::new("local"),
        });
        controller.update_metrics(metrics(6_000, 0.0, 1.0)).await;
        assert!(controller.admits(&TargetId::new("local"), 0));
        assert!(!controller.admits(&TargetId::new("remote"), 9));
    }

    #[tokio::test]
    async fn test_disabled_controller_ignores_metrics() {
        let controller = DegradationController::new(DegradationConfig {
            enabled: false,
            ..DegradationConfig::default()
        });
        assert!(controller
            .update_metrics(metrics(40_000, 0.9, 0.0))
            .await
            .is_none());
        assert_eq!(controller.level(), DegradationLevel::None);
    }

    struct FixedMetrics(Mutex<SystemMetrics>);

    impl MetricsSource for FixedMetrics {
        fn system_metrics(&self) -> SystemMetrics {
            self.0.lock().clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_evaluation() {
        let controller = Arc::new(DegradationController::new(DegradationConfig {
            evaluation_interval: Duration::from_secs(30),
            ..DegradationConfig::default()
        }));
        let source = Arc::new(FixedMetrics(Mutex::new(healthy())));

        controller.start(source.clone());
        assert!(controller.is_running());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.level(), DegradationLevel::None);

        *source.0.lock() = metrics(6_000, 0.0, 1.0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(controller.level(), DegradationLevel::Moderate);

        controller.stop();
        *source.0.lock() = metrics(40_000, 0.9, 0.0);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(controller.level(), DegradationLevel::Moderate);
    }
}
