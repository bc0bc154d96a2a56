//! Automatic recovery of failing targets.
//!
//! [`AutoRecovery`] watches health updates, classifies failures, builds a
//! [`RecoveryPlan`] and runs it on a spawned task through a
//! [`RecoveryActionExecutor`]. At most one plan is active per target.

mod actions;
mod plan;

pub use actions::{ActionError, RecoveryActionExecutor};
pub use plan::{
    build_plan, estimate_success_rate, plan_phases, resolve_strategy, ActionRecord, ActionStatus,
    RecoveryAction, RecoveryActionKind, RecoveryExecutionResult, RecoveryOutcome, RecoveryPhase,
    RecoveryPlan,
};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use rampart_core::classify::{classify_failure, FleetContext};
use rampart_core::config::duration_ms;
use rampart_core::scoring::ema;
use rampart_core::{
    FailureClassification, HealthStatus, ModelHealth, RampartError, RecoveryConfig, TargetId,
    TargetInfo,
};

use crate::health::HealthSource;
use crate::listeners::{ListenerId, Listeners};

/// Events broadcast by the recovery engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryEvent {
    Started {
        plan: RecoveryPlan,
    },
    ActionCompleted {
        plan_id: String,
        target: TargetId,
        record: ActionRecord,
    },
    Completed {
        result: RecoveryExecutionResult,
    },
    Failed {
        result: RecoveryExecutionResult,
    },
    /// Cancelled by a caller or aborted by the plan timeout monitor
    Cancelled {
        result: RecoveryExecutionResult,
    },
    /// A health update met the triggers but no plan could be started
    TriggerRejected {
        target: TargetId,
        reason: String,
    },
}

/// Aggregate counters for pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub total_recoveries: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub cancelled_recoveries: u64,
    pub timed_out_recoveries: u64,
    pub active_recoveries: usize,
    pub success_rate: f64,

    #[serde(with = "duration_ms")]
    pub average_duration: Duration,

    pub action_effectiveness: BTreeMap<RecoveryActionKind, f64>,
}

struct ActiveRecovery {
    plan: RecoveryPlan,
    started: Instant,
    cancel: CancellationToken,
    abort: Option<RecoveryOutcome>,
}

#[derive(Default)]
struct Totals {
    total: u64,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
    timed_out: u64,
    duration: Duration,
}

#[derive(Default)]
struct RecoveryState {
    health_history: HashMap<TargetId, VecDeque<ModelHealth>>,
    providers: HashMap<TargetId, String>,
    active: HashMap<String, ActiveRecovery>,
    by_target: HashMap<TargetId, String>,
    history: VecDeque<RecoveryExecutionResult>,
    effectiveness: HashMap<RecoveryActionKind, f64>,
    totals: Totals,
}

impl RecoveryState {
    fn active_plan(&self, target: &TargetId) -> Option<&RecoveryPlan> {
        self.by_target
            .get(target)
            .and_then(|id| self.active.get(id))
            .map(|active| &active.plan)
    }

    /// Trailing checks in which the target answered cleanly.
    fn consecutive_successes(&self, target: &TargetId) -> u32 {
        self.health_history
            .get(target)
            .map(|history| {
                history
                    .iter()
                    .rev()
                    .take_while(|h| h.status.is_usable() && h.failure_count == 0)
                    .count() as u32
            })
            .unwrap_or(0)
    }
}

/// Health-driven recovery engine.
pub struct AutoRecovery {
    config: RecoveryConfig,
    health: Arc<dyn HealthSource>,
    executor: Arc<dyn RecoveryActionExecutor>,
    state: Mutex<RecoveryState>,
    listeners: Listeners<RecoveryEvent>,
    monitor: Mutex<Option<CancellationToken>>,
    next_id: AtomicU64,
}

impl AutoRecovery {
    pub fn new(
        config: RecoveryConfig,
        health: Arc<dyn HealthSource>,
        executor: Arc<dyn RecoveryActionExecutor>,
    ) -> Self {
        Self {
            config,
            health,
            executor,
            state: Mutex::new(RecoveryState::default()),
            listeners: Listeners::new(),
            monitor: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Track a target's provider so failures can be scoped to it.
    pub fn register_target(&self, info: &TargetInfo) {
        self.state
            .lock()
            .providers
            .insert(info.id.clone(), info.provider.clone());
    }

    /// Forget a target and cancel its active plan, if any.
    pub fn unregister_target(&self, target: &TargetId) {
        let mut state = self.state.lock();
        state.providers.remove(target);
        state.health_history.remove(target);
        if let Some(plan_id) = state.by_target.get(target).cloned() {
            if let Some(active) = state.active.get_mut(&plan_id) {
                active.abort.get_or_insert(RecoveryOutcome::Cancelled);
                active.cancel.cancel();
            }
        }
    }

    /// Record a health sample and start recovery if the triggers are met.
    ///
    /// Never fails; a plan that cannot start is logged and emitted as
    /// [`RecoveryEvent::TriggerRejected`].
    pub fn on_health_update(self: &Arc<Self>, health: &ModelHealth) {
        let already_active = {
            let mut state = self.state.lock();
            let limit = self.config.health_history_size.max(1);
            let history = state
                .health_history
                .entry(health.target.clone())
                .or_default();
            history.push_back(health.clone());
            while history.len() > limit {
                history.pop_front();
            }
            state.active_plan(&health.target).is_some()
        };

        if !self.config.enabled || already_active {
            return;
        }
        let Some(reason) = self.trigger_reason(health) else {
            return;
        };

        if let Err(err) = self.trigger_recovery(&health.target, reason) {
            tracing::warn!(target_id = %health.target, error = %err, "Automatic recovery not started");
            self.listeners.emit(&RecoveryEvent::TriggerRejected {
                target: health.target.clone(),
                reason: err.to_string(),
            });
        }
    }

    /// Why `health` warrants recovery, or `None` if it does not.
    pub fn trigger_reason(&self, health: &ModelHealth) -> Option<String> {
        let triggers = &self.config.triggers;
        if health.status == HealthStatus::Unavailable {
            Some("target unavailable".to_string())
        } else if health.error_rate > triggers.error_rate {
            Some(format!(
                "error rate {:.2} above {:.2}",
                health.error_rate, triggers.error_rate
            ))
        } else if health.response_time > triggers.response_time {
            Some(format!(
                "response time {:?} above {:?}",
                health.response_time, triggers.response_time
            ))
        } else if health.failure_count > triggers.consecutive_failures {
            Some(format!(
                "{} consecutive failures above {}",
                health.failure_count, triggers.consecutive_failures
            ))
        } else {
            None
        }
    }

    /// Start recovering `target`.
    ///
    /// Returns the already active plan when one exists for the target.
    pub fn trigger_recovery(
        self: &Arc<Self>,
        target: &TargetId,
        reason: impl Into<String>,
    ) -> Result<RecoveryPlan, RampartError> {
        let reason = reason.into();
        let fleet = self.health.all_health();

        let (plan, token) = {
            let mut state = self.state.lock();
            if let Some(existing) = state.active_plan(target) {
                tracing::debug!(target_id = %target, plan_id = %existing.id, "Recovery already active");
                return Ok(existing.clone());
            }

            let limit = self.config.max_concurrent_recoveries;
            if state.active.len() >= limit {
                return Err(RampartError::MaxConcurrentRecoveries { limit });
            }

            let plan = self.plan_for(&state, target, reason, &fleet);
            let token = CancellationToken::new();
            state.by_target.insert(target.clone(), plan.id.clone());
            state.active.insert(
                plan.id.clone(),
                ActiveRecovery {
                    plan: plan.clone(),
                    started: Instant::now(),
                    cancel: token.clone(),
                    abort: None,
                },
            );
            (plan, token)
        };

        tracing::warn!(
            target_id = %target,
            plan_id = %plan.id,
            strategy = ?plan.strategy,
            failure_type = ?plan.classification.failure_type,
            severity = ?plan.classification.severity,
            reason = %plan.reason,
            "Recovery started"
        );
        self.listeners.emit(&RecoveryEvent::Started { plan: plan.clone() });

        let recovery = Arc::clone(self);
        let scheduled = plan.clone();
        tokio::spawn(async move {
            recovery.run_plan(scheduled, token).await;
        });

        Ok(plan)
    }

    /// The plan recovery would run for `target` now, without running it.
    pub fn simulate_recovery(&self, target: &TargetId) -> RecoveryPlan {
        let fleet = self.health.all_health();
        let state = self.state.lock();
        self.plan_for(&state, target, "simulation".to_string(), &fleet)
    }

    /// Classify `target`'s current failure.
    pub fn classify(&self, target: &TargetId) -> FailureClassification {
        let fleet = self.health.all_health();
        let state = self.state.lock();
        self.classify_locked(&state, target, &fleet)
    }

    /// Abort an active plan. Routing changes already made are rolled back.
    pub fn cancel_recovery(&self, plan_id: &str) -> Result<(), RampartError> {
        let mut state = self.state.lock();
        let active = state
            .active
            .get_mut(plan_id)
            .ok_or_else(|| RampartError::RecoveryNotFound(plan_id.to_string()))?;
        active.abort.get_or_insert(RecoveryOutcome::Cancelled);
        active.cancel.cancel();
        tracing::info!(plan_id, target_id = %active.plan.target, "Recovery cancellation requested");
        Ok(())
    }

    pub fn active_recoveries(&self) -> Vec<RecoveryPlan> {
        let state = self.state.lock();
        let mut plans: Vec<_> = state.active.values().map(|a| a.plan.clone()).collect();
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        plans
    }

    pub fn active_plan_for(&self, target: &TargetId) -> Option<RecoveryPlan> {
        self.state.lock().active_plan(target).cloned()
    }

    /// Archived results, oldest first.
    pub fn recovery_history(&self) -> Vec<RecoveryExecutionResult> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Learned effectiveness of an action kind.
    pub fn action_effectiveness(&self, kind: RecoveryActionKind) -> f64 {
        self.state
            .lock()
            .effectiveness
            .get(&kind)
            .copied()
            .unwrap_or(self.config.initial_effectiveness)
    }

    pub fn get_recovery_statistics(&self) -> RecoveryStatistics {
        let state = self.state.lock();
        let totals = &state.totals;
        let finished = totals.succeeded + totals.failed;
        let average_duration = if totals.total == 0 {
            Duration::ZERO
        } else {
            totals.duration.div_f64(totals.total as f64)
        };

        RecoveryStatistics {
            total_recoveries: totals.total,
            successful_recoveries: totals.succeeded,
            failed_recoveries: totals.failed,
            cancelled_recoveries: totals.cancelled,
            timed_out_recoveries: totals.timed_out,
            active_recoveries: state.active.len(),
            success_rate: if finished == 0 {
                0.0
            } else {
                totals.succeeded as f64 / finished as f64
            },
            average_duration,
            action_effectiveness: state
                .effectiveness
                .iter()
                .map(|(kind, value)| (*kind, *value))
                .collect(),
        }
    }

    /// Start the monitor that aborts plans running past `plan_timeout`.
    pub fn start(self: &Arc<Self>) {
        let token = {
            let mut monitor = self.monitor.lock();
            if monitor.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *monitor = Some(token.clone());
            token
        };

        let recovery = Arc::downgrade(self);
        let interval = self.config.monitor_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(recovery) = recovery.upgrade() else { break };
                recovery.abort_overdue();
            }
        });
        tracing::info!(?interval, "Recovery monitor started");
    }

    pub fn stop(&self) {
        if let Some(token) = self.monitor.lock().take() {
            token.cancel();
            tracing::info!("Recovery monitor stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RecoveryEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn abort_overdue(&self) -> usize {
        let timeout = self.config.plan_timeout;
        let mut state = self.state.lock();
        let mut aborted = 0;
        for active in state.active.values_mut() {
            if active.abort.is_none() && active.started.elapsed() > timeout {
                active.abort = Some(RecoveryOutcome::TimedOut);
                active.cancel.cancel();
                tracing::warn!(
                    plan_id = %active.plan.id,
                    target_id = %active.plan.target,
                    ?timeout,
                    "Recovery plan exceeded its timeout"
                );
                aborted += 1;
            }
        }
        aborted
    }

    fn classify_locked(
        &self,
        state: &RecoveryState,
        target: &TargetId,
        fleet: &[ModelHealth],
    ) -> FailureClassification {
        let mut history: Vec<ModelHealth> = state
            .health_history
            .get(target)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();
        if history.is_empty() {
            history.extend(fleet.iter().find(|h| &h.target == target).cloned());
        }

        let unavailable: Vec<&ModelHealth> = fleet
            .iter()
            .filter(|h| h.status == HealthStatus::Unavailable)
            .collect();
        let unavailable_same_provider = state
            .providers
            .get(target)
            .map(|provider| {
                unavailable
                    .iter()
                    .filter(|h| &h.target != target)
                    .filter(|h| state.providers.get(&h.target) == Some(provider))
                    .count()
            })
            .unwrap_or(0);

        let context = FleetContext {
            unavailable_targets: unavailable.len(),
            unavailable_same_provider,
        };
        classify_failure(&history, context, &self.config.classification)
    }

    fn plan_for(
        &self,
        state: &RecoveryState,
        target: &TargetId,
        reason: String,
        fleet: &[ModelHealth],
    ) -> RecoveryPlan {
        let classification = self.classify_locked(state, target, fleet);
        let id = format!(
            "recovery-{}-{}",
            target,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        build_plan(
            id,
            target.clone(),
            reason,
            classification,
            &self.config,
            &state.effectiveness,
        )
    }

    async fn run_plan(self: Arc<Self>, plan: RecoveryPlan, token: CancellationToken) {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut records = Vec::new();

        let run = tokio::select! {
            _ = token.cancelled() => None,
            result = self.execute_actions(&plan, &mut records) => Some(result),
        };

        let (outcome, error) = match run {
            Some(Ok(())) => (RecoveryOutcome::Succeeded, None),
            Some(Err(err)) => (RecoveryOutcome::Failed, Some(err)),
            None => {
                let outcome = self
                    .state
                    .lock()
                    .active
                    .get(&plan.id)
                    .and_then(|a| a.abort)
                    .unwrap_or(RecoveryOutcome::Cancelled);
                let message = match outcome {
                    RecoveryOutcome::TimedOut => "plan timed out",
                    _ => "plan cancelled",
                };
                (outcome, Some(message.to_string()))
            }
        };

        let rolled_back = self.roll_back(&plan, &records).await;
        let duration = started.elapsed();

        let result = RecoveryExecutionResult {
            plan_id: plan.id.clone(),
            target: plan.target.clone(),
            strategy: plan.strategy,
            outcome,
            actions: records,
            rolled_back,
            error,
            started_at,
            finished_at: Utc::now(),
        };
        self.finish(&plan, &result, duration);

        match outcome {
            RecoveryOutcome::Succeeded => {
                tracing::info!(target_id = %plan.target, plan_id = %plan.id, ?duration, "Recovery succeeded");
                self.listeners.emit(&RecoveryEvent::Completed { result });
            }
            RecoveryOutcome::Failed => {
                tracing::warn!(
                    target_id = %plan.target,
                    plan_id = %plan.id,
                    error = result.error.as_deref().unwrap_or_default(),
                    "Recovery failed"
                );
                self.listeners.emit(&RecoveryEvent::Failed { result });
            }
            RecoveryOutcome::Cancelled | RecoveryOutcome::TimedOut => {
                tracing::warn!(target_id = %plan.target, plan_id = %plan.id, ?outcome, "Recovery aborted");
                self.listeners.emit(&RecoveryEvent::Cancelled { result });
            }
        }
    }

    async fn execute_actions(
        &self,
        plan: &RecoveryPlan,
        records: &mut Vec<ActionRecord>,
    ) -> Result<(), String> {
        for action in &plan.actions {
            let record = self.run_action(&plan.target, action).await;
            let status = record.status;
            let error = record.error.clone();

            tracing::debug!(
                target_id = %plan.target,
                plan_id = %plan.id,
                action = %record.kind,
                ?status,
                attempts = record.attempts,
                "Recovery action finished"
            );
            self.listeners.emit(&RecoveryEvent::ActionCompleted {
                plan_id: plan.id.clone(),
                target: plan.target.clone(),
                record: record.clone(),
            });
            records.push(record);

            if status == ActionStatus::Failed {
                return Err(format!(
                    "{} failed: {}",
                    action.kind,
                    error.unwrap_or_default()
                ));
            }
        }

        self.check_success(plan)
    }

    async fn run_action(&self, target: &TargetId, action: &RecoveryAction) -> ActionRecord {
        let started = Instant::now();
        let finish = |status, attempts, error: Option<String>| ActionRecord {
            kind: action.kind,
            status,
            attempts,
            error,
            duration: started.elapsed(),
        };

        let allowed = action.attempts_allowed();
        let mut attempts = 0;
        let mut last_error = None;
        while attempts < allowed {
            attempts += 1;
            let result =
                match tokio::time::timeout(action.timeout, self.executor.execute(target, action))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ActionError::Timeout(action.timeout)),
                };

            match result {
                Ok(()) => return finish(ActionStatus::Succeeded, attempts, None),
                Err(err @ ActionError::Unsupported(_)) => {
                    return finish(ActionStatus::Skipped, attempts, Some(err.to_string()));
                }
                Err(err) => {
                    tracing::debug!(target_id = %target, action = %action.kind, attempt = attempts, error = %err, "Recovery action attempt failed");
                    last_error = Some(err);
                }
            }
        }

        finish(
            ActionStatus::Failed,
            attempts,
            last_error.map(|e| e.to_string()),
        )
    }

    fn check_success(&self, plan: &RecoveryPlan) -> Result<(), String> {
        let criteria = &plan.success_criteria;
        let latest = self
            .health
            .health(&plan.target)
            .ok_or_else(|| "no health record for target".to_string())?;

        if !latest.status.is_usable() {
            return Err(format!("success criteria not met: target is {}", latest.status));
        }
        if latest.response_time > criteria.max_response_time {
            return Err(format!(
                "success criteria not met: response time {:?} above {:?}",
                latest.response_time, criteria.max_response_time
            ));
        }
        let success_rate = 1.0 - latest.error_rate;
        if success_rate < criteria.min_success_rate {
            return Err(format!(
                "success criteria not met: success rate {success_rate:.2} below {:.2}",
                criteria.min_success_rate
            ));
        }

        let consecutive = self
            .state
            .lock()
            .consecutive_successes(&plan.target)
            .max(u32::from(latest.failure_count == 0));
        if consecutive < criteria.consecutive_successes {
            return Err(format!(
                "success criteria not met: {consecutive} consecutive successes, need {}",
                criteria.consecutive_successes
            ));
        }
        Ok(())
    }

    /// Undo the routing changes that were applied. Best effort.
    async fn roll_back(&self, plan: &RecoveryPlan, records: &[ActionRecord]) -> bool {
        let Some(rollback) = &plan.rollback_plan else {
            return false;
        };
        let applied: Vec<_> = records
            .iter()
            .filter(|r| r.status == ActionStatus::Succeeded)
            .filter_map(|r| r.kind.rollback())
            .collect();

        let mut rolled_back = false;
        for action in rollback.iter().filter(|a| applied.contains(&a.kind)) {
            let record = self.run_action(&plan.target, action).await;
            if record.status == ActionStatus::Failed {
                tracing::warn!(
                    target_id = %plan.target,
                    plan_id = %plan.id,
                    action = %action.kind,
                    error = record.error.as_deref().unwrap_or_default(),
                    "Rollback action failed"
                );
            }
            rolled_back = true;
        }
        rolled_back
    }

    fn finish(&self, plan: &RecoveryPlan, result: &RecoveryExecutionResult, duration: Duration) {
        let mut state = self.state.lock();
        state.active.remove(&plan.id);
        if state.by_target.get(&plan.target) == Some(&plan.id) {
            state.by_target.remove(&plan.target);
        }

        let totals = &mut state.totals;
        totals.total += 1;
        totals.duration += duration;
        match result.outcome {
            RecoveryOutcome::Succeeded => totals.succeeded += 1,
            RecoveryOutcome::Failed => totals.failed += 1,
            RecoveryOutcome::Cancelled => totals.cancelled += 1,
            RecoveryOutcome::TimedOut => totals.timed_out += 1,
        }

        // Aborted plans say nothing about how well their actions work.
        if matches!(
            result.outcome,
            RecoveryOutcome::Succeeded | RecoveryOutcome::Failed
        ) {
            let observation = if result.succeeded() { 1.0 } else { 0.0 };
            let mut kinds: Vec<_> = result
                .actions
                .iter()
                .filter(|r| r.status != ActionStatus::Skipped)
                .map(|r| r.kind)
                .collect();
            kinds.sort();
            kinds.dedup();

            for kind in kinds {
                let previous = state
                    .effectiveness
                    .get(&kind)
                    .copied()
                    .unwrap_or(self.config.initial_effectiveness);
                state
                    .effectiveness
                    .insert(kind, ema(previous, observation, self.config.learning_rate));
            }
        }

        state.history.push_back(result.clone());
        while state.history.len() > self.config.history_size.max(1) {
            state.history.pop_front();
        }
    }
}

impl Drop for AutoRecovery {
    fn drop(&mut self) {
        if let Some(token) = self.monitor.get_mut().take() {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for AutoRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AutoRecovery")
            .field("strategy", &self.config.strategy)
            .field("active", &state.active.len())
            .field("history", &state.history.len())
            .finish()
    }
}
