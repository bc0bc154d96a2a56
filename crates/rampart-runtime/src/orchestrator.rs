//! Runtime composition of every resilience component.
//!
//! [`ResilienceRuntime`] owns one instance of each component, registers
//! targets with all of them and wires them together:
//! - health updates feed the load balancer and auto-recovery
//! - circuit breakers and the degradation controller gate selection
//! - recovery actions revalidate health, reset breakers and shift traffic
//! - the degradation timer reads fleet metrics from the balancer and checker

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use rampart_core::{
    CallError, CircuitState, Classify, ConfigError, HealthStatus, RuntimeConfig, SystemMetrics,
    TargetId, TargetInfo,
};

use crate::balancer::{LoadBalancer, ModelConfig, SelectionRequest};
use crate::degradation::{DegradationActuator, DegradationController, MetricsSource};
use crate::health::{HealthChecker, HealthEvent, Probe};
use crate::recovery::{
    ActionError, AutoRecovery, RecoveryAction, RecoveryActionExecutor, RecoveryActionKind,
};
use crate::resilience::{BreakerEvent, CircuitBreakerRegistry, RetryManager, RetryOptions};

/// Caller-supplied operation for recovery actions the runtime cannot do itself.
#[async_trait]
pub trait RecoveryHook: Send + Sync {
    async fn run(&self, target: &TargetId) -> Result<(), ActionError>;
}

/// Recovery actions backed by the runtime's own components.
pub struct RuntimeRecoveryActions {
    health: Arc<HealthChecker>,
    breakers: Arc<CircuitBreakerRegistry>,
    balancer: Arc<LoadBalancer>,
    saved_weights: Mutex<HashMap<TargetId, u32>>,
    restart: Option<Arc<dyn RecoveryHook>>,
    clear_cache: Option<Arc<dyn RecoveryHook>>,
}

impl RuntimeRecoveryActions {
    pub fn new(
        health: Arc<HealthChecker>,
        breakers: Arc<CircuitBreakerRegistry>,
        balancer: Arc<LoadBalancer>,
    ) -> Self {
        Self {
            health,
            breakers,
            balancer,
            saved_weights: Mutex::new(HashMap::new()),
            restart: None,
            clear_cache: None,
        }
    }

    async fn run_hook(
        hook: Option<&Arc<dyn RecoveryHook>>,
        target: &TargetId,
        kind: RecoveryActionKind,
    ) -> Result<(), ActionError> {
        match hook {
            Some(hook) => hook.run(target).await,
            None => Err(ActionError::Unsupported(kind)),
        }
    }

    /// Halve the target's weight, remembering the original.
    fn reduce_traffic(&self, target: &TargetId) -> Result<(), ActionError> {
        let config = self
            .balancer
            .model_config(target)
            .ok_or_else(|| ActionError::Failed(format!("{target} is not registered")))?;
        let reduced = (config.weight / 2).max(1);
        let previous = self
            .balancer
            .set_weight(target, reduced)
            .map_err(|e| ActionError::Failed(e.to_string()))?;
        self.saved_weights
            .lock()
            .entry(target.clone())
            .or_insert(previous);
        tracing::info!(target_id = %target, previous, reduced, "Traffic reduced for recovery");
        Ok(())
    }

    fn restore_traffic(&self, target: &TargetId) -> Result<(), ActionError> {
        let Some(weight) = self.saved_weights.lock().remove(target) else {
            return Ok(());
        };
        self.balancer
            .set_weight(target, weight)
            .map_err(|e| ActionError::Failed(e.to_string()))?;
        tracing::info!(target_id = %target, weight, "Traffic restored after recovery");
        Ok(())
    }
}

#[async_trait]
impl RecoveryActionExecutor for RuntimeRecoveryActions {
    async fn execute(&self, target: &TargetId, action: &RecoveryAction) -> Result<(), ActionError> {
        match action.kind {
            RecoveryActionKind::HealthRevalidation => self
                .health
                .check_now(target)
                .await
                .map(|_| ())
                .map_err(|e| ActionError::Failed(e.to_string())),
            RecoveryActionKind::ResetCircuitBreaker => {
                if let Some(breaker) = self.breakers.get(target) {
                    breaker.reset();
                }
                self.balancer
                    .reset_health_score(target)
                    .map_err(|e| ActionError::Failed(e.to_string()))
            }
            RecoveryActionKind::ReduceTraffic => self.reduce_traffic(target),
            RecoveryActionKind::RestoreTraffic => self.restore_traffic(target),
            RecoveryActionKind::ClearCache => {
                Self::run_hook(self.clear_cache.as_ref(), target, action.kind).await
            }
            RecoveryActionKind::Restart => {
                Self::run_hook(self.restart.as_ref(), target, action.kind).await
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    completed: u64,
    failed: u64,
    // Sum of response times over completed requests, in milliseconds
    latency_ms: f64,
    at: Instant,
}

/// Fleet metrics assembled from the load balancer and the health checker.
///
/// Request-derived figures cover the window since the previous evaluation.
pub struct RuntimeMetricsSource {
    balancer: Arc<LoadBalancer>,
    health: Arc<HealthChecker>,
    checkpoint: Mutex<Checkpoint>,
}

impl RuntimeMetricsSource {
    pub fn new(balancer: Arc<LoadBalancer>, health: Arc<HealthChecker>) -> Self {
        let checkpoint = Checkpoint {
            completed: 0,
            failed: 0,
            latency_ms: 0.0,
            at: Instant::now(),
        };
        Self {
            balancer,
            health,
            checkpoint: Mutex::new(checkpoint),
        }
    }

    /// Metrics for the current window without closing it.
    pub fn peek(&self) -> SystemMetrics {
        self.snapshot(false)
    }

    fn snapshot(&self, advance: bool) -> SystemMetrics {
        let stats = self.balancer.get_load_statistics();
        let system = self.health.system_health();
        let active_models = self.balancer.eligible_models().len();

        let mut now = Checkpoint {
            completed: 0,
            failed: 0,
            latency_ms: 0.0,
            at: Instant::now(),
        };
        let mut cpu = 0.0;
        let mut memory = 0.0;
        for model in &stats.models {
            let completed = model.stats.successful_requests + model.stats.failed_requests;
            now.completed += completed;
            now.failed += model.stats.failed_requests;
            now.latency_ms += model.stats.average_response_time * completed as f64;
            cpu += model.cpu_utilization;
            memory += model.memory_utilization;
        }

        let previous = {
            let mut checkpoint = self.checkpoint.lock();
            let previous = *checkpoint;
            if advance {
                *checkpoint = now;
            }
            previous
        };

        let completed = now.completed.saturating_sub(previous.completed);
        let failed = now.failed.saturating_sub(previous.failed);
        let latency_ms = (now.latency_ms - previous.latency_ms).max(0.0);
        let elapsed = now.at.duration_since(previous.at).as_secs_f64();

        let (average_response_time, error_rate) = if completed == 0 {
            (std::time::Duration::ZERO, 0.0)
        } else {
            (
                std::time::Duration::from_secs_f64(latency_ms / completed as f64 / 1000.0),
                failed as f64 / completed as f64,
            )
        };

        let models = stats.models.len().max(1) as f64;
        SystemMetrics {
            timestamp: Utc::now(),
            average_response_time,
            error_rate,
            availability: if system.total == 0 {
                1.0
            } else {
                (system.total - system.unavailable) as f64 / system.total as f64
            },
            cpu_utilization: cpu / models,
            memory_utilization: memory / models,
            throughput: if elapsed > 0.0 {
                completed as f64 / elapsed
            } else {
                0.0
            },
            active_models,
            total_models: stats.models.len(),
        }
    }
}

impl MetricsSource for RuntimeMetricsSource {
    fn system_metrics(&self) -> SystemMetrics {
        self.snapshot(true)
    }
}

/// Builds a [`ResilienceRuntime`] from a [`RuntimeConfig`].
pub struct ResilienceRuntimeBuilder {
    config: RuntimeConfig,
    restart: Option<Arc<dyn RecoveryHook>>,
    clear_cache: Option<Arc<dyn RecoveryHook>>,
    actuator: Option<Arc<dyn DegradationActuator>>,
}

impl ResilienceRuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            restart: None,
            clear_cache: None,
            actuator: None,
        }
    }

    /// Hook run for the `restart` recovery action.
    pub fn restart_hook(mut self, hook: Arc<dyn RecoveryHook>) -> Self {
        self.restart = Some(hook);
        self
    }

    /// Hook run for the `clear_cache` recovery action.
    pub fn cache_hook(mut self, hook: Arc<dyn RecoveryHook>) -> Self {
        self.clear_cache = Some(hook);
        self
    }

    pub fn degradation_actuator(mut self, actuator: Arc<dyn DegradationActuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    pub fn build(self) -> Result<ResilienceRuntime, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let retry_options = RetryOptions::from(&config.retry);
        let retry = Arc::new(RetryManager::new(retry_options.clone()));
        let health = Arc::new(HealthChecker::new(config.health.clone()));
        let balancer = Arc::new(LoadBalancer::new(config.load_balancer.clone()));

        let mut degradation = DegradationController::new(config.degradation.clone());
        if let Some(actuator) = self.actuator {
            degradation = degradation.with_actuator(actuator);
        }
        let degradation = Arc::new(degradation);

        let actions = RuntimeRecoveryActions {
            restart: self.restart,
            clear_cache: self.clear_cache,
            ..RuntimeRecoveryActions::new(health.clone(), breakers.clone(), balancer.clone())
        };
        let recovery = Arc::new(AutoRecovery::new(
            config.recovery.clone(),
            health.clone(),
            Arc::new(actions),
        ));

        balancer.add_gate(breakers.clone());
        balancer.add_gate(degradation.clone());

        let lb = Arc::downgrade(&balancer);
        let auto = Arc::downgrade(&recovery);
        health.subscribe(move |event| {
            if let HealthEvent::Updated { health, .. } = event {
                if let Some(balancer) = lb.upgrade() {
                    if let Err(err) = balancer.update_model_health(&health.target, health.status) {
                        tracing::debug!(target_id = %health.target, error = %err, "Health update for unbalanced target");
                    }
                }
                if let Some(recovery) = auto.upgrade() {
                    recovery.on_health_update(health);
                }
            }
        });

        // A closed circuit means the target serves again; its outage score goes.
        let lb = Arc::downgrade(&balancer);
        breakers.subscribe(move |event| {
            if let BreakerEvent::StateChanged {
                target,
                to: CircuitState::Closed,
                ..
            } = event
            {
                if let Some(balancer) = lb.upgrade() {
                    if let Err(err) = balancer.reset_health_score(target) {
                        tracing::debug!(target_id = %target, error = %err, "Circuit closed for unbalanced target");
                    }
                }
            }
        });

        let metrics = Arc::new(RuntimeMetricsSource::new(balancer.clone(), health.clone()));

        tracing::info!(
            algorithm = ?config.load_balancer.algorithm,
            recovery = config.recovery.enabled,
            degradation = config.degradation.enabled,
            "Resilience runtime built"
        );

        Ok(ResilienceRuntime {
            config,
            breakers,
            retry,
            retry_options,
            health,
            balancer,
            recovery,
            degradation,
            metrics,
            targets: RwLock::new(BTreeMap::new()),
            running: AtomicBool::new(false),
        })
    }
}

/// Explicitly constructed composition of the resilience components.
pub struct ResilienceRuntime {
    config: RuntimeConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: Arc<RetryManager>,
    retry_options: RetryOptions,
    health: Arc<HealthChecker>,
    balancer: Arc<LoadBalancer>,
    recovery: Arc<AutoRecovery>,
    degradation: Arc<DegradationController>,
    metrics: Arc<RuntimeMetricsSource>,
    targets: RwLock<BTreeMap<TargetId, TargetInfo>>,
    running: AtomicBool,
}

impl ResilienceRuntime {
    pub fn builder(config: RuntimeConfig) -> ResilienceRuntimeBuilder {
        ResilienceRuntimeBuilder::new(config)
    }

    /// Register a target with every component.
    pub fn register_target(&self, info: TargetInfo, probe: Arc<dyn Probe>, model: ModelConfig) {
        let id = info.id.clone();

        self.breakers.get_or_create(&id);
        self.health.register(id.clone(), probe);
        self.degradation.register_model(id.clone(), model.priority);
        self.balancer.register_model(id.clone(), model);
        self.recovery.register_target(&info);

        tracing::info!(target_id = %id, name = %info.name, provider = %info.provider, "Target registered");
        self.targets.write().insert(id, info);
    }

    /// Remove a target from every component.
    pub fn unregister_target(&self, target: &TargetId) -> bool {
        let removed = self.targets.write().remove(target).is_some();
        if !removed {
            return false;
        }

        self.health.unregister(target);
        self.balancer.unregister_model(target);
        self.degradation.unregister_model(target);
        self.recovery.unregister_target(target);
        self.breakers.remove(target);

        tracing::info!(target_id = %target, "Target unregistered");
        true
    }

    /// Select a target and run `work` against it under its breaker, with retries.
    ///
    /// Retries stay on the selected target. The selection is closed out on
    /// the balancer whatever the outcome.
    pub async fn execute<T, E, F, Fut>(
        &self,
        request: &SelectionRequest,
        work: F,
    ) -> Result<T, CallError<E>>
    where
        F: Fn(TargetId) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let target = self.balancer.select_model(request).await?;
        let breaker = self.breakers.get_or_create(&target);
        let started = Instant::now();

        let result = {
            let work = &work;
            let breaker = &breaker;
            let selected = &target;
            self.retry
                .execute_with_retry(
                    move || breaker.execute(move || work(selected.clone())),
                    &self.retry_options,
                )
                .await
        };

        let elapsed = started.elapsed();
        if let Err(err) =
            self.balancer
                .record_request_completion(&target, elapsed, result.is_ok())
        {
            tracing::debug!(target_id = %target, error = %err, "Completion for unregistered target");
        }

        match &result {
            Ok(_) => tracing::debug!(target_id = %target, ?elapsed, "Call succeeded"),
            Err(err) => tracing::debug!(target_id = %target, ?elapsed, error = %err, "Call failed"),
        }
        result.map_err(CallError::from)
    }

    /// Start health timers, the recovery monitor and degradation evaluation.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.health.start();
        self.recovery.start();
        self.degradation.start(self.metrics.clone());
        tracing::info!(targets = self.targets.read().len(), "Resilience runtime started");
    }

    /// Stop every timer and cancel active recoveries.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.health.stop();
        self.recovery.stop();
        self.degradation.stop();
        for plan in self.recovery.active_recoveries() {
            if let Err(err) = self.recovery.cancel_recovery(&plan.id) {
                tracing::debug!(plan_id = %plan.id, error = %err, "Recovery finished before shutdown cancelled it");
            }
        }
        tracing::info!("Resilience runtime stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current fleet metrics, as the degradation controller would see them.
    pub fn system_metrics(&self) -> SystemMetrics {
        self.metrics.peek()
    }

    pub fn target_info(&self, target: &TargetId) -> Option<TargetInfo> {
        self.targets.read().get(target).cloned()
    }

    pub fn targets(&self) -> Vec<TargetInfo> {
        self.targets.read().values().cloned().collect()
    }

    /// Targets whose last health check left them usable.
    pub fn usable_targets(&self) -> Vec<TargetId> {
        self.health
            .all_health()
            .into_iter()
            .filter(|h| h.status != HealthStatus::Unavailable)
            .map(|h| h.target)
            .collect()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn retry(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn recovery(&self) -> &Arc<AutoRecovery> {
        &self.recovery
    }

    pub fn degradation(&self) -> &Arc<DegradationController> {
        &self.degradation
    }
}

impl Drop for ResilienceRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ResilienceRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceRuntime")
            .field("targets", &self.targets.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{FnProbe, ProbeError};
    use crate::recovery::RecoveryEvent;
    use rampart_core::{DegradationLevel, LoadBalancingAlgorithm, RampartError};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn ok_probe() -> Arc<dyn Probe> {
        Arc::new(FnProbe::new(|| async { Ok(()) }))
    }

    fn down_probe() -> Arc<dyn Probe> {
        Arc::new(FnProbe::new(|| async {
            Err(ProbeError::Connection("refused".to_string()))
        }))
    }

    fn runtime(config: RuntimeConfig) -> ResilienceRuntime {
        ResilienceRuntime::builder(config).build().unwrap()
    }

    fn round_robin() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.load_balancer.algorithm = LoadBalancingAlgorithm::RoundRobin;
        config
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(ResilienceRuntime::builder(config).build().is_err());
    }

    #[tokio::test]
    async fn test_register_and_unregister_everywhere() {
        let runtime = runtime(RuntimeConfig::default());
        let id = TargetId::new("a");
        runtime.register_target(
            TargetInfo::new("a", "primary", "acme", "1"),
            ok_probe(),
            ModelConfig::default(),
        );

        assert!(runtime.breakers().contains(&id));
        assert!(runtime.balancer().is_registered(&id));
        assert!(runtime.health().health(&id).is_some());
        assert_eq!(runtime.targets().len(), 1);

        assert!(runtime.unregister_target(&id));
        assert!(!runtime.breakers().contains(&id));
        assert!(!runtime.balancer().is_registered(&id));
        assert!(runtime.health().health(&id).is_none());
        assert!(!runtime.unregister_target(&id));
    }

    #[tokio::test]
    async fn test_execute_records_completion() {
        let runtime = runtime(RuntimeConfig::default());
        runtime.register_target(
            TargetInfo::new("a", "primary", "acme", "1"),
            ok_probe(),
            ModelConfig::default(),
        );

        let answer = runtime
            .execute(&SelectionRequest::default(), |target| async move {
                Ok::<_, String>(format!("hello from {target}"))
            })
            .await
            .unwrap();
        assert_eq!(answer, "hello from a");

        let stats = runtime.balancer().load_stats(&TargetId::new("a")).unwrap();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_execute_without_targets() {
        let runtime = runtime(RuntimeConfig::default());
        let err = runtime
            .execute(&SelectionRequest::default(), |_| async { Ok::<(), String>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Routing(RampartError::NoAvailableModels)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stay_on_selected_target() {
        let mut config = round_robin();
        config.retry.jitter = false;
        config.retry.base_delay = Duration::from_millis(10);
        let runtime = runtime(config);
        for id in ["a", "b"] {
            runtime.register_target(TargetInfo::new(id, id, "acme", "1"), ok_probe(), ModelConfig::default());
        }

        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = runtime
            .execute(&SelectionRequest::default(), move |target| {
                seen.lock().push(target);
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("read ECONNRESET".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        let calls = calls.lock();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|t| *t == calls[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_removes_target_and_starts_recovery() {
        let runtime = runtime(round_robin());
        runtime.register_target(TargetInfo::new("up", "up", "acme", "1"), ok_probe(), ModelConfig::default());
        runtime.register_target(TargetInfo::new("down", "down", "acme", "1"), down_probe(), ModelConfig::default());

        let started = Arc::new(Mutex::new(Vec::new()));
        let seen = started.clone();
        runtime.recovery().subscribe(move |event| {
            if let RecoveryEvent::Started { plan } = event {
                seen.lock().push(plan.target.clone());
            }
        });

        let down = TargetId::new("down");
        let health = runtime.health().check_now(&down).await.unwrap();
        assert_eq!(health.status, HealthStatus::Unavailable);

        assert_eq!(runtime.balancer().eligible_models(), vec![TargetId::new("up")]);
        assert_eq!(*started.lock(), vec![down.clone()]);
        assert_eq!(runtime.usable_targets(), vec![TargetId::new("up")]);
        assert!(runtime.system_metrics().availability < 1.0);
    }

    #[tokio::test]
    async fn test_traffic_reduction_round_trip() {
        let runtime = runtime(RuntimeConfig::default());
        let id = TargetId::new("a");
        runtime.register_target(
            TargetInfo::new("a", "a", "acme", "1"),
            ok_probe(),
            ModelConfig {
                weight: 8,
                ..ModelConfig::default()
            },
        );

        let actions = RuntimeRecoveryActions::new(
            runtime.health().clone(),
            runtime.breakers().clone(),
            runtime.balancer().clone(),
        );
        let config = rampart_core::RecoveryConfig::default();
        let reduce = RecoveryAction::new(RecoveryActionKind::ReduceTraffic, &config);
        let restore = RecoveryAction::new(RecoveryActionKind::RestoreTraffic, &config);
        let restart = RecoveryAction::new(RecoveryActionKind::Restart, &config);

        actions.execute(&id, &reduce).await.unwrap();
        assert_eq!(runtime.balancer().model_config(&id).unwrap().weight, 4);
        actions.execute(&id, &reduce).await.unwrap();
        assert_eq!(runtime.balancer().model_config(&id).unwrap().weight, 2);

        actions.execute(&id, &restore).await.unwrap();
        assert_eq!(runtime.balancer().model_config(&id).unwrap().weight, 8);

        assert_eq!(
            actions.execute(&id, &restart).await,
            Err(ActionError::Unsupported(RecoveryActionKind::Restart))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_reset_clears_outage_score() {
        let runtime = runtime(RuntimeConfig::default());
        let id = TargetId::new("a");
        runtime.register_target(TargetInfo::new("a", "a", "acme", "1"), ok_probe(), ModelConfig::default());
        let fail_five = || {
            for _ in 0..5 {
                runtime
                    .balancer()
                    .record_request_completion(&id, Duration::from_millis(500), false)
                    .unwrap();
            }
        };

        // Closing the circuit readmits the target
        fail_five();
        let breaker = runtime.breakers().get(&id).unwrap();
        breaker.force_open();
        assert!(runtime.balancer().eligible_models().is_empty());
        breaker.reset();
        assert_eq!(runtime.balancer().eligible_models(), vec![id.clone()]);

        // So does the recovery action when the circuit never opened
        fail_five();
        assert!(runtime.balancer().eligible_models().is_empty());
        let actions = RuntimeRecoveryActions::new(
            runtime.health().clone(),
            runtime.breakers().clone(),
            runtime.balancer().clone(),
        );
        let config = rampart_core::RecoveryConfig::default();
        let reset = RecoveryAction::new(RecoveryActionKind::ResetCircuitBreaker, &config);
        actions.execute(&id, &reset).await.unwrap();
        assert_eq!(runtime.balancer().eligible_models(), vec![id.clone()]);

        let ghost = TargetId::new("ghost");
        assert!(actions.execute(&ghost, &reset).await.is_err());
    }

    #[tokio::test]
    async fn test_degradation_gate_is_attached() {
        let mut config = RuntimeConfig::default();
        config.degradation.strategies[1]
            .actions
            .push(rampart_core::DegradationAction::reversible(
                rampart_core::DegradationActionKind::RestrictToPriority { min_priority: 5 },
            ));
        let runtime = runtime(config);
        runtime.register_target(
            TargetInfo::new("vip", "vip", "acme", "1"),
            ok_probe(),
            ModelConfig {
                priority: 9,
                ..ModelConfig::default()
            },
        );
        runtime.register_target(TargetInfo::new("bulk", "bulk", "acme", "1"), ok_probe(), ModelConfig::default());

        runtime
            .degradation()
            .trigger_degradation(DegradationLevel::Moderate, "drill")
            .await
            .unwrap();
        assert_eq!(runtime.balancer().eligible_models(), vec![TargetId::new("vip")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let runtime = runtime(RuntimeConfig::default());
        runtime.register_target(TargetInfo::new("a", "a", "acme", "1"), ok_probe(), ModelConfig::default());

        runtime.start();
        assert!(runtime.is_running());
        assert!(runtime.health().is_monitoring());
        assert!(runtime.recovery().is_monitoring());
        assert!(runtime.degradation().is_running());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(runtime
            .health()
            .health(&TargetId::new("a"))
            .unwrap()
            .last_health_check
            .is_some());

        runtime.shutdown();
        assert!(!runtime.is_running());
        assert!(!runtime.health().is_monitoring());
        assert!(!runtime.degradation().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_active_recoveries() {
        let runtime = runtime(RuntimeConfig::default());
        let id = TargetId::new("a");
        let stuck: Arc<dyn Probe> = Arc::new(FnProbe::new(|| std::future::pending::<Result<(), ProbeError>>()));
        runtime.register_target(TargetInfo::new("a", "a", "acme", "1"), stuck, ModelConfig::default());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        runtime.recovery().subscribe(move |event| {
            if let RecoveryEvent::Cancelled { result } = event {
                let _ = tx.send(result.outcome);
            }
        });

        runtime.start();
        let plan = runtime.recovery().trigger_recovery(&id, "manual").unwrap();
        runtime.shutdown();

        assert_eq!(rx.recv().await, Some(crate::recovery::RecoveryOutcome::Cancelled));
        assert!(runtime.recovery().active_recoveries().is_empty());
        assert!(runtime.recovery().cancel_recovery(&plan.id).is_err());
    }
}
