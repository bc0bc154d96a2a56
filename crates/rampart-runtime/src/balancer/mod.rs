//! Target selection across the registered fleet.
//!
//! The balancer keeps its own registration table with per-target weight,
//! priority, connection limit and live [`ModelLoadStats`]. Eligibility is
//! decided here; the choice among eligible targets is delegated to the pure
//! algorithms in [`rampart_core::scoring`].

use moka::future::Cache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use rampart_core::scoring::{self, Candidate, SelectionContext};
use rampart_core::{
    GeoLocation, HealthStatus, LoadBalancerConfig, LoadBalancingAlgorithm, ModelLoadStats,
    RampartError, TargetId,
};

use crate::listeners::{ListenerId, Listeners};

/// External veto over target eligibility.
///
/// Circuit breakers and the degradation controller implement this so the
/// balancer can skip targets they currently exclude.
pub trait TargetGate: Send + Sync {
    fn admits(&self, target: &TargetId, priority: u32) -> bool;

    fn name(&self) -> &'static str {
        "gate"
    }
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    100
}

fn default_enabled() -> bool {
    true
}

/// Per-target balancing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Higher values are preferred by `priority_based`
    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub location: Option<GeoLocation>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            weight: default_weight(),
            priority: 0,
            max_connections: default_max_connections(),
            enabled: true,
            location: None,
        }
    }
}

/// What the caller knows about the request being routed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionRequest {
    /// Free-form task label, carried into events
    pub task: Option<String>,
    pub session_id: Option<String>,
    pub client_location: Option<GeoLocation>,
}

impl SelectionRequest {
    pub fn for_task(task: impl Into<String>) -> Self {
        Self {
            task: Some(task.into()),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_location(mut self, location: GeoLocation) -> Self {
        self.client_location = Some(location);
        self
    }
}

/// Performance figures pushed by collaborators (monitoring, optimizers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    #[serde(with = "rampart_core::config::duration_ms")]
    pub average_response_time: Duration,
    pub success_rate: f64,
    #[serde(default)]
    pub cpu_utilization: f64,
    #[serde(default)]
    pub memory_utilization: f64,
}

/// Events broadcast by the balancer.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadBalancerEvent {
    ModelSelected {
        target: TargetId,
        algorithm: LoadBalancingAlgorithm,
        session_affinity: bool,
        task: Option<String>,
    },
    ModelRegistered {
        target: TargetId,
    },
    ModelUnregistered {
        target: TargetId,
    },
}

/// Per-target view returned by [`LoadBalancer::get_load_statistics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatistics {
    pub target: TargetId,
    pub config: ModelConfig,
    pub stats: ModelLoadStats,
    pub health: HealthStatus,
    pub learning_score: f64,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadStatistics {
    pub algorithm: LoadBalancingAlgorithm,
    pub total_requests: u64,
    pub active_connections: u64,
    pub models: Vec<ModelStatistics>,
}

#[derive(Debug, Clone)]
struct ModelEntry {
    config: ModelConfig,
    stats: ModelLoadStats,
    health: HealthStatus,
    cpu_utilization: f64,
    memory_utilization: f64,
    learning_score: f64,
    // Completions since the derived score was last reset
    window_successes: u64,
    window_failures: u64,
    window_started: Instant,
}

impl ModelEntry {
    fn new(config: ModelConfig) -> Self {
        Self {
            config,
            stats: ModelLoadStats::default(),
            health: HealthStatus::Available,
            cpu_utilization: 0.0,
            memory_utilization: 0.0,
            learning_score: 0.5,
            window_successes: 0,
            window_failures: 0,
            window_started: Instant::now(),
        }
    }

    fn samples(&self) -> u64 {
        self.window_successes + self.window_failures
    }

    fn window_expired(&self, lifetime: Duration) -> bool {
        self.window_started.elapsed() >= lifetime
    }

    fn reset_window(&mut self) {
        self.window_successes = 0;
        self.window_failures = 0;
        self.window_started = Instant::now();
        self.stats.health_score = 1.0;
    }

    fn update_load(&mut self) {
        self.stats.current_load =
            self.stats.active_connections as f64 / self.config.max_connections.max(1) as f64;
    }

    fn recompute_health_score(&mut self, ceiling: Duration) {
        let window = ModelLoadStats {
            successful_requests: self.window_successes,
            failed_requests: self.window_failures,
            average_response_time: self.stats.average_response_time,
            ..ModelLoadStats::default()
        };
        self.stats.health_score = scoring::derived_health_score(&window, ceiling);
    }

    fn candidate(&self, id: &TargetId) -> Candidate {
        Candidate {
            id: id.clone(),
            weight: self.config.weight,
            priority: self.config.priority,
            max_connections: self.config.max_connections,
            active_connections: self.stats.active_connections,
            average_response_time: self.stats.average_response_time,
            health_score: self.stats.health_score,
            cpu_utilization: self.cpu_utilization,
            memory_utilization: self.memory_utilization,
            location: self.config.location,
            learning_score: self.learning_score,
        }
    }
}

/// Multi-algorithm load balancer.
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    algorithm: RwLock<LoadBalancingAlgorithm>,
    models: RwLock<BTreeMap<TargetId, ModelEntry>>,
    cursor: AtomicU64,
    sessions: Cache<String, TargetId>,
    gates: RwLock<Vec<Arc<dyn TargetGate>>>,
    listeners: Listeners<LoadBalancerEvent>,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        let sessions = Cache::builder()
            .max_capacity(config.max_sessions)
            .time_to_idle(config.session_timeout)
            .build();

        Self {
            algorithm: RwLock::new(config.algorithm),
            config,
            models: RwLock::new(BTreeMap::new()),
            cursor: AtomicU64::new(0),
            sessions,
            gates: RwLock::new(Vec::new()),
            listeners: Listeners::new(),
        }
    }

    /// Register or reconfigure a target. Live statistics are kept on reconfigure.
    pub fn register_model(&self, target: TargetId, config: ModelConfig) {
        {
            let mut models = self.models.write();
            match models.get_mut(&target) {
                Some(entry) => {
                    entry.config = config;
                    entry.update_load();
                }
                None => {
                    models.insert(target.clone(), ModelEntry::new(config));
                }
            }
        }
        tracing::info!(target_id = %target, "Model registered with load balancer");
        self.listeners
            .emit(&LoadBalancerEvent::ModelRegistered { target });
    }

    pub fn unregister_model(&self, target: &TargetId) -> bool {
        let removed = self.models.write().remove(target).is_some();
        if removed {
            tracing::info!(target_id = %target, "Model unregistered from load balancer");
            self.listeners.emit(&LoadBalancerEvent::ModelUnregistered {
                target: target.clone(),
            });
        }
        removed
    }

    pub fn is_registered(&self, target: &TargetId) -> bool {
        self.models.read().contains_key(target)
    }

    pub fn model_config(&self, target: &TargetId) -> Option<ModelConfig> {
        self.models.read().get(target).map(|e| e.config.clone())
    }

    pub fn set_enabled(&self, target: &TargetId, enabled: bool) -> Result<(), RampartError> {
        self.with_entry(target, |entry| entry.config.enabled = enabled)?;
        tracing::info!(target_id = %target, enabled, "Model enabled flag changed");
        Ok(())
    }

    /// Change a target's weight; used to shift traffic away during recovery.
    pub fn set_weight(&self, target: &TargetId, weight: u32) -> Result<u32, RampartError> {
        let previous = self.with_entry(target, |entry| {
            std::mem::replace(&mut entry.config.weight, weight.max(1))
        })?;
        tracing::debug!(target_id = %target, previous, weight, "Model weight changed");
        Ok(previous)
    }

    pub fn set_algorithm(&self, algorithm: LoadBalancingAlgorithm) {
        *self.algorithm.write() = algorithm;
        tracing::info!(?algorithm, "Load balancing algorithm changed");
    }

    pub fn algorithm(&self) -> LoadBalancingAlgorithm {
        *self.algorithm.read()
    }

    /// Record the HealthChecker's view of a target.
    ///
    /// Returning to available after an outage resets the derived score.
    pub fn update_model_health(&self, target: &TargetId, status: HealthStatus) -> Result<(), RampartError> {
        self.with_entry(target, |entry| {
            if status == HealthStatus::Available && entry.health == HealthStatus::Unavailable {
                entry.reset_window();
            }
            entry.health = status;
        })
    }

    /// Forget the completions behind a target's derived health score.
    ///
    /// Called when the target's circuit closes again or a recovery resets it,
    /// so a score earned during the outage does not keep it out of rotation.
    pub fn reset_health_score(&self, target: &TargetId) -> Result<(), RampartError> {
        self.with_entry(target, ModelEntry::reset_window)?;
        tracing::debug!(target_id = %target, "Derived health score reset");
        Ok(())
    }

    /// Fold a performance report into the adaptive learning score.
    pub fn update_model_performance(
        &self,
        target: &TargetId,
        report: &PerformanceReport,
    ) -> Result<(), RampartError> {
        let observation = scoring::performance_observation(
            report.success_rate,
            report.average_response_time,
            self.config.response_time_ceiling,
        );
        let alpha = self.config.learning_rate;
        self.with_entry(target, |entry| {
            entry.cpu_utilization = report.cpu_utilization;
            entry.memory_utilization = report.memory_utilization;
            entry.learning_score = scoring::ema(entry.learning_score, observation, alpha);
        })
    }

    /// Pick one eligible target and count a connection against it.
    pub async fn select_model(&self, request: &SelectionRequest) -> Result<TargetId, RampartError> {
        let candidates = self.eligible_candidates();
        if candidates.is_empty() {
            tracing::warn!("No eligible models for selection");
            return Err(RampartError::NoAvailableModels);
        }

        let algorithm = self.algorithm();
        let session = request
            .session_id
            .as_ref()
            .filter(|_| self.config.session_affinity);

        let mut sticky = None;
        if let Some(session_id) = session {
            if let Some(previous) = self.sessions.get(session_id).await {
                if candidates.iter().any(|c| c.id == previous) {
                    sticky = Some(previous);
                }
            }
        }
        let affinity = sticky.is_some();

        let chosen = match sticky {
            Some(target) => target,
            None => {
                let index = self
                    .choose(algorithm, &candidates, request.client_location)
                    .ok_or(RampartError::NoAvailableModels)?;
                candidates[index].id.clone()
            }
        };

        if !self.begin_request(&chosen)? {
            tracing::debug!(target_id = %chosen, "Model reached its connection limit during selection");
            return Err(RampartError::NoAvailableModels);
        }
        if let Some(session_id) = session {
            self.sessions.insert(session_id.clone(), chosen.clone()).await;
        }

        tracing::debug!(target_id = %chosen, ?algorithm, affinity, "Model selected");
        self.listeners.emit(&LoadBalancerEvent::ModelSelected {
            target: chosen.clone(),
            algorithm,
            session_affinity: affinity,
            task: request.task.clone(),
        });

        Ok(chosen)
    }

    /// Pick `count` distinct eligible targets for fan-out callers.
    pub fn select_models(
        &self,
        request: &SelectionRequest,
        count: usize,
    ) -> Result<Vec<TargetId>, RampartError> {
        let mut candidates = self.eligible_candidates();
        if candidates.len() < count {
            return Err(RampartError::InsufficientHealthyModels {
                required: count,
                available: candidates.len(),
            });
        }

        let algorithm = self.algorithm();
        let mut chosen = Vec::with_capacity(count);
        while chosen.len() < count {
            let index = self
                .choose(algorithm, &candidates, request.client_location)
                .ok_or(RampartError::NoAvailableModels)?;
            chosen.push(candidates.remove(index).id);
        }

        for (started, target) in chosen.iter().enumerate() {
            let admitted = self.begin_request(target).unwrap_or(false);
            if !admitted {
                for earlier in &chosen[..started] {
                    self.abandon_request(earlier);
                }
                let available = self.eligible_candidates().len();
                return Err(RampartError::InsufficientHealthyModels {
                    required: count,
                    available,
                });
            }
        }
        for target in &chosen {
            self.listeners.emit(&LoadBalancerEvent::ModelSelected {
                target: target.clone(),
                algorithm,
                session_affinity: false,
                task: request.task.clone(),
            });
        }
        Ok(chosen)
    }

    /// Close out a request started by a selection.
    pub fn record_request_completion(
        &self,
        target: &TargetId,
        response_time: Duration,
        success: bool,
    ) -> Result<(), RampartError> {
        let ceiling = self.config.response_time_ceiling;
        let lifetime = self.config.score_window;
        self.with_entry(target, |entry| {
            if entry.window_expired(lifetime) {
                entry.reset_window();
            }
            let stats = &mut entry.stats;
            stats.active_connections = stats.active_connections.saturating_sub(1);
            if success {
                stats.successful_requests += 1;
                entry.window_successes += 1;
            } else {
                stats.failed_requests += 1;
                entry.window_failures += 1;
            }

            let completed = (stats.successful_requests + stats.failed_requests) as f64;
            let sample = response_time.as_secs_f64() * 1000.0;
            stats.average_response_time += (sample - stats.average_response_time) / completed;

            entry.update_load();
            entry.recompute_health_score(ceiling);
        })
    }

    pub fn load_stats(&self, target: &TargetId) -> Option<ModelLoadStats> {
        self.models.read().get(target).map(|e| e.stats.clone())
    }

    pub fn get_load_statistics(&self) -> LoadStatistics {
        let models = self.models.read();
        let mut total_requests = 0;
        let mut active_connections = 0;
        let stats = models
            .iter()
            .map(|(id, entry)| {
                total_requests += entry.stats.total_requests;
                active_connections += entry.stats.active_connections as u64;
                ModelStatistics {
                    target: id.clone(),
                    config: entry.config.clone(),
                    stats: entry.stats.clone(),
                    health: entry.health,
                    learning_score: entry.learning_score,
                    cpu_utilization: entry.cpu_utilization,
                    memory_utilization: entry.memory_utilization,
                }
            })
            .collect();

        LoadStatistics {
            algorithm: self.algorithm(),
            total_requests,
            active_connections,
            models: stats,
        }
    }

    /// Targets that could be selected right now.
    pub fn eligible_models(&self) -> Vec<TargetId> {
        self.eligible_candidates().into_iter().map(|c| c.id).collect()
    }

    /// Attach a gate consulted on every selection.
    pub fn add_gate(&self, gate: Arc<dyn TargetGate>) {
        tracing::debug!(gate = gate.name(), "Target gate attached");
        self.gates.write().push(gate);
    }

    pub async fn clear_session(&self, session_id: &str) {
        self.sessions.invalidate(session_id).await;
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LoadBalancerEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn eligible_candidates(&self) -> Vec<Candidate> {
        let snapshot: Vec<(Candidate, bool)> = {
            let models = self.models.read();
            models
                .iter()
                .map(|(id, entry)| (entry.candidate(id), self.locally_eligible(entry)))
                .collect()
        };

        // Gates take their own locks; consult them after releasing ours.
        let gates: Vec<_> = self.gates.read().clone();
        snapshot
            .into_iter()
            .filter(|(_, eligible)| *eligible)
            .map(|(candidate, _)| candidate)
            .filter(|c| gates.iter().all(|g| g.admits(&c.id, c.priority)))
            .collect()
    }

    fn locally_eligible(&self, entry: &ModelEntry) -> bool {
        entry.config.enabled
            && entry.health.is_usable()
            && entry.stats.active_connections < entry.config.max_connections
            && (entry.samples() < self.config.min_samples
                || entry.stats.health_score >= self.config.min_health_score
                || entry.window_expired(self.config.score_window))
    }

    fn choose(
        &self,
        algorithm: LoadBalancingAlgorithm,
        candidates: &[Candidate],
        client_location: Option<GeoLocation>,
    ) -> Option<usize> {
        let ctx = SelectionContext {
            cursor: self.cursor.fetch_add(1, Ordering::Relaxed),
            client_location,
            weights: &self.config.adaptive_weights,
            response_time_ceiling: self.config.response_time_ceiling,
        };
        scoring::select(algorithm, candidates, &ctx)
    }

    /// Count a connection against `target`; `false` if it is at its limit.
    fn begin_request(&self, target: &TargetId) -> Result<bool, RampartError> {
        self.with_entry(target, |entry| {
            if entry.stats.active_connections >= entry.config.max_connections {
                return false;
            }
            entry.stats.active_connections += 1;
            entry.stats.total_requests += 1;
            entry.update_load();
            true
        })
    }

    fn abandon_request(&self, target: &TargetId) {
        let undone = self.with_entry(target, |entry| {
            entry.stats.active_connections = entry.stats.active_connections.saturating_sub(1);
            entry.stats.total_requests = entry.stats.total_requests.saturating_sub(1);
            entry.update_load();
        });
        if let Err(err) = undone {
            tracing::debug!(target_id = %target, error = %err, "Selection not rolled back");
        }
    }

    fn with_entry<R>(
        &self,
        target: &TargetId,
        f: impl FnOnce(&mut ModelEntry) -> R,
    ) -> Result<R, RampartError> {
        let mut models = self.models.write();
        models
            .get_mut(target)
            .map(f)
            .ok_or_else(|| RampartError::ModelNotRegistered(target.clone()))
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancerConfig::default())
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("algorithm", &self.algorithm())
            .field("models", &self.models.read().len())
            .field("gates", &self.gates.read().len())
            .finish()
    }
}
