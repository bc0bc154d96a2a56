//! Periodic health checking.
//!
//! Each registered target gets its own timer. A tick runs the target's
//! probe with a per-attempt timeout and an exponential backoff retry loop;
//! the outcome updates the target's [`ModelHealth`] record and is broadcast
//! as a [`HealthEvent`].

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use rampart_core::scoring::ema;
use rampart_core::{Classify, HealthCheckConfig, HealthStatus, ModelHealth, RampartError, TargetId};

use super::probe::{Probe, ProbeError};
use crate::listeners::{ListenerId, Listeners};

/// Threshold that raised an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    Unavailable,
    HighErrorRate { error_rate: f64 },
    SlowResponse {
        #[serde(with = "rampart_core::config::duration_ms")]
        response_time: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub target: TargetId,
    pub kind: AlertKind,
    pub at: DateTime<Utc>,
}

/// Events broadcast by the health checker.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    Updated {
        health: ModelHealth,
        previous_status: HealthStatus,
    },
    Alert(HealthAlert),
}

/// Fleet-wide health summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub total: usize,
    pub available: usize,
    pub degraded: usize,
    pub unavailable: usize,
    pub overall: HealthStatus,
    pub checked_at: DateTime<Utc>,
}

/// Read-only view of health records.
pub trait HealthSource: Send + Sync {
    fn health(&self, target: &TargetId) -> Option<ModelHealth>;

    fn all_health(&self) -> Vec<ModelHealth>;
}

struct Monitored {
    probe: Arc<dyn Probe>,
    config: HealthCheckConfig,
    health: ModelHealth,
    in_flight: Arc<tokio::sync::Mutex<()>>,
    timer: Option<CancellationToken>,
    generation: u64,
}

/// Periodic per-target prober.
pub struct HealthChecker {
    defaults: HealthCheckConfig,
    targets: RwLock<HashMap<TargetId, Monitored>>,
    listeners: Listeners<HealthEvent>,
    root: Mutex<CancellationToken>,
    monitoring: AtomicBool,
    generations: AtomicU64,
}

impl HealthChecker {
    pub fn new(defaults: HealthCheckConfig) -> Self {
        Self {
            defaults,
            targets: RwLock::new(HashMap::new()),
            listeners: Listeners::new(),
            root: Mutex::new(CancellationToken::new()),
            monitoring: AtomicBool::new(false),
            generations: AtomicU64::new(0),
        }
    }

    /// Monitor `target` with the default config.
    pub fn register(self: &Arc<Self>, target: TargetId, probe: Arc<dyn Probe>) {
        self.register_with_config(target, probe, self.defaults.clone());
    }

    /// Monitor `target`, replacing any previous registration.
    pub fn register_with_config(
        self: &Arc<Self>,
        target: TargetId,
        probe: Arc<dyn Probe>,
        config: HealthCheckConfig,
    ) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let interval = config.interval;
        let timer = self
            .monitoring
            .load(Ordering::SeqCst)
            .then(|| self.root.lock().child_token());

        let replaced = self.targets.write().insert(
            target.clone(),
            Monitored {
                probe,
                config,
                health: ModelHealth::new(target.clone()),
                in_flight: Arc::new(tokio::sync::Mutex::new(())),
                timer: timer.clone(),
                generation,
            },
        );
        if let Some(old) = replaced.and_then(|m| m.timer) {
            old.cancel();
        }

        tracing::info!(target_id = %target, ?interval, "Health monitoring registered");
        if let Some(token) = timer {
            self.spawn_timer(target, interval, token);
        }
    }

    /// Stop monitoring `target` and purge its record.
    pub fn unregister(&self, target: &TargetId) -> bool {
        let removed = self.targets.write().remove(target);
        match removed {
            Some(monitored) => {
                if let Some(timer) = monitored.timer {
                    timer.cancel();
                }
                tracing::info!(target_id = %target, "Health monitoring unregistered");
                true
            }
            None => false,
        }
    }

    /// Start one timer per registered target.
    pub fn start(self: &Arc<Self>) {
        if self.monitoring.swap(true, Ordering::SeqCst) {
            return;
        }

        let root = {
            let mut root = self.root.lock();
            *root = CancellationToken::new();
            root.clone()
        };

        let timers: Vec<_> = {
            let mut targets = self.targets.write();
            targets
                .iter_mut()
                .map(|(id, monitored)| {
                    let token = root.child_token();
                    monitored.timer = Some(token.clone());
                    (id.clone(), monitored.config.interval, token)
                })
                .collect()
        };

        tracing::info!(targets = timers.len(), "Health monitoring started");
        for (target, interval, token) in timers {
            self.spawn_timer(target, interval, token);
        }
    }

    /// Cancel every timer without waiting for in-flight probes.
    pub fn stop(&self) {
        if !self.monitoring.swap(false, Ordering::SeqCst) {
            return;
        }
        self.root.lock().cancel();
        for monitored in self.targets.write().values_mut() {
            monitored.timer = None;
        }
        tracing::info!("Health monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    /// Probe `target` now. Waits for any probe already in flight.
    pub async fn check_now(&self, target: &TargetId) -> Result<ModelHealth, RampartError> {
        let (probe, config, in_flight, generation) = {
            let targets = self.targets.read();
            let monitored = targets
                .get(target)
                .ok_or_else(|| RampartError::ModelNotRegistered(target.clone()))?;
            (
                monitored.probe.clone(),
                monitored.config.clone(),
                monitored.in_flight.clone(),
                monitored.generation,
            )
        };

        let _guard = in_flight.lock().await;
        let outcome = run_probe(probe.as_ref(), &config, target).await;
        let checked_at = Utc::now();

        let (health, previous_status) = {
            let mut targets = self.targets.write();
            let monitored = targets
                .get_mut(target)
                .filter(|m| m.generation == generation)
                .ok_or_else(|| RampartError::ModelNotRegistered(target.clone()))?;

            let previous_status = monitored.health.status;
            apply_outcome(&mut monitored.health, &outcome, &config, checked_at);
            (monitored.health.clone(), previous_status)
        };

        if health.status != previous_status {
            tracing::info!(
                target_id = %target,
                from = %previous_status,
                to = %health.status,
                "Health status changed"
            );
        }

        self.listeners.emit(&HealthEvent::Updated {
            health: health.clone(),
            previous_status,
        });
        for alert in evaluate_alerts(&health, &config, checked_at) {
            tracing::warn!(target_id = %target, alert = ?alert.kind, "Health alert");
            self.listeners.emit(&HealthEvent::Alert(alert));
        }

        Ok(health)
    }

    pub fn health(&self, target: &TargetId) -> Option<ModelHealth> {
        self.targets.read().get(target).map(|m| m.health.clone())
    }

    /// Every record, ordered by target.
    pub fn all_health(&self) -> Vec<ModelHealth> {
        let mut all: Vec<_> = self
            .targets
            .read()
            .values()
            .map(|m| m.health.clone())
            .collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    pub fn system_health(&self) -> SystemHealth {
        let targets = self.targets.read();
        let count = |status: HealthStatus| targets.values().filter(|m| m.health.status == status).count();

        let total = targets.len();
        let available = count(HealthStatus::Available);
        let degraded = count(HealthStatus::Degraded);
        let unavailable = count(HealthStatus::Unavailable);

        let overall = if total > 0 && unavailable == total {
            HealthStatus::Unavailable
        } else if degraded + unavailable > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Available
        };

        SystemHealth {
            total,
            available,
            degraded,
            unavailable,
            overall,
            checked_at: Utc::now(),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&HealthEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn spawn_timer(self: &Arc<Self>, target: TargetId, interval: Duration, token: CancellationToken) {
        let checker: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(checker) = checker.upgrade() else { break };
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = checker.check_now(&target) => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(target_id = %target, "Health timer finished");
        });
    }
}

impl HealthSource for HealthChecker {
    fn health(&self, target: &TargetId) -> Option<ModelHealth> {
        HealthChecker::health(self, target)
    }

    fn all_health(&self) -> Vec<ModelHealth> {
        HealthChecker::all_health(self)
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthCheckConfig::default())
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.root.get_mut().cancel();
    }
}

/// Run the probe with per-attempt timeout and backoff; returns the latency
/// of the successful attempt.
async fn run_probe(
    probe: &dyn Probe,
    config: &HealthCheckConfig,
    target: &TargetId,
) -> Result<Duration, ProbeError> {
    let attempt = || async {
        let started = Instant::now();
        match tokio::time::timeout(config.timeout, probe.check()).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ProbeError::Timeout(config.timeout)),
        }
    };

    let backoff = ExponentialBuilder::default()
        .with_min_delay(config.retry_delay)
        .with_max_delay(config.interval)
        .with_max_times(config.retries as usize);

    attempt
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(|err: &ProbeError| err.is_recoverable())
        .notify(|err: &ProbeError, delay: Duration| {
            tracing::debug!(target_id = %target, error = %err, ?delay, "Probe failed, retrying");
        })
        .await
}

fn apply_outcome(
    health: &mut ModelHealth,
    outcome: &Result<Duration, ProbeError>,
    config: &HealthCheckConfig,
    checked_at: DateTime<Utc>,
) {
    health.last_health_check = Some(checked_at);
    match outcome {
        Ok(latency) => {
            let degraded_after = config.timeout.mul_f64(config.degraded_latency_ratio);
            health.status = if *latency > degraded_after {
                HealthStatus::Degraded
            } else {
                HealthStatus::Available
            };
            health.response_time = *latency;
            health.error_rate = ema(health.error_rate, 0.0, config.error_rate_alpha);
            health.failure_count = 0;
            health.last_error = None;
        }
        Err(err) => {
            health.status = HealthStatus::Unavailable;
            health.error_rate = ema(health.error_rate, 1.0, config.error_rate_alpha);
            health.failure_count = health.failure_count.saturating_add(1);
            health.last_error = Some(err.to_string());
        }
    }
}

fn evaluate_alerts(
    health: &ModelHealth,
    config: &HealthCheckConfig,
    at: DateTime<Utc>,
) -> Vec<HealthAlert> {
    let mut kinds = Vec::new();
    if health.status == HealthStatus::Unavailable {
        kinds.push(AlertKind::Unavailable);
    }
    if health.error_rate > config.alerts.error_rate {
        kinds.push(AlertKind::HighErrorRate {
            error_rate: health.error_rate,
        });
    }
    if health.response_time > config.alerts.response_time {
        kinds.push(AlertKind::SlowResponse {
            response_time: health.response_time,
        });
    }

    kinds
        .into_iter()
        .map(|kind| HealthAlert {
            target: health.target.clone(),
            kind,
            at,
        })
        .collect()
}
