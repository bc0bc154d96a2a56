//! Registry guaranteeing one circuit breaker per target.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use rampart_core::{CircuitBreakerConfig, CircuitSnapshot, TargetId};

use super::circuit_breaker::{BreakerEvent, CircuitBreaker};
use crate::balancer::TargetGate;
use crate::listeners::{ListenerId, Listeners};

/// Explicitly constructed table of breakers keyed by target.
///
/// Listeners registered here receive events from every breaker the
/// registry creates, including breakers created after subscription.
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: RwLock<HashMap<TargetId, Arc<CircuitBreaker>>>,
    listeners: Arc<Listeners<BreakerEvent>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: RwLock::new(HashMap::new()),
            listeners: Arc::new(Listeners::new()),
        }
    }

    /// Breaker for `target`, created with the default config on first use.
    pub fn get_or_create(&self, target: &TargetId) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(target) {
            return existing.clone();
        }
        self.insert_if_absent(target, self.defaults.clone())
    }

    /// Create the breaker with an explicit config.
    ///
    /// An existing breaker is kept and returned unchanged.
    pub fn register_with_config(
        &self,
        target: &TargetId,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        self.insert_if_absent(target, config)
    }

    pub fn get(&self, target: &TargetId) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(target).cloned()
    }

    pub fn remove(&self, target: &TargetId) -> Option<Arc<CircuitBreaker>> {
        let removed = self.breakers.write().remove(target);
        if removed.is_some() {
            tracing::debug!(target_id = %target, "Circuit breaker removed");
        }
        removed
    }

    pub fn contains(&self, target: &TargetId) -> bool {
        self.breakers.read().contains_key(target)
    }

    /// Snapshots of every breaker, ordered by target.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<_> = self.breakers.read().values().cloned().collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }

    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.read().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Listen to events from every breaker in the registry.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn insert_if_absent(&self, target: &TargetId, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.write();
        breakers
            .entry(target.clone())
            .or_insert_with(|| {
                tracing::debug!(target_id = %target, "Circuit breaker created");
                Arc::new(CircuitBreaker::with_shared_listeners(
                    target.clone(),
                    config,
                    self.listeners.clone(),
                ))
            })
            .clone()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl TargetGate for CircuitBreakerRegistry {
    fn admits(&self, target: &TargetId, _priority: u32) -> bool {
        self.get(target)
            .map(|breaker| breaker.allows_requests())
            .unwrap_or(true)
    }

    fn name(&self) -> &'static str {
        "circuit_breakers"
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breakers.read().len())
            .finish()
    }
}
