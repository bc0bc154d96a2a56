//! Circuit breaker to prevent cascade failures.
//!
//! When calls to a target fail repeatedly the circuit opens and subsequent
//! calls fail fast with [`CallError::CircuitOpen`] until the recovery
//! timeout has passed. Trial calls are then let through in the half-open
//! state; enough consecutive successes close the circuit again.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use rampart_core::{CallError, CircuitBreakerConfig, CircuitSnapshot, CircuitState, TargetId};

use crate::listeners::{ListenerId, Listeners};

/// How a single protected call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Failure,
    Timeout,
    /// Rejected by an open circuit; the work never ran
    Rejected,
}

/// Events broadcast by a breaker.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerEvent {
    StateChanged {
        target: TargetId,
        from: CircuitState,
        to: CircuitState,
        at: DateTime<Utc>,
    },
    Executed {
        target: TargetId,
        outcome: ExecutionOutcome,
        duration: Duration,
    },
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    next_retry_at: Option<Instant>,
    next_retry_time: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_retry_at: None,
            next_retry_time: None,
        }
    }
}

type Transition = (CircuitState, CircuitState);

/// Per-target circuit breaker.
pub struct CircuitBreaker {
    target: TargetId,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    listeners: Listeners<BreakerEvent>,
    shared: Option<Arc<Listeners<BreakerEvent>>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the closed state.
    pub fn new(target: TargetId, config: CircuitBreakerConfig) -> Self {
        Self {
            target,
            config,
            inner: Mutex::new(BreakerInner::closed()),
            listeners: Listeners::new(),
            shared: None,
        }
    }

    /// Breaker that also reports to a registry-wide listener list.
    pub(crate) fn with_shared_listeners(
        target: TargetId,
        config: CircuitBreakerConfig,
        shared: Arc<Listeners<BreakerEvent>>,
    ) -> Self {
        Self {
            shared: Some(shared),
            ..Self::new(target, config)
        }
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `work` under the breaker.
    ///
    /// Fails fast without calling `work` while the circuit is open. The work
    /// is raced against the configured timeout; on timeout the future is
    /// dropped and the call counts as a failure.
    pub async fn execute<T, E, F, Fut>(&self, work: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (transition, rejected) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh_locked(&mut inner);
            let rejected = (inner.state == CircuitState::Open).then(|| {
                inner
                    .next_retry_at
                    .map(|at| at.saturating_duration_since(Instant::now()))
                    .unwrap_or(self.config.recovery_timeout)
            });
            (transition, rejected)
        };
        self.notify_transition(transition);

        if let Some(retry_after) = rejected {
            tracing::debug!(target_id = %self.target, ?retry_after, "Circuit open, rejecting call");
            self.emit(BreakerEvent::Executed {
                target: self.target.clone(),
                outcome: ExecutionOutcome::Rejected,
                duration: Duration::ZERO,
            });
            return Err(CallError::CircuitOpen {
                target: self.target.clone(),
                retry_after,
            });
        }

        let started = Instant::now();
        let result = tokio::time::timeout(self.config.timeout, work()).await;
        let duration = started.elapsed();

        let (outcome, result) = match result {
            Ok(Ok(value)) => (ExecutionOutcome::Success, Ok(value)),
            Ok(Err(err)) => (ExecutionOutcome::Failure, Err(CallError::Operation(err))),
            Err(_) => (
                ExecutionOutcome::Timeout,
                Err(CallError::Timeout {
                    target: self.target.clone(),
                    after: self.config.timeout,
                }),
            ),
        };

        let transition = match outcome {
            ExecutionOutcome::Success => self.record_success(),
            _ => self.record_failure(),
        };
        self.notify_transition(transition);
        self.emit(BreakerEvent::Executed {
            target: self.target.clone(),
            outcome,
            duration,
        });

        result
    }

    /// Current state, moving an expired open circuit to half-open.
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh_locked(&mut inner);
            (inner.state, transition)
        };
        self.notify_transition(transition);
        state
    }

    /// Whether a call made now would be let through.
    pub fn allows_requests(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => inner
                .next_retry_at
                .map(|at| Instant::now() >= at)
                .unwrap_or(false),
            _ => true,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            target: self.target.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
            next_retry_time: inner.next_retry_time,
        }
    }

    /// Open the circuit now with a fresh retry time.
    pub fn force_open(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            self.open_locked(&mut inner)
        };
        tracing::warn!(target_id = %self.target, "Circuit forced open");
        self.notify_transition(transition);
    }

    /// Close the circuit now, keeping the last failure time.
    pub fn force_closed(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            self.close_locked(&mut inner)
        };
        tracing::info!(target_id = %self.target, "Circuit forced closed");
        self.notify_transition(transition);
    }

    /// Return to a pristine closed state.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            *inner = BreakerInner::closed();
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        tracing::debug!(target_id = %self.target, "Circuit reset");
        self.notify_transition(transition);
    }

    /// Listen to this breaker's events.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn record_success(&self) -> Option<Transition> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
                None
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(target_id = %self.target, "Circuit closed after successful recovery");
                    self.close_locked(&mut inner)
                } else {
                    None
                }
            }
            // A call admitted before the circuit opened
            CircuitState::Open => None,
        }
    }

    fn record_failure(&self) -> Option<Transition> {
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        target_id = %self.target,
                        failures = inner.failure_count,
                        "Circuit opened after repeated failures"
                    );
                    self.open_locked(&mut inner)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                tracing::warn!(target_id = %self.target, "Circuit reopened after half-open failure");
                self.open_locked(&mut inner)
            }
            CircuitState::Open => None,
        }
    }

    fn refresh_locked(&self, inner: &mut BreakerInner) -> Option<Transition> {
        let due = inner
            .next_retry_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false);
        if inner.state == CircuitState::Open && due {
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.next_retry_at = None;
            inner.next_retry_time = None;
            tracing::info!(target_id = %self.target, "Circuit half-open, allowing trial calls");
            Some((CircuitState::Open, CircuitState::HalfOpen))
        } else {
            None
        }
    }

    fn open_locked(&self, inner: &mut BreakerInner) -> Option<Transition> {
        let from = inner.state;
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.next_retry_at = Some(Instant::now() + self.config.recovery_timeout);
        inner.next_retry_time = chrono::Duration::from_std(self.config.recovery_timeout)
            .ok()
            .map(|timeout| Utc::now() + timeout);
        (from != CircuitState::Open).then_some((from, CircuitState::Open))
    }

    fn close_locked(&self, inner: &mut BreakerInner) -> Option<Transition> {
        let from = inner.state;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_retry_at = None;
        inner.next_retry_time = None;
        (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
    }

    fn notify_transition(&self, transition: Option<Transition>) {
        if let Some((from, to)) = transition {
            self.emit(BreakerEvent::StateChanged {
                target: self.target.clone(),
                from,
                to,
                at: Utc::now(),
            });
        }
    }

    fn emit(&self, event: BreakerEvent) {
        self.listeners.emit(&event);
        if let Some(shared) = &self.shared {
            shared.emit(&event);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("target", &self.target)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(failure_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            TargetId::new("model-a"),
            CircuitBreakerConfig {
                failure_threshold,
                success_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
                timeout: Duration::from_secs(5),
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> CallError<String> {
        cb.execute(|| async { Err::<(), _>("boom".to_string()) })
            .await
            .unwrap_err()
    }

    async fn succeed(cb: &CircuitBreaker) {
        cb.execute(|| async { Ok::<_, String>(()) }).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_exactly_at_threshold() {
        let cb = breaker(3);

        for _ in 0..2 {
            fail(&cb).await;
            assert_eq!(cb.state(), CircuitState::Closed);
        }

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        let snapshot = cb.snapshot();
        assert!(snapshot.next_retry_time.unwrap() > Utc::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_without_running_work() {
        let cb = breaker(1);
        fail(&cb).await;

        let calls = AtomicUsize::new(0);
        let err = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_recovery_timeout() {
        let cb = breaker(1);
        fail(&cb).await;
        assert!(!cb.allows_requests());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.allows_requests());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.snapshot().next_retry_time.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_retry_time() {
        let cb = breaker(1);
        fail(&cb).await;
        let first_retry = cb.snapshot().next_retry_time.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Open);
        let second_retry = cb.snapshot().next_retry_time.unwrap();
        assert!(second_retry >= first_retry);
        assert!(!cb.allows_requests());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let cb = breaker(1);
        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(60)).await;

        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_decrements_failures_when_closed() {
        let cb = breaker(5);
        fail(&cb).await;
        fail(&cb).await;
        succeed(&cb).await;
        assert_eq!(cb.snapshot().failure_count, 1);
        succeed(&cb).await;
        succeed(&cb).await;
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = breaker(1);
        let err = cb
            .execute(|| async {
                std::future::pending::<()>().await;
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_see_transitions_and_survive_panics() {
        let cb = breaker(1);
        let transitions = Arc::new(Mutex::new(Vec::new()));

        cb.subscribe(|_| panic!("bad listener"));
        let seen = transitions.clone();
        cb.subscribe(move |event| {
            if let BreakerEvent::StateChanged { from, to, .. } = event {
                seen.lock().push((*from, *to));
            }
        });

        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(60)).await;
        cb.state();

        assert_eq!(
            *transitions.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_and_reset() {
        let cb = breaker(5);
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.force_closed();
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb).await;
        cb.reset();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.failure_count, 0);
        assert!(snapshot.last_failure_time.is_none());
    }
}
