//! Retry engine with exponential backoff and jitter.
//!
//! Only errors classified as retryable are retried; anything else is
//! returned on the first attempt without sleeping.

use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use rampart_core::backoff::Backoff;
use rampart_core::{is_retryable, Classify, RetryConfig, RetryError};

use crate::listeners::{ListenerId, Listeners};

/// Per-call retry options.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff: Backoff,
    pub retryable_codes: Vec<String>,
}

impl RetryOptions {
    /// Options that never retry.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::from(&RetryConfig::default())
        }
    }
}

impl From<&RetryConfig> for RetryOptions {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Backoff::from(config),
            retryable_codes: config.retryable_codes.clone(),
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Events broadcast by the retry engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    /// Attempt `attempt` (0-based) failed; the next one starts after `delay`
    Retrying {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Exhausted {
        attempts: u32,
        error: String,
    },
}

/// Generic retry-with-backoff wrapper.
#[derive(Debug)]
pub struct RetryManager {
    defaults: RetryOptions,
    listeners: Listeners<RetryEvent>,
}

impl RetryManager {
    pub fn new(defaults: RetryOptions) -> Self {
        Self {
            defaults,
            listeners: Listeners::new(),
        }
    }

    pub fn defaults(&self) -> &RetryOptions {
        &self.defaults
    }

    /// Retry `op` with the manager's default options.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.execute_with_retry(op, &self.defaults).await
    }

    /// Retry `op` up to `options.max_retries` times.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        mut op: F,
        options: &RetryOptions,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_retryable(&err, &options.retryable_codes) {
                tracing::debug!(attempt, error = %err, "Error is not retryable");
                return Err(RetryError::NotRetryable(err));
            }

            if attempt >= options.max_retries {
                let attempts = attempt + 1;
                tracing::warn!(attempts, error = %err, "Retries exhausted");
                self.listeners.emit(&RetryEvent::Exhausted {
                    attempts,
                    error: err.to_string(),
                });
                return Err(RetryError::Exhausted {
                    attempts,
                    last: err,
                });
            }

            let delay = options.backoff.delay(attempt, &mut rand::thread_rng());
            tracing::debug!(attempt, ?delay, error = %err, "Retrying after failure");
            self.listeners.emit(&RetryEvent::Retrying {
                attempt,
                delay,
                error: err.to_string(),
            });

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Run every operation with retries; the first failure fails the batch.
    pub async fn execute_all<T, E, F, Fut>(&self, ops: Vec<F>) -> Result<Vec<T>, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        futures::future::try_join_all(ops.into_iter().map(|op| self.execute(op))).await
    }

    /// First operation to succeed wins; if all fail, every error is returned.
    pub async fn execute_first_success<T, E, F, Fut>(&self, ops: Vec<F>) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut pending: FuturesUnordered<_> = ops.into_iter().map(|op| self.execute(op)).collect();
        let mut errors = Vec::new();

        while let Some(outcome) = pending.next().await {
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => errors.push(err),
            }
        }

        Err(RetryError::AllFailed(errors))
    }

    /// Run every operation with retries and collect each outcome in order.
    pub async fn execute_settled<T, E, F, Fut>(&self, ops: Vec<F>) -> Vec<Result<T, RetryError<E>>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        futures::future::join_all(ops.into_iter().map(|op| self.execute(op))).await
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryOptions::default())
    }
}
