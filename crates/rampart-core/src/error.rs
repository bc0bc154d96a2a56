//! Error taxonomy and retryability classification.
//!
//! Every public operation returns one of these types. Caller-supplied work
//! keeps its own error type `E`; the runtime wraps it in [`CallError`] so
//! circuit-open, timeout and exhaustion stay distinguishable from the
//! caller's own failures.

use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

use crate::types::TargetId;

/// Error codes treated as transient network failures.
pub const TRANSIENT_NETWORK_CODES: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
    "ENETUNREACH",
    "EHOSTUNREACH",
];

lazy_static! {
    static ref TRANSIENT_CODE_IN_MESSAGE: Regex = Regex::new(
        r"\b(ECONNRESET|ETIMEDOUT|ECONNREFUSED|ENOTFOUND|EAI_AGAIN|EPIPE|ENETUNREACH|EHOSTUNREACH)\b"
    )
    .expect("transient code pattern is valid");
}

/// Errors from registration, selection and recovery bookkeeping.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RampartError {
    #[error("Model not registered: {0}")]
    ModelNotRegistered(TargetId),

    #[error("No available models")]
    NoAvailableModels,

    #[error("Maximum concurrent recoveries reached ({limit})")]
    MaxConcurrentRecoveries { limit: usize },

    #[error("Insufficient healthy models: required {required}, available {available}")]
    InsufficientHealthyModels { required: usize, available: usize },

    #[error("Recovery plan not found: {0}")]
    RecoveryNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure of a protected call.
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// The breaker rejected the call without running it
    #[error("Circuit breaker is open for {target}, retry in {retry_after:?}")]
    CircuitOpen {
        target: TargetId,
        retry_after: Duration,
    },

    /// The work did not finish within the breaker timeout
    #[error("Call to {target} timed out after {after:?}")]
    Timeout { target: TargetId, after: Duration },

    /// Every retry failed; `last` is the final failure
    #[error("Retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        last: Box<CallError<E>>,
    },

    /// Selection or registration failure before the work ran
    #[error(transparent)]
    Routing(#[from] RampartError),

    /// The caller's work failed
    #[error("Operation failed: {0}")]
    Operation(E),
}

impl<E> CallError<E> {
    /// Whether the breaker rejected the call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CallError::CircuitOpen { .. })
    }

    /// Whether the call timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }

    /// The innermost failure, unwrapping retry exhaustion.
    pub fn last_error(&self) -> &CallError<E> {
        match self {
            CallError::RetriesExhausted { last, .. } => last.last_error(),
            other => other,
        }
    }

    /// The caller's error, if the work itself failed.
    pub fn operation_error(&self) -> Option<&E> {
        match self.last_error() {
            CallError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Failure of the retry engine.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("Non-retryable error: {0}")]
    NotRetryable(E),

    #[error("All {} batch operations failed", .0.len())]
    AllFailed(Vec<RetryError<E>>),
}

impl<E> RetryError<E> {
    /// The last underlying failure.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::NotRetryable(e) => Some(e),
            RetryError::AllFailed(errors) => errors.into_iter().last().and_then(|e| e.into_last()),
        }
    }

    /// Number of attempts made, when known.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::NotRetryable(_) => 1,
            RetryError::AllFailed(errors) => errors.iter().map(|e| e.attempts()).sum(),
        }
    }
}

impl<E> From<RetryError<CallError<E>>> for CallError<E> {
    fn from(err: RetryError<CallError<E>>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => CallError::RetriesExhausted {
                attempts,
                last: Box::new(last),
            },
            RetryError::NotRetryable(e) => e,
            RetryError::AllFailed(errors) => errors
                .into_iter()
                .last()
                .map(CallError::from)
                .unwrap_or(CallError::Routing(RampartError::NoAvailableModels)),
        }
    }
}

/// Classification hooks the retry engine uses to decide retryability.
///
/// Implement this for caller error types. Every method has a conservative
/// default: no code, not recoverable, no message.
pub trait Classify {
    /// Machine-readable error code (e.g., "ECONNRESET", "RATE_LIMITED").
    fn error_code(&self) -> Option<&str> {
        None
    }

    /// Explicit recoverable flag.
    fn is_recoverable(&self) -> bool {
        false
    }

    /// Human-readable message, scanned for embedded transient codes.
    fn describe(&self) -> Option<String> {
        None
    }
}

/// Whether an error should be retried under the given allow-list.
pub fn is_retryable<E: Classify + ?Sized>(err: &E, retryable_codes: &[String]) -> bool {
    if let Some(code) = err.error_code() {
        if retryable_codes.iter().any(|c| c == code) || is_transient_network_code(code) {
            return true;
        }
    }

    if err.is_recoverable() {
        return true;
    }

    err.describe()
        .map(|message| TRANSIENT_CODE_IN_MESSAGE.is_match(&message))
        .unwrap_or(false)
}

/// Whether a code is one of [`TRANSIENT_NETWORK_CODES`].
pub fn is_transient_network_code(code: &str) -> bool {
    TRANSIENT_NETWORK_CODES.contains(&code)
}

impl<E: Classify> Classify for CallError<E> {
    fn error_code(&self) -> Option<&str> {
        match self {
            CallError::CircuitOpen { .. } => Some("CIRCUIT_OPEN"),
            CallError::Timeout { .. } => Some("TIMEOUT"),
            CallError::RetriesExhausted { .. } => Some("RETRIES_EXHAUSTED"),
            CallError::Routing(RampartError::ModelNotRegistered(_)) => Some("MODEL_NOT_REGISTERED"),
            CallError::Routing(RampartError::NoAvailableModels) => Some("NO_AVAILABLE_MODELS"),
            CallError::Routing(_) => Some("ROUTING"),
            CallError::Operation(e) => e.error_code(),
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            CallError::Timeout { .. } => true,
            CallError::Operation(e) => e.is_recoverable(),
            _ => false,
        }
    }

    fn describe(&self) -> Option<String> {
        match self {
            CallError::Operation(e) => e.describe(),
            _ => None,
        }
    }
}

impl Classify for std::io::Error {
    fn error_code(&self) -> Option<&str> {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::ConnectionReset => Some("ECONNRESET"),
            ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            ErrorKind::TimedOut => Some("ETIMEDOUT"),
            ErrorKind::BrokenPipe => Some("EPIPE"),
            _ => None,
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
        )
    }

    fn describe(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl Classify for anyhow::Error {
    fn error_code(&self) -> Option<&str> {
        self.downcast_ref::<std::io::Error>()
            .and_then(|io| io.error_code())
    }

    fn is_recoverable(&self) -> bool {
        self.downcast_ref::<std::io::Error>()
            .map(|io| io.is_recoverable())
            .unwrap_or(false)
    }

    fn describe(&self) -> Option<String> {
        Some(format!("{self:#}"))
    }
}

impl Classify for String {
    fn describe(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl Classify for &'static str {
    fn describe(&self) -> Option<String> {
        Some((*self).to_string())
    }
}
