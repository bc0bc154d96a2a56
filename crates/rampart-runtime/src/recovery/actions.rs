//! The seam through which recovery plans touch the outside world.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use rampart_core::TargetId;

use super::plan::{RecoveryAction, RecoveryActionKind};

/// Errors from executing a single recovery action.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    /// The executor has no implementation for this action; it is skipped
    #[error("Recovery action not supported: {0}")]
    Unsupported(RecoveryActionKind),

    #[error("Recovery action timed out after {0:?}")]
    Timeout(Duration),

    #[error("Recovery action failed: {0}")]
    Failed(String),
}

/// Performs recovery actions against a target.
#[async_trait]
pub trait RecoveryActionExecutor: Send + Sync {
    async fn execute(&self, target: &TargetId, action: &RecoveryAction) -> Result<(), ActionError>;
}
