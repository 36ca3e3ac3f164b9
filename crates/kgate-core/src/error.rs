//! Error types for the gate
//!
//! Every failure a caller can see is one of:
//! - Input errors (malformed change-sets), rejected before assessment
//! - Safety violations, rejected regardless of any token
//! - Token errors
//! - Cluster command failures
//! - Partial failures of a rollout or rollback
//! - Internal errors, which expose only the audit entry holding the detail
//!
//! `ErrorReport` is the serializable form handed to users.

use crate::config::ConfigError;
use kgate_executor::{
    ExecutionError, ExecutionResult, ExternalCommandError, RolloutStatus, SnapshotError,
    StageStatus,
};
use kgate_safety::{AuditEntryId, InvalidTokenError, RiskLevel, SnapshotId, ValidationError};
use serde::{Deserialize, Serialize};

/// Main gate error type
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Malformed change-set
    #[error("invalid change-set: {0}")]
    Validation(#[from] ValidationError),

    /// The change-set is blocked by a safety limit
    #[error("safety violation ({risk} risk): {message}")]
    SafetyViolation {
        risk: RiskLevel,
        /// Limits or patterns that blocked the change-set
        triggers: Vec<String>,
        message: String,
    },

    /// Token missing or refused
    #[error(transparent)]
    InvalidToken(#[from] InvalidTokenError),

    /// A cluster command failed outside of a transaction
    #[error(transparent)]
    ExternalCommand(#[from] ExternalCommandError),

    /// Some work was done and some was not
    #[error("partial failure: {completed} completed, {failed} failed: {message}")]
    PartialFailure {
        completed: usize,
        failed: usize,
        message: String,
    },

    /// A stage applied but did not validate
    #[error("stage {stage} validation passed {success_ratio:.2}, below {threshold:.2}")]
    ValidationFailure {
        stage: usize,
        success_ratio: f64,
        threshold: f64,
    },

    /// Snapshot missing, expired or already used
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Bad configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Stopped before anything was dispatched
    #[error("operation cancelled")]
    Cancelled,

    /// Unexpected failure; details are in the audit log only
    #[error("internal error, see audit entry {audit_id}")]
    Internal { audit_id: AuditEntryId },
}

impl GateError {
    /// Transient failures that a later retry may clear
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ExternalCommand(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Rejected before anything touched the cluster
    #[inline]
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::SafetyViolation { .. } | Self::InvalidToken(_)
        )
    }

    /// Error family name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::SafetyViolation { .. } => "safety_violation",
            Self::InvalidToken(_) => "invalid_token",
            Self::ExternalCommand(_) => "external_command_error",
            Self::PartialFailure { .. } => "partial_failure",
            Self::ValidationFailure { .. } => "validation_failure",
            Self::Snapshot(_) => "snapshot_error",
            Self::Config(_) => "config_error",
            Self::Cancelled => "cancelled",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Stable reason code
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::Validation(e) => e.code().to_string(),
            Self::SafetyViolation { .. } => "SAFETY_VIOLATION".to_string(),
            Self::InvalidToken(e) => e.reason.code().to_string(),
            Self::ExternalCommand(e) => format!("COMMAND_{}", e.kind.as_str().to_uppercase()),
            Self::PartialFailure { .. } => "PARTIAL_FAILURE".to_string(),
            Self::ValidationFailure { .. } => "VALIDATION_FAILURE".to_string(),
            Self::Snapshot(e) => e.code().to_string(),
            Self::Config(_) => "CONFIG_INVALID".to_string(),
            Self::Cancelled => "CANCELLED".to_string(),
            Self::Internal { .. } => "INTERNAL_ERROR".to_string(),
        }
    }

    /// The limit or pattern responsible, where there is one
    #[must_use]
    pub fn trigger(&self) -> Option<String> {
        match self {
            Self::SafetyViolation { triggers, .. } => triggers.first().cloned(),
            Self::ValidationFailure { threshold, .. } => {
                Some(format!("success_threshold={threshold}"))
            }
            Self::ExternalCommand(e) => Some(e.target.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind().to_string(),
            code: self.code(),
            message: self.to_string(),
            trigger: self.trigger(),
        }
    }

    /// Error describing a rollout that did not complete, if any.
    ///
    /// A rollout halted by validation reports `ValidationFailure`; any other
    /// incomplete rollout reports `PartialFailure`.
    #[must_use]
    pub fn from_rollout(result: &ExecutionResult, threshold: f64) -> Option<Self> {
        if result.status == RolloutStatus::Completed {
            return None;
        }
        if let Some(stage) = result
            .stages
            .iter()
            .find(|s| s.status == StageStatus::ValidationFailed)
        {
            let success_ratio = stage.validation.as_ref().map_or(0.0, |v| v.success_ratio);
            return Some(Self::ValidationFailure {
                stage: stage.index,
                success_ratio,
                threshold,
            });
        }
        if result.status == RolloutStatus::Cancelled && result.committed_stages() == 0 {
            return Some(Self::Cancelled);
        }
        let completed = result.committed_stages();
        let failed = result
            .stages
            .iter()
            .filter(|s| s.status != StageStatus::Completed)
            .count();
        let message = result
            .stages
            .iter()
            .find_map(|s| s.error.clone())
            .unwrap_or_else(|| format!("rollout ended {:?}", result.status));
        Some(Self::PartialFailure {
            completed,
            failed,
            message,
        })
    }
}

impl From<ExecutionError> for GateError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::InvalidToken(e) => Self::InvalidToken(e),
            ExecutionError::SnapshotRead { source, .. } => Self::ExternalCommand(source),
            ExecutionError::Validation(e) => Self::Validation(e),
            ExecutionError::Snapshot(e) => Self::Snapshot(e),
            ExecutionError::Cancelled => Self::Cancelled,
        }
    }
}

/// User-facing error description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: String,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

/// Rollback could not restore every resource
pub(crate) fn incomplete_restore(
    snapshot_id: SnapshotId,
    restored: usize,
    failed: &[ExternalCommandError],
) -> GateError {
    let message = failed.first().map_or_else(
        || format!("snapshot {snapshot_id} restore incomplete"),
        ToString::to_string,
    );
    GateError::PartialFailure {
        completed: restored,
        failed: failed.len(),
        message,
    }
}
