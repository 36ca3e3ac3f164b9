//! Error types for the execution layer

use crate::cluster::ExternalCommandError;
use kgate_safety::{InvalidTokenError, SnapshotId, ValidationError};

/// Why a transaction could not start
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    /// The authorizing token was refused
    #[error(transparent)]
    InvalidToken(#[from] InvalidTokenError),

    /// Live state could not be captured, so nothing was mutated
    #[error("could not snapshot {target}: {source}")]
    SnapshotRead {
        target: String,
        #[source]
        source: ExternalCommandError,
    },

    /// Stage contents were malformed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Snapshot store refused the request
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Stopped before dispatch
    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// Transient failures that a later retry may clear
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SnapshotRead { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Snapshot store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot {0} not found")]
    NotFound(SnapshotId),

    #[error("snapshot {0} has expired")]
    Expired(SnapshotId),

    #[error("snapshot {0} was already used for a rollback")]
    Consumed(SnapshotId),
}

impl SnapshotError {
    /// Stable reason code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "SNAPSHOT_NOT_FOUND",
            Self::Expired(_) => "SNAPSHOT_EXPIRED",
            Self::Consumed(_) => "SNAPSHOT_CONSUMED",
        }
    }
}
