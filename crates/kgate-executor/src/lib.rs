//! kgate execution layer
//!
//! Turns a confirmed change-set into cluster mutations:
//! - `StagedRolloutScheduler` splits the change-set into namespace stages,
//!   lowest risk first, and paces them
//! - `TransactionCoordinator` applies one stage as a unit, snapshotting
//!   before it mutates and rolling back on failure
//! - `PostExecutionValidator` checks each stage actually landed and the
//!   workloads stayed healthy
//!
//! All cluster access goes through the [`ClusterClient`] trait.
//!
//! # Critical Invariant
//!
//! No mutation is issued before the stage's rollback snapshot exists, and
//! the first stage of a rollout never starts without consuming a
//! confirmed token bound to the full change-set.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod cancel;
pub mod cluster;
pub mod error;
pub mod rollout;
pub mod snapshot;
pub mod timing;
pub mod transaction;
pub mod validation;

pub use cancel::{cancellation, CancelHandle, CancelSignal};
pub use cluster::{
    ClusterClient, CommandErrorKind, ContainerStatus, ExternalCommandError, InstanceStatus,
    KubectlCluster, Manifest, MockCluster, PatchMode, PatchRecord,
};
pub use error::{ExecutionError, SnapshotError};
pub use rollout::{
    ExecutionResult, RolloutConfig, RolloutStatus, Stage, StageResult, StageStatus,
    StagedRolloutScheduler, ValidationFailureAction,
};
pub use snapshot::{
    ResourceSnapshot, ReversalOperation, RollbackSnapshot, SnapshotStatus, SnapshotStore,
};
pub use timing::TimingPolicy;
pub use transaction::{
    ExecutionConfig, ExecutionMode, ExecutionTransaction, FailurePolicy, Operation,
    OperationStatus, RestoreReport, TokenGrant, TransactionCoordinator, TransactionStatus,
};
pub use validation::{
    PostExecutionValidator, ResourceValidation, StabilityThresholds, ValidationReport,
    ValidationResult, ValidationTier,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
