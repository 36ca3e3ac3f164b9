//! kgate core
//!
//! The `SafetyGate` facade and everything needed to stand one up:
//! - Configuration loaded from TOML
//! - The top-level error taxonomy and user-facing error reports
//! - The recommender interface that feeds candidate changes in
//! - A background sweeper for token, snapshot and audit retention
//!
//! # Critical Invariant
//!
//! No mutation reaches a cluster without a confirmed, unexpired, unused token
//! bound to the exact change-set, and no transaction mutates anything before
//! its rollback snapshot exists.
//!
//! # Example
//!
//! ```rust,ignore
//! use kgate_core::{ApplyRequest, GateConfig, SafetyGate};
//!
//! # async fn example(changes: Vec<kgate_core::ResourceChange>) -> Result<(), kgate_core::GateError> {
//! let gate = SafetyGate::builder(GateConfig::default()).build()?;
//!
//! let request = gate.request_confirmation(&changes)?;
//! println!("{}", request.prompt);
//! gate.confirm(request.token.id)?;
//!
//! let result = gate
//!     .apply(ApplyRequest::new(changes).with_token(request.token.id))
//!     .await?;
//! println!("rollback with {:?}", result.snapshot_ids);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod gate;
pub mod recommender;

pub use config::{
    ClusterBackend, ClusterConfig, ConfigError, GateConfig, RetentionConfig, TimingConfig,
    TimingPreset,
};
pub use error::{ErrorReport, GateError};
pub use gate::{ApplyRequest, GateBuilder, RollbackResult, SafetyGate, SweepReport, SweeperHandle};
pub use recommender::{Recommender, RecommenderError, StaticRecommender};

pub use kgate_executor as executor;
pub use kgate_safety as safety;

pub use kgate_executor::{
    cancellation, CancelHandle, CancelSignal, ExecutionMode, ExecutionResult, MockCluster,
    RolloutStatus, StageStatus,
};
pub use kgate_safety::{
    AuditFilter, AuditLogEntry, AuditOperation, AuditOutcome, ConfirmationRequest,
    ResourceChange, RiskLevel, SafetyAssessment, SnapshotId, TokenId,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a gate
    pub use crate::{
        ApplyRequest, AuditFilter, GateConfig, GateError, ResourceChange, RolloutStatus,
        SafetyGate,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
