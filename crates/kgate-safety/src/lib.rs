//! kgate safety layer
//!
//! Everything that decides whether a change-set may touch a cluster:
//! - The change model (targets, quantities, canonical change-set hashes)
//! - Risk assessment against production and critical-workload patterns
//! - Single-use, signed, time-boxed confirmation tokens
//! - The hash-chained audit log
//!
//! Nothing in this crate performs I/O against a cluster.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod audit;
pub mod clock;
pub mod confirmation;
pub mod error;
pub mod prompt;
pub mod quantity;
pub mod types;
pub mod validator;

pub use audit::{
    AuditFilter, AuditLog, AuditLogEntry, AuditOperation, AuditOutcome, AuditRecord,
    DEFAULT_HISTORY_LIMIT,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use confirmation::{
    ConfirmationConfig, ConfirmationManager, ConfirmationRequest, ConfirmationToken, TokenStatus,
    TokenSweep,
};
pub use error::{
    AuditError, InvalidTokenError, QuantityError, SafetyConfigError, TokenRejection,
    ValidationError,
};
pub use prompt::ChangeSummary;
pub use quantity::{CpuQuantity, MemoryQuantity, ResourceField, ResourceQuantities};
pub use types::{
    validate_change_set, AuditEntryId, ChangeSetHash, FieldDelta, ResourceChange, ResourceTarget,
    SnapshotId, TokenId, TransactionId,
};
pub use validator::{
    RiskLevel, SafetyAssessment, SafetyConfig, SafetyValidator, SafetyWarning, WarningCode,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
