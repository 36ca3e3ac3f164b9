//! Error types for the safety layer
//!
//! Every error carries a stable reason code so callers can report it
//! without parsing messages.

use crate::quantity::ResourceField;
use crate::types::TokenId;

/// A malformed change or change-set. Raised before any assessment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Nothing to assess or confirm
    #[error("change-set is empty")]
    EmptyChangeSet,

    /// A target coordinate is blank
    #[error("target {target} has an empty {part}")]
    IncompleteTarget { target: String, part: &'static str },

    /// The change proposes nothing
    #[error("change for {target} proposes no resource values")]
    NoProposedResources { target: String },

    /// A proposed field has no current value to compare with
    #[error("change for {target} proposes {field} without a current value")]
    MissingCurrentValue { target: String, field: ResourceField },

    /// Percentage change is undefined from zero
    #[error("change for {target} has a zero current {field}")]
    ZeroCurrentValue { target: String, field: ResourceField },

    /// The same resource appears twice
    #[error("change-set lists {target} more than once")]
    DuplicateTarget { target: String },

    /// The live workload does not set a field the change resizes, so a
    /// rollback would have nothing to restore
    #[error("live {target} does not set {field}")]
    FieldNotLive { target: String, field: ResourceField },
}

impl ValidationError {
    /// Stable reason code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyChangeSet => "EMPTY_CHANGE_SET",
            Self::IncompleteTarget { .. } => "INCOMPLETE_TARGET",
            Self::NoProposedResources { .. } => "NO_PROPOSED_RESOURCES",
            Self::MissingCurrentValue { .. } => "MISSING_CURRENT_VALUE",
            Self::ZeroCurrentValue { .. } => "ZERO_CURRENT_VALUE",
            Self::DuplicateTarget { .. } => "DUPLICATE_TARGET",
            Self::FieldNotLive { .. } => "FIELD_NOT_LIVE",
        }
    }
}

/// Quantity string could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {unit} quantity {value:?}")]
pub struct QuantityError {
    pub unit: &'static str,
    pub value: String,
}

/// Why a token was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenRejection {
    /// No token was presented
    Missing,
    /// Unknown token id
    NotFound,
    /// Token was never confirmed
    NotConfirmed,
    /// Confirm called twice
    AlreadyConfirmed,
    /// Token was already used
    AlreadyConsumed,
    /// Past its expiry
    Expired,
    /// Presented change-set differs from the one the token was issued for
    ChangeSetMismatch,
    /// Signature does not verify
    SignatureInvalid,
}

impl TokenRejection {
    /// Stable reason code
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Missing => "TOKEN_MISSING",
            Self::NotFound => "TOKEN_NOT_FOUND",
            Self::NotConfirmed => "TOKEN_NOT_CONFIRMED",
            Self::AlreadyConfirmed => "TOKEN_ALREADY_CONFIRMED",
            Self::AlreadyConsumed => "TOKEN_ALREADY_CONSUMED",
            Self::Expired => "TOKEN_EXPIRED",
            Self::ChangeSetMismatch => "CHANGE_SET_MISMATCH",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
        }
    }
}

impl std::fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A confirmation token could not be used
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("confirmation token {} rejected: {reason}", token_label(.token_id))]
pub struct InvalidTokenError {
    pub token_id: Option<TokenId>,
    pub reason: TokenRejection,
}

impl InvalidTokenError {
    #[inline]
    #[must_use]
    pub fn new(token_id: TokenId, reason: TokenRejection) -> Self {
        Self {
            token_id: Some(token_id),
            reason,
        }
    }

    /// No token presented at all
    #[inline]
    #[must_use]
    pub fn missing() -> Self {
        Self {
            token_id: None,
            reason: TokenRejection::Missing,
        }
    }
}

fn token_label(id: &Option<TokenId>) -> String {
    id.map_or_else(|| "<none>".to_string(), |id| id.to_string())
}

/// Bad validator configuration
#[derive(Debug, thiserror::Error)]
pub enum SafetyConfigError {
    /// Pattern does not compile
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Threshold out of range
    #[error("invalid threshold {name}: {value}")]
    InvalidThreshold { name: &'static str, value: f64 },
}

/// Audit log errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// Chain broken at the given sequence number
    #[error("audit chain integrity violation at sequence {sequence}")]
    IntegrityViolation { sequence: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_codes_are_stable() {
        assert_eq!(TokenRejection::ChangeSetMismatch.code(), "CHANGE_SET_MISMATCH");
        assert_eq!(TokenRejection::AlreadyConsumed.to_string(), "TOKEN_ALREADY_CONSUMED");
        let json = serde_json::to_string(&TokenRejection::NotConfirmed).unwrap();
        assert_eq!(json, "\"NOT_CONFIRMED\"");
    }

    #[test]
    fn missing_token_message() {
        let err = InvalidTokenError::missing();
        assert_eq!(err.to_string(), "confirmation token <none> rejected: TOKEN_MISSING");
    }
}
