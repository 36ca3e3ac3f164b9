//! Confirmation tokens
//!
//! A token authorizes exactly one application of exactly one change-set.
//! Tokens are signed with the manager's ed25519 key and tracked in a
//! concurrent registry; every status transition happens while holding the
//! registry entry, so two consumers racing for one token cannot both win.
//!
//! ```text
//! PENDING ──confirm──▶ CONFIRMED ──consume──▶ CONSUMED
//!    │                    │
//!    └──────expiry────────┴──────▶ EXPIRED
//! ```

use crate::audit::{AuditLog, AuditOperation, AuditOutcome, AuditRecord};
use crate::clock::SharedClock;
use crate::error::{InvalidTokenError, TokenRejection, ValidationError};
use crate::prompt::{self, ChangeSummary, PromptLimits};
use crate::types::{validate_change_set, ChangeSetHash, ResourceChange, TokenId};
use crate::validator::{RiskLevel, SafetyAssessment};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Token lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    Pending,
    Confirmed,
    Consumed,
    Expired,
}

impl TokenStatus {
    /// States reachable from `self`
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [TokenStatus] {
        use TokenStatus::{Confirmed, Consumed, Expired};
        match self {
            Self::Pending => &[Confirmed, Expired],
            Self::Confirmed => &[Consumed, Expired],
            Self::Consumed | Self::Expired => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: TokenStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }
}

/// Confirmation manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// Token lifetime
    pub token_timeout_secs: u64,
    /// How long expired and consumed tokens stay queryable
    pub sweep_grace_secs: u64,
    /// Changes listed in a prompt
    pub max_prompt_changes: usize,
    /// Warnings listed in a prompt
    pub max_prompt_warnings: usize,
}

impl ConfirmationConfig {
    #[inline]
    #[must_use]
    pub fn with_token_timeout_secs(mut self, secs: u64) -> Self {
        self.token_timeout_secs = secs;
        self
    }
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            token_timeout_secs: 300,
            sweep_grace_secs: 600,
            max_prompt_changes: 10,
            max_prompt_warnings: 5,
        }
    }
}

/// A signed confirmation token bound to one change-set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationToken {
    pub id: TokenId,
    pub change_set_hash: ChangeSetHash,
    pub risk_level: RiskLevel,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TokenStatus,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub signature: Signature,
}

impl ConfirmationToken {
    fn sign(
        id: TokenId,
        change_set_hash: ChangeSetHash,
        risk_level: RiskLevel,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        signing_key: &SigningKey,
    ) -> Self {
        let message = token_message(id, change_set_hash, risk_level, created_at, expires_at);
        Self {
            id,
            change_set_hash,
            risk_level,
            created_at,
            expires_at,
            status: TokenStatus::Pending,
            confirmed_at: None,
            consumed_at: None,
            signature: signing_key.sign(&message),
        }
    }

    /// Verify the signature over the immutable token fields
    #[must_use]
    pub fn verify(&self, verifying_key: &VerifyingKey) -> bool {
        let message = token_message(
            self.id,
            self.change_set_hash,
            self.risk_level,
            self.created_at,
            self.expires_at,
        );
        verifying_key.verify(&message, &self.signature).is_ok()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

fn token_message(
    id: TokenId,
    change_set_hash: ChangeSetHash,
    risk_level: RiskLevel,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(16 + 32 + 1 + 8 + 8);
    msg.extend_from_slice(id.0.as_bytes());
    msg.extend_from_slice(&change_set_hash.0);
    msg.push(risk_level.as_u8());
    msg.extend_from_slice(&created_at.timestamp_millis().to_le_bytes());
    msg.extend_from_slice(&expires_at.timestamp_millis().to_le_bytes());
    msg
}

/// What a caller gets back from `request_confirmation`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub prompt: String,
    pub token: ConfirmationToken,
    pub summary: ChangeSummary,
}

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSweep {
    pub expired: usize,
    pub removed: usize,
}

#[derive(Debug)]
struct TokenRecord {
    token: ConfirmationToken,
    changes: Arc<Vec<ResourceChange>>,
    settled_at: Option<DateTime<Utc>>,
}

/// Issues, confirms and consumes tokens
pub struct ConfirmationManager {
    config: ConfirmationConfig,
    tokens: DashMap<TokenId, TokenRecord>,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    clock: SharedClock,
    audit: Arc<AuditLog>,
}

impl std::fmt::Debug for ConfirmationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationManager")
            .field("config", &self.config)
            .field("tokens", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

impl ConfirmationManager {
    /// Create with a fresh random signing key
    #[must_use]
    pub fn new(config: ConfirmationConfig, clock: SharedClock, audit: Arc<AuditLog>) -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::with_signing_key(config, clock, audit, signing_key)
    }

    #[must_use]
    pub fn with_signing_key(
        config: ConfirmationConfig,
        clock: SharedClock,
        audit: Arc<AuditLog>,
        signing_key: SigningKey,
    ) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            config,
            tokens: DashMap::new(),
            signing_key,
            verifying_key,
            clock,
            audit,
        }
    }

    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }

    /// Issue a token for `changes` at the given risk level
    ///
    /// # Errors
    /// Returns `ValidationError` for an empty or malformed change-set.
    pub fn request_confirmation(
        &self,
        changes: &[ResourceChange],
        risk_level: RiskLevel,
    ) -> Result<ConfirmationRequest, ValidationError> {
        self.issue(changes, risk_level, None)
    }

    /// Issue a token with the assessment's warnings in the prompt
    ///
    /// # Errors
    /// Returns `ValidationError` for an empty or malformed change-set.
    pub fn request_confirmation_for(
        &self,
        changes: &[ResourceChange],
        assessment: &SafetyAssessment,
    ) -> Result<ConfirmationRequest, ValidationError> {
        self.issue(changes, assessment.risk_level, Some(assessment))
    }

    fn issue(
        &self,
        changes: &[ResourceChange],
        risk_level: RiskLevel,
        assessment: Option<&SafetyAssessment>,
    ) -> Result<ConfirmationRequest, ValidationError> {
        if changes.is_empty() {
            return Err(ValidationError::EmptyChangeSet);
        }
        validate_change_set(changes)?;

        let hash = ChangeSetHash::of(changes);
        let created_at = self.clock.now();
        let expires_at = created_at + self.timeout();
        let token = ConfirmationToken::sign(
            TokenId::new(),
            hash,
            risk_level,
            created_at,
            expires_at,
            &self.signing_key,
        );
        let prompt = prompt::render(
            changes,
            risk_level,
            assessment,
            expires_at,
            &PromptLimits {
                max_changes: self.config.max_prompt_changes,
                max_warnings: self.config.max_prompt_warnings,
            },
        );

        self.tokens.insert(
            token.id,
            TokenRecord {
                token: token.clone(),
                changes: Arc::new(changes.to_vec()),
                settled_at: None,
            },
        );
        self.audit.append(
            AuditRecord::new(AuditOperation::RequestConfirmation, AuditOutcome::Success)
                .with_token(token.id)
                .with_change_set(hash)
                .with_details(serde_json::json!({
                    "risk_level": risk_level,
                    "changes": changes.len(),
                    "expires_at": expires_at,
                })),
        );
        info!(token_id = %token.id, %risk_level, changes = changes.len(), "confirmation requested");

        Ok(ConfirmationRequest {
            prompt,
            token,
            summary: ChangeSummary::of(changes),
        })
    }

    /// Mark a pending token as confirmed
    ///
    /// # Errors
    /// Returns `InvalidTokenError` if the token is unknown, expired, or not
    /// pending.
    pub fn confirm(&self, token_id: TokenId) -> Result<ConfirmationToken, InvalidTokenError> {
        self.confirm_by(token_id, None)
    }

    /// Confirm on behalf of a named actor
    ///
    /// # Errors
    /// Same as [`confirm`](Self::confirm).
    pub fn confirm_by(
        &self,
        token_id: TokenId,
        actor: Option<&str>,
    ) -> Result<ConfirmationToken, InvalidTokenError> {
        let now = self.clock.now();
        let result = match self.tokens.get_mut(&token_id) {
            None => Err(TokenRejection::NotFound),
            Some(mut record) => match (record.token.status, record.token.is_expired_at(now)) {
                (TokenStatus::Pending, true) => {
                    record.token.status = TokenStatus::Expired;
                    record.settled_at = Some(now);
                    Err(TokenRejection::Expired)
                }
                (TokenStatus::Pending, false) => {
                    record.token.status = TokenStatus::Confirmed;
                    record.token.confirmed_at = Some(now);
                    Ok((record.token.clone(), record.token.change_set_hash))
                }
                (TokenStatus::Confirmed, _) => Err(TokenRejection::AlreadyConfirmed),
                (TokenStatus::Consumed, _) => Err(TokenRejection::AlreadyConsumed),
                (TokenStatus::Expired, _) => Err(TokenRejection::Expired),
            },
        };

        let mut record =
            AuditRecord::new(AuditOperation::Confirm, AuditOutcome::Success).with_token(token_id);
        if let Some(actor) = actor {
            record = record.with_actor(actor);
        }
        match result {
            Ok((token, hash)) => {
                self.audit.append(record.with_change_set(hash));
                info!(%token_id, "token confirmed");
                Ok(token)
            }
            Err(reason) => Err(self.reject(record, token_id, reason)),
        }
    }

    /// Check a token would be accepted for `hash`, without using it
    ///
    /// # Errors
    /// Returns `InvalidTokenError` with the reason consumption would fail.
    pub fn verify(
        &self,
        token_id: TokenId,
        hash: ChangeSetHash,
    ) -> Result<ConfirmationToken, InvalidTokenError> {
        let now = self.clock.now();
        let result = match self.tokens.get(&token_id) {
            None => Err(TokenRejection::NotFound),
            Some(record) => self
                .check_usable(&record.token, hash, now)
                .map(|()| record.token.clone()),
        };
        result.map_err(|reason| {
            let record = AuditRecord::new(AuditOperation::DryRun, AuditOutcome::Rejected)
                .with_token(token_id)
                .with_change_set(hash);
            self.reject(record, token_id, reason)
        })
    }

    /// Whether `consume` would currently accept the token for `hash`.
    ///
    /// Neither audits nor changes the token; callers that need the refusal
    /// recorded go on to call `consume`.
    #[must_use]
    pub fn is_consumable(&self, token_id: TokenId, hash: ChangeSetHash) -> bool {
        let now = self.clock.now();
        self.tokens
            .get(&token_id)
            .is_some_and(|record| self.check_usable(&record.token, hash, now).is_ok())
    }

    /// Atomically consume a confirmed token for `hash`
    ///
    /// # Errors
    /// Returns `InvalidTokenError` if the token is unknown, unconfirmed,
    /// already consumed, expired, tampered with, or bound to another
    /// change-set. A hash mismatch leaves the token untouched.
    pub fn consume(
        &self,
        token_id: TokenId,
        hash: ChangeSetHash,
    ) -> Result<ConfirmationToken, InvalidTokenError> {
        let now = self.clock.now();
        let result = match self.tokens.get_mut(&token_id) {
            None => Err(TokenRejection::NotFound),
            Some(mut record) => match self.check_usable(&record.token, hash, now) {
                Ok(()) => {
                    record.token.status = TokenStatus::Consumed;
                    record.token.consumed_at = Some(now);
                    record.settled_at = Some(now);
                    Ok(record.token.clone())
                }
                Err(TokenRejection::Expired) => {
                    if record.token.status.can_transition_to(TokenStatus::Expired) {
                        record.token.status = TokenStatus::Expired;
                        record.settled_at = Some(now);
                    }
                    Err(TokenRejection::Expired)
                }
                Err(reason) => Err(reason),
            },
        };

        match result {
            Ok(token) => {
                self.audit.append(
                    AuditRecord::new(AuditOperation::ConsumeToken, AuditOutcome::Success)
                        .with_token(token_id)
                        .with_change_set(hash),
                );
                info!(%token_id, "token consumed");
                Ok(token)
            }
            Err(reason) => {
                let record = AuditRecord::new(AuditOperation::ConsumeToken, AuditOutcome::Rejected)
                    .with_token(token_id)
                    .with_change_set(hash);
                Err(self.reject(record, token_id, reason))
            }
        }
    }

    fn check_usable(
        &self,
        token: &ConfirmationToken,
        hash: ChangeSetHash,
        now: DateTime<Utc>,
    ) -> Result<(), TokenRejection> {
        if !token.verify(&self.verifying_key) {
            return Err(TokenRejection::SignatureInvalid);
        }
        match token.status {
            TokenStatus::Consumed => return Err(TokenRejection::AlreadyConsumed),
            TokenStatus::Expired => return Err(TokenRejection::Expired),
            TokenStatus::Pending if token.is_expired_at(now) => return Err(TokenRejection::Expired),
            TokenStatus::Pending => return Err(TokenRejection::NotConfirmed),
            TokenStatus::Confirmed => {}
        }
        if token.is_expired_at(now) {
            return Err(TokenRejection::Expired);
        }
        if token.change_set_hash != hash {
            return Err(TokenRejection::ChangeSetMismatch);
        }
        Ok(())
    }

    fn reject(&self, record: AuditRecord, token_id: TokenId, reason: TokenRejection) -> InvalidTokenError {
        self.audit.append(
            record
                .with_outcome(AuditOutcome::Rejected)
                .with_details(serde_json::json!({"reason": reason.code()})),
        );
        warn!(%token_id, reason = reason.code(), "token rejected");
        InvalidTokenError::new(token_id, reason)
    }

    /// Current view of a token
    #[must_use]
    pub fn token(&self, token_id: TokenId) -> Option<ConfirmationToken> {
        self.tokens.get(&token_id).map(|r| r.token.clone())
    }

    /// Change-set a token was issued for
    #[must_use]
    pub fn changes_for(&self, token_id: TokenId) -> Option<Arc<Vec<ResourceChange>>> {
        self.tokens.get(&token_id).map(|r| Arc::clone(&r.changes))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Expire overdue tokens and drop settled ones past the grace period
    pub fn sweep(&self) -> TokenSweep {
        let now = self.clock.now();
        let grace = chrono::Duration::seconds(i64::try_from(self.config.sweep_grace_secs).unwrap_or(i64::MAX));
        let mut sweep = TokenSweep::default();

        for mut record in self.tokens.iter_mut() {
            if !record.token.status.is_terminal() && record.token.is_expired_at(now) {
                record.token.status = TokenStatus::Expired;
                record.settled_at = Some(now);
                sweep.expired += 1;
            }
        }
        let before = self.tokens.len();
        self.tokens
            .retain(|_, record| record.settled_at.map_or(true, |at| now - at <= grace));
        sweep.removed = before.saturating_sub(self.tokens.len());

        if sweep.expired > 0 || sweep.removed > 0 {
            debug!(expired = sweep.expired, removed = sweep.removed, "token sweep");
        }
        sweep
    }

    fn timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.config.token_timeout_secs).unwrap_or(i64::MAX))
    }

    #[cfg(test)]
    fn tamper(&self, token_id: TokenId, hash: ChangeSetHash) {
        if let Some(mut record) = self.tokens.get_mut(&token_id) {
            record.token.change_set_hash = hash;
        }
    }
}
