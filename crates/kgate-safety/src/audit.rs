//! Append-only, hash-chained audit log
//!
//! Each entry stores the hash of its predecessor. Retention purges drop
//! entries from the front and remember the last dropped hash as the new
//! chain anchor, so `verify_integrity` keeps working after a purge.

use crate::clock::SharedClock;
use crate::error::AuditError;
use crate::types::{AuditEntryId, ChangeSetHash, SnapshotId, TokenId, TransactionId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::time::SystemTime;
use ulid::Ulid;

/// Default number of entries returned by a query
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Kind of audited operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Assess,
    RequestConfirmation,
    Confirm,
    ConsumeToken,
    Apply,
    DryRun,
    Transaction,
    Stage,
    Rollback,
    Sweep,
    Internal,
}

impl AuditOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assess => "assess",
            Self::RequestConfirmation => "request_confirmation",
            Self::Confirm => "confirm",
            Self::ConsumeToken => "consume_token",
            Self::Apply => "apply",
            Self::DryRun => "dry_run",
            Self::Transaction => "transaction",
            Self::Stage => "stage",
            Self::Rollback => "rollback",
            Self::Sweep => "sweep",
            Self::Internal => "internal",
        }
    }
}

/// Outcome of an audited operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Failure,
    Rejected,
}

impl AuditOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Rejected => "REJECTED",
        }
    }
}

/// Immutable audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: AuditEntryId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    pub change_set: Option<ChangeSetHash>,
    pub token_id: Option<TokenId>,
    pub transaction_id: Option<TransactionId>,
    pub snapshot_id: Option<SnapshotId>,
    pub details: serde_json::Value,
    #[serde(with = "hex_bytes")]
    pub prev_hash: [u8; 32],
    #[serde(with = "hex_bytes")]
    pub hash: [u8; 32],
}

/// Entry contents before sequencing and hashing
#[derive(Debug, Clone)]
pub struct AuditRecord {
    actor: Option<String>,
    operation: AuditOperation,
    outcome: AuditOutcome,
    change_set: Option<ChangeSetHash>,
    token_id: Option<TokenId>,
    transaction_id: Option<TransactionId>,
    snapshot_id: Option<SnapshotId>,
    details: serde_json::Value,
}

impl AuditRecord {
    #[must_use]
    pub fn new(operation: AuditOperation, outcome: AuditOutcome) -> Self {
        Self {
            actor: None,
            operation,
            outcome,
            change_set: None,
            token_id: None,
            transaction_id: None,
            snapshot_id: None,
            details: serde_json::Value::Null,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_change_set(mut self, hash: ChangeSetHash) -> Self {
        self.change_set = Some(hash);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_token(mut self, token_id: TokenId) -> Self {
        self.token_id = Some(token_id);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_transaction(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_snapshot(mut self, snapshot_id: SnapshotId) -> Self {
        self.snapshot_id = Some(snapshot_id);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Query over the audit log. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFilter {
    pub operation: Option<AuditOperation>,
    pub outcome: Option<AuditOutcome>,
    pub token_id: Option<TokenId>,
    pub transaction_id: Option<TransactionId>,
    pub snapshot_id: Option<SnapshotId>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn with_operation(mut self, operation: AuditOperation) -> Self {
        self.operation = Some(operation);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_token(mut self, token_id: TokenId) -> Self {
        self.token_id = Some(token_id);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_transaction(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.operation.map_or(true, |op| entry.operation == op)
            && self.outcome.map_or(true, |o| entry.outcome == o)
            && self.token_id.map_or(true, |t| entry.token_id == Some(t))
            && self
                .transaction_id
                .map_or(true, |t| entry.transaction_id == Some(t))
            && self.snapshot_id.map_or(true, |s| entry.snapshot_id == Some(s))
            && self.since.map_or(true, |since| entry.timestamp >= since)
    }
}

#[derive(Debug)]
struct AuditState {
    entries: VecDeque<AuditLogEntry>,
    next_sequence: u64,
    anchor: [u8; 32],
}

/// The audit log
#[derive(Debug)]
pub struct AuditLog {
    inner: Mutex<AuditState>,
    clock: SharedClock,
    retention: chrono::Duration,
    default_actor: String,
}

impl AuditLog {
    #[must_use]
    pub fn new(clock: SharedClock, retention: chrono::Duration) -> Self {
        Self {
            inner: Mutex::new(AuditState {
                entries: VecDeque::new(),
                next_sequence: 0,
                anchor: [0u8; 32],
            }),
            clock,
            retention,
            default_actor: "system".to_string(),
        }
    }

    /// Actor recorded when a record names none
    #[must_use]
    pub fn with_default_actor(mut self, actor: impl Into<String>) -> Self {
        self.default_actor = actor.into();
        self
    }

    /// Append a record; entries are sequenced under a single lock
    pub fn append(&self, record: AuditRecord) -> AuditEntryId {
        let timestamp = self.clock.now();
        let id = AuditEntryId(Ulid::from_datetime(SystemTime::from(timestamp)));
        let mut guard = self.inner.lock();
        let prev_hash = guard.entries.back().map_or(guard.anchor, |e| e.hash);
        let mut entry = AuditLogEntry {
            id,
            sequence: guard.next_sequence,
            timestamp,
            actor: record.actor.unwrap_or_else(|| self.default_actor.clone()),
            operation: record.operation,
            outcome: record.outcome,
            change_set: record.change_set,
            token_id: record.token_id,
            transaction_id: record.transaction_id,
            snapshot_id: record.snapshot_id,
            details: record.details,
            prev_hash,
            hash: [0u8; 32],
        };
        entry.hash = compute_hash(&entry);
        guard.next_sequence += 1;
        guard.entries.push_back(entry);
        id
    }

    /// Matching entries, newest first
    #[must_use]
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        let limit = filter.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        self.inner
            .lock()
            .entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Look up one entry
    #[must_use]
    pub fn get(&self, id: AuditEntryId) -> Option<AuditLogEntry> {
        self.inner.lock().entries.iter().find(|e| e.id == id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Drop entries older than the retention window
    pub fn purge_expired(&self) -> usize {
        let cutoff = self.clock.now() - self.retention;
        let mut guard = self.inner.lock();
        let mut purged = 0;
        while guard.entries.front().is_some_and(|e| e.timestamp < cutoff) {
            if let Some(entry) = guard.entries.pop_front() {
                guard.anchor = entry.hash;
                purged += 1;
            }
        }
        purged
    }

    /// Walk the chain and recompute every hash
    ///
    /// # Errors
    /// Returns `AuditError::IntegrityViolation` at the first broken link.
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        let guard = self.inner.lock();
        let mut prev = guard.anchor;
        for entry in &guard.entries {
            if entry.prev_hash != prev || entry.hash != compute_hash(entry) {
                return Err(AuditError::IntegrityViolation {
                    sequence: entry.sequence,
                });
            }
            prev = entry.hash;
        }
        Ok(())
    }

    #[cfg(test)]
    fn tamper(&self, sequence: u64, details: serde_json::Value) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.entries.iter_mut().find(|e| e.sequence == sequence) {
            entry.details = details;
        }
    }
}

fn compute_hash(entry: &AuditLogEntry) -> [u8; 32] {
    fn opt(hasher: &mut Sha256, value: Option<String>) {
        match value {
            Some(v) => {
                hasher.update([1]);
                hasher.update(v.as_bytes());
            }
            None => hasher.update([0]),
        }
        hasher.update([0]);
    }

    let mut hasher = Sha256::new();
    hasher.update(entry.sequence.to_le_bytes());
    hasher.update(entry.id.0.to_bytes());
    hasher.update(entry.timestamp.timestamp_millis().to_le_bytes());
    hasher.update(entry.actor.as_bytes());
    hasher.update([0]);
    hasher.update(entry.operation.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(entry.outcome.as_str().as_bytes());
    hasher.update([0]);
    opt(&mut hasher, entry.change_set.map(|h| h.to_hex()));
    opt(&mut hasher, entry.token_id.map(|t| t.to_string()));
    opt(&mut hasher, entry.transaction_id.map(|t| t.to_string()));
    opt(&mut hasher, entry.snapshot_id.map(|s| s.to_string()));
    hasher.update(entry.details.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&s, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}
