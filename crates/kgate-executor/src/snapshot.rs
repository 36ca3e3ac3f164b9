//! Rollback snapshots
//!
//! A snapshot is written before the first mutation of a transaction and is
//! never modified afterwards. It only leaves the `Available` state by
//! expiring or by being consumed by a rollback.

use crate::cluster::Manifest;
use crate::error::SnapshotError;
use chrono::{DateTime, Utc};
use kgate_safety::{
    ResourceChange, ResourceQuantities, ResourceTarget, SharedClock, SnapshotId, TokenId,
    TransactionId, ValidationError,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Default snapshot retention
pub const DEFAULT_SNAPSHOT_RETENTION_DAYS: i64 = 7;

/// Pre-change state of one workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub target: ResourceTarget,
    /// Live manifest as read before mutation
    pub manifest: Manifest,
    /// Values in place before the change, limited to the changed fields
    pub original: ResourceQuantities,
    /// Values the change applies
    pub applied: ResourceQuantities,
}

impl ResourceSnapshot {
    /// Capture `change` against the live manifest.
    ///
    /// `original` holds live values only, so restoring it puts back
    /// exactly what was there.
    ///
    /// # Errors
    /// `FieldNotLive` if the workload does not set a field the change
    /// resizes.
    pub fn capture(change: &ResourceChange, manifest: Manifest) -> Result<Self, ValidationError> {
        let live = manifest.container_resources();
        if let Some(field) = change.proposed().fields().find(|f| live.raw(*f).is_none()) {
            return Err(ValidationError::FieldNotLive {
                target: change.target().to_string(),
                field,
            });
        }
        Ok(Self {
            target: change.target().clone(),
            original: live.restricted_to(change.proposed()),
            manifest,
            applied: *change.proposed(),
        })
    }
}

/// Patch that puts one workload back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversalOperation {
    pub target: ResourceTarget,
    pub restore: ResourceQuantities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotStatus {
    Available,
    Consumed,
    Expired,
}

/// Everything needed to undo one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackSnapshot {
    pub id: SnapshotId,
    pub transaction_id: TransactionId,
    pub token_id: TokenId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resources: Vec<ResourceSnapshot>,
    /// One reversal per resource, in forward order
    pub reversal: Vec<ReversalOperation>,
}

impl RollbackSnapshot {
    fn build(
        transaction_id: TransactionId,
        token_id: TokenId,
        resources: Vec<ResourceSnapshot>,
        created_at: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Self {
        let reversal = resources
            .iter()
            .map(|r| ReversalOperation {
                target: r.target.clone(),
                restore: r.original,
            })
            .collect();
        Self {
            id: SnapshotId::new(),
            transaction_id,
            token_id,
            created_at,
            expires_at: created_at + retention,
            resources,
            reversal,
        }
    }

    /// The change-set a rollback of this snapshot performs
    #[must_use]
    pub fn reversal_changes(&self) -> Vec<ResourceChange> {
        self.resources
            .iter()
            .map(|r| ResourceChange::new(r.target.clone(), r.original, r.applied).reversed())
            .collect()
    }

    /// Reversal for one workload
    #[must_use]
    pub fn reversal_for(&self, target: &ResourceTarget) -> Option<&ReversalOperation> {
        self.reversal.iter().find(|r| &r.target == target)
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct StoredSnapshot {
    snapshot: Arc<RollbackSnapshot>,
    consumed_at: Option<DateTime<Utc>>,
}

/// In-memory snapshot store with TTL retention
#[derive(Debug)]
pub struct SnapshotStore {
    snapshots: RwLock<HashMap<SnapshotId, StoredSnapshot>>,
    clock: SharedClock,
    retention: chrono::Duration,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(clock: SharedClock, retention: chrono::Duration) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            clock,
            retention,
        }
    }

    /// Store with the default seven-day retention
    #[must_use]
    pub fn with_default_retention(clock: SharedClock) -> Self {
        Self::new(clock, chrono::Duration::days(DEFAULT_SNAPSHOT_RETENTION_DAYS))
    }

    /// Build and store a snapshot
    pub fn create(
        &self,
        transaction_id: TransactionId,
        token_id: TokenId,
        resources: Vec<ResourceSnapshot>,
    ) -> Arc<RollbackSnapshot> {
        let snapshot = Arc::new(self.preview(transaction_id, token_id, resources));
        self.snapshots.write().insert(
            snapshot.id,
            StoredSnapshot {
                snapshot: Arc::clone(&snapshot),
                consumed_at: None,
            },
        );
        info!(
            snapshot_id = %snapshot.id,
            %transaction_id,
            resources = snapshot.resources.len(),
            "snapshot stored"
        );
        snapshot
    }

    /// Build a snapshot without storing it
    #[must_use]
    pub fn preview(
        &self,
        transaction_id: TransactionId,
        token_id: TokenId,
        resources: Vec<ResourceSnapshot>,
    ) -> RollbackSnapshot {
        RollbackSnapshot::build(
            transaction_id,
            token_id,
            resources,
            self.clock.now(),
            self.retention,
        )
    }

    /// Fetch a snapshot that is still available for rollback
    ///
    /// # Errors
    /// `NotFound`, `Expired` or `Consumed`.
    pub fn available(&self, id: SnapshotId) -> Result<Arc<RollbackSnapshot>, SnapshotError> {
        let now = self.clock.now();
        let snapshots = self.snapshots.read();
        let stored = snapshots.get(&id).ok_or(SnapshotError::NotFound(id))?;
        Self::check(stored, id, now)?;
        Ok(Arc::clone(&stored.snapshot))
    }

    /// Fetch regardless of status
    #[must_use]
    pub fn get(&self, id: SnapshotId) -> Option<Arc<RollbackSnapshot>> {
        self.snapshots.read().get(&id).map(|s| Arc::clone(&s.snapshot))
    }

    #[must_use]
    pub fn status(&self, id: SnapshotId) -> Option<SnapshotStatus> {
        let now = self.clock.now();
        self.snapshots.read().get(&id).map(|s| {
            if s.consumed_at.is_some() {
                SnapshotStatus::Consumed
            } else if s.snapshot.is_expired_at(now) {
                SnapshotStatus::Expired
            } else {
                SnapshotStatus::Available
            }
        })
    }

    /// Atomically mark a snapshot as used by a rollback
    ///
    /// # Errors
    /// `NotFound`, `Expired` or `Consumed`; a second consumer always fails.
    pub fn consume(&self, id: SnapshotId) -> Result<Arc<RollbackSnapshot>, SnapshotError> {
        let now = self.clock.now();
        let mut snapshots = self.snapshots.write();
        let stored = snapshots.get_mut(&id).ok_or(SnapshotError::NotFound(id))?;
        Self::check(stored, id, now)?;
        stored.consumed_at = Some(now);
        debug!(snapshot_id = %id, "snapshot consumed");
        Ok(Arc::clone(&stored.snapshot))
    }

    fn check(stored: &StoredSnapshot, id: SnapshotId, now: DateTime<Utc>) -> Result<(), SnapshotError> {
        if stored.consumed_at.is_some() {
            Err(SnapshotError::Consumed(id))
        } else if stored.snapshot.is_expired_at(now) {
            Err(SnapshotError::Expired(id))
        } else {
            Ok(())
        }
    }

    /// Drop snapshots past their retention; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut snapshots = self.snapshots.write();
        let before = snapshots.len();
        snapshots.retain(|_, s| !s.snapshot.is_expired_at(now));
        let removed = before - snapshots.len();
        if removed > 0 {
            info!(removed, "expired snapshots purged");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}
