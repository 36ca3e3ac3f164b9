//! Per-stage transactions
//!
//! A transaction applies one stage. Authorization and the rollback
//! snapshot both happen in [`TransactionCoordinator::begin`]; nothing is
//! patched until `begin` has returned.

use crate::cluster::{ClusterClient, CommandErrorKind, ExternalCommandError, PatchMode};
use crate::error::ExecutionError;
use crate::rollout::Stage;
use crate::snapshot::{ResourceSnapshot, RollbackSnapshot, SnapshotStore};
use crate::timing::TimingPolicy;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use kgate_safety::{
    validate_change_set, AuditLog, AuditOperation, AuditOutcome, AuditRecord, ChangeSetHash,
    ConfirmationManager, ConfirmationToken, InvalidTokenError, ResourceChange, ResourceTarget,
    SharedClock, SnapshotId, TokenId, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happens to a stage after one of its operations fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching and undo what was applied
    #[default]
    AbortAndRollback,
    /// Keep going and report the failures
    BestEffort,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Apply,
    DryRun,
}

impl ExecutionMode {
    #[inline]
    #[must_use]
    pub fn patch_mode(self) -> PatchMode {
        match self {
            Self::Apply => PatchMode::Apply,
            Self::DryRun => PatchMode::Simulate,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_dry_run(self) -> bool {
        self == Self::DryRun
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::DryRun => "dry_run",
        }
    }
}

/// Coordinator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Operations in flight at once within a stage
    pub max_concurrency: usize,
    /// Retries of a transient command failure
    pub max_retries: u32,
    pub failure_policy: FailurePolicy,
}

impl ExecutionConfig {
    #[inline]
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_retries: 2,
            failure_policy: FailurePolicy::AbortAndRollback,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Applied,
    Failed,
    RolledBack,
}

/// One resource patch inside a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub change: ResourceChange,
    pub status: OperationStatus,
    pub attempts: u32,
    pub last_error: Option<ExternalCommandError>,
    /// Position in application order, once applied
    pub applied_seq: Option<u64>,
}

impl Operation {
    fn pending(change: ResourceChange) -> Self {
        Self {
            change,
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
            applied_seq: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn target(&self) -> &ResourceTarget {
        self.change.target()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Running,
    Committed,
    RolledBack,
    PartiallyFailed,
}

/// One stage being applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTransaction {
    pub id: TransactionId,
    pub token_id: TokenId,
    pub stage_index: usize,
    pub cluster: String,
    pub namespace: String,
    pub mode: ExecutionMode,
    pub operations: Vec<Operation>,
    pub status: TransactionStatus,
    pub snapshot: Arc<RollbackSnapshot>,
    /// False for dry runs, whose snapshot is diagnostic only
    pub snapshot_stored: bool,
    pub rollback_errors: Vec<ExternalCommandError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionTransaction {
    /// Id of the stored snapshot, if any
    #[must_use]
    pub fn snapshot_id(&self) -> Option<SnapshotId> {
        self.snapshot_stored.then_some(self.snapshot.id)
    }

    pub fn operations_with(&self, status: OperationStatus) -> impl Iterator<Item = &Operation> {
        self.operations.iter().filter(move |op| op.status == status)
    }

    #[must_use]
    pub fn count(&self, status: OperationStatus) -> usize {
        self.operations_with(status).count()
    }

    /// Whether any mutation of this transaction is still in place
    #[must_use]
    pub fn has_applied(&self) -> bool {
        self.count(OperationStatus::Applied) > 0
    }

    #[must_use]
    pub fn first_error(&self) -> Option<&ExternalCommandError> {
        self.operations.iter().find_map(|op| op.last_error.as_ref())
    }
}

/// Authorization a rollout carries from stage to stage.
///
/// Starts unconsumed; the first stage consumes the token (or only verifies
/// it for a dry run) and later stages reuse the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenGrant {
    Unconsumed {
        token_id: TokenId,
        change_set: ChangeSetHash,
    },
    Consumed(ConfirmationToken),
    Verified(ConfirmationToken),
}

impl TokenGrant {
    #[must_use]
    pub fn pending(token_id: TokenId, change_set: ChangeSetHash) -> Self {
        Self::Unconsumed {
            token_id,
            change_set,
        }
    }

    #[must_use]
    pub fn token_id(&self) -> TokenId {
        match self {
            Self::Unconsumed { token_id, .. } => *token_id,
            Self::Consumed(token) | Self::Verified(token) => token.id,
        }
    }

    #[must_use]
    pub fn is_consumed(&self) -> bool {
        matches!(self, Self::Consumed(_))
    }
}

/// Outcome of applying a snapshot's reversal operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub snapshot_id: SnapshotId,
    pub mode: ExecutionMode,
    pub restored: Vec<ResourceTarget>,
    pub failed: Vec<ExternalCommandError>,
}

impl RestoreReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Dispatch {
    Skipped,
    Applied { attempts: u32, seq: u64 },
    Failed { attempts: u32, error: ExternalCommandError },
}

/// Applies stages as all-or-nothing units
pub struct TransactionCoordinator {
    cluster: Arc<dyn ClusterClient>,
    confirmations: Arc<ConfirmationManager>,
    snapshots: Arc<SnapshotStore>,
    audit: Arc<AuditLog>,
    clock: SharedClock,
    timing: TimingPolicy,
    config: ExecutionConfig,
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("timing", &self.timing)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransactionCoordinator {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        confirmations: Arc<ConfirmationManager>,
        snapshots: Arc<SnapshotStore>,
        audit: Arc<AuditLog>,
        clock: SharedClock,
    ) -> Self {
        Self {
            cluster,
            confirmations,
            snapshots,
            audit,
            clock,
            timing: TimingPolicy::default(),
            config: ExecutionConfig::default(),
        }
    }

    #[must_use]
    pub fn with_timing(mut self, timing: TimingPolicy) -> Self {
        self.timing = timing;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn timing(&self) -> &TimingPolicy {
        &self.timing
    }

    #[must_use]
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Current time on the coordinator's clock
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn concurrency(&self) -> usize {
        self.config.max_concurrency.max(1)
    }

    fn authorize(
        &self,
        grant: &mut TokenGrant,
        mode: ExecutionMode,
    ) -> Result<TokenId, InvalidTokenError> {
        let (token_id, change_set) = match grant {
            TokenGrant::Consumed(token) => return Ok(token.id),
            TokenGrant::Verified(token) if mode.is_dry_run() => return Ok(token.id),
            TokenGrant::Verified(token) => (token.id, token.change_set_hash),
            TokenGrant::Unconsumed {
                token_id,
                change_set,
            } => (*token_id, *change_set),
        };
        *grant = match mode {
            ExecutionMode::Apply => {
                TokenGrant::Consumed(self.confirmations.consume(token_id, change_set)?)
            }
            ExecutionMode::DryRun => {
                TokenGrant::Verified(self.confirmations.verify(token_id, change_set)?)
            }
        };
        Ok(token_id)
    }

    /// Whether `authorize` would succeed, without consuming or auditing
    fn grant_usable(&self, grant: &TokenGrant, mode: ExecutionMode) -> bool {
        match grant {
            TokenGrant::Consumed(_) => true,
            TokenGrant::Verified(_) if mode.is_dry_run() => true,
            TokenGrant::Verified(token) => {
                self.confirmations.is_consumable(token.id, token.change_set_hash)
            }
            TokenGrant::Unconsumed {
                token_id,
                change_set,
            } => self.confirmations.is_consumable(*token_id, *change_set),
        }
    }

    async fn capture_one(&self, change: &ResourceChange) -> Result<ResourceSnapshot, ExecutionError> {
        let target = change.target();
        let (_, read) = self
            .retrying("read", target, || self.cluster.read(target))
            .await;
        let manifest = read.map_err(|source| ExecutionError::SnapshotRead {
            target: target.to_string(),
            source,
        })?;
        let snapshot = ResourceSnapshot::capture(change, manifest)?;
        let declared = change.current().restricted_to(change.proposed());
        if !snapshot.original.satisfies(&declared) {
            warn!(
                %target,
                declared = ?declared,
                live = ?snapshot.original,
                "live resources drifted from declared current values"
            );
        }
        Ok(snapshot)
    }

    /// Read live state, authorize, and write the rollback snapshot.
    ///
    /// The token is checked up front without side effects and only
    /// consumed once every live read has succeeded, so a failed read
    /// leaves it usable for a retry.
    ///
    /// # Errors
    /// `InvalidToken` if the grant cannot be used, `Validation` for a
    /// malformed stage or a resized field the live workload does not set,
    /// `SnapshotRead` if any live read fails. In every case nothing has
    /// been patched.
    pub async fn begin(
        &self,
        stage: &Stage,
        grant: &mut TokenGrant,
        mode: ExecutionMode,
    ) -> Result<ExecutionTransaction, ExecutionError> {
        validate_change_set(&stage.changes)?;
        if !self.grant_usable(grant, mode) {
            self.authorize(grant, mode)?;
        }

        let transaction_id = TransactionId::new();
        let captures: Vec<_> = stage.changes.iter().map(|change| self.capture_one(change)).collect();
        let captured = stream::iter(captures)
            .buffered(self.concurrency())
            .try_collect::<Vec<_>>()
            .await;

        let resources = match captured {
            Ok(resources) => resources,
            Err(e) => {
                error!(%transaction_id, stage = stage.index, error = %e, "transaction not started");
                self.audit.append(
                    AuditRecord::new(AuditOperation::Transaction, AuditOutcome::Failure)
                        .with_token(grant.token_id())
                        .with_transaction(transaction_id)
                        .with_details(serde_json::json!({
                            "phase": "begin",
                            "stage": stage.index,
                            "namespace": stage.namespace,
                            "error": e.to_string(),
                        })),
                );
                return Err(e);
            }
        };
        let token_id = self.authorize(grant, mode)?;

        let (snapshot, snapshot_stored) = match mode {
            ExecutionMode::Apply => (self.snapshots.create(transaction_id, token_id, resources), true),
            ExecutionMode::DryRun => (
                Arc::new(self.snapshots.preview(transaction_id, token_id, resources)),
                false,
            ),
        };

        let mut record = AuditRecord::new(AuditOperation::Transaction, AuditOutcome::Success)
            .with_token(token_id)
            .with_transaction(transaction_id)
            .with_details(serde_json::json!({
                "phase": "begin",
                "stage": stage.index,
                "cluster": stage.cluster,
                "namespace": stage.namespace,
                "mode": mode,
                "resources": stage.changes.len(),
            }));
        if snapshot_stored {
            record = record.with_snapshot(snapshot.id);
        }
        self.audit.append(record);
        info!(
            %transaction_id,
            stage = stage.index,
            namespace = %stage.namespace,
            mode = mode.as_str(),
            "transaction started"
        );

        Ok(ExecutionTransaction {
            id: transaction_id,
            token_id,
            stage_index: stage.index,
            cluster: stage.cluster.clone(),
            namespace: stage.namespace.clone(),
            mode,
            operations: stage.changes.iter().cloned().map(Operation::pending).collect(),
            status: TransactionStatus::Running,
            snapshot,
            snapshot_stored,
            rollback_errors: Vec::new(),
            started_at: self.clock.now(),
            finished_at: None,
        })
    }

    /// Apply every operation of a started transaction.
    ///
    /// Runs with bounded concurrency. Under `AbortAndRollback` the first
    /// failure stops further dispatch and applied operations are undone in
    /// reverse application order. In dry-run mode the same flow runs with
    /// simulated patches.
    pub async fn apply(&self, tx: &mut ExecutionTransaction) {
        let patch_mode = tx.mode.patch_mode();
        let abort_on_failure = self.config.failure_policy == FailurePolicy::AbortAndRollback;
        let abort = AtomicBool::new(false);
        let sequence = AtomicU64::new(0);

        let work: Vec<(usize, ResourceChange)> = tx
            .operations
            .iter()
            .enumerate()
            .map(|(index, op)| (index, op.change.clone()))
            .collect();

        let outcomes: Vec<(usize, Dispatch)> = stream::iter(work)
            .map(|(index, change)| {
                let abort = &abort;
                let sequence = &sequence;
                async move {
                    if abort.load(Ordering::SeqCst) {
                        return (index, Dispatch::Skipped);
                    }
                    let target = change.target();
                    let (attempts, result) = self
                        .retrying("patch", target, || {
                            self.cluster.patch(target, change.proposed(), patch_mode)
                        })
                        .await;
                    match result {
                        Ok(()) => {
                            let seq = sequence.fetch_add(1, Ordering::SeqCst);
                            debug!(%target, attempts, seq, "operation applied");
                            (index, Dispatch::Applied { attempts, seq })
                        }
                        Err(error) => {
                            if abort_on_failure {
                                abort.store(true, Ordering::SeqCst);
                            }
                            error!(%target, attempts, error = %error, "operation failed");
                            (index, Dispatch::Failed { attempts, error })
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        for (index, outcome) in outcomes {
            let Some(op) = tx.operations.get_mut(index) else {
                continue;
            };
            match outcome {
                Dispatch::Skipped => {}
                Dispatch::Applied { attempts, seq } => {
                    op.status = OperationStatus::Applied;
                    op.attempts = attempts;
                    op.applied_seq = Some(seq);
                }
                Dispatch::Failed { attempts, error } => {
                    op.status = OperationStatus::Failed;
                    op.attempts = attempts;
                    op.last_error = Some(error);
                }
            }
        }

        let failed = tx.count(OperationStatus::Failed);
        tx.status = if failed == 0 {
            TransactionStatus::Committed
        } else if abort_on_failure {
            self.reverse_applied(tx).await;
            if tx.rollback_errors.is_empty() {
                TransactionStatus::RolledBack
            } else {
                TransactionStatus::PartiallyFailed
            }
        } else {
            TransactionStatus::PartiallyFailed
        };
        tx.finished_at = Some(self.clock.now());

        let outcome = if tx.status == TransactionStatus::Committed {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.audit
            .append(self.transaction_record(tx, AuditOperation::Transaction, outcome, "apply"));
        info!(
            transaction_id = %tx.id,
            status = ?tx.status,
            applied = tx.count(OperationStatus::Applied),
            failed,
            rolled_back = tx.count(OperationStatus::RolledBack),
            "transaction finished"
        );
    }

    /// Undo a committed transaction from its snapshot
    pub async fn rollback_transaction(&self, tx: &mut ExecutionTransaction) {
        self.reverse_applied(tx).await;
        tx.status = if tx.rollback_errors.is_empty() {
            TransactionStatus::RolledBack
        } else {
            TransactionStatus::PartiallyFailed
        };
        tx.finished_at = Some(self.clock.now());
        let outcome = if tx.rollback_errors.is_empty() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.audit
            .append(self.transaction_record(tx, AuditOperation::Rollback, outcome, "rollback"));
        warn!(transaction_id = %tx.id, status = ?tx.status, "transaction rolled back");
    }

    /// Apply all reversal operations of `snapshot`, last resource first
    pub async fn restore(&self, snapshot: &RollbackSnapshot, mode: ExecutionMode) -> RestoreReport {
        let patch_mode = mode.patch_mode();
        let mut report = RestoreReport {
            snapshot_id: snapshot.id,
            mode,
            restored: Vec::new(),
            failed: Vec::new(),
        };
        for reversal in snapshot.reversal.iter().rev() {
            let target = &reversal.target;
            let (_, result) = self
                .retrying("restore", target, || {
                    self.cluster.patch(target, &reversal.restore, patch_mode)
                })
                .await;
            match result {
                Ok(()) => report.restored.push(target.clone()),
                Err(e) => {
                    error!(%target, error = %e, "restore failed");
                    report.failed.push(e);
                }
            }
        }
        info!(
            snapshot_id = %snapshot.id,
            restored = report.restored.len(),
            failed = report.failed.len(),
            "snapshot restored"
        );
        report
    }

    async fn reverse_applied(&self, tx: &mut ExecutionTransaction) {
        let snapshot = Arc::clone(&tx.snapshot);
        let patch_mode = tx.mode.patch_mode();
        let mut applied: Vec<(u64, usize)> = tx
            .operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.status == OperationStatus::Applied)
            .map(|(index, op)| (op.applied_seq.unwrap_or_default(), index))
            .collect();
        applied.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        for (_, index) in applied {
            let Some(op) = tx.operations.get_mut(index) else {
                continue;
            };
            let target = op.change.target().clone();
            let Some(reversal) = snapshot.reversal_for(&target) else {
                tx.rollback_errors.push(ExternalCommandError::new(
                    CommandErrorKind::Failed,
                    "rollback",
                    &target,
                    "no reversal recorded for resource",
                ));
                continue;
            };
            let (_, result) = self
                .retrying("rollback", &target, || {
                    self.cluster.patch(&target, &reversal.restore, patch_mode)
                })
                .await;
            match result {
                Ok(()) => {
                    op.status = OperationStatus::RolledBack;
                    debug!(%target, "operation rolled back");
                }
                Err(e) => {
                    error!(%target, error = %e, "rollback of operation failed");
                    tx.rollback_errors.push(e);
                }
            }
        }
    }

    fn transaction_record(
        &self,
        tx: &ExecutionTransaction,
        operation: AuditOperation,
        outcome: AuditOutcome,
        phase: &str,
    ) -> AuditRecord {
        let operations: Vec<_> = tx
            .operations
            .iter()
            .map(|op| {
                serde_json::json!({
                    "target": op.target().to_string(),
                    "status": op.status,
                    "attempts": op.attempts,
                    "error": op.last_error.as_ref().map(ToString::to_string),
                })
            })
            .collect();
        let mut record = AuditRecord::new(operation, outcome)
            .with_token(tx.token_id)
            .with_transaction(tx.id)
            .with_details(serde_json::json!({
                "phase": phase,
                "stage": tx.stage_index,
                "namespace": tx.namespace,
                "mode": tx.mode,
                "status": tx.status,
                "operations": operations,
                "rollback_errors": tx.rollback_errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }));
        if let Some(snapshot_id) = tx.snapshot_id() {
            record = record.with_snapshot(snapshot_id);
        }
        record
    }

    /// Run a cluster command under the command timeout, retrying transient
    /// failures with exponential backoff. Returns the attempts made.
    async fn retrying<T, F, Fut>(
        &self,
        operation: &'static str,
        target: &ResourceTarget,
        mut call: F,
    ) -> (u32, Result<T, ExternalCommandError>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExternalCommandError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timing.command_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ExternalCommandError::new(
                    CommandErrorKind::Timeout,
                    operation,
                    target,
                    format!(
                        "no response within {}ms",
                        self.timing.command_timeout.as_millis()
                    ),
                )),
            };
            match result {
                Err(e) if e.is_transient() && attempt <= self.config.max_retries => {
                    let backoff = self.timing.backoff(attempt);
                    warn!(%target, operation, attempt, error = %e, ?backoff, "transient failure, retrying");
                    tokio::time::sleep(backoff).await;
                }
                other => return (attempt, other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InstanceStatus, Manifest, MockCluster};
    use kgate_safety::{
        AuditFilter, ConfirmationConfig, CpuQuantity, ManualClock, ResourceQuantities, RiskLevel,
        TokenRejection, TokenStatus, ValidationError,
    };
    use pretty_assertions::assert_eq;

    mockall::mock! {
        pub Kube {}

        #[async_trait::async_trait]
        impl ClusterClient for Kube {
            async fn read(&self, target: &ResourceTarget) -> Result<Manifest, ExternalCommandError>;
            async fn patch(
                &self,
                target: &ResourceTarget,
                desired: &ResourceQuantities,
                mode: PatchMode,
            ) -> Result<(), ExternalCommandError>;
            async fn instances(
                &self,
                target: &ResourceTarget,
            ) -> Result<Vec<InstanceStatus>, ExternalCommandError>;
        }
    }

    fn cpu(m: u64) -> ResourceQuantities {
        ResourceQuantities::new().with_cpu_request(CpuQuantity::from_millicores(m))
    }

    fn change(name: &str) -> ResourceChange {
        ResourceChange::new(
            ResourceTarget::deployment("c1", "apps", name),
            cpu(100),
            cpu(200),
        )
    }

    struct Harness {
        coordinator: TransactionCoordinator,
        confirmations: Arc<ConfirmationManager>,
        snapshots: Arc<SnapshotStore>,
        audit: Arc<AuditLog>,
    }

    fn harness(cluster: Arc<dyn ClusterClient>, config: ExecutionConfig) -> Harness {
        let clock: SharedClock = Arc::new(ManualClock::starting_now());
        let audit = Arc::new(AuditLog::new(clock.clone(), chrono::Duration::days(90)));
        let confirmations = Arc::new(ConfirmationManager::new(
            ConfirmationConfig::default(),
            clock.clone(),
            audit.clone(),
        ));
        let snapshots = Arc::new(SnapshotStore::with_default_retention(clock.clone()));
        let coordinator = TransactionCoordinator::new(
            cluster,
            confirmations.clone(),
            snapshots.clone(),
            audit.clone(),
            clock,
        )
        .with_timing(TimingPolicy::immediate())
        .with_config(config);
        Harness {
            coordinator,
            confirmations,
            snapshots,
            audit,
        }
    }

    impl Harness {
        fn confirmed_grant(&self, changes: &[ResourceChange]) -> TokenGrant {
            let token = self
                .confirmations
                .request_confirmation(changes, RiskLevel::Low)
                .unwrap()
                .token;
            self.confirmations.confirm(token.id).unwrap();
            TokenGrant::pending(token.id, ChangeSetHash::of(changes))
        }
    }

    fn sequential() -> ExecutionConfig {
        ExecutionConfig::default().with_max_concurrency(1)
    }

    #[tokio::test]
    async fn commits_when_every_patch_lands() {
        let changes = vec![change("a"), change("b")];
        let cluster = Arc::new(MockCluster::seeded(&changes));
        let h = harness(cluster.clone(), ExecutionConfig::default());
        let mut grant = h.confirmed_grant(&changes);

        let mut tx = h
            .coordinator
            .begin(&Stage::new(0, changes.clone()), &mut grant, ExecutionMode::Apply)
            .await
            .unwrap();
        assert!(grant.is_consumed());
        assert!(tx.snapshot_stored);
        assert_eq!(h.snapshots.len(), 1);

        h.coordinator.apply(&mut tx).await;
        assert_eq!(tx.status, TransactionStatus::Committed);
        assert_eq!(tx.count(OperationStatus::Applied), 2);
        for c in &changes {
            assert_eq!(cluster.quantities(c.target()), Some(cpu(200)));
        }
        assert!(h.audit.verify_integrity().is_ok());
    }

    #[tokio::test]
    async fn abort_restores_snapshot_state_and_skips_the_rest() {
        let changes = vec![change("a"), change("b"), change("c")];
        let cluster = Arc::new(MockCluster::seeded(&changes));
        cluster.fail_patches(changes[1].target(), CommandErrorKind::Rejected);
        let h = harness(cluster.clone(), sequential());
        let mut grant = h.confirmed_grant(&changes);

        let mut tx = h
            .coordinator
            .begin(&Stage::new(0, changes.clone()), &mut grant, ExecutionMode::Apply)
            .await
            .unwrap();
        h.coordinator.apply(&mut tx).await;

        assert_eq!(tx.status, TransactionStatus::RolledBack);
        let statuses: Vec<_> = tx.operations.iter().map(|op| op.status).collect();
        assert_eq!(
            statuses,
            vec![
                OperationStatus::RolledBack,
                OperationStatus::Failed,
                OperationStatus::Pending
            ]
        );
        for c in &changes {
            assert_eq!(cluster.quantities(c.target()), Some(cpu(100)));
        }
        // a applied, b rejected, a restored; c never sent
        assert_eq!(cluster.patches().len(), 3);
    }

    #[tokio::test]
    async fn best_effort_keeps_going() {
        let changes = vec![change("a"), change("b"), change("c")];
        let cluster = Arc::new(MockCluster::seeded(&changes));
        cluster.fail_patches(changes[0].target(), CommandErrorKind::Forbidden);
        let h = harness(
            cluster.clone(),
            sequential().with_failure_policy(FailurePolicy::BestEffort),
        );
        let mut grant = h.confirmed_grant(&changes);

        let mut tx = h
            .coordinator
            .begin(&Stage::new(0, changes.clone()), &mut grant, ExecutionMode::Apply)
            .await
            .unwrap();
        h.coordinator.apply(&mut tx).await;

        assert_eq!(tx.status, TransactionStatus::PartiallyFailed);
        assert_eq!(tx.count(OperationStatus::Applied), 2);
        assert_eq!(tx.count(OperationStatus::Failed), 1);
        assert_eq!(
            tx.first_error().map(|e| e.kind),
            Some(CommandErrorKind::Forbidden)
        );
        assert_eq!(cluster.quantities(changes[2].target()), Some(cpu(200)));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_rolled_back() {
        let changes = vec![change("a"), change("b")];
        let mut kube = MockKube::new();
        kube.expect_read()
            .returning(|target| Ok(Manifest::deployment(target, &target.name, &cpu(100), 2, 2)));
        kube.expect_patch()
            .withf(|target, _, _| target.name == "a")
            .times(2)
            .returning(|_, _, _| Ok(()));
        kube.expect_patch()
            .withf(|target, _, _| target.name == "b")
            .times(3)
            .returning(|target, _, _| {
                Err(ExternalCommandError::new(
                    CommandErrorKind::Timeout,
                    "patch",
                    target,
                    "deadline exceeded",
                ))
            });
        let h = harness(Arc::new(kube), sequential());
        let mut grant = h.confirmed_grant(&changes);

        let mut tx = h
            .coordinator
            .begin(&Stage::new(0, changes), &mut grant, ExecutionMode::Apply)
            .await
            .unwrap();
        h.coordinator.apply(&mut tx).await;

        assert_eq!(tx.status, TransactionStatus::RolledBack);
        assert_eq!(tx.operations[0].status, OperationStatus::RolledBack);
        assert_eq!(tx.operations[1].status, OperationStatus::Failed);
        assert_eq!(tx.operations[1].attempts, 3);
    }

    #[tokio::test]
    async fn unconfirmed_token_never_touches_the_cluster() {
        let changes = vec![change("a")];
        let mut kube = MockKube::new();
        kube.expect_read().never();
        kube.expect_patch().never();
        let h = harness(Arc::new(kube), ExecutionConfig::default());
        let token = h
            .confirmations
            .request_confirmation(&changes, RiskLevel::Low)
            .unwrap()
            .token;
        let mut grant = TokenGrant::pending(token.id, ChangeSetHash::of(&changes));

        let err = h
            .coordinator
            .begin(&Stage::new(0, changes), &mut grant, ExecutionMode::Apply)
            .await
            .unwrap_err();
        match err {
            ExecutionError::InvalidToken(e) => assert_eq!(e.reason, TokenRejection::NotConfirmed),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!grant.is_consumed());
        assert!(h.snapshots.is_empty());
    }

    #[tokio::test]
    async fn read_failure_aborts_before_any_patch() {
        let changes = vec![change("a"), change("b")];
        let cluster = Arc::new(MockCluster::seeded(&changes));
        cluster.fail_reads(changes[1].target(), CommandErrorKind::NotFound);
        let h = harness(cluster.clone(), ExecutionConfig::default());
        let mut grant = h.confirmed_grant(&changes);

        let err = h
            .coordinator
            .begin(&Stage::new(0, changes), &mut grant, ExecutionMode::Apply)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::SnapshotRead { .. }));
        assert!(cluster.patches().is_empty());
        assert!(h.snapshots.is_empty());
        let failures = h.audit.query(
            &AuditFilter::new()
                .with_operation(AuditOperation::Transaction)
                .with_outcome(AuditOutcome::Failure),
        );
        assert_eq!(failures.len(), 1);

        // the confirmation survives for a retry
        assert!(!grant.is_consumed());
        assert_eq!(
            h.confirmations.token(grant.token_id()).map(|t| t.status),
            Some(TokenStatus::Confirmed)
        );
    }

    #[tokio::test]
    async fn field_missing_from_live_workload_is_refused() {
        let target = ResourceTarget::deployment("c1", "apps", "a");
        let changes = vec![ResourceChange::new(
            target.clone(),
            ResourceQuantities::new().with_cpu_limit(CpuQuantity::from_millicores(500)),
            ResourceQuantities::new().with_cpu_limit(CpuQuantity::from_millicores(600)),
        )];
        let cluster = Arc::new(MockCluster::new());
        cluster.insert(target.clone(), cpu(100));
        let h = harness(cluster.clone(), ExecutionConfig::default());
        let mut grant = h.confirmed_grant(&changes);

        let err = h
            .coordinator
            .begin(&Stage::new(0, changes), &mut grant, ExecutionMode::Apply)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Validation(ValidationError::FieldNotLive { .. })
        ));
        assert!(cluster.patches().is_empty());
        assert_eq!(cluster.quantities(&target), Some(cpu(100)));
        assert!(h.snapshots.is_empty());
        assert!(!grant.is_consumed());
    }

    #[tokio::test]
    async fn dry_run_simulates_and_keeps_token() {
        let changes = vec![change("a")];
        let cluster = Arc::new(MockCluster::seeded(&changes));
        let h = harness(cluster.clone(), ExecutionConfig::default());
        let mut grant = h.confirmed_grant(&changes);
        let token_id = grant.token_id();

        let mut tx = h
            .coordinator
            .begin(&Stage::new(0, changes.clone()), &mut grant, ExecutionMode::DryRun)
            .await
            .unwrap();
        h.coordinator.apply(&mut tx).await;

        assert_eq!(tx.status, TransactionStatus::Committed);
        assert!(!tx.snapshot_stored);
        assert_eq!(tx.snapshot_id(), None);
        assert!(h.snapshots.is_empty());
        assert_eq!(cluster.applied_patch_count(), 0);
        assert_eq!(cluster.quantities(changes[0].target()), Some(cpu(100)));
        assert_eq!(
            h.confirmations.token(token_id).map(|t| t.status),
            Some(TokenStatus::Confirmed)
        );
    }

    #[tokio::test]
    async fn restore_reverses_in_reverse_order() {
        let changes = vec![change("a"), change("b")];
        let cluster = Arc::new(MockCluster::seeded(&changes));
        let h = harness(cluster.clone(), ExecutionConfig::default());
        let mut grant = h.confirmed_grant(&changes);

        let mut tx = h
            .coordinator
            .begin(&Stage::new(0, changes.clone()), &mut grant, ExecutionMode::Apply)
            .await
            .unwrap();
        h.coordinator.apply(&mut tx).await;

        let report = h.coordinator.restore(&tx.snapshot, ExecutionMode::Apply).await;
        assert!(report.is_complete());
        assert_eq!(
            report.restored,
            vec![changes[1].target().clone(), changes[0].target().clone()]
        );
        for c in &changes {
            assert_eq!(cluster.quantities(c.target()), Some(cpu(100)));
        }
    }

    #[tokio::test]
    async fn rollback_of_committed_transaction() {
        let changes = vec![change("a")];
        let cluster = Arc::new(MockCluster::seeded(&changes));
        let h = harness(cluster.clone(), ExecutionConfig::default());
        let mut grant = h.confirmed_grant(&changes);

        let mut tx = h
            .coordinator
            .begin(&Stage::new(0, changes.clone()), &mut grant, ExecutionMode::Apply)
            .await
            .unwrap();
        h.coordinator.apply(&mut tx).await;
        h.coordinator.rollback_transaction(&mut tx).await;

        assert_eq!(tx.status, TransactionStatus::RolledBack);
        assert!(!tx.has_applied());
        assert_eq!(cluster.quantities(changes[0].target()), Some(cpu(100)));
        let rollbacks = h
            .audit
            .query(&AuditFilter::new().with_operation(AuditOperation::Rollback));
        assert_eq!(rollbacks.len(), 1);
    }
}
