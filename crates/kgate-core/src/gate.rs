//! The safety gate
//!
//! `SafetyGate` is the only way changes reach a cluster. It wires the
//! validator, confirmation manager, snapshot store, audit log, transaction
//! coordinator and rollout scheduler together and exposes the operations
//! callers use:
//! - `assess`: risk assessment, no side effects beyond the audit entry
//! - `request_confirmation` / `confirm`: token issue and approval
//! - `apply`: re-assess, then run the staged rollout under the token
//! - `rollback`: restore a snapshot under a token bound to the reversal
//! - `get_history`: audit queries
//! - `sweep`: retention housekeeping, also run by the background sweeper

use crate::config::{ClusterBackend, GateConfig};
use crate::error::{incomplete_restore, GateError};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use kgate_executor::{
    CancelHandle, CancelSignal, ClusterClient, ExecutionMode, ExecutionResult, KubectlCluster,
    MockCluster, PostExecutionValidator, RollbackSnapshot, RolloutStatus, SnapshotStatus,
    SnapshotStore, Stage, StagedRolloutScheduler, TimingPolicy, TokenGrant,
    TransactionCoordinator,
};
use kgate_safety::{
    AuditEntryId, AuditFilter, AuditLog, AuditLogEntry, AuditOperation, AuditOutcome,
    AuditRecord, ChangeSetHash, ConfirmationManager, ConfirmationRequest, ConfirmationToken,
    InvalidTokenError, ResourceChange, ResourceTarget, SafetyAssessment, SafetyValidator,
    SharedClock, SnapshotId, SystemClock, TokenId, TransactionId, WarningCode,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Input to `SafetyGate::apply`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// Confirmed token for exactly these changes
    pub token: Option<TokenId>,
    pub changes: Vec<ResourceChange>,
    /// Simulate only; the token is verified but not consumed
    #[serde(default)]
    pub dry_run: bool,
}

impl ApplyRequest {
    #[inline]
    #[must_use]
    pub fn new(changes: Vec<ResourceChange>) -> Self {
        Self {
            token: None,
            changes,
            dry_run: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_token(mut self, token: TokenId) -> Self {
        self.token = Some(token);
        self
    }

    #[inline]
    #[must_use]
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    fn mode(&self) -> ExecutionMode {
        if self.dry_run {
            ExecutionMode::DryRun
        } else {
            ExecutionMode::Apply
        }
    }
}

/// Outcome of a completed rollback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub snapshot_id: SnapshotId,
    pub token_id: TokenId,
    /// Transaction the snapshot was taken for
    pub transaction_id: TransactionId,
    /// Risk of the reversal itself; informational only
    pub assessment: SafetyAssessment,
    /// Restored workloads, in restore order
    pub restored: Vec<ResourceTarget>,
    pub audit_id: AuditEntryId,
    pub completed_at: DateTime<Utc>,
}

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub tokens_expired: usize,
    pub tokens_removed: usize,
    pub snapshots_removed: usize,
    pub audit_entries_purged: usize,
}

/// Builds a `SafetyGate` from configuration
pub struct GateBuilder {
    config: GateConfig,
    clock: Option<SharedClock>,
    cluster: Option<Arc<dyn ClusterClient>>,
    timing: Option<TimingPolicy>,
}

impl fmt::Debug for GateBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateBuilder")
            .field("config", &self.config)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl GateBuilder {
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            clock: None,
            cluster: None,
            timing: None,
        }
    }

    /// Time source for tokens, snapshots and audit entries
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use this cluster instead of the configured backend
    #[must_use]
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Use this timing instead of the configured preset
    #[must_use]
    pub fn with_timing(mut self, timing: TimingPolicy) -> Self {
        self.timing = Some(timing);
        self
    }

    /// # Errors
    /// Returns `GateError::Config` if the configuration does not validate.
    pub fn build(self) -> Result<SafetyGate, GateError> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let timing = self.timing.unwrap_or_else(|| config.timing.policy());
        let cluster: Arc<dyn ClusterClient> = match self.cluster {
            Some(cluster) => cluster,
            None => match config.cluster.backend {
                ClusterBackend::Mock => Arc::new(MockCluster::new()),
                ClusterBackend::Kubectl => Arc::new(
                    KubectlCluster::new(
                        config.cluster.kubectl_binary.clone(),
                        timing.command_timeout,
                    )
                    .with_context_from_cluster(config.cluster.context_from_cluster),
                ),
            },
        };

        let safety = Arc::new(
            SafetyValidator::new(config.safety.clone()).map_err(crate::ConfigError::from)?,
        );
        let audit = Arc::new(
            AuditLog::new(clock.clone(), config.retention.audit_retention())
                .with_default_actor(config.actor.clone()),
        );
        let confirmations = Arc::new(ConfirmationManager::new(
            config.confirmation.clone(),
            clock.clone(),
            audit.clone(),
        ));
        let snapshots = Arc::new(SnapshotStore::new(
            clock.clone(),
            config.retention.snapshot_retention(),
        ));
        let coordinator = Arc::new(
            TransactionCoordinator::new(
                cluster.clone(),
                confirmations.clone(),
                snapshots.clone(),
                audit.clone(),
                clock.clone(),
            )
            .with_timing(timing)
            .with_config(config.execution.clone()),
        );
        let validator = Arc::new(
            PostExecutionValidator::new(cluster, timing).with_thresholds(config.validation),
        );
        let scheduler = StagedRolloutScheduler::new(
            coordinator.clone(),
            validator,
            safety.clone(),
            audit.clone(),
        )
        .with_config(config.rollout.clone());

        info!(
            actor = %config.actor,
            backend = ?config.cluster.backend,
            "safety gate ready"
        );
        Ok(SafetyGate {
            config,
            clock,
            safety,
            confirmations,
            snapshots,
            audit,
            coordinator,
            scheduler,
        })
    }
}

/// Mediates every change between recommendation and cluster
pub struct SafetyGate {
    config: GateConfig,
    clock: SharedClock,
    safety: Arc<SafetyValidator>,
    confirmations: Arc<ConfirmationManager>,
    snapshots: Arc<SnapshotStore>,
    audit: Arc<AuditLog>,
    coordinator: Arc<TransactionCoordinator>,
    scheduler: StagedRolloutScheduler,
}

impl fmt::Debug for SafetyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafetyGate")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl SafetyGate {
    #[must_use]
    pub fn builder(config: GateConfig) -> GateBuilder {
        GateBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Assess `changes` without issuing anything
    ///
    /// # Errors
    /// Returns `GateError::Validation` for a malformed change-set.
    pub fn assess(&self, changes: &[ResourceChange]) -> Result<SafetyAssessment, GateError> {
        let assessment = self.evaluate(AuditOperation::Assess, changes)?;
        self.audit.append(
            AuditRecord::new(AuditOperation::Assess, AuditOutcome::Success)
                .with_change_set(ChangeSetHash::of(changes))
                .with_details(json!({
                    "risk_level": assessment.risk_level,
                    "blocked": assessment.blocked,
                    "resources": assessment.resources_affected,
                    "warnings": assessment.warnings.iter().map(|w| w.code).collect::<Vec<_>>(),
                })),
        );
        info!(
            risk = %assessment.risk_level,
            blocked = assessment.blocked,
            resources = assessment.resources_affected,
            "change-set assessed"
        );
        Ok(assessment)
    }

    /// Split `changes` into the stages a rollout would run
    ///
    /// # Errors
    /// Returns `GateError::Validation` for a malformed change-set.
    pub fn plan(&self, changes: &[ResourceChange]) -> Result<Vec<Stage>, GateError> {
        Ok(self.scheduler.plan(changes)?)
    }

    /// Issue a confirmation token for `changes`
    ///
    /// # Errors
    /// `Validation` for a malformed change-set, `SafetyViolation` if it is
    /// blocked.
    pub fn request_confirmation(
        &self,
        changes: &[ResourceChange],
    ) -> Result<ConfirmationRequest, GateError> {
        let assessment = self.evaluate(AuditOperation::RequestConfirmation, changes)?;
        self.refuse_blocked(AuditOperation::RequestConfirmation, changes, &assessment, None)?;
        Ok(self
            .confirmations
            .request_confirmation_for(changes, &assessment)?)
    }

    /// Approve a pending token
    ///
    /// # Errors
    /// Returns `InvalidToken` if the token is unknown, expired or not pending.
    pub fn confirm(&self, token_id: TokenId) -> Result<ConfirmationToken, GateError> {
        Ok(self
            .confirmations
            .confirm_by(token_id, Some(self.config.actor.as_str()))?)
    }

    #[must_use]
    pub fn token(&self, token_id: TokenId) -> Option<ConfirmationToken> {
        self.confirmations.token(token_id)
    }

    /// Apply a confirmed change-set
    ///
    /// # Errors
    /// See [`SafetyGate::apply_with_cancel`].
    pub async fn apply(&self, request: ApplyRequest) -> Result<ExecutionResult, GateError> {
        self.apply_with_cancel(request, &CancelSignal::never()).await
    }

    /// Apply a confirmed change-set, stopping between stages on cancel.
    ///
    /// The change-set is re-assessed first: a blocked change-set is refused
    /// whatever token accompanies it. A rollout that runs but does not
    /// complete is still `Ok`; inspect `ExecutionResult::status` or use
    /// [`GateError::from_rollout`].
    ///
    /// # Errors
    /// `Validation`, `SafetyViolation` or `InvalidToken` before anything is
    /// dispatched; `ExternalCommand` if the first snapshot cannot be read;
    /// `Internal` if the rollout panics.
    pub async fn apply_with_cancel(
        &self,
        request: ApplyRequest,
        cancel: &CancelSignal,
    ) -> Result<ExecutionResult, GateError> {
        let mode = request.mode();
        let operation = if mode.is_dry_run() {
            AuditOperation::DryRun
        } else {
            AuditOperation::Apply
        };
        let changes = &request.changes;
        let assessment = self.evaluate(operation, changes)?;
        self.refuse_blocked(operation, changes, &assessment, request.token)?;

        let hash = ChangeSetHash::of(changes);
        let Some(token_id) = request.token else {
            let err = InvalidTokenError::missing();
            self.reject(operation, hash, None, err.reason.code());
            warn!(mode = mode.as_str(), "apply refused without a token");
            return Err(err.into());
        };

        let stages = self.scheduler.plan(changes)?;
        info!(
            %token_id,
            mode = mode.as_str(),
            stages = stages.len(),
            risk = %assessment.risk_level,
            "rollout starting"
        );
        let grant = TokenGrant::pending(token_id, hash);
        let run = AssertUnwindSafe(self.scheduler.run(&stages, grant, mode, cancel))
            .catch_unwind()
            .await;

        let result = match run {
            Err(panic) => return Err(self.internal(operation, Some(token_id), panic.as_ref())),
            Ok(Err(err)) => {
                let err = GateError::from(err);
                self.reject(operation, hash, Some(token_id), &err.code());
                return Err(err);
            }
            Ok(Ok(result)) => result,
        };

        let outcome = if result.status == RolloutStatus::Completed {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.audit.append(
            AuditRecord::new(operation, outcome)
                .with_change_set(hash)
                .with_token(token_id)
                .with_details(json!({
                    "status": result.status,
                    "stages": result.stage_statuses(),
                    "snapshot_ids": result.snapshot_ids,
                    "risk_level": assessment.risk_level,
                })),
        );
        info!(
            %token_id,
            status = ?result.status,
            committed = result.committed_stages(),
            "rollout finished"
        );
        Ok(result)
    }

    /// Issue a token authorizing the rollback of `snapshot_id`.
    ///
    /// The token is bound to the reversal change-set. The reversal is
    /// assessed for the prompt but never blocked.
    ///
    /// # Errors
    /// `Snapshot` if the snapshot is missing, expired or used.
    pub fn request_rollback_confirmation(
        &self,
        snapshot_id: SnapshotId,
    ) -> Result<ConfirmationRequest, GateError> {
        let snapshot = self.snapshots.available(snapshot_id)?;
        let changes = snapshot.reversal_changes();
        let assessment = self.safety.assess(&changes)?;
        debug!(%snapshot_id, risk = %assessment.risk_level, "rollback confirmation requested");
        Ok(self
            .confirmations
            .request_confirmation_for(&changes, &assessment)?)
    }

    /// Restore `snapshot_id` under a token for its reversal change-set.
    ///
    /// The snapshot is spent even if some reversals fail.
    ///
    /// # Errors
    /// `InvalidToken` or `Snapshot` before anything is patched;
    /// `PartialFailure` if some workloads could not be restored;
    /// `Internal` if the restore panics.
    pub async fn rollback(
        &self,
        snapshot_id: SnapshotId,
        token: Option<TokenId>,
    ) -> Result<RollbackResult, GateError> {
        let Some(token_id) = token else {
            let err = InvalidTokenError::missing();
            self.audit.append(
                AuditRecord::new(AuditOperation::Rollback, AuditOutcome::Rejected)
                    .with_snapshot(snapshot_id)
                    .with_details(json!({ "code": err.reason.code() })),
            );
            return Err(err.into());
        };

        let snapshot = match self.snapshots.available(snapshot_id) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.audit.append(
                    AuditRecord::new(AuditOperation::Rollback, AuditOutcome::Rejected)
                        .with_snapshot(snapshot_id)
                        .with_token(token_id)
                        .with_details(json!({ "code": err.code() })),
                );
                warn!(%snapshot_id, error = %err, "rollback refused");
                return Err(err.into());
            }
        };
        let changes = snapshot.reversal_changes();
        let hash = ChangeSetHash::of(&changes);
        let assessment = self.safety.assess(&changes)?;

        self.confirmations.consume(token_id, hash)?;
        let snapshot = self.snapshots.consume(snapshot_id)?;

        let restore = AssertUnwindSafe(self.coordinator.restore(&snapshot, ExecutionMode::Apply))
            .catch_unwind()
            .await;
        let report = match restore {
            Ok(report) => report,
            Err(panic) => {
                return Err(self.internal(AuditOperation::Rollback, Some(token_id), panic.as_ref()))
            }
        };

        let outcome = if report.is_complete() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        let audit_id = self.audit.append(
            AuditRecord::new(AuditOperation::Rollback, outcome)
                .with_snapshot(snapshot_id)
                .with_token(token_id)
                .with_transaction(snapshot.transaction_id)
                .with_change_set(hash)
                .with_details(json!({
                    "restored": report.restored.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "failed": report.failed,
                    "risk_level": assessment.risk_level,
                })),
        );

        if !report.is_complete() {
            error!(%snapshot_id, failed = report.failed.len(), "rollback incomplete");
            return Err(incomplete_restore(
                snapshot_id,
                report.restored.len(),
                &report.failed,
            ));
        }
        info!(%snapshot_id, restored = report.restored.len(), "rollback complete");
        Ok(RollbackResult {
            snapshot_id,
            token_id,
            transaction_id: snapshot.transaction_id,
            assessment,
            restored: report.restored,
            audit_id,
            completed_at: self.clock.now(),
        })
    }

    #[must_use]
    pub fn snapshot(&self, snapshot_id: SnapshotId) -> Option<Arc<RollbackSnapshot>> {
        self.snapshots.get(snapshot_id)
    }

    #[must_use]
    pub fn snapshot_status(&self, snapshot_id: SnapshotId) -> Option<SnapshotStatus> {
        self.snapshots.status(snapshot_id)
    }

    /// Audit entries matching `filter`, newest first
    #[must_use]
    pub fn get_history(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        self.audit.query(filter)
    }

    /// Expire tokens and drop snapshots and audit entries past retention
    pub fn sweep(&self) -> SweepReport {
        let tokens = self.confirmations.sweep();
        let report = SweepReport {
            tokens_expired: tokens.expired,
            tokens_removed: tokens.removed,
            snapshots_removed: self.snapshots.sweep(),
            audit_entries_purged: self.audit.purge_expired(),
        };
        self.audit.append(
            AuditRecord::new(AuditOperation::Sweep, AuditOutcome::Success)
                .with_details(json!(report)),
        );
        debug!(?report, "sweep finished");
        report
    }

    /// Run `sweep` every `interval` until the handle is shut down
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let gate = Arc::clone(self);
        let (cancel, signal) = kgate_executor::cancellation();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = signal.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        gate.sweep();
                    }
                }
            }
            debug!("sweeper stopped");
        });
        info!(interval_secs = interval.as_secs(), "sweeper started");
        SweeperHandle { cancel, task }
    }

    fn evaluate(
        &self,
        operation: AuditOperation,
        changes: &[ResourceChange],
    ) -> Result<SafetyAssessment, GateError> {
        self.safety.assess(changes).map_err(|err| {
            self.reject(operation, ChangeSetHash::of(changes), None, err.code());
            warn!(operation = operation.as_str(), error = %err, "malformed change-set");
            GateError::from(err)
        })
    }

    fn refuse_blocked(
        &self,
        operation: AuditOperation,
        changes: &[ResourceChange],
        assessment: &SafetyAssessment,
        token: Option<TokenId>,
    ) -> Result<(), GateError> {
        if !assessment.blocked {
            return Ok(());
        }
        let triggers = assessment.blocking_triggers();
        let message = assessment
            .warnings
            .iter()
            .filter(|w| w.code == WarningCode::ChangeLimitExceeded)
            .map(|w| w.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let mut record = AuditRecord::new(operation, AuditOutcome::Rejected)
            .with_change_set(ChangeSetHash::of(changes))
            .with_details(json!({
                "code": "SAFETY_VIOLATION",
                "risk_level": assessment.risk_level,
                "triggers": triggers,
            }));
        if let Some(token) = token {
            record = record.with_token(token);
        }
        self.audit.append(record);
        warn!(
            operation = operation.as_str(),
            risk = %assessment.risk_level,
            ?triggers,
            "blocked change-set refused"
        );
        Err(GateError::SafetyViolation {
            risk: assessment.risk_level,
            triggers,
            message,
        })
    }

    fn reject(
        &self,
        operation: AuditOperation,
        hash: ChangeSetHash,
        token: Option<TokenId>,
        code: &str,
    ) {
        let mut record = AuditRecord::new(operation, AuditOutcome::Rejected)
            .with_change_set(hash)
            .with_details(json!({ "code": code }));
        if let Some(token) = token {
            record = record.with_token(token);
        }
        self.audit.append(record);
    }

    fn internal(
        &self,
        operation: AuditOperation,
        token: Option<TokenId>,
        panic: &(dyn Any + Send),
    ) -> GateError {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        let mut record = AuditRecord::new(AuditOperation::Internal, AuditOutcome::Failure)
            .with_details(json!({
                "operation": operation.as_str(),
                "panic": detail,
            }));
        if let Some(token) = token {
            record = record.with_token(token);
        }
        let audit_id = self.audit.append(record);
        error!(%audit_id, operation = operation.as_str(), "internal error");
        GateError::Internal { audit_id }
    }
}

/// Stops the background sweeper
#[derive(Debug)]
pub struct SweeperHandle {
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper and wait for it to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "sweeper task ended abnormally");
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
