//! Staged rollout
//!
//! A change-set is split into one stage per namespace. Stages run strictly
//! one after another, lowest risk first, so the early stages act as
//! canaries for the riskier ones.

use crate::cancel::CancelSignal;
use crate::error::ExecutionError;
use crate::transaction::{
    ExecutionMode, ExecutionTransaction, TokenGrant, TransactionCoordinator, TransactionStatus,
};
use crate::validation::{PostExecutionValidator, ValidationReport};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use kgate_safety::{
    validate_change_set, AuditLog, AuditOperation, AuditOutcome, AuditRecord, ResourceChange,
    RiskLevel, SafetyValidator, SnapshotId, TokenId, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Changes for one namespace, applied as a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Position in the rollout
    pub index: usize,
    pub cluster: String,
    pub namespace: String,
    pub changes: Vec<ResourceChange>,
    pub risk_level: RiskLevel,
    pub production: bool,
    pub critical_workloads: usize,
}

impl Stage {
    /// Unscored stage for `changes`, addressed by the first change
    #[must_use]
    pub fn new(index: usize, changes: Vec<ResourceChange>) -> Self {
        let (cluster, namespace) = changes
            .first()
            .map(|c| (c.target().cluster.clone(), c.target().namespace.clone()))
            .unwrap_or_default();
        Self {
            index,
            cluster,
            namespace,
            changes,
            risk_level: RiskLevel::Low,
            production: false,
            critical_workloads: 0,
        }
    }

    fn sort_key(&self) -> (RiskLevel, bool, usize, &str, &str) {
        (
            self.risk_level,
            self.production,
            self.critical_workloads,
            &self.cluster,
            &self.namespace,
        )
    }
}

/// Response to a stage whose validation falls below the threshold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFailureAction {
    /// Halt and report; applied changes stay in place
    #[default]
    Report,
    /// Halt and undo the failing stage
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Validate each stage and stop when it fails
    pub gate_on_validation: bool,
    /// Minimum fraction of resources that must pass validation
    pub success_threshold: f64,
    pub on_validation_failure: ValidationFailureAction,
}

impl RolloutConfig {
    #[inline]
    #[must_use]
    pub fn with_gate_on_validation(mut self, enabled: bool) -> Self {
        self.gate_on_validation = enabled;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: f64) -> Self {
        self.success_threshold = threshold;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_on_validation_failure(mut self, action: ValidationFailureAction) -> Self {
        self.on_validation_failure = action;
        self
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            gate_on_validation: true,
            success_threshold: 1.0,
            on_validation_failure: ValidationFailureAction::Report,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Completed,
    Failed,
    ValidationFailed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub index: usize,
    pub cluster: String,
    pub namespace: String,
    pub status: StageStatus,
    pub transaction: Option<ExecutionTransaction>,
    pub validation: Option<ValidationReport>,
    pub error: Option<String>,
}

impl StageResult {
    fn untouched(stage: &Stage, status: StageStatus) -> Self {
        Self {
            index: stage.index,
            cluster: stage.cluster.clone(),
            namespace: stage.namespace.clone(),
            status,
            transaction: None,
            validation: None,
            error: None,
        }
    }

    /// Whether this stage's transaction committed
    #[must_use]
    pub fn committed(&self) -> bool {
        self.transaction
            .as_ref()
            .is_some_and(|tx| tx.status == TransactionStatus::Committed)
    }

    /// Snapshot that can undo what this stage left applied
    #[must_use]
    pub fn snapshot_id(&self) -> Option<SnapshotId> {
        self.transaction
            .as_ref()
            .filter(|tx| tx.has_applied())
            .and_then(ExecutionTransaction::snapshot_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutStatus {
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
}

/// Outcome of a rollout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub token_id: TokenId,
    pub mode: ExecutionMode,
    pub status: RolloutStatus,
    pub stages: Vec<StageResult>,
    /// Snapshots of stages that left changes applied, in stage order
    pub snapshot_ids: Vec<SnapshotId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    #[must_use]
    pub fn committed_stages(&self) -> usize {
        self.stages.iter().filter(|s| s.committed()).count()
    }

    #[must_use]
    pub fn stage_statuses(&self) -> Vec<StageStatus> {
        self.stages.iter().map(|s| s.status).collect()
    }
}

/// Plans and paces staged rollouts
pub struct StagedRolloutScheduler {
    coordinator: Arc<TransactionCoordinator>,
    validator: Arc<PostExecutionValidator>,
    safety: Arc<SafetyValidator>,
    audit: Arc<AuditLog>,
    config: RolloutConfig,
}

impl std::fmt::Debug for StagedRolloutScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedRolloutScheduler")
            .field("coordinator", &self.coordinator)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StagedRolloutScheduler {
    pub fn new(
        coordinator: Arc<TransactionCoordinator>,
        validator: Arc<PostExecutionValidator>,
        safety: Arc<SafetyValidator>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            coordinator,
            validator,
            safety,
            audit,
            config: RolloutConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: RolloutConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    /// Split `changes` into namespace stages, least critical first
    ///
    /// # Errors
    /// Returns `ValidationError` for a malformed change-set.
    pub fn plan(&self, changes: &[ResourceChange]) -> Result<Vec<Stage>, ValidationError> {
        validate_change_set(changes)?;
        let mut groups: IndexMap<(String, String), Vec<ResourceChange>> = IndexMap::new();
        for change in changes {
            let target = change.target();
            groups
                .entry((target.cluster.clone(), target.namespace.clone()))
                .or_default()
                .push(change.clone());
        }

        let mut stages = Vec::with_capacity(groups.len());
        for ((cluster, namespace), changes) in groups {
            let assessment = self.safety.assess(&changes)?;
            stages.push(Stage {
                index: 0,
                production: self.safety.production_pattern(&namespace).is_some(),
                cluster,
                namespace,
                risk_level: assessment.risk_level,
                critical_workloads: assessment.critical_workloads,
                changes,
            });
        }
        stages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        for (index, stage) in stages.iter_mut().enumerate() {
            stage.index = index;
        }
        Ok(stages)
    }

    /// Run `stages` in order under one authorization.
    ///
    /// A stage that fails, or fails gated validation, halts the rollout and
    /// the remaining stages are reported `Skipped`. Cancellation is observed
    /// before each stage and during monitoring delays; a dispatched stage
    /// always runs to completion.
    ///
    /// # Errors
    /// Returns `InvalidToken` if the grant is refused before the first stage.
    pub async fn run(
        &self,
        stages: &[Stage],
        mut grant: TokenGrant,
        mode: ExecutionMode,
        cancel: &CancelSignal,
    ) -> Result<ExecutionResult, ExecutionError> {
        let started_at = self.coordinator.now();
        let total = stages.len();
        let timing = *self.coordinator.timing();
        let mut results = Vec::with_capacity(total);
        let mut halted: Option<StageStatus> = None;

        for (position, stage) in stages.iter().enumerate() {
            if let Some(status) = halted {
                results.push(StageResult::untouched(stage, status));
                continue;
            }
            if cancel.is_cancelled() {
                info!(stage = stage.index, "rollout cancelled before stage");
                halted = Some(StageStatus::Cancelled);
                results.push(StageResult::untouched(stage, StageStatus::Cancelled));
                continue;
            }

            let result = match self.coordinator.begin(stage, &mut grant, mode).await {
                Ok(mut tx) => {
                    let outcome = self.execute_stage(stage, &mut tx, cancel).await;
                    outcome.finish(tx)
                }
                Err(ExecutionError::InvalidToken(e)) if results.is_empty() => {
                    return Err(ExecutionError::InvalidToken(e));
                }
                Err(e) => {
                    error!(stage = stage.index, error = %e, "stage could not start");
                    StageResult {
                        error: Some(e.to_string()),
                        ..StageResult::untouched(stage, StageStatus::Failed)
                    }
                }
            };
            self.audit_stage(grant.token_id(), &result);

            match result.status {
                StageStatus::Completed => {}
                StageStatus::Cancelled => halted = Some(StageStatus::Cancelled),
                _ => halted = Some(StageStatus::Skipped),
            }
            results.push(result);

            let delay = timing.delay_after(position, total);
            if halted.is_none() && !delay.is_zero() {
                info!(stage = stage.index, ?delay, "monitoring before next stage");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        info!(stage = stage.index, "rollout cancelled during monitoring delay");
                        halted = Some(StageStatus::Cancelled);
                    }
                }
            }
        }

        let status = overall_status(&results);
        let snapshot_ids = results.iter().filter_map(StageResult::snapshot_id).collect();
        info!(token_id = %grant.token_id(), ?status, stages = total, "rollout finished");
        Ok(ExecutionResult {
            token_id: grant.token_id(),
            mode,
            status,
            stages: results,
            snapshot_ids,
            started_at,
            finished_at: self.coordinator.now(),
        })
    }

    async fn execute_stage(
        &self,
        stage: &Stage,
        tx: &mut ExecutionTransaction,
        cancel: &CancelSignal,
    ) -> StageOutcome {
        self.coordinator.apply(tx).await;
        if tx.status != TransactionStatus::Committed {
            return StageOutcome {
                status: StageStatus::Failed,
                validation: None,
                error: tx.first_error().map(ToString::to_string),
            };
        }
        if !self.config.gate_on_validation || tx.mode.is_dry_run() {
            return StageOutcome::completed(None);
        }

        let report = self.validator.validate(tx, cancel).await;
        if report.cancelled {
            return StageOutcome {
                status: StageStatus::Cancelled,
                validation: Some(report),
                error: None,
            };
        }
        if report.meets(self.config.success_threshold) {
            return StageOutcome::completed(Some(report));
        }

        warn!(
            stage = stage.index,
            success_ratio = report.success_ratio,
            threshold = self.config.success_threshold,
            "stage failed validation"
        );
        if self.config.on_validation_failure == ValidationFailureAction::Rollback {
            self.coordinator.rollback_transaction(tx).await;
        }
        StageOutcome {
            status: StageStatus::ValidationFailed,
            error: Some(format!(
                "success ratio {:.2} below threshold {:.2}",
                report.success_ratio, self.config.success_threshold
            )),
            validation: Some(report),
        }
    }

    fn audit_stage(&self, token_id: TokenId, result: &StageResult) {
        let outcome = if result.status == StageStatus::Completed {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        let mut record = AuditRecord::new(AuditOperation::Stage, outcome)
            .with_token(token_id)
            .with_details(serde_json::json!({
                "stage": result.index,
                "cluster": result.cluster,
                "namespace": result.namespace,
                "status": result.status,
                "validation": result.validation,
                "error": result.error,
            }));
        if let Some(tx) = &result.transaction {
            record = record.with_transaction(tx.id);
        }
        if let Some(snapshot_id) = result.transaction.as_ref().and_then(ExecutionTransaction::snapshot_id) {
            record = record.with_snapshot(snapshot_id);
        }
        self.audit.append(record);
    }
}

struct StageOutcome {
    status: StageStatus,
    validation: Option<ValidationReport>,
    error: Option<String>,
}

impl StageOutcome {
    fn completed(validation: Option<ValidationReport>) -> Self {
        Self {
            status: StageStatus::Completed,
            validation,
            error: None,
        }
    }

    fn finish(self, tx: ExecutionTransaction) -> StageResult {
        StageResult {
            index: tx.stage_index,
            cluster: tx.cluster.clone(),
            namespace: tx.namespace.clone(),
            status: self.status,
            transaction: Some(tx),
            validation: self.validation,
            error: self.error,
        }
    }
}

fn overall_status(results: &[StageResult]) -> RolloutStatus {
    if results.iter().all(|s| s.status == StageStatus::Completed) {
        RolloutStatus::Completed
    } else if results.iter().any(StageResult::committed) {
        RolloutStatus::PartiallyFailed
    } else if results.iter().any(|s| s.status == StageStatus::Cancelled) {
        RolloutStatus::Cancelled
    } else {
        RolloutStatus::Failed
    }
}
