//! Gate scenarios against the in-memory cluster

use async_trait::async_trait;
use kgate_core::executor::{
    ClusterClient, ExternalCommandError, InstanceStatus, Manifest, MockCluster, PatchMode,
    SnapshotStatus,
};
use kgate_core::safety::{
    ResourceQuantities, ResourceTarget, TokenRejection, TokenStatus, WarningCode,
};
use kgate_core::{
    ApplyRequest, AuditFilter, AuditOperation, AuditOutcome, ExecutionMode, GateError, RiskLevel,
    RolloutStatus, SafetyGate, TokenId,
};
use kgate_test_utils::{cpu_change, resize, setup_test_gate, sizing, test_config};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn token_rejection(err: &GateError) -> Option<TokenRejection> {
    match err {
        GateError::InvalidToken(e) => Some(e.reason),
        _ => None,
    }
}

#[test]
fn production_resize_is_medium_risk() {
    let changes = vec![resize("production", "web")];
    let t = setup_test_gate(&changes);

    let assessment = t.gate.assess(&changes).unwrap();
    assert_eq!(assessment.risk_level, RiskLevel::Medium);
    assert!(assessment.has_warning(WarningCode::ProductionNamespace));
    assert!(!assessment.blocked);
    assert_eq!(assessment.production_namespaces, vec!["production".to_string()]);

    let entries = t
        .gate
        .get_history(&AuditFilter::new().with_operation(AuditOperation::Assess));
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn apply_without_token_is_refused() {
    let changes = vec![resize("production", "web")];
    let t = setup_test_gate(&changes);

    let err = t.gate.apply(ApplyRequest::new(changes)).await.unwrap_err();
    assert_eq!(token_rejection(&err), Some(TokenRejection::Missing));
    assert_eq!(err.code(), "TOKEN_MISSING");
    assert!(t.cluster.patches().is_empty());

    let rejected = t.gate.get_history(
        &AuditFilter::new()
            .with_operation(AuditOperation::Apply)
            .with_outcome(AuditOutcome::Rejected),
    );
    assert_eq!(rejected.len(), 1);
}

#[tokio::test]
async fn confirmed_apply_within_timeout_succeeds() {
    let changes = vec![resize("production", "web")];
    let t = setup_test_gate(&changes);

    let token = t.confirmed_token(&changes);
    t.clock.advance(Duration::from_secs(120));
    let result = t
        .gate
        .apply(ApplyRequest::new(changes.clone()).with_token(token))
        .await
        .unwrap();

    assert_eq!(result.status, RolloutStatus::Completed);
    assert_eq!(result.mode, ExecutionMode::Apply);
    assert_eq!(result.snapshot_ids.len(), 1);
    assert_eq!(
        t.cluster.quantities(changes[0].target()),
        Some(sizing(250, 256))
    );
    assert_eq!(t.gate.token(token).unwrap().status, TokenStatus::Consumed);
    assert_eq!(
        t.gate.snapshot_status(result.snapshot_ids[0]),
        Some(SnapshotStatus::Available)
    );
    assert!(GateError::from_rollout(&result, 1.0).is_none());

    let applied = t.gate.get_history(
        &AuditFilter::new()
            .with_operation(AuditOperation::Apply)
            .with_token(token),
    );
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].outcome, AuditOutcome::Success);
    assert!(t.gate.audit().verify_integrity().is_ok());
}

#[tokio::test]
async fn blocked_change_is_refused_regardless_of_token() {
    let changes = vec![cpu_change("production", "postgres-primary", 700)];
    let t = setup_test_gate(&changes);

    let assessment = t.gate.assess(&changes).unwrap();
    assert!(assessment.blocked);
    assert_eq!(assessment.risk_level, RiskLevel::Critical);

    let err = t.gate.request_confirmation(&changes).unwrap_err();
    assert!(matches!(err, GateError::SafetyViolation { .. }));

    let err = t
        .gate
        .apply(ApplyRequest::new(changes).with_token(TokenId::new()))
        .await
        .unwrap_err();
    let report = err.report();
    assert_eq!(report.kind, "safety_violation");
    assert!(report
        .trigger
        .as_deref()
        .is_some_and(|trigger| trigger.contains("max_change_percent=500")));
    assert!(t.cluster.patches().is_empty());
}

#[tokio::test]
async fn expired_token_is_refused() {
    let changes = vec![resize("staging", "web")];
    let t = setup_test_gate(&changes);

    let token = t.confirmed_token(&changes);
    t.clock.advance(Duration::from_secs(301));
    let err = t
        .gate
        .apply(ApplyRequest::new(changes).with_token(token))
        .await
        .unwrap_err();

    assert_eq!(token_rejection(&err), Some(TokenRejection::Expired));
    assert!(t.cluster.patches().is_empty());
}

#[tokio::test]
async fn token_is_bound_to_its_change_set() {
    let confirmed = vec![resize("staging", "web")];
    let t = setup_test_gate(&confirmed);
    let token = t.confirmed_token(&confirmed);

    let altered = vec![kgate_test_utils::resize_to(
        "staging",
        "web",
        sizing(100, 128),
        sizing(300, 256),
    )];
    let err = t
        .gate
        .apply(ApplyRequest::new(altered).with_token(token))
        .await
        .unwrap_err();
    assert_eq!(token_rejection(&err), Some(TokenRejection::ChangeSetMismatch));

    // a mismatch leaves the token usable for the change-set it was issued for
    let result = t
        .gate
        .apply(ApplyRequest::new(confirmed).with_token(token))
        .await
        .unwrap();
    assert_eq!(result.status, RolloutStatus::Completed);
}

#[tokio::test]
async fn token_is_single_use() {
    let changes = vec![resize("staging", "web")];
    let t = setup_test_gate(&changes);
    let request = ApplyRequest::new(changes.clone()).with_token(t.confirmed_token(&changes));

    t.gate.apply(request.clone()).await.unwrap();
    let err = t.gate.apply(request).await.unwrap_err();

    assert_eq!(token_rejection(&err), Some(TokenRejection::AlreadyConsumed));
    assert_eq!(t.cluster.applied_patch_count(), 1);
}

#[tokio::test]
async fn dry_run_keeps_cluster_and_token_intact() {
    let changes = vec![resize("staging", "web"), resize("staging", "worker")];
    let t = setup_test_gate(&changes);
    let token = t.confirmed_token(&changes);

    let preview = t
        .gate
        .apply(ApplyRequest::new(changes.clone()).with_token(token).dry_run())
        .await
        .unwrap();
    assert_eq!(preview.mode, ExecutionMode::DryRun);
    assert_eq!(preview.status, RolloutStatus::Completed);
    assert!(preview.snapshot_ids.is_empty());
    assert_eq!(t.cluster.applied_patch_count(), 0);
    assert_eq!(t.cluster.quantities(changes[0].target()), Some(sizing(100, 128)));
    assert_eq!(t.gate.token(token).unwrap().status, TokenStatus::Confirmed);

    let dry_runs = t
        .gate
        .get_history(&AuditFilter::new().with_operation(AuditOperation::DryRun));
    assert_eq!(dry_runs.len(), 1);

    let applied = t
        .gate
        .apply(ApplyRequest::new(changes).with_token(token))
        .await
        .unwrap();
    assert_eq!(applied.status, RolloutStatus::Completed);
    assert_eq!(t.cluster.applied_patch_count(), 2);
}

#[tokio::test]
async fn rollback_restores_original_sizing() {
    let changes = vec![resize("staging", "web")];
    let t = setup_test_gate(&changes);
    let token = t.confirmed_token(&changes);
    let result = t
        .gate
        .apply(ApplyRequest::new(changes.clone()).with_token(token))
        .await
        .unwrap();
    let snapshot_id = result.snapshot_ids[0];

    let err = t.gate.rollback(snapshot_id, None).await.unwrap_err();
    assert_eq!(token_rejection(&err), Some(TokenRejection::Missing));

    // the apply token was spent and never covered the reversal
    let err = t.gate.rollback(snapshot_id, Some(token)).await.unwrap_err();
    assert!(token_rejection(&err).is_some());

    let request = t.gate.request_rollback_confirmation(snapshot_id).unwrap();
    t.gate.confirm(request.token.id).unwrap();
    let rollback = t
        .gate
        .rollback(snapshot_id, Some(request.token.id))
        .await
        .unwrap();

    assert_eq!(rollback.restored, vec![changes[0].target().clone()]);
    assert_eq!(rollback.transaction_id, result.stages[0].transaction.as_ref().unwrap().id);
    assert_eq!(t.cluster.quantities(changes[0].target()), Some(sizing(100, 128)));
    assert_eq!(t.gate.snapshot_status(snapshot_id), Some(SnapshotStatus::Consumed));

    let err = t.gate.request_rollback_confirmation(snapshot_id).unwrap_err();
    assert_eq!(err.code(), "SNAPSHOT_CONSUMED");

    let rollbacks = t.gate.get_history(
        &AuditFilter::new()
            .with_operation(AuditOperation::Rollback)
            .with_outcome(AuditOutcome::Success),
    );
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].snapshot_id, Some(snapshot_id));
}

#[tokio::test]
async fn concurrent_applies_consume_token_once() {
    let changes = vec![resize("staging", "web")];
    let t = setup_test_gate(&changes);
    let token = t.confirmed_token(&changes);
    let request = ApplyRequest::new(changes).with_token(token);

    let attempts = (0..8).map(|_| t.gate.apply(request.clone()));
    let outcomes = futures::future::join_all(attempts).await;

    let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(succeeded, 1);
    for err in outcomes.iter().filter_map(|o| o.as_ref().err()) {
        assert_eq!(token_rejection(err), Some(TokenRejection::AlreadyConsumed));
    }
    assert_eq!(t.cluster.applied_patch_count(), 1);
}

#[tokio::test]
async fn sweep_expires_tokens_and_drops_old_snapshots() {
    let changes = vec![resize("staging", "web")];
    let t = setup_test_gate(&changes);
    let token = t.confirmed_token(&changes);
    t.gate
        .apply(ApplyRequest::new(changes.clone()).with_token(token))
        .await
        .unwrap();
    let pending = t.gate.request_confirmation(&changes).unwrap().token.id;

    t.clock.advance(Duration::from_secs(8 * 86_400));
    let report = t.gate.sweep();

    assert_eq!(report.tokens_expired, 1);
    assert_eq!(report.snapshots_removed, 1);
    assert_eq!(report.audit_entries_purged, 0);
    assert_eq!(t.gate.token(pending).unwrap().status, TokenStatus::Expired);
    assert!(t.gate.audit().verify_integrity().is_ok());
}

#[tokio::test(start_paused = true)]
async fn background_sweeper_runs_on_interval() {
    let changes = vec![resize("staging", "web")];
    let t = setup_test_gate(&changes);
    let pending = t.gate.request_confirmation(&changes).unwrap().token.id;
    t.clock.advance(Duration::from_secs(400));

    let sweeper = t.gate.spawn_sweeper(Duration::from_secs(300));
    tokio::time::sleep(Duration::from_secs(301)).await;

    assert_eq!(t.gate.token(pending).unwrap().status, TokenStatus::Expired);
    let sweeps = t
        .gate
        .get_history(&AuditFilter::new().with_operation(AuditOperation::Sweep));
    assert_eq!(sweeps.len(), 1);

    sweeper.shutdown().await;
}

struct ExplodingCluster {
    inner: MockCluster,
}

#[async_trait]
impl ClusterClient for ExplodingCluster {
    async fn read(&self, target: &ResourceTarget) -> Result<Manifest, ExternalCommandError> {
        self.inner.read(target).await
    }

    async fn patch(
        &self,
        _target: &ResourceTarget,
        _desired: &ResourceQuantities,
        _mode: PatchMode,
    ) -> Result<(), ExternalCommandError> {
        panic!("patch handler exploded");
    }

    async fn instances(
        &self,
        target: &ResourceTarget,
    ) -> Result<Vec<InstanceStatus>, ExternalCommandError> {
        self.inner.instances(target).await
    }
}

#[tokio::test]
async fn panic_during_apply_becomes_internal_error() {
    let changes = vec![resize("staging", "web")];
    let cluster = Arc::new(ExplodingCluster {
        inner: MockCluster::seeded(&changes),
    });
    let gate = SafetyGate::builder(test_config())
        .with_cluster(cluster)
        .build()
        .unwrap();
    let request = gate.request_confirmation(&changes).unwrap();
    gate.confirm(request.token.id).unwrap();

    let err = gate
        .apply(ApplyRequest::new(changes).with_token(request.token.id))
        .await
        .unwrap_err();

    let GateError::Internal { audit_id } = &err else {
        panic!("expected internal error, got {err:?}");
    };
    assert!(!err.report().message.contains("exploded"));
    let entry = gate.audit().get(*audit_id).unwrap();
    assert_eq!(entry.operation, AuditOperation::Internal);
    assert_eq!(entry.details["panic"], "patch handler exploded");
}
