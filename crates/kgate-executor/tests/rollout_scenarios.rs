//! End-to-end rollout scenarios against the in-memory cluster

use kgate_executor::{
    CancelSignal, CommandErrorKind, ExecutionConfig, ExecutionMode, MockCluster, OperationStatus,
    PostExecutionValidator, RolloutStatus, SnapshotStore, Stage, StageStatus,
    StagedRolloutScheduler, TimingPolicy, TokenGrant, TransactionCoordinator, TransactionStatus,
};
use kgate_safety::{
    AuditFilter, AuditLog, AuditOperation, ChangeSetHash, ConfirmationConfig,
    ConfirmationManager, CpuQuantity, ManualClock, MemoryQuantity, ResourceChange,
    ResourceQuantities, ResourceTarget, RiskLevel, SafetyConfig, SafetyValidator, SharedClock,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;

struct Fixture {
    cluster: Arc<MockCluster>,
    confirmations: Arc<ConfirmationManager>,
    coordinator: Arc<TransactionCoordinator>,
    scheduler: StagedRolloutScheduler,
    audit: Arc<AuditLog>,
}

fn fixture(changes: &[ResourceChange], execution: ExecutionConfig) -> Fixture {
    let clock: SharedClock = Arc::new(ManualClock::starting_now());
    let cluster = Arc::new(MockCluster::seeded(changes));
    let audit = Arc::new(AuditLog::new(clock.clone(), chrono::Duration::days(90)));
    let confirmations = Arc::new(ConfirmationManager::new(
        ConfirmationConfig::default(),
        clock.clone(),
        audit.clone(),
    ));
    let snapshots = Arc::new(SnapshotStore::with_default_retention(clock.clone()));
    let coordinator = Arc::new(
        TransactionCoordinator::new(
            cluster.clone(),
            confirmations.clone(),
            snapshots,
            audit.clone(),
            clock,
        )
        .with_timing(TimingPolicy::immediate())
        .with_config(execution),
    );
    let validator = Arc::new(PostExecutionValidator::new(
        cluster.clone(),
        TimingPolicy::immediate(),
    ));
    let safety = Arc::new(SafetyValidator::new(SafetyConfig::default()).unwrap());
    let scheduler =
        StagedRolloutScheduler::new(coordinator.clone(), validator, safety, audit.clone());
    Fixture {
        cluster,
        confirmations,
        coordinator,
        scheduler,
        audit,
    }
}

impl Fixture {
    fn confirmed(&self, changes: &[ResourceChange]) -> TokenGrant {
        let request = self
            .confirmations
            .request_confirmation(changes, RiskLevel::Medium)
            .unwrap();
        self.confirmations.confirm(request.token.id).unwrap();
        TokenGrant::pending(request.token.id, ChangeSetHash::of(changes))
    }
}

fn sizing(cpu: u64, memory_mi: u64) -> ResourceQuantities {
    ResourceQuantities::new()
        .with_cpu_request(CpuQuantity::from_millicores(cpu))
        .with_memory_request(MemoryQuantity::from_mebibytes(memory_mi))
}

fn resize(namespace: &str, name: &str) -> ResourceChange {
    ResourceChange::new(
        ResourceTarget::deployment("prod-east", namespace, name),
        sizing(100, 128),
        sizing(250, 256),
    )
}

#[tokio::test]
async fn second_stage_failure_leaves_first_stage_committed() {
    let changes = vec![
        resize("checkout", "web"),
        resize("search", "indexer"),
        resize("search", "query"),
    ];
    let f = fixture(&changes, ExecutionConfig::default().with_max_concurrency(1));
    f.cluster
        .fail_patches(changes[2].target(), CommandErrorKind::Rejected);
    let stages = f.scheduler.plan(&changes).unwrap();
    assert_eq!(stages.len(), 2);

    let result = f
        .scheduler
        .run(&stages, f.confirmed(&changes), ExecutionMode::Apply, &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(result.status, RolloutStatus::PartiallyFailed);
    assert_eq!(
        result.stage_statuses(),
        vec![StageStatus::Completed, StageStatus::Failed]
    );
    assert_eq!(result.committed_stages(), 1);

    let failed = result.stages[1].transaction.as_ref().unwrap();
    assert_eq!(failed.status, TransactionStatus::RolledBack);
    let statuses: Vec<_> = failed.operations.iter().map(|op| op.status).collect();
    assert_eq!(
        statuses,
        vec![OperationStatus::RolledBack, OperationStatus::Failed]
    );

    assert_eq!(f.cluster.quantities(changes[0].target()), Some(sizing(250, 256)));
    assert_eq!(f.cluster.quantities(changes[1].target()), Some(sizing(100, 128)));
    assert_eq!(f.cluster.quantities(changes[2].target()), Some(sizing(100, 128)));
    assert_eq!(result.snapshot_ids.len(), 1);

    let stage_entries = f
        .audit
        .query(&AuditFilter::new().with_operation(AuditOperation::Stage));
    assert_eq!(stage_entries.len(), 2);
    assert!(f.audit.verify_integrity().is_ok());
}

#[tokio::test]
async fn token_is_single_use_across_rollouts() {
    let changes = vec![resize("checkout", "web")];
    let f = fixture(&changes, ExecutionConfig::default());
    let stages = f.scheduler.plan(&changes).unwrap();
    let grant = f.confirmed(&changes);

    let first = f
        .scheduler
        .run(&stages, grant.clone(), ExecutionMode::Apply, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(first.status, RolloutStatus::Completed);

    let second = f
        .scheduler
        .run(&stages, grant, ExecutionMode::Apply, &CancelSignal::never())
        .await;
    assert!(second.is_err());
    assert_eq!(f.cluster.applied_patch_count(), 1);
}

fn fleet(size: usize) -> Vec<ResourceChange> {
    (0..size)
        .map(|i| resize("batch", &format!("worker-{i}")))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn abort_restores_every_resource(
        size in 1usize..6,
        fail_at in 0usize..6,
        concurrency in 1usize..4,
    ) {
        let fail_at = fail_at % size;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let changes = fleet(size);
            let f = fixture(&changes, ExecutionConfig::default().with_max_concurrency(concurrency));
            f.cluster.fail_patches(changes[fail_at].target(), CommandErrorKind::Forbidden);
            let mut grant = f.confirmed(&changes);

            let mut tx = f
                .coordinator
                .begin(&Stage::new(0, changes.clone()), &mut grant, ExecutionMode::Apply)
                .await
                .unwrap();
            f.coordinator.apply(&mut tx).await;

            prop_assert_eq!(tx.status, TransactionStatus::RolledBack);
            for change in &changes {
                prop_assert_eq!(f.cluster.quantities(change.target()), Some(sizing(100, 128)));
            }
            Ok(())
        })?;
    }
}
