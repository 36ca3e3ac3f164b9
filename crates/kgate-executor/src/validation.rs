//! Post-execution validation
//!
//! After a stage settles, every applied resource is checked on four tiers:
//! the new sizing landed, the controller reports healthy, every instance is
//! ready, and nothing is crash-looping or restarting during the window.

use crate::cancel::CancelSignal;
use crate::cluster::{ClusterClient, InstanceStatus, Manifest};
use crate::timing::TimingPolicy;
use crate::transaction::{ExecutionTransaction, OperationStatus};
use kgate_safety::{ResourceChange, ResourceTarget, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Container waiting reasons that count as unstable
pub const UNSTABLE_WAITING_REASONS: [&str; 4] = [
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationTier {
    ChangeApplied,
    Health,
    Readiness,
    Stability,
}

impl ValidationTier {
    pub const ALL: [Self; 4] = [
        Self::ChangeApplied,
        Self::Health,
        Self::Readiness,
        Self::Stability,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChangeApplied => "change_applied",
            Self::Health => "health",
            Self::Readiness => "readiness",
            Self::Stability => "stability",
        }
    }
}

impl fmt::Display for ValidationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub tier: ValidationTier,
    pub passed: bool,
    pub message: String,
}

impl ValidationResult {
    fn from_check(tier: ValidationTier, check: Result<String, String>) -> Self {
        let (passed, message) = match check {
            Ok(message) => (true, message),
            Err(message) => (false, message),
        };
        Self {
            tier,
            passed,
            message,
        }
    }
}

/// All four tiers for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceValidation {
    pub target: ResourceTarget,
    pub results: Vec<ValidationResult>,
}

impl ResourceValidation {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    #[must_use]
    pub fn result(&self, tier: ValidationTier) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.tier == tier)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub transaction_id: TransactionId,
    pub stage_index: usize,
    pub namespace: String,
    pub resources: Vec<ResourceValidation>,
    /// Fraction of resources passing every tier
    pub success_ratio: f64,
    pub elapsed_ms: u64,
    /// Validation was interrupted before it read any state
    pub cancelled: bool,
}

impl ValidationReport {
    #[must_use]
    pub fn meets(&self, threshold: f64) -> bool {
        !self.cancelled && self.success_ratio >= threshold
    }

    pub fn failed_resources(&self) -> impl Iterator<Item = &ResourceValidation> {
        self.resources.iter().filter(|r| !r.passed())
    }
}

/// Limits for the stability tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityThresholds {
    /// Most restarts any one container may have
    pub max_restart_count: u32,
    /// Most restarts any one container may gain during the settle window
    pub max_restarts_in_window: u32,
}

impl Default for StabilityThresholds {
    fn default() -> Self {
        Self {
            max_restart_count: 5,
            max_restarts_in_window: 1,
        }
    }
}

type RestartBaseline = HashMap<(String, String), u32>;

fn restart_baseline(instances: &[InstanceStatus]) -> RestartBaseline {
    instances
        .iter()
        .flat_map(|i| {
            i.containers
                .iter()
                .map(move |c| ((i.name.clone(), c.name.clone()), c.restart_count))
        })
        .collect()
}

/// Checks that an applied stage landed and stayed healthy
pub struct PostExecutionValidator {
    cluster: Arc<dyn ClusterClient>,
    timing: TimingPolicy,
    thresholds: StabilityThresholds,
}

impl fmt::Debug for PostExecutionValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostExecutionValidator")
            .field("timing", &self.timing)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl PostExecutionValidator {
    pub fn new(cluster: Arc<dyn ClusterClient>, timing: TimingPolicy) -> Self {
        Self {
            cluster,
            timing,
            thresholds: StabilityThresholds::default(),
        }
    }

    #[must_use]
    pub fn with_thresholds(mut self, thresholds: StabilityThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Wait out the settle delay, then check every applied resource
    pub async fn validate(
        &self,
        tx: &ExecutionTransaction,
        cancel: &CancelSignal,
    ) -> ValidationReport {
        let started = Instant::now();
        let changes: Vec<&ResourceChange> = tx
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::Applied)
            .map(|op| &op.change)
            .collect();

        let mut baselines = HashMap::with_capacity(changes.len());
        for change in &changes {
            if let Ok(instances) = self.instances(change.target()).await {
                baselines.insert(change.target().clone(), restart_baseline(&instances));
            }
        }

        let cancelled = tokio::select! {
            () = tokio::time::sleep(self.timing.settle_delay) => false,
            () = cancel.cancelled() => true,
        };
        if cancelled {
            warn!(transaction_id = %tx.id, "validation cancelled during settle window");
            return ValidationReport {
                transaction_id: tx.id,
                stage_index: tx.stage_index,
                namespace: tx.namespace.clone(),
                resources: Vec::new(),
                success_ratio: 0.0,
                elapsed_ms: elapsed_ms(started),
                cancelled: true,
            };
        }

        let mut resources = Vec::with_capacity(changes.len());
        for change in changes {
            let baseline = baselines.get(change.target());
            resources.push(self.validate_resource(change, baseline).await);
        }

        let passing = resources.iter().filter(|r| r.passed()).count();
        #[allow(clippy::cast_precision_loss)]
        let success_ratio = if resources.is_empty() {
            1.0
        } else {
            passing as f64 / resources.len() as f64
        };
        let report = ValidationReport {
            transaction_id: tx.id,
            stage_index: tx.stage_index,
            namespace: tx.namespace.clone(),
            resources,
            success_ratio,
            elapsed_ms: elapsed_ms(started),
            cancelled: false,
        };
        info!(
            transaction_id = %tx.id,
            stage = tx.stage_index,
            success_ratio,
            failed = report.failed_resources().count(),
            "stage validated"
        );
        report
    }

    async fn instances(
        &self,
        target: &ResourceTarget,
    ) -> Result<Vec<InstanceStatus>, String> {
        match tokio::time::timeout(self.timing.command_timeout, self.cluster.instances(target)).await
        {
            Ok(Ok(instances)) => Ok(instances),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("listing instances of {target} timed out")),
        }
    }

    async fn validate_resource(
        &self,
        change: &ResourceChange,
        baseline: Option<&RestartBaseline>,
    ) -> ResourceValidation {
        let target = change.target();
        let manifest =
            match tokio::time::timeout(self.timing.command_timeout, self.cluster.read(target)).await {
                Ok(Ok(manifest)) => Ok(manifest),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("reading {target} timed out")),
            };

        let (applied, health) = match &manifest {
            Ok(manifest) => (change_applied(change, manifest), health(&target.kind, manifest)),
            Err(e) => (Err(e.clone()), Err(e.clone())),
        };
        let (readiness, stability) = match self.instances(target).await {
            Ok(instances) => (
                readiness(&instances),
                stability(&instances, baseline, &self.thresholds),
            ),
            Err(e) => (Err(e.clone()), Err(e)),
        };

        let results = vec![
            ValidationResult::from_check(ValidationTier::ChangeApplied, applied),
            ValidationResult::from_check(ValidationTier::Health, health),
            ValidationResult::from_check(ValidationTier::Readiness, readiness),
            ValidationResult::from_check(ValidationTier::Stability, stability),
        ];
        for failed in results.iter().filter(|r| !r.passed) {
            warn!(%target, tier = %failed.tier, message = %failed.message, "validation failed");
        }
        debug!(%target, "resource validated");
        ResourceValidation {
            target: target.clone(),
            results,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn change_applied(change: &ResourceChange, manifest: &Manifest) -> Result<String, String> {
    let live = manifest.container_resources();
    if live.satisfies(change.proposed()) {
        Ok("live resources match the proposed values".to_string())
    } else {
        let mismatched: Vec<String> = change
            .proposed()
            .fields()
            .filter(|field| live.raw(*field) != change.proposed().raw(*field))
            .map(|field| {
                format!(
                    "{}: expected {}, found {}",
                    field.as_str(),
                    change.proposed().display(field).unwrap_or_default(),
                    live.display(field).unwrap_or_else(|| "unset".to_string()),
                )
            })
            .collect();
        Err(mismatched.join("; "))
    }
}

pub(crate) fn health(kind: &str, manifest: &Manifest) -> Result<String, String> {
    match kind.to_ascii_lowercase().as_str() {
        "deployment" | "statefulset" | "replicaset" => {
            let replicas = manifest
                .spec_count("replicas")
                .or_else(|| manifest.status_count("replicas"))
                .unwrap_or(0);
            let ready = manifest.status_count("readyReplicas").unwrap_or(0);
            if replicas == 0 {
                return Err("no replicas desired".to_string());
            }
            if ready != replicas {
                return Err(format!("{ready}/{replicas} replicas ready"));
            }
            if let Some(available) = manifest.status_count("availableReplicas") {
                if available != replicas {
                    return Err(format!("{available}/{replicas} replicas available"));
                }
            }
            Ok(format!("{ready}/{replicas} replicas ready"))
        }
        "daemonset" => {
            let desired = manifest.status_count("desiredNumberScheduled");
            let ready = manifest.status_count("numberReady").unwrap_or(0);
            match desired {
                Some(desired) if desired == ready => Ok(format!("{ready}/{desired} scheduled pods ready")),
                Some(desired) => Err(format!("{ready}/{desired} scheduled pods ready")),
                None => Err("daemonset reports no desired count".to_string()),
            }
        }
        _ => match manifest
            .condition("Available")
            .or_else(|| manifest.condition("Ready"))
        {
            Some(true) => Ok("condition reports ready".to_string()),
            Some(false) => Err("condition reports not ready".to_string()),
            None => Err("no Available or Ready condition reported".to_string()),
        },
    }
}

pub(crate) fn readiness(instances: &[InstanceStatus]) -> Result<String, String> {
    if instances.is_empty() {
        return Err("no instances found".to_string());
    }
    let not_ready: Vec<&str> = instances
        .iter()
        .filter(|i| i.phase != "Running" || !i.ready)
        .map(|i| i.name.as_str())
        .collect();
    if not_ready.is_empty() {
        Ok(format!("{} instances ready", instances.len()))
    } else {
        Err(format!("instances not ready: {}", not_ready.join(", ")))
    }
}

pub(crate) fn stability(
    instances: &[InstanceStatus],
    baseline: Option<&RestartBaseline>,
    thresholds: &StabilityThresholds,
) -> Result<String, String> {
    let mut problems = Vec::new();
    for instance in instances {
        for container in &instance.containers {
            let label = format!("{}/{}", instance.name, container.name);
            if container.restart_count > thresholds.max_restart_count {
                problems.push(format!("{label} restarted {} times", container.restart_count));
            }
            if let Some(reason) = container
                .waiting_reason
                .as_deref()
                .filter(|r| UNSTABLE_WAITING_REASONS.contains(r))
            {
                problems.push(format!("{label} waiting: {reason}"));
            }
            let before = baseline
                .and_then(|b| b.get(&(instance.name.clone(), container.name.clone())))
                .copied();
            if let Some(before) = before {
                let gained = container.restart_count.saturating_sub(before);
                if gained > thresholds.max_restarts_in_window {
                    problems.push(format!("{label} restarted {gained} times during settle window"));
                }
            }
        }
    }
    if problems.is_empty() {
        Ok("no crash loops or restart growth".to_string())
    } else {
        Err(problems.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use crate::cluster::{crash_looping, MockCluster, PatchMode};
    use crate::snapshot::{ResourceSnapshot, SnapshotStore};
    use crate::transaction::{ExecutionMode, Operation, TransactionStatus};
    use kgate_safety::{CpuQuantity, ManualClock, ResourceQuantities, TokenId};
    use pretty_assertions::assert_eq;
    use serde_json::json;

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

    /// Patch the mock and describe the result as a committed transaction
    async fn applied(cluster: &MockCluster, changes: &[ResourceChange]) -> ExecutionTransaction {
        let store = SnapshotStore::with_default_retention(Arc::new(ManualClock::starting_now()));
        let mut resources = Vec::new();
        for c in changes {
            let manifest = cluster.read(c.target()).await.unwrap();
            resources.push(ResourceSnapshot::capture(c, manifest).unwrap());
            cluster
                .patch(c.target(), c.proposed(), PatchMode::Apply)
                .await
                .unwrap();
        }
        let transaction_id = TransactionId::new();
        ExecutionTransaction {
            id: transaction_id,
            token_id: TokenId::new(),
            stage_index: 0,
            cluster: "c1".to_string(),
            namespace: "apps".to_string(),
            mode: ExecutionMode::Apply,
            operations: changes
                .iter()
                .enumerate()
                .map(|(i, c)| Operation {
                    change: c.clone(),
                    status: OperationStatus::Applied,
                    attempts: 1,
                    last_error: None,
                    applied_seq: Some(i as u64),
                })
                .collect(),
            status: TransactionStatus::Committed,
            snapshot: Arc::new(store.preview(transaction_id, TokenId::new(), resources)),
            snapshot_stored: false,
            rollback_errors: Vec::new(),
            started_at: chrono::Utc::now(),
            finished_at: None,
        }
    }

    fn validator(cluster: Arc<MockCluster>) -> PostExecutionValidator {
        PostExecutionValidator::new(cluster, TimingPolicy::mock())
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_stage_passes_every_tier() {
        let changes = vec![change("a"), change("b")];
        let cluster = Arc::new(MockCluster::seeded(&changes));
        let tx = applied(&cluster, &changes).await;

        let report = validator(cluster).validate(&tx, &CancelSignal::never()).await;
        assert_eq!(report.resources.len(), 2);
        assert!((report.success_ratio - 1.0).abs() < f64::EPSILON);
        assert!(report.meets(1.0));
        assert!(report.elapsed_ms >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn ignored_patch_fails_change_applied_only() {
        let changes = vec![change("a"), change("b")];
        let cluster = Arc::new(MockCluster::seeded(&changes));
        cluster.ignore_patches(changes[0].target());
        let tx = applied(&cluster, &changes).await;

        let report = validator(cluster).validate(&tx, &CancelSignal::never()).await;
        assert!((report.success_ratio - 0.5).abs() < f64::EPSILON);
        let failed: Vec<_> = report.failed_resources().collect();
        assert_eq!(failed.len(), 1);
        let tiers: Vec<_> = failed[0]
            .results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.tier)
            .collect();
        assert_eq!(tiers, vec![ValidationTier::ChangeApplied]);
        assert!(!report.meets(1.0));
        assert!(report.meets(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn crash_looping_workload_fails_health_readiness_and_stability() {
        let changes = vec![change("a")];
        let cluster = Arc::new(MockCluster::seeded(&changes));
        cluster.degrade_on_patch(changes[0].target());
        let tx = applied(&cluster, &changes).await;

        let report = validator(cluster).validate(&tx, &CancelSignal::never()).await;
        let resource = &report.resources[0];
        assert!(resource.result(ValidationTier::ChangeApplied).unwrap().passed);
        assert!(!resource.result(ValidationTier::Health).unwrap().passed);
        assert!(!resource.result(ValidationTier::Readiness).unwrap().passed);
        assert!(!resource.result(ValidationTier::Stability).unwrap().passed);
        assert!(report.success_ratio.abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_transaction_is_fully_successful() {
        let cluster = Arc::new(MockCluster::new());
        let mut tx = applied(&cluster, &[]).await;
        tx.operations.clear();
        let report = validator(cluster).validate(&tx, &CancelSignal::never()).await;
        assert!(report.resources.is_empty());
        assert!((report.success_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_settle_window() {
        let changes = vec![change("a")];
        let cluster = Arc::new(MockCluster::seeded(&changes));
        let tx = applied(&cluster, &changes).await;
        let slow = PostExecutionValidator::new(cluster, TimingPolicy::production());
        let (handle, signal) = cancellation();
        handle.cancel();

        let report = slow.validate(&tx, &signal).await;
        assert!(report.cancelled);
        assert!(!report.meets(0.0));
        assert!(report.elapsed_ms < 30_000);
    }

    #[test]
    fn stability_flags_restart_growth_in_window() {
        let thresholds = StabilityThresholds::default();
        let mut instance = InstanceStatus::healthy("web-0", "web");
        let baseline = restart_baseline(std::slice::from_ref(&instance));
        instance.containers[0].restart_count = 2;

        let err = stability(std::slice::from_ref(&instance), Some(&baseline), &thresholds)
            .unwrap_err();
        assert!(err.contains("during settle window"));
        assert!(stability(std::slice::from_ref(&instance), None, &thresholds).is_ok());
    }

    #[test]
    fn stability_flags_restart_ceiling_and_waiting_reasons() {
        let thresholds = StabilityThresholds::default();
        let err = stability(&[crash_looping("web-0", "web", 6)], None, &thresholds).unwrap_err();
        assert!(err.contains("restarted 6 times"));
        assert!(err.contains("CrashLoopBackOff"));

        let mut pulling = InstanceStatus::healthy("web-1", "web");
        pulling.containers[0].waiting_reason = Some("ImagePullBackOff".to_string());
        assert!(stability(&[pulling], None, &thresholds).is_err());
    }

    #[test]
    fn readiness_needs_instances() {
        assert!(readiness(&[]).is_err());
        assert!(readiness(&[InstanceStatus::healthy("a-0", "a")]).is_ok());
        assert!(readiness(&[crash_looping("a-0", "a", 0)]).is_err());
    }

    #[test]
    fn health_by_kind() {
        let daemonset = Manifest::new(json!({
            "status": {"desiredNumberScheduled": 3, "numberReady": 3}
        }));
        assert!(health("DaemonSet", &daemonset).is_ok());
        let lagging = Manifest::new(json!({
            "status": {"desiredNumberScheduled": 3, "numberReady": 2}
        }));
        assert_eq!(
            health("DaemonSet", &lagging).unwrap_err(),
            "2/3 scheduled pods ready"
        );

        let job = Manifest::new(json!({
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        }));
        assert!(health("CronThing", &job).is_ok());
        assert!(health("CronThing", &Manifest::new(json!({}))).is_err());

        let scaled_down = Manifest::new(json!({
            "spec": {"replicas": 0},
            "status": {"readyReplicas": 0}
        }));
        assert!(health("StatefulSet", &scaled_down).is_err());

        let unavailable = Manifest::new(json!({
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2, "availableReplicas": 1}
        }));
        assert_eq!(
            health("Deployment", &unavailable).unwrap_err(),
            "1/2 replicas available"
        );
    }
}
