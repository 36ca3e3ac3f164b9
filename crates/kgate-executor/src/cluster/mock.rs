//! Deterministic in-memory cluster
//!
//! Used by tests and by dry simulations from the CLI. Failures, health
//! degradation and no-op patches can be injected per workload.

use super::{
    ClusterClient, CommandErrorKind, ContainerStatus, ExternalCommandError, InstanceStatus,
    Manifest, PatchMode,
};
use kgate_safety::{ResourceChange, ResourceQuantities, ResourceTarget};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MockOp {
    Read,
    Patch,
    Instances,
}

impl MockOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Patch => "patch",
            Self::Instances => "instances",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureRule {
    kind: CommandErrorKind,
    remaining: Option<u32>,
}

#[derive(Debug, Clone)]
struct MockWorkload {
    container: String,
    quantities: ResourceQuantities,
    replicas: u32,
    ready_replicas: u32,
    instances: Vec<InstanceStatus>,
    degrade_on_patch: bool,
    ignore_patches: bool,
}

/// One patch the mock received
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub target: ResourceTarget,
    pub desired: ResourceQuantities,
    pub mode: PatchMode,
    pub succeeded: bool,
}

#[derive(Debug, Default)]
struct MockState {
    workloads: HashMap<ResourceTarget, MockWorkload>,
    failures: HashMap<(ResourceTarget, MockOp), FailureRule>,
    patches: Vec<PatchRecord>,
}

impl MockState {
    fn take_failure(&mut self, target: &ResourceTarget, op: MockOp) -> Option<CommandErrorKind> {
        let key = (target.clone(), op);
        let rule = self.failures.get_mut(&key)?;
        let kind = rule.kind;
        let exhausted = match &mut rule.remaining {
            Some(0) => true,
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        };
        if exhausted {
            self.failures.remove(&key);
            return None;
        }
        Some(kind)
    }
}

/// In-memory cluster
#[derive(Debug, Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
    latency: Duration,
}

impl MockCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// A cluster holding a healthy workload for each change, at its
    /// current sizing
    #[must_use]
    pub fn seeded(changes: &[ResourceChange]) -> Self {
        let cluster = Self::new();
        for change in changes {
            cluster.insert(change.target().clone(), *change.current());
        }
        cluster
    }

    /// Add a healthy two-replica workload
    pub fn insert(&self, target: ResourceTarget, quantities: ResourceQuantities) {
        let container = target.name.clone();
        let instances = (0..2)
            .map(|i| InstanceStatus::healthy(format!("{}-{i}", target.name), container.clone()))
            .collect();
        self.state.lock().workloads.insert(
            target,
            MockWorkload {
                container,
                quantities,
                replicas: 2,
                ready_replicas: 2,
                instances,
                degrade_on_patch: false,
                ignore_patches: false,
            },
        );
    }

    /// Every patch of `target` fails with `kind`
    pub fn fail_patches(&self, target: &ResourceTarget, kind: CommandErrorKind) {
        self.inject(target, MockOp::Patch, kind, None);
    }

    /// The next `times` patches of `target` fail with `kind`
    pub fn fail_next_patches(&self, target: &ResourceTarget, kind: CommandErrorKind, times: u32) {
        self.inject(target, MockOp::Patch, kind, Some(times));
    }

    /// Every read of `target` fails with `kind`
    pub fn fail_reads(&self, target: &ResourceTarget, kind: CommandErrorKind) {
        self.inject(target, MockOp::Read, kind, None);
    }

    /// Every instance listing of `target` fails with `kind`
    pub fn fail_instances(&self, target: &ResourceTarget, kind: CommandErrorKind) {
        self.inject(target, MockOp::Instances, kind, None);
    }

    fn inject(&self, target: &ResourceTarget, op: MockOp, kind: CommandErrorKind, remaining: Option<u32>) {
        self.state
            .lock()
            .failures
            .insert((target.clone(), op), FailureRule { kind, remaining });
    }

    /// After its next applied patch, `target` crash-loops
    pub fn degrade_on_patch(&self, target: &ResourceTarget) {
        if let Some(w) = self.state.lock().workloads.get_mut(target) {
            w.degrade_on_patch = true;
        }
    }

    /// Patches of `target` report success but change nothing
    pub fn ignore_patches(&self, target: &ResourceTarget) {
        if let Some(w) = self.state.lock().workloads.get_mut(target) {
            w.ignore_patches = true;
        }
    }

    /// Replace the instances of `target`
    pub fn set_instances(&self, target: &ResourceTarget, instances: Vec<InstanceStatus>) {
        if let Some(w) = self.state.lock().workloads.get_mut(target) {
            w.instances = instances;
        }
    }

    /// Change the ready replica count of `target`
    pub fn set_ready_replicas(&self, target: &ResourceTarget, ready: u32) {
        if let Some(w) = self.state.lock().workloads.get_mut(target) {
            w.ready_replicas = ready;
        }
    }

    /// Live sizing of `target`
    #[must_use]
    pub fn quantities(&self, target: &ResourceTarget) -> Option<ResourceQuantities> {
        self.state.lock().workloads.get(target).map(|w| w.quantities)
    }

    /// Every patch received, in order
    #[must_use]
    pub fn patches(&self) -> Vec<PatchRecord> {
        self.state.lock().patches.clone()
    }

    /// Patches that mutated state
    #[must_use]
    pub fn applied_patch_count(&self) -> usize {
        self.state
            .lock()
            .patches
            .iter()
            .filter(|p| p.mode == PatchMode::Apply && p.succeeded)
            .count()
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn overlay(base: ResourceQuantities, desired: &ResourceQuantities) -> ResourceQuantities {
    ResourceQuantities {
        cpu_request: desired.cpu_request.or(base.cpu_request),
        cpu_limit: desired.cpu_limit.or(base.cpu_limit),
        memory_request: desired.memory_request.or(base.memory_request),
        memory_limit: desired.memory_limit.or(base.memory_limit),
    }
}

fn missing(op: MockOp, target: &ResourceTarget) -> ExternalCommandError {
    ExternalCommandError::new(
        CommandErrorKind::NotFound,
        op.as_str(),
        target,
        format!("{} \"{}\" not found", target.kind, target.name),
    )
}

fn injected(op: MockOp, target: &ResourceTarget, kind: CommandErrorKind) -> ExternalCommandError {
    ExternalCommandError::new(kind, op.as_str(), target, "injected failure")
}

#[async_trait::async_trait]
impl ClusterClient for MockCluster {
    async fn read(&self, target: &ResourceTarget) -> Result<Manifest, ExternalCommandError> {
        self.pause().await;
        let mut state = self.state.lock();
        if let Some(kind) = state.take_failure(target, MockOp::Read) {
            return Err(injected(MockOp::Read, target, kind));
        }
        let workload = state
            .workloads
            .get(target)
            .ok_or_else(|| missing(MockOp::Read, target))?;
        Ok(Manifest::deployment(
            target,
            &workload.container,
            &workload.quantities,
            workload.replicas,
            workload.ready_replicas,
        ))
    }

    async fn patch(
        &self,
        target: &ResourceTarget,
        desired: &ResourceQuantities,
        mode: PatchMode,
    ) -> Result<(), ExternalCommandError> {
        self.pause().await;
        let mut state = self.state.lock();
        let record = |succeeded| PatchRecord {
            target: target.clone(),
            desired: *desired,
            mode,
            succeeded,
        };
        if let Some(kind) = state.take_failure(target, MockOp::Patch) {
            state.patches.push(record(false));
            return Err(injected(MockOp::Patch, target, kind));
        }
        let Some(workload) = state.workloads.get_mut(target) else {
            state.patches.push(record(false));
            return Err(missing(MockOp::Patch, target));
        };
        if mode == PatchMode::Apply && !workload.ignore_patches {
            workload.quantities = overlay(workload.quantities, desired);
            if workload.degrade_on_patch {
                workload.ready_replicas = 0;
                for instance in &mut workload.instances {
                    instance.ready = false;
                    for container in &mut instance.containers {
                        container.restart_count += 6;
                        container.waiting_reason = Some("CrashLoopBackOff".to_string());
                    }
                }
            }
        }
        debug!(%target, ?mode, "mock patch");
        state.patches.push(record(true));
        Ok(())
    }

    async fn instances(
        &self,
        target: &ResourceTarget,
    ) -> Result<Vec<InstanceStatus>, ExternalCommandError> {
        self.pause().await;
        let mut state = self.state.lock();
        if let Some(kind) = state.take_failure(target, MockOp::Instances) {
            return Err(injected(MockOp::Instances, target, kind));
        }
        state
            .workloads
            .get(target)
            .map(|w| w.instances.clone())
            .ok_or_else(|| missing(MockOp::Instances, target))
    }
}

/// Instance stuck in a crash loop
#[must_use]
pub fn crash_looping(name: &str, container: &str, restarts: u32) -> InstanceStatus {
    InstanceStatus {
        name: name.to_string(),
        phase: "Running".to_string(),
        ready: false,
        containers: vec![ContainerStatus {
            name: container.to_string(),
            restart_count: restarts,
            waiting_reason: Some("CrashLoopBackOff".to_string()),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgate_safety::CpuQuantity;

    fn target() -> ResourceTarget {
        ResourceTarget::deployment("c1", "apps", "web")
    }

    fn cpu(m: u64) -> ResourceQuantities {
        ResourceQuantities::new().with_cpu_request(CpuQuantity::from_millicores(m))
    }

    #[tokio::test]
    async fn patch_apply_and_simulate() {
        let cluster = MockCluster::new();
        cluster.insert(target(), cpu(100));

        cluster.patch(&target(), &cpu(200), PatchMode::Simulate).await.unwrap();
        assert_eq!(cluster.quantities(&target()), Some(cpu(100)));

        cluster.patch(&target(), &cpu(200), PatchMode::Apply).await.unwrap();
        assert_eq!(cluster.quantities(&target()), Some(cpu(200)));
        assert_eq!(cluster.applied_patch_count(), 1);
        assert_eq!(cluster.patches().len(), 2);

        let manifest = cluster.read(&target()).await.unwrap();
        assert_eq!(manifest.container_resources(), cpu(200));
    }

    #[tokio::test]
    async fn counted_failures_run_out() {
        let cluster = MockCluster::new();
        cluster.insert(target(), cpu(100));
        cluster.fail_next_patches(&target(), CommandErrorKind::Timeout, 2);

        for _ in 0..2 {
            let err = cluster.patch(&target(), &cpu(200), PatchMode::Apply).await.unwrap_err();
            assert_eq!(err.kind, CommandErrorKind::Timeout);
        }
        assert!(cluster.patch(&target(), &cpu(200), PatchMode::Apply).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_workload_is_not_found() {
        let cluster = MockCluster::new();
        let err = cluster.read(&target()).await.unwrap_err();
        assert_eq!(err.kind, CommandErrorKind::NotFound);
    }

    #[tokio::test]
    async fn degradation_after_patch() {
        let cluster = MockCluster::new();
        cluster.insert(target(), cpu(100));
        cluster.degrade_on_patch(&target());
        cluster.patch(&target(), &cpu(200), PatchMode::Apply).await.unwrap();
        let instances = cluster.instances(&target()).await.unwrap();
        assert!(instances.iter().all(|i| !i.ready));
        assert_eq!(
            instances[0].containers[0].waiting_reason.as_deref(),
            Some("CrashLoopBackOff")
        );
    }
}
