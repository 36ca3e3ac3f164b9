//! Testing utilities for the kgate workspace
//!
//! Change fixtures and a gate wired to an in-memory cluster and a manual clock.

#![allow(missing_docs)]

use kgate_core::{GateConfig, SafetyGate, TimingConfig, TimingPreset};
use kgate_executor::MockCluster;
use kgate_safety::{
    CpuQuantity, ManualClock, MemoryQuantity, ResourceChange, ResourceQuantities, ResourceTarget,
    TokenId,
};
use std::sync::Arc;

pub const TEST_CLUSTER: &str = "test-cluster";

pub fn sizing(cpu_millicores: u64, memory_mebibytes: u64) -> ResourceQuantities {
    ResourceQuantities::new()
        .with_cpu_request(CpuQuantity::from_millicores(cpu_millicores))
        .with_memory_request(MemoryQuantity::from_mebibytes(memory_mebibytes))
}

/// 100m/128Mi to 250m/256Mi on a Deployment
pub fn resize(namespace: &str, name: &str) -> ResourceChange {
    resize_to(namespace, name, sizing(100, 128), sizing(250, 256))
}

pub fn resize_to(
    namespace: &str,
    name: &str,
    current: ResourceQuantities,
    proposed: ResourceQuantities,
) -> ResourceChange {
    ResourceChange::new(
        ResourceTarget::deployment(TEST_CLUSTER, namespace, name),
        current,
        proposed,
    )
}

/// CPU-only change by `percent` from 100m
pub fn cpu_change(namespace: &str, name: &str, percent: u64) -> ResourceChange {
    let current = ResourceQuantities::new().with_cpu_request(CpuQuantity::from_millicores(100));
    let proposed = ResourceQuantities::new()
        .with_cpu_request(CpuQuantity::from_millicores(100 + percent));
    resize_to(namespace, name, current, proposed)
}

/// Configuration with no delays
pub fn test_config() -> GateConfig {
    GateConfig::default()
        .with_actor("test")
        .with_timing(TimingConfig::preset(TimingPreset::Immediate))
}

/// A gate over an in-memory cluster holding the current side of `changes`
pub struct TestGate {
    pub gate: Arc<SafetyGate>,
    pub cluster: Arc<MockCluster>,
    pub clock: Arc<ManualClock>,
}

impl TestGate {
    /// Request and confirm a token for `changes`
    pub fn confirmed_token(&self, changes: &[ResourceChange]) -> TokenId {
        let request = self.gate.request_confirmation(changes).unwrap();
        self.gate.confirm(request.token.id).unwrap();
        request.token.id
    }
}

pub fn setup_test_gate(changes: &[ResourceChange]) -> TestGate {
    setup_test_gate_with(test_config(), changes)
}

pub fn setup_test_gate_with(config: GateConfig, changes: &[ResourceChange]) -> TestGate {
    let cluster = Arc::new(MockCluster::seeded(changes));
    let clock = Arc::new(ManualClock::starting_now());
    let gate = SafetyGate::builder(config)
        .with_clock(clock.clone())
        .with_cluster(cluster.clone())
        .build()
        .unwrap();
    TestGate {
        gate: Arc::new(gate),
        cluster,
        clock,
    }
}
