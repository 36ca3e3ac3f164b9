//! Cluster collaborator
//!
//! The executor never talks to a cluster directly. It reads manifests,
//! patches container resources and lists workload instances through
//! [`ClusterClient`]; `KubectlCluster` and `MockCluster` implement it.

mod kubectl;
mod mock;

pub use kubectl::KubectlCluster;
pub use mock::{crash_looping, MockCluster, PatchRecord};

use kgate_safety::{CpuQuantity, MemoryQuantity, ResourceQuantities, ResourceTarget};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Whether a patch mutates or is only validated server-side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchMode {
    Apply,
    Simulate,
}

/// Classified failure of a cluster command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandErrorKind {
    NotFound,
    Forbidden,
    Unreachable,
    Timeout,
    /// The API server refused the patch itself
    Rejected,
    Failed,
}

impl CommandErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CommandErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cluster command failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{operation} {target} failed ({kind}): {message}")]
pub struct ExternalCommandError {
    pub kind: CommandErrorKind,
    pub operation: String,
    pub target: String,
    pub message: String,
}

impl ExternalCommandError {
    pub fn new(
        kind: CommandErrorKind,
        operation: impl Into<String>,
        target: &ResourceTarget,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            target: target.to_string(),
            message: message.into(),
        }
    }

    /// Worth retrying immediately
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            CommandErrorKind::Timeout | CommandErrorKind::Unreachable | CommandErrorKind::Failed
        )
    }
}

/// Per-container runtime state of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub restart_count: u32,
    pub waiting_reason: Option<String>,
}

/// A running instance (pod) of a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub name: String,
    pub phase: String,
    pub ready: bool,
    pub containers: Vec<ContainerStatus>,
}

impl InstanceStatus {
    /// A running, ready instance with one healthy container
    pub fn healthy(name: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: "Running".to_string(),
            ready: true,
            containers: vec![ContainerStatus {
                name: container.into(),
                restart_count: 0,
                waiting_reason: None,
            }],
        }
    }
}

/// Workload manifest as returned by the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Value);

impl Manifest {
    #[inline]
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Minimal Deployment manifest
    #[must_use]
    pub fn deployment(
        target: &ResourceTarget,
        container: &str,
        quantities: &ResourceQuantities,
        replicas: u32,
        ready_replicas: u32,
    ) -> Self {
        let mut requests = serde_json::Map::new();
        let mut limits = serde_json::Map::new();
        if let Some(cpu) = quantities.cpu_request {
            requests.insert("cpu".into(), Value::String(cpu.to_string()));
        }
        if let Some(memory) = quantities.memory_request {
            requests.insert("memory".into(), Value::String(memory.to_string()));
        }
        if let Some(cpu) = quantities.cpu_limit {
            limits.insert("cpu".into(), Value::String(cpu.to_string()));
        }
        if let Some(memory) = quantities.memory_limit {
            limits.insert("memory".into(), Value::String(memory.to_string()));
        }
        let available = if ready_replicas == replicas && replicas > 0 {
            "True"
        } else {
            "False"
        };
        Self(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": target.kind,
            "metadata": {"name": target.name, "namespace": target.namespace},
            "spec": {
                "replicas": replicas,
                "selector": {"matchLabels": {"app": target.name}},
                "template": {"spec": {"containers": [{
                    "name": container,
                    "resources": {"requests": requests, "limits": limits},
                }]}},
            },
            "status": {
                "replicas": replicas,
                "readyReplicas": ready_replicas,
                "availableReplicas": ready_replicas,
                "conditions": [{
                    "type": "Available",
                    "status": available,
                }],
            },
        }))
    }

    fn containers(&self) -> Option<&Vec<Value>> {
        self.0
            .pointer("/spec/template/spec/containers")
            .or_else(|| self.0.pointer("/spec/containers"))
            .and_then(Value::as_array)
    }

    /// Name of the first container
    #[must_use]
    pub fn primary_container(&self) -> Option<&str> {
        self.containers()?.first()?.get("name")?.as_str()
    }

    /// Requests and limits of the first container; unparseable values are
    /// treated as absent
    #[must_use]
    pub fn container_resources(&self) -> ResourceQuantities {
        let Some(resources) = self
            .containers()
            .and_then(|c| c.first())
            .and_then(|c| c.get("resources"))
        else {
            return ResourceQuantities::default();
        };
        let text = |section: &str, key: &str| {
            resources
                .get(section)
                .and_then(|s| s.get(key))
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
        };
        ResourceQuantities {
            cpu_request: text("requests", "cpu").and_then(|s| s.parse::<CpuQuantity>().ok()),
            cpu_limit: text("limits", "cpu").and_then(|s| s.parse::<CpuQuantity>().ok()),
            memory_request: text("requests", "memory")
                .and_then(|s| s.parse::<MemoryQuantity>().ok()),
            memory_limit: text("limits", "memory").and_then(|s| s.parse::<MemoryQuantity>().ok()),
        }
    }

    /// Integer at `/status/<key>`
    #[must_use]
    pub fn status_count(&self, key: &str) -> Option<u64> {
        self.0.get("status")?.get(key)?.as_u64()
    }

    /// Integer at `/spec/<key>`
    #[must_use]
    pub fn spec_count(&self, key: &str) -> Option<u64> {
        self.0.get("spec")?.get(key)?.as_u64()
    }

    /// Status of the named condition, if reported
    #[must_use]
    pub fn condition(&self, condition_type: &str) -> Option<bool> {
        self.0
            .pointer("/status/conditions")?
            .as_array()?
            .iter()
            .find(|c| c.get("type").and_then(Value::as_str) == Some(condition_type))
            .and_then(|c| c.get("status").and_then(Value::as_str))
            .map(|s| s == "True")
    }

    /// `spec.selector.matchLabels` rendered as a label selector
    #[must_use]
    pub fn label_selector(&self) -> Option<String> {
        let labels = self.0.pointer("/spec/selector/matchLabels")?.as_object()?;
        if labels.is_empty() {
            return None;
        }
        Some(
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| format!("{k}={v}")))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// Access to a cluster
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the live manifest of a workload
    async fn read(&self, target: &ResourceTarget) -> Result<Manifest, ExternalCommandError>;

    /// Set the given requests and limits on the workload's primary container
    async fn patch(
        &self,
        target: &ResourceTarget,
        desired: &ResourceQuantities,
        mode: PatchMode,
    ) -> Result<(), ExternalCommandError>;

    /// Instances currently backing the workload
    async fn instances(
        &self,
        target: &ResourceTarget,
    ) -> Result<Vec<InstanceStatus>, ExternalCommandError>;
}
