//! `kubectl` subprocess backend

use super::{
    ClusterClient, CommandErrorKind, ContainerStatus, ExternalCommandError, InstanceStatus,
    Manifest, PatchMode,
};
use kgate_safety::{ResourceQuantities, ResourceTarget};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Cluster access through the `kubectl` binary
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    binary: String,
    timeout: Duration,
    context_from_cluster: bool,
}

impl KubectlCluster {
    /// Use `binary` with a per-command timeout
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            context_from_cluster: true,
        }
    }

    /// Whether the target's cluster name selects the kubeconfig context
    #[must_use]
    pub fn with_context_from_cluster(mut self, enabled: bool) -> Self {
        self.context_from_cluster = enabled;
        self
    }

    fn base_args(&self, target: &ResourceTarget) -> Vec<String> {
        let mut args = Vec::with_capacity(8);
        if self.context_from_cluster {
            args.push("--context".to_string());
            args.push(target.cluster.clone());
        }
        args.push("--namespace".to_string());
        args.push(target.namespace.clone());
        args
    }

    async fn run(
        &self,
        operation: &str,
        target: &ResourceTarget,
        args: Vec<String>,
    ) -> Result<String, ExternalCommandError> {
        debug!(%target, operation, ?args, "kubectl");
        let mut command = Command::new(&self.binary);
        command.args(&args).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => {
                return Err(ExternalCommandError::new(
                    CommandErrorKind::Timeout,
                    operation,
                    target,
                    format!("no response within {}s", self.timeout.as_secs()),
                ))
            }
            Ok(Err(e)) => {
                return Err(ExternalCommandError::new(
                    CommandErrorKind::Failed,
                    operation,
                    target,
                    format!("failed to spawn {}: {e}", self.binary),
                ))
            }
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let kind = classify(&stderr);
            warn!(%target, operation, %kind, "kubectl failed");
            Err(ExternalCommandError::new(kind, operation, target, stderr))
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(
        operation: &str,
        target: &ResourceTarget,
        stdout: &str,
    ) -> Result<T, ExternalCommandError> {
        serde_json::from_str(stdout).map_err(|e| {
            ExternalCommandError::new(
                CommandErrorKind::Failed,
                operation,
                target,
                format!("unparseable output: {e}"),
            )
        })
    }
}

/// Map kubectl stderr to an error kind
pub(crate) fn classify(stderr: &str) -> CommandErrorKind {
    let lowered = stderr.to_lowercase();
    if lowered.contains("not found") {
        CommandErrorKind::NotFound
    } else if lowered.contains("forbidden") || lowered.contains("unauthorized") {
        CommandErrorKind::Forbidden
    } else if lowered.contains("connection refused")
        || lowered.contains("unable to connect")
        || lowered.contains("no such host")
    {
        CommandErrorKind::Unreachable
    } else if lowered.contains("timeout") || lowered.contains("deadline exceeded") {
        CommandErrorKind::Timeout
    } else if lowered.contains("invalid") || lowered.contains("admission webhook") {
        CommandErrorKind::Rejected
    } else {
        CommandErrorKind::Failed
    }
}

/// Strategic-merge patch setting resources on the named container
pub(crate) fn resources_patch(container: &str, desired: &ResourceQuantities) -> Value {
    let mut requests = Map::new();
    let mut limits = Map::new();
    if let Some(cpu) = desired.cpu_request {
        requests.insert("cpu".into(), Value::String(cpu.to_string()));
    }
    if let Some(memory) = desired.memory_request {
        requests.insert("memory".into(), Value::String(memory.to_string()));
    }
    if let Some(cpu) = desired.cpu_limit {
        limits.insert("cpu".into(), Value::String(cpu.to_string()));
    }
    if let Some(memory) = desired.memory_limit {
        limits.insert("memory".into(), Value::String(memory.to_string()));
    }
    let mut resources = Map::new();
    if !requests.is_empty() {
        resources.insert("requests".into(), Value::Object(requests));
    }
    if !limits.is_empty() {
        resources.insert("limits".into(), Value::Object(limits));
    }
    json!({
        "spec": {"template": {"spec": {"containers": [{
            "name": container,
            "resources": Value::Object(resources),
        }]}}}
    })
}

/// Pod list JSON to instance statuses
pub(crate) fn parse_pods(list: &Value) -> Vec<InstanceStatus> {
    let Some(items) = list.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|pod| {
            let name = pod
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let phase = pod
                .pointer("/status/phase")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string();
            let ready = pod
                .pointer("/status/conditions")
                .and_then(Value::as_array)
                .and_then(|conds| {
                    conds
                        .iter()
                        .find(|c| c.get("type").and_then(Value::as_str) == Some("Ready"))
                })
                .and_then(|c| c.get("status").and_then(Value::as_str))
                == Some("True");
            let containers = pod
                .pointer("/status/containerStatuses")
                .and_then(Value::as_array)
                .map(|statuses| {
                    statuses
                        .iter()
                        .map(|s| ContainerStatus {
                            name: s
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            restart_count: s
                                .get("restartCount")
                                .and_then(Value::as_u64)
                                .and_then(|n| u32::try_from(n).ok())
                                .unwrap_or_default(),
                            waiting_reason: s
                                .pointer("/state/waiting/reason")
                                .and_then(Value::as_str)
                                .map(String::from),
                        })
                        .collect()
                })
                .unwrap_or_default();
            InstanceStatus {
                name,
                phase,
                ready,
                containers,
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl ClusterClient for KubectlCluster {
    async fn read(&self, target: &ResourceTarget) -> Result<Manifest, ExternalCommandError> {
        let mut args = self.base_args(target);
        args.extend([
            "get".to_string(),
            target.kind.to_lowercase(),
            target.name.clone(),
            "--output".to_string(),
            "json".to_string(),
        ]);
        let stdout = self.run("read", target, args).await?;
        Self::parse::<Value>("read", target, &stdout).map(Manifest::new)
    }

    async fn patch(
        &self,
        target: &ResourceTarget,
        desired: &ResourceQuantities,
        mode: PatchMode,
    ) -> Result<(), ExternalCommandError> {
        let manifest = self.read(target).await?;
        let container = manifest.primary_container().ok_or_else(|| {
            ExternalCommandError::new(
                CommandErrorKind::Rejected,
                "patch",
                target,
                "manifest has no containers",
            )
        })?;
        let body = resources_patch(container, desired);

        let mut args = self.base_args(target);
        args.extend([
            "patch".to_string(),
            target.kind.to_lowercase(),
            target.name.clone(),
            "--type".to_string(),
            "strategic".to_string(),
            "--patch".to_string(),
            body.to_string(),
        ]);
        if mode == PatchMode::Simulate {
            args.push("--dry-run=server".to_string());
        }
        self.run("patch", target, args).await.map(|_| ())
    }

    async fn instances(
        &self,
        target: &ResourceTarget,
    ) -> Result<Vec<InstanceStatus>, ExternalCommandError> {
        let manifest = self.read(target).await?;
        let selector = manifest.label_selector().ok_or_else(|| {
            ExternalCommandError::new(
                CommandErrorKind::Failed,
                "instances",
                target,
                "workload has no label selector",
            )
        })?;
        let mut args = self.base_args(target);
        args.extend([
            "get".to_string(),
            "pods".to_string(),
            "--selector".to_string(),
            selector,
            "--output".to_string(),
            "json".to_string(),
        ]);
        let stdout = self.run("instances", target, args).await?;
        let list: Value = Self::parse("instances", target, &stdout)?;
        Ok(parse_pods(&list))
    }
}
