//! Loading gate configuration from disk

use kgate_core::executor::{FailurePolicy, TimingPolicy};
use kgate_core::{ClusterBackend, ConfigError, GateConfig, GateError, SafetyGate, TimingPreset};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::time::Duration;

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn loads_file_with_partial_sections() {
    let file = write_config(
        r#"
        actor = "platform-team"

        [confirmation]
        token_timeout_secs = 120

        [retention]
        snapshot_days = 3

        [execution]
        failure_policy = "best_effort"

        [timing]
        preset = "immediate"
        command_timeout_ms = 2000

        [cluster]
        backend = "kubectl"
        kubectl_binary = "/usr/local/bin/kubectl"
        "#,
    );

    let config = GateConfig::load(file.path()).unwrap();
    assert_eq!(config.actor, "platform-team");
    assert_eq!(config.confirmation.token_timeout_secs, 120);
    assert_eq!(config.retention.snapshot_days, 3);
    assert_eq!(config.retention.audit_days, 90);
    assert_eq!(config.execution.failure_policy, FailurePolicy::BestEffort);
    assert_eq!(config.timing.preset, TimingPreset::Immediate);
    assert_eq!(config.cluster.backend, ClusterBackend::Kubectl);

    let policy = config.timing.policy();
    assert_eq!(policy.command_timeout, Duration::from_secs(2));
    assert_eq!(policy.settle_delay, TimingPolicy::immediate().settle_delay);
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = GateConfig::load(&path).unwrap_err();
    match err {
        ConfigError::Io { path: reported, .. } => assert_eq!(reported, path),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn saved_config_round_trips_through_disk() {
    let config = GateConfig::default().with_actor("round-trip");
    let file = write_config(&config.to_toml_string().unwrap());
    assert_eq!(GateConfig::load(file.path()).unwrap(), config);
}

#[test]
fn gate_refuses_invalid_config() {
    let mut config = GateConfig::default();
    config.rollout.success_threshold = -0.5;
    let err = SafetyGate::builder(config).build().unwrap_err();
    assert!(matches!(err, GateError::Config(ConfigError::Invalid { .. })));
    assert_eq!(err.report().code, "CONFIG_INVALID");
}
