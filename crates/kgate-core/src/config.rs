//! Gate configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file)
//! gives a working gate against the in-memory cluster.

use kgate_executor::{ExecutionConfig, RolloutConfig, StabilityThresholds, TimingPolicy};
use kgate_safety::{ConfirmationConfig, SafetyConfig, SafetyConfigError, SafetyValidator};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Value out of range
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// Pattern or threshold the validator refuses
    #[error(transparent)]
    Safety(#[from] SafetyConfigError),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// How long stored state is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub snapshot_days: u32,
    pub audit_days: u32,
    /// Period of the background sweeper
    pub sweep_interval_secs: u64,
}

impl RetentionConfig {
    #[must_use]
    pub fn snapshot_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.snapshot_days))
    }

    #[must_use]
    pub fn audit_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.audit_days))
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            snapshot_days: 7,
            audit_days: 90,
            sweep_interval_secs: 300,
        }
    }
}

/// Named timing preset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingPreset {
    Immediate,
    Mock,
    #[default]
    Production,
}

/// Preset plus per-field overrides in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub preset: TimingPreset,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_stage_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_stage_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub late_stage_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settle_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,
}

impl TimingConfig {
    #[inline]
    #[must_use]
    pub fn preset(preset: TimingPreset) -> Self {
        Self {
            preset,
            ..Self::default()
        }
    }

    /// Resolve the preset and apply overrides
    #[must_use]
    pub fn policy(&self) -> TimingPolicy {
        let mut policy = match self.preset {
            TimingPreset::Immediate => TimingPolicy::immediate(),
            TimingPreset::Mock => TimingPolicy::mock(),
            TimingPreset::Production => TimingPolicy::production(),
        };
        let overrides = [
            (self.first_stage_delay_ms, &mut policy.first_stage_delay),
            (self.middle_stage_delay_ms, &mut policy.middle_stage_delay),
            (self.late_stage_delay_ms, &mut policy.late_stage_delay),
            (self.settle_delay_ms, &mut policy.settle_delay),
            (self.command_timeout_ms, &mut policy.command_timeout),
            (self.retry_backoff_ms, &mut policy.retry_backoff),
        ];
        for (ms, slot) in overrides {
            if let Some(ms) = ms {
                *slot = Duration::from_millis(ms);
            }
        }
        policy
    }
}

/// Which cluster backend the gate talks to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBackend {
    /// In-memory cluster
    #[default]
    Mock,
    /// `kubectl` subprocesses
    Kubectl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub backend: ClusterBackend,
    pub kubectl_binary: String,
    /// Pass the target's cluster name as `--context`
    pub context_from_cluster: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: ClusterBackend::Mock,
            kubectl_binary: "kubectl".to_string(),
            context_from_cluster: true,
        }
    }
}

/// Complete gate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Actor recorded on audit entries
    pub actor: String,
    pub safety: SafetyConfig,
    pub confirmation: ConfirmationConfig,
    pub retention: RetentionConfig,
    pub execution: ExecutionConfig,
    pub rollout: RolloutConfig,
    pub timing: TimingConfig,
    pub validation: StabilityThresholds,
    pub cluster: ClusterConfig,
}

impl GateConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and validate a TOML file
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// Returns `ConfigError` on a syntax error or an out-of-range value.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `ConfigError::Serialize` if the value cannot be represented.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the gate cannot run with
    ///
    /// # Errors
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.actor.trim().is_empty() {
            return Err(ConfigError::invalid("actor", "must not be empty"));
        }
        let threshold = self.rollout.success_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::invalid(
                "rollout.success_threshold",
                format!("{threshold} is outside 0..=1"),
            ));
        }
        if self.execution.max_concurrency == 0 {
            return Err(ConfigError::invalid(
                "execution.max_concurrency",
                "must be at least 1",
            ));
        }
        if self.confirmation.token_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "confirmation.token_timeout_secs",
                "must be at least 1",
            ));
        }
        if self.retention.snapshot_days == 0 || self.retention.audit_days == 0 {
            return Err(ConfigError::invalid("retention", "days must be at least 1"));
        }
        if self.retention.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "retention.sweep_interval_secs",
                "must be at least 1",
            ));
        }
        if self.cluster.backend == ClusterBackend::Kubectl
            && self.cluster.kubectl_binary.trim().is_empty()
        {
            return Err(ConfigError::invalid("cluster.kubectl_binary", "must not be empty"));
        }
        SafetyValidator::new(self.safety.clone())?;
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_safety(mut self, safety: SafetyConfig) -> Self {
        self.safety = safety;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_confirmation(mut self, confirmation: ConfirmationConfig) -> Self {
        self.confirmation = confirmation;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_rollout(mut self, rollout: RolloutConfig) -> Self {
        self.rollout = rollout;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_validation(mut self, validation: StabilityThresholds) -> Self {
        self.validation = validation;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            actor: "kgate".to_string(),
            safety: SafetyConfig::default(),
            confirmation: ConfirmationConfig::default(),
            retention: RetentionConfig::default(),
            execution: ExecutionConfig::default(),
            rollout: RolloutConfig::default(),
            timing: TimingConfig::default(),
            validation: StabilityThresholds::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgate_executor::{FailurePolicy, ValidationFailureAction};
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_gives_defaults() {
        let config = GateConfig::from_toml_str("").unwrap();
        assert_eq!(config, GateConfig::default());
        assert_eq!(config.confirmation.token_timeout_secs, 300);
        assert_eq!(config.retention.snapshot_days, 7);
        assert_eq!(config.retention.audit_days, 90);
    }

    #[test]
    fn sections_override_defaults() {
        let config = GateConfig::from_toml_str(
            r#"
            actor = "ops-bot"

            [safety]
            max_change_percent = 200.0
            production_namespace_patterns = ["^live-.*"]

            [execution]
            max_concurrency = 2
            failure_policy = "best_effort"

            [rollout]
            success_threshold = 0.8
            on_validation_failure = "rollback"

            [timing]
            preset = "mock"
            settle_delay_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.actor, "ops-bot");
        assert_eq!(config.safety.max_change_percent, 200.0);
        assert_eq!(config.safety.production_namespace_patterns, vec!["^live-.*"]);
        assert_eq!(config.safety.bulk_change_threshold, 20);
        assert_eq!(config.execution.max_concurrency, 2);
        assert_eq!(config.execution.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(
            config.rollout.on_validation_failure,
            ValidationFailureAction::Rollback
        );

        let policy = config.timing.policy();
        assert_eq!(policy.settle_delay, Duration::from_millis(250));
        assert_eq!(policy.first_stage_delay, TimingPolicy::mock().first_stage_delay);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = GateConfig::from_toml_str("[rollout]\nsuccess_threshold = 1.5\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "rollout.success_threshold",
                ..
            }
        ));

        let err = GateConfig::from_toml_str("[execution]\nmax_concurrency = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "execution.max_concurrency",
                ..
            }
        ));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let err = GateConfig::from_toml_str("[safety]\ncritical_workload_patterns = [\"(\"]\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Safety(_)));
    }

    #[test]
    fn serialized_config_parses_back() {
        let config = GateConfig::default()
            .with_actor("reviewer")
            .with_timing(TimingConfig::preset(TimingPreset::Immediate));
        let text = config.to_toml_string().unwrap();
        assert_eq!(GateConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn unknown_preset_fails_to_parse() {
        let err = GateConfig::from_toml_str("[timing]\npreset = \"glacial\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
