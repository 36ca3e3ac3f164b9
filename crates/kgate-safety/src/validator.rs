//! Risk & safety validation
//!
//! `SafetyValidator::assess` is a pure function of the change-set and the
//! configuration. Rules are evaluated per change and per change-set, each
//! producing a warning; the overall risk is the most severe warning.

use crate::error::{SafetyConfigError, ValidationError};
use crate::types::{validate_change_set, ResourceChange, ResourceTarget};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Any increase beyond this is extreme, whatever the configured limit
pub const EXTREME_INCREASE_PERCENT: f64 = 1000.0;
/// Any decrease beyond this is extreme
pub const EXTREME_DECREASE_PERCENT: f64 = -90.0;

/// Ordered risk level
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which rule produced a warning
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    ChangeLimitExceeded,
    ExtremeChange,
    HighImpactChange,
    ProductionNamespace,
    CriticalWorkload,
    BulkChange,
    MultipleProductionNamespaces,
}

impl WarningCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChangeLimitExceeded => "change_limit_exceeded",
            Self::ExtremeChange => "extreme_change",
            Self::HighImpactChange => "high_impact_change",
            Self::ProductionNamespace => "production_namespace",
            Self::CriticalWorkload => "critical_workload",
            Self::BulkChange => "bulk_change",
            Self::MultipleProductionNamespaces => "multiple_production_namespaces",
        }
    }
}

impl fmt::Display for WarningCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finding of the validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyWarning {
    pub code: WarningCode,
    pub level: RiskLevel,
    /// Affected object (target, namespace or the whole change-set)
    pub affected: String,
    pub message: String,
    pub recommendation: String,
    /// Limit or pattern that fired
    pub trigger: String,
}

/// Validator thresholds and patterns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Largest allowed increase; anything above blocks the change-set
    pub max_change_percent: f64,
    /// Absolute change above which a change counts as high impact
    pub high_impact_percent: f64,
    /// Change-sets larger than this are bulk changes
    pub bulk_change_threshold: usize,
    /// More distinct production namespaces than this raises risk to HIGH
    pub max_production_namespaces: usize,
    pub production_namespace_patterns: Vec<String>,
    pub critical_workload_patterns: Vec<String>,
}

impl SafetyConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn with_max_change_percent(mut self, percent: f64) -> Self {
        self.max_change_percent = percent;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_production_patterns(mut self, patterns: Vec<String>) -> Self {
        self.production_namespace_patterns = patterns;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_critical_patterns(mut self, patterns: Vec<String>) -> Self {
        self.critical_workload_patterns = patterns;
        self
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_change_percent: 500.0,
            high_impact_percent: 100.0,
            bulk_change_threshold: 20,
            max_production_namespaces: 3,
            production_namespace_patterns: [
                "^prod.*",
                "^production.*",
                ".*-prod$",
                ".*-production$",
                "^default$",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            critical_workload_patterns: [
                ".*critical.*",
                ".*database.*",
                ".*db.*",
                ".*redis.*",
                ".*etcd.*",
                ".*postgres.*",
                ".*mysql.*",
                ".*ingress.*",
                ".*controller.*",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Result of assessing a change-set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyAssessment {
    pub risk_level: RiskLevel,
    pub warnings: Vec<SafetyWarning>,
    /// True when the change-set must not be applied at all
    pub blocked: bool,
    pub resources_affected: usize,
    pub production_namespaces: Vec<String>,
    pub critical_workloads: usize,
    pub high_impact_changes: usize,
    pub average_cpu_change_percent: Option<f64>,
    pub average_memory_change_percent: Option<f64>,
    pub requires_gradual_rollout: bool,
    pub requires_monitoring: bool,
    pub requires_backup: bool,
    pub recommendations: Vec<String>,
}

impl SafetyAssessment {
    fn empty() -> Self {
        Self {
            risk_level: RiskLevel::Low,
            warnings: Vec::new(),
            blocked: false,
            resources_affected: 0,
            production_namespaces: Vec::new(),
            critical_workloads: 0,
            high_impact_changes: 0,
            average_cpu_change_percent: None,
            average_memory_change_percent: None,
            requires_gradual_rollout: false,
            requires_monitoring: false,
            requires_backup: false,
            recommendations: Vec::new(),
        }
    }

    /// Whether any warning carries the given code
    #[must_use]
    pub fn has_warning(&self, code: WarningCode) -> bool {
        self.warnings.iter().any(|w| w.code == code)
    }

    /// Triggers of every blocking warning
    #[must_use]
    pub fn blocking_triggers(&self) -> Vec<String> {
        self.warnings
            .iter()
            .filter(|w| w.code == WarningCode::ChangeLimitExceeded)
            .map(|w| format!("{}: {}", w.affected, w.trigger))
            .collect()
    }
}

struct CompiledPattern {
    source: String,
    regex: Regex,
}

fn compile(patterns: &[String]) -> Result<Vec<CompiledPattern>, SafetyConfigError> {
    patterns
        .iter()
        .map(|pattern| {
            regex::RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(|regex| CompiledPattern {
                    source: pattern.clone(),
                    regex,
                })
                .map_err(|source| SafetyConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
        })
        .collect()
}

fn first_match<'a>(patterns: &'a [CompiledPattern], value: &str) -> Option<&'a str> {
    let lowered = value.to_lowercase();
    patterns
        .iter()
        .find(|p| p.regex.is_match(&lowered))
        .map(|p| p.source.as_str())
}

/// Deterministic risk assessor
pub struct SafetyValidator {
    config: SafetyConfig,
    production: Vec<CompiledPattern>,
    critical: Vec<CompiledPattern>,
}

impl fmt::Debug for SafetyValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafetyValidator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SafetyValidator {
    /// Compile the configured patterns
    ///
    /// # Errors
    /// Returns `SafetyConfigError` for an invalid pattern or a
    /// non-positive threshold.
    pub fn new(config: SafetyConfig) -> Result<Self, SafetyConfigError> {
        for (name, value) in [
            ("max_change_percent", config.max_change_percent),
            ("high_impact_percent", config.high_impact_percent),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(SafetyConfigError::InvalidThreshold { name, value });
            }
        }
        let production = compile(&config.production_namespace_patterns)?;
        let critical = compile(&config.critical_workload_patterns)?;
        Ok(Self {
            config,
            production,
            critical,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Pattern that marks `namespace` as production, if any
    #[must_use]
    pub fn production_pattern(&self, namespace: &str) -> Option<&str> {
        first_match(&self.production, namespace)
    }

    /// Pattern that marks the workload `name` as critical, if any
    #[must_use]
    pub fn critical_pattern(&self, name: &str) -> Option<&str> {
        first_match(&self.critical, name)
    }

    /// Assess a change-set
    ///
    /// # Errors
    /// Returns `ValidationError` if any change is malformed.
    pub fn assess(&self, changes: &[ResourceChange]) -> Result<SafetyAssessment, ValidationError> {
        validate_change_set(changes)?;
        if changes.is_empty() {
            return Ok(SafetyAssessment::empty());
        }

        let mut warnings = Vec::new();
        let mut production_namespaces = BTreeSet::new();
        let mut critical_workloads = 0;
        let mut high_impact_changes = 0;
        let mut max_abs_percent: f64 = 0.0;
        let mut cpu_percents = Vec::new();
        let mut memory_percents = Vec::new();

        for change in changes {
            let target = change.target();
            let mut high_impact = false;

            for delta in change.deltas() {
                if delta.field.is_cpu() {
                    cpu_percents.push(delta.percent);
                } else {
                    memory_percents.push(delta.percent);
                }
                max_abs_percent = max_abs_percent.max(delta.percent.abs());
                if delta.percent.abs() > self.config.high_impact_percent {
                    high_impact = true;
                }
                self.field_warnings(target, delta.field.as_str(), delta.percent, &mut warnings);
            }
            if high_impact {
                high_impact_changes += 1;
            }

            if let Some(pattern) = self.production_pattern(&target.namespace) {
                if production_namespaces.insert(target.namespace.clone()) {
                    warnings.push(SafetyWarning {
                        code: WarningCode::ProductionNamespace,
                        level: RiskLevel::Medium,
                        affected: target.namespace.clone(),
                        message: format!("namespace {} is a production namespace", target.namespace),
                        recommendation: "Apply during a maintenance window and monitor closely"
                            .to_string(),
                        trigger: pattern.to_string(),
                    });
                }
            }

            if let Some(pattern) = self.critical_pattern(&target.name) {
                critical_workloads += 1;
                warnings.push(SafetyWarning {
                    code: WarningCode::CriticalWorkload,
                    level: RiskLevel::High,
                    affected: target.to_string(),
                    message: format!("{} is a critical workload", target.name),
                    recommendation: "Verify capacity headroom and have a rollback ready"
                        .to_string(),
                    trigger: pattern.to_string(),
                });
            }
        }

        if changes.len() > self.config.bulk_change_threshold {
            warnings.push(SafetyWarning {
                code: WarningCode::BulkChange,
                level: RiskLevel::Medium,
                affected: "change-set".to_string(),
                message: format!("{} simultaneous changes", changes.len()),
                recommendation: "Split the change-set into smaller batches".to_string(),
                trigger: format!("bulk_change_threshold={}", self.config.bulk_change_threshold),
            });
        }

        if production_namespaces.len() > self.config.max_production_namespaces {
            warnings.push(SafetyWarning {
                code: WarningCode::MultipleProductionNamespaces,
                level: RiskLevel::High,
                affected: "change-set".to_string(),
                message: format!(
                    "{} production namespaces affected at once",
                    production_namespaces.len()
                ),
                recommendation: "Roll out one production namespace at a time".to_string(),
                trigger: format!(
                    "max_production_namespaces={}",
                    self.config.max_production_namespaces
                ),
            });
        }

        let risk_level = warnings
            .iter()
            .map(|w| w.level)
            .max()
            .unwrap_or(RiskLevel::Low);
        let blocked = warnings
            .iter()
            .any(|w| w.code == WarningCode::ChangeLimitExceeded);
        let has_critical_warning = warnings.iter().any(|w| w.level == RiskLevel::Critical);
        let production_namespaces: Vec<String> = production_namespaces.into_iter().collect();

        let requires_gradual_rollout =
            high_impact_changes >= 3 || max_abs_percent > 200.0 || has_critical_warning;
        let requires_monitoring = !production_namespaces.is_empty()
            || high_impact_changes > 0
            || warnings.iter().any(|w| w.level >= RiskLevel::Medium);
        let requires_backup =
            has_critical_warning || !production_namespaces.is_empty() || changes.len() > 10;

        let mut recommendations: Vec<String> = Vec::new();
        for warning in &warnings {
            if !recommendations.contains(&warning.recommendation) {
                recommendations.push(warning.recommendation.clone());
            }
        }
        if requires_gradual_rollout {
            recommendations.push("Roll out gradually, non-production namespaces first".to_string());
        }
        if requires_backup {
            recommendations.push("Keep the rollback snapshot until the change is verified".to_string());
        }

        Ok(SafetyAssessment {
            risk_level,
            warnings,
            blocked,
            resources_affected: changes.len(),
            production_namespaces,
            critical_workloads,
            high_impact_changes,
            average_cpu_change_percent: average(&cpu_percents),
            average_memory_change_percent: average(&memory_percents),
            requires_gradual_rollout,
            requires_monitoring,
            requires_backup,
            recommendations,
        })
    }

    fn field_warnings(
        &self,
        target: &ResourceTarget,
        field: &str,
        percent: f64,
        warnings: &mut Vec<SafetyWarning>,
    ) {
        let affected = format!("{target} {field}");
        let mut flagged = false;

        if percent > self.config.max_change_percent {
            flagged = true;
            warnings.push(SafetyWarning {
                code: WarningCode::ChangeLimitExceeded,
                level: RiskLevel::Critical,
                affected: affected.clone(),
                message: format!(
                    "{field} increase of {percent:.1}% exceeds the {:.0}% limit",
                    self.config.max_change_percent
                ),
                recommendation: "Reduce the change or apply it in several smaller steps"
                    .to_string(),
                trigger: format!("max_change_percent={}", self.config.max_change_percent),
            });
        }

        if percent > EXTREME_INCREASE_PERCENT || percent < EXTREME_DECREASE_PERCENT {
            flagged = true;
            let trigger = if percent > 0.0 {
                format!("increase>{EXTREME_INCREASE_PERCENT}%")
            } else {
                format!("decrease>{}%", -EXTREME_DECREASE_PERCENT)
            };
            warnings.push(SafetyWarning {
                code: WarningCode::ExtremeChange,
                level: RiskLevel::Critical,
                affected: affected.clone(),
                message: format!("{field} change of {percent:.1}% is extreme"),
                recommendation: "Double-check the recommendation before applying".to_string(),
                trigger,
            });
        }

        if !flagged && percent.abs() > self.config.high_impact_percent {
            warnings.push(SafetyWarning {
                code: WarningCode::HighImpactChange,
                level: RiskLevel::Medium,
                affected,
                message: format!("{field} change of {percent:.1}% is high impact"),
                recommendation: "Monitor the workload after the change".to_string(),
                trigger: format!("high_impact_percent={}", self.config.high_impact_percent),
            });
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
