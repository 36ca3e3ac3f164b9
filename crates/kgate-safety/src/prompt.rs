//! Human-readable confirmation prompts and change summaries

use crate::types::ResourceChange;
use crate::validator::{RiskLevel, SafetyAssessment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Counts over a change-set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub total_changes: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_namespace: BTreeMap<String, usize>,
    pub cpu_increases: usize,
    pub cpu_decreases: usize,
    pub memory_increases: usize,
    pub memory_decreases: usize,
}

impl ChangeSummary {
    #[must_use]
    pub fn of(changes: &[ResourceChange]) -> Self {
        let mut summary = Self {
            total_changes: changes.len(),
            ..Self::default()
        };
        for change in changes {
            *summary.by_kind.entry(change.target().kind.clone()).or_default() += 1;
            *summary
                .by_namespace
                .entry(change.target().namespace.clone())
                .or_default() += 1;
            for delta in change.deltas() {
                let bucket = match (delta.field.is_cpu(), delta.is_increase()) {
                    (true, true) => &mut summary.cpu_increases,
                    (true, false) if delta.proposed < delta.current => &mut summary.cpu_decreases,
                    (false, true) => &mut summary.memory_increases,
                    (false, false) if delta.proposed < delta.current => {
                        &mut summary.memory_decreases
                    }
                    _ => continue,
                };
                *bucket += 1;
            }
        }
        summary
    }
}

pub(crate) struct PromptLimits {
    pub(crate) max_changes: usize,
    pub(crate) max_warnings: usize,
}

pub(crate) fn render(
    changes: &[ResourceChange],
    risk_level: RiskLevel,
    assessment: Option<&SafetyAssessment>,
    expires_at: DateTime<Utc>,
    limits: &PromptLimits,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Resource changes require confirmation");
    let _ = writeln!(out, "Risk level: {risk_level}");
    let _ = writeln!(out, "Resources affected: {}", changes.len());
    let _ = writeln!(out);

    let _ = writeln!(out, "Changes:");
    for change in changes.iter().take(limits.max_changes) {
        let _ = writeln!(out, "  - {}", change.target());
        for delta in change.deltas() {
            let field = delta.field;
            let _ = writeln!(
                out,
                "      {field}: {} -> {} ({:+.1}%)",
                change.current().display(field).unwrap_or_default(),
                change.proposed().display(field).unwrap_or_default(),
                delta.percent
            );
        }
    }
    if changes.len() > limits.max_changes {
        let _ = writeln!(out, "  ... and {} more", changes.len() - limits.max_changes);
    }

    if let Some(assessment) = assessment {
        if !assessment.warnings.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Warnings:");
            for warning in assessment.warnings.iter().take(limits.max_warnings) {
                let _ = writeln!(out, "  [{}] {}: {}", warning.level, warning.code, warning.message);
            }
            if assessment.warnings.len() > limits.max_warnings {
                let _ = writeln!(
                    out,
                    "  ... and {} more",
                    assessment.warnings.len() - limits.max_warnings
                );
            }
        }
        if !assessment.recommendations.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Recommendations:");
            for recommendation in &assessment.recommendations {
                let _ = writeln!(out, "  - {recommendation}");
            }
        }
        if !assessment.production_namespaces.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "Production namespaces: {}",
                assessment.production_namespaces.join(", ")
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Confirm before {}", expires_at.to_rfc3339());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::{CpuQuantity, MemoryQuantity, ResourceQuantities};
    use crate::types::ResourceTarget;
    use pretty_assertions::assert_eq;

    fn change(ns: &str, name: &str) -> ResourceChange {
        ResourceChange::new(
            ResourceTarget::deployment("c1", ns, name),
            ResourceQuantities::new()
                .with_cpu_request(CpuQuantity::from_millicores(100))
                .with_memory_request(MemoryQuantity::from_mebibytes(256)),
            ResourceQuantities::new()
                .with_cpu_request(CpuQuantity::from_millicores(200))
                .with_memory_request(MemoryQuantity::from_mebibytes(128)),
        )
    }

    #[test]
    fn summary_counts() {
        let summary = ChangeSummary::of(&[change("a", "x"), change("a", "y"), change("b", "z")]);
        assert_eq!(summary.total_changes, 3);
        assert_eq!(summary.by_namespace.get("a"), Some(&2));
        assert_eq!(summary.by_kind.get("Deployment"), Some(&3));
        assert_eq!(summary.cpu_increases, 3);
        assert_eq!(summary.memory_decreases, 3);
        assert_eq!(summary.cpu_decreases, 0);
    }

    #[test]
    fn prompt_truncates_change_list() {
        let changes: Vec<ResourceChange> = (0..12).map(|i| change("a", &format!("w{i}"))).collect();
        let prompt = render(
            &changes,
            RiskLevel::Low,
            None,
            Utc::now(),
            &PromptLimits {
                max_changes: 10,
                max_warnings: 5,
            },
        );
        assert!(prompt.contains("Risk level: LOW"));
        assert!(prompt.contains("... and 2 more"));
        assert!(prompt.contains("cpu_request: 100m -> 200m (+100.0%)"));
        assert!(!prompt.contains("w11"));
    }
}
