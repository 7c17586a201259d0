//! Viability thresholds and the concurrency plan they produce.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{DomainTask, UNCLASSIFIED_DOMAIN};
use crate::merge::PrecedenceTable;

/// Tolerance for the floating-point overlap comparison.
const OVERLAP_EPSILON: f64 = 1e-9;

/// Limits a task breakdown must meet to run in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierThresholds {
    /// Minimum distinct files.
    pub min_files: usize,
    /// Minimum classified domains.
    pub min_domains: usize,
    /// Maximum share of files claimed by two or more domains (0.0–1.0).
    pub max_overlap: f64,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            min_files: 5,
            min_domains: 2,
            max_overlap: 0.30,
        }
    }
}

/// A threshold the plan failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Threshold {
    FileCount,
    DomainCount,
    OverlapRatio,
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::FileCount => f.write_str("file_count"),
            Threshold::DomainCount => f.write_str("domain_count"),
            Threshold::OverlapRatio => f.write_str("overlap_ratio"),
        }
    }
}

/// Decision on whether a unit's tasks can run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyPlan {
    pub viable: bool,
    pub reason: String,
    /// First failing threshold, in file_count, domain_count, overlap_ratio
    /// order.
    pub failed_threshold: Option<Threshold>,
    pub file_count: usize,
    pub domain_count: usize,
    pub overlap_ratio: f64,
    /// Domains in merge order. Empty unless `viable`.
    pub domains: Vec<DomainTask>,
    /// Files no rule or label could place.
    pub unclassified: Vec<String>,
}

impl ConcurrencyPlan {
    /// Domain names in merge order.
    pub fn domain_names(&self) -> Vec<&str> {
        self.domains.iter().map(|d| d.domain.as_str()).collect()
    }

    /// Every file in the breakdown, sorted.
    pub fn all_files(&self) -> Vec<String> {
        let files: BTreeSet<&String> = self
            .domains
            .iter()
            .flat_map(|d| d.files.iter())
            .chain(self.unclassified.iter())
            .collect();
        files.into_iter().cloned().collect()
    }
}

/// Evaluate `tasks` (one per domain bucket, the unclassified bucket included)
/// against `thresholds`.
pub fn evaluate(
    tasks: &[DomainTask],
    thresholds: &ClassifierThresholds,
    precedence: &PrecedenceTable,
) -> ConcurrencyPlan {
    let mut membership: BTreeMap<&str, usize> = BTreeMap::new();
    for task in tasks {
        let files: BTreeSet<&str> = task.files.iter().map(String::as_str).collect();
        for f in files {
            *membership.entry(f).or_default() += 1;
        }
    }
    let file_count = membership.len();
    let shared = membership.values().filter(|&&n| n >= 2).count();
    let overlap_ratio = if file_count == 0 {
        0.0
    } else {
        shared as f64 / file_count as f64
    };

    let classified: Vec<&DomainTask> = tasks
        .iter()
        .filter(|t| t.domain != UNCLASSIFIED_DOMAIN && !t.files.is_empty())
        .collect();
    let domain_count = classified.len();
    let unclassified: Vec<String> = tasks
        .iter()
        .filter(|t| t.domain == UNCLASSIFIED_DOMAIN)
        .flat_map(|t| t.files.iter().cloned())
        .collect();

    let mut failures: Vec<(Threshold, String)> = Vec::new();
    if file_count < thresholds.min_files {
        failures.push((
            Threshold::FileCount,
            format!("file_count: {file_count} < {}", thresholds.min_files),
        ));
    }
    if domain_count < thresholds.min_domains {
        failures.push((
            Threshold::DomainCount,
            format!("domain_count: {domain_count} < {}", thresholds.min_domains),
        ));
    }
    if overlap_ratio > thresholds.max_overlap + OVERLAP_EPSILON {
        failures.push((
            Threshold::OverlapRatio,
            format!(
                "overlap_ratio: {overlap_ratio:.2} > {:.2}",
                thresholds.max_overlap
            ),
        ));
    }

    let viable = failures.is_empty();
    let (reason, failed_threshold) = if viable {
        (
            format!(
                "{file_count} files across {domain_count} domains, overlap {overlap_ratio:.2}"
            ),
            None,
        )
    } else {
        let reason = failures
            .iter()
            .map(|(_, msg)| msg.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        (reason, failures.first().map(|(t, _)| *t))
    };

    let domains = if viable {
        let order = precedence.order(
            tasks
                .iter()
                .filter(|t| !t.files.is_empty())
                .map(|t| t.domain.as_str()),
        );
        order
            .iter()
            .filter_map(|name| tasks.iter().find(|t| &t.domain == name).cloned())
            .collect()
    } else {
        Vec::new()
    };

    ConcurrencyPlan {
        viable,
        reason,
        failed_threshold,
        file_count,
        domain_count,
        overlap_ratio,
        domains,
        unclassified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(domain: &str, files: &[&str]) -> DomainTask {
        DomainTask::new(domain, files.iter().map(|f| f.to_string()).collect())
    }

    fn eval(tasks: &[DomainTask]) -> ConcurrencyPlan {
        evaluate(tasks, &ClassifierThresholds::default(), &PrecedenceTable::default())
    }

    #[test]
    fn empty_breakdown_is_not_viable() {
        let plan = eval(&[]);
        assert!(!plan.viable);
        assert_eq!(plan.file_count, 0);
        assert_eq!(plan.overlap_ratio, 0.0);
        assert_eq!(plan.failed_threshold, Some(Threshold::FileCount));
    }

    #[test]
    fn reason_lists_every_failing_threshold_in_order() {
        let plan = eval(&[task("api", &["a", "b", "c", "d"])]);
        assert_eq!(plan.reason, "file_count: 4 < 5; domain_count: 1 < 2");
        assert_eq!(plan.failed_threshold, Some(Threshold::FileCount));
        assert!(plan.domains.is_empty());
    }

    #[test]
    fn unclassified_alone_is_excluded() {
        let plan = eval(&[task(UNCLASSIFIED_DOMAIN, &["a", "b", "c", "d", "e", "f"])]);
        assert!(!plan.viable);
        assert_eq!(plan.domain_count, 0);
        assert_eq!(plan.failed_threshold, Some(Threshold::DomainCount));
        assert_eq!(plan.unclassified.len(), 6);
    }

    #[test]
    fn unclassified_trails_a_viable_plan() {
        let plan = eval(&[
            task(UNCLASSIFIED_DOMAIN, &["Makefile"]),
            task("ui", &["u1", "u2"]),
            task("api", &["a1", "a2"]),
        ]);
        assert!(plan.viable, "{}", plan.reason);
        assert_eq!(plan.domain_count, 2);
        assert_eq!(plan.domain_names(), vec!["api", "ui", UNCLASSIFIED_DOMAIN]);
    }

    #[test]
    fn overlap_counts_files_claimed_twice() {
        let plan = eval(&[
            task("api", &["shared", "a1", "a2"]),
            task("ui", &["shared", "u1", "u2"]),
        ]);
        assert_eq!(plan.file_count, 5);
        assert!((plan.overlap_ratio - 0.2).abs() < 1e-12);
        assert!(plan.viable);
    }
}
