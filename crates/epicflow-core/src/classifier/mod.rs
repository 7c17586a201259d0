//! Parallelism classifier.
//!
//! Groups a unit's file-level task entries into domain buckets and decides
//! whether those buckets are independent enough to run in separate
//! workspaces. Entries without a domain label are placed by path rules;
//! anything still unplaced lands in the [`UNCLASSIFIED_DOMAIN`] bucket.

pub mod plan;
pub mod rules;

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::merge::PrecedenceTable;

pub use plan::{evaluate, ClassifierThresholds, ConcurrencyPlan, Threshold};
pub use rules::{default_rule_specs, describe, DomainRuleSpec, DomainRules};

/// Bucket for files that no label or rule places.
pub const UNCLASSIFIED_DOMAIN: &str = "unclassified";

/// What a task does to its file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Create,
    #[default]
    Modify,
    Delete,
}

/// One `(path, domain, action)` entry of a task breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub action: TaskAction,
}

impl TaskEntry {
    pub fn new(path: impl Into<String>, domain: Option<&str>, action: TaskAction) -> Self {
        Self {
            path: path.into(),
            domain: domain.map(str::to_string),
            action,
        }
    }
}

/// Work for one domain: the files it owns and a description for the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainTask {
    pub domain: String,
    /// Repo-relative paths, sorted and unique.
    pub files: Vec<String>,
    pub description: String,
}

impl DomainTask {
    pub fn new(domain: impl Into<String>, files: Vec<String>) -> Self {
        let domain = domain.into();
        let files: Vec<String> = files.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let description = describe(&domain, files.len());
        Self {
            domain,
            files,
            description,
        }
    }
}

/// Read a task breakdown: a JSON array of [`TaskEntry`].
pub fn load_task_entries(unit_id: &str, path: &Path) -> EngineResult<Vec<TaskEntry>> {
    let raw = std::fs::read(path).map_err(|e| EngineError::TaskBreakdown {
        unit_id: unit_id.to_string(),
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_slice(&raw).map_err(|e| EngineError::TaskBreakdown {
        unit_id: unit_id.to_string(),
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn normalize_label(label: &str) -> Option<String> {
    let label = label.trim().to_lowercase();
    match label.as_str() {
        "" | "other" | UNCLASSIFIED_DOMAIN => None,
        _ => Some(label),
    }
}

/// Classifier configured with rules, thresholds and merge precedence.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: DomainRules,
    thresholds: ClassifierThresholds,
    precedence: PrecedenceTable,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(
            DomainRules::default(),
            ClassifierThresholds::default(),
            PrecedenceTable::default(),
        )
    }
}

impl Classifier {
    pub fn new(
        rules: DomainRules,
        thresholds: ClassifierThresholds,
        precedence: PrecedenceTable,
    ) -> Self {
        Self {
            rules,
            thresholds,
            precedence,
        }
    }

    pub fn thresholds(&self) -> &ClassifierThresholds {
        &self.thresholds
    }

    pub fn with_thresholds(mut self, thresholds: ClassifierThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Domain for one entry: its label, else the first matching rule, else
    /// the unclassified bucket.
    pub fn domain_of(&self, entry: &TaskEntry) -> String {
        entry
            .domain
            .as_deref()
            .and_then(normalize_label)
            .or_else(|| self.rules.classify(&entry.path).map(str::to_string))
            .unwrap_or_else(|| UNCLASSIFIED_DOMAIN.to_string())
    }

    /// Bucket entries by domain, keeping first-seen domain order.
    pub fn group(&self, entries: &[TaskEntry]) -> Vec<DomainTask> {
        let mut buckets: Vec<(String, Vec<String>)> = Vec::new();
        for entry in entries {
            let domain = self.domain_of(entry);
            let path = entry.path.trim().to_string();
            if path.is_empty() {
                continue;
            }
            match buckets.iter_mut().find(|(d, _)| *d == domain) {
                Some((_, files)) => files.push(path),
                None => buckets.push((domain, vec![path])),
            }
        }
        buckets
            .into_iter()
            .map(|(domain, files)| DomainTask::new(domain, files))
            .collect()
    }

    /// Evaluate already-grouped domain tasks.
    pub fn classify(&self, tasks: &[DomainTask]) -> ConcurrencyPlan {
        evaluate(tasks, &self.thresholds, &self.precedence)
    }

    /// Group then evaluate.
    pub fn classify_entries(&self, entries: &[TaskEntry]) -> ConcurrencyPlan {
        self.classify(&self.group(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labelled(items: &[(&str, &str)]) -> Vec<TaskEntry> {
        items
            .iter()
            .map(|(p, d)| TaskEntry::new(*p, Some(d), TaskAction::Create))
            .collect()
    }

    #[test]
    fn four_files_one_domain_fails_on_domain_count() {
        let entries = labelled(&[
            ("src/api/a.rs", "api"),
            ("src/api/b.rs", "api"),
            ("src/api/c.rs", "api"),
            ("src/api/d.rs", "api"),
        ]);
        let plan = Classifier::default().classify_entries(&entries);
        assert!(!plan.viable);
        assert!(plan.reason.contains("domain_count"));
    }

    #[test]
    fn three_disjoint_domains_merge_in_precedence_order() {
        let entries = labelled(&[
            ("ui/a.tsx", "ui"),
            ("ui/b.tsx", "ui"),
            ("src/api/a.rs", "api"),
            ("src/api/b.rs", "api"),
            ("migrations/1.sql", "data"),
            ("migrations/2.sql", "data"),
        ]);
        let plan = Classifier::default().classify_entries(&entries);
        assert!(plan.viable, "{}", plan.reason);
        assert_eq!(plan.overlap_ratio, 0.0);
        assert_eq!(plan.file_count, 6);
        assert_eq!(plan.domain_names(), vec!["data", "api", "ui"]);
    }

    #[test]
    fn unlabelled_entries_use_path_rules() {
        let entries = vec![
            TaskEntry::new("src/api/routes.py", None, TaskAction::Modify),
            TaskEntry::new("Makefile", Some("other"), TaskAction::Modify),
        ];
        let tasks = Classifier::default().group(&entries);
        assert_eq!(tasks[0].domain, "backend");
        assert_eq!(tasks[1].domain, UNCLASSIFIED_DOMAIN);
    }

    #[test]
    fn threshold_boundaries_are_inclusive() {
        // 10 files, 3 shared by two domains: overlap exactly 0.30.
        let mut entries = Vec::new();
        for i in 0..4 {
            entries.push(TaskEntry::new(format!("a{i}"), Some("api"), TaskAction::Create));
        }
        for i in 0..3 {
            entries.push(TaskEntry::new(format!("u{i}"), Some("ui"), TaskAction::Create));
        }
        for i in 0..3 {
            entries.push(TaskEntry::new(format!("s{i}"), Some("api"), TaskAction::Modify));
            entries.push(TaskEntry::new(format!("s{i}"), Some("ui"), TaskAction::Modify));
        }
        let classifier = Classifier::default().with_thresholds(ClassifierThresholds {
            min_files: 10,
            min_domains: 2,
            max_overlap: 0.30,
        });
        let plan = classifier.classify_entries(&entries);
        assert_eq!(plan.file_count, 10);
        assert!(plan.viable, "{}", plan.reason);

        let tighter = classifier.clone().with_thresholds(ClassifierThresholds {
            min_files: 11,
            ..*classifier.thresholds()
        });
        let plan = tighter.classify_entries(&entries);
        assert!(!plan.viable);
        assert_eq!(plan.failed_threshold, Some(Threshold::FileCount));
        assert!(plan.reason.contains("file_count"));
    }

    #[test]
    fn task_file_round_trip_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EPIC-001.json");
        std::fs::write(
            &path,
            r#"[{"path": "src/api/x.py", "domain": "backend", "action": "create"},
                {"path": "docs/x.md"}]"#,
        )
        .unwrap();
        let entries = load_task_entries("EPIC-001", &path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].action, TaskAction::Modify);

        let missing = load_task_entries("EPIC-001", &dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, EngineError::TaskBreakdown { .. }));
    }
}
