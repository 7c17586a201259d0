//! Workspace records and their lifecycle.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an isolated workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Created,
    Running,
    Completed,
    Failed,
    Merged,
    Conflict,
    Cleaned,
}

impl WorkspaceStatus {
    /// Whether `self -> next` is an edge of the workspace state machine.
    pub fn can_transition_to(self, next: WorkspaceStatus) -> bool {
        use WorkspaceStatus::*;
        matches!(
            (self, next),
            (Created, Running | Failed | Cleaned)
                | (Running, Completed | Failed)
                | (Completed, Merged | Conflict | Cleaned)
                | (Conflict, Merged | Conflict | Cleaned)
                | (Failed, Cleaned)
                | (Merged, Cleaned)
                | (Cleaned, Cleaned)
        )
    }

    /// No further worker activity will happen in this state.
    pub fn is_terminal_for_worker(self) -> bool {
        !matches!(self, WorkspaceStatus::Created | WorkspaceStatus::Running)
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspaceStatus::Created => "created",
            WorkspaceStatus::Running => "running",
            WorkspaceStatus::Completed => "completed",
            WorkspaceStatus::Failed => "failed",
            WorkspaceStatus::Merged => "merged",
            WorkspaceStatus::Conflict => "conflict",
            WorkspaceStatus::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}

/// One branch-scoped worktree executing a single domain of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    /// `<unit>-<domain>-<suffix>`, lowercase.
    pub name: String,
    pub unit_id: String,
    pub domain: String,
    pub branch: String,
    pub path: PathBuf,
    pub base_branch: String,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaned_at: Option<DateTime<Utc>>,
    /// Commits on the branch beyond the base.
    #[serde(default)]
    pub commits: usize,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Lowercase `[a-z0-9-]` form of `raw` with runs of other characters
/// collapsed to one hyphen.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "domain".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Workspace name for `unit_id`/`domain` with random `suffix`.
pub fn workspace_name(unit_id: &str, domain: &str, suffix: &str) -> String {
    format!("{}-{}-{}", sanitize(unit_id), sanitize(domain), suffix)
}

/// Branch for `unit_id`/`domain` with random `suffix`.
pub fn workspace_branch(unit_id: &str, domain: &str, suffix: &str) -> String {
    format!("epicflow/{unit_id}/{}-{suffix}", sanitize(domain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkspaceStatus::*;

    #[test]
    fn state_machine_edges() {
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Conflict));
        assert!(Conflict.can_transition_to(Merged));
        assert!(Merged.can_transition_to(Cleaned));
        assert!(Cleaned.can_transition_to(Cleaned));

        assert!(!Running.can_transition_to(Cleaned));
        assert!(!Failed.can_transition_to(Merged));
        assert!(!Cleaned.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
    }

    #[test]
    fn sanitize_collapses_and_lowercases() {
        assert_eq!(sanitize("Backend API"), "backend-api");
        assert_eq!(sanitize("ui//web__x"), "ui-web-x");
        assert_eq!(sanitize("--"), "domain");
        assert_eq!(sanitize("EPIC-007"), "epic-007");
    }

    #[test]
    fn names_and_branches() {
        assert_eq!(
            workspace_name("EPIC-001", "Data", "1a2b3c4d"),
            "epic-001-data-1a2b3c4d"
        );
        assert_eq!(
            workspace_branch("EPIC-001", "Data", "1a2b3c4d"),
            "epicflow/EPIC-001/data-1a2b3c4d"
        );
    }
}
