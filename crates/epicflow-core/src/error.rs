//! Engine error taxonomy.
//!
//! Every variant that stops a run carries enough context for
//! [`EngineError::remediation`] to name the concrete next step.

use std::path::PathBuf;

use epicflow_registry::{RegistryError, UnitStatus};
use thiserror::Error;

use crate::workspace::WorkspaceStatus;

/// Exit code for success.
pub const EXIT_OK: i32 = 0;
/// Exit code for a resumable merge conflict.
pub const EXIT_CONFLICT: i32 = 1;
/// Exit code for every other failure.
pub const EXIT_FAILURE: i32 = 2;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The unit has unresolved blockers.
    #[error("unit {unit_id} is blocked by: {}", blockers.join(", "))]
    Blocked {
        unit_id: String,
        blockers: Vec<String>,
    },

    /// The unit is not in a status a run can start from.
    #[error("unit {unit_id} is {status}; only ready or in_progress units can run")]
    NotRunnable { unit_id: String, status: UnitStatus },

    /// The task breakdown is missing or unreadable.
    #[error("task breakdown for {unit_id} at {} is unusable: {reason}", path.display())]
    TaskBreakdown {
        unit_id: String,
        path: PathBuf,
        reason: String,
    },

    #[error("cannot create workspace {name}: {reason}")]
    WorkspaceCreate { name: String, reason: String },

    #[error("workspace not found: {name}")]
    WorkspaceNotFound { name: String },

    /// The workspace has a live worker in this process.
    #[error("workspace {name} has a running worker")]
    WorkspaceBusy { name: String },

    #[error("invalid workspace transition for {name}: {from} -> {to}")]
    InvalidWorkspaceTransition {
        name: String,
        from: WorkspaceStatus,
        to: WorkspaceStatus,
    },

    /// One or more workers crashed, failed or timed out.
    #[error("worker failed for {unit_id} in {}: {reason}", domains.join(", "))]
    WorkerFailure {
        unit_id: String,
        domains: Vec<String>,
        reason: String,
    },

    /// A domain branch conflicted with the baseline. Resumable.
    #[error(
        "merge conflict for {unit_id} in domain {domain} ({} paths); remaining: {}",
        paths.len(),
        if remaining.is_empty() { "none".to_string() } else { remaining.join(", ") }
    )]
    MergeConflict {
        unit_id: String,
        domain: String,
        paths: Vec<String>,
        remaining: Vec<String>,
    },

    /// An earlier merge for this unit has not finished.
    #[error("unit {unit_id} has an unfinished merge")]
    MergePending { unit_id: String },

    #[error("no merge in progress for {unit_id}")]
    NoMergeState { unit_id: String },

    /// The persisted plan changed since the merge started.
    #[error("plan for {unit_id} changed since the merge began (expected {expected}, found {actual})")]
    PlanMismatch {
        unit_id: String,
        expected: String,
        actual: String,
    },

    #[error("checkout at {} has uncommitted changes", path.display())]
    DirtyCheckout { path: PathBuf },

    /// The baseline checkout is not on the branch the run targets.
    #[error("baseline checkout is on {actual}, expected {expected}")]
    WrongBranch { expected: String, actual: String },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("invalid config at {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("issue mirror error: {0}")]
    Mirror(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::MergeConflict { .. } => EXIT_CONFLICT,
            _ => EXIT_FAILURE,
        }
    }

    /// Concrete next action for the operator, if there is one.
    pub fn remediation(&self) -> Option<String> {
        match self {
            EngineError::Registry(RegistryError::CycleDetected { .. }) => {
                Some("remove one of the listed blocked_by edges with `epicflow unblock`".into())
            }
            EngineError::Registry(RegistryError::InvalidTransition { id, .. }) => Some(format!(
                "use `epicflow rollback {id}` to return the unit to defined first"
            )),
            EngineError::Registry(RegistryError::Corrupt { path, .. }) => Some(format!(
                "repair or restore {} before running epicflow again",
                path.display()
            )),
            EngineError::Registry(RegistryError::NotInitialized { .. }) => {
                Some("run `epicflow init`".into())
            }
            EngineError::Registry(RegistryError::Lock { path, .. }) => Some(format!(
                "wait for the other epicflow process or remove {} if it crashed",
                path.display()
            )),
            EngineError::Blocked { blockers, .. } => Some(format!(
                "implement {} first",
                blockers.join(", ")
            )),
            EngineError::NotRunnable { unit_id, .. } => Some(format!(
                "move {unit_id} to ready with `epicflow status {unit_id} ready`"
            )),
            EngineError::TaskBreakdown { path, .. } => Some(format!(
                "write the task breakdown to {} or pass --tasks",
                path.display()
            )),
            EngineError::WorkspaceCreate { .. } => Some(
                "commit or stash changes in the base checkout, then `epicflow abort` the unit and retry".into(),
            ),
            EngineError::WorkerFailure { unit_id, domains, .. } => Some(format!(
                "inspect runs/{unit_id}/logs for {}, then `epicflow run {unit_id}` to retry",
                domains.join(", ")
            )),
            EngineError::MergeConflict {
                unit_id, domain, ..
            } => Some(format!(
                "resolve the conflict by merging the {domain} branch by hand (or fixing it in its worktree), then `epicflow resume {unit_id}`"
            )),
            EngineError::MergePending { unit_id } => {
                Some(format!("run `epicflow resume {unit_id}`"))
            }
            EngineError::PlanMismatch { unit_id, .. } => Some(format!(
                "`epicflow abort {unit_id}` and run the unit again"
            )),
            EngineError::DirtyCheckout { .. } => {
                Some("commit or stash local changes and retry".into())
            }
            EngineError::WrongBranch { expected, .. } => {
                Some(format!("`git checkout {expected}` in the repository and retry"))
            }
            _ => None,
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_merge_conflict_exits_with_one() {
        let conflict = EngineError::MergeConflict {
            unit_id: "EPIC-001".into(),
            domain: "api".into(),
            paths: vec!["src/api.rs".into()],
            remaining: vec!["ui".into()],
        };
        assert_eq!(conflict.exit_code(), EXIT_CONFLICT);

        let worker = EngineError::WorkerFailure {
            unit_id: "EPIC-001".into(),
            domains: vec!["ui".into()],
            reason: "timed out".into(),
        };
        assert_eq!(worker.exit_code(), EXIT_FAILURE);
        let corrupt: EngineError = RegistryError::corrupt("/x/registry.json", "bad").into();
        assert_eq!(corrupt.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn conflict_names_domain_and_remaining_work() {
        let err = EngineError::MergeConflict {
            unit_id: "EPIC-002".into(),
            domain: "api".into(),
            paths: vec!["a".into(), "b".into()],
            remaining: vec!["ui".into(), "docs".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("api"));
        assert!(msg.contains("2 paths"));
        assert!(msg.contains("ui, docs"));
        assert!(err.remediation().unwrap().contains("epicflow resume EPIC-002"));
    }

    #[test]
    fn blocked_error_lists_blockers() {
        let err = EngineError::Blocked {
            unit_id: "EPIC-003".into(),
            blockers: vec!["EPIC-001".into(), "EPIC-002".into()],
        };
        assert!(err.to_string().contains("EPIC-001, EPIC-002"));
        assert!(err.remediation().unwrap().contains("EPIC-001"));
    }
}
