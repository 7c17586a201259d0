//! On-disk layout of the state directory (`<repo>/.epicflow` by default).

use std::path::{Path, PathBuf};

/// Default state directory name inside the repository.
pub const STATE_DIR_NAME: &str = ".epicflow";

/// Resolves every persisted path from the repository root and state dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    repo: PathBuf,
    state: PathBuf,
}

impl StateLayout {
    /// `state` defaults to `<repo>/.epicflow`.
    pub fn new(repo: impl Into<PathBuf>, state: Option<PathBuf>) -> Self {
        let repo = repo.into();
        let state = state.unwrap_or_else(|| repo.join(STATE_DIR_NAME));
        Self { repo, state }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Holds `registry.json` and `registry.lock`.
    pub fn state_dir(&self) -> &Path {
        &self.state
    }

    pub fn config_path(&self) -> PathBuf {
        self.state.join("config.json")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.state.join("tasks")
    }

    pub fn task_file(&self, unit_id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{unit_id}.json"))
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.state.join("worktrees")
    }

    pub fn worktree_path(&self, name: &str) -> PathBuf {
        self.worktrees_dir().join(name)
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.state.join("workspaces")
    }

    pub fn workspace_meta(&self, name: &str) -> PathBuf {
        self.workspaces_dir().join(format!("{name}.json"))
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state.join("runs")
    }

    pub fn run_dir(&self, unit_id: &str) -> PathBuf {
        self.runs_dir().join(unit_id)
    }

    /// Global lock serialising every mutation of the baseline checkout.
    pub fn merge_lock(&self) -> PathBuf {
        self.state.join("merge.lock")
    }

    pub fn mirror_outbox(&self) -> PathBuf {
        self.state.join("mirror_outbox.jsonl")
    }
}
