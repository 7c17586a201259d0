//! Merge loop.
//!
//! Domain branches are merged into the base branch one at a time in
//! precedence order, under the global merge lock. [`MergeState`] is
//! rewritten after every step, so a crashed or conflicted merge resumes at
//! the first unmerged domain.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use epicflow_registry::{LockFile, LockPolicy};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::layout::StateLayout;
use crate::merge::PrecedenceTable;
use crate::obs;
use crate::run_output::RunDir;
use crate::vcs::{MergeOutcome, Vcs};
use crate::workspace::{Workspace, WorkspaceStatus, WorkspaceSupervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePhase {
    InProgress,
    Conflict,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub domain: String,
    pub paths: Vec<String>,
}

/// Persisted progress of one unit's merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeState {
    pub unit_id: String,
    pub plan_digest: String,
    pub base_branch: String,
    /// Domains in merge order.
    pub order: Vec<String>,
    /// Workspace name per domain.
    pub workspaces: BTreeMap<String, String>,
    pub merged: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictRecord>,
    pub phase: MergePhase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MergeState {
    /// Domains not yet merged, in merge order.
    pub fn remaining(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|d| !self.merged.contains(d))
            .cloned()
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.phase == MergePhase::Completed
    }
}

/// Outcome of a merge attempt, written to `merge_summary.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub unit_id: String,
    pub merged: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictRecord>,
    pub remaining: Vec<String>,
    pub elapsed_ms: u64,
    pub success: bool,
}

impl MergeSummary {
    fn from_state(state: &MergeState, elapsed_ms: u64) -> Self {
        Self {
            unit_id: state.unit_id.clone(),
            merged: state.merged.clone(),
            conflict: state.conflict.clone(),
            remaining: state.remaining(),
            elapsed_ms,
            success: state.is_finished(),
        }
    }

    /// The error an unsuccessful summary stands for.
    pub fn into_conflict_error(self) -> Option<EngineError> {
        let conflict = self.conflict?;
        Some(EngineError::MergeConflict {
            unit_id: self.unit_id,
            remaining: self
                .remaining
                .into_iter()
                .filter(|d| d != &conflict.domain)
                .collect(),
            domain: conflict.domain,
            paths: conflict.paths,
        })
    }
}

pub struct MergeOrchestrator {
    layout: StateLayout,
    vcs: Arc<dyn Vcs>,
    supervisor: WorkspaceSupervisor,
    precedence: PrecedenceTable,
    lock_policy: LockPolicy,
}

impl MergeOrchestrator {
    pub fn new(
        layout: StateLayout,
        vcs: Arc<dyn Vcs>,
        supervisor: WorkspaceSupervisor,
        precedence: PrecedenceTable,
    ) -> Self {
        Self {
            layout,
            vcs,
            supervisor,
            precedence,
            lock_policy: LockPolicy::default(),
        }
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    /// Start merging the finished workspaces of `unit_id`.
    ///
    /// Any workspace that did not complete aborts the merge before the
    /// baseline is touched.
    pub fn merge(
        &self,
        unit_id: &str,
        workspaces: Vec<Workspace>,
        plan_digest: &str,
        run_dir: &RunDir,
    ) -> EngineResult<MergeSummary> {
        let unfinished: Vec<String> = workspaces
            .iter()
            .filter(|ws| {
                !matches!(
                    ws.status,
                    WorkspaceStatus::Completed | WorkspaceStatus::Conflict | WorkspaceStatus::Merged
                )
            })
            .map(|ws| ws.domain.clone())
            .collect();
        if !unfinished.is_empty() {
            return Err(EngineError::WorkerFailure {
                unit_id: unit_id.to_string(),
                domains: unfinished,
                reason: "not every workspace completed; nothing was merged".into(),
            });
        }

        let order = self
            .precedence
            .order(workspaces.iter().map(|ws| ws.domain.as_str()));
        let now = Utc::now();
        let state = MergeState {
            unit_id: unit_id.to_string(),
            plan_digest: plan_digest.to_string(),
            base_branch: self.supervisor.base_branch().to_string(),
            order,
            workspaces: workspaces
                .iter()
                .map(|ws| (ws.domain.clone(), ws.name.clone()))
                .collect(),
            merged: Vec::new(),
            conflict: None,
            phase: MergePhase::InProgress,
            started_at: now,
            updated_at: now,
        };
        run_dir.write_merge_state(&state)?;
        info!(event = "merge.started", unit_id = %unit_id, order = ?state.order);
        self.drive(state, run_dir)
    }

    /// Continue a merge from its persisted state. Already-merged domains are
    /// skipped; a finished merge returns its summary unchanged.
    pub fn resume(
        &self,
        unit_id: &str,
        plan_digest: &str,
        run_dir: &RunDir,
    ) -> EngineResult<MergeSummary> {
        let state: MergeState =
            run_dir
                .read_merge_state()?
                .ok_or_else(|| EngineError::NoMergeState {
                    unit_id: unit_id.to_string(),
                })?;
        if state.plan_digest != plan_digest {
            return Err(EngineError::PlanMismatch {
                unit_id: unit_id.to_string(),
                expected: state.plan_digest,
                actual: plan_digest.to_string(),
            });
        }
        if state.is_finished() {
            return Ok(MergeSummary::from_state(&state, 0));
        }
        self.drive(state, run_dir)
    }

    fn drive(&self, mut state: MergeState, run_dir: &RunDir) -> EngineResult<MergeSummary> {
        let started = Instant::now();
        let repo = self.layout.repo();
        let _lock = LockFile::acquire(
            &self.layout.merge_lock(),
            &format!("merge {}", state.unit_id),
            self.lock_policy,
        )?;

        let current = self.vcs.current_branch(repo)?;
        if current != state.base_branch {
            return Err(EngineError::WrongBranch {
                expected: state.base_branch.clone(),
                actual: current,
            });
        }
        if self.vcs.is_dirty(repo)? {
            return Err(EngineError::DirtyCheckout {
                path: repo.to_path_buf(),
            });
        }

        state.phase = MergePhase::InProgress;
        state.conflict = None;

        for domain in state.remaining() {
            let name = state.workspaces.get(&domain).cloned().ok_or_else(|| {
                EngineError::WorkspaceNotFound {
                    name: domain.clone(),
                }
            })?;
            let mut ws = self.supervisor.get(&name)?;

            if matches!(ws.status, WorkspaceStatus::Merged | WorkspaceStatus::Cleaned) {
                self.record_merged(&mut state, &domain, run_dir)?;
                continue;
            }

            if self.vcs.is_merged(repo, &ws.branch)? {
                info!(unit_id = %state.unit_id, domain = %domain, "branch already merged by hand");
                self.finish_domain(&mut state, &mut ws, run_dir, "merged_externally")?;
                continue;
            }

            let message = format!("epicflow: merge {} for {}", domain, state.unit_id);
            match self.vcs.merge(repo, &ws.branch, &message)? {
                MergeOutcome::Merged { .. } => {
                    self.finish_domain(&mut state, &mut ws, run_dir, "merged")?;
                }
                MergeOutcome::Conflict { paths } => {
                    ws.error_message = Some(format!("conflict in {}", paths.join(", ")));
                    self.supervisor
                        .transition(&mut ws, WorkspaceStatus::Conflict)?;
                    state.conflict = Some(ConflictRecord {
                        domain: domain.clone(),
                        paths,
                    });
                    state.phase = MergePhase::Conflict;
                    state.updated_at = Utc::now();
                    run_dir.write_merge_state(&state)?;
                    obs::emit_merge_step(&state.unit_id, &domain, "conflict");
                    break;
                }
            }
        }

        if state.conflict.is_none() {
            state.phase = MergePhase::Completed;
            state.updated_at = Utc::now();
            run_dir.write_merge_state(&state)?;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let summary = MergeSummary::from_state(&state, elapsed_ms);
        run_dir.write_merge_summary(&summary)?;
        obs::emit_merge_finished(
            &state.unit_id,
            summary.merged.len(),
            summary.success,
            elapsed_ms,
        );
        Ok(summary)
    }

    fn finish_domain(
        &self,
        state: &mut MergeState,
        ws: &mut Workspace,
        run_dir: &RunDir,
        outcome: &str,
    ) -> EngineResult<()> {
        ws.error_message = None;
        self.supervisor.transition(ws, WorkspaceStatus::Merged)?;
        self.record_merged(state, &ws.domain, run_dir)?;
        obs::emit_merge_step(&state.unit_id, &ws.domain, outcome);
        // The branch is already in the baseline; a failed cleanup is left for abort.
        if let Err(e) = self.supervisor.cleanup(ws) {
            warn!(workspace = %ws.name, error = %e, "cleanup after merge failed");
        }
        Ok(())
    }

    fn record_merged(
        &self,
        state: &mut MergeState,
        domain: &str,
        run_dir: &RunDir,
    ) -> EngineResult<()> {
        if !state.merged.iter().any(|d| d == domain) {
            state.merged.push(domain.to_string());
        }
        state.updated_at = Utc::now();
        run_dir.write_merge_state(state)
    }
}
