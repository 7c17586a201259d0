//! Workspace lifecycle and concurrent worker execution.
//!
//! The supervisor is the only component that creates, runs or destroys
//! workspaces. Metadata for every workspace lives in
//! `<state>/workspaces/<name>.json` and outlives the worktree itself: a
//! cleaned workspace keeps its record with `cleaned_at` set.

use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::classifier::DomainTask;
use crate::error::{EngineError, EngineResult};
use crate::layout::StateLayout;
use crate::obs;
use crate::run_output::{read_json, write_json_atomic, DomainOutcome, DomainResult, RunDir};
use crate::vcs::{blocking, Vcs};
use crate::worker::{Worker, WorkerRequest};
use crate::workspace::model::{workspace_branch, workspace_name, Workspace, WorkspaceStatus};

/// Execution limits applied to every worker.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub worker_timeout: Duration,
    pub max_concurrent: usize,
    pub accept_partial: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(1800),
            max_concurrent: 4,
            accept_partial: false,
        }
    }
}

/// A workspace after its worker reached a terminal state.
#[derive(Debug, Clone)]
pub struct WorkspaceRun {
    pub workspace: Workspace,
    pub result: DomainResult,
}

/// What `abort` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AbortReport {
    pub cleaned: Vec<String>,
    /// Workspaces skipped because a worker in this process still runs there.
    pub busy: Vec<String>,
}

/// Removes a workspace from the live set when dropped.
struct LiveGuard {
    live: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

#[derive(Clone)]
pub struct WorkspaceSupervisor {
    layout: StateLayout,
    vcs: Arc<dyn Vcs>,
    base_branch: String,
    options: SupervisorOptions,
    live: Arc<Mutex<HashSet<String>>>,
}

impl WorkspaceSupervisor {
    pub fn new(
        layout: StateLayout,
        vcs: Arc<dyn Vcs>,
        base_branch: impl Into<String>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            layout,
            vcs,
            base_branch: base_branch.into(),
            options,
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// Whether a worker in this process is running in workspace `name`.
    pub fn is_live(&self, name: &str) -> bool {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    fn mark_live(&self, name: &str) -> LiveGuard {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
        LiveGuard {
            live: Arc::clone(&self.live),
            name: name.to_string(),
        }
    }

    fn save(&self, ws: &Workspace) -> EngineResult<()> {
        write_json_atomic(&self.layout.workspace_meta(&ws.name), ws)
    }

    pub fn get(&self, name: &str) -> EngineResult<Workspace> {
        read_json(&self.layout.workspace_meta(name))?.ok_or_else(|| {
            EngineError::WorkspaceNotFound {
                name: name.to_string(),
            }
        })
    }

    /// All workspace records, optionally for one unit, oldest first.
    pub fn list(&self, unit_id: Option<&str>) -> EngineResult<Vec<Workspace>> {
        let dir = self.layout.workspaces_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(ws) = read_json::<Workspace>(&path)? {
                if unit_id.map_or(true, |u| ws.unit_id == u) {
                    out.push(ws);
                }
            }
        }
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(out)
    }

    /// Create a worktree for `domain` of `unit_id` on a fresh branch.
    #[instrument(skip(self, files))]
    pub fn create(&self, unit_id: &str, domain: &str, files: &[String]) -> EngineResult<Workspace> {
        let repo = self.layout.repo();
        let suffix: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let name = workspace_name(unit_id, domain, &suffix);
        let branch = workspace_branch(unit_id, domain, &suffix);
        let path = self.layout.worktree_path(&name);
        let fail = |reason: String| EngineError::WorkspaceCreate {
            name: name.clone(),
            reason,
        };

        if self.vcs.is_dirty(repo)? {
            return Err(fail("base checkout has uncommitted changes".into()));
        }
        if self.layout.workspace_meta(&name).exists() {
            return Err(fail("a workspace with this name already exists".into()));
        }
        if path.exists() {
            return Err(fail(format!("path {} already exists", path.display())));
        }
        if self.vcs.branch_exists(repo, &branch)? {
            return Err(fail(format!("branch {branch} already exists")));
        }

        fs::create_dir_all(self.layout.worktrees_dir())?;
        self.vcs
            .add_worktree(repo, &path, &branch, &self.base_branch)
            .map_err(|e| fail(e.to_string()))?;

        let ws = Workspace {
            name: name.clone(),
            unit_id: unit_id.to_string(),
            domain: domain.to_string(),
            branch,
            path,
            base_branch: self.base_branch.clone(),
            status: WorkspaceStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            merged_at: None,
            cleaned_at: None,
            commits: 0,
            files: files.to_vec(),
            error_message: None,
        };
        self.save(&ws)?;
        info!(event = "workspace.created", workspace = %ws.name, branch = %ws.branch);
        Ok(ws)
    }

    /// Move `ws` to `to`, stamping timestamps and persisting the record.
    pub fn transition(&self, ws: &mut Workspace, to: WorkspaceStatus) -> EngineResult<()> {
        let from = ws.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidWorkspaceTransition {
                name: ws.name.clone(),
                from,
                to,
            });
        }
        if from == to {
            return Ok(());
        }
        let now = Utc::now();
        ws.status = to;
        match to {
            WorkspaceStatus::Running => ws.started_at = Some(now),
            WorkspaceStatus::Completed | WorkspaceStatus::Failed => ws.completed_at = Some(now),
            WorkspaceStatus::Merged => ws.merged_at = Some(now),
            WorkspaceStatus::Cleaned => ws.cleaned_at = Some(now),
            WorkspaceStatus::Created | WorkspaceStatus::Conflict => {}
        }
        self.save(ws)?;
        obs::emit_workspace_transition(&ws.name, from, to);
        Ok(())
    }

    /// Run `worker` on `task` inside `ws` and drive the workspace to
    /// `completed` or `failed`.
    ///
    /// Worker failures are reported in the returned [`DomainResult`], not as
    /// `Err`; `Err` means the supervisor itself could not record state.
    pub async fn run(
        &self,
        mut ws: Workspace,
        task: DomainTask,
        worker: Arc<dyn Worker>,
        run_dir: RunDir,
    ) -> EngineResult<WorkspaceRun> {
        let _live = self.mark_live(&ws.name);
        self.transition(&mut ws, WorkspaceStatus::Running)?;

        let request = WorkerRequest {
            unit_id: ws.unit_id.clone(),
            domain: ws.domain.clone(),
            workspace_path: ws.path.clone(),
            files: task.files.clone(),
            description: task.description.clone(),
        };
        let timeout = self.options.worker_timeout;
        let started = std::time::Instant::now();

        let (outcome, report, error) =
            match tokio::time::timeout(timeout, worker.run(&request)).await {
                Ok(Ok(run)) => {
                    run_dir.write_log(&ws.domain, &run.log)?;
                    if run.report.is_success(self.options.accept_partial) {
                        (DomainOutcome::Succeeded, Some(run.report), None)
                    } else {
                        let notes = if run.report.notes.is_empty() {
                            format!("worker reported {:?}", run.report.status)
                        } else {
                            run.report.notes.clone()
                        };
                        (DomainOutcome::Failed, Some(run.report), Some(notes))
                    }
                }
                Ok(Err(e)) => {
                    run_dir.write_log(&ws.domain, &format!("worker error: {e}\n"))?;
                    (DomainOutcome::Crashed, None, Some(e.to_string()))
                }
                Err(_) => {
                    let msg = format!("timed out after {}s", timeout.as_secs_f64());
                    run_dir.write_log(&ws.domain, &format!("{msg}\n"))?;
                    (DomainOutcome::TimedOut, None, Some(msg))
                }
            };

        let (outcome, error) = match outcome {
            DomainOutcome::Succeeded => match blocking(self.commit_work(&ws, &task)).await {
                Ok(commits) => {
                    ws.commits = commits;
                    (outcome, None)
                }
                Err(e) => (DomainOutcome::Failed, Some(format!("commit failed: {e}"))),
            },
            _ => (outcome, error),
        };

        if outcome == DomainOutcome::Succeeded {
            self.transition(&mut ws, WorkspaceStatus::Completed)?;
        } else {
            ws.error_message = error.clone();
            self.transition(&mut ws, WorkspaceStatus::Failed)?;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = DomainResult {
            domain: ws.domain.clone(),
            workspace: Some(ws.name.clone()),
            outcome,
            report,
            error,
            duration_ms,
            finished_at: Utc::now(),
        };
        run_dir.write_result(&result)?;
        obs::emit_worker_finished(
            &ws.unit_id,
            &ws.domain,
            &format!("{outcome:?}").to_lowercase(),
            duration_ms,
        );
        Ok(WorkspaceRun {
            workspace: ws,
            result,
        })
    }

    /// Commit the worker's output in `ws`; yields the branch's commit count.
    fn commit_work(
        &self,
        ws: &Workspace,
        task: &DomainTask,
    ) -> impl FnOnce() -> EngineResult<usize> + Send + 'static {
        let vcs = Arc::clone(&self.vcs);
        let repo = self.layout.repo().to_path_buf();
        let (path, base, branch) = (ws.path.clone(), ws.base_branch.clone(), ws.branch.clone());
        let message = format!("epicflow({}): {}", ws.unit_id, task.description);
        move || {
            vcs.commit_all(&path, &message)?;
            vcs.commit_count(&repo, &base, &branch)
        }
    }

    /// Run every job concurrently, at most `max_concurrent` at a time, and
    /// wait for all of them. Results are in job order.
    pub async fn run_all(
        &self,
        jobs: Vec<(Workspace, DomainTask)>,
        worker: Arc<dyn Worker>,
        run_dir: RunDir,
    ) -> EngineResult<Vec<WorkspaceRun>> {
        let sem = Arc::new(Semaphore::new(self.options.max_concurrent.max(1)));
        let mut names = Vec::with_capacity(jobs.len());
        let mut handles = Vec::with_capacity(jobs.len());

        for (ws, task) in jobs {
            let sup = self.clone();
            let worker = Arc::clone(&worker);
            let run_dir = run_dir.clone();
            let sem = Arc::clone(&sem);
            names.push(ws.name.clone());
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                sup.run(ws, task, worker, run_dir).await
            }));
        }

        let mut out = Vec::with_capacity(handles.len());
        let mut first_err = None;
        for (name, joined) in names.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(run)) => out.push(run),
                Ok(Err(e)) => {
                    warn!(workspace = %name, error = %e, "workspace run failed");
                    first_err.get_or_insert(e);
                }
                Err(join) => {
                    warn!(workspace = %name, error = %join, "worker task panicked");
                    first_err.get_or_insert(EngineError::WorkerFailure {
                        unit_id: String::new(),
                        domains: vec![name],
                        reason: format!("worker task panicked: {join}"),
                    });
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Remove the worktree and branch and mark the workspace cleaned.
    /// Cleaning an already-cleaned workspace is a no-op.
    pub fn cleanup(&self, ws: &mut Workspace) -> EngineResult<()> {
        if ws.status == WorkspaceStatus::Cleaned {
            return Ok(());
        }
        if self.is_live(&ws.name) {
            return Err(EngineError::WorkspaceBusy {
                name: ws.name.clone(),
            });
        }
        if !ws.status.can_transition_to(WorkspaceStatus::Cleaned) {
            return Err(EngineError::InvalidWorkspaceTransition {
                name: ws.name.clone(),
                from: ws.status,
                to: WorkspaceStatus::Cleaned,
            });
        }
        let repo = self.layout.repo();
        self.vcs.remove_worktree(repo, &ws.path)?;
        self.vcs.delete_branch(repo, &ws.branch)?;
        self.transition(ws, WorkspaceStatus::Cleaned)
    }

    /// Clean every workspace of `unit_id` that has no live worker.
    ///
    /// Workspaces left `created` or `running` by a crashed process are
    /// marked failed first.
    pub fn abort(&self, unit_id: &str) -> EngineResult<AbortReport> {
        let mut report = AbortReport::default();
        for mut ws in self.list(Some(unit_id))? {
            if ws.status == WorkspaceStatus::Cleaned {
                continue;
            }
            if self.is_live(&ws.name) {
                report.busy.push(ws.name);
                continue;
            }
            if ws.status == WorkspaceStatus::Running {
                ws.error_message = Some("abandoned by an interrupted run".into());
                self.transition(&mut ws, WorkspaceStatus::Failed)?;
            }
            self.cleanup(&mut ws)?;
            report.cleaned.push(ws.name);
        }
        info!(
            event = "workspace.abort",
            unit_id = %unit_id,
            cleaned = report.cleaned.len(),
            busy = report.busy.len(),
        );
        Ok(report)
    }
}
