//! The control loop: select, classify, supervise, merge.
//!
//! One [`Engine`] serves one operator command. It owns no long-lived state;
//! everything it needs between commands lives in the registry and the run
//! directory, so an interrupted run is picked up again by `run` or `resume`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use epicflow_registry::{
    blockers_of, ExecutionMode, ExecutionRecord, FileRegistry, LockFile, LockPolicy,
    RegistryError, RegistryStore, UnitDraft, UnitMutation, UnitStatus, WorkUnit,
};
use serde::Serialize;
use tracing::{info, warn, Instrument};

use crate::classifier::{load_task_entries, ClassifierThresholds, ConcurrencyPlan, DomainTask};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::layout::{StateLayout, STATE_DIR_NAME};
use crate::merge::{MergeOrchestrator, MergeState, MergeSummary};
use crate::mirror::{CommandMirror, IssueMirror, MirrorEvent, MirrorEventKind, MirrorOutbox, NullMirror};
use crate::obs::{self, UnitSpan};
use crate::run_output::{DomainOutcome, DomainResult, RunDir};
use crate::selector::{explain_selection, select_next, SelectionExplanation};
use crate::vcs::{blocking, GitCli, Vcs};
use crate::worker::{CommandWorker, UnconfiguredWorker, Worker, WorkerRequest};
use crate::workspace::{AbortReport, Workspace, WorkspaceStatus, WorkspaceSupervisor};

/// Pseudo-domain used for logs and results of a sequential run.
pub const SEQUENTIAL_DOMAIN: &str = "sequential";

/// What a finished run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub unit_id: String,
    pub mode: ExecutionMode,
    /// Domains merged, in merge order. Empty for sequential runs.
    pub merged: Vec<String>,
    pub files_created: usize,
    pub files_modified: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// No unit was ready.
    Idle,
    Completed(RunReport),
}

/// Grouped task breakdown and the plan derived from it.
#[derive(Debug, Clone)]
pub struct UnitPlan {
    pub tasks: Vec<DomainTask>,
    pub plan: ConcurrencyPlan,
}

impl UnitPlan {
    fn all_files(&self) -> Vec<String> {
        let files: BTreeSet<&String> = self.tasks.iter().flat_map(|t| t.files.iter()).collect();
        files.into_iter().cloned().collect()
    }
}

pub struct Engine {
    layout: StateLayout,
    config: EngineConfig,
    registry: Arc<dyn RegistryStore>,
    vcs: Arc<dyn Vcs>,
    worker: Arc<dyn Worker>,
    mirror: Arc<dyn IssueMirror>,
    base_branch: String,
    lock_policy: LockPolicy,
}

impl Engine {
    /// Create the state directory, an empty registry and a default config
    /// pinned to the currently checked-out branch.
    pub fn init(layout: &StateLayout, project_name: &str, vcs: &dyn Vcs) -> EngineResult<EngineConfig> {
        let repo = layout.repo();
        FileRegistry::init(layout.state_dir(), project_name)?;
        std::fs::create_dir_all(layout.tasks_dir())?;

        let mut config = EngineConfig::load(&layout.config_path())?;
        if config.base_branch.is_none() {
            config.base_branch = Some(vcs.current_branch(repo)?);
        }
        config.save(&layout.config_path())?;

        if let Ok(rel) = layout.state_dir().strip_prefix(repo) {
            let rel = rel.to_string_lossy();
            let pattern = if rel.is_empty() {
                format!("/{STATE_DIR_NAME}/")
            } else {
                format!("/{rel}/")
            };
            vcs.exclude(repo, &pattern)?;
        }
        info!(
            event = "engine.init",
            state_dir = %layout.state_dir().display(),
            base_branch = config.base_branch.as_deref().unwrap_or_default(),
        );
        Ok(config)
    }

    /// Open an initialised state directory with the git backend and the
    /// worker and mirror named in the config.
    pub fn open(layout: StateLayout) -> EngineResult<Self> {
        let config = EngineConfig::load(&layout.config_path())?;
        let registry: Arc<dyn RegistryStore> = Arc::new(FileRegistry::open(layout.state_dir())?);
        let worker: Arc<dyn Worker> = match &config.worker {
            Some(spec) => Arc::new(CommandWorker::new(&spec.program, spec.args.clone())),
            None => Arc::new(UnconfiguredWorker),
        };
        let mirror: Arc<dyn IssueMirror> = match &config.mirror {
            Some(spec) => Arc::new(CommandMirror::new(&spec.program, spec.args.clone())),
            None => Arc::new(NullMirror),
        };
        Self::from_parts(layout, config, registry, Arc::new(GitCli::new()), worker, mirror)
    }

    /// Assemble an engine from explicit collaborators.
    pub fn from_parts(
        layout: StateLayout,
        config: EngineConfig,
        registry: Arc<dyn RegistryStore>,
        vcs: Arc<dyn Vcs>,
        worker: Arc<dyn Worker>,
        mirror: Arc<dyn IssueMirror>,
    ) -> EngineResult<Self> {
        let base_branch = match &config.base_branch {
            Some(branch) => branch.clone(),
            None => vcs.current_branch(layout.repo())?,
        };
        Ok(Self {
            layout,
            config,
            registry,
            vcs,
            worker,
            mirror,
            base_branch,
            lock_policy: LockPolicy::default(),
        })
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    /// Override the classifier thresholds from the config for this engine.
    pub fn with_thresholds(mut self, thresholds: ClassifierThresholds) -> Self {
        self.config.thresholds = thresholds;
        self
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &dyn RegistryStore {
        self.registry.as_ref()
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn supervisor(&self) -> WorkspaceSupervisor {
        WorkspaceSupervisor::new(
            self.layout.clone(),
            Arc::clone(&self.vcs),
            self.base_branch.clone(),
            self.config.supervisor_options(),
        )
    }

    fn merger(&self, supervisor: WorkspaceSupervisor) -> MergeOrchestrator {
        MergeOrchestrator::new(
            self.layout.clone(),
            Arc::clone(&self.vcs),
            supervisor,
            self.config.precedence.clone(),
        )
        .with_lock_policy(self.lock_policy)
    }

    fn outbox(&self) -> MirrorOutbox {
        MirrorOutbox::new(self.layout.mirror_outbox())
    }

    fn run_dir(&self, unit_id: &str) -> RunDir {
        RunDir::new(self.layout.run_dir(unit_id))
    }

    /// Deliver a mirror event, queueing it on failure. Never fails.
    async fn notify(&self, kind: MirrorEventKind, unit: &WorkUnit) -> Option<String> {
        let event = MirrorEvent::for_unit(kind, unit);
        match self.mirror.publish(&event).await {
            Ok(reference) => reference,
            Err(e) => {
                obs::emit_mirror_deferred(&unit.id, &e);
                if let Err(e) = self.outbox().append(&event) {
                    warn!(unit_id = %unit.id, error = %e, "failed to queue mirror event");
                }
                None
            }
        }
    }

    pub async fn create_unit(&self, draft: UnitDraft) -> EngineResult<WorkUnit> {
        let unit = self.registry.create(draft)?;
        info!(event = "unit.created", unit_id = %unit.id, priority = %unit.priority);
        match self.notify(MirrorEventKind::Created, &unit).await {
            Some(reference) if unit.external_ref.is_none() => Ok(self
                .registry
                .update(&unit.id, UnitMutation::SetExternalRef(Some(reference)))?),
            _ => Ok(unit),
        }
    }

    /// Move a unit forward and mirror the change.
    pub async fn set_status(&self, unit_id: &str, status: UnitStatus) -> EngineResult<WorkUnit> {
        let before = self.registry.get(unit_id)?;
        let unit = self
            .registry
            .update(unit_id, UnitMutation::Transition(status))?;
        if before.status != unit.status {
            let kind = if unit.status == UnitStatus::Implemented {
                MirrorEventKind::Closed
            } else {
                MirrorEventKind::StatusChanged
            };
            self.notify(kind, &unit).await;
        }
        Ok(unit)
    }

    pub async fn rollback(&self, unit_id: &str) -> EngineResult<WorkUnit> {
        let unit = self.registry.update(unit_id, UnitMutation::Rollback)?;
        self.notify(MirrorEventKind::StatusChanged, &unit).await;
        Ok(unit)
    }

    /// The unit `run-next` would pick, if any.
    pub fn select(&self) -> EngineResult<Option<WorkUnit>> {
        let all = self.registry.all()?;
        let ready = all.iter().filter(|u| u.status == UnitStatus::Ready).count();
        let picked = select_next(&all).cloned();
        if let Some(unit) = &picked {
            obs::emit_unit_selected(&unit.id, &unit.priority.to_string(), ready);
        }
        Ok(picked)
    }

    pub fn explain(&self) -> EngineResult<Vec<SelectionExplanation>> {
        Ok(explain_selection(&self.registry.all()?))
    }

    /// Classify a unit's task breakdown from `tasks` or
    /// `<state>/tasks/<unit-id>.json`.
    pub fn classify_unit(&self, unit_id: &str, tasks: Option<&Path>) -> EngineResult<UnitPlan> {
        let path: PathBuf = tasks
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.layout.task_file(unit_id));
        let entries = load_task_entries(unit_id, &path)?;
        let classifier = self.config.classifier()?;
        let tasks = classifier.group(&entries);
        if tasks.iter().all(|t| t.files.is_empty()) {
            return Err(EngineError::TaskBreakdown {
                unit_id: unit_id.to_string(),
                path,
                reason: "breakdown lists no files".into(),
            });
        }
        let plan = classifier.classify(&tasks);
        obs::emit_plan_classified(
            unit_id,
            plan.viable,
            plan.file_count,
            plan.domain_count,
            plan.overlap_ratio,
        );
        Ok(UnitPlan { tasks, plan })
    }

    /// Select the next unit and run it.
    pub async fn run_next(&self, tasks: Option<&Path>) -> EngineResult<RunOutcome> {
        match self.select()? {
            None => {
                info!(event = "unit.none_ready");
                Ok(RunOutcome::Idle)
            }
            Some(unit) => self.run_unit(&unit.id, tasks).await,
        }
    }

    /// Run one unit end to end. A `ready` unit is moved to `in_progress`
    /// first; an `in_progress` unit is re-run, reusing workspaces that
    /// already completed.
    pub async fn run_unit(&self, unit_id: &str, tasks: Option<&Path>) -> EngineResult<RunOutcome> {
        self.run_unit_inner(unit_id, tasks)
            .instrument(obs::unit_span(unit_id))
            .await
    }

    async fn run_unit_inner(&self, unit_id: &str, tasks: Option<&Path>) -> EngineResult<RunOutcome> {
        let all = self.registry.all()?;
        let unit = all
            .iter()
            .find(|u| u.id == unit_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnitNotFound {
                id: unit_id.to_string(),
            })?;

        match unit.status {
            UnitStatus::Ready | UnitStatus::InProgress => {
                let blockers = blockers_of(&unit, &all);
                if !blockers.is_empty() {
                    return Err(EngineError::Blocked {
                        unit_id: unit.id.clone(),
                        blockers: blockers.into_iter().map(|b| b.id).collect(),
                    });
                }
            }
            status => {
                return Err(EngineError::NotRunnable {
                    unit_id: unit.id.clone(),
                    status,
                })
            }
        }

        let run_dir = self.run_dir(unit_id);
        let merge_state = run_dir.read_merge_state::<MergeState>()?;
        if let Some(state) = &merge_state {
            if !state.is_finished() {
                return Err(EngineError::MergePending {
                    unit_id: unit_id.to_string(),
                });
            }
        }

        let unit_plan = self.classify_unit(unit_id, tasks)?;
        if unit.status == UnitStatus::Ready {
            self.set_status(unit_id, UnitStatus::InProgress).await?;
        }
        let digest = run_dir.write_plan(&unit_plan.plan)?;

        // Interrupted after the merge landed but before the unit was marked
        // implemented: the work is on the base branch, only bookkeeping is left.
        if unit.status == UnitStatus::InProgress
            && merge_state.is_some_and(|s| s.plan_digest == digest)
        {
            info!(unit_id = %unit_id, "merge already completed; finishing unit");
            let summary = self.resume_merge(unit_id, &digest, &run_dir).await?;
            let report = self.parallel_report(unit_id, summary, &run_dir)?;
            return self.finish_unit(report).await;
        }

        let report = if unit_plan.plan.viable {
            self.run_parallel(unit_id, &unit_plan.plan, &digest, &run_dir)
                .await?
        } else {
            info!(unit_id = %unit_id, reason = %unit_plan.plan.reason, "running sequentially");
            self.run_sequential(unit_id, &unit_plan, &run_dir).await?
        };
        self.finish_unit(report).await
    }

    async fn run_parallel(
        &self,
        unit_id: &str,
        plan: &ConcurrencyPlan,
        digest: &str,
        run_dir: &RunDir,
    ) -> EngineResult<RunReport> {
        let supervisor = self.supervisor();
        let prepared = {
            let (supervisor, unit_id, plan, run_dir) = (
                supervisor.clone(),
                unit_id.to_string(),
                plan.clone(),
                run_dir.clone(),
            );
            blocking(move || prepare_workspaces(&supervisor, &unit_id, &plan, &run_dir)).await?
        };

        let runs = supervisor
            .run_all(prepared.jobs, Arc::clone(&self.worker), run_dir.clone())
            .await?;
        let mut failed = prepared.failed;
        failed.extend(
            runs.iter()
                .map(|r| &r.result)
                .filter(|r| !r.succeeded())
                .cloned(),
        );
        if !failed.is_empty() {
            failed.sort_by_key(|r| plan.domains.iter().position(|t| t.domain == r.domain));
            return Err(EngineError::WorkerFailure {
                unit_id: unit_id.to_string(),
                domains: failed.iter().map(|r| r.domain.clone()).collect(),
                reason: failed
                    .iter()
                    .map(|r| {
                        format!(
                            "{}: {}",
                            r.domain,
                            r.error.as_deref().unwrap_or("failed")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
            });
        }

        let mut workspaces = prepared.reused;
        workspaces.extend(runs.into_iter().map(|r| r.workspace));
        let merger = self.merger(supervisor);
        let summary = {
            let (unit_id, digest, run_dir) =
                (unit_id.to_string(), digest.to_string(), run_dir.clone());
            blocking(move || merger.merge(&unit_id, workspaces, &digest, &run_dir)).await?
        };
        self.parallel_report(unit_id, summary, run_dir)
    }

    async fn resume_merge(
        &self,
        unit_id: &str,
        digest: &str,
        run_dir: &RunDir,
    ) -> EngineResult<MergeSummary> {
        let merger = self.merger(self.supervisor());
        let (unit_id, digest, run_dir) = (unit_id.to_string(), digest.to_string(), run_dir.clone());
        blocking(move || merger.resume(&unit_id, &digest, &run_dir)).await
    }

    fn parallel_report(
        &self,
        unit_id: &str,
        summary: MergeSummary,
        run_dir: &RunDir,
    ) -> EngineResult<RunReport> {
        if !summary.success {
            let unit_id = summary.unit_id.clone();
            return Err(summary
                .into_conflict_error()
                .unwrap_or(EngineError::MergePending { unit_id }));
        }
        let mut report = RunReport {
            unit_id: unit_id.to_string(),
            mode: ExecutionMode::Parallel,
            merged: summary.merged.clone(),
            files_created: 0,
            files_modified: 0,
        };
        for domain in &summary.merged {
            if let Some(r) = run_dir.read_result(domain)?.and_then(|r| r.report) {
                report.files_created += r.files_created.len();
                report.files_modified += r.files_modified.len();
            }
        }
        Ok(report)
    }

    async fn run_sequential(
        &self,
        unit_id: &str,
        unit_plan: &UnitPlan,
        run_dir: &RunDir,
    ) -> EngineResult<RunReport> {
        let repo = self.layout.repo();
        let _lock = {
            let vcs = Arc::clone(&self.vcs);
            let repo = repo.to_path_buf();
            let lock_path = self.layout.merge_lock();
            let purpose = format!("sequential run {unit_id}");
            let (policy, base) = (self.lock_policy, self.base_branch.clone());
            blocking(move || {
                if vcs.is_dirty(&repo)? {
                    return Err(EngineError::DirtyCheckout { path: repo });
                }
                let lock = LockFile::acquire(&lock_path, &purpose, policy)?;
                let current = vcs.current_branch(&repo)?;
                if current != base {
                    return Err(EngineError::WrongBranch {
                        expected: base,
                        actual: current,
                    });
                }
                Ok(lock)
            })
            .await?
        };

        let request = WorkerRequest {
            unit_id: unit_id.to_string(),
            domain: SEQUENTIAL_DOMAIN.to_string(),
            workspace_path: repo.to_path_buf(),
            files: unit_plan.all_files(),
            description: unit_plan
                .tasks
                .iter()
                .map(|t| t.description.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        };
        let timeout = self.config.worker_timeout();
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.worker.run(&request)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (outcome, report, error) = match outcome {
            Ok(Ok(run)) => {
                run_dir.write_log(SEQUENTIAL_DOMAIN, &run.log)?;
                if run.report.is_success(self.config.accept_partial) {
                    (DomainOutcome::Succeeded, Some(run.report), None)
                } else {
                    let notes = run.report.notes.clone();
                    (DomainOutcome::Failed, Some(run.report), Some(notes))
                }
            }
            Ok(Err(e)) => {
                run_dir.write_log(SEQUENTIAL_DOMAIN, &format!("worker error: {e}\n"))?;
                (DomainOutcome::Crashed, None, Some(e.to_string()))
            }
            Err(_) => {
                let msg = format!("timed out after {}s", timeout.as_secs_f64());
                run_dir.write_log(SEQUENTIAL_DOMAIN, &format!("{msg}\n"))?;
                (DomainOutcome::TimedOut, None, Some(msg))
            }
        };
        let result = DomainResult {
            domain: SEQUENTIAL_DOMAIN.to_string(),
            workspace: None,
            outcome,
            report: report.clone(),
            error: error.clone(),
            duration_ms,
            finished_at: Utc::now(),
        };
        run_dir.write_result(&result)?;
        obs::emit_worker_finished(
            unit_id,
            SEQUENTIAL_DOMAIN,
            &format!("{outcome:?}").to_lowercase(),
            duration_ms,
        );

        let report = match (outcome, report) {
            (DomainOutcome::Succeeded, Some(report)) => report,
            _ => {
                return Err(EngineError::WorkerFailure {
                    unit_id: unit_id.to_string(),
                    domains: vec![SEQUENTIAL_DOMAIN.to_string()],
                    reason: error.unwrap_or_else(|| "worker failed".into()),
                })
            }
        };
        {
            let vcs = Arc::clone(&self.vcs);
            let repo = repo.to_path_buf();
            let message = format!("epicflow({unit_id}): sequential implementation");
            blocking(move || vcs.commit_all(&repo, &message)).await?;
        }
        Ok(RunReport {
            unit_id: unit_id.to_string(),
            mode: ExecutionMode::Sequential,
            merged: Vec::new(),
            files_created: report.files_created.len(),
            files_modified: report.files_modified.len(),
        })
    }

    async fn finish_unit(&self, report: RunReport) -> EngineResult<RunOutcome> {
        self.registry.update(
            &report.unit_id,
            UnitMutation::RecordExecution(ExecutionRecord {
                mode: report.mode,
                files_created: report.files_created,
                files_modified: report.files_modified,
                finished_at: Utc::now(),
            }),
        )?;
        self.set_status(&report.unit_id, UnitStatus::Implemented)
            .await?;
        info!(
            event = "unit.implemented",
            unit_id = %report.unit_id,
            mode = %report.mode,
            merged = report.merged.len(),
        );
        Ok(RunOutcome::Completed(report))
    }

    /// Continue a conflicted or interrupted merge and finish the unit.
    pub async fn resume(&self, unit_id: &str) -> EngineResult<RunOutcome> {
        self.resume_inner(unit_id)
            .instrument(obs::unit_span(unit_id))
            .await
    }

    async fn resume_inner(&self, unit_id: &str) -> EngineResult<RunOutcome> {
        let unit = self.registry.get(unit_id)?;
        let run_dir = self.run_dir(unit_id);
        let digest = run_dir
            .plan_digest()?
            .ok_or_else(|| EngineError::NoMergeState {
                unit_id: unit_id.to_string(),
            })?;
        let summary = self.resume_merge(unit_id, &digest, &run_dir).await?;
        let report = self.parallel_report(unit_id, summary, &run_dir)?;
        if unit.status == UnitStatus::Implemented {
            return Ok(RunOutcome::Completed(report));
        }
        self.finish_unit(report).await
    }

    /// Clean every idle workspace of `unit_id` and discard its unfinished
    /// merge. The unit stays `in_progress`.
    pub fn abort(&self, unit_id: &str) -> EngineResult<AbortReport> {
        let _span = UnitSpan::enter(unit_id);
        let report = self.supervisor().abort(unit_id)?;
        let run_dir = self.run_dir(unit_id);
        if let Some(state) = run_dir.read_merge_state::<MergeState>()? {
            if !state.is_finished() {
                std::fs::remove_file(run_dir.merge_state_path())?;
                info!(unit_id = %unit_id, "discarded unfinished merge state");
            }
        }
        Ok(report)
    }

    /// Retry queued mirror events, recording any tracker ids returned for
    /// created units.
    pub async fn flush_mirror(&self) -> EngineResult<crate::mirror::FlushReport> {
        let report = self.outbox().flush(self.mirror.as_ref()).await?;
        for (event, reference) in &report.delivered {
            if event.kind != MirrorEventKind::Created {
                continue;
            }
            if let Some(reference) = reference {
                let unit = self.registry.get(&event.unit_id)?;
                if unit.external_ref.is_none() {
                    self.registry.update(
                        &event.unit_id,
                        UnitMutation::SetExternalRef(Some(reference.clone())),
                    )?;
                }
            }
        }
        Ok(report)
    }
}

/// Workspaces ready for a parallel run.
struct PreparedWorkspaces {
    /// Completed in an earlier attempt with the same files.
    reused: Vec<Workspace>,
    jobs: Vec<(Workspace, DomainTask)>,
    /// Domains whose workspace could not be created.
    failed: Vec<DomainResult>,
}

/// Reuse completed workspaces, clean the rest and create the missing ones.
/// A domain whose workspace cannot be created is recorded as failed so the
/// remaining domains still run.
fn prepare_workspaces(
    supervisor: &WorkspaceSupervisor,
    unit_id: &str,
    plan: &ConcurrencyPlan,
    run_dir: &RunDir,
) -> EngineResult<PreparedWorkspaces> {
    let existing = supervisor.list(Some(unit_id))?;

    let mut reused: Vec<Workspace> = Vec::new();
    for task in &plan.domains {
        let prior = existing.iter().find(|w| {
            w.domain == task.domain
                && w.status == WorkspaceStatus::Completed
                && w.files == task.files
        });
        if let Some(ws) = prior {
            reused.push(ws.clone());
        }
    }

    for ws in &existing {
        if ws.status == WorkspaceStatus::Cleaned || reused.iter().any(|r| r.name == ws.name) {
            continue;
        }
        let mut ws = ws.clone();
        if ws.status == WorkspaceStatus::Running {
            ws.error_message = Some("abandoned by an interrupted run".into());
            supervisor.transition(&mut ws, WorkspaceStatus::Failed)?;
        }
        supervisor.cleanup(&mut ws)?;
    }

    for ws in &reused {
        let prior = run_dir.read_result(&ws.domain)?;
        run_dir.write_result(&DomainResult {
            domain: ws.domain.clone(),
            workspace: Some(ws.name.clone()),
            outcome: DomainOutcome::Reused,
            report: prior.and_then(|r| r.report),
            error: None,
            duration_ms: 0,
            finished_at: Utc::now(),
        })?;
        info!(unit_id = %unit_id, workspace = %ws.name, "reusing completed workspace");
    }

    let mut jobs = Vec::new();
    let mut failed = Vec::new();
    for task in &plan.domains {
        if reused.iter().any(|w| w.domain == task.domain) {
            continue;
        }
        match supervisor.create(unit_id, &task.domain, &task.files) {
            Ok(ws) => jobs.push((ws, task.clone())),
            Err(e) => {
                warn!(unit_id = %unit_id, domain = %task.domain, error = %e, "workspace creation failed");
                let msg = format!("workspace creation failed: {e}");
                run_dir.write_log(&task.domain, &format!("{msg}\n"))?;
                let result = DomainResult {
                    domain: task.domain.clone(),
                    workspace: None,
                    outcome: DomainOutcome::Failed,
                    report: None,
                    error: Some(msg),
                    duration_ms: 0,
                    finished_at: Utc::now(),
                };
                run_dir.write_result(&result)?;
                failed.push(result);
            }
        }
    }
    Ok(PreparedWorkspaces {
        reused,
        jobs,
        failed,
    })
}
