//! In-memory test doubles for the engine's external seams.
//!
//! `FakeVcs` models branches, worktrees and merges without git.
//! `ScriptedWorker` answers per domain with canned reports and optional
//! delays. `RecordingMirror` and `FailingMirror` stand in for an issue
//! tracker.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::mirror::{IssueMirror, MirrorEvent};
use crate::vcs::{MergeOutcome, Vcs};
use crate::worker::{Worker, WorkerReport, WorkerRequest, WorkerRun};

#[derive(Debug)]
struct VcsState {
    dirty: bool,
    current_branch: String,
    /// Branch name to commits ahead of base.
    branches: BTreeMap<String, usize>,
    worktrees: HashMap<PathBuf, String>,
    merged: Vec<String>,
    /// Branch substring to conflicting paths.
    conflicts: Vec<(String, Vec<String>)>,
    /// Branch substrings whose worktree cannot be added.
    broken_worktrees: Vec<String>,
    head: u64,
    excludes: Vec<String>,
}

/// In-memory [`Vcs`]. Worktree directories are created on disk so workers
/// can write into them.
#[derive(Debug)]
pub struct FakeVcs {
    state: Mutex<VcsState>,
}

impl Default for FakeVcs {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeVcs {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VcsState {
                dirty: false,
                current_branch: "main".into(),
                branches: BTreeMap::new(),
                worktrees: HashMap::new(),
                merged: Vec::new(),
                conflicts: Vec::new(),
                broken_worktrees: Vec::new(),
                head: 1,
                excludes: Vec::new(),
            }),
        }
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.state.lock().unwrap().dirty = dirty;
    }

    pub fn set_current_branch(&self, branch: &str) {
        self.state.lock().unwrap().current_branch = branch.to_string();
    }

    /// Merging any branch whose name contains `pattern` conflicts on `paths`.
    pub fn conflict_on(&self, pattern: &str, paths: Vec<String>) {
        self.state
            .lock()
            .unwrap()
            .conflicts
            .push((pattern.to_string(), paths));
    }

    pub fn resolve_conflicts(&self) {
        self.state.lock().unwrap().conflicts.clear();
    }

    /// Adding a worktree for any branch containing `pattern` fails.
    pub fn fail_worktree_on(&self, pattern: &str) {
        self.state
            .lock()
            .unwrap()
            .broken_worktrees
            .push(pattern.to_string());
    }

    pub fn repair_worktrees(&self) {
        self.state.lock().unwrap().broken_worktrees.clear();
    }

    /// Simulate an operator merging `branch` by hand.
    pub fn mark_merged(&self, branch: &str) {
        let mut s = self.state.lock().unwrap();
        s.merged.push(branch.to_string());
        s.head += 1;
    }

    /// Branches merged into the base, in merge order.
    pub fn merged_branches(&self) -> Vec<String> {
        self.state.lock().unwrap().merged.clone()
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.state.lock().unwrap().branches.contains_key(branch)
    }

    pub fn commits_on(&self, branch: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .branches
            .get(branch)
            .copied()
            .unwrap_or(0)
    }

    /// Number of commits on the base checkout.
    pub fn head_count(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    pub fn excludes(&self) -> Vec<String> {
        self.state.lock().unwrap().excludes.clone()
    }
}

impl Vcs for FakeVcs {
    fn is_dirty(&self, _dir: &Path) -> EngineResult<bool> {
        Ok(self.state.lock().unwrap().dirty)
    }

    fn current_branch(&self, _repo: &Path) -> EngineResult<String> {
        Ok(self.state.lock().unwrap().current_branch.clone())
    }

    fn head_sha(&self, _dir: &Path) -> EngineResult<String> {
        Ok(format!("{:040x}", self.state.lock().unwrap().head))
    }

    fn branch_exists(&self, _repo: &Path, branch: &str) -> EngineResult<bool> {
        Ok(self.has_branch(branch))
    }

    fn add_worktree(&self, _repo: &Path, path: &Path, branch: &str, _base: &str) -> EngineResult<()> {
        let mut s = self.state.lock().unwrap();
        if s.broken_worktrees.iter().any(|p| branch.contains(p.as_str())) {
            return Err(EngineError::Git {
                command: "worktree add".into(),
                stderr: format!("fatal: could not create work tree dir for {branch}"),
            });
        }
        if s.branches.contains_key(branch) {
            return Err(EngineError::Git {
                command: "worktree add".into(),
                stderr: format!("branch {branch} already exists"),
            });
        }
        std::fs::create_dir_all(path)?;
        s.branches.insert(branch.to_string(), 0);
        s.worktrees.insert(path.to_path_buf(), branch.to_string());
        Ok(())
    }

    fn remove_worktree(&self, _repo: &Path, path: &Path) -> EngineResult<()> {
        self.state.lock().unwrap().worktrees.remove(path);
        match std::fs::remove_dir_all(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn delete_branch(&self, _repo: &Path, branch: &str) -> EngineResult<()> {
        self.state.lock().unwrap().branches.remove(branch);
        Ok(())
    }

    fn commit_all(&self, dir: &Path, _message: &str) -> EngineResult<Option<String>> {
        let mut s = self.state.lock().unwrap();
        match s.worktrees.get(dir).cloned() {
            Some(branch) => {
                *s.branches.entry(branch).or_insert(0) += 1;
            }
            None => s.head += 1,
        }
        Ok(Some(format!("{:040x}", s.head)))
    }

    fn commit_count(&self, _repo: &Path, _base: &str, branch: &str) -> EngineResult<usize> {
        Ok(self.commits_on(branch))
    }

    fn merge(&self, _repo: &Path, branch: &str, _message: &str) -> EngineResult<MergeOutcome> {
        let mut s = self.state.lock().unwrap();
        if let Some((_, paths)) = s.conflicts.iter().find(|(p, _)| branch.contains(p.as_str())) {
            return Ok(MergeOutcome::Conflict {
                paths: paths.clone(),
            });
        }
        s.merged.push(branch.to_string());
        s.head += 1;
        Ok(MergeOutcome::Merged {
            head: format!("{:040x}", s.head),
        })
    }

    fn is_merged(&self, _repo: &Path, branch: &str) -> EngineResult<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .merged
            .iter()
            .any(|b| b == branch))
    }

    fn exclude(&self, _repo: &Path, pattern: &str) -> EngineResult<()> {
        self.state.lock().unwrap().excludes.push(pattern.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Script {
    Report(WorkerReport),
    Error(String),
}

/// [`Worker`] with per-domain canned answers.
///
/// Unscripted domains succeed after writing each requested file into the
/// workspace.
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    scripts: HashMap<String, Script>,
    delays: HashMap<String, Duration>,
    default_delay: Option<Duration>,
    requests: Mutex<Vec<WorkerRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, domain: &str, report: WorkerReport) -> Self {
        self.scripts.insert(domain.to_string(), Script::Report(report));
        self
    }

    /// The worker for `domain` errors out as if it crashed.
    pub fn crash(mut self, domain: &str, reason: &str) -> Self {
        self.scripts
            .insert(domain.to_string(), Script::Error(reason.to_string()));
        self
    }

    pub fn delay(mut self, domain: &str, delay: Duration) -> Self {
        self.delays.insert(domain.to_string(), delay);
        self
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Highest number of concurrently running requests observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn run(&self, request: &WorkerRequest) -> EngineResult<WorkerRun> {
        self.requests.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .delays
            .get(&request.domain)
            .copied()
            .or(self.default_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let report = match self.scripts.get(&request.domain) {
            Some(Script::Report(report)) => report.clone(),
            Some(Script::Error(reason)) => {
                return Err(EngineError::WorkerFailure {
                    unit_id: request.unit_id.clone(),
                    domains: vec![request.domain.clone()],
                    reason: reason.clone(),
                })
            }
            None => {
                for file in &request.files {
                    let path = request.workspace_path.join(file);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, format!("// {} for {}\n", request.domain, request.unit_id))?;
                }
                WorkerReport::success(request.files.clone(), Vec::new())
            }
        };
        Ok(WorkerRun {
            report,
            log: format!("scripted worker for {}\n", request.domain),
            duration_ms: delay.map_or(0, |d| d.as_millis() as u64),
        })
    }
}

/// Mirror that records every event and hands out sequential references.
#[derive(Debug, Default)]
pub struct RecordingMirror {
    events: Mutex<Vec<MirrorEvent>>,
}

impl RecordingMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MirrorEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl IssueMirror for RecordingMirror {
    async fn publish(&self, event: &MirrorEvent) -> EngineResult<Option<String>> {
        let mut events = self.events.lock().unwrap();
        events.push(event.clone());
        Ok(Some(format!("#{}", events.len())))
    }
}

/// Mirror whose tracker is always unreachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingMirror;

#[async_trait]
impl IssueMirror for FailingMirror {
    async fn publish(&self, _event: &MirrorEvent) -> EngineResult<Option<String>> {
        Err(EngineError::Mirror("tracker unreachable".into()))
    }
}
