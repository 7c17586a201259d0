//! Code-generation worker seam.
//!
//! A worker receives one domain's task and a workspace path and reports what
//! it did. The engine only imposes a timeout and the working directory;
//! [`CommandWorker`] delegates to an external command speaking JSON.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// What the worker is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub unit_id: String,
    pub domain: String,
    pub workspace_path: PathBuf,
    pub files: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    Partial,
    Failure,
}

/// What the worker says it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub status: WorkerStatus,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

impl WorkerReport {
    pub fn success(files_created: Vec<String>, files_modified: Vec<String>) -> Self {
        Self {
            status: WorkerStatus::Success,
            files_created,
            files_modified,
            notes: String::new(),
        }
    }

    pub fn failure(notes: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Failure,
            files_created: Vec::new(),
            files_modified: Vec::new(),
            notes: notes.into(),
        }
    }

    /// Whether the run counts as done. Partial results count only when
    /// `accept_partial` is set.
    pub fn is_success(&self, accept_partial: bool) -> bool {
        match self.status {
            WorkerStatus::Success => true,
            WorkerStatus::Partial => accept_partial,
            WorkerStatus::Failure => false,
        }
    }
}

/// A finished worker invocation: the report plus its raw output for the log.
#[derive(Debug, Clone)]
pub struct WorkerRun {
    pub report: WorkerReport,
    pub log: String,
    pub duration_ms: u64,
}

#[async_trait]
pub trait Worker: Send + Sync {
    /// Run one task. Must be cancel-safe: the caller drops the future on
    /// timeout.
    async fn run(&self, request: &WorkerRequest) -> EngineResult<WorkerRun>;
}

/// Runs an external program in the workspace.
///
/// The request is written to stdin as JSON and the process also sees
/// `EPICFLOW_UNIT`, `EPICFLOW_DOMAIN` and `EPICFLOW_WORKSPACE`. Its stdout
/// must contain a [`WorkerReport`] as JSON, either the whole output or the
/// last non-empty line. A non-zero exit is a failure regardless of stdout.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
}

impl CommandWorker {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Parse a report from worker stdout.
pub fn parse_report(stdout: &str) -> Option<WorkerReport> {
    if let Ok(report) = serde_json::from_str(stdout.trim()) {
        return Some(report);
    }
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| serde_json::from_str(l).ok())
}

#[async_trait]
impl Worker for CommandWorker {
    async fn run(&self, request: &WorkerRequest) -> EngineResult<WorkerRun> {
        let start = Instant::now();
        let spawn_err = |e: std::io::Error| EngineError::WorkerFailure {
            unit_id: request.unit_id.clone(),
            domains: vec![request.domain.clone()],
            reason: format!("failed to start {}: {e}", self.program),
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&request.workspace_path)
            .env("EPICFLOW_UNIT", &request.unit_id)
            .env("EPICFLOW_DOMAIN", &request.domain)
            .env("EPICFLOW_WORKSPACE", &request.workspace_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(request)?;
            // A worker that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(&body).await {
                debug!(error = %e, "worker closed stdin");
            }
        }

        let output = child.wait_with_output().await?;
        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let log = format!(
            "$ {} {}\n--- exit: {:?}\n--- stdout\n{stdout}\n--- stderr\n{stderr}",
            self.program,
            self.args.join(" "),
            output.status.code()
        );

        let report = if !output.status.success() {
            WorkerReport::failure(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ))
        } else {
            parse_report(&stdout).unwrap_or_else(|| {
                WorkerReport::failure("worker output did not contain a JSON report")
            })
        };

        Ok(WorkerRun {
            report,
            log,
            duration_ms,
        })
    }
}

/// Stand-in used when no worker command is configured. Every run fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredWorker;

#[async_trait]
impl Worker for UnconfiguredWorker {
    async fn run(&self, request: &WorkerRequest) -> EngineResult<WorkerRun> {
        Err(EngineError::WorkerFailure {
            unit_id: request.unit_id.clone(),
            domains: vec![request.domain.clone()],
            reason: "no worker configured; set `worker` in config.json".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &std::path::Path) -> WorkerRequest {
        WorkerRequest {
            unit_id: "EPIC-001".into(),
            domain: "api".into(),
            workspace_path: dir.to_path_buf(),
            files: vec!["src/api.rs".into()],
            description: "Backend API implementation (1 file)".into(),
        }
    }

    #[test]
    fn partial_counts_only_when_accepted() {
        let mut report = WorkerReport::success(vec![], vec![]);
        report.status = WorkerStatus::Partial;
        assert!(!report.is_success(false));
        assert!(report.is_success(true));
    }

    #[test]
    fn report_may_be_last_line_of_output() {
        let out = "thinking...\n{\"status\":\"success\",\"files_created\":[\"a\"]}\n";
        let report = parse_report(out).unwrap();
        assert_eq!(report.status, WorkerStatus::Success);
        assert_eq!(report.files_created, vec!["a"]);
        assert!(parse_report("no json here").is_none());
    }

    #[tokio::test]
    async fn command_worker_reads_report_from_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let worker = CommandWorker::new(
            "sh",
            vec![
                "-c".into(),
                r#"cat >/dev/null; touch made.txt; echo "{\"status\":\"success\",\"files_created\":[\"made.txt\"]}""#.into(),
            ],
        );
        let run = worker.run(&request(dir.path())).await.unwrap();
        assert!(run.report.is_success(false));
        assert!(dir.path().join("made.txt").exists());
        assert!(run.log.contains("--- stdout"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let worker = CommandWorker::new("sh", vec!["-c".into(), "echo boom >&2; exit 3".into()]);
        let run = worker.run(&request(dir.path())).await.unwrap();
        assert_eq!(run.report.status, WorkerStatus::Failure);
        assert!(run.report.notes.contains("boom"));
    }

    #[tokio::test]
    async fn missing_program_is_worker_failure() {
        let dir = tempfile::tempdir().unwrap();
        let worker = CommandWorker::new("/nonexistent/epicflow-worker", vec![]);
        let err = worker.run(&request(dir.path())).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkerFailure { .. }));
    }
}
