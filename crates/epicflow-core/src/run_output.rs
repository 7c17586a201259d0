//! Per-unit run directory: `<state>/runs/<unit-id>/`.
//!
//! ```text
//! plan.json              concurrency plan the run executed
//! results/<domain>.json  worker outcome per domain (see `domain_file_stem`)
//! logs/<domain>.log      raw worker output
//! merge_state.json       merge progress, rewritten after every step
//! merge_summary.json     final merge summary
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::classifier::ConcurrencyPlan;
use crate::error::EngineResult;
use crate::workspace::sanitize;
use crate::worker::WorkerReport;

/// Write `value` as pretty JSON via a temp file renamed over `path`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read JSON from `path`; `Ok(None)` if the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> EngineResult<Option<T>> {
    match fs::read(path) {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Hex SHA-256 of `bytes`.
pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// File name stem for a domain's result and log. Labels that sanitize to
/// something else get a short digest of the raw label so that `front end`
/// and `front-end` never share a file.
fn domain_file_stem(domain: &str) -> String {
    let clean = sanitize(domain);
    if clean == domain {
        clean
    } else {
        format!("{clean}-{}", &digest_hex(domain.as_bytes())[..8])
    }
}

/// How a domain's worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Crashed,
    /// Completed in an earlier attempt and reused.
    Reused,
}

/// Persisted outcome of one domain's worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainResult {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    pub outcome: DomainOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<WorkerReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl DomainResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, DomainOutcome::Succeeded | DomainOutcome::Reused)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plan_path(&self) -> PathBuf {
        self.root.join("plan.json")
    }

    pub fn result_path(&self, domain: &str) -> PathBuf {
        self.root
            .join("results")
            .join(format!("{}.json", domain_file_stem(domain)))
    }

    pub fn log_path(&self, domain: &str) -> PathBuf {
        self.root
            .join("logs")
            .join(format!("{}.log", domain_file_stem(domain)))
    }

    pub fn merge_state_path(&self) -> PathBuf {
        self.root.join("merge_state.json")
    }

    pub fn merge_summary_path(&self) -> PathBuf {
        self.root.join("merge_summary.json")
    }

    /// Persist `plan` and return its digest.
    pub fn write_plan(&self, plan: &ConcurrencyPlan) -> EngineResult<String> {
        write_json_atomic(&self.plan_path(), plan)?;
        Ok(self.plan_digest()?.unwrap_or_default())
    }

    pub fn read_plan(&self) -> EngineResult<Option<ConcurrencyPlan>> {
        read_json(&self.plan_path())
    }

    /// Digest of the persisted plan file, if any.
    pub fn plan_digest(&self) -> EngineResult<Option<String>> {
        match fs::read(self.plan_path()) {
            Ok(raw) => Ok(Some(digest_hex(&raw))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_result(&self, result: &DomainResult) -> EngineResult<()> {
        write_json_atomic(&self.result_path(&result.domain), result)
    }

    pub fn read_result(&self, domain: &str) -> EngineResult<Option<DomainResult>> {
        read_json(&self.result_path(domain))
    }

    /// Replace the log for `domain`.
    pub fn write_log(&self, domain: &str, log: &str) -> EngineResult<()> {
        let path = self.log_path(domain);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, log)?;
        Ok(())
    }

    pub fn write_merge_state<T: Serialize>(&self, state: &T) -> EngineResult<()> {
        write_json_atomic(&self.merge_state_path(), state)
    }

    pub fn read_merge_state<T: DeserializeOwned>(&self) -> EngineResult<Option<T>> {
        read_json(&self.merge_state_path())
    }

    pub fn write_merge_summary<T: Serialize>(&self, summary: &T) -> EngineResult<()> {
        write_json_atomic(&self.merge_summary_path(), summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classifier, TaskAction, TaskEntry};

    #[test]
    fn plan_digest_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::new(dir.path().join("EPIC-001"));
        assert!(run.plan_digest().unwrap().is_none());

        let entries = vec![TaskEntry::new("src/api/a.py", None, TaskAction::Create)];
        let plan = Classifier::default().classify_entries(&entries);
        let d1 = run.write_plan(&plan).unwrap();
        assert_eq!(d1.len(), 64);
        assert_eq!(run.plan_digest().unwrap().as_deref(), Some(d1.as_str()));
        assert_eq!(run.read_plan().unwrap().unwrap(), plan);

        let mut changed = plan.clone();
        changed.reason.push('!');
        let d2 = run.write_plan(&changed).unwrap();
        assert_ne!(d1, d2);
    }

    #[test]
    fn results_and_logs_are_per_domain() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::new(dir.path());
        let result = DomainResult {
            domain: "Backend API".into(),
            workspace: None,
            outcome: DomainOutcome::TimedOut,
            report: None,
            error: Some("timed out after 1s".into()),
            duration_ms: 1000,
            finished_at: Utc::now(),
        };
        run.write_result(&result).unwrap();
        run.write_log("Backend API", "raw output").unwrap();

        let stem = run.result_path("Backend API");
        let stem = stem.file_stem().unwrap().to_str().unwrap();
        assert!(stem.starts_with("backend-api-"), "{stem}");
        assert_eq!(
            fs::read_to_string(run.log_path("Backend API")).unwrap(),
            "raw output"
        );
        let back = run.read_result("Backend API").unwrap().unwrap();
        assert!(!back.succeeded());
        assert_eq!(run.result_path("api"), dir.path().join("results/api.json"));
    }

    #[test]
    fn labels_that_sanitize_alike_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::new(dir.path());
        for (domain, outcome) in [
            ("front end", DomainOutcome::Failed),
            ("front-end", DomainOutcome::Succeeded),
            ("Front-End", DomainOutcome::Crashed),
        ] {
            run.write_result(&DomainResult {
                domain: domain.into(),
                workspace: None,
                outcome,
                report: None,
                error: None,
                duration_ms: 0,
                finished_at: Utc::now(),
            })
            .unwrap();
            run.write_log(domain, domain).unwrap();
        }

        assert_ne!(run.result_path("front end"), run.result_path("front-end"));
        assert_ne!(run.log_path("Front-End"), run.log_path("front-end"));
        assert_eq!(
            run.read_result("front end").unwrap().unwrap().outcome,
            DomainOutcome::Failed
        );
        assert_eq!(
            run.read_result("front-end").unwrap().unwrap().outcome,
            DomainOutcome::Succeeded
        );
        assert_eq!(
            run.read_result("Front-End").unwrap().unwrap().outcome,
            DomainOutcome::Crashed
        );
        assert_eq!(fs::read_to_string(run.log_path("front end")).unwrap(), "front end");
    }

    #[test]
    fn digest_is_sha256_hex() {
        assert_eq!(
            digest_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
