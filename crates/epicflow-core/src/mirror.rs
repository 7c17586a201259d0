//! Issue-tracker mirroring.
//!
//! The engine notifies an [`IssueMirror`] when a unit is created, changes
//! status or is closed. Delivery is best effort: a failed notification is
//! appended to the outbox (`mirror_outbox.jsonl`) and retried by
//! [`MirrorOutbox::flush`], never blocking scheduling.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use epicflow_registry::{UnitStatus, WorkUnit};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorEventKind {
    Created,
    StatusChanged,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorEvent {
    pub kind: MirrorEventKind,
    pub unit_id: String,
    pub title: String,
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    pub at: DateTime<Utc>,
}

impl MirrorEvent {
    pub fn for_unit(kind: MirrorEventKind, unit: &WorkUnit) -> Self {
        Self {
            kind,
            unit_id: unit.id.clone(),
            title: unit.title.clone(),
            status: unit.status,
            external_ref: unit.external_ref.clone(),
            at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait IssueMirror: Send + Sync {
    /// Deliver `event`. Returns the tracker's record id for `Created` events
    /// when the tracker reports one.
    async fn publish(&self, event: &MirrorEvent) -> EngineResult<Option<String>>;
}

/// Mirror that accepts and drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMirror;

#[async_trait]
impl IssueMirror for NullMirror {
    async fn publish(&self, _event: &MirrorEvent) -> EngineResult<Option<String>> {
        Ok(None)
    }
}

/// Mirror backed by an external command.
///
/// The event is written to stdin as JSON. The first non-empty stdout line,
/// if any, is taken as the tracker record id.
#[derive(Debug, Clone)]
pub struct CommandMirror {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandMirror {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl IssueMirror for CommandMirror {
    async fn publish(&self, event: &MirrorEvent) -> EngineResult<Option<String>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Mirror(format!("failed to start {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(event)?;
            if let Err(e) = stdin.write_all(&body).await {
                debug!(error = %e, "mirror closed stdin");
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| EngineError::Mirror(format!("{} timed out", self.program)))??;
        if !output.status.success() {
            return Err(EngineError::Mirror(format!(
                "{} exited with {}: {}",
                self.program,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }
}

/// What a flush delivered and what is still queued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Delivered events with the record id the tracker returned.
    pub delivered: Vec<(MirrorEvent, Option<String>)>,
    pub remaining: usize,
}

/// Append-only queue of undelivered events, one JSON object per line.
#[derive(Debug, Clone)]
pub struct MirrorOutbox {
    path: PathBuf,
}

impl MirrorOutbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &MirrorEvent) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }

    /// Queued events, oldest first.
    pub fn pending(&self) -> EngineResult<Vec<MirrorEvent>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(EngineError::from))
            .collect()
    }

    /// Retry every queued event in order; undelivered ones stay queued.
    pub async fn flush(&self, mirror: &dyn IssueMirror) -> EngineResult<FlushReport> {
        let mut report = FlushReport::default();
        let mut keep = Vec::new();
        for event in self.pending()? {
            match mirror.publish(&event).await {
                Ok(reference) => report.delivered.push((event, reference)),
                Err(e) => {
                    debug!(unit_id = %event.unit_id, error = %e, "mirror retry failed");
                    keep.push(event);
                }
            }
        }
        report.remaining = keep.len();
        self.rewrite(&keep)?;
        info!(
            event = "mirror.flushed",
            delivered = report.delivered.len(),
            remaining = report.remaining,
        );
        Ok(report)
    }

    fn rewrite(&self, events: &[MirrorEvent]) -> EngineResult<()> {
        if events.is_empty() {
            return match fs::remove_file(&self.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for event in events {
            serde_json::to_writer(&mut tmp, event)?;
            tmp.write_all(b"\n")?;
        }
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
