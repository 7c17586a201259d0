//! Structured lifecycle events.
//!
//! Every event is an `info!` (or `warn!`) line carrying an `event` field so
//! JSON logs can be filtered by kind. [`UnitSpan`] scopes a run's log lines
//! to its unit id.

use tracing::{info, warn};

use crate::workspace::WorkspaceStatus;

/// RAII guard entering a span tagged with `unit_id`.
pub struct UnitSpan {
    _span: tracing::span::EnteredSpan,
}

impl UnitSpan {
    pub fn enter(unit_id: &str) -> Self {
        Self {
            _span: unit_span(unit_id).entered(),
        }
    }
}

/// Span for instrumenting a unit's async work; [`UnitSpan`] is for sync
/// scopes only.
pub fn unit_span(unit_id: &str) -> tracing::Span {
    tracing::info_span!("epicflow.unit", unit_id = %unit_id)
}

pub fn emit_unit_selected(unit_id: &str, priority: &str, candidates: usize) {
    info!(event = "unit.selected", unit_id = %unit_id, priority = %priority, candidates);
}

pub fn emit_plan_classified(
    unit_id: &str,
    viable: bool,
    file_count: usize,
    domain_count: usize,
    overlap_ratio: f64,
) {
    info!(
        event = "plan.classified",
        unit_id = %unit_id,
        viable,
        file_count,
        domain_count,
        overlap_ratio,
    );
}

pub fn emit_workspace_transition(name: &str, from: WorkspaceStatus, to: WorkspaceStatus) {
    info!(event = "workspace.transition", workspace = %name, from = %from, to = %to);
}

pub fn emit_worker_finished(unit_id: &str, domain: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "worker.finished",
        unit_id = %unit_id,
        domain = %domain,
        outcome = %outcome,
        duration_ms,
    );
}

pub fn emit_merge_step(unit_id: &str, domain: &str, outcome: &str) {
    info!(event = "merge.step", unit_id = %unit_id, domain = %domain, outcome = %outcome);
}

pub fn emit_merge_finished(unit_id: &str, merged: usize, success: bool, elapsed_ms: u64) {
    info!(
        event = "merge.finished",
        unit_id = %unit_id,
        merged,
        success,
        elapsed_ms,
    );
}

/// A mirror notification failed and was queued for retry.
pub fn emit_mirror_deferred(unit_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "mirror.deferred", unit_id = %unit_id, error = %error);
}
