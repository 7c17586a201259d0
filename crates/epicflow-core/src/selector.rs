//! Next-unit selection.

use chrono::{DateTime, Utc};
use epicflow_registry::{blockers_of, is_blocked, Priority, UnitStatus, UnresolvedBlocker, WorkUnit};
use serde::Serialize;

fn selection_key(u: &WorkUnit) -> (Priority, DateTime<Utc>, &str) {
    (u.priority, u.created_at, u.id.as_str())
}

/// The highest-priority ready, unblocked unit; ties go to the oldest, then
/// the lowest id.
pub fn select_next(all: &[WorkUnit]) -> Option<&WorkUnit> {
    all.iter()
        .filter(|u| u.status == UnitStatus::Ready && !is_blocked(u, all))
        .min_by(|a, b| selection_key(a).cmp(&selection_key(b)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SelectionVerdict {
    Selected,
    /// Eligible, queued behind `position` other units.
    Eligible { position: usize },
    Blocked { blockers: Vec<UnresolvedBlocker> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionExplanation {
    pub unit_id: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub verdict: SelectionVerdict,
}

/// Why each `ready` unit was or was not picked, in selection order with
/// blocked units last.
pub fn explain_selection(all: &[WorkUnit]) -> Vec<SelectionExplanation> {
    let mut ready: Vec<&WorkUnit> = all.iter().filter(|u| u.status == UnitStatus::Ready).collect();
    ready.sort_by(|a, b| selection_key(a).cmp(&selection_key(b)));

    let (eligible, blocked): (Vec<&WorkUnit>, Vec<&WorkUnit>) =
        ready.into_iter().partition(|u| !is_blocked(u, all));

    let mut out = Vec::with_capacity(eligible.len() + blocked.len());
    for (position, u) in eligible.into_iter().enumerate() {
        let verdict = if position == 0 {
            SelectionVerdict::Selected
        } else {
            SelectionVerdict::Eligible { position }
        };
        out.push(SelectionExplanation {
            unit_id: u.id.clone(),
            priority: u.priority,
            created_at: u.created_at,
            verdict,
        });
    }
    for u in blocked {
        out.push(SelectionExplanation {
            unit_id: u.id.clone(),
            priority: u.priority,
            created_at: u.created_at,
            verdict: SelectionVerdict::Blocked {
                blockers: blockers_of(u, all),
            },
        });
    }
    out
}
