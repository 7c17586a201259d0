//! Pure dependency queries over a set of units.
//!
//! An edge `A -> B` means "A is blocked by B": B must reach
//! [`UnitStatus::Implemented`] before A may run. Nothing here touches disk;
//! the store calls [`detect_cycle`] on the candidate table before every
//! write, and the selector calls [`is_blocked`] on every candidate.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{RegistryError, RegistryResult};
use crate::schema::{UnitStatus, WorkUnit};

/// A `blocked_by` entry that has not been satisfied yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedBlocker {
    pub id: String,
    /// `None` when the id does not resolve to any unit.
    pub status: Option<UnitStatus>,
}

fn index(all: &[WorkUnit]) -> HashMap<&str, &WorkUnit> {
    all.iter().map(|u| (u.id.as_str(), u)).collect()
}

/// Blockers of `unit` that are not yet implemented, in id order. Unknown
/// ids are reported with `status: None`.
pub fn blockers_of(unit: &WorkUnit, all: &[WorkUnit]) -> Vec<UnresolvedBlocker> {
    let by_id = index(all);
    unit.dependencies
        .blocked_by
        .iter()
        .filter_map(|dep| match by_id.get(dep.as_str()) {
            Some(u) if u.status == UnitStatus::Implemented => None,
            Some(u) => Some(UnresolvedBlocker {
                id: dep.clone(),
                status: Some(u.status),
            }),
            None => Some(UnresolvedBlocker {
                id: dep.clone(),
                status: None,
            }),
        })
        .collect()
}

/// True iff any blocker of `unit` is missing or not implemented.
pub fn is_blocked(unit: &WorkUnit, all: &[WorkUnit]) -> bool {
    let by_id = index(all);
    unit.dependencies.blocked_by.iter().any(|dep| {
        by_id
            .get(dep.as_str())
            .map_or(true, |u| u.status != UnitStatus::Implemented)
    })
}

/// Open units (not implemented or archived) that are currently blocked.
pub fn blocked_units<'a>(all: &'a [WorkUnit]) -> Vec<&'a WorkUnit> {
    all.iter()
        .filter(|u| !matches!(u.status, UnitStatus::Implemented | UnitStatus::Archived))
        .filter(|u| is_blocked(u, all))
        .collect()
}

/// Units in `ready` whose blockers are all implemented, in id order.
pub fn ready_unblocked<'a>(all: &'a [WorkUnit]) -> Vec<&'a WorkUnit> {
    let mut out: Vec<&WorkUnit> = all
        .iter()
        .filter(|u| u.status == UnitStatus::Ready && !is_blocked(u, all))
        .collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

/// Find one dependency cycle, if any.
///
/// The result is the cycle as an id path along `blocked_by` edges with the
/// first id repeated at the end (`[A, B, A]`). Traversal visits ids in
/// sorted order so the reported cycle is stable for a given table.
pub fn detect_cycle(all: &[WorkUnit]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let edges: BTreeMap<&str, Vec<&str>> = all
        .iter()
        .map(|u| {
            (
                u.id.as_str(),
                u.dependencies.blocked_by.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    let mut marks: HashMap<&str, Mark> = edges.keys().map(|id| (*id, Mark::Unvisited)).collect();

    for &start in edges.keys() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        // Iterative DFS: (node, next edge index).
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        marks.insert(start, Mark::OnStack);

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let succs = &edges[node];
            if frame.1 < succs.len() {
                let succ = succs[frame.1];
                frame.1 += 1;
                match marks.get(succ).copied() {
                    // Unknown ids are leaves.
                    None | Some(Mark::Done) => {}
                    Some(Mark::OnStack) => {
                        let pos = stack
                            .iter()
                            .position(|(id, _)| *id == succ)
                            .unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[pos..].iter().map(|(id, _)| id.to_string()).collect();
                        cycle.push(succ.to_string());
                        return Some(cycle);
                    }
                    Some(Mark::Unvisited) => {
                        marks.insert(succ, Mark::OnStack);
                        stack.push((succ, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
                stack.pop();
            }
        }
    }
    None
}

/// Order units so every blocker precedes the units it blocks.
///
/// Kahn's algorithm; among simultaneously available units the one with the
/// earliest `created_at` goes first, then the lowest id. Blockers that do
/// not resolve to a unit impose no ordering.
pub fn topological_order(all: &[WorkUnit]) -> RegistryResult<Vec<String>> {
    let by_id = index(all);
    let mut in_degree: HashMap<&str, usize> = all.iter().map(|u| (u.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for unit in all {
        for dep in &unit.dependencies.blocked_by {
            if by_id.contains_key(dep.as_str()) {
                *in_degree.entry(unit.id.as_str()).or_default() += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(unit.id.as_str());
            }
        }
    }

    let key = |id: &str| -> Reverse<(DateTime<Utc>, String)> {
        Reverse((by_id[id].created_at, id.to_string()))
    };

    let mut heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| key(id))
        .collect();

    let mut sorted = Vec::with_capacity(all.len());
    while let Some(Reverse((_, id))) = heap.pop() {
        if let Some(next) = dependents.get(id.as_str()) {
            for &d in next {
                if let Some(deg) = in_degree.get_mut(d) {
                    *deg -= 1;
                    if *deg == 0 {
                        heap.push(key(d));
                    }
                }
            }
        }
        sorted.push(id);
    }

    if sorted.len() != in_degree.len() {
        let cycle = detect_cycle(all).unwrap_or_else(|| {
            let mut rest: Vec<String> = in_degree
                .iter()
                .filter(|(_, &deg)| deg > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            rest.sort();
            rest
        });
        return Err(RegistryError::CycleDetected { cycle });
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Dependencies, Priority};
    use chrono::TimeZone;

    fn unit(id: &str, status: UnitStatus, minute: u32, blocked_by: &[&str]) -> WorkUnit {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap();
        WorkUnit {
            id: id.to_string(),
            title: format!("unit {id}"),
            tags: Default::default(),
            priority: Priority::Medium,
            status,
            created_at: ts,
            updated_at: ts,
            prepared_at: None,
            implemented_at: None,
            dependencies: Dependencies {
                blocked_by: blocked_by.iter().map(|s| s.to_string()).collect(),
                blocks: Default::default(),
            },
            external_ref: None,
            execution: None,
        }
    }

    #[test]
    fn blocked_until_every_blocker_is_implemented() {
        let mut all = vec![
            unit("EPIC-001", UnitStatus::Ready, 0, &[]),
            unit("EPIC-002", UnitStatus::Ready, 1, &["EPIC-001"]),
        ];
        assert!(is_blocked(&all[1], &all));
        all[0].status = UnitStatus::Implemented;
        assert!(!is_blocked(&all[1], &all));
    }

    #[test]
    fn unknown_blocker_counts_as_blocking() {
        let all = vec![unit("EPIC-001", UnitStatus::Ready, 0, &["EPIC-404"])];
        assert!(is_blocked(&all[0], &all));
        let blockers = blockers_of(&all[0], &all);
        assert_eq!(blockers.len(), 1);
        assert_eq!(blockers[0].status, None);
    }

    #[test]
    fn topological_order_puts_blockers_first() {
        let all = vec![
            unit("EPIC-003", UnitStatus::Defined, 0, &["EPIC-002"]),
            unit("EPIC-002", UnitStatus::Defined, 1, &["EPIC-001"]),
            unit("EPIC-001", UnitStatus::Defined, 2, &[]),
        ];
        assert_eq!(
            topological_order(&all).unwrap(),
            vec!["EPIC-001", "EPIC-002", "EPIC-003"]
        );
    }

    #[test]
    fn topological_ties_break_on_created_at_then_id() {
        let all = vec![
            unit("EPIC-003", UnitStatus::Defined, 5, &[]),
            unit("EPIC-002", UnitStatus::Defined, 1, &[]),
            unit("EPIC-004", UnitStatus::Defined, 1, &[]),
            unit("EPIC-001", UnitStatus::Defined, 9, &[]),
        ];
        assert_eq!(
            topological_order(&all).unwrap(),
            vec!["EPIC-002", "EPIC-004", "EPIC-003", "EPIC-001"]
        );
    }

    #[test]
    fn detect_cycle_returns_closed_path() {
        let all = vec![
            unit("EPIC-001", UnitStatus::Defined, 0, &["EPIC-002"]),
            unit("EPIC-002", UnitStatus::Defined, 1, &["EPIC-003"]),
            unit("EPIC-003", UnitStatus::Defined, 2, &["EPIC-001"]),
        ];
        let cycle = detect_cycle(&all).unwrap();
        assert_eq!(cycle, vec!["EPIC-001", "EPIC-002", "EPIC-003", "EPIC-001"]);
        assert!(matches!(
            topological_order(&all),
            Err(RegistryError::CycleDetected { .. })
        ));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let all = vec![unit("EPIC-001", UnitStatus::Defined, 0, &["EPIC-001"])];
        assert_eq!(detect_cycle(&all).unwrap(), vec!["EPIC-001", "EPIC-001"]);
    }

    #[test]
    fn acyclic_diamond_has_no_cycle() {
        let all = vec![
            unit("EPIC-001", UnitStatus::Defined, 0, &[]),
            unit("EPIC-002", UnitStatus::Defined, 1, &["EPIC-001"]),
            unit("EPIC-003", UnitStatus::Defined, 2, &["EPIC-001"]),
            unit("EPIC-004", UnitStatus::Defined, 3, &["EPIC-002", "EPIC-003"]),
        ];
        assert!(detect_cycle(&all).is_none());
        let order = topological_order(&all).unwrap();
        assert_eq!(order.first().map(String::as_str), Some("EPIC-001"));
        assert_eq!(order.last().map(String::as_str), Some("EPIC-004"));
    }

    #[test]
    fn ready_unblocked_and_blocked_units_partition_open_work() {
        let all = vec![
            unit("EPIC-001", UnitStatus::Implemented, 0, &[]),
            unit("EPIC-002", UnitStatus::Ready, 1, &["EPIC-001"]),
            unit("EPIC-003", UnitStatus::Ready, 2, &["EPIC-002"]),
            unit("EPIC-004", UnitStatus::Defined, 3, &["EPIC-404"]),
        ];
        let ready: Vec<&str> = ready_unblocked(&all).iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ready, vec!["EPIC-002"]);
        let blocked: Vec<&str> = blocked_units(&all).iter().map(|u| u.id.as_str()).collect();
        assert_eq!(blocked, vec!["EPIC-003", "EPIC-004"]);
    }
}
