//! In-memory operations on a [`RegistryTable`].
//!
//! Both stores load a table, call one of these, and persist only on `Ok`.
//! Every operation leaves the table satisfying the load-time invariants
//! checked by [`RegistryTable::validate`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::error::{RegistryError, RegistryResult};
use crate::resolver::detect_cycle;
use crate::schema::{
    format_unit_id, parse_unit_number, Dependencies, ExecutionRecord, Priority,
    RegistryStatistics, RegistryTable, UnitDraft, UnitStatus, WorkUnit,
};

/// Closed set of changes that may be applied to a stored unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitMutation {
    /// Move forward along the lifecycle. Same status is a no-op.
    Transition(UnitStatus),
    /// Operator rollback to `defined`. Clears status timestamps and the
    /// execution record.
    Rollback,
    AddBlocker(String),
    RemoveBlocker(String),
    SetPriority(Priority),
    SetTitle(String),
    SetTags(BTreeSet<String>),
    AddTag(String),
    RemoveTag(String),
    SetExternalRef(Option<String>),
    RecordExecution(ExecutionRecord),
}

impl RegistryTable {
    /// Hand out the next counter value.
    pub fn reserve_id(&mut self) -> u64 {
        let n = self.next_id;
        self.next_id += 1;
        n
    }

    /// Insert a new unit built from `draft`. Consumes one counter value.
    pub fn insert_draft(&mut self, draft: UnitDraft, now: DateTime<Utc>) -> RegistryResult<WorkUnit> {
        let n = self.reserve_id();
        let id = format_unit_id(n);
        if self.units.contains_key(&id) {
            return Err(RegistryError::corrupt(
                "registry.json",
                format!("counter {n} collides with existing unit {id}"),
            ));
        }
        for dep in &draft.blocked_by {
            if !self.units.contains_key(dep) {
                return Err(RegistryError::UnknownReference {
                    id: id.clone(),
                    reference: dep.clone(),
                });
            }
        }

        let unit = WorkUnit {
            id: id.clone(),
            title: draft.title,
            tags: draft.tags,
            priority: draft.priority,
            status: UnitStatus::Defined,
            created_at: now,
            updated_at: now,
            prepared_at: None,
            implemented_at: None,
            dependencies: Dependencies {
                blocked_by: draft.blocked_by,
                blocks: BTreeSet::new(),
            },
            external_ref: draft.external_ref,
            execution: None,
        };
        self.units.insert(id.clone(), unit);
        self.refresh(now);
        Ok(self.units[&id].clone())
    }

    /// Apply `mutation` to unit `id`.
    ///
    /// On error the table may be partially modified; callers discard it.
    pub fn apply(
        &mut self,
        id: &str,
        mutation: UnitMutation,
        now: DateTime<Utc>,
    ) -> RegistryResult<WorkUnit> {
        if !self.units.contains_key(id) {
            return Err(RegistryError::UnitNotFound { id: id.to_string() });
        }
        let check_cycle = matches!(mutation, UnitMutation::AddBlocker(_));
        if let UnitMutation::AddBlocker(dep) = &mutation {
            if !self.units.contains_key(dep) {
                return Err(RegistryError::UnknownReference {
                    id: id.to_string(),
                    reference: dep.clone(),
                });
            }
        }

        let unit = self
            .units
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnitNotFound { id: id.to_string() })?;
        match mutation {
            UnitMutation::Transition(to) => {
                let from = unit.status;
                if !from.can_transition_to(to) {
                    return Err(RegistryError::InvalidTransition {
                        id: id.to_string(),
                        from,
                        to,
                    });
                }
                if from == to {
                    return Ok(unit.clone());
                }
                unit.status = to;
                if to >= UnitStatus::Prepared && unit.prepared_at.is_none() {
                    unit.prepared_at = Some(now);
                }
                if to == UnitStatus::Implemented {
                    unit.implemented_at = Some(now);
                }
            }
            UnitMutation::Rollback => {
                unit.status = UnitStatus::Defined;
                unit.prepared_at = None;
                unit.implemented_at = None;
                unit.execution = None;
            }
            UnitMutation::AddBlocker(dep) => {
                unit.dependencies.blocked_by.insert(dep);
            }
            UnitMutation::RemoveBlocker(dep) => {
                unit.dependencies.blocked_by.remove(&dep);
            }
            UnitMutation::SetPriority(p) => unit.priority = p,
            UnitMutation::SetTitle(t) => unit.title = t,
            UnitMutation::SetTags(tags) => unit.tags = tags,
            UnitMutation::AddTag(t) => {
                unit.tags.insert(t);
            }
            UnitMutation::RemoveTag(t) => {
                unit.tags.remove(&t);
            }
            UnitMutation::SetExternalRef(r) => unit.external_ref = r,
            UnitMutation::RecordExecution(rec) => unit.execution = Some(rec),
        }
        unit.updated_at = now;

        if check_cycle {
            let all = self.unit_list();
            if let Some(cycle) = detect_cycle(&all) {
                return Err(RegistryError::CycleDetected { cycle });
            }
        }
        self.refresh(now);
        Ok(self.units[id].clone())
    }

    /// Recompute derived fields: `blocks`, statistics, `last_updated`.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        let transpose = self.blocks_transpose();
        for (id, unit) in self.units.iter_mut() {
            unit.dependencies.blocks = transpose.get(id).cloned().unwrap_or_default();
        }
        self.statistics = RegistryStatistics::from_units(self.units.values());
        self.last_updated = now;
    }

    fn blocks_transpose(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for unit in self.units.values() {
            for dep in &unit.dependencies.blocked_by {
                out.entry(dep.clone()).or_default().insert(unit.id.clone());
            }
        }
        out
    }

    /// Check the invariants a persisted table must satisfy. Returns a
    /// human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        for (key, unit) in &self.units {
            if key != &unit.id {
                return Err(format!("key {key} holds unit with id {}", unit.id));
            }
            if let Some(n) = parse_unit_number(&unit.id) {
                if n >= self.next_id {
                    return Err(format!(
                        "next_id {} is not ahead of existing unit {}",
                        self.next_id, unit.id
                    ));
                }
            }
        }

        let transpose = self.blocks_transpose();
        for (id, unit) in &self.units {
            let expected = transpose.get(id).cloned().unwrap_or_default();
            if unit.dependencies.blocks != expected {
                return Err(format!(
                    "{id}.blocks {:?} does not match the units blocked by it {:?}",
                    unit.dependencies.blocks, expected
                ));
            }
        }

        if let Some(cycle) = detect_cycle(&self.unit_list()) {
            return Err(format!("dependency cycle: {}", cycle.join(" -> ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(n: usize) -> RegistryTable {
        let mut t = RegistryTable::new("test");
        for i in 0..n {
            t.insert_draft(UnitDraft::new(format!("unit {i}")), Utc::now())
                .unwrap();
        }
        t
    }

    #[test]
    fn insert_assigns_sequential_ids() {
        let t = table_with(3);
        let ids: Vec<&String> = t.units.keys().collect();
        assert_eq!(ids, vec!["EPIC-001", "EPIC-002", "EPIC-003"]);
        assert_eq!(t.next_id, 4);
        assert_eq!(t.statistics.total, 3);
        assert_eq!(t.statistics.defined, 3);
    }

    #[test]
    fn add_blocker_maintains_transpose() {
        let mut t = table_with(2);
        t.apply("EPIC-002", UnitMutation::AddBlocker("EPIC-001".into()), Utc::now())
            .unwrap();
        assert!(t.units["EPIC-001"].dependencies.blocks.contains("EPIC-002"));
        t.validate().unwrap();

        t.apply("EPIC-002", UnitMutation::RemoveBlocker("EPIC-001".into()), Utc::now())
            .unwrap();
        assert!(t.units["EPIC-001"].dependencies.blocks.is_empty());
    }

    #[test]
    fn add_blocker_rejects_cycle_and_unknown_ids() {
        let mut t = table_with(2);
        t.apply("EPIC-002", UnitMutation::AddBlocker("EPIC-001".into()), Utc::now())
            .unwrap();
        let err = t
            .clone()
            .apply("EPIC-001", UnitMutation::AddBlocker("EPIC-002".into()), Utc::now())
            .unwrap_err();
        match err {
            RegistryError::CycleDetected { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"EPIC-002".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }

        let err = t
            .apply("EPIC-001", UnitMutation::AddBlocker("EPIC-999".into()), Utc::now())
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownReference { .. }));
    }

    #[test]
    fn transitions_stamp_timestamps_and_reject_backward_moves() {
        let mut t = table_with(1);
        let u = t
            .apply("EPIC-001", UnitMutation::Transition(UnitStatus::Ready), Utc::now())
            .unwrap();
        assert!(u.prepared_at.is_some());
        assert!(u.implemented_at.is_none());

        let err = t
            .apply("EPIC-001", UnitMutation::Transition(UnitStatus::Prepared), Utc::now())
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        let u = t
            .apply("EPIC-001", UnitMutation::Transition(UnitStatus::Implemented), Utc::now())
            .unwrap();
        assert!(u.implemented_at.is_some());
        assert_eq!(t.statistics.implemented, 1);
    }

    #[test]
    fn rollback_returns_to_defined_and_clears_stamps() {
        let mut t = table_with(1);
        t.apply("EPIC-001", UnitMutation::Transition(UnitStatus::Implemented), Utc::now())
            .unwrap();
        let u = t.apply("EPIC-001", UnitMutation::Rollback, Utc::now()).unwrap();
        assert_eq!(u.status, UnitStatus::Defined);
        assert!(u.prepared_at.is_none());
        assert!(u.implemented_at.is_none());
    }

    #[test]
    fn validate_rejects_stale_counter_and_bad_transpose() {
        let mut t = table_with(2);
        t.next_id = 2;
        assert!(t.validate().unwrap_err().contains("next_id"));

        let mut t = table_with(2);
        t.units
            .get_mut("EPIC-001")
            .unwrap()
            .dependencies
            .blocks
            .insert("EPIC-002".into());
        assert!(t.validate().unwrap_err().contains("blocks"));
    }

    #[test]
    fn unknown_unit_is_not_found() {
        let mut t = table_with(1);
        let err = t
            .apply("EPIC-042", UnitMutation::SetTitle("x".into()), Utc::now())
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnitNotFound { .. }));
    }
}
