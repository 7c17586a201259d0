//! Acyclicity and lifecycle monotonicity of the file-backed registry.

use std::fs;

use epicflow_registry::{
    FileRegistry, RegistryError, RegistryStore, UnitDraft, UnitMutation, UnitStatus,
};

fn make_store() -> (tempfile::TempDir, FileRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRegistry::init(dir.path(), "invariants").unwrap();
    (dir, store)
}

#[test]
fn closing_a_dependency_loop_is_rejected_and_not_persisted() {
    let (_dir, store) = make_store();
    store.create(UnitDraft::new("a")).unwrap();
    store.create(UnitDraft::new("b").blocked_by("EPIC-001")).unwrap();
    store.create(UnitDraft::new("c").blocked_by("EPIC-002")).unwrap();
    let before = fs::read(store.table_path()).unwrap();

    let err = store
        .update("EPIC-001", UnitMutation::AddBlocker("EPIC-003".into()))
        .unwrap_err();
    match err {
        RegistryError::CycleDetected { cycle } => {
            assert_eq!(cycle.first(), cycle.last());
            for id in ["EPIC-001", "EPIC-002", "EPIC-003"] {
                assert!(cycle.iter().any(|c| c == id), "{id} missing from {cycle:?}");
            }
        }
        other => panic!("expected CycleDetected, got {other:?}"),
    }
    assert_eq!(fs::read(store.table_path()).unwrap(), before);
}

#[test]
fn self_blocking_is_rejected() {
    let (_dir, store) = make_store();
    store.create(UnitDraft::new("a")).unwrap();
    let err = store
        .update("EPIC-001", UnitMutation::AddBlocker("EPIC-001".into()))
        .unwrap_err();
    assert!(matches!(err, RegistryError::CycleDetected { .. }));
}

#[test]
fn arbitrary_edge_sequence_never_persists_a_cycle() {
    let (_dir, store) = make_store();
    for i in 0..6 {
        store.create(UnitDraft::new(format!("u{i}"))).unwrap();
    }
    // Deterministic pseudo-random edge attempts.
    let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
    for _ in 0..60 {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let from = format!("EPIC-{:03}", seed % 6 + 1);
        let to = format!("EPIC-{:03}", (seed / 6) % 6 + 1);
        let _ = store.update(&from, UnitMutation::AddBlocker(to));

        let all = store.all().unwrap();
        assert!(epicflow_registry::detect_cycle(&all).is_none());
        epicflow_registry::topological_order(&all).unwrap();
    }
}

#[test]
fn status_never_moves_backward_without_rollback() {
    let (_dir, store) = make_store();
    store.create(UnitDraft::new("a")).unwrap();

    for to in [UnitStatus::Prepared, UnitStatus::Ready, UnitStatus::InProgress] {
        store.update("EPIC-001", UnitMutation::Transition(to)).unwrap();
    }
    for back in [UnitStatus::Defined, UnitStatus::Prepared, UnitStatus::Ready] {
        let err = store
            .update("EPIC-001", UnitMutation::Transition(back))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        assert_eq!(store.get("EPIC-001").unwrap().status, UnitStatus::InProgress);
    }

    // Re-asserting is a no-op.
    let before = store.get("EPIC-001").unwrap();
    let after = store
        .update("EPIC-001", UnitMutation::Transition(UnitStatus::InProgress))
        .unwrap();
    assert_eq!(before.updated_at, after.updated_at);

    let rolled = store.update("EPIC-001", UnitMutation::Rollback).unwrap();
    assert_eq!(rolled.status, UnitStatus::Defined);
}

#[test]
fn hand_edited_cycle_makes_the_registry_corrupt() {
    let (dir, store) = make_store();
    store.create(UnitDraft::new("a")).unwrap();
    store.create(UnitDraft::new("b").blocked_by("EPIC-001")).unwrap();

    let mut table = store.snapshot().unwrap();
    table
        .units
        .get_mut("EPIC-001")
        .unwrap()
        .dependencies
        .blocked_by
        .insert("EPIC-002".into());
    table
        .units
        .get_mut("EPIC-002")
        .unwrap()
        .dependencies
        .blocks
        .insert("EPIC-001".into());
    fs::write(
        store.table_path(),
        serde_json::to_vec_pretty(&table).unwrap(),
    )
    .unwrap();

    let err = FileRegistry::open(dir.path()).unwrap_err();
    assert!(matches!(err, RegistryError::Corrupt { .. }));
}
