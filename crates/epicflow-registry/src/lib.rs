//! Epic registry for epicflow.
//!
//! Durable, file-backed table of work units with their priority, lifecycle
//! status and dependency edges, plus pure dependency-resolution queries.
//! The registry guarantees two invariants on every persisted state: the
//! `blocked_by` graph is acyclic, and status only moves forward (except an
//! explicit rollback to `defined`).

pub mod error;
pub mod fakes;
pub mod lock;
pub mod resolver;
pub mod schema;
pub mod store;
pub mod table;

pub use error::{RegistryError, RegistryResult};
pub use lock::{LockFile, LockInfo, LockPolicy};
pub use resolver::{
    blocked_units, blockers_of, detect_cycle, is_blocked, ready_unblocked, topological_order,
    UnresolvedBlocker,
};
pub use schema::{
    format_unit_id, parse_unit_number, Dependencies, ExecutionMode, ExecutionRecord, Priority,
    RegistryStatistics, RegistryTable, UnitDraft, UnitFilter, UnitStatus, WorkUnit,
};
pub use store::{FileRegistry, RegistryStore, REGISTRY_FILE, REGISTRY_LOCK_FILE};
pub use table::UnitMutation;
