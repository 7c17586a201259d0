//! Sequential, conflict-aware reconciliation of domain branches.

pub mod orchestrator;
pub mod precedence;

pub use orchestrator::{ConflictRecord, MergeOrchestrator, MergePhase, MergeState, MergeSummary};
pub use precedence::PrecedenceTable;
