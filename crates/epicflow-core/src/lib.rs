//! epicflow core.
//!
//! Picks the next ready epic, decides whether its file-level tasks can run
//! in parallel, supervises one isolated git worktree per domain, and merges
//! the results back into the base branch in a fixed precedence order.

pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod fakes;
pub mod graph;
pub mod layout;
pub mod merge;
pub mod mirror;
pub mod obs;
pub mod run_output;
pub mod selector;
pub mod telemetry;
pub mod vcs;
pub mod worker;
pub mod workspace;

pub use classifier::{
    load_task_entries, Classifier, ClassifierThresholds, ConcurrencyPlan, DomainRuleSpec,
    DomainRules, DomainTask, TaskAction, TaskEntry, Threshold, UNCLASSIFIED_DOMAIN,
};
pub use config::{CommandSpec, EngineConfig};
pub use engine::{Engine, RunOutcome, RunReport, UnitPlan, SEQUENTIAL_DOMAIN};
pub use error::{EngineError, EngineResult, EXIT_CONFLICT, EXIT_FAILURE, EXIT_OK};
pub use graph::{render_dot, render_text};
pub use layout::{StateLayout, STATE_DIR_NAME};
pub use merge::{ConflictRecord, MergeOrchestrator, MergePhase, MergeState, MergeSummary, PrecedenceTable};
pub use mirror::{
    CommandMirror, FlushReport, IssueMirror, MirrorEvent, MirrorEventKind, MirrorOutbox, NullMirror,
};
pub use run_output::{DomainOutcome, DomainResult, RunDir};
pub use selector::{explain_selection, select_next, SelectionExplanation, SelectionVerdict};
pub use telemetry::init_tracing;
pub use vcs::{GitCli, MergeOutcome, Vcs};
pub use worker::{CommandWorker, UnconfiguredWorker, Worker, WorkerReport, WorkerRequest, WorkerStatus};
pub use workspace::{
    AbortReport, SupervisorOptions, Workspace, WorkspaceRun, WorkspaceStatus, WorkspaceSupervisor,
};
