//! Workspace supervision: one isolated git worktree per concurrently
//! executing domain.

pub mod model;
pub mod supervisor;

pub use model::{sanitize, workspace_branch, workspace_name, Workspace, WorkspaceStatus};
pub use supervisor::{AbortReport, SupervisorOptions, WorkspaceRun, WorkspaceSupervisor};
