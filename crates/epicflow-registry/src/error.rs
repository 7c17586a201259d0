//! Error types for the registry layer.

use std::path::PathBuf;

use thiserror::Error;

use crate::schema::UnitStatus;

/// Errors produced by the registry store and dependency resolver.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A mutation would introduce a dependency cycle. `cycle` repeats its
    /// first id at the end.
    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// A status change violates the forward-only lifecycle.
    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: UnitStatus,
        to: UnitStatus,
    },

    /// No unit with this id exists.
    #[error("unit not found: {id}")]
    UnitNotFound { id: String },

    /// A mutation referenced an id that is not in the registry.
    #[error("unit {id} references unknown unit {reference}")]
    UnknownReference { id: String, reference: String },

    /// The persisted table failed to parse or validate.
    #[error("registry at {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// The registry has not been initialised at this path.
    #[error("no registry at {}; run `epicflow init` first", path.display())]
    NotInitialized { path: PathBuf },

    /// A registry already exists where `init` was asked to create one.
    #[error("registry already exists at {}", path.display())]
    AlreadyInitialized { path: PathBuf },

    /// The writer lock could not be acquired.
    #[error("registry lock {} is held: {reason}", path.display())]
    Lock { path: PathBuf, reason: String },

    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    /// Build a `Corrupt` error for `path`.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RegistryError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience result alias.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
