//! Persisted schema for the epic registry.
//!
//! The registry is a single JSON document (`registry.json`) holding every
//! [`WorkUnit`] keyed by id, plus the monotonic counter used to mint new ids.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk schema version.
pub const SCHEMA_VERSION: &str = "1";

/// Lifecycle state of a unit.
///
/// Declaration order is the lifecycle order; the derived `Ord` is what the
/// forward-only transition check compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Written down, nothing prepared yet.
    Defined,
    /// File-level task breakdown exists.
    Prepared,
    /// Passed preflight; eligible for selection.
    Ready,
    /// Claimed by a run.
    InProgress,
    /// Work merged into the baseline.
    Implemented,
    /// Retired or cancelled.
    Archived,
}

impl UnitStatus {
    pub const ALL: [UnitStatus; 6] = [
        UnitStatus::Defined,
        UnitStatus::Prepared,
        UnitStatus::Ready,
        UnitStatus::InProgress,
        UnitStatus::Implemented,
        UnitStatus::Archived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Defined => "defined",
            UnitStatus::Prepared => "prepared",
            UnitStatus::Ready => "ready",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Implemented => "implemented",
            UnitStatus::Archived => "archived",
        }
    }

    /// Whether a plain transition from `self` to `next` is forward.
    ///
    /// Skips are allowed and re-asserting the current status is a no-op.
    /// Going back is only possible through an explicit rollback.
    pub fn can_transition_to(self, next: UnitStatus) -> bool {
        next >= self
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "defined" => Ok(UnitStatus::Defined),
            "prepared" => Ok(UnitStatus::Prepared),
            "ready" => Ok(UnitStatus::Ready),
            "in_progress" => Ok(UnitStatus::InProgress),
            "implemented" => Ok(UnitStatus::Implemented),
            "archived" => Ok(UnitStatus::Archived),
            other => Err(format!(
                "invalid status: {other} (expected defined, prepared, ready, in_progress, implemented or archived)"
            )),
        }
    }
}

/// Scheduling priority. `Critical` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!(
                "invalid priority: {other} (expected critical, high, medium or low)"
            )),
        }
    }
}

/// Dependency edges of a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    /// Units that must be `implemented` before this one may run.
    #[serde(default)]
    pub blocked_by: BTreeSet<String>,
    /// Units waiting on this one. Always the transpose of `blocked_by`.
    #[serde(default)]
    pub blocks: BTreeSet<String>,
}

/// How a unit's work was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sequential => f.write_str("sequential"),
            ExecutionMode::Parallel => f.write_str("parallel"),
        }
    }
}

/// Outcome statistics of the run that implemented a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub mode: ExecutionMode,
    pub files_created: usize,
    pub files_modified: usize,
    pub finished_at: DateTime<Utc>,
}

/// One schedulable epic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub priority: Priority,
    pub status: UnitStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepared_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implemented_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Dependencies,
    /// Opaque id of the mirrored tracker record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionRecord>,
}

impl WorkUnit {
    /// Numeric part of a counter-derived id (`EPIC-007` → 7).
    pub fn number(&self) -> Option<u64> {
        parse_unit_number(&self.id)
    }
}

/// Format the id for counter value `n`.
pub fn format_unit_id(n: u64) -> String {
    format!("EPIC-{n:03}")
}

/// Parse the counter value out of an `EPIC-NNN` id.
pub fn parse_unit_number(id: &str) -> Option<u64> {
    id.strip_prefix("EPIC-")?.parse().ok()
}

/// Input for [`crate::RegistryStore::create`]. The store assigns the id and
/// timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitDraft {
    pub title: String,
    pub tags: BTreeSet<String>,
    pub priority: Priority,
    pub blocked_by: BTreeSet<String>,
    pub external_ref: Option<String>,
}

impl UnitDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn blocked_by(mut self, id: impl Into<String>) -> Self {
        self.blocked_by.insert(id.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Predicate for [`crate::RegistryStore::list`]. Empty filter matches all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFilter {
    pub status: Option<UnitStatus>,
    pub priority: Option<Priority>,
    pub tag: Option<String>,
}

impl UnitFilter {
    pub fn status(status: UnitStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, unit: &WorkUnit) -> bool {
        self.status.map_or(true, |s| unit.status == s)
            && self.priority.map_or(true, |p| unit.priority == p)
            && self.tag.as_ref().map_or(true, |t| unit.tags.contains(t))
    }
}

/// Per-status counts, recomputed on every save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total: usize,
    pub defined: usize,
    pub prepared: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub implemented: usize,
    pub archived: usize,
}

impl RegistryStatistics {
    pub fn from_units<'a>(units: impl IntoIterator<Item = &'a WorkUnit>) -> Self {
        let mut stats = Self::default();
        for unit in units {
            stats.total += 1;
            match unit.status {
                UnitStatus::Defined => stats.defined += 1,
                UnitStatus::Prepared => stats.prepared += 1,
                UnitStatus::Ready => stats.ready += 1,
                UnitStatus::InProgress => stats.in_progress += 1,
                UnitStatus::Implemented => stats.implemented += 1,
                UnitStatus::Archived => stats.archived += 1,
            }
        }
        stats
    }
}

/// Root document persisted as `registry.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTable {
    pub schema_version: String,
    pub project_name: String,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Next counter value to hand out. Strictly greater than every assigned id.
    pub next_id: u64,
    #[serde(default)]
    pub statistics: RegistryStatistics,
    #[serde(default)]
    pub units: BTreeMap<String, WorkUnit>,
}

impl RegistryTable {
    pub fn new(project_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            project_name: project_name.into(),
            created: now,
            last_updated: now,
            next_id: 1,
            statistics: RegistryStatistics::default(),
            units: BTreeMap::new(),
        }
    }

    /// All units as an owned vector, in id order.
    pub fn unit_list(&self) -> Vec<WorkUnit> {
        self.units.values().cloned().collect()
    }
}
