//! In-memory registry (testing only)
//!
//! `MemoryRegistry` runs the same table operations as [`crate::FileRegistry`]
//! against a `Mutex<RegistryTable>`, committing only on success.

use std::sync::Mutex;

use chrono::Utc;

use crate::error::{RegistryError, RegistryResult};
use crate::schema::{RegistryTable, UnitDraft, UnitFilter, WorkUnit};
use crate::store::RegistryStore;
use crate::table::UnitMutation;

#[derive(Debug)]
pub struct MemoryRegistry {
    table: Mutex<RegistryTable>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(RegistryTable::new("memory")),
        }
    }

    /// Seed with an existing table, e.g. one with fixed timestamps.
    pub fn from_table(table: RegistryTable) -> Self {
        Self {
            table: Mutex::new(table),
        }
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut RegistryTable) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let mut guard = self.table.lock().unwrap();
        let mut candidate = guard.clone();
        let out = f(&mut candidate)?;
        candidate
            .validate()
            .map_err(|reason| RegistryError::corrupt("<memory>", reason))?;
        *guard = candidate;
        Ok(out)
    }
}

impl RegistryStore for MemoryRegistry {
    fn create(&self, draft: UnitDraft) -> RegistryResult<WorkUnit> {
        self.mutate(|t| t.insert_draft(draft, Utc::now()))
    }

    fn get(&self, id: &str) -> RegistryResult<WorkUnit> {
        let table = self.table.lock().unwrap();
        table
            .units
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnitNotFound { id: id.to_string() })
    }

    fn list(&self, filter: &UnitFilter) -> RegistryResult<Vec<WorkUnit>> {
        let table = self.table.lock().unwrap();
        Ok(table
            .units
            .values()
            .filter(|u| filter.matches(u))
            .cloned()
            .collect())
    }

    fn update(&self, id: &str, mutation: UnitMutation) -> RegistryResult<WorkUnit> {
        self.mutate(|t| t.apply(id, mutation, Utc::now()))
    }

    fn next_id(&self) -> RegistryResult<u64> {
        self.mutate(|t| Ok(t.reserve_id()))
    }

    fn snapshot(&self) -> RegistryResult<RegistryTable> {
        Ok(self.table.lock().unwrap().clone())
    }
}
