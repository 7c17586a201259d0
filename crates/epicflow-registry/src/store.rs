//! Durable registry storage.
//!
//! [`FileRegistry`] keeps the whole table in one JSON file. Every write takes
//! the writer lock, reloads the table, applies the change in memory, validates
//! it, writes a temp file in the same directory and renames it over the
//! table. Reads never take the lock.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::lock::{LockFile, LockPolicy};
use crate::schema::{RegistryTable, UnitDraft, UnitFilter, WorkUnit};
use crate::table::UnitMutation;

/// File name of the persisted table inside the state directory.
pub const REGISTRY_FILE: &str = "registry.json";
/// File name of the writer lock inside the state directory.
pub const REGISTRY_LOCK_FILE: &str = "registry.lock";

/// Storage interface for work units.
///
/// Implementations must make every mutating call all-or-nothing: on `Err`
/// the stored table is unchanged.
pub trait RegistryStore: Send + Sync {
    /// Create a unit in `defined`, assigning the next id.
    fn create(&self, draft: UnitDraft) -> RegistryResult<WorkUnit>;

    fn get(&self, id: &str) -> RegistryResult<WorkUnit>;

    /// Units matching `filter`, in id order.
    fn list(&self, filter: &UnitFilter) -> RegistryResult<Vec<WorkUnit>>;

    fn update(&self, id: &str, mutation: UnitMutation) -> RegistryResult<WorkUnit>;

    /// Reserve a counter value without creating a unit.
    fn next_id(&self) -> RegistryResult<u64>;

    /// Snapshot of the whole table, including statistics.
    fn snapshot(&self) -> RegistryResult<RegistryTable>;

    /// Every unit, in id order.
    fn all(&self) -> RegistryResult<Vec<WorkUnit>> {
        self.list(&UnitFilter::default())
    }
}

/// File-backed [`RegistryStore`].
#[derive(Debug, Clone)]
pub struct FileRegistry {
    dir: PathBuf,
    lock_policy: LockPolicy,
}

impl FileRegistry {
    /// Create a fresh registry in `dir`. Fails if one already exists.
    pub fn init(dir: impl AsRef<Path>, project_name: &str) -> RegistryResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            lock_policy: LockPolicy::default(),
        };
        let path = store.table_path();
        if path.exists() {
            return Err(RegistryError::AlreadyInitialized { path });
        }
        let _lock = store.lock()?;
        store.save(&RegistryTable::new(project_name))?;
        info!(path = %path.display(), project = project_name, "registry initialised");
        Ok(store)
    }

    /// Open an existing registry in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> RegistryResult<Self> {
        let store = Self {
            dir: dir.as_ref().to_path_buf(),
            lock_policy: LockPolicy::default(),
        };
        let path = store.table_path();
        if !path.exists() {
            return Err(RegistryError::NotInitialized { path });
        }
        // Fail fast on a corrupt table.
        store.load()?;
        Ok(store)
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table_path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    fn lock(&self) -> RegistryResult<LockFile> {
        LockFile::acquire(
            &self.dir.join(REGISTRY_LOCK_FILE),
            "registry write",
            self.lock_policy,
        )
    }

    /// Read and validate the persisted table.
    pub fn load(&self) -> RegistryResult<RegistryTable> {
        let path = self.table_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::NotInitialized { path })
            }
            Err(e) => return Err(e.into()),
        };
        let table: RegistryTable = serde_json::from_slice(&raw)
            .map_err(|e| RegistryError::corrupt(&path, e.to_string()))?;
        table
            .validate()
            .map_err(|reason| RegistryError::corrupt(&path, reason))?;
        Ok(table)
    }

    fn save(&self, table: &RegistryTable) -> RegistryResult<()> {
        let body = serde_json::to_vec_pretty(table)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&body)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.table_path()).map_err(|e| e.error)?;
        Ok(())
    }

    /// Lock, load, apply `f`, validate, persist. Nothing is written on `Err`.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut RegistryTable) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let _lock = self.lock()?;
        let mut table = self.load()?;
        let out = f(&mut table)?;
        table
            .validate()
            .map_err(|reason| RegistryError::corrupt(self.table_path(), reason))?;
        self.save(&table)?;
        Ok(out)
    }
}

impl RegistryStore for FileRegistry {
    fn create(&self, draft: UnitDraft) -> RegistryResult<WorkUnit> {
        let unit = self.mutate(|t| t.insert_draft(draft, Utc::now()))?;
        info!(id = %unit.id, title = %unit.title, "unit created");
        Ok(unit)
    }

    fn get(&self, id: &str) -> RegistryResult<WorkUnit> {
        self.load()?
            .units
            .remove(id)
            .ok_or_else(|| RegistryError::UnitNotFound { id: id.to_string() })
    }

    fn list(&self, filter: &UnitFilter) -> RegistryResult<Vec<WorkUnit>> {
        Ok(self
            .load()?
            .units
            .into_values()
            .filter(|u| filter.matches(u))
            .collect())
    }

    fn update(&self, id: &str, mutation: UnitMutation) -> RegistryResult<WorkUnit> {
        debug!(id, ?mutation, "applying mutation");
        let unit = self.mutate(|t| t.apply(id, mutation, Utc::now()))?;
        debug!(id, status = %unit.status, "unit updated");
        Ok(unit)
    }

    fn next_id(&self) -> RegistryResult<u64> {
        self.mutate(|t| Ok(t.reserve_id()))
    }

    fn snapshot(&self) -> RegistryResult<RegistryTable> {
        self.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::UnitStatus;

    fn make_store() -> (tempfile::TempDir, FileRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRegistry::init(dir.path(), "demo").unwrap();
        (dir, store)
    }

    #[test]
    fn create_and_reopen() {
        let (dir, store) = make_store();
        let u = store.create(UnitDraft::new("first")).unwrap();
        assert_eq!(u.id, "EPIC-001");

        let reopened = FileRegistry::open(dir.path()).unwrap();
        assert_eq!(reopened.get("EPIC-001").unwrap().title, "first");
        assert_eq!(reopened.snapshot().unwrap().project_name, "demo");
    }

    #[test]
    fn init_twice_fails() {
        let (dir, _store) = make_store();
        let err = FileRegistry::init(dir.path(), "again").unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyInitialized { .. }));
    }

    #[test]
    fn open_missing_registry_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileRegistry::open(dir.path()).unwrap_err();
        assert!(matches!(err, RegistryError::NotInitialized { .. }));
    }

    #[test]
    fn next_id_is_strictly_increasing_across_creates() {
        let (_dir, store) = make_store();
        let a = store.next_id().unwrap();
        let u = store.create(UnitDraft::new("x")).unwrap();
        let b = store.next_id().unwrap();
        assert_eq!(a, 1);
        assert_eq!(u.id, "EPIC-002");
        assert_eq!(b, 3);
    }

    #[test]
    fn rejected_update_leaves_file_untouched() {
        let (_dir, store) = make_store();
        store.create(UnitDraft::new("a")).unwrap();
        store
            .update("EPIC-001", UnitMutation::Transition(UnitStatus::Implemented))
            .unwrap();
        let before = fs::read(store.table_path()).unwrap();

        let err = store
            .update("EPIC-001", UnitMutation::Transition(UnitStatus::Ready))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        assert_eq!(fs::read(store.table_path()).unwrap(), before);
    }

    #[test]
    fn unknown_status_on_disk_is_corrupt() {
        let (_dir, store) = make_store();
        store.create(UnitDraft::new("a")).unwrap();
        let raw = fs::read_to_string(store.table_path()).unwrap();
        fs::write(store.table_path(), raw.replace("\"defined\"", "\"done\"")).unwrap();

        let err = store.get("EPIC-001").unwrap_err();
        assert!(matches!(err, RegistryError::Corrupt { .. }));
    }

    #[test]
    fn list_filters_by_status() {
        let (_dir, store) = make_store();
        store.create(UnitDraft::new("a")).unwrap();
        store.create(UnitDraft::new("b")).unwrap();
        store
            .update("EPIC-002", UnitMutation::Transition(UnitStatus::Ready))
            .unwrap();
        let ready = store.list(&UnitFilter::status(UnitStatus::Ready)).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "EPIC-002");
        assert_eq!(store.all().unwrap().len(), 2);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let (dir, store) = make_store();
        for i in 0..3 {
            store.create(UnitDraft::new(format!("u{i}"))).unwrap();
        }
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![REGISTRY_FILE.to_string()]);
    }
}
