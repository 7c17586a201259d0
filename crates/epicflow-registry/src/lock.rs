//! Advisory lock files.
//!
//! A lock is an exclusive OS file lock (`flock`/`LockFileEx` through
//! `fd-lock`) on a well-known path. The kernel drops it when the holding
//! descriptor closes, so a crashed process never leaves a lock behind and a
//! live holder is never displaced no matter how long it runs. The file body
//! records the holder's pid and start time for error messages only.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RegistryError, RegistryResult};

/// Holder details written into a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
}

/// How long to keep retrying a held lock.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    /// Total time to wait for a held lock before giving up.
    pub wait: Duration,
    /// Poll interval while waiting.
    pub poll: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(5),
            poll: Duration::from_millis(50),
        }
    }
}

impl LockPolicy {
    /// Fail immediately if the lock is held.
    pub fn no_wait() -> Self {
        Self {
            wait: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Held lock. Released when dropped.
pub struct LockFile {
    path: PathBuf,
    info: LockInfo,
    // Owns the locked descriptor; closing it releases the OS lock.
    _fd_lock: Box<RwLock<File>>,
    // Same open file description, used to clear the body on release.
    body: File,
}

impl std::fmt::Debug for LockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFile")
            .field("path", &self.path)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl LockFile {
    /// Acquire the lock at `path`, waiting according to `policy`.
    pub fn acquire(path: &Path, purpose: &str, policy: LockPolicy) -> RegistryResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_lock(path, purpose)? {
                return Ok(lock);
            }
            if started.elapsed() >= policy.wait {
                let reason = match Self::read_info(path) {
                    Some(info) => format!(
                        "held by pid {} for {} since {}",
                        info.pid,
                        info.purpose,
                        info.created_at.to_rfc3339()
                    ),
                    None => "held by another process".to_string(),
                };
                return Err(RegistryError::Lock {
                    path: path.to_path_buf(),
                    reason,
                });
            }
            thread::sleep(policy.poll);
        }
    }

    fn try_lock(path: &Path, purpose: &str) -> RegistryResult<Option<Self>> {
        // Never truncate on open: the body belongs to whoever holds the lock.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let body = file.try_clone()?;
        let mut file = Box::new(RwLock::new(file));
        let info = LockInfo {
            pid: process::id(),
            purpose: purpose.to_string(),
            created_at: Utc::now(),
        };
        {
            let guard = match file.try_write() {
                Ok(guard) => guard,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let mut locked = &*guard;
            locked.set_len(0)?;
            locked.seek(SeekFrom::Start(0))?;
            locked.write_all(&serde_json::to_vec(&info)?)?;
            locked.sync_all()?;
            // The lock lives as long as the descriptor, not the guard.
            std::mem::forget(guard);
        }
        debug!(path = %path.display(), purpose, "lock acquired");
        Ok(Some(Self {
            path: path.to_path_buf(),
            info,
            _fd_lock: file,
            body,
        }))
    }

    /// Holder recorded in the lock file at `path`, if any.
    ///
    /// Informational: a body left by a process that has since exited does
    /// not mean the lock is held.
    pub fn read_info(path: &Path) -> Option<LockInfo> {
        let raw = fs::read(path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // The file stays in place; removing it would let a waiter lock an
        // unlinked inode while a newcomer locks a fresh one.
        if let Err(e) = self.body.set_len(0) {
            warn!(path = %self.path.display(), error = %e, "failed to clear lock file");
        }
        debug!(path = %self.path.display(), "lock released");
    }
}
