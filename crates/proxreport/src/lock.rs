//! Single-run lock
//!
//! The state directory (staging, snapshots) and the config file belong to
//! one run at a time. The lock file records the holder's PID; a lock left
//! by a dead process, or by this very PID before a re-exec, is taken over.

use crate::error::LockError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, warn};

const LOCK_FILE: &str = "run.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: process::id(),
            acquired_at: Utc::now(),
        }
    }

    fn process_alive(&self) -> bool {
        Path::new(&format!("/proc/{}", self.pid)).exists()
    }
}

/// Held for the duration of a run; released on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(state_dir: &Path) -> Result<Self, LockError> {
        let path = state_dir.join(LOCK_FILE);
        let io_err = |source: io::Error| LockError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(state_dir).map_err(io_err)?;

        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<LockInfo>(&content) {
                Ok(holder) if holder.pid == process::id() => {
                    debug!("Re-taking lock held by this process");
                }
                Ok(holder) if holder.process_alive() => {
                    return Err(LockError::Held {
                        pid: holder.pid,
                        path,
                    });
                }
                Ok(holder) => {
                    warn!("Recovering lock left by dead PID {}", holder.pid);
                    fs::remove_file(&path).map_err(io_err)?;
                }
                Err(e) => {
                    warn!("Recovering corrupted lock {}: {}", path.display(), e);
                    fs::remove_file(&path).map_err(io_err)?;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        let content = serde_json::to_string(&LockInfo::current())
            .map_err(|e| io_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(content.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        Ok(Self { path })
    }

    fn held_by_us(&self) -> bool {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| serde_json::from_str::<LockInfo>(&c).ok())
            .map(|info| info.pid == process::id())
            .unwrap_or(false)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.held_by_us() {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Cannot release {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::acquire(dir.path()).unwrap();
        assert!(dir.path().join(LOCK_FILE).exists());
        drop(lock);
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_live_foreign_holder_blocks() {
        let dir = TempDir::new().unwrap();
        // PID 1 always exists
        let holder = LockInfo {
            pid: 1,
            acquired_at: Utc::now(),
        };
        fs::write(dir.path().join(LOCK_FILE), serde_json::to_string(&holder).unwrap()).unwrap();

        let err = RunLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, LockError::Held { pid: 1, .. }));
    }

    #[test]
    fn test_dead_and_corrupted_locks_recovered() {
        let dir = TempDir::new().unwrap();
        let dead = LockInfo {
            pid: 999_999_999,
            acquired_at: Utc::now(),
        };
        fs::write(dir.path().join(LOCK_FILE), serde_json::to_string(&dead).unwrap()).unwrap();
        drop(RunLock::acquire(dir.path()).unwrap());

        fs::write(dir.path().join(LOCK_FILE), "not json").unwrap();
        drop(RunLock::acquire(dir.path()).unwrap());
    }

    #[test]
    fn test_own_pid_is_reacquired() {
        let dir = TempDir::new().unwrap();
        let first = RunLock::acquire(dir.path()).unwrap();
        let second = RunLock::acquire(dir.path()).unwrap();
        drop(second);
        drop(first);
    }
}
