//! Installation snapshots for rollback
//!
//! Layout: `<snapshots>/<id>/files/<relative path>` plus `snapshot.json`.
//! The metadata file is written last; a directory without it is an
//! interrupted backup and is never restored from.

use super::fsops;
use crate::error::UpdateError;
use chrono::{DateTime, Utc};
use proxreport_common::hashing::{sha256_file, sha256_file_opt};
use proxreport_common::ManagedFile;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

const METADATA_FILE: &str = "snapshot.json";
const FILES_DIR: &str = "files";

/// Pre-update state of one managed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: String,
    /// `None` when the file did not exist (an addition)
    pub sha256: Option<String>,
    pub mode: Option<u32>,
}

impl SnapshotEntry {
    pub fn existed(&self) -> bool {
        self.sha256.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<SnapshotEntry>,
}

impl SnapshotMeta {
    pub fn entry(&self, path: &str) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|e| e.path == path)
    }
}

/// Manages the snapshot directory
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    keep: usize,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            root: root.into(),
            keep: keep.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn saved_copy(&self, id: &str, relative: &str) -> PathBuf {
        self.snapshot_dir(id).join(FILES_DIR).join(relative)
    }

    fn new_id() -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"), &suffix[..8])
    }

    /// Copy every file about to change out of `install_dir` and verify
    /// the copies. Returns only once the snapshot is complete.
    pub async fn create(
        &self,
        install_dir: &Path,
        files: &[ManagedFile],
    ) -> Result<SnapshotMeta, UpdateError> {
        let id = Self::new_id();
        let dir = self.snapshot_dir(&id);
        fs::create_dir_all(dir.join(FILES_DIR))
            .await
            .map_err(|e| UpdateError::io(format!("Creating snapshot {}", id), e))?;

        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let live = file.local_path(install_dir);
            let entry = self.save_one(&id, &file.path, &live).await?;
            entries.push(entry);
        }

        let meta = SnapshotMeta {
            id: id.clone(),
            created_at: Utc::now(),
            entries,
        };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| UpdateError::Backup(format!("serialising snapshot {}: {}", id, e)))?;
        fsops::write_atomic(&dir.join(METADATA_FILE), &json, 0o600)
            .await
            .map_err(|e| UpdateError::io(format!("Writing metadata of snapshot {}", id), e))?;

        info!("Snapshot {} holds {} file(s)", id, meta.entries.len());
        Ok(meta)
    }

    async fn save_one(&self, id: &str, relative: &str, live: &Path) -> Result<SnapshotEntry, UpdateError> {
        let original_hash = sha256_file_opt(live)
            .await
            .map_err(|e| UpdateError::io(format!("Hashing {}", live.display()), e))?;

        let original_hash = match original_hash {
            Some(hash) => hash,
            None => {
                debug!("{} is new, recording absence", relative);
                return Ok(SnapshotEntry {
                    path: relative.to_string(),
                    sha256: None,
                    mode: None,
                });
            }
        };

        let mode = fsops::file_mode(live)
            .await
            .map_err(|e| UpdateError::io(format!("Reading mode of {}", live.display()), e))?;
        let copy = self.saved_copy(id, relative);
        fsops::ensure_parent(&copy)
            .await
            .map_err(|e| UpdateError::io(format!("Preparing {}", copy.display()), e))?;
        fs::copy(live, &copy)
            .await
            .map_err(|e| UpdateError::io(format!("Copying {}", live.display()), e))?;

        let copy_hash = sha256_file(&copy)
            .await
            .map_err(|e| UpdateError::io(format!("Hashing {}", copy.display()), e))?;
        if copy_hash != original_hash {
            return Err(UpdateError::Backup(format!(
                "copy of {} does not match the original",
                relative
            )));
        }

        Ok(SnapshotEntry {
            path: relative.to_string(),
            sha256: Some(original_hash),
            mode,
        })
    }

    /// Load a complete snapshot's metadata
    pub async fn load(&self, id: &str) -> Result<SnapshotMeta, UpdateError> {
        let path = self.snapshot_dir(id).join(METADATA_FILE);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UpdateError::IncompleteSnapshot(id.to_string()))
            }
            Err(e) => return Err(UpdateError::io(format!("Reading {}", path.display()), e)),
        };
        serde_json::from_slice(&data)
            .map_err(|e| UpdateError::Backup(format!("snapshot {} metadata unreadable: {}", id, e)))
    }

    /// Complete snapshots, newest first
    pub async fn list(&self) -> Result<Vec<SnapshotMeta>, UpdateError> {
        let mut snapshots = Vec::new();
        for id in self.dir_names().await? {
            match self.load(&id).await {
                Ok(meta) => snapshots.push(meta),
                Err(UpdateError::IncompleteSnapshot(_)) => {}
                Err(e) => warn!("Ignoring snapshot {}: {}", id, e),
            }
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    async fn dir_names(&self) -> Result<Vec<String>, UpdateError> {
        let mut names = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(UpdateError::io(format!("Listing {}", self.root.display()), e)),
        };
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| UpdateError::io(format!("Listing {}", self.root.display()), e))?
        {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    /// Keep `current` plus the newest other complete snapshots, `keep` in
    /// total; interrupted ones go too. `current` survives even when a clock
    /// step makes older snapshots look newer. Returns the removed ids.
    pub async fn prune(&self, current: &str) -> Result<Vec<String>, UpdateError> {
        let complete = self.list().await?;
        let mut retained: Vec<&str> = vec![current];
        retained.extend(
            complete
                .iter()
                .map(|m| m.id.as_str())
                .filter(|id| *id != current)
                .take(self.keep - 1),
        );

        let mut removed = Vec::new();
        for id in self.dir_names().await? {
            if retained.contains(&id.as_str()) {
                continue;
            }
            let dir = self.snapshot_dir(&id);
            match fs::remove_dir_all(&dir).await {
                Ok(()) => removed.push(id),
                Err(e) => warn!("Cannot prune snapshot {}: {}", dir.display(), e),
            }
        }
        if !removed.is_empty() {
            debug!("Pruned {} snapshot(s)", removed.len());
        }
        Ok(removed)
    }

    /// Put every entry of `meta` back exactly as captured. Additions are
    /// removed. Any failure leaves the install in an unknown state.
    pub async fn restore(&self, meta: &SnapshotMeta, install_dir: &Path) -> Result<(), UpdateError> {
        for entry in meta.entries.iter().rev() {
            let live = install_dir.join(&entry.path);
            let result = match &entry.sha256 {
                Some(_) => {
                    let copy = self.saved_copy(&meta.id, &entry.path);
                    fsops::replace_with_copy(&copy, &live, entry.mode.unwrap_or(0o644)).await
                }
                None => fsops::remove_if_present(&live).await,
            };
            result.map_err(|e| {
                UpdateError::RollbackFailure(format!("restoring {}: {}", entry.path, e))
            })?;
        }

        for entry in &meta.entries {
            let live = install_dir.join(&entry.path);
            let now = sha256_file_opt(&live).await.map_err(|e| {
                UpdateError::RollbackFailure(format!("re-hashing {}: {}", entry.path, e))
            })?;
            if now != entry.sha256 {
                return Err(UpdateError::RollbackFailure(format!(
                    "{} does not match its snapshot after restore",
                    entry.path
                )));
            }
        }

        info!("Restored {} file(s) from snapshot {}", meta.entries.len(), meta.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxreport_common::hashing::sha256_bytes;
    use tempfile::TempDir;

    fn managed(path: &str, local: Option<&str>) -> ManagedFile {
        ManagedFile {
            path: path.to_string(),
            local_hash: local.map(|s| sha256_bytes(s.as_bytes())),
            remote_hash: sha256_bytes(b"remote"),
            mode: None,
        }
    }

    #[tokio::test]
    async fn test_create_then_restore() {
        let install = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        std::fs::write(install.path().join("a.py"), "original").unwrap();
        fsops::set_mode(&install.path().join("a.py"), 0o750).await.unwrap();

        let store = SnapshotStore::new(state.path(), 5);
        let meta = store
            .create(install.path(), &[managed("a.py", Some("original")), managed("lib/new.py", None)])
            .await
            .unwrap();
        assert!(meta.entry("a.py").unwrap().existed());
        assert!(!meta.entry("lib/new.py").unwrap().existed());

        // Simulate an applied update
        std::fs::write(install.path().join("a.py"), "broken").unwrap();
        std::fs::create_dir_all(install.path().join("lib")).unwrap();
        std::fs::write(install.path().join("lib/new.py"), "added").unwrap();

        store.restore(&meta, install.path()).await.unwrap();
        assert_eq!(std::fs::read_to_string(install.path().join("a.py")).unwrap(), "original");
        assert_eq!(fsops::file_mode(&install.path().join("a.py")).await.unwrap(), Some(0o750));
        assert!(!install.path().join("lib/new.py").exists());
    }

    #[tokio::test]
    async fn test_prune_keeps_current_despite_future_dated_snapshot() {
        let install = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        std::fs::write(install.path().join("core.py"), "old").unwrap();

        // Left behind while the clock ran ahead
        let stale = SnapshotMeta {
            id: "29990101T000000.000Z-0badc10c".to_string(),
            created_at: "2999-01-01T00:00:00Z".parse().unwrap(),
            entries: vec![],
        };
        let stale_dir = state.path().join(&stale.id);
        std::fs::create_dir_all(stale_dir.join("files")).unwrap();
        std::fs::write(stale_dir.join("snapshot.json"), serde_json::to_vec(&stale).unwrap()).unwrap();

        let store = SnapshotStore::new(state.path(), 1);
        let meta = store
            .create(install.path(), &[managed("core.py", Some("old"))])
            .await
            .unwrap();

        let removed = store.prune(&meta.id).await.unwrap();
        assert_eq!(removed, vec![stale.id.clone()]);
        let kept: Vec<String> = store.list().await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(kept, vec![meta.id.clone()]);

        std::fs::write(install.path().join("core.py"), "new").unwrap();
        store.restore(&meta, install.path()).await.unwrap();
        assert_eq!(std::fs::read_to_string(install.path().join("core.py")).unwrap(), "old");
    }

    #[tokio::test]
    async fn test_incomplete_snapshot_is_ignored() {
        let state = TempDir::new().unwrap();
        std::fs::create_dir_all(state.path().join("20250101T000000.000Z-deadbeef/files")).unwrap();

        let store = SnapshotStore::new(state.path(), 5);
        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(
            store.load("20250101T000000.000Z-deadbeef").await,
            Err(UpdateError::IncompleteSnapshot(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_with_missing_copy_is_rollback_failure() {
        let install = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        std::fs::write(install.path().join("a.py"), "original").unwrap();

        let store = SnapshotStore::new(state.path(), 5);
        let meta = store
            .create(install.path(), &[managed("a.py", Some("original"))])
            .await
            .unwrap();
        std::fs::remove_file(state.path().join(&meta.id).join("files/a.py")).unwrap();

        let err = store.restore(&meta, install.path()).await.unwrap_err();
        assert!(matches!(err, UpdateError::RollbackFailure(_)));
    }
}
