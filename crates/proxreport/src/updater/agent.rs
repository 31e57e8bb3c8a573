//! The update state machine
//!
//! check -> stage -> back up -> apply -> verify -> restart, or roll back.
//! Nothing in the install directory changes before every changed file
//! is staged and verified and a complete snapshot exists.

use super::fsops;
use super::health::HealthCheck;
use super::snapshot::{SnapshotMeta, SnapshotStore};
use super::stage::{stage_files, StagedFile};
use super::state::{PhaseTrail, UpdatePhase};
use crate::error::UpdateError;
use proxreport_common::config::UpdateConfig;
use proxreport_common::hashing::sha256_file_opt;
use proxreport_common::paths::{snapshots_dir, staging_dir};
use proxreport_common::{DeliveryChannel, ManifestComparator, UpdateDecision};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// How an update attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Install already matches the manifest
    NoChange,
    /// Manifest could not be fetched or trusted; treated as no change
    Unavailable,
    /// Staging or backup failed; install untouched
    Abandoned { reason: String },
    /// New version installed and verified; a restart is due
    Applied { files: Vec<String>, snapshot: String },
    /// Apply or verification failed and the previous version is back
    RolledBack { reason: String, snapshot: String },
    /// Restoring the previous version failed too
    RollbackFailed { reason: String },
}

impl UpdateOutcome {
    pub fn needs_restart(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub outcome: UpdateOutcome,
    pub trail: PhaseTrail,
}

pub struct UpdateAgent {
    channel: DeliveryChannel,
    comparator: ManifestComparator,
    install_dir: PathBuf,
    remote_root: String,
    staging: PathBuf,
    snapshots: SnapshotStore,
    health: Option<Arc<dyn HealthCheck>>,
    trail: PhaseTrail,
}

impl UpdateAgent {
    pub fn new(channel: DeliveryChannel, config: &UpdateConfig) -> Self {
        let state_dir = config.effective_state_dir();
        Self {
            comparator: ManifestComparator::new(channel.clone(), config),
            channel,
            install_dir: config.install_dir.clone(),
            remote_root: config.remote_root.clone(),
            staging: staging_dir(&state_dir),
            snapshots: SnapshotStore::new(snapshots_dir(&state_dir), config.keep_snapshots),
            health: None,
            trail: PhaseTrail::new(),
        }
    }

    pub fn with_health_check(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    fn enter(&mut self, phase: UpdatePhase) {
        if let Err(e) = self.trail.advance(phase) {
            error!("{}", e);
        }
    }

    fn finish(&mut self, outcome: UpdateOutcome) -> UpdateReport {
        UpdateReport {
            outcome,
            trail: self.trail.clone(),
        }
    }

    /// One full update attempt
    pub async fn run(&mut self) -> UpdateReport {
        self.trail = PhaseTrail::new();
        self.enter(UpdatePhase::Checking);

        let files = match self.comparator.check(&self.install_dir).await {
            UpdateDecision::UpdateAvailable(files) => files,
            UpdateDecision::NoChange => {
                self.enter(UpdatePhase::NoChange);
                self.enter(UpdatePhase::Idle);
                return self.finish(UpdateOutcome::NoChange);
            }
            UpdateDecision::ManifestUnavailable => {
                warn!("Update check skipped: manifest unavailable");
                self.enter(UpdatePhase::NoChange);
                self.enter(UpdatePhase::Idle);
                return self.finish(UpdateOutcome::Unavailable);
            }
        };

        self.enter(UpdatePhase::Staging);
        let staged = match stage_files(&self.channel, &self.remote_root, &self.staging, &files).await {
            Ok(staged) => staged,
            Err(e) => {
                warn!("Update abandoned during staging: {}", e);
                self.enter(UpdatePhase::Idle);
                return self.finish(UpdateOutcome::Abandoned {
                    reason: e.to_string(),
                });
            }
        };

        self.enter(UpdatePhase::BackingUp);
        let snapshot = match self.snapshots.create(&self.install_dir, &files).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Update abandoned during backup: {}", e);
                self.clear_staging().await;
                self.enter(UpdatePhase::Idle);
                return self.finish(UpdateOutcome::Abandoned {
                    reason: e.to_string(),
                });
            }
        };
        if let Err(e) = self.snapshots.prune(&snapshot.id).await {
            warn!("Snapshot pruning failed: {}", e);
        }

        self.enter(UpdatePhase::Applying);
        let applied = self.apply(&staged, &snapshot).await;
        let verified = match applied {
            Ok(()) => {
                self.enter(UpdatePhase::Verifying);
                self.verify(&staged).await
            }
            Err(e) => Err(e),
        };
        self.clear_staging().await;

        if let Err(e) = verified {
            error!("Update failed, rolling back: {}", e);
            self.enter(UpdatePhase::ApplyFailed);
            return self.roll_back(&snapshot, e.to_string()).await;
        }

        self.enter(UpdatePhase::Success);
        self.enter(UpdatePhase::RestartSkipUpdate);
        let paths: Vec<String> = staged.iter().map(|s| s.file.path.clone()).collect();
        info!("Update applied to {} file(s)", paths.len());
        self.finish(UpdateOutcome::Applied {
            files: paths,
            snapshot: snapshot.id,
        })
    }

    async fn apply(&self, staged: &[StagedFile], snapshot: &SnapshotMeta) -> Result<(), UpdateError> {
        for item in staged {
            install_staged(&self.install_dir, item, snapshot).await?;
        }
        Ok(())
    }

    async fn verify(&self, staged: &[StagedFile]) -> Result<(), UpdateError> {
        verify_installed(&self.install_dir, staged).await?;

        if let Some(health) = &self.health {
            health
                .check(&self.install_dir)
                .await
                .map_err(UpdateError::ApplyVerification)?;
        }
        Ok(())
    }

    async fn roll_back(&mut self, snapshot: &SnapshotMeta, reason: String) -> UpdateReport {
        self.enter(UpdatePhase::RollingBack);
        match self.snapshots.restore(snapshot, &self.install_dir).await {
            Ok(()) => {
                self.enter(UpdatePhase::RolledBack);
                self.enter(UpdatePhase::Idle);
                self.finish(UpdateOutcome::RolledBack {
                    reason,
                    snapshot: snapshot.id.clone(),
                })
            }
            Err(e) => {
                error!("{}", e);
                self.finish(UpdateOutcome::RollbackFailed {
                    reason: format!("{} (after: {})", e, reason),
                })
            }
        }
    }

    async fn clear_staging(&self) {
        if let Err(e) = fsops::reset_dir(&self.staging).await {
            warn!("Cannot clear staging area {}: {}", self.staging.display(), e);
        }
    }
}

/// Re-hash every installed file against its manifest hash
pub async fn verify_installed(install_dir: &Path, staged: &[StagedFile]) -> Result<(), UpdateError> {
    for item in staged {
        let live = item.file.local_path(install_dir);
        let hash = sha256_file_opt(&live)
            .await
            .map_err(|e| UpdateError::ApplyVerification(format!("{}: {}", item.file.path, e)))?;
        if hash.as_deref() != Some(item.file.remote_hash.as_str()) {
            return Err(UpdateError::ApplyVerification(format!(
                "{} does not match the manifest after apply",
                item.file.path
            )));
        }
    }
    Ok(())
}

/// Mode for a file being installed: manifest, else previous, else default
pub fn install_mode(path: &str, manifest_mode: Option<u32>, previous: Option<u32>) -> u32 {
    if let Some(mode) = manifest_mode.or(previous) {
        return mode;
    }
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("py") | Some("sh") => 0o755,
        _ => 0o644,
    }
}

/// Rename one staged file over its live counterpart
pub async fn install_staged(
    install_dir: &Path,
    item: &StagedFile,
    snapshot: &SnapshotMeta,
) -> Result<(), UpdateError> {
    let target = item.file.local_path(install_dir);
    let previous = snapshot.entry(&item.file.path).and_then(|e| e.mode);
    let mode = install_mode(&item.file.path, item.file.mode, previous);

    fsops::rename_into_place(&item.staged, &target, mode)
        .await
        .map_err(|e| UpdateError::io(format!("Installing {}", item.file.path), e))?;
    info!("Installed {} (mode {:o})", item.file.path, mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_mode_precedence() {
        assert_eq!(install_mode("a.py", Some(0o700), Some(0o644)), 0o700);
        assert_eq!(install_mode("a.py", None, Some(0o640)), 0o640);
        assert_eq!(install_mode("bin/run.sh", None, None), 0o755);
        assert_eq!(install_mode("v2/proxmox_core.py", None, None), 0o755);
        assert_eq!(install_mode("templates/report.html", None, None), 0o644);
    }

    #[tokio::test]
    async fn test_verify_catches_tampered_install() {
        use proxreport_common::hashing::sha256_bytes;
        use proxreport_common::ManagedFile;

        let install = tempfile::TempDir::new().unwrap();
        let staging = tempfile::TempDir::new().unwrap();
        std::fs::write(staging.path().join("core.py"), "new").unwrap();
        let item = StagedFile {
            file: ManagedFile {
                path: "core.py".to_string(),
                local_hash: None,
                remote_hash: sha256_bytes(b"new"),
                mode: None,
            },
            staged: staging.path().join("core.py"),
        };
        let snapshot = SnapshotMeta {
            id: "s".to_string(),
            created_at: chrono::Utc::now(),
            entries: vec![],
        };

        install_staged(install.path(), &item, &snapshot).await.unwrap();
        verify_installed(install.path(), std::slice::from_ref(&item)).await.unwrap();

        std::fs::write(install.path().join("core.py"), "tampered").unwrap();
        let err = verify_installed(install.path(), std::slice::from_ref(&item))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::ApplyVerification(_)));

        std::fs::remove_file(install.path().join("core.py")).unwrap();
        assert!(verify_installed(install.path(), &[item]).await.is_err());
    }

    #[test]
    fn test_only_applied_needs_restart() {
        assert!(UpdateOutcome::Applied {
            files: vec![],
            snapshot: "s".to_string()
        }
        .needs_restart());
        assert!(!UpdateOutcome::NoChange.needs_restart());
        assert!(!UpdateOutcome::RolledBack {
            reason: String::new(),
            snapshot: "s".to_string()
        }
        .needs_restart());
    }
}
