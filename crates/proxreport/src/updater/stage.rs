//! Staging of changed files before anything is touched in the install

use super::fsops;
use crate::error::UpdateError;
use async_trait::async_trait;
use proxreport_common::hashing::sha256_file;
use proxreport_common::manifest::remote_file_path;
use proxreport_common::transport::TransportSession;
use proxreport_common::{DeliveryChannel, DeliveryJob, ManagedFile, ServiceKind, TransportError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Downloads every changed file within a single session
#[derive(Debug, Clone)]
pub struct StageJob {
    pub transfers: Vec<(String, PathBuf)>,
}

#[async_trait]
impl DeliveryJob for StageJob {
    type Output = u64;

    fn describe(&self) -> String {
        format!("staging of {} file(s)", self.transfers.len())
    }

    async fn run(&self, session: &mut dyn TransportSession) -> Result<u64, TransportError> {
        let mut total = 0;
        for (remote, local) in &self.transfers {
            total += session.download(remote, local).await?;
        }
        Ok(total)
    }
}

/// A changed file sitting verified in the staging area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub file: ManagedFile,
    pub staged: PathBuf,
}

pub fn staged_path(staging: &Path, file: &ManagedFile) -> PathBuf {
    staging.join(&file.path)
}

/// Fetch `files` into a fresh staging area and check each one against
/// its manifest hash. On any failure the staging area is emptied.
pub async fn stage_files(
    channel: &DeliveryChannel,
    remote_root: &str,
    staging: &Path,
    files: &[ManagedFile],
) -> Result<Vec<StagedFile>, UpdateError> {
    let result = stage_inner(channel, remote_root, staging, files).await;
    if result.is_err() {
        if let Err(e) = fsops::reset_dir(staging).await {
            warn!("Cannot clear staging area {}: {}", staging.display(), e);
        }
    }
    result
}

async fn stage_inner(
    channel: &DeliveryChannel,
    remote_root: &str,
    staging: &Path,
    files: &[ManagedFile],
) -> Result<Vec<StagedFile>, UpdateError> {
    fsops::reset_dir(staging)
        .await
        .map_err(|e| UpdateError::io(format!("Preparing {}", staging.display()), e))?;

    let mut transfers = Vec::with_capacity(files.len());
    for file in files {
        let local = staged_path(staging, file);
        fsops::ensure_parent(&local)
            .await
            .map_err(|e| UpdateError::io(format!("Preparing {}", local.display()), e))?;
        transfers.push((remote_file_path(remote_root, &file.path), local));
    }

    let job = StageJob { transfers };
    let result = channel
        .deliver(ServiceKind::Updates, &job)
        .await
        .map_err(|e| UpdateError::Staging(e.to_string()))?;
    debug!("Staged {} bytes from {}", result.output, result.endpoint);

    let mut staged = Vec::with_capacity(files.len());
    for (file, (_, local)) in files.iter().zip(job.transfers.iter()) {
        let actual = sha256_file(local)
            .await
            .map_err(|e| UpdateError::io(format!("Hashing {}", local.display()), e))?;
        if actual != file.remote_hash {
            return Err(UpdateError::HashMismatch {
                path: file.path.clone(),
                expected: file.remote_hash.clone(),
                actual,
            });
        }
        staged.push(StagedFile {
            file: file.clone(),
            staged: local.clone(),
        });
    }

    info!("{} file(s) staged and verified", staged.len());
    Ok(staged)
}
