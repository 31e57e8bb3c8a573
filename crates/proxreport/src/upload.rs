//! Artifact collection and upload

use crate::error::RunError;
use proxreport_common::config::AgentConfig;
use proxreport_common::delivery::UploadItem;
use proxreport_common::hashing::sha256_file;
use proxreport_common::{artifact_file_name, Artifact, DeliveryChannel, JobResult, ServiceKind, UploadJob};
use tokio::fs;
use tracing::{info, warn};

/// Rendered artifacts present in the output dir. Missing ones are skipped.
pub async fn collect_artifacts(config: &AgentConfig) -> Result<Vec<Artifact>, RunError> {
    let output_dir = &config.report.output_dir;
    let mut artifacts = Vec::new();

    for spec in &config.report.artifacts {
        let name = artifact_file_name(&config.client, &spec.kind, &spec.extension);
        let local_path = output_dir.join(&name);
        match fs::metadata(&local_path).await {
            Ok(meta) if meta.is_file() => artifacts.push(Artifact {
                kind: spec.kind.clone(),
                local_path,
                remote_name: name,
            }),
            _ => warn!("Artifact {} not found, skipping", local_path.display()),
        }
    }

    if artifacts.is_empty() {
        return Err(RunError::NoArtifacts(output_dir.clone()));
    }
    Ok(artifacts)
}

/// Build the upload job for `artifacts`
pub async fn upload_job(
    artifacts: &[Artifact],
    base_path: &str,
    confirm_hash: bool,
) -> Result<UploadJob, RunError> {
    let mut items = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let io_err = |source| RunError::Io {
            context: format!("Reading {}", artifact.local_path.display()),
            source,
        };
        let size = fs::metadata(&artifact.local_path).await.map_err(io_err)?.len();
        let sha256 = if confirm_hash {
            Some(sha256_file(&artifact.local_path).await.map_err(io_err)?)
        } else {
            None
        };
        items.push(UploadItem {
            local: artifact.local_path.clone(),
            remote: artifact.remote_path(base_path),
            size,
            sha256,
        });
    }
    Ok(UploadJob { items })
}

/// Collect and push every artifact; exhaustion is fatal for the run
pub async fn upload_artifacts(
    channel: &DeliveryChannel,
    config: &AgentConfig,
) -> Result<JobResult<Vec<String>>, RunError> {
    let artifacts = collect_artifacts(config).await?;
    let job = upload_job(&artifacts, &config.sftp.base_path, config.upload.confirm_hash).await?;

    let result = channel
        .deliver(ServiceKind::Uploads, &job)
        .await
        .map_err(RunError::Upload)?;
    info!(
        "Uploaded {} artifact(s) to {}:{}",
        result.output.len(),
        result.endpoint,
        config.sftp.base_path
    );
    Ok(result)
}
