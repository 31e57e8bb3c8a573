//! Release manifest and change detection
//!
//! The manifest lists every managed file (relative to the install
//! directory) with its SHA-256. A file differs when its local content
//! hash differs or it does not exist locally.

use crate::config::UpdateConfig;
use crate::delivery::{DeliveryChannel, FetchJob};
use crate::endpoint::ServiceKind;
use crate::hashing::{is_valid_sha256, normalize_hash, sha256_file_opt};
use crate::paths::{downloads_dir, remote_join, STATE_DIR_NAME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Malformed manifest: {0}")]
    Malformed(String),

    #[error("Unsafe path in manifest: {0}")]
    UnsafePath(String),

    #[error("Invalid SHA-256 for {path}: {hash}")]
    BadHash { path: String, hash: String },
}

/// File mode, written either as a number or an octal string ("0755")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModeRepr {
    Number(u32),
    #[serde(with = "octal")]
    Octal(u32),
}

mod octal {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mode: &u32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:04o}", mode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let raw = String::deserialize(d)?;
        u32::from_str_radix(raw.trim_start_matches("0o"), 8).map_err(serde::de::Error::custom)
    }
}

/// One manifest entry: a bare hash or a hash plus mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestEntry {
    Hash(String),
    Detailed {
        sha256: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<ModeRepr>,
    },
}

impl ManifestEntry {
    pub fn sha256(&self) -> String {
        match self {
            ManifestEntry::Hash(hash) => normalize_hash(hash),
            ManifestEntry::Detailed { sha256, .. } => normalize_hash(sha256),
        }
    }

    pub fn mode(&self) -> Option<u32> {
        match self {
            ManifestEntry::Hash(_) => None,
            ManifestEntry::Detailed { mode, .. } => mode.map(|m| match m {
                ModeRepr::Number(n) | ModeRepr::Octal(n) => n & 0o7777,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub version: Option<String>,
    pub files: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Parse and validate a manifest document
    pub fn parse(contents: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest =
            serde_json::from_str(contents).map_err(|e| ManifestError::Malformed(e.to_string()))?;

        for (path, entry) in &manifest.files {
            if !is_safe_relative(path) {
                return Err(ManifestError::UnsafePath(path.clone()));
            }
            let hash = entry.sha256();
            if !is_valid_sha256(&hash) {
                return Err(ManifestError::BadHash {
                    path: path.clone(),
                    hash,
                });
            }
        }

        Ok(manifest)
    }
}

/// Relative, no `..`, no `.`, and never inside the agent's own state dir
fn is_safe_relative(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return false;
    }
    let mut components = path.split('/');
    if components.clone().next() == Some(STATE_DIR_NAME) {
        return false;
    }
    components.all(|c| !c.is_empty() && c != "." && c != "..")
}

/// A file under update control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedFile {
    /// Relative to the install directory, `/`-separated
    pub path: String,
    /// `None` when the file does not exist locally
    pub local_hash: Option<String>,
    pub remote_hash: String,
    pub mode: Option<u32>,
}

impl ManagedFile {
    pub fn is_addition(&self) -> bool {
        self.local_hash.is_none()
    }

    pub fn local_path(&self, install_dir: &Path) -> PathBuf {
        install_dir.join(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    NoChange,
    UpdateAvailable(Vec<ManagedFile>),
    ManifestUnavailable,
}

/// Remote location of a managed file's release copy
pub fn remote_file_path(remote_root: &str, relative: &str) -> String {
    remote_join(&remote_join(remote_root, "files"), relative)
}

/// Fetches the manifest and diffs it against the install directory
pub struct ManifestComparator {
    channel: DeliveryChannel,
    remote_manifest: String,
    downloads: PathBuf,
}

impl ManifestComparator {
    pub fn new(channel: DeliveryChannel, update: &UpdateConfig) -> Self {
        Self {
            channel,
            remote_manifest: remote_join(&update.remote_root, &update.manifest_name),
            downloads: downloads_dir(&update.effective_state_dir()),
        }
    }

    /// Download and parse the remote manifest; `None` when unavailable
    pub async fn fetch(&self) -> Option<Manifest> {
        if let Err(e) = tokio::fs::create_dir_all(&self.downloads).await {
            warn!("Cannot create {}: {}", self.downloads.display(), e);
            return None;
        }
        let local = self.downloads.join("manifest.json");
        let job = FetchJob::new(self.remote_manifest.clone(), local.clone());

        if let Err(e) = self.channel.deliver(ServiceKind::Updates, &job).await {
            warn!("Manifest unavailable: {}", e);
            return None;
        }

        let contents = match tokio::fs::read_to_string(&local).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Cannot read downloaded manifest: {}", e);
                return None;
            }
        };
        let _ = tokio::fs::remove_file(&local).await;

        match Manifest::parse(&contents) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Rejecting manifest: {}", e);
                None
            }
        }
    }

    pub async fn check(&self, install_dir: &Path) -> UpdateDecision {
        let manifest = match self.fetch().await {
            Some(manifest) => manifest,
            None => return UpdateDecision::ManifestUnavailable,
        };
        if let Some(version) = &manifest.version {
            debug!("Remote manifest version {}", version);
        }

        match compare(&manifest, install_dir).await {
            Ok(changed) if changed.is_empty() => {
                info!("All {} managed files up to date", manifest.files.len());
                UpdateDecision::NoChange
            }
            Ok(changed) => {
                info!("{} of {} managed files differ", changed.len(), manifest.files.len());
                UpdateDecision::UpdateAvailable(changed)
            }
            Err(e) => {
                warn!("Cannot hash install directory: {}", e);
                UpdateDecision::ManifestUnavailable
            }
        }
    }
}

/// Manifest entries whose local content differs, in manifest order
pub async fn compare(manifest: &Manifest, install_dir: &Path) -> std::io::Result<Vec<ManagedFile>> {
    let mut changed = Vec::new();

    for (path, entry) in &manifest.files {
        let remote_hash = entry.sha256();
        let local_hash = sha256_file_opt(&install_dir.join(path)).await?;

        if local_hash.as_deref() != Some(remote_hash.as_str()) {
            debug!(
                "{} differs (local {}, remote {})",
                path,
                local_hash.as_deref().unwrap_or("absent"),
                remote_hash
            );
            changed.push(ManagedFile {
                path: path.clone(),
                local_hash,
                remote_hash,
                mode: entry.mode(),
            });
        }
    }

    Ok(changed)
}
