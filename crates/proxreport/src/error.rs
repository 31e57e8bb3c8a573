//! Error types for the update, overlay and run layers

use crate::updater::UpdatePhase;
use proxreport_common::{ConfigError, DeliveryError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Staged {path} does not match the manifest (expected {expected}, got {actual})")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Staging failed: {0}")]
    Staging(String),

    #[error("Backup failed: {0}")]
    Backup(String),

    #[error("Applied update failed verification: {0}")]
    ApplyVerification(String),

    #[error("Rollback failed, installation integrity uncertain: {0}")]
    RollbackFailure(String),

    #[error("Invalid phase transition {from:?} -> {to:?}")]
    InvalidTransition { from: UpdatePhase, to: UpdatePhase },

    #[error("Snapshot {0} is incomplete")]
    IncompleteSnapshot(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl UpdateError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("Merged config is invalid: {0}")]
    Invalid(#[from] ConfigError),

    #[error("Cannot serialise merged config: {0}")]
    Serialize(String),

    #[error("Cannot persist {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Another run (PID {pid}) holds {}", .path.display())]
    Held { pid: u32, path: PathBuf },

    #[error("Lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures that end a run
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Report command failed: {0}")]
    Extraction(String),

    #[error("No artifacts found in {}", .0.display())]
    NoArtifacts(PathBuf),

    #[error("Artifact upload failed: {0}")]
    Upload(#[source] DeliveryError),

    #[error("Run asked for a second restart after relaunch")]
    RelaunchLoop,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}
