//! Error types shared by the transport and delivery layers.

use crate::delivery::AttemptRecord;
use crate::endpoint::ServiceKind;
use thiserror::Error;

/// Configuration problems. Always fatal and always raised before any
/// network activity.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("No endpoints configured for service '{0}'")]
    NoEndpoints(ServiceKind),

    #[error("Invalid config value for {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Failure of a single transport operation against one endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    #[error("Authentication as '{user}' on {endpoint} rejected")]
    Auth { endpoint: String, user: String },

    #[error("Transfer of {path} failed: {message}")]
    Transfer { path: String, message: String },

    #[error("Remote path not found: {0}")]
    NotFound(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("Session already closed")]
    Closed,
}

impl TransportError {
    pub fn transfer(path: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transfer {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Timeouts are handled exactly like connection failures.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Timeout { .. })
    }
}

/// Outcome of driving a job across the endpoint list.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("All {} endpoint(s) for '{service}' failed", .attempts.len())]
    Exhausted {
        service: ServiceKind,
        attempts: Vec<AttemptRecord>,
    },
}

impl DeliveryError {
    /// Ordered failure records, empty for configuration errors.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::Exhausted { attempts, .. } => attempts,
            Self::Config(_) => &[],
        }
    }
}
