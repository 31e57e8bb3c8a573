//! Endpoint ranking for the remote services
//!
//! Pure and deterministic: the same config always yields the same ordered
//! list, built once per run.

use crate::config::{AgentConfig, EndpointSet};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical remote services the agent talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Artifact collection point
    Uploads,
    /// Release manifest and managed files
    Updates,
    /// Centrally curated configuration defaults
    ConfigDefaults,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Uploads => "uploads",
            ServiceKind::Updates => "updates",
            ServiceKind::ConfigDefaults => "config_defaults",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Primary,
    Fallback,
}

/// Username/password pair; the password never shows up in `Debug`
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub role: EndpointRole,
}

impl Endpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ranks candidate endpoints for each service
#[derive(Debug, Clone)]
pub struct EndpointResolver {
    shared: EndpointSet,
    uploads: Option<EndpointSet>,
    updates: Option<EndpointSet>,
    config_defaults: Option<EndpointSet>,
}

impl EndpointResolver {
    pub fn new(shared: EndpointSet) -> Self {
        Self {
            shared,
            uploads: None,
            updates: None,
            config_defaults: None,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            shared: config.sftp.endpoints.clone(),
            uploads: config.services.uploads.clone(),
            updates: config.services.updates.clone(),
            config_defaults: config.services.config_defaults.clone(),
        }
    }

    /// Give one service its own endpoint set
    pub fn with_override(mut self, service: ServiceKind, set: EndpointSet) -> Self {
        match service {
            ServiceKind::Uploads => self.uploads = Some(set),
            ServiceKind::Updates => self.updates = Some(set),
            ServiceKind::ConfigDefaults => self.config_defaults = Some(set),
        }
        self
    }

    /// Ordered candidates: primary host:port, primary host on the fallback
    /// port, then the fallback host on the primary port.
    pub fn resolve(&self, service: ServiceKind) -> Result<Vec<Endpoint>, ConfigError> {
        let set = match service {
            ServiceKind::Uploads => self.uploads.as_ref(),
            ServiceKind::Updates => self.updates.as_ref(),
            ServiceKind::ConfigDefaults => self.config_defaults.as_ref(),
        }
        .unwrap_or(&self.shared);

        let primary_creds = Credentials::new(set.username.clone(), set.password.clone());
        let fallback_creds = Credentials::new(
            set.fallback_username
                .clone()
                .unwrap_or_else(|| set.username.clone()),
            set.fallback_password
                .clone()
                .unwrap_or_else(|| set.password.clone()),
        );

        let mut candidates = vec![Endpoint {
            host: set.host.trim().to_string(),
            port: set.port,
            credentials: primary_creds.clone(),
            role: EndpointRole::Primary,
        }];

        if let Some(port) = set.fallback_port {
            candidates.push(Endpoint {
                host: set.host.trim().to_string(),
                port,
                credentials: primary_creds,
                role: EndpointRole::Fallback,
            });
        }

        if let Some(host) = &set.fallback_host {
            candidates.push(Endpoint {
                host: host.trim().to_string(),
                port: set.port,
                credentials: fallback_creds,
                role: EndpointRole::Fallback,
            });
        }

        let mut endpoints: Vec<Endpoint> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.host.is_empty() {
                continue;
            }
            let duplicate = endpoints
                .iter()
                .any(|e| e.host == candidate.host && e.port == candidate.port);
            if !duplicate {
                endpoints.push(candidate);
            }
        }

        if endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints(service));
        }

        Ok(endpoints)
    }
}
