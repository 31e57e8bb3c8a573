//! Agent configuration
//!
//! Config file: /etc/proxreport/config.toml (or `--config <path>`).
//! The typed view drives the agent; the raw table is kept for the
//! remote overlay merge, which works field by field.

use crate::error::ConfigError;
use crate::paths::{DEFAULT_INSTALL_DIR, STATE_DIR_NAME};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Client identity, used to name uploaded artifacts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub codcli: String,

    #[serde(default)]
    pub nomecliente: String,

    /// Distinguishes several hosts of the same client
    #[serde(default)]
    pub server_identifier: Option<String>,
}

/// One primary host plus its fallbacks
#[derive(Clone, Serialize, Deserialize)]
pub struct EndpointSet {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Second port tried on the primary host
    #[serde(default = "default_fallback_port")]
    pub fallback_port: Option<u16>,

    /// Secondary host, tried on the primary port
    #[serde(default)]
    pub fallback_host: Option<String>,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub fallback_username: Option<String>,

    #[serde(default)]
    pub fallback_password: Option<String>,
}

impl std::fmt::Debug for EndpointSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointSet")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("fallback_port", &self.fallback_port)
            .field("fallback_host", &self.fallback_host)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Default for EndpointSet {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            fallback_port: default_fallback_port(),
            fallback_host: None,
            username: String::new(),
            password: String::new(),
            fallback_username: None,
            fallback_password: None,
        }
    }
}

fn default_port() -> u16 {
    11122
}

fn default_fallback_port() -> Option<u16> {
    Some(22)
}

/// Shared SFTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub endpoints: EndpointSet,

    /// Remote directory receiving this client's artifacts
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Bound on connect and on each metadata call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Bound on one whole file upload or download
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoints: EndpointSet::default(),
            base_path: default_base_path(),
            timeout_secs: default_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_base_path() -> String {
    "/home/proxmox/uploads".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_transfer_timeout_secs() -> u64 {
    1800
}

/// Per-service endpoint overrides; unset services use `[sftp]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub uploads: Option<EndpointSet>,

    #[serde(default)]
    pub updates: Option<EndpointSet>,

    #[serde(default)]
    pub config_defaults: Option<EndpointSet>,
}

/// Self-update settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Staging + snapshots; must live on the install filesystem
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Remote directory holding the manifest and a `files/` tree
    #[serde(default = "default_remote_root")]
    pub remote_root: String,

    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,

    #[serde(default = "default_keep_snapshots")]
    pub keep_snapshots: usize,

    /// Optional post-apply check (program + args), run in the install dir
    #[serde(default)]
    pub health_command: Vec<String>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
            state_dir: None,
            remote_root: default_remote_root(),
            manifest_name: default_manifest_name(),
            keep_snapshots: default_keep_snapshots(),
            health_command: Vec::new(),
        }
    }
}

impl UpdateConfig {
    pub fn effective_state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.install_dir.join(STATE_DIR_NAME))
    }
}

fn default_install_dir() -> PathBuf {
    PathBuf::from(DEFAULT_INSTALL_DIR)
}

fn default_remote_root() -> String {
    "/home/proxmox/proxreport/release".to_string()
}

fn default_manifest_name() -> String {
    "manifest.json".to_string()
}

fn default_keep_snapshots() -> usize {
    5
}

/// Centrally managed configuration defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_overlay_path")]
    pub remote_path: String,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remote_path: default_overlay_path(),
        }
    }
}

fn default_overlay_path() -> String {
    "/home/proxmox/config/proxreporter_defaults.toml".to_string()
}

/// Artifact upload behaviour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Also compare the remote SHA-256 after upload, not only the size
    #[serde(default)]
    pub confirm_hash: bool,
}

/// An artifact produced by the external report renderer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub kind: String,
    pub extension: String,
}

impl ArtifactSpec {
    fn new(kind: &str, extension: &str) -> Self {
        Self {
            kind: kind.to_string(),
            extension: extension.to_string(),
        }
    }
}

/// External extraction/rendering hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Command (program + args) that renders the artifacts; empty means
    /// the artifacts are produced by someone else before the run
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_artifacts")]
    pub artifacts: Vec<ArtifactSpec>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            output_dir: default_output_dir(),
            artifacts: default_artifacts(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/var/log/proxreporter")
}

fn default_artifacts() -> Vec<ArtifactSpec> {
    vec![
        ArtifactSpec::new("vms", "csv"),
        ArtifactSpec::new("hosts", "csv"),
        ArtifactSpec::new("storage", "csv"),
        ArtifactSpec::new("network", "csv"),
        ArtifactSpec::new("backup", "tar.gz"),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Main agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub sftp: SftpConfig,

    #[serde(default)]
    pub services: ServicesConfig,

    #[serde(default)]
    pub update: UpdateConfig,

    #[serde(default)]
    pub overlay: OverlayConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub report: ReportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Build the typed view from a parsed document
    pub fn from_table(table: &toml::Table) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::Value::Table(table.clone())
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: "<document>".to_string(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sftp.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sftp.timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.sftp.transfer_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sftp.transfer_timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.update.keep_snapshots == 0 {
            return Err(ConfigError::Invalid {
                field: "update.keep_snapshots".to_string(),
                message: "at least one snapshot must be retained".to_string(),
            });
        }
        if self.update.manifest_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "update.manifest_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// A config document as read from disk
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub table: toml::Table,
    pub config: AgentConfig,
}

impl ConfigFile {
    /// Load and validate the config at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(path, &contents)
    }

    pub fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config = AgentConfig::from_table(&table).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            table,
            config,
        })
    }

    /// Swap in a new document (after an overlay merge)
    pub fn replace_table(&mut self, table: toml::Table) -> Result<(), ConfigError> {
        self.config = AgentConfig::from_table(&table)?;
        self.table = table;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[client]
codcli = "C042"
nomecliente = "Acme Srl"

[sftp]
host = "sftp.example.net"
username = "proxmox"
password = "secret"
fallback_host = "192.168.20.14"

[update]
install_dir = "/opt/proxreport"
keep_snapshots = 3

[syslog]
host = "old"
"#;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.sftp.endpoints.port, 11122);
        assert_eq!(config.sftp.endpoints.fallback_port, Some(22));
        assert_eq!(config.update.keep_snapshots, 5);
        assert_eq!(config.report.artifacts.len(), 5);
        assert!(config.overlay.enabled);
    }

    #[test]
    fn test_parse_sample() {
        let file = ConfigFile::parse(Path::new("config.toml"), SAMPLE).unwrap();
        assert_eq!(file.config.client.codcli, "C042");
        assert_eq!(file.config.sftp.endpoints.host, "sftp.example.net");
        assert_eq!(file.config.sftp.endpoints.port, 11122);
        assert_eq!(file.config.update.keep_snapshots, 3);
        assert_eq!(
            file.config.update.effective_state_dir(),
            PathBuf::from("/opt/proxreport/.proxreport")
        );
        // Unknown sections stay in the raw table for the overlay
        assert!(file.table.contains_key("syslog"));
    }

    #[test]
    fn test_transfer_timeout_separate_from_call_timeout() {
        let config = AgentConfig::default();
        assert_eq!(config.sftp.timeout_secs, 30);
        assert_eq!(config.sftp.transfer_timeout_secs, 1800);

        let doc = "[sftp]\nhost = \"h\"\ntimeout_secs = 10\ntransfer_timeout_secs = 7200\n";
        let file = ConfigFile::parse(Path::new("c.toml"), doc).unwrap();
        assert_eq!(file.config.sftp.timeout_secs, 10);
        assert_eq!(file.config.sftp.transfer_timeout_secs, 7200);

        let err = ConfigFile::parse(Path::new("c.toml"), "[sftp]\ntransfer_timeout_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_zero_snapshots_rejected() {
        let doc = "[update]\nkeep_snapshots = 0\n";
        let err = ConfigFile::parse(Path::new("c.toml"), doc).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_malformed_toml_reports_path() {
        let err = ConfigFile::parse(Path::new("/etc/proxreport/config.toml"), "[sftp\n").unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, "/etc/proxreport/config.toml"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        let file = ConfigFile::parse(Path::new("config.toml"), SAMPLE).unwrap();
        let rendered = format!("{:?}", file.config.sftp);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
