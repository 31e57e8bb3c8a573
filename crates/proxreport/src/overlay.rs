//! Centrally managed configuration overlay
//!
//! The collection host publishes a TOML document of defaults. Fields the
//! schema marks remote-managed take the remote value; everything else keeps
//! the local value. The merge is per `section.key`: a remote value replaces
//! the local one whole, nested tables included.

use crate::error::OverlayError;
use crate::updater::fsops;
use proxreport_common::config::ConfigFile;
use proxreport_common::paths::downloads_dir;
use proxreport_common::{AgentConfig, DeliveryChannel, FetchJob, ServiceKind};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTag {
    LocalOnly,
    RemoteManaged,
}

/// Field ownership. Exact `section.key` rules beat `section.*` rules;
/// anything unmatched is local-only.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    fields: Vec<(String, FieldTag)>,
    sections: Vec<(String, FieldTag)>,
}

impl FieldSchema {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Ownership used by the reporting fleet
    pub fn reporter_defaults() -> Self {
        let mut schema = Self::empty();
        for section in ["syslog", "alerts", "hardware_monitoring", "hardware_thresholds", "pve_monitor"] {
            schema = schema.section(section, FieldTag::RemoteManaged);
        }
        for key in ["host", "port", "user", "password", "sender", "recipients", "use_tls", "use_ssl"] {
            schema = schema.field(&format!("smtp.{}", key), FieldTag::RemoteManaged);
        }
        schema
    }

    pub fn section(mut self, section: &str, tag: FieldTag) -> Self {
        self.sections.push((section.to_string(), tag));
        self
    }

    pub fn field(mut self, field: &str, tag: FieldTag) -> Self {
        self.fields.push((field.to_string(), tag));
        self
    }

    /// Tag of `section.key`; top-level keys use an empty section
    pub fn tag_of(&self, section: &str, key: &str) -> FieldTag {
        let full = if section.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", section, key)
        };
        if let Some((_, tag)) = self.fields.iter().find(|(f, _)| *f == full) {
            return *tag;
        }
        if let Some((_, tag)) = self.sections.iter().find(|(s, _)| s == section) {
            return *tag;
        }
        FieldTag::LocalOnly
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub table: toml::Table,
    /// `section.key` of every field whose value changed
    pub changed: Vec<String>,
}

/// Pure field-level merge of `remote` onto `local`
pub fn merge(local: &toml::Table, remote: &toml::Table, schema: &FieldSchema) -> MergeResult {
    let mut table = local.clone();
    let mut changed = Vec::new();

    for (name, remote_value) in remote {
        match remote_value {
            toml::Value::Table(remote_section) => {
                let mut updates = Vec::new();
                for (key, value) in remote_section {
                    if schema.tag_of(name, key) != FieldTag::RemoteManaged {
                        debug!("Ignoring remote value for local-only {}.{}", name, key);
                        continue;
                    }
                    let current = table.get(name).and_then(|section| section.get(key.as_str()));
                    if current != Some(value) {
                        updates.push((key, value));
                    }
                }
                if updates.is_empty() {
                    continue;
                }

                // A missing (or non-table) local section becomes a fresh table
                let mut section = match table.remove(name) {
                    Some(toml::Value::Table(section)) => section,
                    _ => toml::Table::new(),
                };
                for (key, value) in updates {
                    section.insert(key.clone(), value.clone());
                    changed.push(format!("{}.{}", name, key));
                }
                table.insert(name.clone(), toml::Value::Table(section));
            }
            value => {
                if schema.tag_of("", name) == FieldTag::RemoteManaged && table.get(name) != Some(value) {
                    table.insert(name.clone(), value.clone());
                    changed.push(name.clone());
                }
            }
        }
    }

    MergeResult { table, changed }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Remote defaults could not be fetched or parsed
    Unavailable,
    Unchanged,
    Updated { fields: Vec<String> },
}

/// Fetches the remote defaults and persists the merged document
pub struct ConfigOverlayMerger {
    channel: DeliveryChannel,
    remote_path: String,
    downloads: PathBuf,
    schema: FieldSchema,
}

impl ConfigOverlayMerger {
    pub fn new(channel: DeliveryChannel, config: &AgentConfig) -> Self {
        Self {
            channel,
            remote_path: config.overlay.remote_path.clone(),
            downloads: downloads_dir(&config.update.effective_state_dir()),
            schema: FieldSchema::reporter_defaults(),
        }
    }

    pub fn with_schema(mut self, schema: FieldSchema) -> Self {
        self.schema = schema;
        self
    }

    async fn fetch_remote(&self) -> Option<toml::Table> {
        if let Err(e) = fs::create_dir_all(&self.downloads).await {
            warn!("Cannot create {}: {}", self.downloads.display(), e);
            return None;
        }
        let local = self.downloads.join("remote_defaults.toml");
        let job = FetchJob::new(self.remote_path.clone(), local.clone());

        if let Err(e) = self.channel.deliver(ServiceKind::ConfigDefaults, &job).await {
            warn!("Remote config defaults unavailable: {}", e);
            return None;
        }
        let contents = fs::read_to_string(&local).await;
        let _ = fs::remove_file(&local).await;

        match contents.map(|c| toml::from_str::<toml::Table>(&c)) {
            Ok(Ok(table)) => Some(table),
            Ok(Err(e)) => {
                warn!("Ignoring malformed remote defaults: {}", e);
                None
            }
            Err(e) => {
                warn!("Cannot read downloaded defaults: {}", e);
                None
            }
        }
    }

    /// Merge the remote defaults into `file` and persist if anything changed
    pub async fn sync(&self, file: &mut ConfigFile) -> Result<SyncOutcome, OverlayError> {
        let remote = match self.fetch_remote().await {
            Some(remote) => remote,
            None => return Ok(SyncOutcome::Unavailable),
        };

        let merged = merge(&file.table, &remote, &self.schema);
        if merged.changed.is_empty() {
            debug!("Remote defaults already applied");
            return Ok(SyncOutcome::Unchanged);
        }

        // Validate before anything hits the disk
        AgentConfig::from_table(&merged.table)?;
        persist(&file.path, &merged.table).await?;
        file.replace_table(merged.table)?;

        info!("Config updated from remote defaults: {}", merged.changed.join(", "));
        Ok(SyncOutcome::Updated {
            fields: merged.changed,
        })
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Keep the old file as `<name>.bak`, then swap in the new one (0600)
async fn persist(path: &Path, table: &toml::Table) -> Result<(), OverlayError> {
    let rendered =
        toml::to_string_pretty(table).map_err(|e| OverlayError::Serialize(e.to_string()))?;
    let persist_err = |source| OverlayError::Persist {
        path: path.to_path_buf(),
        source,
    };

    // The backup holds credentials; it must never exist with a looser mode
    match fs::read(path).await {
        Ok(previous) => fsops::write_atomic(&backup_path(path), &previous, 0o600)
            .await
            .map_err(persist_err)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(persist_err(e)),
    }
    fsops::write_atomic(path, rendered.as_bytes(), 0o600)
        .await
        .map_err(persist_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(doc: &str) -> toml::Table {
        toml::from_str(doc).unwrap()
    }

    #[test]
    fn test_local_only_kept_remote_managed_replaced() {
        let local = table("[sftp]\npassword = \"secret\"\n[syslog]\nhost = \"old\"\n");
        let remote = table("[sftp]\npassword = \"leaked\"\n[syslog]\nhost = \"new\"\n");

        let result = merge(&local, &remote, &FieldSchema::reporter_defaults());
        assert_eq!(result.table["sftp"]["password"].as_str(), Some("secret"));
        assert_eq!(result.table["syslog"]["host"].as_str(), Some("new"));
        assert_eq!(result.changed, vec!["syslog.host".to_string()]);
    }

    #[test]
    fn test_absent_remote_field_keeps_local() {
        let local = table("[syslog]\nhost = \"h\"\nport = 514\n");
        let remote = table("[syslog]\nport = 1514\n");
        let result = merge(&local, &remote, &FieldSchema::reporter_defaults());
        assert_eq!(result.table["syslog"]["host"].as_str(), Some("h"));
        assert_eq!(result.table["syslog"]["port"].as_integer(), Some(1514));
    }

    #[test]
    fn test_smtp_only_central_fields() {
        let local = table("[smtp]\nenabled = false\nhost = \"a\"\n");
        let remote = table("[smtp]\nenabled = true\nhost = \"mail.example.net\"\nrecipients = \"ops@example.net\"\n");
        let result = merge(&local, &remote, &FieldSchema::reporter_defaults());
        assert_eq!(result.table["smtp"]["enabled"].as_bool(), Some(false));
        assert_eq!(result.table["smtp"]["host"].as_str(), Some("mail.example.net"));
        assert_eq!(result.table["smtp"]["recipients"].as_str(), Some("ops@example.net"));
    }

    #[test]
    fn test_remote_section_created_for_managed_fields_only() {
        let local = table("[client]\ncodcli = \"C1\"\n");
        let remote = table("[pve_monitor]\nenabled = true\n[mystery]\nx = 1\n");
        let result = merge(&local, &remote, &FieldSchema::reporter_defaults());
        assert_eq!(result.table["pve_monitor"]["enabled"].as_bool(), Some(true));
        assert!(!result.table.contains_key("mystery"));
    }

    #[test]
    fn test_nested_value_replaced_whole() {
        let local = table("[hardware_thresholds]\ncpu = { warn = 80, crit = 95 }\n");
        let remote = table("[hardware_thresholds]\ncpu = { warn = 70 }\n");
        let result = merge(&local, &remote, &FieldSchema::reporter_defaults());
        let cpu = result.table["hardware_thresholds"]["cpu"].as_table().unwrap();
        assert_eq!(cpu.len(), 1);
        assert_eq!(cpu["warn"].as_integer(), Some(70));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let local = table("[syslog]\nhost = \"old\"\n");
        let remote = table("[syslog]\nhost = \"new\"\n");
        let schema = FieldSchema::reporter_defaults();
        let once = merge(&local, &remote, &schema);
        let twice = merge(&once.table, &remote, &schema);
        assert_eq!(once.table, twice.table);
        assert!(twice.changed.is_empty());
    }

    #[test]
    fn test_exact_field_rule_beats_section_rule() {
        let schema = FieldSchema::empty()
            .section("syslog", FieldTag::RemoteManaged)
            .field("syslog.app_name", FieldTag::LocalOnly);
        assert_eq!(schema.tag_of("syslog", "host"), FieldTag::RemoteManaged);
        assert_eq!(schema.tag_of("syslog", "app_name"), FieldTag::LocalOnly);
        assert_eq!(schema.tag_of("sftp", "host"), FieldTag::LocalOnly);
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/etc/proxreport/config.toml")),
            PathBuf::from("/etc/proxreport/config.toml.bak")
        );
    }

    #[tokio::test]
    async fn test_persist_backup_never_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sftp]\npassword = \"secret\"\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        persist(&path, &table("[sftp]\npassword = \"rotated\"\n"))
            .await
            .unwrap();

        let backup = backup_path(&path);
        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&backup), 0o600);
        assert_eq!(mode(&path), 0o600);
        assert!(std::fs::read_to_string(&backup).unwrap().contains("secret"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("rotated"));
    }

    #[tokio::test]
    async fn test_persist_without_previous_file_skips_backup() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        persist(&path, &table("[syslog]\nhost = \"h\"\n")).await.unwrap();
        assert!(path.exists());
        assert!(!backup_path(&path).exists());
    }
}
