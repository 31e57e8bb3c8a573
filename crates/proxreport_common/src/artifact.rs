//! Report artifacts and their deterministic names
//!
//! Names depend only on the client identity and the artifact kind, so a
//! repeated upload overwrites the previous copy instead of adding one.

use crate::config::ClientConfig;
use crate::paths::remote_join;
use std::path::PathBuf;

/// A rendered file ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: String,
    pub local_path: PathBuf,
    /// File name on the collection host
    pub remote_name: String,
}

impl Artifact {
    pub fn remote_path(&self, base_path: &str) -> String {
        remote_join(base_path, &self.remote_name)
    }
}

fn clean(part: &str) -> String {
    part.trim().replace([' ', '/'], "_")
}

/// `<codcli>_<nomecliente>[_<server>]_prox_<kind>.<ext>`
pub fn artifact_file_name(client: &ClientConfig, kind: &str, extension: &str) -> String {
    let mut parts = vec![clean(&client.codcli), clean(&client.nomecliente)];
    if let Some(server) = client.server_identifier.as_deref() {
        let server = clean(server);
        if !server.is_empty() {
            parts.push(server);
        }
    }
    format!("{}_prox_{}.{}", parts.join("_"), kind, extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(server: Option<&str>) -> ClientConfig {
        ClientConfig {
            codcli: "C042".to_string(),
            nomecliente: " Acme Srl ".to_string(),
            server_identifier: server.map(String::from),
        }
    }

    #[test]
    fn test_name_without_server() {
        assert_eq!(
            artifact_file_name(&client(None), "vms", "csv"),
            "C042_Acme_Srl_prox_vms.csv"
        );
    }

    #[test]
    fn test_name_with_server() {
        assert_eq!(
            artifact_file_name(&client(Some("pve node1")), "backup", "tar.gz"),
            "C042_Acme_Srl_pve_node1_prox_backup.tar.gz"
        );
        // Blank identifier behaves like none
        assert_eq!(
            artifact_file_name(&client(Some("  ")), "vms", "csv"),
            "C042_Acme_Srl_prox_vms.csv"
        );
    }

    #[test]
    fn test_remote_path() {
        let artifact = Artifact {
            kind: "vms".to_string(),
            local_path: PathBuf::from("/var/log/proxreporter/x.csv"),
            remote_name: "x.csv".to_string(),
        };
        assert_eq!(artifact.remote_path("/home/proxmox/uploads/"), "/home/proxmox/uploads/x.csv");
    }
}
