//! ManifestComparator against a fake release host

use proxreport_common::config::{EndpointSet, UpdateConfig};
use proxreport_common::hashing::sha256_bytes;
use proxreport_common::transport::memory::{Failure, MemoryRemote};
use proxreport_common::{DeliveryChannel, EndpointResolver, ManifestComparator, UpdateDecision};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn comparator(remote: &MemoryRemote, install: &TempDir) -> ManifestComparator {
    let set = EndpointSet {
        host: "releases".to_string(),
        username: "proxmox".to_string(),
        password: "secret".to_string(),
        fallback_port: None,
        ..EndpointSet::default()
    };
    let channel = DeliveryChannel::new(
        EndpointResolver::new(set),
        Arc::new(remote.connector()),
        Duration::from_secs(5),
    );
    let update = UpdateConfig {
        install_dir: install.path().to_path_buf(),
        remote_root: "/release".to_string(),
        ..UpdateConfig::default()
    };
    ManifestComparator::new(channel, &update)
}

fn publish(remote: &MemoryRemote, files: &[(&str, &str)]) {
    let entries: Vec<String> = files
        .iter()
        .map(|(path, body)| format!("\"{}\":\"{}\"", path, sha256_bytes(body.as_bytes())))
        .collect();
    remote.put(
        "/release/manifest.json",
        format!("{{\"version\":\"3.2.0\",\"files\":{{{}}}}}", entries.join(",")),
    );
}

#[tokio::test]
async fn test_check_reports_only_differing_files() {
    let install = TempDir::new().unwrap();
    std::fs::write(install.path().join("proxmox_core.py"), "same").unwrap();
    std::fs::write(install.path().join("proxmox_report.py"), "old").unwrap();

    let remote = MemoryRemote::new();
    publish(&remote, &[("proxmox_core.py", "same"), ("proxmox_report.py", "new")]);

    match comparator(&remote, &install).check(install.path()).await {
        UpdateDecision::UpdateAvailable(files) => {
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].path, "proxmox_report.py");
            assert_eq!(files[0].remote_hash, sha256_bytes(b"new"));
        }
        other => panic!("unexpected decision: {:?}", other),
    }
}

#[tokio::test]
async fn test_check_no_change() {
    let install = TempDir::new().unwrap();
    std::fs::write(install.path().join("a.py"), "same").unwrap();
    let remote = MemoryRemote::new();
    publish(&remote, &[("a.py", "same")]);

    assert_eq!(
        comparator(&remote, &install).check(install.path()).await,
        UpdateDecision::NoChange
    );
}

#[tokio::test]
async fn test_unreachable_host_is_manifest_unavailable() {
    let install = TempDir::new().unwrap();
    let remote = MemoryRemote::new();
    publish(&remote, &[("a.py", "x")]);
    remote.fail("releases:11122", Failure::Unreachable);

    assert_eq!(
        comparator(&remote, &install).check(install.path()).await,
        UpdateDecision::ManifestUnavailable
    );
}

#[tokio::test]
async fn test_garbage_manifest_is_unavailable() {
    let install = TempDir::new().unwrap();
    let remote = MemoryRemote::new();
    remote.put("/release/manifest.json", "<html>502 Bad Gateway</html>");

    assert_eq!(
        comparator(&remote, &install).check(install.path()).await,
        UpdateDecision::ManifestUnavailable
    );
}
