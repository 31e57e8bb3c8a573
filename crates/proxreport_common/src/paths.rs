//! Path helpers for the reporting agent

use std::path::{Path, PathBuf};

/// System config file consulted when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/proxreport/config.toml";

/// Where the agent scripts and binaries are installed
pub const DEFAULT_INSTALL_DIR: &str = "/opt/proxreport";

/// Directory (inside the install dir) holding staging and snapshots
pub const STATE_DIR_NAME: &str = ".proxreport";

/// Staging area for downloaded update files
pub fn staging_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("staging")
}

/// Root of the installation snapshots
pub fn snapshots_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("snapshots")
}

/// Scratch area for downloaded documents (manifest, remote defaults)
pub fn downloads_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("downloads")
}

/// Join two remote (always `/`-separated) path fragments
pub fn remote_join(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Parent directory of a remote path, `None` for top-level entries
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("/home/proxmox/", "/a.csv"), "/home/proxmox/a.csv");
        assert_eq!(remote_join("", "a.csv"), "/a.csv");
        assert_eq!(remote_join("uploads", "a.csv"), "uploads/a.csv");
    }

    #[test]
    fn test_remote_parent() {
        assert_eq!(remote_parent("/home/proxmox/a.csv"), Some("/home/proxmox"));
        assert_eq!(remote_parent("/a.csv"), None);
        assert_eq!(remote_parent("a.csv"), None);
        assert_eq!(remote_parent("dir/a.csv"), Some("dir"));
    }

    #[test]
    fn test_state_layout() {
        let state = PathBuf::from("/opt/proxreport/.proxreport");
        assert_eq!(staging_dir(&state), state.join("staging"));
        assert_eq!(snapshots_dir(&state), state.join("snapshots"));
    }
}
