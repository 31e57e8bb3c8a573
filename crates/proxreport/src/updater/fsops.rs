//! Filesystem primitives for install-tree changes
//!
//! Every replacement of an installed file is a rename from a sibling on
//! the same filesystem, so a reader (or a crash) sees either the old or
//! the new content.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Current permission bits, `None` if the file does not exist
pub async fn file_mode(path: &Path) -> io::Result<Option<u32>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.permissions().mode() & 0o7777)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

/// Hidden sibling of `target` used as a rename source
pub fn temp_sibling(target: &Path, tag: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}.{}", name, tag, std::process::id()))
}

/// Create `path`'s parent directories
pub async fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).await,
        _ => Ok(()),
    }
}

/// Move an already-written file into place with the given mode
pub async fn rename_into_place(source: &Path, target: &Path, mode: u32) -> io::Result<()> {
    set_mode(source, mode).await?;
    ensure_parent(target).await?;
    fs::rename(source, target).await
}

/// Copy `source` next to `target`, fsync it, then rename over `target`
pub async fn replace_with_copy(source: &Path, target: &Path, mode: u32) -> io::Result<()> {
    ensure_parent(target).await?;
    let temp = temp_sibling(target, "restore");
    let result = async {
        fs::copy(source, &temp).await?;
        fs::File::open(&temp).await?.sync_all().await?;
        rename_into_place(&temp, target, mode).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp).await;
    }
    result
}

/// Write `data` to `target` through a temp file and rename
pub async fn write_atomic(target: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    ensure_parent(target).await?;
    let temp = temp_sibling(target, "tmp");
    let result = async {
        let mut file = fs::File::create(&temp).await?;
        set_mode(&temp, mode).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, target).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp).await;
    }
    result
}

/// Remove a file; already gone is fine
pub async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove a directory tree and recreate it empty
pub async fn reset_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::create_dir_all(dir).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_sets_mode() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested/config.toml");
        write_atomic(&target, b"a = 1\n", 0o600).await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"a = 1\n");
        assert_eq!(file_mode(&target).await.unwrap(), Some(0o600));
        // No temp files left behind
        assert_eq!(std::fs::read_dir(dir.path().join("nested")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_replace_with_copy_keeps_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("saved");
        let target = dir.path().join("live.py");
        std::fs::write(&source, "old").unwrap();
        std::fs::write(&target, "new").unwrap();

        replace_with_copy(&source, &target, 0o755).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "old");
        assert!(source.exists());
        assert_eq!(file_mode(&target).await.unwrap(), Some(0o755));
    }

    #[tokio::test]
    async fn test_missing_file_mode_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(file_mode(&dir.path().join("nope")).await.unwrap(), None);
        remove_if_present(&dir.path().join("nope")).await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_dir() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(staging.join("sub")).unwrap();
        std::fs::write(staging.join("sub/x"), "x").unwrap();

        reset_dir(&staging).await.unwrap();
        assert!(staging.is_dir());
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }
}
