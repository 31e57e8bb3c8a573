//! SSH-backed transport
//!
//! Transfers go over SCP channels, metadata and directory creation over
//! the SFTP subsystem, and the remote digest through `sha256sum`.

use super::{Connector, RemoteStat, TransportSession};
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::hashing::{is_valid_sha256, normalize_hash};
use crate::paths::remote_parent;
use async_ssh2_lite::{AsyncSession, AsyncSftp, SessionConfiguration};
use async_trait::async_trait;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct SftpConnector;

impl SftpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for SftpConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn TransportSession>, TransportError> {
        let address = endpoint.address();
        let connect_err = |message: String| TransportError::Connect {
            endpoint: address.clone(),
            message,
        };

        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        let mut session = AsyncSession::new(tcp, SessionConfiguration::new())
            .map_err(|e| connect_err(e.to_string()))?;
        session
            .handshake()
            .await
            .map_err(|e| connect_err(format!("handshake: {}", e)))?;

        let user = &endpoint.credentials.username;
        if let Err(e) = session
            .userauth_password(user, endpoint.credentials.password())
            .await
        {
            debug!("Password auth as {} on {} failed: {}", user, address, e);
            return Err(TransportError::Auth {
                endpoint: address,
                user: user.clone(),
            });
        }

        debug!("SSH session established with {}", address);
        Ok(Box::new(SftpSession {
            endpoint: endpoint.clone(),
            session: Some(session),
        }))
    }
}

struct SftpSession {
    endpoint: Endpoint,
    session: Option<AsyncSession<TcpStream>>,
}

impl SftpSession {
    fn live(&mut self) -> Result<&mut AsyncSession<TcpStream>, TransportError> {
        self.session.as_mut().ok_or(TransportError::Closed)
    }

    /// `mkdir -p` over SFTP; existing directories are fine
    async fn ensure_remote_dirs(&mut self, remote: &str) -> Result<(), TransportError> {
        let mut missing = Vec::new();
        let mut current = remote_parent(remote);
        while let Some(dir) = current {
            missing.push(dir.to_string());
            current = remote_parent(dir);
        }
        if missing.is_empty() {
            return Ok(());
        }

        let session = self.live()?;
        let sftp = session
            .sftp()
            .await
            .map_err(|e| TransportError::transfer(remote, format!("sftp subsystem: {}", e)))?;

        for dir in missing.iter().rev() {
            if sftp.stat(Path::new(dir)).await.is_ok() {
                continue;
            }
            if let Err(e) = sftp.mkdir(Path::new(dir), 0o755).await {
                // Lost a race with another uploader, or a real failure
                if sftp.stat(Path::new(dir)).await.is_err() {
                    return Err(TransportError::transfer(dir.as_str(), format!("mkdir: {}", e)));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransportSession for SftpSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, TransportError> {
        self.ensure_remote_dirs(remote).await?;

        let size = fs::metadata(local)
            .await
            .map_err(|e| TransportError::transfer(local.display().to_string(), e))?
            .len();
        let mut local_file = fs::File::open(local)
            .await
            .map_err(|e| TransportError::transfer(local.display().to_string(), e))?;

        let session = self.live()?;
        let mut channel = session
            .scp_send(Path::new(remote), 0o644, size, None)
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;

        let written = tokio::io::copy(&mut local_file, &mut channel)
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;

        channel
            .send_eof()
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        channel
            .wait_eof()
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        channel
            .close()
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        channel
            .wait_close()
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;

        Ok(written)
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<u64, TransportError> {
        // Distinguish "absent" from a broken channel
        self.stat(remote).await?;

        let session = self.live()?;
        let (mut channel, _stat) = session
            .scp_recv(Path::new(remote))
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;

        let mut local_file = fs::File::create(local)
            .await
            .map_err(|e| TransportError::transfer(local.display().to_string(), e))?;
        let read = tokio::io::copy(&mut channel, &mut local_file)
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        local_file
            .sync_all()
            .await
            .map_err(|e| TransportError::transfer(local.display().to_string(), e))?;

        channel
            .send_eof()
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        channel
            .wait_eof()
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        channel
            .close()
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        channel
            .wait_close()
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;

        Ok(read)
    }

    async fn stat(&mut self, remote: &str) -> Result<RemoteStat, TransportError> {
        let session = self.live()?;
        let sftp = session
            .sftp()
            .await
            .map_err(|e| TransportError::transfer(remote, format!("sftp subsystem: {}", e)))?;
        match sftp.stat(Path::new(remote)).await {
            Ok(stat) => Ok(RemoteStat {
                size: stat.size.unwrap_or(0),
            }),
            Err(e) => {
                let absent = provably_absent(&sftp, remote).await;
                Err(stat_failure(remote, absent, e))
            }
        }
    }

    async fn remote_hash(&mut self, remote: &str) -> Result<String, TransportError> {
        let session = self.live()?;
        let mut channel = session
            .channel_session()
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        channel
            .exec(&format!("LC_ALL=C sha256sum -- {} 2>&1", shell_quote(remote)))
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;

        let mut buf = Vec::new();
        channel
            .read_to_end(&mut buf)
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        if let Err(e) = channel.wait_close().await {
            debug!("Closing digest channel on {} failed: {}", self.endpoint, e);
        }
        let status = channel
            .exit_status()
            .map_err(|e| TransportError::transfer(remote, format!("sha256sum status: {}", e)))?;

        digest_from_output(remote, status, &buf)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(session) = self.session.take() {
            if let Err(e) = session
                .disconnect(None, "Disconnected by client", None)
                .await
            {
                warn!("Disconnect from {} failed: {}", self.endpoint, e);
            }
        }
        Ok(())
    }
}

/// True only when a readable ancestor directory does not list the path
async fn provably_absent(sftp: &AsyncSftp<TcpStream>, remote: &str) -> bool {
    let mut child = remote;
    while let Some(parent) = remote_parent(child) {
        match sftp.readdir(Path::new(parent)).await {
            Ok(entries) => {
                let name = Path::new(child).file_name();
                return !entries.iter().any(|(path, _)| path.file_name() == name);
            }
            Err(_) => child = parent,
        }
    }
    false
}

fn stat_failure(remote: &str, absent: bool, cause: impl std::fmt::Display) -> TransportError {
    if absent {
        TransportError::NotFound(remote.to_string())
    } else {
        TransportError::transfer(remote, format!("stat: {}", cause))
    }
}

/// Interpret `sha256sum` output (stderr folded into stdout)
fn digest_from_output(remote: &str, status: i32, output: &[u8]) -> Result<String, TransportError> {
    let output = String::from_utf8_lossy(output);
    if status != 0 {
        if output.contains("No such file or directory") {
            return Err(TransportError::NotFound(remote.to_string()));
        }
        return Err(TransportError::transfer(
            remote,
            format!("sha256sum exited with {}: {}", status, output.trim()),
        ));
    }
    match output.split_whitespace().next() {
        Some(hash) if is_valid_sha256(hash) => Ok(normalize_hash(hash)),
        _ => Err(TransportError::transfer(
            remote,
            format!("unexpected sha256sum output: {}", output.trim()),
        )),
    }
}

/// Single-quote a path for a POSIX shell
fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/home/proxmox/a.csv"), "'/home/proxmox/a.csv'");
        assert_eq!(shell_quote("/x/it's"), r"'/x/it'\''s'");
    }

    #[test]
    fn test_stat_failure_only_absent_is_not_found() {
        assert_eq!(
            stat_failure("/rel/a.py", true, "no such file"),
            TransportError::NotFound("/rel/a.py".to_string())
        );
        assert!(matches!(
            stat_failure("/rel/a.py", false, "permission denied"),
            TransportError::Transfer { .. }
        ));
    }

    #[test]
    fn test_digest_from_output() {
        let hash = "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855";
        let ok = format!("{}  /up/a.csv\n", hash);
        assert_eq!(
            digest_from_output("/up/a.csv", 0, ok.as_bytes()).unwrap(),
            hash.to_ascii_lowercase()
        );

        let missing = b"sha256sum: /up/a.csv: No such file or directory\n";
        assert_eq!(
            digest_from_output("/up/a.csv", 1, missing).unwrap_err(),
            TransportError::NotFound("/up/a.csv".to_string())
        );

        let denied = b"sha256sum: /up/a.csv: Permission denied\n";
        assert!(matches!(
            digest_from_output("/up/a.csv", 1, denied).unwrap_err(),
            TransportError::Transfer { .. }
        ));
        assert!(matches!(
            digest_from_output("/up/a.csv", 127, b"sh: sha256sum: not found\n").unwrap_err(),
            TransportError::Transfer { .. }
        ));
        assert!(matches!(
            digest_from_output("/up/a.csv", 0, b"garbage").unwrap_err(),
            TransportError::Transfer { .. }
        ));
    }

    #[tokio::test]
    async fn test_refused_connect_is_connect_error() {
        use crate::endpoint::{Credentials, EndpointRole};

        // Grab a free port, then release it so nothing listens there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port,
            credentials: Credentials::new("proxmox", "secret"),
            role: EndpointRole::Primary,
        };
        let err = SftpConnector::new().open(&endpoint).await.err().unwrap();
        assert!(err.is_connectivity());
    }
}
