//! Remote file-transfer seam
//!
//! A `Connector` opens one authenticated `TransportSession` per endpoint.
//! Sessions are reused for every operation of a job and closed by the
//! delivery channel on every exit path.

pub mod memory;
pub mod sftp;

use crate::endpoint::Endpoint;
use crate::error::TransportError;
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

pub use memory::{MemoryConnector, MemoryRemote};
pub use sftp::SftpConnector;

/// Remote file metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
}

/// Opens sessions; one implementation per wire protocol
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate. Fails with `Connect` or `Auth`.
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// One live, authenticated connection to exactly one endpoint
#[async_trait]
pub trait TransportSession: Send {
    fn endpoint(&self) -> &Endpoint;

    /// Upload a local file, creating missing remote parents and
    /// overwriting any existing remote file. Returns bytes written.
    async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, TransportError>;

    /// Download a remote file to `local`. Returns bytes read.
    async fn download(&mut self, remote: &str, local: &Path) -> Result<u64, TransportError>;

    async fn stat(&mut self, remote: &str) -> Result<RemoteStat, TransportError>;

    /// SHA-256 of the remote file's content
    async fn remote_hash(&mut self, remote: &str) -> Result<String, TransportError>;

    /// Idempotent
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Run a transport future under the per-call bound
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            operation: operation.to_string(),
            secs: limit.as_secs(),
        }),
    }
}

/// Bounds every operation of a session. Whole-file transfers get their
/// own, longer bound; metadata calls and close use the per-call one.
pub struct TimedSession {
    inner: Box<dyn TransportSession>,
    limit: Duration,
    transfer_limit: Duration,
}

impl TimedSession {
    pub fn new(inner: Box<dyn TransportSession>, limit: Duration, transfer_limit: Duration) -> Self {
        Self {
            inner,
            limit,
            transfer_limit,
        }
    }
}

#[async_trait]
impl TransportSession for TimedSession {
    fn endpoint(&self) -> &Endpoint {
        self.inner.endpoint()
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, TransportError> {
        with_timeout("upload", self.transfer_limit, self.inner.upload(local, remote)).await
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<u64, TransportError> {
        with_timeout("download", self.transfer_limit, self.inner.download(remote, local)).await
    }

    async fn stat(&mut self, remote: &str) -> Result<RemoteStat, TransportError> {
        with_timeout("stat", self.limit, self.inner.stat(remote)).await
    }

    async fn remote_hash(&mut self, remote: &str) -> Result<String, TransportError> {
        with_timeout("remote_hash", self.limit, self.inner.remote_hash(remote)).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        with_timeout("close", self.limit, self.inner.close()).await
    }
}
