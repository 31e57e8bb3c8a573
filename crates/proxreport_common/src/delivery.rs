//! Resilient delivery across the ranked endpoint list
//!
//! A job is attempted on one endpoint at a time, in resolver order. The
//! first endpoint on which the whole job succeeds wins; every failure is
//! recorded and the channel moves on. Sessions are closed on every path.

use crate::endpoint::{Endpoint, EndpointResolver, ServiceKind};
use crate::error::{DeliveryError, TransportError};
use crate::transport::{with_timeout, Connector, TimedSession, TransportSession};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One failed attempt on one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub endpoint: String,
    pub error: TransportError,
}

/// What the channel reports once a job has completed somewhere
#[derive(Debug, Clone)]
pub struct JobResult<T> {
    /// Endpoint that completed the job
    pub endpoint: Endpoint,
    pub succeeded: bool,
    /// Failures on the endpoints tried before it
    pub attempts: Vec<AttemptRecord>,
    pub output: T,
}

/// A unit of remote work. Must be safe to re-run from the start on a
/// different endpoint after a partial failure.
#[async_trait]
pub trait DeliveryJob: Send + Sync {
    type Output: Send;

    /// Short label for logs
    fn describe(&self) -> String;

    async fn run(&self, session: &mut dyn TransportSession) -> Result<Self::Output, TransportError>;
}

/// Bound on a single upload or download unless configured otherwise
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Drives jobs over the endpoints of a service
#[derive(Clone)]
pub struct DeliveryChannel {
    resolver: EndpointResolver,
    connector: Arc<dyn Connector>,
    timeout: Duration,
    transfer_timeout: Duration,
}

impl DeliveryChannel {
    /// `timeout` bounds connect, stat, digest and close
    pub fn new(resolver: EndpointResolver, connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self {
            resolver,
            connector,
            timeout,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }

    pub fn with_transfer_timeout(mut self, transfer_timeout: Duration) -> Self {
        self.transfer_timeout = transfer_timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transfer_timeout(&self) -> Duration {
        self.transfer_timeout
    }

    /// Run `job` against `service`'s endpoints until one succeeds
    pub async fn deliver<J: DeliveryJob>(
        &self,
        service: ServiceKind,
        job: &J,
    ) -> Result<JobResult<J::Output>, DeliveryError> {
        let endpoints = self.resolver.resolve(service)?;
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for endpoint in endpoints {
            debug!("{}: trying {} ({:?})", job.describe(), endpoint, endpoint.role);

            match self.attempt(&endpoint, job).await {
                Ok(output) => {
                    if attempts.is_empty() {
                        debug!("{} done on {}", job.describe(), endpoint);
                    } else {
                        info!(
                            "{} done on {} after {} failed attempt(s)",
                            job.describe(),
                            endpoint,
                            attempts.len()
                        );
                    }
                    return Ok(JobResult {
                        endpoint,
                        succeeded: true,
                        attempts,
                        output,
                    });
                }
                Err(error) => {
                    warn!("{} failed on {}: {}", job.describe(), endpoint, error);
                    attempts.push(AttemptRecord {
                        endpoint: endpoint.address(),
                        error,
                    });
                }
            }
        }

        Err(DeliveryError::Exhausted { service, attempts })
    }

    async fn attempt<J: DeliveryJob>(
        &self,
        endpoint: &Endpoint,
        job: &J,
    ) -> Result<J::Output, TransportError> {
        let raw = with_timeout("connect", self.timeout, self.connector.open(endpoint)).await?;
        let mut session = TimedSession::new(raw, self.timeout, self.transfer_timeout);

        let result = job.run(&mut session).await;

        if let Err(e) = session.close().await {
            debug!("Closing session to {} failed: {}", endpoint, e);
        }
        result
    }
}

/// Download one remote file to a local path
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub remote: String,
    pub local: PathBuf,
}

impl FetchJob {
    pub fn new(remote: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        Self {
            remote: remote.into(),
            local: local.into(),
        }
    }
}

#[async_trait]
impl DeliveryJob for FetchJob {
    type Output = u64;

    fn describe(&self) -> String {
        format!("fetch {}", self.remote)
    }

    async fn run(&self, session: &mut dyn TransportSession) -> Result<u64, TransportError> {
        session.download(&self.remote, &self.local).await
    }
}

/// One file to push and how to confirm it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub local: PathBuf,
    pub remote: String,
    pub size: u64,
    /// Checked against the remote digest when present
    pub sha256: Option<String>,
}

/// Upload a batch of files; the batch succeeds only if every file is
/// confirmed on the same endpoint
#[derive(Debug, Clone, Default)]
pub struct UploadJob {
    pub items: Vec<UploadItem>,
}

#[async_trait]
impl DeliveryJob for UploadJob {
    type Output = Vec<String>;

    fn describe(&self) -> String {
        format!("upload of {} artifact(s)", self.items.len())
    }

    async fn run(&self, session: &mut dyn TransportSession) -> Result<Vec<String>, TransportError> {
        let mut confirmed = Vec::with_capacity(self.items.len());

        for item in &self.items {
            session.upload(&item.local, &item.remote).await?;

            let stat = session.stat(&item.remote).await?;
            if stat.size != item.size {
                return Err(TransportError::transfer(
                    item.remote.as_str(),
                    format!("size mismatch: local {} remote {}", item.size, stat.size),
                ));
            }

            if let Some(expected) = &item.sha256 {
                let actual = session.remote_hash(&item.remote).await?;
                if &actual != expected {
                    return Err(TransportError::transfer(
                        item.remote.as_str(),
                        "remote digest does not match",
                    ));
                }
            }

            debug!("Confirmed {} ({} bytes)", item.remote, item.size);
            confirmed.push(item.remote.clone());
        }

        Ok(confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointSet;
    use crate::transport::memory::{Failure, MemoryRemote};
    use tempfile::TempDir;

    fn channel(remote: &MemoryRemote) -> DeliveryChannel {
        let set = EndpointSet {
            host: "primary".to_string(),
            fallback_host: Some("backup".to_string()),
            username: "proxmox".to_string(),
            password: "secret".to_string(),
            ..EndpointSet::default()
        };
        DeliveryChannel::new(
            EndpointResolver::new(set),
            Arc::new(remote.connector()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_fetch_on_first_endpoint() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        remote.put("/rel/manifest.json", "{}");

        let job = FetchJob::new("/rel/manifest.json", dir.path().join("m.json"));
        let result = channel(&remote).deliver(ServiceKind::Updates, &job).await.unwrap();

        assert_eq!(result.endpoint.address(), "primary:11122");
        assert!(result.succeeded);
        assert!(result.attempts.is_empty());
        assert_eq!(result.output, 2);
        assert_eq!(remote.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_transfer_failure_moves_to_next_endpoint() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        remote.put("/f", "data");
        remote.fail("primary:11122", Failure::FailTransfers);

        let job = FetchJob::new("/f", dir.path().join("f"));
        let result = channel(&remote).deliver(ServiceKind::Updates, &job).await.unwrap();

        assert_eq!(result.endpoint.address(), "primary:22");
        assert_eq!(result.attempts.len(), 1);
        assert!(matches!(result.attempts[0].error, TransportError::Transfer { .. }));
        // Session on the failing endpoint was still closed
        assert_eq!(remote.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_upload_size_confirmation() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("vms.csv");
        std::fs::write(&local, "a;b;c\n").unwrap();

        let remote = MemoryRemote::new();
        let job = UploadJob {
            items: vec![UploadItem {
                local: local.clone(),
                remote: "/up/vms.csv".to_string(),
                size: 6,
                sha256: Some(crate::hashing::sha256_bytes(b"a;b;c\n")),
            }],
        };
        let result = channel(&remote).deliver(ServiceKind::Uploads, &job).await.unwrap();
        assert_eq!(result.output, vec!["/up/vms.csv".to_string()]);

        // A stale size expectation never confirms
        let stale = UploadJob {
            items: vec![UploadItem {
                size: 99,
                sha256: None,
                ..job.items[0].clone()
            }],
        };
        let err = channel(&remote)
            .deliver(ServiceKind::Uploads, &stale)
            .await
            .unwrap_err();
        assert_eq!(err.attempts().len(), 3);
    }
}
