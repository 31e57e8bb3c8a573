//! In-process remote store
//!
//! Behaves like an SFTP server keyed by path, with per-endpoint failure
//! injection. Lets the delivery, update and overlay logic run end to end
//! without a network.

use super::{Connector, RemoteStat, TransportSession};
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::hashing::sha256_bytes;
use crate::paths::remote_parent;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How an endpoint misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// TCP connect refused
    Unreachable,
    /// Credentials rejected
    RejectAuth,
    /// Connects fine, every transfer fails
    FailTransfers,
    /// Connect never answers (exercises timeouts)
    Hang,
    /// Uploads and downloads take this long before completing
    SlowTransfers(Duration),
}

#[derive(Debug, Default)]
struct RemoteState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    failures: HashMap<String, Failure>,
    truncated: HashMap<String, usize>,
    open_sessions: usize,
    max_open_sessions: usize,
    connect_log: Vec<String>,
    upload_log: Vec<(String, String)>,
}

/// Shared handle to the fake server
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            remote: self.clone(),
        }
    }

    pub fn put(&self, path: &str, data: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        register_parents(&mut state.dirs, path);
        state.files.insert(path.to_string(), data.into());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn remove(&self, path: &str) {
        self.lock().files.remove(path);
    }

    pub fn file_count(&self) -> usize {
        self.lock().files.len()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(path)
    }

    /// Make `address` ("host:port") misbehave from now on
    pub fn fail(&self, address: &str, failure: Failure) {
        self.lock().failures.insert(address.to_string(), failure);
    }

    pub fn heal(&self, address: &str) {
        self.lock().failures.remove(address);
    }

    /// Serve only the first `len` bytes of `path` on download
    pub fn truncate_downloads(&self, path: &str, len: usize) {
        self.lock().truncated.insert(path.to_string(), len);
    }

    /// Addresses in the order sessions were requested
    pub fn connect_log(&self) -> Vec<String> {
        self.lock().connect_log.clone()
    }

    /// (address, remote path) of every successful upload
    pub fn upload_log(&self) -> Vec<(String, String)> {
        self.lock().upload_log.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    pub fn max_concurrent_sessions(&self) -> usize {
        self.lock().max_open_sessions
    }

    fn failure_for(&self, address: &str) -> Option<Failure> {
        self.lock().failures.get(address).copied()
    }
}

fn register_parents(dirs: &mut BTreeSet<String>, path: &str) {
    let mut current = remote_parent(path);
    while let Some(dir) = current {
        dirs.insert(dir.to_string());
        current = remote_parent(dir);
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    remote: MemoryRemote,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn TransportSession>, TransportError> {
        let address = endpoint.address();
        self.remote.lock().connect_log.push(address.clone());

        match self.remote.failure_for(&address) {
            Some(Failure::Unreachable) => {
                return Err(TransportError::Connect {
                    endpoint: address,
                    message: "connection refused".to_string(),
                })
            }
            Some(Failure::RejectAuth) => {
                return Err(TransportError::Auth {
                    endpoint: address,
                    user: endpoint.credentials.username.clone(),
                })
            }
            Some(Failure::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Err(TransportError::Connect {
                    endpoint: address,
                    message: "no answer".to_string(),
                });
            }
            Some(Failure::FailTransfers) | Some(Failure::SlowTransfers(_)) | None => {}
        }

        {
            let mut state = self.remote.lock();
            state.open_sessions += 1;
            state.max_open_sessions = state.max_open_sessions.max(state.open_sessions);
        }

        Ok(Box::new(MemorySession {
            endpoint: endpoint.clone(),
            remote: self.remote.clone(),
            closed: false,
        }))
    }
}

struct MemorySession {
    endpoint: Endpoint,
    remote: MemoryRemote,
    closed: bool,
}

impl MemorySession {
    fn check_usable(&self, path: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.remote.failure_for(&self.endpoint.address()) == Some(Failure::FailTransfers) {
            return Err(TransportError::transfer(path, "channel reset by peer"));
        }
        Ok(())
    }

    async fn transfer_delay(&self) {
        if let Some(Failure::SlowTransfers(delay)) = self.remote.failure_for(&self.endpoint.address()) {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, TransportError> {
        self.check_usable(remote)?;
        self.transfer_delay().await;
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| TransportError::transfer(local.display().to_string(), e))?;
        let size = data.len() as u64;

        let mut state = self.remote.lock();
        register_parents(&mut state.dirs, remote);
        state.files.insert(remote.to_string(), data);
        state
            .upload_log
            .push((self.endpoint.address(), remote.to_string()));
        Ok(size)
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<u64, TransportError> {
        self.check_usable(remote)?;
        self.transfer_delay().await;
        let data = {
            let state = self.remote.lock();
            let data = state
                .files
                .get(remote)
                .ok_or_else(|| TransportError::NotFound(remote.to_string()))?;
            match state.truncated.get(remote) {
                Some(&len) => data[..len.min(data.len())].to_vec(),
                None => data.clone(),
            }
        };

        tokio::fs::write(local, &data)
            .await
            .map_err(|e| TransportError::transfer(remote, e))?;
        Ok(data.len() as u64)
    }

    async fn stat(&mut self, remote: &str) -> Result<RemoteStat, TransportError> {
        self.check_usable(remote)?;
        self.remote
            .lock()
            .files
            .get(remote)
            .map(|data| RemoteStat {
                size: data.len() as u64,
            })
            .ok_or_else(|| TransportError::NotFound(remote.to_string()))
    }

    async fn remote_hash(&mut self, remote: &str) -> Result<String, TransportError> {
        self.check_usable(remote)?;
        self.remote
            .lock()
            .files
            .get(remote)
            .map(|data| sha256_bytes(data))
            .ok_or_else(|| TransportError::NotFound(remote.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            let mut state = self.remote.lock();
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
        Ok(())
    }
}
