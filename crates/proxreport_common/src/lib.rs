//! Proxreport Common - shared plumbing for the reporting agent
//!
//! Configuration, endpoint ranking, the remote transfer seam, ordered
//! endpoint fallback, content hashing and the update manifest.

pub mod artifact;
pub mod config;
pub mod delivery;
pub mod endpoint;
pub mod error;
pub mod hashing;
pub mod logging;
pub mod manifest;
pub mod paths;
pub mod transport;

pub use artifact::{artifact_file_name, Artifact};
pub use config::AgentConfig;
pub use delivery::{AttemptRecord, DeliveryChannel, DeliveryJob, FetchJob, JobResult, UploadJob};
pub use endpoint::{Credentials, Endpoint, EndpointResolver, EndpointRole, ServiceKind};
pub use error::{ConfigError, DeliveryError, TransportError};
pub use manifest::{ManagedFile, Manifest, ManifestComparator, UpdateDecision};
pub use transport::{Connector, TransportSession};
