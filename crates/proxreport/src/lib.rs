//! Proxreport - node-local reporting agent
//!
//! Self-update with snapshot rollback, remote config overlay, report
//! rendering and artifact upload, driven once per invocation.

pub mod alerts;
pub mod controller;
pub mod error;
pub mod extract;
pub mod lock;
pub mod overlay;
pub mod relaunch;
pub mod updater;
pub mod upload;

pub use alerts::{Alert, AlertSink, CollectingAlerts, Severity, TracingAlerts};
pub use controller::{supervise, RunController, RunOptions, RunOutcome, RunReport};
pub use error::{LockError, OverlayError, RunError, UpdateError};
pub use lock::RunLock;
pub use overlay::{ConfigOverlayMerger, FieldSchema, FieldTag, SyncOutcome};
pub use relaunch::{ExecRelauncher, Relauncher};
pub use updater::{UpdateAgent, UpdateOutcome, UpdatePhase, UpdateReport};
