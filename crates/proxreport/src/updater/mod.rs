//! Self-update of the installed agent files
//!
//! Guarantees:
//! 1. Change detection by SHA-256 content only
//! 2. Every changed file is staged and verified before the install is touched
//! 3. A complete snapshot exists before the first file is replaced
//! 4. Files are replaced by rename, never copied over in place
//! 5. A failed apply is rolled back to the exact previous content
//!
//! No phase marker is persisted: after a crash the next check re-derives
//! what is left to do from the hashes alone.

pub mod agent;
pub mod fsops;
pub mod health;
pub mod snapshot;
pub mod stage;
pub mod state;

pub use agent::{
    install_mode, install_staged, verify_installed, UpdateAgent, UpdateOutcome, UpdateReport,
};
pub use health::{CommandHealthCheck, HealthCheck};
pub use snapshot::{SnapshotEntry, SnapshotMeta, SnapshotStore};
pub use stage::{stage_files, StageJob, StagedFile};
pub use state::{PhaseTrail, UpdatePhase};
