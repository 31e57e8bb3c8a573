//! One reporting run
//!
//! update -> config overlay -> report command -> upload. A successful
//! update ends the run early with a restart request; every other update
//! or overlay failure is logged and the run carries on.

use crate::alerts::{Alert, AlertSink};
use crate::error::RunError;
use crate::extract::run_report_command;
use crate::lock::RunLock;
use crate::overlay::{ConfigOverlayMerger, SyncOutcome};
use crate::relaunch::Relauncher;
use crate::updater::{CommandHealthCheck, HealthCheck, UpdateAgent, UpdateOutcome, UpdateReport};
use crate::upload::upload_artifacts;
use proxreport_common::config::ConfigFile;
use proxreport_common::{AgentConfig, Connector, DeliveryChannel, EndpointResolver, ServiceKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub attempt_update: bool,
    /// Set on the relaunched process; suppresses the update phase
    pub skip_update: bool,
    pub upload: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            attempt_update: false,
            skip_update: false,
            upload: true,
        }
    }
}

/// What each phase of a completed run did
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub update: Option<UpdateReport>,
    pub overlay: Option<SyncOutcome>,
    pub uploaded: Vec<String>,
    pub upload_endpoint: Option<String>,
    pub rollback_failed: bool,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Update applied; the caller must relaunch with `skip_update`
    Restart(UpdateReport),
    Completed(RunReport),
}

pub struct RunController {
    file: ConfigFile,
    connector: Arc<dyn Connector>,
    alerts: Arc<dyn AlertSink>,
    health: Option<Arc<dyn HealthCheck>>,
}

impl RunController {
    pub fn new(file: ConfigFile, connector: Arc<dyn Connector>, alerts: Arc<dyn AlertSink>) -> Self {
        let health = CommandHealthCheck::from_argv(&file.config.update.health_command)
            .map(|check| Arc::new(check) as Arc<dyn HealthCheck>);
        Self {
            file,
            connector,
            alerts,
            health,
        }
    }

    pub fn with_health_check(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.file.config
    }

    fn channel(&self) -> DeliveryChannel {
        let config = &self.file.config;
        DeliveryChannel::new(
            EndpointResolver::from_config(config),
            self.connector.clone(),
            Duration::from_secs(config.sftp.timeout_secs),
        )
        .with_transfer_timeout(Duration::from_secs(config.sftp.transfer_timeout_secs))
    }

    /// Fail on missing endpoints before any network traffic
    fn preflight(&self, options: &RunOptions) -> Result<(), RunError> {
        let config = &self.file.config;
        let resolver = EndpointResolver::from_config(config);
        if options.attempt_update && !options.skip_update {
            resolver.resolve(ServiceKind::Updates)?;
        }
        if config.overlay.enabled {
            resolver.resolve(ServiceKind::ConfigDefaults)?;
        }
        if options.upload && config.sftp.enabled {
            resolver.resolve(ServiceKind::Uploads)?;
        }
        Ok(())
    }

    pub async fn run(&mut self, options: RunOptions) -> Result<RunOutcome, RunError> {
        let _lock = RunLock::acquire(&self.file.config.update.effective_state_dir())?;
        self.preflight(&options)?;
        let mut report = RunReport::default();

        if options.skip_update {
            info!("Update check skipped (post-update run)");
        } else if options.attempt_update {
            let update = self.update().await;
            match &update.outcome {
                UpdateOutcome::Applied { .. } => return Ok(RunOutcome::Restart(update)),
                UpdateOutcome::RolledBack { reason, .. } => {
                    self.alerts.raise(Alert::warning(
                        "update_rolled_back",
                        format!("Update rolled back: {}", reason),
                    ));
                }
                UpdateOutcome::RollbackFailed { reason } => {
                    report.rollback_failed = true;
                    self.alerts.raise(Alert::critical(
                        "rollback_failed",
                        format!("Rollback failed, installation integrity uncertain: {}", reason),
                    ));
                }
                UpdateOutcome::Abandoned { reason } => warn!("Update abandoned: {}", reason),
                UpdateOutcome::NoChange | UpdateOutcome::Unavailable => {}
            }
            report.update = Some(update);
        }

        if self.file.config.overlay.enabled {
            let merger = ConfigOverlayMerger::new(self.channel(), &self.file.config);
            match merger.sync(&mut self.file).await {
                Ok(outcome) => report.overlay = Some(outcome),
                Err(e) => warn!("Config overlay not applied: {}", e),
            }
        }

        run_report_command(&self.file.config.report).await?;

        if options.upload && self.file.config.sftp.enabled {
            match upload_artifacts(&self.channel(), &self.file.config).await {
                Ok(result) => {
                    report.uploaded = result.output;
                    report.upload_endpoint = Some(result.endpoint.address());
                }
                Err(e) => {
                    self.alerts
                        .raise(Alert::critical("upload_failed", e.to_string()));
                    return Err(e);
                }
            }
        } else {
            info!("Artifact upload disabled for this run");
        }

        Ok(RunOutcome::Completed(report))
    }

    async fn update(&self) -> UpdateReport {
        let mut agent = UpdateAgent::new(self.channel(), &self.file.config.update);
        if let Some(health) = &self.health {
            agent = agent.with_health_check(health.clone());
        }
        agent.run().await
    }
}

/// Run once and, after an applied update, relaunch exactly once. If the
/// relaunch itself fails the second pass runs in-process.
pub async fn supervise(
    controller: &mut RunController,
    options: RunOptions,
    relauncher: &dyn Relauncher,
) -> Result<RunReport, RunError> {
    match controller.run(options).await? {
        RunOutcome::Completed(report) => Ok(report),
        RunOutcome::Restart(update) => {
            info!("Update applied ({} phases), relaunching", update.trail.phases().len());
            let err = relauncher.relaunch();
            warn!("Relaunch failed ({}), continuing in-process", err);

            let second = RunOptions {
                skip_update: true,
                ..options
            };
            match controller.run(second).await? {
                RunOutcome::Completed(report) => Ok(report),
                RunOutcome::Restart(_) => Err(RunError::RelaunchLoop),
            }
        }
    }
}
