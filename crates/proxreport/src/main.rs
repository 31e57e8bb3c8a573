//! Proxreport - report, self-update and upload for one hypervisor node

use anyhow::{Context, Result};
use clap::Parser;
use proxreport::{supervise, ExecRelauncher, RunController, RunOptions, TracingAlerts};
use proxreport_common::config::ConfigFile;
use proxreport_common::logging;
use proxreport_common::paths::DEFAULT_CONFIG_PATH;
use proxreport_common::transport::SftpConnector;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "proxreport")]
#[command(about = "Proxmox inventory reporting agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the agent config
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Check for and apply an update before reporting
    #[arg(long)]
    update: bool,

    /// Never update in this run (set on relaunch)
    #[arg(long)]
    skip_update: bool,

    /// Render the report but do not upload it
    #[arg(long)]
    no_upload: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

const EXIT_FAILURE: u8 = 1;
const EXIT_ROLLBACK_FAILED: u8 = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            // Logging may not be up yet if the config was unreadable
            eprintln!("proxreport: {:#}", e);
            error!("{:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let file = ConfigFile::load(&cli.config)
        .with_context(|| format!("Loading {}", cli.config.display()))?;
    logging::init(&file.config.logging.level, cli.verbose)?;
    info!("proxreport {} starting", env!("CARGO_PKG_VERSION"));

    let options = RunOptions {
        attempt_update: cli.update,
        skip_update: cli.skip_update,
        upload: !cli.no_upload,
    };
    let relauncher = ExecRelauncher::from_current_process().context("Resolving current executable")?;
    let mut controller = RunController::new(file, Arc::new(SftpConnector::new()), Arc::new(TracingAlerts));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Starting runtime")?;
    let report = runtime.block_on(supervise(&mut controller, options, &relauncher))?;

    if !report.uploaded.is_empty() {
        info!(
            "Run complete: {} artifact(s) via {}",
            report.uploaded.len(),
            report.upload_endpoint.as_deref().unwrap_or("-")
        );
    }
    if report.rollback_failed {
        return Ok(EXIT_ROLLBACK_FAILED);
    }
    Ok(0)
}
