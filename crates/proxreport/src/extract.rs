//! External report rendering
//!
//! Inventory extraction and CSV rendering are done by a separate program.
//! It is run before collection and must leave its files in the output dir.

use crate::error::RunError;
use proxreport_common::config::ReportConfig;
use tokio::process::Command;
use tracing::{debug, info};

/// Run `report.command` if one is configured
pub async fn run_report_command(report: &ReportConfig) -> Result<(), RunError> {
    let (program, args) = match report.command.split_first() {
        Some(parts) => parts,
        None => {
            debug!("No report command configured, collecting existing artifacts");
            return Ok(());
        }
    };

    tokio::fs::create_dir_all(&report.output_dir)
        .await
        .map_err(|e| RunError::Io {
            context: format!("Creating {}", report.output_dir.display()),
            source: e,
        })?;

    info!("Running report command {}", program);
    let output = Command::new(program)
        .args(args)
        .env("PROXREPORT_OUTPUT_DIR", &report.output_dir)
        .output()
        .await
        .map_err(|e| RunError::Extraction(format!("cannot start {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(RunError::Extraction(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn report(command: &[&str], dir: &TempDir) -> ReportConfig {
        ReportConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            output_dir: dir.path().join("out"),
            ..ReportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_no_command_is_noop() {
        let dir = TempDir::new().unwrap();
        run_report_command(&report(&[], &dir)).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_sees_output_dir() {
        let dir = TempDir::new().unwrap();
        let cfg = report(&["sh", "-c", "echo x > \"$PROXREPORT_OUTPUT_DIR/marker\""], &dir);
        run_report_command(&cfg).await.unwrap();
        assert!(dir.path().join("out/marker").exists());
    }

    #[tokio::test]
    async fn test_failing_command_is_extraction_error() {
        let dir = TempDir::new().unwrap();
        let err = run_report_command(&report(&["false"], &dir)).await.unwrap_err();
        assert!(matches!(err, RunError::Extraction(_)));
    }
}
