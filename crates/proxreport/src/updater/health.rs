//! Post-apply health check

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Decides whether a freshly applied install is usable
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, install_dir: &Path) -> Result<(), String>;
}

/// Runs a configured command in the install dir; exit 0 means healthy
#[derive(Debug, Clone)]
pub struct CommandHealthCheck {
    argv: Vec<String>,
}

impl CommandHealthCheck {
    /// `None` for an empty command line
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        if argv.is_empty() {
            None
        } else {
            Some(Self {
                argv: argv.to_vec(),
            })
        }
    }
}

#[async_trait]
impl HealthCheck for CommandHealthCheck {
    async fn check(&self, install_dir: &Path) -> Result<(), String> {
        let (program, args) = match self.argv.split_first() {
            Some(parts) => parts,
            None => return Ok(()),
        };
        debug!("Running health check {}", program);

        let output = Command::new(program)
            .args(args)
            .current_dir(install_dir)
            .output()
            .await
            .map_err(|e| format!("cannot run {}: {}", program, e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_command_means_no_check() {
        assert!(CommandHealthCheck::from_argv(&[]).is_none());
    }

    #[tokio::test]
    async fn test_exit_status_decides() {
        let dir = TempDir::new().unwrap();
        let ok = CommandHealthCheck::from_argv(&["true".to_string()]).unwrap();
        assert!(ok.check(dir.path()).await.is_ok());

        let bad = CommandHealthCheck::from_argv(&["false".to_string()]).unwrap();
        assert!(bad.check(dir.path()).await.is_err());
    }
}
