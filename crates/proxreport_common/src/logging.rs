//! Logging initialisation
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies, and
//! `--verbose` forces debug output.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Filter directive for this run
pub fn filter_directive(configured: &str, verbose: bool) -> String {
    if verbose {
        return "debug".to_string();
    }
    let level = configured.trim();
    if level.is_empty() {
        "info".to_string()
    } else {
        level.to_ascii_lowercase()
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(configured: &str, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(filter_directive(configured, false)))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialise logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive("WARN", false), "warn");
        assert_eq!(filter_directive("", false), "info");
        assert_eq!(filter_directive("error", true), "debug");
    }
}
