//! Alert seam
//!
//! Delivery of alerts (syslog, e-mail) lives outside this crate; the run
//! only decides when something is worth raising.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    /// Stable identifier, e.g. `update_rolled_back`
    pub kind: String,
    pub message: String,
}

impl Alert {
    pub fn warning(kind: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn critical(kind: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Emits alerts as log events for the syslog forwarder to pick up
#[derive(Debug, Default)]
pub struct TracingAlerts;

impl AlertSink for TracingAlerts {
    fn raise(&self, alert: Alert) {
        match alert.severity {
            Severity::Critical => error!(alert = %alert.kind, "{}", alert.message),
            Severity::Warning => warn!(alert = %alert.kind, "{}", alert.message),
        }
    }
}

/// Keeps alerts in memory
#[derive(Debug, Default)]
pub struct CollectingAlerts {
    raised: Mutex<Vec<Alert>>,
}

impl CollectingAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raised(&self) -> Vec<Alert> {
        self.raised
            .lock()
            .map(|alerts| alerts.clone())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.raised().into_iter().map(|a| a.kind).collect()
    }
}

impl AlertSink for CollectingAlerts {
    fn raise(&self, alert: Alert) {
        if let Ok(mut raised) = self.raised.lock() {
            raised.push(alert);
        }
    }
}
