//! Monitor settings and the handle used to change them at runtime.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Configuration for the timeout scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// A job with no status update for longer than this is considered dead.
    pub timeout_threshold_minutes: u64,
    pub timeout_monitoring_enabled: bool,
    pub poll_interval_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout_threshold_minutes: 15,
            timeout_monitoring_enabled: true,
            poll_interval_seconds: 15,
        }
    }
}

impl MonitorConfig {
    pub fn threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.timeout_threshold_minutes.min(i64::MAX as u64) as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }
}

/// Cloneable handle that changes the scanner's settings while it runs.
/// Every scan pass reads the latest values.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    tx: Arc<watch::Sender<MonitorConfig>>,
}

impl MonitorHandle {
    /// Create a handle and the receiver the scanner is built with.
    pub fn new(config: MonitorConfig) -> (Self, watch::Receiver<MonitorConfig>) {
        let (tx, rx) = watch::channel(config);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn current(&self) -> MonitorConfig {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorConfig> {
        self.tx.subscribe()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.tx
            .send_modify(|config| config.timeout_monitoring_enabled = enabled);
        info!(enabled, "timeout monitoring toggled");
    }

    pub fn set_threshold_minutes(&self, minutes: u64) {
        self.tx
            .send_modify(|config| config.timeout_threshold_minutes = minutes);
        info!(minutes, "timeout threshold changed");
    }

    pub fn set_poll_interval_seconds(&self, seconds: u64) {
        self.tx
            .send_modify(|config| config.poll_interval_seconds = seconds);
        info!(seconds, "timeout poll interval changed");
    }
}
