//! Monitor, source, and reporter configuration.

use serde::Deserialize;
use std::time::Duration;

/// Transaction monitor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Period between snapshot polls of unfinished transactions.
    pub poll_interval_ms: u64,
    /// Backoff used when the live update stream ends and must be reopened.
    pub reconnection: ReconnectionConfig,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            reconnection: ReconnectionConfig::default(),
        }
    }
}

/// Reconnection backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl ReconnectionConfig {
    /// Backoff before the given (zero-based) retry: doubles from `initial_backoff_secs`,
    /// capped at `max_backoff_secs`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let secs = self
            .initial_backoff_secs
            .saturating_mul(factor)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}

/// Remote event source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// HTTP base URL for the unfinished-transaction snapshot and acknowledgements.
    pub http_url: String,
    /// WebSocket URL for live transaction updates.
    pub ws_url: String,
    /// Hex-encoded SEC1 secp256k1 public key that signs transaction envelopes.
    pub signer_public_key: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
}

/// HTTP reporter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReporterConfig {
    /// Base URL of the accounting endpoint (`{base_url}/payments`).
    pub base_url: String,
    /// Developer key sent with every report.
    pub developer_key: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}
