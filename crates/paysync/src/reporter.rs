//! Reporter: sends verified purchases to the remote accounting endpoint.
//!
//! The monitor only cares whether a report succeeded; [ReporterError] keeps the finer
//! classification for logs. [HttpReporter] posts JSON to `{base_url}/payments`.

use crate::config::ReporterConfig;
use crate::identity::IdentityStore;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Acknowledgement from the accounting endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PaymentReceipt {
    pub payment_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("no registered user")]
    NotRegistered,
    #[error("payment already recorded by server")]
    Duplicate,
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("payment rejected: {0}")]
    Rejected(String),
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid reporter configuration: {0}")]
    Config(String),
}

impl ReporterError {
    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ReporterError::NotRegistered => "not_registered",
            ReporterError::Duplicate => "duplicate",
            ReporterError::Server { .. } => "server",
            ReporterError::Rejected(_) => "rejected",
            ReporterError::Network(_) => "network",
            ReporterError::Decode(_) => "decode",
            ReporterError::Config(_) => "config",
        }
    }
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report_payment(
        &self,
        product_id: &str,
        transaction_id: u64,
    ) -> Result<PaymentReceipt, ReporterError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequest<'a> {
    user_identifier: &'a str,
    product_id: &'a str,
    ios_transaction_id: String,
    developer_key: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentResponse {
    success: bool,
    #[serde(default)]
    payment_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Builder for [HttpReporter].
pub struct HttpReporterBuilder {
    base_url: Option<String>,
    developer_key: Option<String>,
    identity: Option<IdentityStore>,
    request_timeout: Duration,
}

impl HttpReporterBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            developer_key: None,
            identity: None,
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn developer_key(mut self, key: impl Into<String>) -> Self {
        self.developer_key = Some(key.into());
        self
    }

    /// Where the `userIdentifier` for each report is read from.
    pub fn identity(mut self, identity: IdentityStore) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<HttpReporter, ReporterError> {
        let base_url = self
            .base_url
            .ok_or_else(|| ReporterError::Config("base_url required".into()))?;
        let developer_key = self
            .developer_key
            .ok_or_else(|| ReporterError::Config("developer_key required".into()))?;
        let identity = self
            .identity
            .ok_or_else(|| ReporterError::Config("identity required".into()))?;
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| ReporterError::Config(e.to_string()))?;
        Ok(HttpReporter {
            client,
            payments_url: format!("{}/payments", base_url.trim_end_matches('/')),
            developer_key,
            identity,
        })
    }
}

impl Default for HttpReporterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reports payments over HTTP on behalf of the registered user.
pub struct HttpReporter {
    client: reqwest::Client,
    payments_url: String,
    developer_key: String,
    identity: IdentityStore,
}

impl HttpReporter {
    pub fn from_config(
        config: &ReporterConfig,
        identity: IdentityStore,
    ) -> Result<Self, ReporterError> {
        HttpReporterBuilder::new()
            .base_url(&config.base_url)
            .developer_key(&config.developer_key)
            .identity(identity)
            .request_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
    }
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn report_payment(
        &self,
        product_id: &str,
        transaction_id: u64,
    ) -> Result<PaymentReceipt, ReporterError> {
        let user_identifier = self.identity.get().ok_or(ReporterError::NotRegistered)?;
        let body = PaymentRequest {
            user_identifier: &user_identifier,
            product_id,
            ios_transaction_id: transaction_id.to_string(),
            developer_key: &self.developer_key,
        };
        let resp = self
            .client
            .post(&self.payments_url)
            .json(&body)
            .send()
            .await
            .map_err(ReporterError::Network)?;
        let status = resp.status();
        if status == StatusCode::CONFLICT {
            return Err(ReporterError::Duplicate);
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ReporterError::Server {
                status: status.as_u16(),
                message,
            });
        }
        let bytes = resp.bytes().await.map_err(ReporterError::Network)?;
        let parsed: PaymentResponse =
            serde_json::from_slice(&bytes).map_err(|e| ReporterError::Decode(e.to_string()))?;
        if !parsed.success {
            return Err(ReporterError::Rejected(parsed.message.unwrap_or_default()));
        }
        Ok(PaymentReceipt {
            payment_id: parsed.payment_id,
        })
    }
}
