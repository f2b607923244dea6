//! RemoteEventSource: platform purchase feed reached over HTTP and WebSocket.
//!
//! - Snapshot: `GET {http_url}/transactions/unfinished` returns a JSON array of envelopes.
//! - Acknowledge: `POST {http_url}/transactions/{originalId}/finish`.
//! - Live: every text frame on `ws_url` is one JSON envelope.
//!
//! [RemoteEventSource::run] keeps the WebSocket connected (reconnecting with backoff) and fans
//! frames out on a broadcast channel; [EventSource::updates] subscribes to it. A lagging
//! subscriber drops frames, which the snapshot poll picks up again.

use crate::config::SourceConfig;
use crate::source::{EventSource, SourceError};
use crate::transaction::{TransactionEnvelope, VerifiedTransaction};
use crate::verify::{SignatureVerifier, VerificationError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Event source backed by a remote platform bridge.
pub struct RemoteEventSource {
    config: SourceConfig,
    http_client: reqwest::Client,
    base_url: String,
    verifier: SignatureVerifier,
    update_tx: broadcast::Sender<TransactionEnvelope>,
}

impl RemoteEventSource {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let verifier = SignatureVerifier::from_hex(&config.signer_public_key)
            .map_err(|e| SourceError::Config(e.to_string()))?;
        let http_client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SourceError::Config(e.to_string()))?;
        let (update_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Ok(Self {
            base_url: config.http_url.trim_end_matches('/').to_string(),
            config,
            http_client,
            verifier,
            update_tx,
        })
    }

    /// Raw live frames, for callers that want the broadcast receiver directly.
    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEnvelope> {
        self.update_tx.subscribe()
    }

    /// Keep the live feed connected. Never returns under normal operation; call from a
    /// spawned task and abort it to stop.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let reconnection = self.config.reconnection.clone();
        let mut attempt: u32 = 0;
        loop {
            match self.run_once(&mut attempt).await {
                Ok(()) => {
                    tracing::info!("live transaction feed closed, reconnecting");
                    sleep(Duration::from_secs(reconnection.initial_backoff_secs)).await;
                }
                Err(e) => {
                    tracing::warn!(
                        reason = %e,
                        attempt,
                        "live transaction feed failed, reconnecting..."
                    );
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                    sleep(reconnection.backoff(attempt) + jitter).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn run_once(&self, attempt: &mut u32) -> Result<()> {
        let (mut ws, _) = connect_async(self.config.ws_url.as_str())
            .await
            .context("WS connect")?;
        *attempt = 0;
        tracing::info!(url = %self.config.ws_url, "live transaction feed connected");

        while let Some(msg) = ws.next().await {
            let text = match msg.context("ws read")? {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            match serde_json::from_str::<TransactionEnvelope>(&text) {
                Ok(envelope) => {
                    tracing::debug!(
                        original_id = ?envelope.claimed_original_id(),
                        "live transaction received"
                    );
                    // No subscribers is fine: the poller will see it in the next snapshot.
                    let _ = self.update_tx.send(envelope);
                }
                Err(e) => {
                    tracing::debug!(reason = %e, "undecodable live frame skipped");
                }
            }
        }
        Ok(())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SourceError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl EventSource for RemoteEventSource {
    async fn current_entitlements(&self) -> Result<Vec<TransactionEnvelope>, SourceError> {
        let url = format!("{}/transactions/unfinished", self.base_url);
        let resp = check_status(self.http_client.get(&url).send().await?).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| SourceError::Decode(e.to_string()))
    }

    fn updates(&self) -> BoxStream<'static, TransactionEnvelope> {
        let rx = self.update_tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => return Some((envelope, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "live update subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    fn verify(
        &self,
        envelope: &TransactionEnvelope,
    ) -> Result<VerifiedTransaction, VerificationError> {
        self.verifier.verify(envelope)
    }

    async fn acknowledge(&self, tx: &VerifiedTransaction) -> Result<(), SourceError> {
        let url = format!("{}/transactions/{}/finish", self.base_url, tx.original_id);
        check_status(self.http_client.post(&url).send().await?).await?;
        Ok(())
    }
}
