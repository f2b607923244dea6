//! The platform purchase feed, as seen by the monitor.

use crate::transaction::{TransactionEnvelope, VerifiedTransaction};
use crate::verify::VerificationError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid source configuration: {0}")]
    Config(String),
}

/// Two complementary feeds of signed envelopes plus the verify/acknowledge operations.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Finite snapshot of transactions the platform still considers unfinished.
    /// Safe to call repeatedly.
    async fn current_entitlements(&self) -> Result<Vec<TransactionEnvelope>, SourceError>;

    /// Live stream of new and renewed transactions. May never end; if it does, callers
    /// reopen it by calling `updates()` again.
    fn updates(&self) -> BoxStream<'static, TransactionEnvelope>;

    fn verify(
        &self,
        envelope: &TransactionEnvelope,
    ) -> Result<VerifiedTransaction, VerificationError>;

    /// Marks the transaction finished so it drops out of `current_entitlements()`. Idempotent.
    async fn acknowledge(&self, tx: &VerifiedTransaction) -> Result<(), SourceError>;
}
