//! Transaction envelopes and verified transactions.
//!
//! An envelope is what the platform hands out: a JSON payload plus a detached signature.
//! Nothing in the payload is trusted until [crate::verify::SignatureVerifier] has checked the
//! signature; only then does it become a [VerifiedTransaction].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Signed, not-yet-trusted transaction as delivered by the event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEnvelope {
    /// JSON text of [TransactionClaims].
    pub payload: String,
    /// Hex-encoded 64-byte secp256k1 signature (r || s) over keccak256(payload).
    pub signature: String,
}

impl TransactionEnvelope {
    pub fn new(payload: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            signature: signature.into(),
        }
    }

    /// Best-effort peek at the unverified `originalId`, for log context only.
    pub fn claimed_original_id(&self) -> Option<u64> {
        let v: Value = serde_json::from_str(&self.payload).ok()?;
        v.get("originalId").and_then(|n| n.as_u64())
    }
}

/// Fields carried in an envelope payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionClaims {
    /// Stable across renewals of the same subscription entry.
    pub original_id: u64,
    pub product_id: String,
    pub purchase_date: DateTime<Utc>,
}

/// A transaction whose envelope signature has been checked.
///
/// Only [crate::verify::SignatureVerifier] constructs these outside of tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTransaction {
    pub original_id: u64,
    pub product_id: String,
    pub purchase_date: DateTime<Utc>,
}

impl VerifiedTransaction {
    pub(crate) fn from_claims(claims: TransactionClaims) -> Self {
        Self {
            original_id: claims.original_id,
            product_id: claims.product_id,
            purchase_date: claims.purchase_date,
        }
    }
}
