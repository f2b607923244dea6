//! Envelope signature verification (offline).
//!
//! Envelopes are signed with secp256k1 ECDSA over keccak256 of the raw payload bytes.
//! The signature is checked before the payload is parsed, so a forged payload never
//! reaches the JSON decoder.

use crate::transaction::{TransactionClaims, TransactionEnvelope, VerifiedTransaction};
use k256::ecdsa::signature::DigestVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Errors produced when an envelope cannot be trusted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("signature does not match payload")]
    BadSignature,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("invalid signer public key: {0}")]
    InvalidKey(String),
}

/// Checks envelopes against a single trusted signer key.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    key: VerifyingKey,
}

impl SignatureVerifier {
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, VerificationError> {
        let key = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| VerificationError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Accepts compressed or uncompressed SEC1 hex, with or without `0x`.
    pub fn from_hex(s: &str) -> Result<Self, VerificationError> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))
            .map_err(|e| VerificationError::InvalidKey(e.to_string()))?;
        Self::from_sec1_bytes(&bytes)
    }

    pub fn verify(
        &self,
        envelope: &TransactionEnvelope,
    ) -> Result<VerifiedTransaction, VerificationError> {
        let sig_hex = envelope.signature.as_str();
        let sig_bytes = hex::decode(sig_hex.strip_prefix("0x").unwrap_or(sig_hex))
            .map_err(|e| VerificationError::MalformedSignature(e.to_string()))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| VerificationError::MalformedSignature(e.to_string()))?;
        let digest = Keccak256::new_with_prefix(envelope.payload.as_bytes());
        self.key
            .verify_digest(digest, &signature)
            .map_err(|_| VerificationError::BadSignature)?;
        let claims: TransactionClaims = serde_json::from_str(&envelope.payload)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;
        Ok(VerifiedTransaction::from_claims(claims))
    }
}
