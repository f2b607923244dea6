//! Common helpers for integration tests: signed envelopes, a scriptable event source and a
//! recording reporter.
//! Some helpers are only used by specific test binaries, hence `dead_code`.
#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use k256::ecdsa::signature::DigestSigner;
use k256::ecdsa::{Signature, SigningKey};
use paysync::{
    EventSource, KeyValueStorage, MemoryStorage, PaymentReceipt, Reporter, ReporterError,
    SignatureVerifier, SourceError, StorageError, TransactionEnvelope, VerificationError,
    VerifiedTransaction,
};
use sha3::{Digest, Keccak256};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive("paysync=debug".parse().unwrap());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Deterministic platform signing key.
pub fn signing_key() -> SigningKey {
    SigningKey::from_slice(&[7u8; 32]).expect("signing key")
}

pub fn signer_public_key_hex() -> String {
    hex::encode(signing_key().verifying_key().to_sec1_bytes())
}

pub fn verifier() -> SignatureVerifier {
    SignatureVerifier::from_hex(&signer_public_key_hex()).expect("verifier")
}

pub fn sign_payload(key: &SigningKey, payload: &str) -> TransactionEnvelope {
    let sig: Signature = key.sign_digest(Keccak256::new_with_prefix(payload.as_bytes()));
    TransactionEnvelope::new(payload, hex::encode(sig.to_bytes()))
}

pub fn payload(original_id: u64, product_id: &str) -> String {
    serde_json::json!({
        "originalId": original_id,
        "productId": product_id,
        "purchaseDate": "2024-05-01T12:00:00Z",
    })
    .to_string()
}

/// Envelope signed by the trusted platform key.
pub fn envelope(original_id: u64, product_id: &str) -> TransactionEnvelope {
    sign_payload(&signing_key(), &payload(original_id, product_id))
}

/// Envelope signed by some other key.
pub fn forged_envelope(original_id: u64, product_id: &str) -> TransactionEnvelope {
    let other = SigningKey::from_slice(&[9u8; 32]).expect("signing key");
    sign_payload(&other, &payload(original_id, product_id))
}

/// Event source with a mutable snapshot, a broadcast live feed and optional finite live
/// batches served before the broadcast feed. Acknowledged ids leave the snapshot.
pub struct MockSource {
    snapshot: Mutex<Vec<TransactionEnvelope>>,
    live_tx: broadcast::Sender<TransactionEnvelope>,
    finite_batches: Mutex<VecDeque<Vec<TransactionEnvelope>>>,
    verifier: SignatureVerifier,
    acks: Mutex<Vec<u64>>,
    updates_calls: AtomicUsize,
    fail_snapshot: AtomicBool,
    fail_ack: AtomicBool,
}

impl MockSource {
    pub fn new() -> Self {
        let (live_tx, _) = broadcast::channel(64);
        Self {
            snapshot: Mutex::new(Vec::new()),
            live_tx,
            finite_batches: Mutex::new(VecDeque::new()),
            verifier: verifier(),
            acks: Mutex::new(Vec::new()),
            updates_calls: AtomicUsize::new(0),
            fail_snapshot: AtomicBool::new(false),
            fail_ack: AtomicBool::new(false),
        }
    }

    pub fn with_snapshot(self, envelopes: Vec<TransactionEnvelope>) -> Self {
        *self.snapshot.lock().unwrap() = envelopes;
        self
    }

    /// Next call to `updates()` yields these envelopes and then ends.
    pub fn with_finite_batch(self, envelopes: Vec<TransactionEnvelope>) -> Self {
        self.finite_batches.lock().unwrap().push_back(envelopes);
        self
    }

    pub fn failing_snapshot(self) -> Self {
        self.fail_snapshot.store(true, Ordering::SeqCst);
        self
    }

    /// `acknowledge` records the call and then fails; the snapshot keeps the envelope.
    pub fn failing_ack(self) -> Self {
        self.fail_ack.store(true, Ordering::SeqCst);
        self
    }

    pub fn push_live(&self, envelope: TransactionEnvelope) {
        let _ = self.live_tx.send(envelope);
    }

    /// Wait until the monitor's live listener has subscribed.
    pub async fn wait_for_listener(&self) {
        timeout(Duration::from_secs(5), async {
            while self.live_tx.receiver_count() == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("live listener never subscribed");
    }

    pub fn acks(&self) -> Vec<u64> {
        self.acks.lock().unwrap().clone()
    }

    pub fn updates_calls(&self) -> usize {
        self.updates_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for MockSource {
    async fn current_entitlements(&self) -> Result<Vec<TransactionEnvelope>, SourceError> {
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(SourceError::Decode("snapshot unavailable".into()));
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }

    fn updates(&self) -> BoxStream<'static, TransactionEnvelope> {
        self.updates_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(batch) = self.finite_batches.lock().unwrap().pop_front() {
            return stream::iter(batch).boxed();
        }
        let rx = self.live_tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(env) => return Some((env, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
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
        self.acks.lock().unwrap().push(tx.original_id);
        if self.fail_ack.load(Ordering::SeqCst) {
            return Err(SourceError::Status {
                status: 503,
                body: "finish unavailable".into(),
            });
        }
        let payload_id = tx.original_id;
        self.snapshot
            .lock()
            .unwrap()
            .retain(|env| env.claimed_original_id() != Some(payload_id));
        Ok(())
    }
}

/// Reporter that records calls, can be told to fail, and tracks peak concurrency.
pub struct MockReporter {
    calls: Mutex<Vec<(String, u64)>>,
    fail: AtomicBool,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockReporter {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        let r = Self::new();
        r.fail.store(true, Ordering::SeqCst);
        r
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, id: u64) -> usize {
        self.calls.lock().unwrap().iter().filter(|(_, i)| *i == id).count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reporter for MockReporter {
    async fn report_payment(
        &self,
        product_id: &str,
        transaction_id: u64,
    ) -> Result<PaymentReceipt, ReporterError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((product_id.to_string(), transaction_id));
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ReporterError::Server {
                status: 500,
                message: "mock failure".into(),
            });
        }
        Ok(PaymentReceipt {
            payment_id: Some(format!("pay_{transaction_id}")),
        })
    }
}

/// Storage whose reads work and whose writes always fail.
pub struct ReadOnlyStorage {
    inner: MemoryStorage,
}

impl ReadOnlyStorage {
    pub fn new() -> Self {
        Self {
            inner: MemoryStorage::new(),
        }
    }
}

impl KeyValueStorage for ReadOnlyStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.read(key)
    }

    fn write(&self, key: &str, _value: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::Io {
            key: key.to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "read-only"),
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key)
    }
}

/// Poll `cond` every 10ms until it holds or `secs` elapse.
pub async fn eventually(secs: u64, mut cond: impl FnMut() -> bool) -> bool {
    timeout(Duration::from_secs(secs), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
