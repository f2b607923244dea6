//! Purchase-event monitoring with verified, deduplicated reporting.
//!
//! - **TransactionMonitor**: drains a live feed and a periodic snapshot of unfinished
//!   transactions, verifies each envelope, and reports it under a single global lock so no
//!   transaction is ever reported twice.
//! - **DedupStore**: persisted record of reported ids and failed-attempt counts
//!   (at most [MAX_ATTEMPTS] failures per id).
//! - **RemoteEventSource** / **HttpReporter**: HTTP + WebSocket implementations of the
//!   [EventSource] and [Reporter] seams.

pub mod config;
pub mod dedup;
pub mod identity;
pub mod monitor;
pub mod remote;
pub mod reporter;
pub mod source;
pub mod storage;
pub mod transaction;
pub mod verify;

pub use config::{MonitorConfig, ReconnectionConfig, ReporterConfig, SourceConfig};
pub use dedup::{DedupStore, LoadState, StoreError, MAX_ATTEMPTS};
pub use identity::IdentityStore;
pub use monitor::{Delivery, RegistrationCheck, TransactionMonitor};
pub use remote::RemoteEventSource;
pub use reporter::{HttpReporter, HttpReporterBuilder, PaymentReceipt, Reporter, ReporterError};
pub use source::{EventSource, SourceError};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage, StorageError};
pub use transaction::{TransactionClaims, TransactionEnvelope, VerifiedTransaction};
pub use verify::{SignatureVerifier, VerificationError};
