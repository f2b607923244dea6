//! TransactionMonitor: drains both feeds of an [EventSource] and reports each verified
//! transaction at most once.
//!
//! Two activities run per started monitor: a live listener over [EventSource::updates] and a
//! snapshot poller over [EventSource::current_entitlements]. Both funnel into one pipeline
//! whose report step runs under a single lock, so at most one report is in flight at any
//! time and the dedup check and its follow-up write are atomic with respect to each other.
//!
//! Cancellation is cooperative: `stop()` flips a watch flag that both loops check between
//! deliveries, so a delivery that already holds the lock always runs to completion.

use crate::config::{MonitorConfig, ReconnectionConfig};
use crate::dedup::DedupStore;
use crate::reporter::Reporter;
use crate::source::EventSource;
use crate::transaction::TransactionEnvelope;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, MissedTickBehavior};

/// Externally supplied "is a user currently registered" predicate.
pub type RegistrationCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// What happened to one delivered envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No registered user; skipped without side effects.
    Unregistered,
    /// Signature or payload check failed; not counted, not acknowledged.
    Unverified,
    /// Already reported, or out of attempts. Nothing reported or acknowledged.
    AlreadyHandled,
    /// Reported, recorded as processed, acknowledged.
    Reported,
    /// Report failed, attempt counted, acknowledged anyway.
    ReportFailed,
}

#[derive(Debug, Clone, Copy)]
enum Feed {
    Live,
    Snapshot,
    Direct,
}

impl Feed {
    fn as_str(self) -> &'static str {
        match self {
            Feed::Live => "live",
            Feed::Snapshot => "snapshot",
            Feed::Direct => "direct",
        }
    }
}

struct Pipeline {
    source: Arc<dyn EventSource>,
    reporter: Arc<dyn Reporter>,
    store: Arc<DedupStore>,
    registered: RegistrationCheck,
    report_lock: tokio::sync::Mutex<()>,
}

impl Pipeline {
    async fn deliver(&self, envelope: &TransactionEnvelope, feed: Feed) -> Delivery {
        let feed = feed.as_str();
        if !(self.registered)() {
            tracing::debug!(feed, "no registered user, delivery deferred");
            return Delivery::Unregistered;
        }
        let tx = match self.source.verify(envelope) {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(
                    feed,
                    original_id = ?envelope.claimed_original_id(),
                    reason = %e,
                    "transaction verification failed"
                );
                return Delivery::Unverified;
            }
        };
        let id = tx.original_id;

        let _guard = self.report_lock.lock().await;
        let should_process = match self.with_store(move |store| store.should_process(id)).await {
            Some(v) => v,
            None => return Delivery::AlreadyHandled,
        };
        if !should_process {
            tracing::debug!(feed, original_id = id, "transaction already handled");
            return Delivery::AlreadyHandled;
        }
        let outcome = match self.reporter.report_payment(&tx.product_id, id).await {
            Ok(receipt) => {
                tracing::info!(
                    feed,
                    original_id = id,
                    product_id = %tx.product_id,
                    payment_id = ?receipt.payment_id,
                    "payment reported"
                );
                let persisted = self.with_store(move |store| store.mark_processed(id)).await;
                if let Some(Err(e)) = persisted {
                    tracing::error!(
                        original_id = id,
                        reason = %e,
                        "failed to persist processed id"
                    );
                }
                Delivery::Reported
            }
            Err(e) => {
                tracing::warn!(
                    feed,
                    original_id = id,
                    kind = e.kind(),
                    reason = %e,
                    "payment report failed"
                );
                let persisted = self.with_store(move |store| store.increment_attempt(id)).await;
                if let Some(Err(e)) = persisted {
                    tracing::error!(
                        original_id = id,
                        reason = %e,
                        "failed to persist attempt count"
                    );
                }
                Delivery::ReportFailed
            }
        };
        if let Err(e) = self.source.acknowledge(&tx).await {
            tracing::warn!(feed, original_id = id, reason = %e, "acknowledge failed");
        }
        outcome
    }

    /// Runs a store operation on the blocking pool. `None` if the task panicked or was
    /// cancelled by runtime shutdown.
    async fn with_store<T, F>(&self, op: F) -> Option<T>
    where
        F: FnOnce(&DedupStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || op(&store)).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!(reason = %e, "dedup store task failed");
                None
            }
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the monitoring lifecycle. Collaborators are injected; nothing is looked up globally.
pub struct TransactionMonitor {
    pipeline: Arc<Pipeline>,
    config: MonitorConfig,
    running: Mutex<Option<Running>>,
}

impl TransactionMonitor {
    pub fn new(
        source: Arc<dyn EventSource>,
        reporter: Arc<dyn Reporter>,
        store: Arc<DedupStore>,
        registered: impl Fn() -> bool + Send + Sync + 'static,
        config: MonitorConfig,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                source,
                reporter,
                store,
                registered: Arc::new(registered),
                report_lock: tokio::sync::Mutex::new(()),
            }),
            config,
            running: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<DedupStore> {
        &self.pipeline.store
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Launch the live listener and the snapshot poller. Must be called from within a Tokio
    /// runtime. Returns false (and does nothing) if already running.
    pub fn start(&self) -> bool {
        let mut running = self.lock_running();
        if running.is_some() {
            tracing::debug!("transaction monitor already running");
            return false;
        }
        let (shutdown, rx) = watch::channel(false);
        let live = tokio::spawn(run_live(
            Arc::clone(&self.pipeline),
            self.config.reconnection.clone(),
            rx.clone(),
        ));
        let poller = tokio::spawn(run_poller(
            Arc::clone(&self.pipeline),
            self.config.poll_interval(),
            rx,
        ));
        *running = Some(Running {
            shutdown,
            tasks: vec![live, poller],
        });
        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            "transaction monitor started"
        );
        true
    }

    /// Cancel both activities and wait for them to finish their current delivery.
    /// A later `start()` relaunches them.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown.send(true);
        for task in running.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(reason = %e, "monitor task panicked");
                }
            }
        }
        tracing::info!("transaction monitor stopped");
    }

    /// Run one envelope through the full protocol, outside of the background activities.
    pub async fn deliver(&self, envelope: &TransactionEnvelope) -> Delivery {
        self.pipeline.deliver(envelope, Feed::Direct).await
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TransactionMonitor {
    fn drop(&mut self) {
        let running = match self.running.get_mut() {
            Ok(r) => r.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
        }
    }
}

async fn run_live(
    pipeline: Arc<Pipeline>,
    reconnection: ReconnectionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reopen: u32 = 0;
    while !*shutdown.borrow() {
        let mut updates = pipeline.source.updates();
        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => return,
                next = updates.next() => next,
            };
            let Some(envelope) = next else {
                break;
            };
            reopen = 0;
            pipeline.deliver(&envelope, Feed::Live).await;
            if *shutdown.borrow() {
                return;
            }
        }
        let delay = reconnection.backoff(reopen);
        reopen = reopen.saturating_add(1);
        tracing::warn!(retry_in_secs = delay.as_secs(), "live update stream ended, reopening");
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(delay) => {}
        }
    }
}

async fn run_poller(
    pipeline: Arc<Pipeline>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            return;
        }
        let snapshot = tokio::select! {
            _ = shutdown.changed() => return,
            snapshot = pipeline.source.current_entitlements() => snapshot,
        };
        let envelopes = match snapshot {
            Ok(envelopes) => envelopes,
            Err(e) => {
                tracing::warn!(reason = %e, "unfinished transaction snapshot failed");
                continue;
            }
        };
        for envelope in envelopes {
            if *shutdown.borrow() {
                return;
            }
            pipeline.deliver(&envelope, Feed::Snapshot).await;
        }
    }
}
