//! DedupStore: persisted bookkeeping of reported transaction ids and failed attempts.
//!
//! Two records live in [KeyValueStorage]: the processed set (JSON array of ids) and the
//! attempt counter (JSON object, id -> failures). Each is loaded lazily on first access and
//! cached; each mutation is written back before the call returns. Unreadable records are
//! treated as empty so a corrupt file degrades to "process everything", never to a stall.
//!
//! Lock order is always processed -> attempts.

use crate::storage::{KeyValueStorage, StorageError, ATTEMPTS_KEY, PROCESSED_IDS_KEY};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Failed report attempts after which an id is never tried again.
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persist {key}: {source}")]
    Persist {
        key: &'static str,
        #[source]
        source: StorageError,
    },
    #[error("encode {key}: {source}")]
    Encode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Where a cached record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Not read from storage yet.
    Unloaded,
    /// Read from storage (absent counts as empty).
    Loaded,
    /// Storage held something unreadable; started from empty instead.
    Recovered,
}

#[derive(Debug)]
enum Slot<T> {
    Unloaded,
    Loaded(T),
    Recovered(T),
}

impl<T: Default + DeserializeOwned> Slot<T> {
    fn state(&self) -> LoadState {
        match self {
            Slot::Unloaded => LoadState::Unloaded,
            Slot::Loaded(_) => LoadState::Loaded,
            Slot::Recovered(_) => LoadState::Recovered,
        }
    }

    fn get(&mut self, storage: &dyn KeyValueStorage, key: &'static str) -> &mut T {
        if let Slot::Unloaded = self {
            *self = load(storage, key);
        }
        match self {
            Slot::Loaded(v) | Slot::Recovered(v) => v,
            Slot::Unloaded => unreachable!("slot loaded above"),
        }
    }
}

fn load<T: Default + DeserializeOwned>(
    storage: &dyn KeyValueStorage,
    key: &'static str,
) -> Slot<T> {
    match storage.read(key) {
        Ok(None) => Slot::Loaded(T::default()),
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(v) => Slot::Loaded(v),
            Err(e) => {
                tracing::warn!(key, reason = %e, "dedup record undecodable, starting empty");
                Slot::Recovered(T::default())
            }
        },
        Err(e) => {
            tracing::warn!(key, reason = %e, "dedup record unreadable, starting empty");
            Slot::Recovered(T::default())
        }
    }
}

fn persist<T: Serialize>(
    storage: &dyn KeyValueStorage,
    key: &'static str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Encode { key, source })?;
    storage
        .write(key, &bytes)
        .map_err(|source| StoreError::Persist { key, source })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic mid-update leaves at worst a cache that is ahead of storage; keep serving it.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Durable "should this id be processed" oracle.
pub struct DedupStore {
    storage: Arc<dyn KeyValueStorage>,
    processed: Mutex<Slot<BTreeSet<u64>>>,
    attempts: Mutex<Slot<BTreeMap<u64, u32>>>,
}

impl DedupStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage,
            processed: Mutex::new(Slot::Unloaded),
            attempts: Mutex::new(Slot::Unloaded),
        }
    }

    /// True iff the id has not been reported and has fewer than [MAX_ATTEMPTS] failures.
    pub fn should_process(&self, id: u64) -> bool {
        let mut processed = lock(&self.processed);
        if processed.get(self.storage.as_ref(), PROCESSED_IDS_KEY).contains(&id) {
            return false;
        }
        let mut attempts = lock(&self.attempts);
        let count = attempts
            .get(self.storage.as_ref(), ATTEMPTS_KEY)
            .get(&id)
            .copied()
            .unwrap_or(0);
        count < MAX_ATTEMPTS
    }

    /// Records a successful report. The cache is updated even if persisting fails.
    pub fn mark_processed(&self, id: u64) -> Result<(), StoreError> {
        let mut processed = lock(&self.processed);
        let set = processed.get(self.storage.as_ref(), PROCESSED_IDS_KEY);
        if !set.insert(id) {
            return Ok(());
        }
        persist(self.storage.as_ref(), PROCESSED_IDS_KEY, set)
    }

    /// Records a failed report, saturating at [MAX_ATTEMPTS]. No-op for processed ids.
    pub fn increment_attempt(&self, id: u64) -> Result<(), StoreError> {
        let mut processed = lock(&self.processed);
        if processed.get(self.storage.as_ref(), PROCESSED_IDS_KEY).contains(&id) {
            return Ok(());
        }
        let mut attempts = lock(&self.attempts);
        let map = attempts.get(self.storage.as_ref(), ATTEMPTS_KEY);
        let count = map.entry(id).or_insert(0);
        if *count >= MAX_ATTEMPTS {
            return Ok(());
        }
        *count += 1;
        persist(self.storage.as_ref(), ATTEMPTS_KEY, map)
    }

    pub fn is_processed(&self, id: u64) -> bool {
        lock(&self.processed)
            .get(self.storage.as_ref(), PROCESSED_IDS_KEY)
            .contains(&id)
    }

    pub fn attempts(&self, id: u64) -> u32 {
        lock(&self.attempts)
            .get(self.storage.as_ref(), ATTEMPTS_KEY)
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    pub fn processed_state(&self) -> LoadState {
        lock(&self.processed).state()
    }

    pub fn attempts_state(&self) -> LoadState {
        lock(&self.attempts).state()
    }
}
