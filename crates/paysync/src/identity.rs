//! Persisted identifier of the currently registered user.

use crate::storage::{KeyValueStorage, StorageError, USER_IDENTIFIER_KEY};
use std::sync::{Arc, Mutex, MutexGuard};

enum Cached {
    Unloaded,
    Loaded(Option<String>),
}

/// Thin wrapper over [KeyValueStorage] for the user identifier record.
///
/// The record is read once and cached; clones share the cache, and `set`/`clear` update it.
#[derive(Clone)]
pub struct IdentityStore {
    storage: Arc<dyn KeyValueStorage>,
    cached: Arc<Mutex<Cached>>,
}

impl IdentityStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage,
            cached: Arc::new(Mutex::new(Cached::Unloaded)),
        }
    }

    /// The stored identifier; unreadable or empty records count as none.
    pub fn get(&self) -> Option<String> {
        let mut cached = self.lock();
        match &*cached {
            Cached::Loaded(id) => id.clone(),
            Cached::Unloaded => {
                let id = self.read();
                *cached = Cached::Loaded(id.clone());
                id
            }
        }
    }

    pub fn set(&self, user_identifier: &str) -> Result<(), StorageError> {
        let encoded = serde_json::Value::String(user_identifier.to_owned()).to_string();
        let mut cached = self.lock();
        self.storage.write(USER_IDENTIFIER_KEY, encoded.as_bytes())?;
        let id = (!user_identifier.is_empty()).then(|| user_identifier.to_owned());
        *cached = Cached::Loaded(id);
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        let mut cached = self.lock();
        self.storage.remove(USER_IDENTIFIER_KEY)?;
        *cached = Cached::Loaded(None);
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.get().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Cached> {
        self.cached.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> Option<String> {
        let bytes = match self.storage.read(USER_IDENTIFIER_KEY) {
            Ok(Some(b)) => b,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(reason = %e, "user identifier unreadable");
                return None;
            }
        };
        match serde_json::from_slice::<String>(&bytes) {
            Ok(id) if !id.is_empty() => Some(id),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(reason = %e, "user identifier undecodable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts reads that reach the underlying storage.
    struct CountingStorage {
        inner: MemoryStorage,
        reads: AtomicUsize,
    }

    impl KeyValueStorage for CountingStorage {
        fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(key)
        }

        fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            self.inner.write(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn set_get_clear() {
        let ids = IdentityStore::new(Arc::new(MemoryStorage::new()));
        assert!(!ids.is_registered());
        ids.set("user-123").unwrap();
        assert_eq!(ids.get().as_deref(), Some("user-123"));
        assert!(ids.is_registered());
        ids.clear().unwrap();
        assert_eq!(ids.get(), None);
    }

    #[test]
    fn empty_or_corrupt_is_unregistered() {
        let storage = Arc::new(MemoryStorage::new());
        storage.write(USER_IDENTIFIER_KEY, b"\"\"").unwrap();
        assert!(!IdentityStore::new(storage.clone()).is_registered());
        storage.write(USER_IDENTIFIER_KEY, b"user-without-quotes").unwrap();
        assert!(!IdentityStore::new(storage).is_registered());
    }

    #[test]
    fn identifier_is_read_from_storage_once() {
        let storage = Arc::new(CountingStorage {
            inner: MemoryStorage::new(),
            reads: AtomicUsize::new(0),
        });
        storage.write(USER_IDENTIFIER_KEY, b"\"user-9\"").unwrap();
        let ids = IdentityStore::new(storage.clone());
        for _ in 0..10 {
            assert!(ids.is_registered());
        }
        assert_eq!(storage.reads.load(Ordering::SeqCst), 1);

        ids.clear().unwrap();
        assert!(!ids.is_registered());
        ids.set("user-10").unwrap();
        assert_eq!(ids.get().as_deref(), Some("user-10"));
        assert_eq!(storage.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_the_cached_identifier() {
        let ids = IdentityStore::new(Arc::new(MemoryStorage::new()));
        let check = ids.clone();
        assert!(!check.is_registered());
        ids.set("user-11").unwrap();
        assert!(check.is_registered());
        ids.clear().unwrap();
        assert!(!check.is_registered());
    }

    #[test]
    fn persisted_identifier_survives_a_new_store() {
        let storage = Arc::new(MemoryStorage::new());
        IdentityStore::new(storage.clone()).set("user-12").unwrap();
        assert_eq!(IdentityStore::new(storage).get().as_deref(), Some("user-12"));
    }
}
