use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error, info};

use crate::error::{CacheError, StorageError};
use crate::metrics_consts::{
    FLAG_CACHE_HIT_COUNTER, FLAG_CACHE_MISS_COUNTER, FLAG_CACHE_REPLACE_COUNTER,
    FLAG_CACHE_STALE_HIT_COUNTER, STORAGE_WRITE_ERROR_COUNTER,
};
use crate::storage::{encode, load_or_reset, Storage};
use crate::types::{CacheSnapshot, CachedValue, ResolvedValue};
use crate::value_store::ValueStore;

/// Thread-safe, write-through cache of resolved flag values.
///
/// Reads share a `RwLock` and never wait on each other. Mutations hold the
/// `writer` mutex for their whole duration, so they are serialized and
/// persisted in the order they were applied, but the `RwLock` itself is only
/// held while the in-memory state is swapped and encoded. Storage I/O never
/// blocks readers.
pub struct ResolveCache {
    store: RwLock<ValueStore>,
    writer: Mutex<()>,
    storage: Arc<dyn Storage>,
}

impl ResolveCache {
    /// Build a cache from whatever `storage` holds. Corrupted or unknown
    /// snapshots are wiped and the cache starts empty. Read failures are
    /// returned without touching the stored snapshot.
    pub fn new(storage: Arc<dyn Storage>) -> Result<Self, StorageError> {
        let snapshot: CacheSnapshot = load_or_reset(storage.as_ref())?;
        info!(
            location = %storage.location(),
            flags = snapshot.values.len(),
            "loaded resolve cache"
        );

        Ok(Self {
            store: RwLock::new(ValueStore::new(snapshot)),
            writer: Mutex::new(()),
            storage,
        })
    }

    pub fn get(&self, flag: &str, context_fingerprint: &str) -> Result<CachedValue, CacheError> {
        let result = self.read_store().get(flag, context_fingerprint);

        match &result {
            Ok(hit) if hit.needs_update => {
                metrics::counter!(FLAG_CACHE_STALE_HIT_COUNTER).increment(1)
            }
            Ok(_) => metrics::counter!(FLAG_CACHE_HIT_COUNTER).increment(1),
            Err(_) => metrics::counter!(FLAG_CACHE_MISS_COUNTER).increment(1),
        }

        result
    }

    /// Replace the whole cache content with a new resolve and persist it.
    pub fn replace(
        &self,
        values: Vec<ResolvedValue>,
        context_fingerprint: &str,
        resolve_token: &str,
    ) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let encoded = {
            let mut store = self.write_store();
            store.replace(values, context_fingerprint, resolve_token);
            encode(store.snapshot())
        };

        metrics::counter!(FLAG_CACHE_REPLACE_COUNTER).increment(1);
        debug!(resolve_token, "replaced resolve cache");

        if let Err(e) = encoded.and_then(|bytes| self.storage.save(&bytes)) {
            self.report_write_error(e);
        }
    }

    /// Drop every value and the durable copy.
    pub fn clear(&self) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        self.write_store().clear();

        if let Err(e) = self.storage.clear() {
            self.report_write_error(e);
        }
    }

    /// A copy of the current content.
    pub fn snapshot(&self) -> CacheSnapshot {
        self.read_store().snapshot().clone()
    }

    pub fn resolve_token(&self) -> Option<String> {
        self.read_store().resolve_token().map(str::to_owned)
    }

    pub fn context_fingerprint(&self) -> Option<String> {
        self.read_store().context_fingerprint().map(str::to_owned)
    }

    pub fn flag_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read_store()
            .snapshot()
            .values
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read_store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_store().is_empty()
    }

    fn read_store(&self) -> RwLockReadGuard<'_, ValueStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, ValueStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_write_error(&self, e: StorageError) {
        error!(
            location = %self.storage.location(),
            "failed to persist resolve cache: {}", e
        );
        metrics::counter!(STORAGE_WRITE_ERROR_COUNTER, "component" => "resolve_cache")
            .increment(1);
    }
}
