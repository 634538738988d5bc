//! Single-flight access to the utility cache.
//!
//! `UtilityStore::get_or_compute` returns the cached vector for a key when one
//! exists. Otherwise it runs the caller's computation and persists the result.
//! Concurrent callers for the same key queue on a per-key async lock; the
//! first one computes and the rest re-check the cache after it finishes.
//! Distinct keys never wait on each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheError, CacheLookup, UtilityCache, UtilityCacheKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    Cached,
    Computed,
}

#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub entry: CacheEntry,
    pub source: EntrySource,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError<E> {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("computation failed: {0}")]
    Compute(E),
    #[error("computed entry for {found} does not match requested key {expected}")]
    KeyMismatch { expected: String, found: String },
}

type Slot = Arc<AsyncMutex<()>>;

pub struct UtilityStore {
    cache: Arc<dyn UtilityCache>,
    inflight: Mutex<HashMap<String, Slot>>,
}

/// Removes the key's slot once no other caller holds it.
struct InflightGuard<'a> {
    store: &'a UtilityStore,
    key_hash: String,
    slot: Slot,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = match self.store.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // One reference in the map plus ours: nobody else is waiting.
        if Arc::strong_count(&self.slot) <= 2 {
            inflight.remove(&self.key_hash);
        }
    }
}

impl UtilityStore {
    pub fn new(cache: Arc<dyn UtilityCache>) -> Self {
        Self {
            cache,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<dyn UtilityCache> {
        &self.cache
    }

    /// Number of keys with a computation running or queued.
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub async fn entries_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<CacheEntry>, CacheError> {
        self.cache.entries_for_fingerprint(fingerprint).await
    }

    /// Cached entry for `key`, or the result of `compute` persisted under it.
    ///
    /// An entry stored for the same subject under a different fingerprint is
    /// never reused. `compute` runs at most once per key across concurrent
    /// callers of this store.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &UtilityCacheKey,
        compute: F,
    ) -> Result<StoreOutcome, StoreError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry, E>>,
    {
        if let Some(entry) = self.cached(key).await? {
            return Ok(StoreOutcome {
                entry,
                source: EntrySource::Cached,
            });
        }

        let guard = self.enter(key);
        let _lock = guard.slot.lock().await;

        if let Some(entry) = self.cached(key).await? {
            debug!(subject = %key.subject_key, "entry computed by a concurrent caller");
            return Ok(StoreOutcome {
                entry,
                source: EntrySource::Cached,
            });
        }

        self.compute_and_put(key, compute).await
    }

    /// Run `compute` and overwrite whatever is stored under `key`.
    ///
    /// Serialised with other callers for the same key, but never answered
    /// from the cache.
    pub async fn recompute<F, Fut, E>(
        &self,
        key: &UtilityCacheKey,
        compute: F,
    ) -> Result<StoreOutcome, StoreError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry, E>>,
    {
        let guard = self.enter(key);
        let _lock = guard.slot.lock().await;
        self.compute_and_put(key, compute).await
    }

    fn enter(&self, key: &UtilityCacheKey) -> InflightGuard<'_> {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let slot = inflight
            .entry(key.key_hash.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        InflightGuard {
            store: self,
            key_hash: key.key_hash.clone(),
            slot,
        }
    }

    async fn cached(&self, key: &UtilityCacheKey) -> Result<Option<CacheEntry>, CacheError> {
        match self.cache.lookup(key).await? {
            CacheLookup::Hit(entry) => Ok(Some(entry)),
            CacheLookup::Miss => Ok(None),
            CacheLookup::Mismatch {
                stored_fingerprints,
            } => {
                info!(
                    subject = %key.subject_key,
                    fingerprint = %key.fingerprint,
                    stored = ?stored_fingerprints,
                    "item set changed since last fit; recomputing"
                );
                Ok(None)
            }
        }
    }

    async fn compute_and_put<F, Fut, E>(
        &self,
        key: &UtilityCacheKey,
        compute: F,
    ) -> Result<StoreOutcome, StoreError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry, E>>,
    {
        let entry = compute().await.map_err(StoreError::Compute)?;
        let produced = entry.key();
        if produced.key_hash != key.key_hash {
            return Err(StoreError::KeyMismatch {
                expected: format!("{}@{}", key.subject_key, key.fingerprint),
                found: format!("{}@{}", produced.subject_key, produced.fingerprint),
            });
        }
        self.cache.put(&entry).await?;
        Ok(StoreOutcome {
            entry,
            source: EntrySource::Computed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryUtilityCache;
    use crate::subject::SubjectKind;
    use chrono::Utc;

    fn entry(subject_key: &str, fingerprint: &str) -> CacheEntry {
        CacheEntry {
            subject_key: subject_key.to_string(),
            subject_name: "x".to_string(),
            subject_kind: SubjectKind::Politician,
            judge_model: "m".to_string(),
            system_prompt_hash: "h".to_string(),
            fingerprint: fingerprint.to_string(),
            item_ids: vec!["a".to_string(), "b".to_string()],
            means: vec![Some(0.5), Some(-0.5)],
            stds: vec![Some(0.1), Some(0.1)],
            excluded_items: Vec::new(),
            trials_per_pair: 5,
            tie_band: 0.1,
            converged: true,
            iterations: 3,
            grad_norm: 1e-9,
            run_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn slot_is_released_after_compute() {
        let store = UtilityStore::new(Arc::new(MemoryUtilityCache::new()));
        let key = UtilityCacheKey::new("s", "fp");
        let out = store
            .get_or_compute(&key, || async { Ok::<_, std::io::Error>(entry("s", "fp")) })
            .await
            .unwrap();
        assert_eq!(out.source, EntrySource::Computed);
        assert_eq!(store.inflight_len(), 0);
    }

    #[tokio::test]
    async fn computed_entry_must_match_key() {
        let store = UtilityStore::new(Arc::new(MemoryUtilityCache::new()));
        let key = UtilityCacheKey::new("s", "fp");
        let err = store
            .get_or_compute(&key, || async { Ok::<_, std::io::Error>(entry("s", "other")) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyMismatch { .. }));
    }

    #[tokio::test]
    async fn compute_error_is_not_cached() {
        let store = UtilityStore::new(Arc::new(MemoryUtilityCache::new()));
        let key = UtilityCacheKey::new("s", "fp");
        let err = store
            .get_or_compute(&key, || async {
                Err::<CacheEntry, _>(std::io::Error::other("boom"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Compute(_)));
        let out = store
            .get_or_compute(&key, || async { Ok::<_, std::io::Error>(entry("s", "fp")) })
            .await
            .unwrap();
        assert_eq!(out.source, EntrySource::Computed);
    }
}
