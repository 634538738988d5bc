use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use stance_harness::cache::{
    CacheEntry, MemoryUtilityCache, SqliteUtilityCache, UtilityCache, UtilityCacheKey,
};
use stance_harness::store::{EntrySource, UtilityStore};
use stance_harness::subject::SubjectKind;
use tempfile::tempdir;
use tokio::sync::Barrier;

fn entry(subject_key: &str, fingerprint: &str, lead: f64) -> CacheEntry {
    CacheEntry {
        subject_key: subject_key.to_string(),
        subject_name: subject_key.to_string(),
        subject_kind: SubjectKind::Model,
        judge_model: "sim".to_string(),
        system_prompt_hash: "h".to_string(),
        fingerprint: fingerprint.to_string(),
        item_ids: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        means: vec![Some(lead), Some(0.0), Some(-lead)],
        stds: vec![Some(0.2), Some(0.2), Some(0.2)],
        excluded_items: Vec::new(),
        trials_per_pair: 5,
        tie_band: 0.1,
        converged: true,
        iterations: 4,
        grad_norm: 1e-9,
        run_id: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn concurrent_callers_share_one_computation() {
    let store = UtilityStore::new(Arc::new(MemoryUtilityCache::new()));
    let key = UtilityCacheKey::new("model/sim/1", "fp");
    let calls = AtomicUsize::new(0);

    let outcomes = join_all((0..8).map(|i| {
        let store = &store;
        let key = &key;
        let calls = &calls;
        async move {
            store
                .get_or_compute(key, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, std::io::Error>(entry("model/sim/1", "fp", 1.0 + i as f64))
                })
                .await
                .unwrap()
        }
    }))
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let computed = outcomes
        .iter()
        .filter(|o| o.source == EntrySource::Computed)
        .count();
    assert_eq!(computed, 1);
    let first = &outcomes[0].entry.means;
    assert!(outcomes.iter().all(|o| &o.entry.means == first));
    assert_eq!(store.inflight_len(), 0);
}

#[tokio::test]
async fn second_call_returns_stored_vector_without_computing() {
    let store = UtilityStore::new(Arc::new(MemoryUtilityCache::new()));
    let key = UtilityCacheKey::new("s", "fp");
    let calls = AtomicUsize::new(0);

    let first = store
        .get_or_compute(&key, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(entry("s", "fp", 2.0))
        })
        .await
        .unwrap();
    let second = store
        .get_or_compute(&key, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(entry("s", "fp", 9.0))
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.source, EntrySource::Computed);
    assert_eq!(second.source, EntrySource::Cached);
    assert_eq!(first.entry, second.entry);
}

#[tokio::test]
async fn distinct_keys_compute_concurrently() {
    let store = UtilityStore::new(Arc::new(MemoryUtilityCache::new()));
    let barrier = Barrier::new(2);
    let k1 = UtilityCacheKey::new("s1", "fp");
    let k2 = UtilityCacheKey::new("s2", "fp");

    let run = |key: &'static str| {
        let store = &store;
        let barrier = &barrier;
        async move {
            let cache_key = UtilityCacheKey::new(key, "fp");
            store
                .get_or_compute(&cache_key, || async move {
                    // Both computations must be in flight at once to pass.
                    barrier.wait().await;
                    Ok::<_, std::io::Error>(entry(key, "fp", 1.0))
                })
                .await
                .unwrap()
        }
    };

    let both = tokio::time::timeout(Duration::from_secs(5), futures::future::join(run("s1"), run("s2")))
        .await
        .expect("distinct keys must not serialise");
    assert_eq!(both.0.entry.key(), k1);
    assert_eq!(both.1.entry.key(), k2);
}

#[tokio::test]
async fn changed_fingerprint_triggers_fresh_computation() {
    let cache = Arc::new(MemoryUtilityCache::new());
    let store = UtilityStore::new(cache.clone());
    store
        .get_or_compute(&UtilityCacheKey::new("s", "fp-old"), || async {
            Ok::<_, std::io::Error>(entry("s", "fp-old", 1.0))
        })
        .await
        .unwrap();

    let calls = AtomicUsize::new(0);
    let fresh = store
        .get_or_compute(&UtilityCacheKey::new("s", "fp-new"), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(entry("s", "fp-new", 3.0))
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fresh.source, EntrySource::Computed);
    assert_eq!(fresh.entry.means[0], Some(3.0));
    assert_eq!(cache.entries_for_fingerprint("fp-old").await.unwrap().len(), 1);
    assert_eq!(cache.entries_for_fingerprint("fp-new").await.unwrap().len(), 1);
}

#[tokio::test]
async fn recompute_overwrites_cached_entry() {
    let store = UtilityStore::new(Arc::new(MemoryUtilityCache::new()));
    let key = UtilityCacheKey::new("s", "fp");
    store
        .get_or_compute(&key, || async { Ok::<_, std::io::Error>(entry("s", "fp", 1.0)) })
        .await
        .unwrap();
    let redone = store
        .recompute(&key, || async { Ok::<_, std::io::Error>(entry("s", "fp", 4.0)) })
        .await
        .unwrap();
    assert_eq!(redone.source, EntrySource::Computed);

    let again = store
        .get_or_compute(&key, || async { Ok::<_, std::io::Error>(entry("s", "fp", 7.0)) })
        .await
        .unwrap();
    assert_eq!(again.entry.means[0], Some(4.0));
}

#[tokio::test]
async fn sqlite_backed_store_reuses_entries_across_processes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.sqlite");
    let key = UtilityCacheKey::new("s", "fp");

    let store = UtilityStore::new(Arc::new(SqliteUtilityCache::new(&path).unwrap()));
    store
        .get_or_compute(&key, || async { Ok::<_, std::io::Error>(entry("s", "fp", 1.5)) })
        .await
        .unwrap();
    drop(store);

    let reopened = UtilityStore::new(Arc::new(SqliteUtilityCache::new(&path).unwrap()));
    let outcome = reopened
        .get_or_compute(&key, || async {
            Err::<CacheEntry, _>(std::io::Error::other("must not recompute"))
        })
        .await
        .unwrap();
    assert_eq!(outcome.source, EntrySource::Cached);
    assert_eq!(outcome.entry.means[0], Some(1.5));
}
