//! SQLite-backed cache of fitted utility vectors.
//!
//! One row per `(subject key, item-set fingerprint)`. The fitted vector and
//! its metadata are stored as a JSON payload; the indexed columns exist for
//! lookup, listing, and pruning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::catalog::{hash_fields, hash_text, ItemCatalog};
use crate::subject::{Subject, SubjectKind};
use crate::thurstone::UtilityFit;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UtilityCacheKey {
    pub subject_key: String,
    pub fingerprint: String,
    pub key_hash: String,
}

impl UtilityCacheKey {
    pub fn new(subject_key: &str, fingerprint: &str) -> Self {
        Self {
            subject_key: subject_key.to_string(),
            fingerprint: fingerprint.to_string(),
            key_hash: hash_fields(&[subject_key, fingerprint]),
        }
    }

    pub fn for_subject(subject: &Subject, catalog: &ItemCatalog) -> Self {
        Self::new(subject.key().as_str(), catalog.fingerprint())
    }
}

/// A fitted utility vector with the provenance needed to reuse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub subject_key: String,
    pub subject_name: String,
    pub subject_kind: SubjectKind,
    pub judge_model: String,
    pub system_prompt_hash: String,
    pub fingerprint: String,
    /// Item ids in catalog order; `means` and `stds` align with it.
    pub item_ids: Vec<String>,
    pub means: Vec<Option<f64>>,
    pub stds: Vec<Option<f64>>,
    pub excluded_items: Vec<String>,
    pub trials_per_pair: u32,
    pub tie_band: f64,
    pub converged: bool,
    pub iterations: usize,
    pub grad_norm: f64,
    pub run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn from_fit(
        subject: &Subject,
        catalog: &ItemCatalog,
        fit: &UtilityFit,
        trials_per_pair: u32,
        run_id: Option<Uuid>,
    ) -> Self {
        let item_ids = catalog.ids();
        let excluded_items = fit
            .excluded
            .iter()
            .filter_map(|e| item_ids.get(e.index).cloned())
            .collect();
        Self {
            subject_key: subject.key().to_string(),
            subject_name: subject.name.clone(),
            subject_kind: subject.kind,
            judge_model: subject.judge.model.clone(),
            system_prompt_hash: hash_text(subject.judge.system_prompt_or_default())[..16]
                .to_string(),
            fingerprint: catalog.fingerprint().to_string(),
            item_ids,
            means: fit.means.clone(),
            stds: fit.stds.clone(),
            excluded_items,
            trials_per_pair,
            tie_band: fit.tie_band,
            converged: fit.diagnostics.converged,
            iterations: fit.diagnostics.iterations,
            grad_norm: fit.diagnostics.grad_norm,
            run_id,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> UtilityCacheKey {
        UtilityCacheKey::new(&self.subject_key, &self.fingerprint)
    }

    /// Fraction of items without a fitted utility.
    pub fn missing_fraction(&self) -> f64 {
        if self.means.is_empty() {
            return 1.0;
        }
        let missing = self
            .means
            .iter()
            .filter(|m| !m.map(f64::is_finite).unwrap_or(false))
            .count();
        missing as f64 / self.means.len() as f64
    }

    fn validate(&self) -> Result<(), CacheError> {
        if self.means.len() != self.item_ids.len() || self.stds.len() != self.item_ids.len() {
            return Err(CacheError::Invalid(format!(
                "entry for {} has {} means and {} stds for {} items",
                self.subject_key,
                self.means.len(),
                self.stds.len(),
                self.item_ids.len()
            )));
        }
        Ok(())
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss,
    /// The subject has entries, but only for other item sets.
    Mismatch { stored_fingerprints: Vec<String> },
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("invalid cache entry: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait UtilityCache: Send + Sync {
    async fn lookup(&self, key: &UtilityCacheKey) -> Result<CacheLookup, CacheError>;
    /// Insert or replace the entry for `entry.key()`.
    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError>;
    /// Remove every entry for a subject; returns the number removed.
    async fn invalidate(&self, subject_key: &str) -> Result<usize, CacheError>;
    /// All entries for an item set, ordered by subject key.
    async fn entries_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<CacheEntry>, CacheError>;
}

// =============================================================================
// SQLite
// =============================================================================

#[derive(Clone)]
pub struct SqliteUtilityCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteUtilityCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS utility_cache (\
               key_hash TEXT PRIMARY KEY,\
               subject_key TEXT NOT NULL,\
               subject_kind TEXT NOT NULL,\
               subject_name TEXT NOT NULL,\
               judge_model TEXT NOT NULL,\
               fingerprint TEXT NOT NULL,\
               n_items INTEGER NOT NULL,\
               converged INTEGER NOT NULL,\
               payload TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );\
             CREATE INDEX IF NOT EXISTS utility_cache_subject ON utility_cache(subject_key);\
             CREATE INDEX IF NOT EXISTS utility_cache_fingerprint ON utility_cache(fingerprint);",
        )?;
        ensure_column(&conn, "run_id", "TEXT")?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("STANCE_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".stance_utility_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError> + Send + 'static,
        R: Send + 'static,
    {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || cache.with_conn(f))
            .await
            .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn ensure_column(conn: &Connection, name: &str, spec: &str) -> Result<(), CacheError> {
    let mut stmt = conn.prepare("PRAGMA table_info(utility_cache)")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let col_name: String = row.get(1)?;
        if col_name == name {
            return Ok(());
        }
    }
    let sql = format!("ALTER TABLE utility_cache ADD COLUMN {name} {spec}");
    conn.execute(&sql, [])?;
    Ok(())
}

fn decode_payload(payload: &str) -> Result<CacheEntry, CacheError> {
    let entry: CacheEntry =
        serde_json::from_str(payload).map_err(|e| CacheError::Serde(e.to_string()))?;
    entry.validate()?;
    Ok(entry)
}

#[async_trait]
impl UtilityCache for SqliteUtilityCache {
    async fn lookup(&self, key: &UtilityCacheKey) -> Result<CacheLookup, CacheError> {
        let key = key.clone();
        self.blocking(move |conn| {
            let payload: Option<String> = {
                let mut stmt =
                    conn.prepare("SELECT payload FROM utility_cache WHERE key_hash = ?1")?;
                let mut rows = stmt.query(params![key.key_hash])?;
                match rows.next()? {
                    Some(row) => Some(row.get(0)?),
                    None => None,
                }
            };
            if let Some(payload) = payload {
                let entry = decode_payload(&payload)?;
                conn.execute(
                    "UPDATE utility_cache SET hit_count = hit_count + 1 WHERE key_hash = ?1",
                    params![key.key_hash],
                )?;
                return Ok(CacheLookup::Hit(entry));
            }

            let mut stmt = conn.prepare(
                "SELECT DISTINCT fingerprint FROM utility_cache \
                 WHERE subject_key = ?1 ORDER BY fingerprint",
            )?;
            let stored_fingerprints = stmt
                .query_map(params![key.subject_key], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            if stored_fingerprints.is_empty() {
                Ok(CacheLookup::Miss)
            } else {
                Ok(CacheLookup::Mismatch {
                    stored_fingerprints,
                })
            }
        })
        .await
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        entry.validate()?;
        let entry = entry.clone();
        let payload = serde_json::to_string(&entry).map_err(|e| CacheError::Serde(e.to_string()))?;
        self.blocking(move |conn| {
            let key = entry.key();
            let now = now_epoch();
            conn.execute(
                "INSERT INTO utility_cache (\
                    key_hash, subject_key, subject_kind, subject_name, judge_model,\
                    fingerprint, n_items, converged, payload, run_id, created_at, updated_at\
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)\
                 ON CONFLICT(key_hash) DO UPDATE SET\
                    converged = excluded.converged,\
                    payload = excluded.payload,\
                    run_id = excluded.run_id,\
                    updated_at = excluded.updated_at",
                params![
                    key.key_hash,
                    entry.subject_key,
                    entry.subject_kind.as_str(),
                    entry.subject_name,
                    entry.judge_model,
                    entry.fingerprint,
                    entry.item_ids.len() as i64,
                    if entry.converged { 1 } else { 0 },
                    payload,
                    entry.run_id.map(|id| id.to_string()),
                    now,
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn invalidate(&self, subject_key: &str) -> Result<usize, CacheError> {
        let subject_key = subject_key.to_string();
        self.blocking(move |conn| {
            Ok(conn.execute(
                "DELETE FROM utility_cache WHERE subject_key = ?1",
                params![subject_key],
            )?)
        })
        .await
    }

    async fn entries_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<CacheEntry>, CacheError> {
        let fingerprint = fingerprint.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM utility_cache WHERE fingerprint = ?1 ORDER BY subject_key",
            )?;
            let payloads = stmt
                .query_map(params![fingerprint], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            payloads.iter().map(|p| decode_payload(p)).collect()
        })
        .await
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

/// Summary row for listing and JSONL export.
#[derive(Debug, Clone, Serialize)]
pub struct CacheListRow {
    pub key_hash: String,
    pub subject_key: String,
    pub subject_kind: String,
    pub subject_name: String,
    pub judge_model: String,
    pub fingerprint: String,
    pub n_items: i64,
    pub converged: bool,
    pub run_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Serialize)]
struct CacheExportRow {
    #[serde(flatten)]
    summary: CacheListRow,
    entry: CacheEntry,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

const LIST_COLUMNS: &str = "key_hash, subject_key, subject_kind, subject_name, judge_model, \
     fingerprint, n_items, converged, run_id, created_at, updated_at, hit_count, payload";

fn list_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(CacheListRow, String)> {
    Ok((
        CacheListRow {
            key_hash: row.get(0)?,
            subject_key: row.get(1)?,
            subject_kind: row.get(2)?,
            subject_name: row.get(3)?,
            judge_model: row.get(4)?,
            fingerprint: row.get(5)?,
            n_items: row.get(6)?,
            converged: row.get::<_, i64>(7)? != 0,
            run_id: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            hit_count: row.get(11)?,
        },
        row.get(12)?,
    ))
}

impl SqliteUtilityCache {
    /// Summary rows, optionally restricted to one item set, ordered by subject key.
    pub async fn list(&self, fingerprint: Option<&str>) -> Result<Vec<CacheListRow>, CacheError> {
        let fingerprint = fingerprint.map(str::to_string);
        self.blocking(move |conn| {
            let rows = match &fingerprint {
                Some(fp) => {
                    let sql = format!(
                        "SELECT {LIST_COLUMNS} FROM utility_cache WHERE fingerprint = ?1 ORDER BY subject_key"
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params![fp], list_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let sql = format!(
                        "SELECT {LIST_COLUMNS} FROM utility_cache ORDER BY fingerprint, subject_key"
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt
                        .query_map([], list_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(rows.into_iter().map(|(summary, _)| summary).collect())
        })
        .await
    }

    /// Write every entry, with its summary columns, as one JSON line.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            let sql = format!("SELECT {LIST_COLUMNS} FROM utility_cache ORDER BY updated_at DESC");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            let mut written = 0;
            while let Some(row) = rows.next()? {
                let (summary, payload) = list_row(row)?;
                let record = CacheExportRow {
                    summary,
                    entry: decode_payload(&payload)?,
                };
                let line = serde_json::to_string(&record)
                    .map_err(|e| CacheError::Serde(e.to_string()))?;
                use std::io::Write;
                writeln!(file, "{line}")?;
                written += 1;
            }
            use std::io::Write;
            file.flush()?;
            Ok(written)
        })
        .await
    }

    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        self.blocking(move |conn| {
            let mut deleted: usize = 0;
            if let Some(days) = max_age_days {
                let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                let removed = conn.execute(
                    "DELETE FROM utility_cache WHERE updated_at < ?1",
                    params![cutoff],
                )?;
                deleted = deleted.saturating_add(removed);
            }

            if let Some(max_rows) = max_rows {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM utility_cache", [], |row| row.get(0))?;
                let keep = max_rows as i64;
                if count > keep {
                    let removed = conn.execute(
                        "DELETE FROM utility_cache WHERE key_hash IN (\
                            SELECT key_hash FROM utility_cache \
                            ORDER BY updated_at DESC LIMIT -1 OFFSET ?1\
                         )",
                        params![keep],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }
            }

            let remaining: i64 =
                conn.query_row("SELECT COUNT(*) FROM utility_cache", [], |row| row.get(0))?;
            Ok(CachePruneStats {
                deleted,
                remaining: remaining.max(0) as usize,
            })
        })
        .await
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local cache for tests and runs without a database.
#[derive(Debug, Default)]
pub struct MemoryUtilityCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryUtilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>, CacheError> {
        self.entries.lock().map_err(|_| CacheError::Poisoned)
    }
}

#[async_trait]
impl UtilityCache for MemoryUtilityCache {
    async fn lookup(&self, key: &UtilityCacheKey) -> Result<CacheLookup, CacheError> {
        let entries = self.guard()?;
        if let Some(entry) = entries.get(&key.key_hash) {
            return Ok(CacheLookup::Hit(entry.clone()));
        }
        let mut stored_fingerprints: Vec<String> = entries
            .values()
            .filter(|e| e.subject_key == key.subject_key)
            .map(|e| e.fingerprint.clone())
            .collect();
        stored_fingerprints.sort();
        stored_fingerprints.dedup();
        if stored_fingerprints.is_empty() {
            Ok(CacheLookup::Miss)
        } else {
            Ok(CacheLookup::Mismatch {
                stored_fingerprints,
            })
        }
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        entry.validate()?;
        self.guard()?.insert(entry.key().key_hash, entry.clone());
        Ok(())
    }

    async fn invalidate(&self, subject_key: &str) -> Result<usize, CacheError> {
        let mut entries = self.guard()?;
        let before = entries.len();
        entries.retain(|_, e| e.subject_key != subject_key);
        Ok(before - entries.len())
    }

    async fn entries_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<CacheEntry>, CacheError> {
        let mut found: Vec<CacheEntry> = self
            .guard()?
            .values()
            .filter(|e| e.fingerprint == fingerprint)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.subject_key.cmp(&b.subject_key));
        Ok(found)
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
