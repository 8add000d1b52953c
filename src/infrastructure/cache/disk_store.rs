//! Persistent key/blob store: SQLite metadata with small payloads inline and
//! large payloads as content-addressed files.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::domain::entities::CacheKey;
use crate::domain::errors::{StorageError, StorageResult};

const DATABASE_FILE_NAME: &str = "tiercache.sqlite";
const DATA_DIR_NAME: &str = "Data";
const TRIM_BATCH: i64 = 16;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS storage_item (
        key TEXT PRIMARY KEY,
        filename TEXT,
        data BLOB,
        size INTEGER NOT NULL,
        last_access_time REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS last_access_time_index ON storage_item(last_access_time);";

/// Settings for a [`DiskStore`]. `MAX` limits mean unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskStoreConfig {
    /// Payloads up to this many bytes are kept inside the database.
    pub inline_threshold: u64,
    /// Total payload size limit enforced by the periodic trim.
    pub cost_limit: u64,
    /// Entry count limit enforced by the periodic trim.
    pub count_limit: u64,
    /// Maximum time since last access enforced by the periodic trim.
    pub age_limit: Duration,
    /// Interval of the periodic trim.
    pub auto_trim_interval: Duration,
}

impl Default for DiskStoreConfig {
    fn default() -> Self {
        Self {
            inline_threshold: 20 * 1024,
            cost_limit: u64::MAX,
            count_limit: u64::MAX,
            age_limit: Duration::MAX,
            auto_trim_interval: Duration::from_secs(60),
        }
    }
}

struct Db {
    conn: Connection,
    last_stamp: f64,
}

impl Db {
    /// Wall-clock seconds, strictly increasing across calls so access order
    /// is total even within one clock tick.
    #[allow(clippy::cast_precision_loss)]
    fn stamp(&mut self) -> f64 {
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let next = if now > self.last_stamp {
            now
        } else {
            self.last_stamp + 0.000_001
        };
        self.last_stamp = next;
        next
    }
}

struct TrimCandidate {
    key: String,
    filename: Option<String>,
    size: u64,
}

/// Disk tier. Every operation is serialized through one connection lock.
pub struct DiskStore {
    db: Mutex<Db>,
    root: PathBuf,
    data_dir: PathBuf,
    config: DiskStoreConfig,
}

impl DiskStore {
    /// Opens or creates a store under `root`.
    ///
    /// # Errors
    /// Returns `StorageError::Unavailable` if the directories or the database
    /// cannot be created.
    pub fn open(root: impl Into<PathBuf>, config: DiskStoreConfig) -> StorageResult<Self> {
        let root = root.into();
        let data_dir = root.join(DATA_DIR_NAME);
        let unavailable =
            |message: String| StorageError::unavailable(root.display().to_string(), message);

        fs::create_dir_all(&data_dir)
            .map_err(|e| unavailable(format!("failed to create data dir: {e}")))?;

        let conn = Connection::open(root.join(DATABASE_FILE_NAME))
            .map_err(|e| unavailable(format!("failed to open database: {e}")))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| unavailable(format!("failed to enable WAL: {e}")))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| unavailable(format!("failed to set synchronous mode: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| unavailable(format!("failed to create schema: {e}")))?;

        info!(path = %root.display(), "disk store opened");
        Ok(Self {
            db: Mutex::new(Db {
                conn,
                last_stamp: 0.0,
            }),
            root,
            data_dir,
            config,
        })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Settings the store was opened with.
    #[must_use]
    pub fn config(&self) -> &DiskStoreConfig {
        &self.config
    }

    fn file_path(&self, filename: &str) -> PathBuf {
        self.data_dir.join(filename)
    }

    fn remove_file(&self, filename: &str) {
        if let Err(e) = fs::remove_file(self.file_path(filename))
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(filename, error = %e, "failed to remove cache file");
        }
    }

    /// Returns the payload for `key` and refreshes its access time.
    ///
    /// # Errors
    /// Returns an error if the database cannot be queried.
    pub fn get(&self, key: &CacheKey) -> StorageResult<Option<Vec<u8>>> {
        if key.is_empty() {
            return Ok(None);
        }
        let mut db = self.db.lock();
        let row: Option<(Option<String>, Option<Vec<u8>>)> = db
            .conn
            .query_row(
                "SELECT filename, data FROM storage_item WHERE key = ?1",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let data = match row {
            Some((_, Some(blob))) if !blob.is_empty() => Some(blob),
            Some((Some(filename), _)) => match fs::read(self.file_path(&filename)) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(key = %key, filename = %filename, error = %e, "cache file unreadable");
                    None
                }
            },
            Some((None, _)) => Some(Vec::new()),
            None => None,
        };

        if data.is_some() {
            let stamp = db.stamp();
            db.conn.execute(
                "UPDATE storage_item SET last_access_time = ?1 WHERE key = ?2",
                params![stamp, key.as_str()],
            )?;
            trace!(key = %key, "disk store hit");
        } else {
            trace!(key = %key, "disk store miss");
        }
        Ok(data)
    }

    /// Returns true if `key` has a row.
    ///
    /// # Errors
    /// Returns an error if the database cannot be queried.
    pub fn exists(&self, key: &CacheKey) -> StorageResult<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let db = self.db.lock();
        let count: i64 = db.conn.query_row(
            "SELECT count(*) FROM storage_item WHERE key = ?1",
            params![key.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Stores `data` under `key`, replacing any previous entry. Payloads above
    /// the inline threshold are written to a file named after the key.
    ///
    /// # Errors
    /// Returns an error if the file or the row cannot be written.
    pub fn put(&self, key: &CacheKey, data: &[u8]) -> StorageResult<()> {
        if key.is_empty() {
            return Ok(());
        }
        let size = data.len() as u64;
        let mut db = self.db.lock();

        let previous: Option<Option<String>> = db
            .conn
            .query_row(
                "SELECT filename FROM storage_item WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let stamp = db.stamp();
        let stored_size = i64::try_from(size).unwrap_or(i64::MAX);
        if size > self.config.inline_threshold {
            let filename = key.file_name();
            self.write_file(&filename, data)?;
            let inserted = db.conn.execute(
                "INSERT OR REPLACE INTO storage_item (key, filename, data, size, last_access_time)
                 VALUES (?1, ?2, NULL, ?3, ?4)",
                params![key.as_str(), filename, stored_size, stamp],
            );
            if let Err(e) = inserted {
                // A surviving row for this key still points at the file.
                if previous.flatten().as_deref() != Some(filename.as_str()) {
                    self.remove_file(&filename);
                }
                return Err(e.into());
            }
        } else {
            db.conn.execute(
                "INSERT OR REPLACE INTO storage_item (key, filename, data, size, last_access_time)
                 VALUES (?1, NULL, ?2, ?3, ?4)",
                params![key.as_str(), data, stored_size, stamp],
            )?;
            if let Some(Some(old_file)) = previous {
                self.remove_file(&old_file);
            }
        }
        debug!(key = %key, size, "disk store stored");
        Ok(())
    }

    fn write_file(&self, filename: &str, data: &[u8]) -> StorageResult<()> {
        let mut temp_file = tempfile::NamedTempFile::new_in(&self.data_dir)?;
        temp_file.write_all(data)?;
        temp_file
            .persist(self.file_path(filename))
            .map_err(|e| e.error)?;
        Ok(())
    }

    /// Removes `key` and its file.
    ///
    /// # Errors
    /// Returns an error if the database cannot be updated.
    pub fn remove(&self, key: &CacheKey) -> StorageResult<()> {
        if key.is_empty() {
            return Ok(());
        }
        let db = self.db.lock();
        self.remove_locked(&db, key.as_str())
    }

    fn remove_locked(&self, db: &Db, key: &str) -> StorageResult<()> {
        let filename: Option<Option<String>> = db
            .conn
            .query_row(
                "SELECT filename FROM storage_item WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(Some(filename)) = filename {
            self.remove_file(&filename);
        }
        db.conn
            .execute("DELETE FROM storage_item WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Removes every row and every file.
    ///
    /// # Errors
    /// Returns an error if the database cannot be updated.
    pub fn clear(&self) -> StorageResult<()> {
        let db = self.db.lock();
        db.conn.execute("DELETE FROM storage_item", [])?;
        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = removed {
                warn!(path = %path.display(), error = %e, "failed to remove cache file");
            }
        }
        info!(path = %self.root.display(), "disk store cleared");
        Ok(())
    }

    /// Sum of stored payload sizes.
    ///
    /// # Errors
    /// Returns an error if the database cannot be queried.
    pub fn total_size(&self) -> StorageResult<u64> {
        let db = self.db.lock();
        Self::total_size_locked(&db)
    }

    #[allow(clippy::cast_sign_loss)]
    fn total_size_locked(db: &Db) -> StorageResult<u64> {
        let size: Option<i64> =
            db.conn
                .query_row("SELECT sum(size) FROM storage_item", [], |row| row.get(0))?;
        Ok(size.unwrap_or(0).max(0) as u64)
    }

    /// Number of stored entries.
    ///
    /// # Errors
    /// Returns an error if the database cannot be queried.
    pub fn total_count(&self) -> StorageResult<u64> {
        let db = self.db.lock();
        Self::total_count_locked(&db)
    }

    #[allow(clippy::cast_sign_loss)]
    fn total_count_locked(db: &Db) -> StorageResult<u64> {
        let count: i64 = db
            .conn
            .query_row("SELECT count(*) FROM storage_item", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    #[allow(clippy::cast_sign_loss)]
    fn trim_candidates(db: &Db) -> StorageResult<Vec<TrimCandidate>> {
        let mut stmt = db.conn.prepare_cached(
            "SELECT key, filename, size FROM storage_item ORDER BY last_access_time LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![TRIM_BATCH], |row| {
            Ok(TrimCandidate {
                key: row.get(0)?,
                filename: row.get(1)?,
                size: row.get::<_, i64>(2)?.max(0) as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn remove_candidate(&self, db: &Db, candidate: &TrimCandidate) -> StorageResult<()> {
        if let Some(filename) = &candidate.filename {
            self.remove_file(filename);
        }
        db.conn.execute(
            "DELETE FROM storage_item WHERE key = ?1",
            params![candidate.key],
        )?;
        trace!(key = %candidate.key, "disk store evicted");
        Ok(())
    }

    /// Removes least recently accessed entries until the total payload size
    /// is at most `limit`. A limit of 0 clears the store.
    ///
    /// # Errors
    /// Returns an error if the database cannot be updated.
    pub fn trim_to_cost(&self, limit: u64) -> StorageResult<()> {
        if limit == u64::MAX {
            return Ok(());
        }
        if limit == 0 {
            return self.clear();
        }
        let db = self.db.lock();
        let mut total = Self::total_size_locked(&db)?;
        while total > limit {
            let candidates = Self::trim_candidates(&db)?;
            if candidates.is_empty() {
                break;
            }
            for candidate in &candidates {
                if total <= limit {
                    break;
                }
                self.remove_candidate(&db, candidate)?;
                total = total.saturating_sub(candidate.size);
            }
        }
        Ok(())
    }

    /// Removes least recently accessed entries until at most `limit` remain.
    /// A limit of 0 clears the store.
    ///
    /// # Errors
    /// Returns an error if the database cannot be updated.
    pub fn trim_to_count(&self, limit: u64) -> StorageResult<()> {
        if limit == u64::MAX {
            return Ok(());
        }
        if limit == 0 {
            return self.clear();
        }
        let db = self.db.lock();
        let mut total = Self::total_count_locked(&db)?;
        while total > limit {
            let candidates = Self::trim_candidates(&db)?;
            if candidates.is_empty() {
                break;
            }
            for candidate in &candidates {
                if total <= limit {
                    break;
                }
                self.remove_candidate(&db, candidate)?;
                total -= 1;
            }
        }
        Ok(())
    }

    /// Removes entries not accessed within `limit`. A zero limit clears the
    /// store.
    ///
    /// # Errors
    /// Returns an error if the database cannot be updated.
    pub fn trim_to_age(&self, limit: Duration) -> StorageResult<()> {
        if limit == Duration::MAX {
            return Ok(());
        }
        if limit.is_zero() {
            return self.clear();
        }
        let mut db = self.db.lock();
        let cutoff = db.stamp() - limit.as_secs_f64();

        let filenames: Vec<String> = {
            let mut stmt = db.conn.prepare_cached(
                "SELECT filename FROM storage_item
                 WHERE last_access_time < ?1 AND filename IS NOT NULL",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for filename in &filenames {
            self.remove_file(filename);
        }
        let removed = db.conn.execute(
            "DELETE FROM storage_item WHERE last_access_time < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            debug!(removed, "disk store trimmed by age");
        }
        Ok(())
    }

    /// Enforces the configured cost, count and age limits.
    ///
    /// # Errors
    /// Returns an error if the database cannot be updated.
    pub fn trim_to_limits(&self) -> StorageResult<()> {
        self.trim_to_cost(self.config.cost_limit)?;
        self.trim_to_count(self.config.count_limit)?;
        self.trim_to_age(self.config.age_limit)
    }

    /// Runs [`Self::trim_to_limits`] on the blocking pool every
    /// `auto_trim_interval` until the store is dropped.
    pub fn start_auto_trim(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.auto_trim_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                match tokio::task::spawn_blocking(move || store.trim_to_limits()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "disk auto trim failed"),
                    Err(e) => tracing::error!(error = %e, "disk auto trim task panicked"),
                }
            }
        })
    }
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir, inline_threshold: u64) -> DiskStore {
        DiskStore::open(
            dir.path(),
            DiskStoreConfig {
                inline_threshold,
                ..DiskStoreConfig::default()
            },
        )
        .unwrap()
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s)
    }

    fn files_in(dir: &TempDir) -> usize {
        fs::read_dir(dir.path().join(DATA_DIR_NAME))
            .unwrap()
            .count()
    }

    #[test]
    fn test_put_get_trim_round() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 20 * 1024);
        let payload = vec![7u8; 100];

        store.put(&key("k"), &payload).unwrap();
        assert_eq!(store.get(&key("k")).unwrap(), Some(payload));

        store.trim_to_count(0).unwrap();
        assert!(!store.exists(&key("k")).unwrap());
        assert_eq!(store.total_count().unwrap(), 0);
    }

    #[test]
    fn test_large_payload_goes_to_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 64);

        store.put(&key("small"), &[1u8; 64]).unwrap();
        assert_eq!(files_in(&dir), 0);

        store.put(&key("large"), &[2u8; 65]).unwrap();
        assert_eq!(files_in(&dir), 1);
        assert!(dir
            .path()
            .join(DATA_DIR_NAME)
            .join(key("large").file_name())
            .exists());
        assert_eq!(store.get(&key("large")).unwrap(), Some(vec![2u8; 65]));
        assert_eq!(store.total_size().unwrap(), 129);
    }

    #[test]
    fn test_failed_index_write_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 16);
        store
            .db
            .lock()
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_insert BEFORE INSERT ON storage_item
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        assert!(store.put(&key("k"), &[3u8; 32]).is_err());
        assert_eq!(files_in(&dir), 0);
        assert!(!store.exists(&key("k")).unwrap());
    }

    #[test]
    fn test_replacing_file_with_inline_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 16);

        store.put(&key("k"), &[1u8; 32]).unwrap();
        assert_eq!(files_in(&dir), 1);
        store.put(&key("k"), &[1u8; 8]).unwrap();
        assert_eq!(files_in(&dir), 0);
        assert_eq!(store.get(&key("k")).unwrap(), Some(vec![1u8; 8]));
        assert_eq!(store.total_count().unwrap(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 16);
        store.put(&key("a"), &[1u8; 32]).unwrap();
        store.put(&key("b"), &[1u8; 4]).unwrap();
        store.put(&key("c"), &[1u8; 64]).unwrap();

        store.remove(&key("a")).unwrap();
        assert!(!store.exists(&key("a")).unwrap());
        assert_eq!(files_in(&dir), 1);

        store.clear().unwrap();
        assert_eq!(store.total_count().unwrap(), 0);
        assert_eq!(files_in(&dir), 0);
    }

    #[test]
    fn test_trim_to_cost_drops_least_recently_accessed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 1024);
        for name in ["a", "b", "c", "d"] {
            store.put(&key(name), &[0u8; 10]).unwrap();
        }
        assert!(store.get(&key("a")).unwrap().is_some());

        store.trim_to_cost(25).unwrap();
        assert!(store.exists(&key("a")).unwrap());
        assert!(store.exists(&key("d")).unwrap());
        assert!(!store.exists(&key("b")).unwrap());
        assert!(!store.exists(&key("c")).unwrap());
        assert_eq!(store.total_size().unwrap(), 20);
    }

    #[test]
    fn test_trim_to_count_spans_batches() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 1024);
        for i in 0..40 {
            store.put(&key(&format!("k{i}")), &[0u8; 2]).unwrap();
        }
        store.trim_to_count(5).unwrap();
        assert_eq!(store.total_count().unwrap(), 5);
        assert!(store.exists(&key("k39")).unwrap());
        assert!(!store.exists(&key("k34")).unwrap());
    }

    #[test]
    fn test_trim_to_age() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 8);
        store.put(&key("old"), &[0u8; 16]).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        store.put(&key("new"), &[0u8; 4]).unwrap();

        store.trim_to_age(Duration::from_millis(25)).unwrap();
        assert!(!store.exists(&key("old")).unwrap());
        assert!(store.exists(&key("new")).unwrap());
        assert_eq!(files_in(&dir), 0);
    }

    #[test]
    fn test_unbounded_limits_are_noops() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 8);
        store.put(&key("a"), &[0u8; 4]).unwrap();
        store.trim_to_limits().unwrap();
        assert!(store.exists(&key("a")).unwrap());
    }

    #[test]
    fn test_reopen_keeps_entries() {
        let dir = TempDir::new().unwrap();
        store(&dir, 8).put(&key("a"), &[3u8; 40]).unwrap();
        let reopened = store(&dir, 8);
        assert_eq!(reopened.get(&key("a")).unwrap(), Some(vec![3u8; 40]));
    }

    #[test]
    fn test_open_fails_on_unusable_path() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let result = DiskStore::open(blocker.join("cache"), DiskStoreConfig::default());
        assert!(matches!(result, Err(StorageError::Unavailable { .. })));
    }

    #[test]
    fn test_empty_key_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 8);
        store.put(&key(""), &[1]).unwrap();
        assert_eq!(store.total_count().unwrap(), 0);
        assert_eq!(store.get(&key("")).unwrap(), None);
    }
}
