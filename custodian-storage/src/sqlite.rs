//! SQLite-backed durable store.
//!
//! One database file holds both keyed records and append logs. Each public
//! operation is a single statement, so every write is atomic on its own.

use crate::{DurableStore, LogEntry, StorageError, StorageResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default time a statement waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable store backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens a store with an explicit lock-wait timeout.
    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS log_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                log TEXT NOT NULL,
                record_id TEXT NOT NULL,
                value BLOB NOT NULL,
                UNIQUE(log, record_id)
            );

            CREATE INDEX IF NOT EXISTS idx_log_records_log ON log_records(log, seq);
            ",
        )?;
        Ok(())
    }
}

impl DurableStore for SqliteStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn append_to_log(&self, log: &str, record_id: &str, value: &[u8]) -> StorageResult<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO log_records (log, record_id, value) VALUES (?1, ?2, ?3)",
            params![log, record_id, value],
        )?;
        Ok(inserted > 0)
    }

    fn list_log(&self, log: &str) -> StorageResult<Vec<LogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq, record_id, value FROM log_records WHERE log = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![log], |row| {
            let seq: i64 = row.get(0)?;
            Ok(LogEntry {
                seq: seq as u64,
                record_id: row.get(1)?,
                value: row.get(2)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn update_log(&self, log: &str, record_id: &str, value: &[u8]) -> StorageResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE log_records SET value = ?3 WHERE log = ?1 AND record_id = ?2",
            params![log, record_id, value],
        )?;
        Ok(changed > 0)
    }

    fn delete_from_log(&self, log: &str, record_id: &str) -> StorageResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM log_records WHERE log = ?1 AND record_id = ?2",
            params![log, record_id],
        )?;
        Ok(changed > 0)
    }
}
