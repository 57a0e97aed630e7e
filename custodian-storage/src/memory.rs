//! In-memory durable store for tests.
//!
//! Behaves like [`SqliteStore`](crate::SqliteStore) but can be switched into
//! failure modes to simulate an unreachable or read-only storage location.

use crate::{DurableStore, LogEntry, StorageError, StorageResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    kv: HashMap<String, Vec<u8>>,
    logs: HashMap<String, Vec<LogEntry>>,
    next_seq: u64,
}

/// Volatile [`DurableStore`] with fault injection.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
    read_only: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every operation fails with [`StorageError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// When set, reads succeed but writes fail.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn read(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store offline".into()));
        }
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }

    fn write(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store is read-only".into()));
        }
        self.read()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.read()?.kv.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.write()?.kv.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.write()?.kv.remove(key);
        Ok(())
    }

    fn append_to_log(&self, log: &str, record_id: &str, value: &[u8]) -> StorageResult<bool> {
        let mut inner = self.write()?;
        let exists = inner
            .logs
            .get(log)
            .is_some_and(|entries| entries.iter().any(|e| e.record_id == record_id));
        if exists {
            return Ok(false);
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.logs.entry(log.to_string()).or_default().push(LogEntry {
            seq,
            record_id: record_id.to_string(),
            value: value.to_vec(),
        });
        Ok(true)
    }

    fn list_log(&self, log: &str) -> StorageResult<Vec<LogEntry>> {
        Ok(self.read()?.logs.get(log).cloned().unwrap_or_default())
    }

    fn update_log(&self, log: &str, record_id: &str, value: &[u8]) -> StorageResult<bool> {
        let mut inner = self.write()?;
        let entry = inner
            .logs
            .get_mut(log)
            .and_then(|entries| entries.iter_mut().find(|e| e.record_id == record_id));
        match entry {
            Some(entry) => {
                entry.value = value.to_vec();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_from_log(&self, log: &str, record_id: &str) -> StorageResult<bool> {
        let mut inner = self.write()?;
        let Some(entries) = inner.logs.get_mut(log) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|e| e.record_id != record_id);
        Ok(entries.len() != before)
    }
}
