//! Durable storage for the Custodian device agent.
//!
//! The engine needs two shapes of persistence:
//! - single keyed records written atomically (identity copies, the lock state)
//! - ordered append logs of records addressed by id (the delivery backlog)
//!
//! [`DurableStore`] captures exactly that contract. [`SqliteStore`] is the
//! on-device implementation; [`MemoryStore`] backs tests and can be told to
//! fail so partial-failure paths can be exercised.
//!
//! Values are opaque bytes. Callers own their encoding (JSON everywhere in
//! this workspace), see [`get_json`] and [`set_json`].

mod error;
mod memory;
mod sqlite;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// One record of an append log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position in the log; strictly increasing in append order.
    pub seq: u64,
    /// Caller-chosen id, unique within the log.
    pub record_id: String,
    pub value: Vec<u8>,
}

/// Minimal key-value plus append-log persistence.
///
/// Every write is atomic per key (or per log record).
pub trait DurableStore: Send + Sync {
    /// Reads a keyed value.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Writes a keyed value, replacing any previous one.
    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Deletes a keyed value. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Appends a record to a log.
    ///
    /// Returns `false` without modifying anything if a record with the same
    /// id is already present in that log.
    fn append_to_log(&self, log: &str, record_id: &str, value: &[u8]) -> StorageResult<bool>;

    /// Lists every record of a log, oldest first.
    fn list_log(&self, log: &str) -> StorageResult<Vec<LogEntry>>;

    /// Replaces the value of an existing log record in place, keeping its
    /// position. Returns `false` if the record does not exist.
    fn update_log(&self, log: &str, record_id: &str, value: &[u8]) -> StorageResult<bool>;

    /// Deletes a log record. Returns whether a record was removed.
    fn delete_from_log(&self, log: &str, record_id: &str) -> StorageResult<bool>;
}

/// Reads and decodes a JSON value stored under `key`.
pub fn get_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> StorageResult<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encodes `value` as JSON and stores it under `key`.
pub fn set_json<T: Serialize>(store: &dyn DurableStore, key: &str, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, &bytes)
}
