//! Storage layer abstractions for Proximum.
//!
//! This module provides a capability trait over the durable key/value
//! store. The primary implementation is [`RedbStore`]; alternative
//! backends (in-memory, remote) can implement [`KvStore`] for testing or
//! deployment variety.
//!
//! Chunk writes are asynchronous: [`KvStore::put_async`] hands the payload
//! to a background writer and returns a [`PendingWrite`] completion handle.
//! `sync` collects the handles issued up to its flush point and awaits
//! them before advancing the branch head; appends after the flush point
//! belong to the next commit.

pub mod pss;
pub mod redb;
pub mod schema;

pub use self::redb::RedbStore;
pub use pss::PersistentSet;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::error::{Result, StorageError};
use crate::types::Timestamp;

/// Completion handle for an asynchronous KV write.
///
/// Dropping the handle without waiting is allowed; the write still
/// completes in the background.
#[derive(Debug)]
pub struct PendingWrite {
    rx: Receiver<std::result::Result<(), StorageError>>,
}

impl PendingWrite {
    /// Wraps a completion channel.
    pub(crate) fn new(rx: Receiver<std::result::Result<(), StorageError>>) -> Self {
        Self { rx }
    }

    /// Creates an already-resolved handle (used by synchronous fallbacks).
    pub(crate) fn ready(result: std::result::Result<(), StorageError>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }

    /// Blocks until the write completes, returning its outcome.
    pub fn wait(self) -> Result<()> {
        match self.rx.recv() {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(StorageError::WriterGone.into()),
        }
    }
}

/// Durable key/value store capability.
///
/// Implementations must be `Send + Sync`; a store is shared across all
/// index values of a lineage and relied on for its own durability and
/// concurrency guarantees.
pub trait KvStore: Send + Sync + fmt::Debug {
    /// Reads a value by key. Returns `None` when absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Writes a value synchronously.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Queues a write on the background writer.
    ///
    /// Writes queued from one thread complete in queue order, which keeps
    /// vector chunk serialization aligned with append order.
    fn put_async(&self, key: Vec<u8>, value: Vec<u8>) -> PendingWrite;

    /// Deletes a key. Returns `true` if it existed.
    fn delete(&self, key: &[u8]) -> Result<bool>;

    /// Deletes a batch of keys in one transaction. Returns the number
    /// of keys that existed.
    fn delete_batch(&self, keys: &[Vec<u8>]) -> Result<usize>;

    /// Lists every key in the store. Used by the mark-and-sweep collector.
    fn list_keys(&self) -> Result<Vec<Vec<u8>>>;

    /// Returns the last-write timestamp recorded for a key.
    fn write_stamp(&self, key: &[u8]) -> Result<Option<Timestamp>>;

    /// Blocks until all queued writes are durable.
    fn flush(&self) -> Result<()>;

    /// Path of the backing file, if the store has one.
    fn path(&self) -> Option<&Path>;
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<RedbStore>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<RedbStore>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Opens the default store backend for the given config.
///
/// Stores are registered per path: all index values of a lineage (and
/// every branch loaded from the same store) share one handle, since the
/// backing engine allows a single open database per file.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    let path = config.resolved_path();
    let mut open = registry().lock();
    if let Some(existing) = open.get(&path).and_then(Weak::upgrade) {
        return Ok(existing);
    }
    let store = Arc::new(RedbStore::open(config)?);
    open.insert(path, Arc::downgrade(&store));
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[test]
    fn test_open_store() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::at(Uuid::new_v4(), dir.path().join("kv.redb"));
        let store = open_store(&config).unwrap();
        assert!(store.path().is_some());
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn test_store_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RedbStore>();
    }

    #[test]
    fn test_ready_pending_write_resolves() {
        PendingWrite::ready(Ok(())).wait().unwrap();
        assert!(PendingWrite::ready(Err(StorageError::Locked)).wait().is_err());
    }
}
