//! redb storage engine implementation.
//!
//! The primary [`KvStore`](super::KvStore) backend, built on
//! [redb](https://docs.rs/redb), a pure Rust embedded key-value store with
//! ACID transactions.
//!
//! Two tables are kept: the value table and a write-stamp table recording
//! the last write time per key. The stamps feed the mark-and-sweep
//! collector's age cutoff.
//!
//! Asynchronous chunk writes go through a single background writer thread,
//! so queue order equals commit-to-disk order; [`PendingWrite`] handles
//! resolve once the transaction holding the write has committed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use ::redb::{Database, ReadableTable, TableDefinition};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{KvStore, PendingWrite};
use crate::config::StoreConfig;
use crate::error::{Result, StorageError};
use crate::types::Timestamp;

/// Value table: raw key bytes → raw value bytes.
const KV_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("proximum_kv");

/// Stamp table: raw key bytes → last-write millis.
const STAMP_TABLE: TableDefinition<&[u8], i64> = TableDefinition::new("proximum_stamps");

enum WriteJob {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        done: Sender<std::result::Result<(), StorageError>>,
    },
    Flush {
        done: Sender<std::result::Result<(), StorageError>>,
    },
    Shutdown,
}

/// redb-backed key/value store with a background writer.
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
    writer_tx: Sender<WriteJob>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("path", &self.path)
            .finish()
    }
}

impl RedbStore {
    /// Opens or creates a store at the path resolved from `config`.
    #[instrument(skip(config), fields(store_id = %config.id))]
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.resolved_path();
        let existed = path.exists();
        debug!(path = %path.display(), existed, "Opening KV store");

        let db = Database::builder().create(&path).map_err(|e| {
            if e.to_string().contains("lock") {
                StorageError::Locked
            } else {
                StorageError::Redb(e.to_string())
            }
        })?;
        let db = Arc::new(db);

        // Make sure the tables exist before any reader touches them.
        let txn = db.begin_write().map_err(StorageError::from)?;
        {
            let _ = txn.open_table(KV_TABLE)?;
            let _ = txn.open_table(STAMP_TABLE)?;
        }
        txn.commit().map_err(StorageError::from)?;

        let (writer_tx, writer_rx) = crossbeam_channel::unbounded();
        let writer_db = Arc::clone(&db);
        let writer = std::thread::Builder::new()
            .name("proximum-kv-writer".to_string())
            .spawn(move || Self::writer_loop(writer_db, writer_rx))
            .map_err(|e| StorageError::Redb(format!("Failed to spawn writer: {}", e)))?;

        info!(path = %path.display(), existed, "KV store ready");

        Ok(Self {
            db,
            path,
            writer_tx,
            writer: Mutex::new(Some(writer)),
        })
    }

    fn writer_loop(db: Arc<Database>, rx: Receiver<WriteJob>) {
        while let Ok(job) = rx.recv() {
            match job {
                WriteJob::Put { key, value, done } => {
                    let result = Self::write_one(&db, &key, &value);
                    if let Err(e) = &result {
                        warn!(error = %e, "Background KV write failed");
                    }
                    let _ = done.send(result);
                }
                WriteJob::Flush { done } => {
                    // Reaching this job means every queued put before it
                    // has committed; nothing else to force.
                    let _ = done.send(Ok(()));
                }
                WriteJob::Shutdown => break,
            }
        }
    }

    fn write_one(
        db: &Database,
        key: &[u8],
        value: &[u8],
    ) -> std::result::Result<(), StorageError> {
        let txn = db.begin_write()?;
        {
            let mut kv = txn.open_table(KV_TABLE)?;
            kv.insert(key, value)?;
            let mut stamps = txn.open_table(STAMP_TABLE)?;
            stamps.insert(key, Timestamp::now().as_millis())?;
        }
        txn.commit()?;
        Ok(())
    }
}

impl KvStore for RedbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(StorageError::from)?;
        let table = txn.open_table(KV_TABLE).map_err(StorageError::from)?;
        let value = table
            .get(key)
            .map_err(StorageError::from)?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Self::write_one(&self.db, key, value).map_err(Into::into)
    }

    fn put_async(&self, key: Vec<u8>, value: Vec<u8>) -> PendingWrite {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let job = WriteJob::Put {
            key,
            value,
            done: done_tx,
        };
        if self.writer_tx.send(job).is_err() {
            return PendingWrite::ready(Err(StorageError::WriterGone));
        }
        PendingWrite::new(done_rx)
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        let txn = self.db.begin_write().map_err(StorageError::from)?;
        let existed;
        {
            let mut kv = txn.open_table(KV_TABLE).map_err(StorageError::from)?;
            existed = kv.remove(key).map_err(StorageError::from)?.is_some();
            let mut stamps = txn.open_table(STAMP_TABLE).map_err(StorageError::from)?;
            stamps.remove(key).map_err(StorageError::from)?;
        }
        txn.commit().map_err(StorageError::from)?;
        Ok(existed)
    }

    fn delete_batch(&self, keys: &[Vec<u8>]) -> Result<usize> {
        let txn = self.db.begin_write().map_err(StorageError::from)?;
        let mut removed = 0;
        {
            let mut kv = txn.open_table(KV_TABLE).map_err(StorageError::from)?;
            let mut stamps = txn.open_table(STAMP_TABLE).map_err(StorageError::from)?;
            for key in keys {
                if kv.remove(key.as_slice()).map_err(StorageError::from)?.is_some() {
                    removed += 1;
                }
                stamps.remove(key.as_slice()).map_err(StorageError::from)?;
            }
        }
        txn.commit().map_err(StorageError::from)?;
        Ok(removed)
    }

    fn list_keys(&self) -> Result<Vec<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(StorageError::from)?;
        let table = txn.open_table(KV_TABLE).map_err(StorageError::from)?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(StorageError::from)? {
            let (key, _) = entry.map_err(StorageError::from)?;
            keys.push(key.value().to_vec());
        }
        Ok(keys)
    }

    fn write_stamp(&self, key: &[u8]) -> Result<Option<Timestamp>> {
        let txn = self.db.begin_read().map_err(StorageError::from)?;
        let table = txn.open_table(STAMP_TABLE).map_err(StorageError::from)?;
        let stamp = table
            .get(key)
            .map_err(StorageError::from)?
            .map(|guard| Timestamp::from_millis(guard.value()));
        Ok(stamp)
    }

    fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.writer_tx
            .send(WriteJob::Flush { done: done_tx })
            .map_err(|_| StorageError::WriterGone)?;
        done_rx
            .recv()
            .map_err(|_| StorageError::WriterGone)?
            .map_err(Into::into)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

impl Drop for RedbStore {
    fn drop(&mut self) {
        let _ = self.writer_tx.send(WriteJob::Shutdown);
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
    }
}
