//! Offline and online compaction.
//!
//! Compaction produces a fresh index holding only live vectors, with the
//! HNSW graph rebuilt by replaying inserts into a new target store.
//! Offline compaction is a synchronous copy. Online compaction wraps the
//! source in a [`CompactionState`]: a background copier moves batches of
//! live vectors while writes keep landing on the source *and* a bounded
//! delta log; `finish` replays the delta onto the target and seals it.
//!
//! Deletes and metadata updates in the delta are replayed by external id.
//! A node that never had an external id cannot be re-identified in the
//! rebuilt target (node ids are store-local), so such operations apply to
//! the source only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use super::{Index, IndexKey, SearchResult};
use crate::config::IndexConfig;
use crate::error::{CompactionError, ProximumError, Result};
use crate::types::{ExternalId, Metadata, MetadataValue, NodeId, EXTERNAL_ID_FIELD};

/// Options for [`Index::start_online_compaction`].
#[derive(Clone, Copy, Debug)]
pub struct CompactionOptions {
    /// Live vectors copied per background batch.
    pub batch_size: usize,
    /// Bound on the delta log; writes past it fail with an overflow.
    pub max_delta_size: usize,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_delta_size: 10_000,
        }
    }
}

/// Progress report for an online compaction.
#[derive(Clone, Debug)]
pub struct CompactionProgress {
    /// The background copier is still moving vectors.
    pub copying: bool,
    /// `finish` completed.
    pub finished: bool,
    /// The copier stopped on an error.
    pub failed: bool,
    /// Copier error, when failed.
    pub error: Option<String>,
    /// Operations recorded in the delta log.
    pub delta_count: usize,
    /// Source nodes copied into the target so far.
    pub mapped_ids: usize,
}

#[derive(Clone, Debug)]
enum DeltaOp {
    Insert {
        external_id: Option<ExternalId>,
        vector: Vec<f32>,
        metadata: Option<Metadata>,
    },
    Delete {
        external_id: Option<ExternalId>,
    },
    SetMetadata {
        external_id: Option<ExternalId>,
        metadata: Metadata,
    },
}

struct CompactionInner {
    source: Mutex<Index>,
    target: Mutex<Index>,
    delta: Mutex<Vec<DeltaOp>>,
    /// Source node id → target node id, filled by the copier.
    mapped: Mutex<HashMap<u32, u32>>,
    max_delta_size: usize,
    copying: AtomicBool,
    failed: AtomicBool,
    finished: AtomicBool,
    error: Mutex<Option<String>>,
    copier: Mutex<Option<JoinHandle<()>>>,
}

/// A live online compaction: reads and writes keep working against the
/// source while the target is built in the background.
pub struct CompactionState {
    inner: Arc<CompactionInner>,
}

fn external_of_node(index: &Index, node: NodeId) -> Option<ExternalId> {
    index
        .state
        .metadata
        .get(&node)
        .and_then(|m| m.get(EXTERNAL_ID_FIELD))
        .and_then(|v| match v {
            MetadataValue::Id(id) => Some(id.clone()),
            _ => None,
        })
}

fn plain_metadata(index: &Index, node: NodeId) -> Option<Metadata> {
    let mut meta = index.state.metadata.get(&node)?.clone();
    meta.remove(EXTERNAL_ID_FIELD);
    if meta.is_empty() {
        None
    } else {
        Some(meta)
    }
}

impl Index {
    /// Offline compaction: synchronously rebuilds into a fresh target and
    /// returns the committed result.
    #[instrument(skip(self, target_config))]
    pub fn compact(&self, target_config: IndexConfig) -> Result<Index> {
        if target_config.dim != self.config.dim {
            return Err(ProximumError::config(
                "compaction target must keep the source dimension",
            ));
        }
        let mut target = Index::create(target_config)?;
        for id in 0..self.state.vector_count {
            let node = NodeId(id);
            if self.edges.is_deleted(node) {
                continue;
            }
            target = target.insert_with(
                self.vectors.vector(node),
                external_of_node(self, node),
                plain_metadata(self, node),
            )?;
        }
        let target = target.sync()?;
        info!(live = target.count_vectors(), "Offline compaction complete");
        Ok(target)
    }

    /// Starts an online compaction into `target_config`.
    ///
    /// The returned state serves reads from the source and dual-writes
    /// mutations to the source and the delta log while a background
    /// copier fills the target.
    pub fn start_online_compaction(
        &self,
        target_config: IndexConfig,
        opts: CompactionOptions,
    ) -> Result<CompactionState> {
        if target_config.dim != self.config.dim {
            return Err(ProximumError::config(
                "compaction target must keep the source dimension",
            ));
        }
        let target = Index::create(target_config)?;

        let inner = Arc::new(CompactionInner {
            source: Mutex::new(self.clone()),
            target: Mutex::new(target),
            delta: Mutex::new(Vec::new()),
            mapped: Mutex::new(HashMap::new()),
            max_delta_size: opts.max_delta_size,
            copying: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            error: Mutex::new(None),
            copier: Mutex::new(None),
        });

        // The copier works from an immutable snapshot of the source value;
        // concurrent writes land in the delta log and replay at finish.
        let snapshot = self.clone();
        let worker = Arc::clone(&inner);
        let batch_size = opts.batch_size.max(1);
        let handle = std::thread::Builder::new()
            .name("proximum-compactor".to_string())
            .spawn(move || {
                let mut batch = Vec::with_capacity(batch_size);
                for id in 0..snapshot.state.vector_count {
                    let node = NodeId(id);
                    if snapshot.edges.is_deleted(node) {
                        continue;
                    }
                    batch.push(node);
                    if batch.len() == batch_size {
                        if let Err(e) = copy_batch(&snapshot, &worker, &batch) {
                            fail(&worker, e);
                            return;
                        }
                        batch.clear();
                    }
                }
                if !batch.is_empty() {
                    if let Err(e) = copy_batch(&snapshot, &worker, &batch) {
                        fail(&worker, e);
                        return;
                    }
                }
                worker.copying.store(false, Ordering::SeqCst);
            })
            .map_err(|e| CompactionError::Failed(e.to_string()))?;
        *inner.copier.lock() = Some(handle);

        Ok(CompactionState { inner })
    }
}

fn copy_batch(snapshot: &Index, inner: &CompactionInner, batch: &[NodeId]) -> Result<()> {
    for &node in batch {
        let external_id = external_of_node(snapshot, node);
        let metadata = plain_metadata(snapshot, node);
        let vector = snapshot.vectors.vector(node).to_vec();
        let mut target = inner.target.lock();
        let next = target.insert_with(&vector, external_id, metadata)?;
        let new_node = NodeId(next.state.vector_count - 1);
        *target = next;
        drop(target);
        inner.mapped.lock().insert(node.0, new_node.0);
    }
    Ok(())
}

fn fail(inner: &CompactionInner, err: ProximumError) {
    warn!(error = %err, "Compaction copier failed");
    *inner.error.lock() = Some(err.to_string());
    inner.failed.store(true, Ordering::SeqCst);
    inner.copying.store(false, Ordering::SeqCst);
}

impl CompactionState {
    /// The current source value (fresh clone).
    pub fn current(&self) -> Index {
        self.inner.source.lock().clone()
    }

    fn record(&self, op: DeltaOp) -> Result<()> {
        let mut delta = self.inner.delta.lock();
        if delta.len() >= self.inner.max_delta_size {
            return Err(CompactionError::DeltaOverflow {
                max_delta_size: self.inner.max_delta_size,
                current_size: delta.len() + 1,
            }
            .into());
        }
        delta.push(op);
        Ok(())
    }

    /// Searches the source.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        self.current().search(query, k)
    }

    /// Live count of the source.
    pub fn count_vectors(&self) -> u64 {
        self.current().count_vectors()
    }

    /// Vector lookup by external id on the source.
    pub fn get(&self, external_id: impl Into<ExternalId>) -> Result<Option<Vec<f32>>> {
        self.current().get(external_id)
    }

    /// Inserts, dual-writing to the source and the delta log.
    pub fn insert_with(
        &self,
        vec: &[f32],
        external_id: Option<ExternalId>,
        metadata: Option<Metadata>,
    ) -> Result<()> {
        let mut source = self.inner.source.lock();
        // Reserve delta space first so an overflow mutates nothing.
        self.record(DeltaOp::Insert {
            external_id: external_id.clone(),
            vector: vec.to_vec(),
            metadata: metadata.clone(),
        })?;
        match source.insert_with(vec, external_id, metadata) {
            Ok(next) => {
                *source = next;
                Ok(())
            }
            Err(e) => {
                self.inner.delta.lock().pop();
                Err(e)
            }
        }
    }

    /// `assoc` sugar over [`insert_with`](Self::insert_with).
    pub fn assoc(
        &self,
        external_id: impl Into<ExternalId>,
        vec: &[f32],
        metadata: Option<Metadata>,
    ) -> Result<()> {
        self.insert_with(vec, Some(external_id.into()), metadata)
    }

    /// Deletes on the source; replayable on the target only when the
    /// node carries an external id.
    pub fn delete(&self, key: impl Into<IndexKey>) -> Result<()> {
        let key = key.into();
        let mut source = self.inner.source.lock();
        let node = source.resolve(&key)?;
        let external_id = external_of_node(&source, node);
        self.record(DeltaOp::Delete {
            external_id: external_id.clone(),
        })?;
        match source.delete(node) {
            Ok(next) => {
                *source = next;
                Ok(())
            }
            Err(e) => {
                self.inner.delta.lock().pop();
                Err(e)
            }
        }
    }

    /// `dissoc` sugar over [`delete`](Self::delete).
    pub fn dissoc(&self, external_id: impl Into<ExternalId>) -> Result<()> {
        self.delete(IndexKey::External(external_id.into()))
    }

    /// Metadata update, dual-written like the other mutators.
    pub fn set_metadata(&self, key: impl Into<IndexKey>, metadata: Metadata) -> Result<()> {
        let key = key.into();
        let mut source = self.inner.source.lock();
        let node = source.resolve(&key)?;
        let external_id = external_of_node(&source, node);
        self.record(DeltaOp::SetMetadata {
            external_id,
            metadata: metadata.clone(),
        })?;
        match source.set_metadata(node, metadata) {
            Ok(next) => {
                *source = next;
                Ok(())
            }
            Err(e) => {
                self.inner.delta.lock().pop();
                Err(e)
            }
        }
    }

    /// Forking is forbidden while a compaction is live.
    pub fn fork(&self) -> Result<Index> {
        Err(CompactionError::ForkDuringCompaction.into())
    }

    /// Snapshot of the compaction's progress.
    pub fn progress(&self) -> CompactionProgress {
        CompactionProgress {
            copying: self.inner.copying.load(Ordering::SeqCst),
            finished: self.inner.finished.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
            error: self.inner.error.lock().clone(),
            delta_count: self.inner.delta.lock().len(),
            mapped_ids: self.inner.mapped.lock().len(),
        }
    }

    fn join_copier(&self) {
        if let Some(handle) = self.inner.copier.lock().take() {
            let _ = handle.join();
        }
    }

    /// Waits for the copier, replays the delta onto the target, and
    /// returns the sealed (committed) target index.
    #[instrument(skip(self))]
    pub fn finish(self) -> Result<Index> {
        self.join_copier();
        if self.inner.failed.load(Ordering::SeqCst) {
            let message = self
                .inner
                .error
                .lock()
                .clone()
                .unwrap_or_else(|| "copier failed".to_string());
            return Err(CompactionError::Failed(message).into());
        }

        let mut target = self.inner.target.lock().clone();
        let delta: Vec<DeltaOp> = std::mem::take(&mut *self.inner.delta.lock());
        for op in delta {
            match op {
                DeltaOp::Insert {
                    external_id,
                    vector,
                    metadata,
                } => {
                    target = target.insert_with(&vector, external_id, metadata)?;
                }
                DeltaOp::Delete {
                    external_id: Some(id),
                } => {
                    if target.contains(id.clone()) {
                        target = target.dissoc(id)?;
                    }
                }
                DeltaOp::Delete { external_id: None } => {
                    warn!("Delta delete without external id cannot replay onto the rebuilt target");
                }
                DeltaOp::SetMetadata {
                    external_id: Some(id),
                    metadata,
                } => {
                    if target.contains(id.clone()) {
                        target = target.set_metadata(IndexKey::External(id), metadata)?;
                    }
                }
                DeltaOp::SetMetadata {
                    external_id: None, ..
                } => {
                    warn!("Delta metadata update without external id cannot replay onto the rebuilt target");
                }
            }
        }
        let target = target.sync()?;
        self.inner.finished.store(true, Ordering::SeqCst);
        info!(live = target.count_vectors(), "Online compaction finished");
        Ok(target)
    }

    /// Discards the target, cleaning up its partial mmap file, and
    /// returns the source as it stands.
    pub fn abort(self) -> Result<Index> {
        self.join_copier();
        let target = self.inner.target.lock().clone();
        let target_path = target.vectors.path().to_path_buf();
        let _ = target.vectors.close();
        let _ = std::fs::remove_file(&target_path);
        info!("Online compaction aborted");
        Ok(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::test_config;
    use tempfile::tempdir;

    fn make_vector(seed: u64, dim: usize) -> Vec<f32> {
        (0..dim)
            .map(|i| (seed as f32 * 0.7 + i as f32 * 0.31).sin())
            .collect()
    }

    #[test]
    fn test_offline_compact_drops_tombstones() {
        let dir = tempdir().unwrap();
        let mut index = Index::create(test_config(dir.path(), 8)).unwrap();
        for seed in 0..20u64 {
            index = index
                .assoc(format!("doc-{}", seed), &make_vector(seed, 8), None)
                .unwrap();
        }
        let index = index.dissoc("doc-3").unwrap().dissoc("doc-7").unwrap();
        assert_eq!(index.count_vectors(), 18);
        assert_eq!(index.deleted_count(), 2);

        let target_dir = tempdir().unwrap();
        let compacted = index.compact(test_config(target_dir.path(), 8)).unwrap();
        assert_eq!(compacted.count_vectors(), 18);
        assert_eq!(compacted.deleted_count(), 0);
        assert!(compacted.contains("doc-4"));
        assert!(!compacted.contains("doc-3"));
        // Dense again: the survivors occupy the first 18 slots.
        assert_eq!(compacted.total_count(), 18);
    }

    #[test]
    fn test_online_compaction_with_concurrent_writes() {
        let dir = tempdir().unwrap();
        let mut index = Index::create(test_config(dir.path(), 8)).unwrap();
        for seed in 0..10u64 {
            index = index.insert(&make_vector(seed, 8)).unwrap();
        }

        let target_dir = tempdir().unwrap();
        let state = index
            .start_online_compaction(
                test_config(target_dir.path(), 8),
                CompactionOptions::default(),
            )
            .unwrap();

        // Writes during the copy: one insert, one delete.
        let fresh = make_vector(99, 8);
        state.assoc("new-1", &fresh, None).unwrap();
        state.delete(NodeId(3)).unwrap();

        let progress = state.progress();
        assert!(progress.delta_count >= 2);
        assert!(!progress.finished);

        let finished = state.finish().unwrap();
        assert_eq!(finished.count_vectors(), 11);
        assert_eq!(finished.deleted_count(), 0);
        let hit = finished.nearest(&fresh).unwrap().unwrap();
        assert_eq!(hit.id, ExternalId::Str("new-1".into()));
    }

    #[test]
    fn test_delta_overflow_is_explicit() {
        let dir = tempdir().unwrap();
        let mut index = Index::create(test_config(dir.path(), 8)).unwrap();
        for seed in 0..5u64 {
            index = index.insert(&make_vector(seed, 8)).unwrap();
        }

        let target_dir = tempdir().unwrap();
        let state = index
            .start_online_compaction(
                test_config(target_dir.path(), 8),
                CompactionOptions {
                    batch_size: 2,
                    max_delta_size: 2,
                },
            )
            .unwrap();

        state.assoc("a", &make_vector(50, 8), None).unwrap();
        state.assoc("b", &make_vector(51, 8), None).unwrap();
        let err = state.assoc("c", &make_vector(52, 8), None).unwrap_err();
        assert!(matches!(
            err,
            ProximumError::Compaction(CompactionError::DeltaOverflow { .. })
        ));
        // The overflowed write mutated nothing.
        assert!(state.get("c").unwrap().is_none());
    }

    #[test]
    fn test_fork_forbidden_during_compaction() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        let index = index.insert(&make_vector(0, 8)).unwrap();

        let target_dir = tempdir().unwrap();
        let state = index
            .start_online_compaction(
                test_config(target_dir.path(), 8),
                CompactionOptions::default(),
            )
            .unwrap();
        let err = state.fork().unwrap_err();
        assert!(matches!(
            err,
            ProximumError::Compaction(CompactionError::ForkDuringCompaction)
        ));
        let _ = state.abort().unwrap();
    }

    #[test]
    fn test_abort_returns_source_with_writes() {
        let dir = tempdir().unwrap();
        let mut index = Index::create(test_config(dir.path(), 8)).unwrap();
        for seed in 0..5u64 {
            index = index.insert(&make_vector(seed, 8)).unwrap();
        }
        let target_dir = tempdir().unwrap();
        let state = index
            .start_online_compaction(
                test_config(target_dir.path(), 8),
                CompactionOptions::default(),
            )
            .unwrap();
        state.assoc("kept", &make_vector(42, 8), None).unwrap();

        let source = state.abort().unwrap();
        assert_eq!(source.count_vectors(), 6);
        assert!(source.contains("kept"));
    }
}
