//! Commit snapshots, the sync pipeline, loading, and DAG queries.
//!
//! A commit is a self-contained descriptor of the mutable state: the four
//! PSS roots, the graph top, per-branch counts, and the deleted bitmap.
//! The immutable geometry lives once under `index/config`.
//!
//! The sync pipeline is ordered: chunk flushes fire, the mmap is forced
//! and its header count published, pending KV writes drain, the orders are
//! persisted, and only then does the branch head move. A reader observing
//! a branch head therefore observes a self-consistent snapshot; on any
//! error the head stays put and the value remains usable.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tracing::{debug, info, instrument, warn};

use super::{Index, IndexState};
use crate::config::IndexConfig;
use crate::error::{BranchError, ProximumError, Result, StorageError};
use crate::graph::{
    bytes_to_chunk, chunk_to_bytes, EdgeStore, KvChunkSource,
};
use crate::graph::hnsw::HnswParams;
use crate::storage::schema::{
    branch_head_key, commit_key, edge_chunk_key, vector_chunk_key, IndexConfigRecord,
    INDEX_CONFIG_KEY,
};
use crate::storage::{KvStore, PendingWrite, PersistentSet};
use crate::types::{CommitId, NodeId, StorageAddress, Timestamp};
use crate::vector::VectorStore;

/// A commit snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Commit {
    /// Commit identity.
    pub id: CommitId,
    /// Parent commits: empty for roots, two for merges.
    pub parents: BTreeSet<CommitId>,
    /// Wall-clock creation time.
    pub created_at: Timestamp,
    /// Branch the commit was made on.
    pub branch: String,
    /// Optional caller message.
    pub message: Option<String>,
    /// Root of the vector chunk address map.
    pub vectors_addr_root: Option<StorageAddress>,
    /// Root of the edge chunk address map.
    pub edges_addr_root: Option<StorageAddress>,
    /// Root of the metadata order.
    pub metadata_root: Option<StorageAddress>,
    /// Root of the external-id order.
    pub external_id_root: Option<StorageAddress>,
    /// HNSW entry point.
    pub entry_point: Option<NodeId>,
    /// Level of the entry point.
    pub current_max_level: u8,
    /// Slots visible to the branch at commit time.
    pub branch_vector_count: u32,
    /// Deleted slots visible to the branch at commit time.
    pub branch_deleted_count: u64,
    /// Serialized roaring bitmap of deleted nodes.
    pub deleted_nodes: Vec<u8>,
    /// Combined vector content hash (hex), when content addressing is on.
    pub vectors_commit_hash: Option<String>,
}

/// Options for [`Index::sync_with`].
#[derive(Clone, Debug, Default)]
pub struct SyncOptions {
    /// Commit message.
    pub message: Option<String>,
    /// Explicit parents (merges); defaults to the current branch head.
    pub parents: Option<Vec<CommitId>>,
}

/// Completion handle for [`Index::sync_async`].
pub struct SyncHandle {
    rx: crossbeam_channel::Receiver<Result<Index>>,
}

impl SyncHandle {
    /// Blocks until the sync completes, yielding the committed value or
    /// the error that stopped it.
    pub fn wait(self) -> Result<Index> {
        self.rx
            .recv()
            .map_err(|_| ProximumError::from(StorageError::WriterGone))?
    }
}

/// Reads the head commit id of a branch.
pub(crate) fn branch_head(store: &dyn KvStore, branch: &str) -> Result<Option<CommitId>> {
    let Some(bytes) = store.get(&branch_head_key(branch))? else {
        return Ok(None);
    };
    let raw: [u8; 16] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| StorageError::corrupted("Bad branch head"))?;
    Ok(Some(CommitId(uuid::Uuid::from_bytes(raw))))
}

/// Reads a commit snapshot.
pub(crate) fn read_commit(store: &dyn KvStore, id: CommitId) -> Result<Commit> {
    let bytes = store
        .get(&commit_key(id))?
        .ok_or_else(|| BranchError::CommitNotFound(id.to_string()))?;
    Ok(bincode::deserialize(&bytes).map_err(StorageError::from)?)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn address_map_digest(map: &PersistentSet<u64, StorageAddress>) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for (position, addr) in map.iter() {
        hasher.update(position.to_le_bytes());
        hasher.update(addr.0.as_bytes());
    }
    hasher.finalize().into()
}

impl Index {
    /// Commits the current state and advances the branch head.
    pub fn sync(&self) -> Result<Self> {
        self.sync_with(SyncOptions::default())
    }

    /// The commit pipeline. See the module docs for ordering.
    #[instrument(skip(self, opts), fields(branch = %self.state.branch))]
    pub fn sync_with(&self, opts: SyncOptions) -> Result<Self> {
        // 1. Fire edge chunk flushes for the dirty set captured now;
        //    concurrent mutations after this snapshot stay dirty.
        let dirty = self.edges.dirty_positions();
        let mut edge_updates: Vec<(u64, StorageAddress)> = Vec::with_capacity(dirty.len());
        let mut edge_pending: Vec<PendingWrite> = Vec::with_capacity(dirty.len());
        for &position in &dirty {
            let Some(chunk) = self.edges.chunk_by_encoded_position(position) else {
                warn!(position, "Dirty chunk not resident; skipping");
                continue;
            };
            let bytes = chunk_to_bytes(&chunk);
            let addr = StorageAddress::for_chunk(&bytes, self.config.crypto_hash);
            edge_pending.push(self.store.put_async(edge_chunk_key(addr), bytes));
            edge_updates.push((position, addr));
        }

        // 2./3. Vector side: flush partial chunk, force mmap, publish the
        // header count, force again, drain vector writes.
        let vector_updates = self.vectors.sync_flush()?;

        // Drain the edge writes fired above.
        for pending in edge_pending {
            pending.wait()?;
        }

        // 4. Fold the new addresses into the address maps.
        let mut vectors_addr = self.state.vectors_addr.clone();
        for (chunk, addr) in &vector_updates {
            vectors_addr = vectors_addr.insert(*chunk, *addr);
        }
        let mut edges_addr = self.state.edges_addr.clone();
        for (position, addr) in &edge_updates {
            edges_addr = edges_addr.insert(*position, *addr);
        }

        // 5. Commit identity: content-derived when enabled, random else.
        let head = branch_head(self.store.as_ref(), &self.state.branch)?;
        let parents: BTreeSet<CommitId> = match &opts.parents {
            Some(parents) => parents.iter().copied().collect(),
            None => head.into_iter().collect(),
        };
        let (commit_id, vectors_commit_hash) = if self.config.crypto_hash {
            let vec_digest = address_map_digest(&vectors_addr);
            let edge_digest = address_map_digest(&edges_addr);
            // Every parent participates, so merge and branch commits with
            // identical content still hash distinctly per lineage.
            let mut parts: Vec<&[u8]> = parents.iter().map(|p| &p.0.as_bytes()[..]).collect();
            parts.push(&vec_digest);
            parts.push(&edge_digest);
            let id = CommitId::from_content(None, &parts);
            (id, Some(hex(&vec_digest)))
        } else {
            (CommitId::random(), None)
        };

        // 6. Persist the four orders and build the snapshot.
        let crypto = self.config.crypto_hash;
        let metadata_root = self.state.metadata.persist(self.store.as_ref(), crypto)?;
        let external_id_root = self.state.external_ids.persist(self.store.as_ref(), crypto)?;
        let vectors_addr_root = vectors_addr.persist(self.store.as_ref(), crypto)?;
        let edges_addr_root = edges_addr.persist(self.store.as_ref(), crypto)?;

        let mut deleted_nodes = Vec::new();
        self.edges
            .deleted_nodes()
            .serialize_into(&mut deleted_nodes)
            .map_err(|e| StorageError::serialization(e.to_string()))?;

        let commit = Commit {
            id: commit_id,
            parents,
            created_at: Timestamp::now(),
            branch: self.state.branch.clone(),
            message: opts.message,
            vectors_addr_root,
            edges_addr_root,
            metadata_root,
            external_id_root,
            entry_point: self.edges.entry_point(),
            current_max_level: self.edges.current_max_level(),
            branch_vector_count: self.state.vector_count,
            branch_deleted_count: self.deleted_count(),
            deleted_nodes,
            vectors_commit_hash,
        };

        // 7. Write the snapshot, then move the branch head.
        let bytes = bincode::serialize(&commit).map_err(StorageError::from)?;
        self.store.put(&commit_key(commit_id), &bytes)?;
        self.store
            .put(&branch_head_key(&self.state.branch), commit_id.0.as_bytes())?;

        // Only the captured chunks leave the dirty set; committed chunks
        // become reloadable so the cache can shrink.
        self.edges.clear_dirty(&dirty);
        self.edges.set_source(Some(Arc::new(KvChunkSource::new(
            Arc::clone(&self.store),
            edges_addr.clone(),
        ))));
        self.edges.softify(self.config.cache_size);

        info!(commit = %commit_id, vectors = self.state.vector_count, "Synced");

        let mut state = self.state.clone();
        state.commit = Some(commit_id);
        state.vectors_addr = vectors_addr;
        state.edges_addr = edges_addr;
        Ok(Self {
            state,
            ..self.clone()
        })
    }

    /// Runs [`sync_with`](Self::sync_with) on a background thread and
    /// returns a handle resolving to the committed value.
    pub fn sync_async(&self, opts: SyncOptions) -> SyncHandle {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let index = self.clone();
        std::thread::spawn(move || {
            let _ = tx.send(index.sync_with(opts));
        });
        SyncHandle { rx }
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Loads the head of a branch (defaults to the configured branch).
    pub fn load(config: IndexConfig, branch: Option<&str>) -> Result<Self> {
        config.validate()?;
        let store = crate::storage::open_store(&config.store)?;
        let record = read_config_record(store.as_ref())?;
        record.check_compatible(&config)?;

        let branch = branch.unwrap_or(&config.branch).to_string();
        let branches = super::branch::read_branches(store.as_ref())?;
        if !branches.contains(&branch) {
            return Err(BranchError::NotFound(branch).into());
        }
        let head = branch_head(store.as_ref(), &branch)?
            .ok_or_else(|| BranchError::NoCommits(branch.clone()))?;
        let commit = read_commit(store.as_ref(), head)?;
        restore_index(&record.index_type, config, store, commit)
    }

    /// Loads the state of an arbitrary commit (time travel).
    pub fn load_commit(config: IndexConfig, commit_id: CommitId) -> Result<Self> {
        config.validate()?;
        let store = crate::storage::open_store(&config.store)?;
        let record = read_config_record(store.as_ref())?;
        record.check_compatible(&config)?;
        let commit = read_commit(store.as_ref(), commit_id)?;
        restore_index(&record.index_type, config, store, commit)
    }

    // =========================================================================
    // Commit DAG queries
    // =========================================================================

    /// The commit record for an id.
    pub fn commit_info(&self, id: CommitId) -> Result<Commit> {
        read_commit(self.store.as_ref(), id)
    }

    /// Parent set of a commit.
    pub fn parents(&self, id: CommitId) -> Result<BTreeSet<CommitId>> {
        Ok(self.commit_info(id)?.parents)
    }

    /// Commits reachable from the branch head, newest first (BFS order).
    pub fn history(&self) -> Result<Vec<CommitId>> {
        let Some(head) = branch_head(self.store.as_ref(), &self.state.branch)? else {
            return Ok(Vec::new());
        };
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([head]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            for parent in self.parents(id)? {
                queue.push_back(parent);
            }
        }
        Ok(order)
    }

    /// Transitive parents of a commit, the commit itself included.
    pub fn ancestors(&self, id: CommitId) -> Result<HashSet<CommitId>> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            for parent in self.parents(current)? {
                queue.push_back(parent);
            }
        }
        Ok(seen)
    }

    /// True if `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: CommitId, descendant: CommitId) -> Result<bool> {
        Ok(self.ancestors(descendant)?.contains(&ancestor))
    }

    /// First common ancestor of two commits (BFS from `b` through `a`'s
    /// ancestor set).
    pub fn common_ancestor(&self, a: CommitId, b: CommitId) -> Result<Option<CommitId>> {
        let from_a = self.ancestors(a)?;
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([b]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if from_a.contains(&current) {
                return Ok(Some(current));
            }
            for parent in self.parents(current)? {
                queue.push_back(parent);
            }
        }
        Ok(None)
    }

    /// The full parent graph reachable from every branch head.
    pub fn commit_graph(&self) -> Result<BTreeMap<CommitId, BTreeSet<CommitId>>> {
        let mut graph = BTreeMap::new();
        let mut queue = VecDeque::new();
        for branch in super::branch::read_branches(self.store.as_ref())? {
            if let Some(head) = branch_head(self.store.as_ref(), &branch)? {
                queue.push_back(head);
            }
        }
        while let Some(id) = queue.pop_front() {
            if graph.contains_key(&id) {
                continue;
            }
            let parents = self.parents(id)?;
            for parent in &parents {
                queue.push_back(*parent);
            }
            graph.insert(id, parents);
        }
        Ok(graph)
    }
}

pub(crate) fn read_config_record(store: &dyn KvStore) -> Result<IndexConfigRecord> {
    let bytes = store
        .get(INDEX_CONFIG_KEY)?
        .ok_or_else(|| StorageError::key_not_found("index/config"))?;
    IndexConfigRecord::from_bytes(&bytes)
}

/// Restorer dispatch keyed on the persisted index type tag.
fn restore_index(
    index_type: &str,
    config: IndexConfig,
    store: Arc<dyn KvStore>,
    commit: Commit,
) -> Result<Index> {
    match index_type {
        "hnsw" => restore_hnsw(config, store, commit),
        other => Err(ProximumError::config(format!(
            "Unknown index type '{}'",
            other
        ))),
    }
}

#[instrument(skip(config, store, commit), fields(commit = %commit.id, branch = %commit.branch))]
fn restore_hnsw(config: IndexConfig, store: Arc<dyn KvStore>, commit: Commit) -> Result<Index> {
    let metadata = PersistentSet::load(store.as_ref(), commit.metadata_root)?;
    let external_ids = PersistentSet::load(store.as_ref(), commit.external_id_root)?;
    let vectors_addr: PersistentSet<u64, StorageAddress> =
        PersistentSet::load(store.as_ref(), commit.vectors_addr_root)?;
    let edges_addr: PersistentSet<u64, StorageAddress> =
        PersistentSet::load(store.as_ref(), commit.edges_addr_root)?;

    let vectors = open_or_rebuild_vectors(&config, &store, &commit, &vectors_addr)?;
    let params = HnswParams::from_config(&config);
    let edges = rebuild_edges(&config, &store, &commit, &edges_addr)?;

    debug!(vectors = commit.branch_vector_count, "Index restored");

    Ok(Index {
        state: IndexState {
            branch: commit.branch.clone(),
            commit: Some(commit.id),
            vector_count: commit.branch_vector_count,
            metadata,
            external_ids,
            vectors_addr,
            edges_addr,
        },
        params,
        edges: Arc::new(edges),
        vectors,
        store,
        config: Arc::new(config),
    })
}

/// Rebuilds the edge store of a commit: preloads every chunk through the
/// address map, populates the graph top and the deleted bitmap, then
/// seals the store and installs the lazy chunk source.
pub(crate) fn rebuild_edges(
    config: &IndexConfig,
    store: &Arc<dyn KvStore>,
    commit: &Commit,
    edges_addr: &PersistentSet<u64, StorageAddress>,
) -> Result<EdgeStore> {
    let params = HnswParams::from_config(config);
    let edges = EdgeStore::new(config.capacity, params.max_level, params.m, params.m0)
        .as_transient();
    for (&position, &addr) in edges_addr.iter() {
        let bytes = store.get(&edge_chunk_key(addr))?.ok_or_else(|| {
            crate::error::IntegrityError::ChunkNotFound {
                position,
                storage_addr: addr.to_string(),
            }
        })?;
        edges.set_chunk_by_encoded_position(position, bytes_to_chunk(&bytes)?);
    }
    edges.set_entry_point(commit.entry_point);
    edges.set_max_level(commit.current_max_level);
    let deleted = roaring::RoaringBitmap::deserialize_from(commit.deleted_nodes.as_slice())
        .map_err(|e| StorageError::corrupted(format!("Bad deleted bitmap: {}", e)))?;
    edges.set_deleted_nodes(deleted);
    let edges = edges.as_persistent();
    edges.set_source(Some(Arc::new(KvChunkSource::new(
        Arc::clone(store),
        edges_addr.clone(),
    ))));
    edges.softify(config.cache_size);
    Ok(edges)
}

/// Opens the branch's mmap file when compatible, else recreates it and
/// reloads every chunk from the KV store through the address map.
fn open_or_rebuild_vectors(
    config: &IndexConfig,
    store: &Arc<dyn KvStore>,
    commit: &Commit,
    vectors_addr: &PersistentSet<u64, StorageAddress>,
) -> Result<VectorStore> {
    let path = config.mmap_path_for(&commit.branch);
    let count = commit.branch_vector_count as u64;

    if path.exists() {
        match VectorStore::open(
            &path,
            config.dim,
            config.capacity,
            config.chunk_size,
            config.crypto_hash,
            Arc::clone(store),
        ) {
            Ok((vectors, header_count)) => {
                if header_count < count {
                    restore_chunk_range(&vectors, store, vectors_addr, header_count, count)?;
                }
                vectors.set_restored_count(header_count.max(count));
                return Ok(vectors);
            }
            Err(err) => {
                if matches!(
                    err,
                    ProximumError::Storage(StorageError::Locked)
                ) {
                    return Err(err);
                }
                warn!(error = %err, "Vector file unusable; rebuilding from KV chunks");
            }
        }
    }

    let vectors = VectorStore::create(
        &path,
        config.dim,
        config.capacity,
        config.chunk_size,
        config.crypto_hash,
        Arc::clone(store),
    )?;
    restore_chunk_range(&vectors, store, vectors_addr, 0, count)?;
    vectors.set_restored_count(count);
    Ok(vectors)
}

fn restore_chunk_range(
    vectors: &VectorStore,
    store: &Arc<dyn KvStore>,
    vectors_addr: &PersistentSet<u64, StorageAddress>,
    from_count: u64,
    to_count: u64,
) -> Result<()> {
    if to_count == 0 {
        return Ok(());
    }
    let chunk_size = vectors.chunk_size() as u64;
    let first = from_count / chunk_size;
    let last = (to_count - 1) / chunk_size;
    for chunk in first..=last {
        let addr = vectors_addr.get(&chunk).copied().ok_or_else(|| {
            crate::error::IntegrityError::ChunkNotFound {
                position: chunk,
                storage_addr: "<unmapped>".to_string(),
            }
        })?;
        let bytes = store.get(&vector_chunk_key(addr))?.ok_or_else(|| {
            crate::error::IntegrityError::ChunkNotFound {
                position: chunk,
                storage_addr: addr.to_string(),
            }
        })?;
        vectors.restore_chunk(chunk, &bytes)?;
    }
    Ok(())
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
    fn test_sync_sets_commit_id_and_mutation_clears_it() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        let index = index.insert(&make_vector(0, 8)).unwrap();
        assert!(index.commit_id().is_none());

        let committed = index.sync().unwrap();
        assert!(committed.commit_id().is_some());

        let mutated = committed.insert(&make_vector(1, 8)).unwrap();
        assert!(mutated.commit_id().is_none());
        // The committed value keeps its id.
        assert!(committed.commit_id().is_some());
    }

    #[test]
    fn test_sync_async_resolves_to_committed_value() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        let index = index.insert(&make_vector(0, 8)).unwrap();
        let committed = index.sync_async(SyncOptions::default()).wait().unwrap();
        assert!(committed.commit_id().is_some());
    }

    #[test]
    fn test_linear_history_and_parents() {
        let dir = tempdir().unwrap();
        let mut index = Index::create(test_config(dir.path(), 8)).unwrap();
        let mut commits = Vec::new();
        for round in 0..3u64 {
            for i in 0..5u64 {
                index = index.insert(&make_vector(round * 5 + i, 8)).unwrap();
            }
            index = index.sync().unwrap();
            commits.push(index.commit_id().unwrap());
        }
        let [c1, c2, c3] = commits[..] else { panic!() };

        assert_eq!(index.history().unwrap(), vec![c3, c2, c1]);
        assert_eq!(index.parents(c3).unwrap(), BTreeSet::from([c2]));
        assert!(index.parents(c1).unwrap().is_empty());
        assert!(index.is_ancestor(c1, c3).unwrap());
        assert!(!index.is_ancestor(c3, c1).unwrap());
        assert_eq!(index.common_ancestor(c2, c3).unwrap(), Some(c2));
        assert_eq!(index.count_vectors(), 15);
    }

    #[test]
    fn test_reload_roundtrip() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 8);
        let mut index = Index::create(config.clone()).unwrap();
        let mut meta = crate::types::Metadata::new();
        meta.insert("k".into(), crate::types::MetadataValue::Int(7));
        for seed in 0..30u64 {
            index = index
                .assoc(
                    format!("doc-{}", seed),
                    &make_vector(seed, 8),
                    Some(meta.clone()),
                )
                .unwrap();
        }
        let index = index.sync().unwrap();
        let expected = index.search(&make_vector(12, 8), 5).unwrap();
        index.close().unwrap();

        let loaded = Index::load(config, None).unwrap();
        assert_eq!(loaded.count_vectors(), 30);
        assert_eq!(loaded.commit_id(), index.commit_id());
        assert_eq!(
            loaded.get_vector("doc-12").unwrap(),
            make_vector(12, 8)
        );
        assert_eq!(
            loaded
                .get_metadata("doc-12")
                .unwrap()
                .unwrap()
                .get("k"),
            Some(&crate::types::MetadataValue::Int(7))
        );
        assert_eq!(loaded.search(&make_vector(12, 8), 5).unwrap(), expected);
    }

    #[test]
    fn test_reload_after_mmap_file_lost() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 8);
        let mut index = Index::create(config.clone()).unwrap();
        for seed in 0..25u64 {
            index = index
                .assoc(format!("doc-{}", seed), &make_vector(seed, 8), None)
                .unwrap();
        }
        let index = index.sync().unwrap();
        let mmap_path = index.vectors.path().to_path_buf();
        index.close().unwrap();

        // Simulate losing the cache file; KV chunks are the truth.
        let _ = std::fs::remove_file(&mmap_path);

        let loaded = Index::load(config, None).unwrap();
        assert_eq!(loaded.count_vectors(), 25);
        assert_eq!(loaded.get_vector("doc-7").unwrap(), make_vector(7, 8));
        let hits = loaded.search(&make_vector(7, 8), 1).unwrap();
        assert_eq!(hits[0].id, crate::types::ExternalId::Str("doc-7".into()));
    }

    #[test]
    fn test_load_commit_time_travel() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 8);
        let mut index = Index::create(config.clone()).unwrap();
        for seed in 0..5u64 {
            index = index.insert(&make_vector(seed, 8)).unwrap();
        }
        let index = index.sync().unwrap();
        let c1 = index.commit_id().unwrap();
        let mut index = index;
        for seed in 5..10u64 {
            index = index.insert(&make_vector(seed, 8)).unwrap();
        }
        let index = index.sync().unwrap();
        index.close().unwrap();

        let old = Index::load_commit(config, c1).unwrap();
        assert_eq!(old.count_vectors(), 5);
        assert_eq!(old.commit_id(), Some(c1));
    }

    #[test]
    fn test_load_unknown_branch_fails() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 8);
        let index = Index::create(config.clone()).unwrap();
        let _ = index.insert(&make_vector(0, 8)).unwrap().sync().unwrap();
        index.close().unwrap();

        let err = Index::load(config, Some("nope")).unwrap_err();
        assert!(err.is_branch());
    }

    #[test]
    fn test_load_branch_without_commits_fails() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 8);
        let index = Index::create(config.clone()).unwrap();
        index.close().unwrap();

        let err = Index::load(config, None).unwrap_err();
        assert!(matches!(
            err,
            ProximumError::Branch(BranchError::NoCommits(_))
        ));
    }

    #[test]
    fn test_commit_records_counts_and_message() {
        let dir = tempdir().unwrap();
        let mut index = Index::create(test_config(dir.path(), 8)).unwrap();
        for seed in 0..8u64 {
            index = index.insert(&make_vector(seed, 8)).unwrap();
        }
        let index = index.delete(NodeId(2)).unwrap();
        let index = index
            .sync_with(SyncOptions {
                message: Some("first".into()),
                parents: None,
            })
            .unwrap();

        let commit = index.commit_info(index.commit_id().unwrap()).unwrap();
        assert_eq!(commit.branch_vector_count, 8);
        assert_eq!(commit.branch_deleted_count, 1);
        assert_eq!(commit.message.as_deref(), Some("first"));
        assert_eq!(commit.branch, "main");
        assert!(commit.entry_point.is_some());
    }
}
