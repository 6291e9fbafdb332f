//! The index value: persistent-map semantics over the HNSW engine.
//!
//! An [`Index`] is a cheap-to-clone value. Every mutating operation
//! returns a new value sharing most structure with the old one; the old
//! value keeps reading its own state (copy-on-write edge chunks, path-
//! copied orders). The physical vector file and the KV store are shared
//! across all values of a branch lineage.
//!
//! Mutations invalidate the commit id; [`Index::sync`](commit) creates a
//! commit and re-establishes it.

pub mod branch;
pub mod commit;
pub mod compaction;
pub mod gc;
pub mod metrics;

use std::sync::Arc;

use roaring::RoaringBitmap;
use tracing::{debug, info};

use crate::config::IndexConfig;
use crate::error::{Result, ValidationError};
use crate::graph::hnsw::{self, HnswParams};
use crate::graph::EdgeStore;
use crate::storage::schema::{IndexConfigRecord, INDEX_CONFIG_KEY};
use crate::storage::{KvStore, PersistentSet};
use crate::types::{
    CommitId, ExternalId, Metadata, MetadataValue, NodeId, StorageAddress, EXTERNAL_ID_FIELD,
};
use crate::vector::distance::normalize;
use crate::vector::VectorStore;

/// Key addressing a vector either by its external id or its internal node.
#[derive(Clone, Debug)]
pub enum IndexKey {
    /// User-facing identifier.
    External(ExternalId),
    /// Internal node id.
    Node(NodeId),
}

impl From<ExternalId> for IndexKey {
    fn from(id: ExternalId) -> Self {
        Self::External(id)
    }
}

impl From<NodeId> for IndexKey {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

impl From<&str> for IndexKey {
    fn from(id: &str) -> Self {
        Self::External(ExternalId::from(id))
    }
}

/// Output filter for search.
///
/// The expansion frontier is never restricted; only the returned hits are
/// filtered, with `ef` defaulting to `10 * k` to compensate.
pub enum SearchFilter<'a> {
    /// Allow only nodes set in the bitmap.
    Bitmap(&'a RoaringBitmap),
    /// Allow only the given external ids.
    ExternalIds(&'a [ExternalId]),
    /// Allow nodes passing the predicate, materialized to a bitmap at
    /// call time.
    Predicate(&'a (dyn Fn(NodeId, Option<&Metadata>) -> bool + Sync)),
}

/// Search options: beam width override and an output filter.
#[derive(Default)]
pub struct SearchOptions<'a> {
    /// Beam width; defaults to the configured `ef_search`, or `10 * k`
    /// when a filter is present.
    pub ef: Option<usize>,
    /// Output filter.
    pub filter: Option<SearchFilter<'a>>,
}

/// A search result keyed by external id.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult {
    /// External id of the hit (the node id when none was assigned).
    pub id: ExternalId,
    /// Distance under the index metric, ascending.
    pub distance: f32,
}

/// Batch insert options.
#[derive(Default)]
pub struct BatchOptions {
    /// Per-vector metadata, aligned with the vectors.
    pub metadata: Option<Vec<Option<Metadata>>>,
    /// Worker count for graph construction; defaults to the global pool.
    pub parallelism: Option<usize>,
}

/// Mutable state snapshot carried by an index value.
#[derive(Clone)]
pub(crate) struct IndexState {
    pub branch: String,
    /// `None` while uncommitted mutations exist.
    pub commit: Option<CommitId>,
    /// Slots visible to this branch (high-water mark at the last mutation).
    pub vector_count: u32,
    pub metadata: PersistentSet<NodeId, Metadata>,
    pub external_ids: PersistentSet<ExternalId, NodeId>,
    pub vectors_addr: PersistentSet<u64, StorageAddress>,
    pub edges_addr: PersistentSet<u64, StorageAddress>,
}

/// A persistent, versioned HNSW vector index.
#[derive(Clone)]
pub struct Index {
    pub(crate) config: Arc<IndexConfig>,
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) vectors: VectorStore,
    pub(crate) edges: Arc<EdgeStore>,
    pub(crate) params: HnswParams,
    pub(crate) state: IndexState,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("branch", &self.state.branch)
            .field("commit", &self.state.commit)
            .field("vector_count", &self.state.vector_count)
            .finish()
    }
}

impl Index {
    /// Creates a fresh index.
    ///
    /// Writes the immutable `index/config` record, registers the starting
    /// branch, and allocates the mmap vector file. The branch head stays
    /// unset until the first [`sync`](Self::sync).
    pub fn create(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let store = crate::storage::open_store(&config.store)?;

        let record = IndexConfigRecord::from_config(&config);
        match store.get(INDEX_CONFIG_KEY)? {
            Some(bytes) => IndexConfigRecord::from_bytes(&bytes)?.check_compatible(&config)?,
            None => store.put(INDEX_CONFIG_KEY, &record.to_bytes()?)?,
        }

        let mut branches = branch::read_branches(store.as_ref())?;
        branches.insert(config.branch.clone());
        branch::write_branches(store.as_ref(), &branches)?;

        let mmap_path = config.mmap_path_for(&config.branch);
        let vectors = VectorStore::create(
            &mmap_path,
            config.dim,
            config.capacity,
            config.chunk_size,
            config.crypto_hash,
            Arc::clone(&store),
        )?;

        let params = HnswParams::from_config(&config);
        let edges = EdgeStore::new(config.capacity, params.max_level, params.m, params.m0);

        info!(branch = %config.branch, dim = config.dim, "Index created");

        Ok(Self {
            state: IndexState {
                branch: config.branch.clone(),
                commit: None,
                vector_count: 0,
                metadata: PersistentSet::new(),
                external_ids: PersistentSet::new(),
                vectors_addr: PersistentSet::new(),
                edges_addr: PersistentSet::new(),
            },
            params,
            edges: Arc::new(edges),
            vectors,
            store,
            config: Arc::new(config),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The branch this value is on.
    pub fn current_branch(&self) -> &str {
        &self.state.branch
    }

    /// The commit id, or `None` when uncommitted mutations exist.
    pub fn commit_id(&self) -> Option<CommitId> {
        self.state.commit
    }

    /// Vector dimensionality.
    pub fn dim(&self) -> usize {
        self.config.dim
    }

    /// Live vectors visible to this branch.
    pub fn count_vectors(&self) -> u64 {
        self.total_count() - self.deleted_count()
    }

    /// Slots visible to this branch, deleted ones included.
    pub fn total_count(&self) -> u64 {
        self.state.vector_count as u64
    }

    /// Deleted slots visible to this branch.
    pub fn deleted_count(&self) -> u64 {
        self.edges.deleted_count_below(self.state.vector_count)
    }

    /// Maximum number of vectors the index was created for.
    pub fn capacity(&self) -> u64 {
        self.config.capacity as u64
    }

    /// Free slots left in the shared vector file.
    pub fn remaining_capacity(&self) -> u64 {
        self.capacity() - self.vectors.slot_count() as u64
    }

    /// The external id assigned to a node, falling back to the node id.
    pub(crate) fn external_of(&self, node: NodeId) -> ExternalId {
        self.state
            .metadata
            .get(&node)
            .and_then(|m| m.get(EXTERNAL_ID_FIELD))
            .and_then(|v| match v {
                MetadataValue::Id(id) => Some(id.clone()),
                _ => None,
            })
            .unwrap_or(ExternalId::Int(node.0 as i64))
    }

    /// Resolves a key to a live node.
    pub(crate) fn resolve(&self, key: &IndexKey) -> Result<NodeId> {
        match key {
            IndexKey::External(id) => {
                let node = self
                    .state
                    .external_ids
                    .get(id)
                    .copied()
                    .ok_or_else(|| ValidationError::ExternalIdNotFound(id.to_string()))?;
                if self.edges.is_deleted(node) {
                    return Err(ValidationError::ExternalIdNotFound(id.to_string()).into());
                }
                Ok(node)
            }
            IndexKey::Node(node) => {
                if node.0 >= self.state.vector_count || self.edges.is_deleted(*node) {
                    return Err(ValidationError::NodeNotFound(node.0).into());
                }
                Ok(*node)
            }
        }
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts a vector without an external id.
    pub fn insert(&self, vec: &[f32]) -> Result<Self> {
        self.insert_with(vec, None, None)
    }

    /// Inserts a vector under an external id, with optional metadata.
    pub fn assoc(
        &self,
        external_id: impl Into<ExternalId>,
        vec: &[f32],
        metadata: Option<Metadata>,
    ) -> Result<Self> {
        self.insert_with(vec, Some(external_id.into()), metadata)
    }

    /// The primitive insert.
    ///
    /// Validates inputs before any mutation: a dimension mismatch, a blank
    /// external id, or a collision leaves the index untouched.
    pub fn insert_with(
        &self,
        vec: &[f32],
        external_id: Option<ExternalId>,
        metadata: Option<Metadata>,
    ) -> Result<Self> {
        if vec.len() != self.config.dim {
            return Err(ValidationError::dimension_mismatch(self.config.dim, vec.len()).into());
        }
        if let Some(id) = &external_id {
            id.validate()?;
            if self.state.external_ids.get(id).is_some() {
                return Err(ValidationError::collision(id).into());
            }
        }

        let mut owned = vec.to_vec();
        if self.config.distance.normalizes() {
            normalize(&mut owned);
        }

        let node = self.vectors.append(&owned)?;
        let level = hnsw::sample_level(node, &self.params);

        let edges = self.edges.clone_for_update().as_transient();
        hnsw::insert(&edges, &self.vectors, &self.params, node, level, &owned)?;
        let edges = edges.as_persistent();

        let mut state = self.state.clone();
        state.commit = None;
        state.vector_count = state.vector_count.max(node.0 + 1);
        if external_id.is_some() || metadata.is_some() {
            let mut meta = metadata.unwrap_or_default();
            if let Some(id) = &external_id {
                meta.insert(EXTERNAL_ID_FIELD.to_string(), MetadataValue::Id(id.clone()));
            }
            state.metadata = state.metadata.insert(node, meta);
        }
        if let Some(id) = external_id {
            state.external_ids = state.external_ids.insert(id, node);
        }

        debug!(node = node.0, level, "Inserted vector");

        Ok(Self {
            edges: Arc::new(edges),
            state,
            ..self.clone()
        })
    }

    /// Inserts a batch: node ids are allocated sequentially, levels
    /// sampled, then the per-node construction runs on a worker pool
    /// against one transient edge store protected by chunk stripes.
    pub fn insert_batch(
        &self,
        vecs: &[Vec<f32>],
        external_ids: Option<&[ExternalId]>,
        opts: BatchOptions,
    ) -> Result<Self> {
        use rayon::prelude::*;

        if let Some(ids) = external_ids {
            if ids.len() != vecs.len() {
                return Err(ValidationError::invalid_field(
                    "external_ids",
                    "length must match vectors",
                )
                .into());
            }
            let mut seen = std::collections::BTreeSet::new();
            for id in ids {
                id.validate()?;
                if self.state.external_ids.get(id).is_some() || !seen.insert(id.clone()) {
                    return Err(ValidationError::collision(id).into());
                }
            }
        }
        if let Some(metas) = &opts.metadata {
            if metas.len() != vecs.len() {
                return Err(ValidationError::invalid_field(
                    "metadata",
                    "length must match vectors",
                )
                .into());
            }
        }
        for vec in vecs {
            if vec.len() != self.config.dim {
                return Err(
                    ValidationError::dimension_mismatch(self.config.dim, vec.len()).into(),
                );
            }
        }

        let mut owned: Vec<Vec<f32>> = vecs.to_vec();
        if self.config.distance.normalizes() {
            for vec in &mut owned {
                normalize(vec);
            }
        }

        // Appends are serialized so slot order matches buffer order.
        let mut nodes = Vec::with_capacity(owned.len());
        for vec in &owned {
            nodes.push(self.vectors.append(vec)?);
        }
        let levels: Vec<u8> = nodes
            .iter()
            .map(|&n| hnsw::sample_level(n, &self.params))
            .collect();

        let edges = self.edges.clone_for_update().as_transient();
        let work = || -> Result<()> {
            nodes
                .par_iter()
                .zip(owned.par_iter())
                .zip(levels.par_iter())
                .try_for_each(|((&node, vec), &level)| {
                    hnsw::insert(&edges, &self.vectors, &self.params, node, level, vec)
                })
        };
        match opts.parallelism {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| crate::error::ProximumError::config(e.to_string()))?;
                pool.install(work)?;
            }
            None => work()?,
        }
        let edges = edges.as_persistent();

        let mut state = self.state.clone();
        state.commit = None;
        for (i, &node) in nodes.iter().enumerate() {
            state.vector_count = state.vector_count.max(node.0 + 1);
            let external_id = external_ids.map(|ids| ids[i].clone());
            let metadata = opts.metadata.as_ref().and_then(|m| m[i].clone());
            if external_id.is_some() || metadata.is_some() {
                let mut meta = metadata.unwrap_or_default();
                if let Some(id) = &external_id {
                    meta.insert(EXTERNAL_ID_FIELD.to_string(), MetadataValue::Id(id.clone()));
                }
                state.metadata = state.metadata.insert(node, meta);
            }
            if let Some(id) = external_id {
                state.external_ids = state.external_ids.insert(id, node);
            }
        }

        info!(count = nodes.len(), "Batch inserted");

        Ok(Self {
            edges: Arc::new(edges),
            state,
            ..self.clone()
        })
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Searches for the `k` nearest live vectors.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        self.search_with(query, k, SearchOptions::default())
    }

    /// Search with an explicit beam width and/or output filter.
    pub fn search_with(
        &self,
        query: &[f32],
        k: usize,
        opts: SearchOptions<'_>,
    ) -> Result<Vec<SearchResult>> {
        if query.len() != self.config.dim {
            return Err(ValidationError::dimension_mismatch(self.config.dim, query.len()).into());
        }
        let mut owned = query.to_vec();
        if self.config.distance.normalizes() {
            normalize(&mut owned);
        }

        let bound = self.state.vector_count;
        let edges = &self.edges;
        let keep = move |n: NodeId| n.0 < bound && !edges.is_deleted(n);

        let filter_bitmap = match &opts.filter {
            None => None,
            Some(filter) => Some(self.materialize_filter(filter)?),
        };
        let ef = opts
            .ef
            .unwrap_or_else(|| {
                if filter_bitmap.is_some() {
                    10 * k
                } else {
                    self.config.ef_search()
                }
            })
            .max(k);

        let hits = hnsw::search(&self.edges, &self.vectors, &self.params, &owned, k.max(1), ef, &keep);

        let results = match filter_bitmap {
            None => hits,
            Some(bitmap) => hits
                .into_iter()
                .filter(|h| bitmap.contains(h.node.0))
                .collect(),
        };
        Ok(results
            .into_iter()
            .take(k)
            .map(|h| SearchResult {
                id: self.external_of(h.node),
                distance: h.distance,
            })
            .collect())
    }

    /// Search restricted to a filter (`ef` defaults to `10 * k`).
    pub fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        filter: SearchFilter<'_>,
    ) -> Result<Vec<SearchResult>> {
        self.search_with(
            query,
            k,
            SearchOptions {
                ef: None,
                filter: Some(filter),
            },
        )
    }

    /// The single nearest live vector, if any.
    pub fn nearest(&self, query: &[f32]) -> Result<Option<SearchResult>> {
        Ok(self.search(query, 1)?.into_iter().next())
    }

    /// The nearest vector passing a filter.
    pub fn nearest_filtered(
        &self,
        query: &[f32],
        filter: SearchFilter<'_>,
    ) -> Result<Option<SearchResult>> {
        Ok(self.search_filtered(query, 1, filter)?.into_iter().next())
    }

    fn materialize_filter(&self, filter: &SearchFilter<'_>) -> Result<RoaringBitmap> {
        match filter {
            SearchFilter::Bitmap(bitmap) => Ok((*bitmap).clone()),
            SearchFilter::ExternalIds(ids) => {
                let mut bitmap = RoaringBitmap::new();
                for id in *ids {
                    if let Some(node) = self.state.external_ids.get(id) {
                        bitmap.insert(node.0);
                    }
                }
                Ok(bitmap)
            }
            SearchFilter::Predicate(pred) => {
                let mut bitmap = RoaringBitmap::new();
                for id in 0..self.state.vector_count {
                    let node = NodeId(id);
                    if self.edges.is_deleted(node) {
                        continue;
                    }
                    if pred(node, self.state.metadata.get(&node)) {
                        bitmap.insert(id);
                    }
                }
                Ok(bitmap)
            }
        }
    }

    // =========================================================================
    // Delete / metadata / lookup
    // =========================================================================

    /// Deletes a vector by external id or node id.
    ///
    /// The slot is not reclaimed; the node is tombstoned, its metadata and
    /// external-id entries are cleared, and its neighbors are repaired
    /// from their two-hop neighborhood.
    pub fn delete(&self, key: impl Into<IndexKey>) -> Result<Self> {
        let key = key.into();
        let node = self.resolve(&key)?;

        let edges = self.edges.clone_for_update().as_transient();
        edges.set_deleted(node);
        hnsw::repair_after_delete(
            &edges,
            &self.vectors,
            &self.params,
            node,
            self.state.vector_count,
        )?;
        let edges = edges.as_persistent();

        let mut state = self.state.clone();
        state.commit = None;
        let external = self
            .state
            .metadata
            .get(&node)
            .and_then(|m| m.get(EXTERNAL_ID_FIELD))
            .and_then(|v| match v {
                MetadataValue::Id(id) => Some(id.clone()),
                _ => None,
            });
        if let Some(id) = external {
            state.external_ids = state.external_ids.remove(&id);
        }
        state.metadata = state.metadata.remove(&node);

        debug!(node = node.0, "Deleted vector");

        Ok(Self {
            edges: Arc::new(edges),
            state,
            ..self.clone()
        })
    }

    /// `dissoc` sugar: delete by external id.
    pub fn dissoc(&self, external_id: impl Into<ExternalId>) -> Result<Self> {
        self.delete(IndexKey::External(external_id.into()))
    }

    /// Reads the stored vector for a key.
    pub fn get_vector(&self, key: impl Into<IndexKey>) -> Result<Vec<f32>> {
        let node = self.resolve(&key.into())?;
        Ok(self.vectors.vector(node).to_vec())
    }

    /// `get` sugar: the vector mapped to an external id, if present.
    pub fn get(&self, external_id: impl Into<ExternalId>) -> Result<Option<Vec<f32>>> {
        let id = external_id.into();
        match self.state.external_ids.get(&id) {
            Some(&node) if !self.edges.is_deleted(node) => {
                Ok(Some(self.vectors.vector(node).to_vec()))
            }
            _ => Ok(None),
        }
    }

    /// True if the external id maps to a live vector.
    pub fn contains(&self, external_id: impl Into<ExternalId>) -> bool {
        matches!(
            self.state.external_ids.get(&external_id.into()),
            Some(&node) if !self.edges.is_deleted(node)
        )
    }

    /// Reads the metadata of a key, including the reserved external-id
    /// field.
    pub fn get_metadata(&self, key: impl Into<IndexKey>) -> Result<Option<Metadata>> {
        let node = self.resolve(&key.into())?;
        Ok(self.state.metadata.get(&node).cloned())
    }

    /// Replaces the metadata of a key, preserving the reserved
    /// external-id field.
    pub fn set_metadata(&self, key: impl Into<IndexKey>, metadata: Metadata) -> Result<Self> {
        let node = self.resolve(&key.into())?;

        let mut meta = metadata;
        if let Some(existing) = self
            .state
            .metadata
            .get(&node)
            .and_then(|m| m.get(EXTERNAL_ID_FIELD))
        {
            meta.insert(EXTERNAL_ID_FIELD.to_string(), existing.clone());
        }

        let mut state = self.state.clone();
        state.commit = None;
        state.metadata = if meta.is_empty() {
            state.metadata.remove(&node)
        } else {
            state.metadata.insert(node, meta)
        };
        Ok(Self {
            state,
            ..self.clone()
        })
    }

    // =========================================================================
    // Fork / flush / close
    // =========================================================================

    /// Forks the value: O(1), shared structure, fresh dirty tracking.
    /// Inserts into the fork are invisible to the original.
    pub fn fork(&self) -> Self {
        Self {
            edges: Arc::new(self.edges.fork()),
            ..self.clone()
        }
    }

    /// Fires the async flush of any partial vector chunk without waiting.
    pub fn flush(&self) -> Result<Self> {
        self.vectors.flush_async()?;
        Ok(self.clone())
    }

    /// Flushes and releases the index. Blocks until writes drain; the
    /// mmap file is removed only when tempdir-owned.
    pub fn close(&self) -> Result<()> {
        self.vectors.close()?;
        self.store.flush()?;
        info!(branch = %self.state.branch, "Index closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uuid::Uuid;

    pub(crate) fn test_config(dir: &std::path::Path, dim: usize) -> IndexConfig {
        IndexConfig {
            capacity: 10_000,
            chunk_size: 16,
            store: crate::config::StoreConfig::at(Uuid::new_v4(), dir.join("kv.redb")),
            mmap_dir: Some(dir.to_path_buf()),
            ..IndexConfig::new(dim)
        }
    }

    fn make_vector(seed: u64, dim: usize) -> Vec<f32> {
        (0..dim)
            .map(|i| (seed as f32 * 0.7 + i as f32 * 0.31).sin())
            .collect()
    }

    #[test]
    fn test_create_empty_index() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        assert_eq!(index.count_vectors(), 0);
        assert_eq!(index.current_branch(), "main");
        assert!(index.commit_id().is_none());
        assert!(index.search(&make_vector(0, 8), 3).unwrap().is_empty());
    }

    #[test]
    fn test_insert_then_search_self_identity() {
        let dir = tempdir().unwrap();
        let mut index = Index::create(test_config(dir.path(), 8)).unwrap();
        for seed in 0..20u64 {
            index = index
                .assoc(ExternalId::Str(format!("doc-{}", seed)), &make_vector(seed, 8), None)
                .unwrap();
        }
        for seed in [0u64, 7, 19] {
            let hits = index.search(&make_vector(seed, 8), 1).unwrap();
            assert_eq!(hits[0].id, ExternalId::Str(format!("doc-{}", seed)));
            assert!(hits[0].distance < 1e-5);
        }
    }

    #[test]
    fn test_persistent_map_law() {
        let dir = tempdir().unwrap();
        let base = Index::create(test_config(dir.path(), 8)).unwrap();
        let base = base.assoc("a", &make_vector(1, 8), None).unwrap();

        let derived = base.assoc("b", &make_vector(2, 8), None).unwrap();

        // Old value unchanged; lookups of other keys agree.
        assert_eq!(base.count_vectors(), 1);
        assert_eq!(derived.count_vectors(), 2);
        assert!(base.get("b").unwrap().is_none());
        assert_eq!(base.get("a").unwrap(), derived.get("a").unwrap());
    }

    #[test]
    fn test_collision_rejected_without_mutation() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        let index = index.assoc("dup", &make_vector(1, 8), None).unwrap();

        let err = index.assoc("dup", &make_vector(2, 8), None).unwrap_err();
        assert!(err.is_collision());
        assert_eq!(index.count_vectors(), 1);
        // The stored vector is untouched.
        let hits = index.search(&make_vector(1, 8), 1).unwrap();
        assert!(hits[0].distance < 1e-5);
    }

    #[test]
    fn test_blank_external_id_rejected() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        let err = index.assoc("  ", &make_vector(1, 8), None).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(index.count_vectors(), 0);
    }

    #[test]
    fn test_wrong_dim_rejected() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        assert!(index.insert(&[1.0, 2.0]).is_err());
        assert!(index.search(&[1.0, 2.0], 1).is_err());
    }

    #[test]
    fn test_fork_isolation() {
        let dir = tempdir().unwrap();
        let mut index = Index::create(test_config(dir.path(), 8)).unwrap();
        for seed in 0..10u64 {
            index = index.insert(&make_vector(seed, 8)).unwrap();
        }
        let before: Vec<_> = index.search(&make_vector(3, 8), 5).unwrap();

        let fork = index.fork();
        let _fork = fork.assoc("forked", &make_vector(99, 8), None).unwrap();

        assert_eq!(index.count_vectors(), 10);
        assert_eq!(index.search(&make_vector(3, 8), 5).unwrap(), before);
    }

    #[test]
    fn test_delete_removes_from_results() {
        let dir = tempdir().unwrap();
        let mut index = Index::create(test_config(dir.path(), 8)).unwrap();
        for seed in 0..20u64 {
            index = index
                .assoc(format!("doc-{}", seed), &make_vector(seed, 8), None)
                .unwrap();
        }
        let index = index.dissoc("doc-5").unwrap();

        assert_eq!(index.count_vectors(), 19);
        assert!(!index.contains("doc-5"));
        let hits = index.search(&make_vector(5, 8), 20).unwrap();
        assert!(hits.iter().all(|h| h.id != ExternalId::Str("doc-5".into())));
    }

    #[test]
    fn test_delete_by_node_id() {
        let dir = tempdir().unwrap();
        let mut index = Index::create(test_config(dir.path(), 8)).unwrap();
        for seed in 0..5u64 {
            index = index.insert(&make_vector(seed, 8)).unwrap();
        }
        let index = index.delete(NodeId(2)).unwrap();
        assert_eq!(index.count_vectors(), 4);
        // A second delete of the same node is a contract error.
        assert!(index.delete(NodeId(2)).is_err());
    }

    #[test]
    fn test_metadata_roundtrip_and_reserved_field() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        let mut meta = Metadata::new();
        meta.insert("kind".into(), MetadataValue::Str("article".into()));
        let index = index.assoc("doc-1", &make_vector(1, 8), Some(meta)).unwrap();

        let stored = index.get_metadata("doc-1").unwrap().unwrap();
        assert_eq!(stored.get("kind"), Some(&MetadataValue::Str("article".into())));
        assert_eq!(
            stored.get(EXTERNAL_ID_FIELD),
            Some(&MetadataValue::Id(ExternalId::Str("doc-1".into())))
        );

        // set_metadata preserves the reserved field.
        let mut update = Metadata::new();
        update.insert("kind".into(), MetadataValue::Str("note".into()));
        let index = index.set_metadata("doc-1", update).unwrap();
        let stored = index.get_metadata("doc-1").unwrap().unwrap();
        assert_eq!(stored.get("kind"), Some(&MetadataValue::Str("note".into())));
        assert!(stored.contains_key(EXTERNAL_ID_FIELD));
    }

    #[test]
    fn test_insert_batch_matches_sequential_lookup() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        let vecs: Vec<Vec<f32>> = (0..50).map(|s| make_vector(s, 8)).collect();
        let ids: Vec<ExternalId> = (0..50).map(|s| ExternalId::Str(format!("b-{}", s))).collect();

        let index = index
            .insert_batch(&vecs, Some(&ids), BatchOptions::default())
            .unwrap();
        assert_eq!(index.count_vectors(), 50);
        for seed in [0u64, 25, 49] {
            let hits = index.search(&make_vector(seed, 8), 1).unwrap();
            assert_eq!(hits[0].id, ExternalId::Str(format!("b-{}", seed)));
        }
    }

    #[test]
    fn test_insert_batch_duplicate_id_rejected() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        let vecs = vec![make_vector(0, 8), make_vector(1, 8)];
        let ids = vec![ExternalId::Int(1), ExternalId::Int(1)];
        let err = index
            .insert_batch(&vecs, Some(&ids), BatchOptions::default())
            .unwrap_err();
        assert!(err.is_collision());
        assert_eq!(index.count_vectors(), 0);
    }

    #[test]
    fn test_filtered_search_restricts_output() {
        let dir = tempdir().unwrap();
        let mut index = Index::create(test_config(dir.path(), 8)).unwrap();
        for seed in 0..30u64 {
            let mut meta = Metadata::new();
            meta.insert("even".into(), MetadataValue::Bool(seed % 2 == 0));
            index = index
                .assoc(format!("doc-{}", seed), &make_vector(seed, 8), Some(meta))
                .unwrap();
        }

        let hits = index
            .search_filtered(
                &make_vector(10, 8),
                5,
                SearchFilter::Predicate(&|_, meta| {
                    matches!(
                        meta.and_then(|m| m.get("even")),
                        Some(MetadataValue::Bool(true))
                    )
                }),
            )
            .unwrap();
        assert!(!hits.is_empty());
        for hit in &hits {
            let ExternalId::Str(name) = &hit.id else { panic!() };
            let n: u64 = name.trim_start_matches("doc-").parse().unwrap();
            assert_eq!(n % 2, 0, "odd doc {} passed the filter", n);
        }

        let wanted = [ExternalId::Str("doc-3".into()), ExternalId::Str("doc-4".into())];
        let hits = index
            .search_filtered(&make_vector(3, 8), 2, SearchFilter::ExternalIds(&wanted))
            .unwrap();
        assert!(hits.iter().all(|h| wanted.contains(&h.id)));
    }

    #[test]
    fn test_nodes_without_external_id_surface_as_ints() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        let index = index.insert(&make_vector(4, 8)).unwrap();
        let hit = index.nearest(&make_vector(4, 8)).unwrap().unwrap();
        assert_eq!(hit.id, ExternalId::Int(0));
    }

    #[test]
    fn test_capacity_exceeded() {
        let dir = tempdir().unwrap();
        let config = IndexConfig {
            capacity: 2,
            ..test_config(dir.path(), 8)
        };
        let index = Index::create(config).unwrap();
        let index = index.insert(&make_vector(0, 8)).unwrap();
        let index = index.insert(&make_vector(1, 8)).unwrap();
        let err = index.insert(&make_vector(2, 8)).unwrap_err();
        assert!(err.is_capacity_exceeded());
        assert_eq!(index.remaining_capacity(), 0);
    }

    #[test]
    fn test_cosine_mode_normalizes() {
        let dir = tempdir().unwrap();
        let config = IndexConfig {
            distance: crate::config::DistanceKind::Cosine,
            ..test_config(dir.path(), 4)
        };
        let index = Index::create(config).unwrap();
        // Same direction, different magnitude: cosine distance ~ 0.
        let index = index.assoc("unit", &[2.0, 0.0, 0.0, 0.0], None).unwrap();
        let hit = index.nearest(&[5.0, 0.0, 0.0, 0.0]).unwrap().unwrap();
        assert_eq!(hit.id, ExternalId::Str("unit".into()));
        assert!(hit.distance.abs() < 1e-5);
    }
}
