//! Branching, merging, and resetting.
//!
//! A branch is a name pointing at its latest commit, plus membership in
//! the global `branches` set. Branching copies the mmap vector file (the
//! kernel path is reflink-aware on capable filesystems), forks the edge
//! store, and records the branching point with an initial commit parented
//! on the source head. Merging is add-only and reconciles across branches
//! by external id.

use std::collections::BTreeSet;

use tracing::{info, instrument};

use super::commit::{branch_head, read_commit, rebuild_edges, SyncOptions};
use super::{Index, IndexState};
use crate::error::{BranchError, Result, StorageError, ValidationError};
use crate::storage::schema::{branch_head_key, BRANCHES_KEY};
use crate::storage::{KvStore, PersistentSet};
use crate::types::{CommitId, ExternalId, Metadata, StorageAddress, EXTERNAL_ID_FIELD};
use crate::vector::VectorStore;

/// Options for [`Index::merge`].
#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    /// Commit message for the merge commit.
    pub message: Option<String>,
}

pub(crate) fn read_branches(store: &dyn KvStore) -> Result<BTreeSet<String>> {
    match store.get(BRANCHES_KEY)? {
        Some(bytes) => Ok(bincode::deserialize(&bytes).map_err(StorageError::from)?),
        None => Ok(BTreeSet::new()),
    }
}

pub(crate) fn write_branches(store: &dyn KvStore, branches: &BTreeSet<String>) -> Result<()> {
    let bytes = bincode::serialize(branches).map_err(StorageError::from)?;
    store.put(BRANCHES_KEY, &bytes)
}

impl Index {
    /// Known branch names, sorted.
    pub fn branches(&self) -> Result<Vec<String>> {
        Ok(read_branches(self.store.as_ref())?.into_iter().collect())
    }

    /// Creates a branch at the current commit and switches to it.
    ///
    /// Requires a committed value: branch before the first sync (or with
    /// uncommitted mutations) is refused, since the new branch's initial
    /// commit must capture durable state.
    #[instrument(skip(self), fields(from = %self.state.branch))]
    pub fn branch(&self, name: &str) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(ValidationError::invalid_field("branch", "must not be blank").into());
        }
        let source_commit = self
            .state
            .commit
            .ok_or_else(|| BranchError::NoCommits(self.state.branch.clone()))?;

        let mut branches = read_branches(self.store.as_ref())?;
        if branches.contains(name) {
            return Err(BranchError::Exists(name.to_string()).into());
        }

        // O(1) on reflink filesystems, byte copy elsewhere.
        let target_path = self.config.mmap_path_for(name);
        self.vectors.copy_to(&target_path)?;
        let (vectors, _count) = VectorStore::open(
            &target_path,
            self.config.dim,
            self.config.capacity,
            self.config.chunk_size,
            self.config.crypto_hash,
            std::sync::Arc::clone(&self.store),
        )?;

        branches.insert(name.to_string());
        write_branches(self.store.as_ref(), &branches)?;

        let branched = Self {
            vectors,
            edges: std::sync::Arc::new(self.edges.fork()),
            state: IndexState {
                branch: name.to_string(),
                commit: None,
                ..self.state.clone()
            },
            ..self.clone()
        };

        // Record the branching point in the DAG.
        let committed = branched.sync_with(SyncOptions {
            message: Some(format!("branch from {}", self.state.branch)),
            parents: Some(vec![source_commit]),
        })?;

        info!(branch = name, parent = %source_commit, "Branch created");
        Ok(committed)
    }

    /// Unregisters a branch and removes its head pointer.
    ///
    /// Commits and chunks reachable only from the deleted branch become
    /// garbage for the next [`gc`](Index::gc) pass.
    pub fn delete_branch(&self, name: &str) -> Result<()> {
        if name == self.state.branch {
            return Err(BranchError::CannotDeleteCurrent(name.to_string()).into());
        }
        let mut branches = read_branches(self.store.as_ref())?;
        if !branches.remove(name) {
            return Err(BranchError::NotFound(name.to_string()).into());
        }
        write_branches(self.store.as_ref(), &branches)?;
        self.store.delete(&branch_head_key(name))?;
        info!(branch = name, "Branch deleted");
        Ok(())
    }

    /// Merges another branch into this one: add-only union keyed by
    /// external id.
    ///
    /// A vector present on both sides with identical bytes and metadata is
    /// skipped; the same external id with diverging content aborts with a
    /// collision and nothing is committed. The merge commit records both
    /// heads as parents.
    #[instrument(skip(self, opts), fields(ours = %self.state.branch, theirs = other_branch))]
    pub fn merge(&self, other_branch: &str, opts: MergeOptions) -> Result<Self> {
        let ours = self
            .state
            .commit
            .ok_or_else(|| BranchError::NoCommits(self.state.branch.clone()))?;
        let branches = read_branches(self.store.as_ref())?;
        if !branches.contains(other_branch) {
            return Err(BranchError::NotFound(other_branch.to_string()).into());
        }
        let theirs = branch_head(self.store.as_ref(), other_branch)?
            .ok_or_else(|| BranchError::NoCommits(other_branch.to_string()))?;

        // Read the other branch cold, straight from its committed state:
        // no mmap file is touched, so a live writer on that branch does
        // not conflict.
        let their_commit = read_commit(self.store.as_ref(), theirs)?;
        let their_external_ids: PersistentSet<ExternalId, crate::types::NodeId> =
            PersistentSet::load(self.store.as_ref(), their_commit.external_id_root)?;
        let their_metadata: PersistentSet<crate::types::NodeId, Metadata> =
            PersistentSet::load(self.store.as_ref(), their_commit.metadata_root)?;
        let their_vectors_addr: PersistentSet<u64, StorageAddress> =
            PersistentSet::load(self.store.as_ref(), their_commit.vectors_addr_root)?;
        let their_deleted =
            roaring::RoaringBitmap::deserialize_from(their_commit.deleted_nodes.as_slice())
                .map_err(|e| StorageError::corrupted(format!("Bad deleted bitmap: {}", e)))?;

        let mut merged = self.clone();
        let mut added = 0u64;
        for (external_id, &their_node) in their_external_ids.iter() {
            if their_deleted.contains(their_node.0) {
                continue;
            }
            let their_vec = cold_vector(
                self.store.as_ref(),
                &their_vectors_addr,
                self.config.chunk_size,
                self.config.dim,
                their_node,
            )?;
            let their_meta = strip_reserved(their_metadata.get(&their_node));

            match merged.state.external_ids.get(external_id) {
                Some(&our_node) if !merged.edges.is_deleted(our_node) => {
                    let our_vec = merged.vectors.vector(our_node);
                    let our_meta = strip_reserved(merged.state.metadata.get(&our_node));
                    if our_vec != their_vec.as_slice() || our_meta != their_meta {
                        return Err(ValidationError::collision(external_id).into());
                    }
                }
                _ => {
                    merged = merged.insert_with(
                        &their_vec,
                        Some(external_id.clone()),
                        their_meta,
                    )?;
                    added += 1;
                }
            }
        }

        let committed = merged.sync_with(SyncOptions {
            message: opts.message.or_else(|| {
                Some(format!("merge {} into {}", other_branch, self.state.branch))
            }),
            parents: Some(vec![ours, theirs]),
        })?;

        info!(added, "Merged");
        Ok(committed)
    }

    /// Moves the branch head to an older commit and reloads that
    /// snapshot's state. The shared vector file is reused as-is; slots
    /// past the snapshot's count simply become invisible.
    #[instrument(skip(self), fields(branch = %self.state.branch))]
    pub fn reset(&self, commit_id: CommitId) -> Result<Self> {
        let mut commit = read_commit(self.store.as_ref(), commit_id)?;
        commit.branch = self.state.branch.clone();

        self.store
            .put(&branch_head_key(&self.state.branch), commit_id.0.as_bytes())?;

        let metadata = PersistentSet::load(self.store.as_ref(), commit.metadata_root)?;
        let external_ids = PersistentSet::load(self.store.as_ref(), commit.external_id_root)?;
        let vectors_addr: PersistentSet<u64, StorageAddress> =
            PersistentSet::load(self.store.as_ref(), commit.vectors_addr_root)?;
        let edges_addr: PersistentSet<u64, StorageAddress> =
            PersistentSet::load(self.store.as_ref(), commit.edges_addr_root)?;
        let edges = rebuild_edges(&self.config, &self.store, &commit, &edges_addr)?;

        info!(commit = %commit_id, "Reset");

        Ok(Self {
            edges: std::sync::Arc::new(edges),
            state: IndexState {
                branch: self.state.branch.clone(),
                commit: Some(commit_id),
                vector_count: commit.branch_vector_count,
                metadata,
                external_ids,
                vectors_addr,
                edges_addr,
            },
            ..self.clone()
        })
    }
}

/// Reads one vector of a committed branch from its KV chunks.
fn cold_vector(
    store: &dyn KvStore,
    vectors_addr: &PersistentSet<u64, StorageAddress>,
    chunk_size: usize,
    dim: usize,
    node: crate::types::NodeId,
) -> Result<Vec<f32>> {
    let chunk = node.0 as u64 / chunk_size as u64;
    let addr = vectors_addr
        .get(&chunk)
        .copied()
        .ok_or_else(|| crate::error::IntegrityError::ChunkNotFound {
            position: chunk,
            storage_addr: "<unmapped>".to_string(),
        })?;
    let bytes = store
        .get(&crate::storage::schema::vector_chunk_key(addr))?
        .ok_or_else(|| crate::error::IntegrityError::ChunkNotFound {
            position: chunk,
            storage_addr: addr.to_string(),
        })?;
    let offset = (node.0 as usize % chunk_size) * dim * 4;
    if offset + dim * 4 > bytes.len() {
        return Err(StorageError::corrupted("Vector past end of chunk payload").into());
    }
    let mut vec = Vec::with_capacity(dim);
    for quad in bytes[offset..offset + dim * 4].chunks_exact(4) {
        vec.push(f32::from_le_bytes(quad.try_into().unwrap()));
    }
    Ok(vec)
}

/// Metadata with the reserved external-id field removed, `None` when
/// nothing else remains.
fn strip_reserved(metadata: Option<&Metadata>) -> Option<Metadata> {
    let mut meta = metadata?.clone();
    meta.remove(EXTERNAL_ID_FIELD);
    if meta.is_empty() {
        None
    } else {
        Some(meta)
    }
}
