//! Observability: per-index metrics and cold-state verification.

use tracing::instrument;

use super::branch::read_branches;
use super::commit::{branch_head, read_commit, read_config_record};
use super::Index;
use crate::config::StoreConfig;
use crate::error::{BranchError, IntegrityError, Result};
use crate::storage::schema::{edge_chunk_key, vector_chunk_key};
use crate::storage::{KvStore, PersistentSet};
use crate::types::{CommitId, NodeId, StorageAddress};

/// A metrics snapshot of an index value.
#[derive(Clone, Debug)]
pub struct IndexMetrics {
    /// Branch of the value.
    pub branch: String,
    /// Commit id, `None` with uncommitted mutations.
    pub commit: Option<CommitId>,
    /// Live vectors (`total - deleted`).
    pub vector_count: u64,
    /// Slots visible to the branch, deleted included.
    pub total_count: u64,
    /// Deleted slots visible to the branch.
    pub deleted_count: u64,
    /// `deleted / total`, zero for an empty index.
    pub deletion_ratio: f64,
    /// Total bidirectional edges over the resident graph.
    pub edge_count: u64,
    /// HNSW entry point.
    pub entry_point: Option<NodeId>,
    /// Level of the entry point.
    pub current_max_level: u8,
    /// Edge chunks currently resident in memory.
    pub resident_chunks: usize,
    /// True when the deletion ratio crossed the compaction threshold.
    pub needs_compaction: bool,
}

/// Result of verifying a branch purely from cold storage.
#[derive(Clone, Debug)]
pub struct VerifyReport {
    /// All referenced chunks present (and matching their hashes when
    /// content addressing is on).
    pub valid: bool,
    /// Vector chunks checked.
    pub vectors_verified: u64,
    /// Edge chunks checked.
    pub edges_verified: u64,
    /// Head commit that was verified.
    pub commit_id: Option<CommitId>,
    /// First problem encountered, if any.
    pub error: Option<String>,
}

impl Index {
    /// Computes a metrics snapshot.
    ///
    /// `compaction_threshold` is the deletion ratio above which
    /// `needs_compaction` trips; it defaults to 0.3.
    pub fn metrics(&self, compaction_threshold: Option<f64>) -> IndexMetrics {
        let total = self.total_count();
        let deleted = self.deleted_count();
        let ratio = if total == 0 {
            0.0
        } else {
            deleted as f64 / total as f64
        };
        IndexMetrics {
            branch: self.state.branch.clone(),
            commit: self.state.commit,
            vector_count: total - deleted,
            total_count: total,
            deleted_count: deleted,
            deletion_ratio: ratio,
            edge_count: self.edges.count_edges(),
            entry_point: self.edges.entry_point(),
            current_max_level: self.edges.current_max_level(),
            resident_chunks: self.edges.resident_chunks(),
            needs_compaction: ratio >= compaction_threshold.unwrap_or(0.3),
        }
    }

    /// Structural oracle over the live graph: no self-loops, no
    /// duplicate neighbors, no out-of-range targets, and every edge
    /// bidirectional. Intended for tests and debugging.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        crate::graph::hnsw::check_invariants(&self.edges, self.state.vector_count)
    }

    /// Verifies a branch head using only the KV store: every chunk
    /// referenced by the head commit's address maps must be present, and
    /// must re-hash to its address when content addressing is enabled.
    ///
    /// Problems are reported structurally, not raised.
    #[instrument(skip(store_config))]
    pub fn verify_from_cold(store_config: &StoreConfig, branch: &str) -> Result<VerifyReport> {
        let store = crate::storage::open_store(store_config)?;
        match verify_inner(store.as_ref(), branch) {
            Ok((vectors_verified, edges_verified, commit_id)) => Ok(VerifyReport {
                valid: true,
                vectors_verified,
                edges_verified,
                commit_id: Some(commit_id),
                error: None,
            }),
            Err(err) => Ok(VerifyReport {
                valid: false,
                vectors_verified: 0,
                edges_verified: 0,
                commit_id: None,
                error: Some(err.to_string()),
            }),
        }
    }
}

fn verify_inner(store: &dyn KvStore, branch: &str) -> Result<(u64, u64, CommitId)> {
    let record = read_config_record(store)?;
    if !read_branches(store)?.contains(branch) {
        return Err(BranchError::NotFound(branch.to_string()).into());
    }
    let head = branch_head(store, branch)?
        .ok_or_else(|| BranchError::NoCommits(branch.to_string()))?;
    let commit = read_commit(store, head)?;

    let vectors_addr: PersistentSet<u64, StorageAddress> =
        PersistentSet::load(store, commit.vectors_addr_root)?;
    let mut vectors_verified = 0u64;
    for (&position, &addr) in vectors_addr.iter() {
        let bytes = store.get(&vector_chunk_key(addr))?.ok_or_else(|| {
            IntegrityError::ChunkNotFound {
                position,
                storage_addr: addr.to_string(),
            }
        })?;
        if record.crypto_hash {
            let actual = StorageAddress::from_content(&bytes);
            if actual != addr {
                return Err(IntegrityError::HashMismatch {
                    position,
                    expected: addr.to_string(),
                    actual: actual.to_string(),
                }
                .into());
            }
        }
        vectors_verified += 1;
    }

    let edges_addr: PersistentSet<u64, StorageAddress> =
        PersistentSet::load(store, commit.edges_addr_root)?;
    let mut edges_verified = 0u64;
    for (&position, &addr) in edges_addr.iter() {
        let bytes = store.get(&edge_chunk_key(addr))?.ok_or_else(|| {
            IntegrityError::ChunkNotFound {
                position,
                storage_addr: addr.to_string(),
            }
        })?;
        if record.crypto_hash {
            let actual = StorageAddress::from_content(&bytes);
            if actual != addr {
                return Err(IntegrityError::HashMismatch {
                    position,
                    expected: addr.to_string(),
                    actual: actual.to_string(),
                }
                .into());
            }
        }
        edges_verified += 1;
    }

    Ok((vectors_verified, edges_verified, head))
}
