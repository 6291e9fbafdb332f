//! Persisted key layout and the immutable index config record.
//!
//! All state lives in one logical key space:
//!
//! ```text
//! index/config              immutable meta (JSON IndexConfigRecord)
//! branches                  bincode set of branch names
//! branch/<name>             16-byte commit id of the branch head
//! commit/<uuid>             bincode commit snapshot
//! vectors/chunk/<uuid>      chunk-size * dim * 4 bytes of f32, little-endian
//! edges/chunk/<uuid>        neighbor i32 array of the chunk, little-endian
//! pss/<uuid>                page of the ordered-set persistence
//! ```
//!
//! `index/config` and `branches` are the only well-known keys; everything
//! else is reached from a branch head. The garbage collector never removes
//! those two.

use serde::{Deserialize, Serialize};

use crate::config::{DistanceKind, IndexConfig};
use crate::error::{ProximumError, Result};
use crate::types::{CommitId, StorageAddress};

/// Current persisted-format version.
///
/// Bump on breaking changes; `load` refuses mismatched stores.
pub const FORMAT_VERSION: u32 = 1;

/// Well-known key of the immutable index configuration.
pub const INDEX_CONFIG_KEY: &[u8] = b"index/config";

/// Well-known key of the branch-name set.
pub const BRANCHES_KEY: &[u8] = b"branches";

/// Key of a branch head: `branch/<name>` → commit id bytes.
pub fn branch_head_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(7 + name.len());
    key.extend_from_slice(b"branch/");
    key.extend_from_slice(name.as_bytes());
    key
}

/// Key of a commit snapshot.
pub fn commit_key(id: CommitId) -> Vec<u8> {
    format!("commit/{}", id).into_bytes()
}

/// Key of a vector chunk payload.
pub fn vector_chunk_key(addr: StorageAddress) -> Vec<u8> {
    format!("vectors/chunk/{}", addr).into_bytes()
}

/// Key of an edge chunk payload.
pub fn edge_chunk_key(addr: StorageAddress) -> Vec<u8> {
    format!("edges/chunk/{}", addr).into_bytes()
}

/// Key of a PSS page.
pub fn pss_page_key(addr: StorageAddress) -> Vec<u8> {
    format!("pss/{}", addr).into_bytes()
}

/// The immutable part of an index, written once at create time.
///
/// Stored as JSON under [`INDEX_CONFIG_KEY`] so it stays readable with
/// plain tools when debugging a store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexConfigRecord {
    /// Index type tag for restorer dispatch on load.
    pub index_type: String,

    /// Persisted-format version.
    pub version: u32,

    /// Vector dimensionality.
    pub dim: usize,

    /// Max neighbors above layer 0.
    pub m: usize,

    /// Max neighbors at layer 0.
    pub m0: usize,

    /// Capacity the mmap file is sized for.
    pub max_nodes: u32,

    /// Maximum graph level.
    pub max_level: u8,

    /// Vectors per KV chunk.
    pub chunk_size: usize,

    /// Distance metric.
    pub distance: DistanceKind,

    /// Whether storage addresses and commit ids are content-derived.
    pub crypto_hash: bool,
}

impl IndexConfigRecord {
    /// Builds the record from a resolved config.
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            index_type: "hnsw".to_string(),
            version: FORMAT_VERSION,
            dim: config.dim,
            m: config.m,
            m0: config.m0(),
            max_nodes: config.capacity,
            max_level: config.max_level(),
            chunk_size: config.chunk_size,
            distance: config.distance,
            crypto_hash: config.crypto_hash,
        }
    }

    /// Serializes to the stored JSON form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| crate::error::StorageError::serialization(e.to_string()).into())
    }

    /// Parses the stored JSON form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::error::StorageError::corrupted(format!("Bad config record: {}", e)).into())
    }

    /// Checks that an open-time config is compatible with this record.
    pub fn check_compatible(&self, config: &IndexConfig) -> Result<()> {
        if self.version != FORMAT_VERSION {
            return Err(crate::error::StorageError::VersionMismatch {
                expected: FORMAT_VERSION,
                found: self.version,
            }
            .into());
        }
        if self.dim != config.dim {
            return Err(ProximumError::config(format!(
                "dim mismatch: store has {}, config asks {}",
                self.dim, config.dim
            )));
        }
        if self.m != config.m {
            return Err(ProximumError::config(format!(
                "M mismatch: store has {}, config asks {}",
                self.m, config.m
            )));
        }
        if self.chunk_size != config.chunk_size {
            return Err(ProximumError::config(format!(
                "chunk_size mismatch: store has {}, config asks {}",
                self.chunk_size, config.chunk_size
            )));
        }
        if self.distance != config.distance {
            return Err(ProximumError::config(
                "distance metric mismatch with stored index",
            ));
        }
        if self.crypto_hash != config.crypto_hash {
            return Err(ProximumError::config(
                "content-addressing mode mismatch with stored index",
            ));
        }
        Ok(())
    }
}
