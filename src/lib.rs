//! # Proximum
//!
//! A persistent, versioned vector store with approximate nearest-neighbor
//! search over high-dimensional embeddings.
//!
//! The core is an HNSW graph over a chunked copy-on-write edge store.
//! Vectors are cached in a memory-mapped file for SIMD distance kernels
//! while the durable copy lives as content-addressable chunks in an
//! embedded key/value store. Indexes behave like persistent maps keyed by
//! external identifiers, with git-like branching, commits, merges, and
//! time travel layered on top.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use proximum::{Index, IndexConfig};
//!
//! // Create an index for 384-dimensional embeddings
//! let index = Index::create(IndexConfig::new(384))?;
//!
//! // Insert vectors under external ids (each call returns a new value)
//! let index = index.assoc("doc-1", &embedding, None)?;
//!
//! // Commit: durable snapshot, branch head advances
//! let index = index.sync()?;
//!
//! // Search
//! let hits = index.search(&query, 10)?;
//!
//! // Branch, mutate, merge back
//! let feature = index.branch("feature")?;
//! let feature = feature.assoc("doc-2", &other, None)?.sync()?;
//! let index = index.merge("feature", Default::default())?;
//! ```
//!
//! ## Key Concepts
//!
//! ### Index values
//!
//! An [`Index`] is an immutable value: mutating operations return a new
//! value sharing structure with the old one, so `fork` is O(1) and older
//! values keep reading their own state.
//!
//! ### Commits and branches
//!
//! [`Index::sync`] writes a commit snapshot and moves the branch head;
//! [`Index::load_commit`] restores any historical commit. Branch heads
//! form a DAG with merge commits recording both parents.
//!
//! ### Content addressing
//!
//! With `crypto_hash` enabled, chunk addresses and commit ids derive from
//! SHA-512 over the content, giving deduplication, deterministic commit
//! ids, and [`Index::verify_from_cold`] tamper detection.
//!
//! ## Thread Safety
//!
//! `Index` is `Send + Sync` and cheap to clone. A single writer per
//! branch is assumed; readers are always safe. Batch construction uses a
//! parallel worker pool over striped chunk locks.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

// ============================================================================
// Module declarations
// ============================================================================

mod config;
mod error;
mod types;

pub mod graph;
pub mod index;
pub mod storage;
pub mod vector;

// ============================================================================
// Public API re-exports
// ============================================================================

// Main index interface
pub use index::branch::MergeOptions;
pub use index::commit::{Commit, SyncHandle, SyncOptions};
pub use index::compaction::{CompactionOptions, CompactionProgress, CompactionState};
pub use index::gc::GcOptions;
pub use index::metrics::{IndexMetrics, VerifyReport};
pub use index::{BatchOptions, Index, IndexKey, SearchFilter, SearchOptions, SearchResult};

// Configuration
pub use config::{DistanceKind, IndexConfig, StoreConfig};

// Error handling
pub use error::{
    BranchError, CompactionError, IntegrityError, ProximumError, Result, StorageError,
    ValidationError,
};

// Core types
pub use types::{
    CommitId, ExternalId, Metadata, MetadataValue, NodeId, StorageAddress, Timestamp,
    EXTERNAL_ID_FIELD,
};

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common Proximum usage.
///
/// ```rust
/// use proximum::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{DistanceKind, IndexConfig, StoreConfig};
    pub use crate::error::{ProximumError, Result};
    pub use crate::index::{Index, SearchFilter, SearchResult};
    pub use crate::types::{ExternalId, Metadata, MetadataValue, Timestamp};
}
