//! Configuration types for Proximum indexes.
//!
//! [`IndexConfig`] controls index geometry (dimension, HNSW parameters,
//! capacity), the distance metric, content addressing, and where the
//! backing KV store and mmap vector file live.
//!
//! # Example
//! ```rust
//! use proximum::{IndexConfig, StoreConfig, DistanceKind};
//!
//! let config = IndexConfig {
//!     dim: 384,
//!     distance: DistanceKind::Cosine,
//!     store: StoreConfig::new(uuid::Uuid::new_v4()),
//!     ..IndexConfig::new(384)
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Distance metric used for construction and search.
///
/// Cosine mode L2-normalizes vectors on write and on query and computes
/// `1 - dot`; inner-product mode ranks by negative dot product.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistanceKind {
    /// Squared Euclidean distance.
    #[default]
    Euclidean,
    /// Cosine distance over normalized vectors.
    Cosine,
    /// Negative inner product (larger dot = closer).
    InnerProduct,
}

impl DistanceKind {
    /// Returns true if vectors must be L2-normalized before storage.
    #[inline]
    pub fn normalizes(&self) -> bool {
        matches!(self, Self::Cosine)
    }
}

/// Location of the durable key/value store backing an index.
///
/// The `id` is mandatory and names the store across opens; the path
/// defaults to `proximum-{id}.redb` under the system tempdir.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Stable identity of this store.
    pub id: Uuid,

    /// Path of the redb file. `None` derives a tempdir path from `id`.
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Creates a store config with a derived tempdir path.
    pub fn new(id: Uuid) -> Self {
        Self { id, path: None }
    }

    /// Creates a store config with an explicit path.
    pub fn at(id: Uuid, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: Some(path.into()),
        }
    }

    /// Resolves the redb file path.
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("proximum-{}.redb", self.id)))
    }
}

/// Index configuration.
///
/// All fields except `dim` and `store` have sensible defaults; use struct
/// update syntax to override specific settings.
#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// Vector dimensionality. Immutable for the life of the index.
    pub dim: usize,

    /// Maximum bidirectional connections per node above layer 0 (M).
    /// Layer 0 allows `2 * M`.
    /// Default: 16
    pub m: usize,

    /// Beam width during construction. `None` resolves to 200.
    pub ef_construction: Option<usize>,

    /// Beam width during search. `None` resolves to 50.
    pub ef_search: Option<usize>,

    /// Distance metric.
    pub distance: DistanceKind,

    /// Maximum number of vectors the mmap file is sized for.
    /// Default: 10_000_000
    pub capacity: u32,

    /// Maximum graph level. `None` derives `ceil(ln(capacity) / ln(M))`.
    pub max_levels: Option<u8>,

    /// Vectors per KV chunk.
    /// Default: 1000
    pub chunk_size: usize,

    /// Bound on resident edge chunks; clean chunks beyond it are evicted
    /// after a commit and reload lazily.
    /// Default: 10_000
    pub cache_size: usize,

    /// Branch this index value starts on.
    /// Default: "main"
    pub branch: String,

    /// Content addressing: storage addresses and commit ids become
    /// SHA-512-derived, enabling dedup and `verify_from_cold`.
    pub crypto_hash: bool,

    /// Backing KV store location.
    pub store: StoreConfig,

    /// Directory for mmap vector files. `None` uses the system tempdir.
    pub mmap_dir: Option<PathBuf>,

    /// Explicit mmap file path override (testing / pre-seeded files).
    pub mmap_path: Option<PathBuf>,
}

impl IndexConfig {
    /// Creates a config for the given dimension with a fresh random store id.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            m: 16,
            ef_construction: None,
            ef_search: None,
            distance: DistanceKind::default(),
            capacity: 10_000_000,
            max_levels: None,
            chunk_size: 1000,
            cache_size: 10_000,
            branch: "main".to_string(),
            crypto_hash: false,
            store: StoreConfig::new(Uuid::new_v4()),
            mmap_dir: None,
            mmap_path: None,
        }
    }

    /// Maximum neighbors at layer 0.
    #[inline]
    pub fn m0(&self) -> usize {
        self.m * 2
    }

    /// Level-sampling parameter `1 / ln(M)`.
    #[inline]
    pub fn ml(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }

    /// Resolved construction beam width.
    #[inline]
    pub fn ef_construction(&self) -> usize {
        self.ef_construction.unwrap_or(200)
    }

    /// Resolved search beam width.
    #[inline]
    pub fn ef_search(&self) -> usize {
        self.ef_search.unwrap_or(50)
    }

    /// Resolved maximum level, derived from capacity when not set.
    pub fn max_level(&self) -> u8 {
        self.max_levels.unwrap_or_else(|| {
            let derived = ((self.capacity.max(2) as f64).ln() / (self.m as f64).ln()).ceil();
            derived.min(16.0) as u8
        })
    }

    /// Resolves the mmap file path for the given branch.
    pub fn mmap_path_for(&self, branch: &str) -> PathBuf {
        if let Some(path) = &self.mmap_path {
            return path.clone();
        }
        let dir = self
            .mmap_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        dir.join(format!("vectors-{}-{}.bin", self.store.id, branch))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `ValidationError` if `dim`, `m`, `chunk_size`, `capacity`,
    /// or the resolved beam widths are zero, or the branch name is blank.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.dim == 0 {
            return Err(ValidationError::invalid_field("dim", "must be greater than 0"));
        }
        if self.dim > 4096 {
            return Err(ValidationError::invalid_field(
                "dim",
                "must not exceed 4096",
            ));
        }
        if self.m < 2 {
            return Err(ValidationError::invalid_field("m", "must be at least 2"));
        }
        if self.capacity == 0 {
            return Err(ValidationError::invalid_field(
                "capacity",
                "must be greater than 0",
            ));
        }
        if self.chunk_size == 0 {
            return Err(ValidationError::invalid_field(
                "chunk_size",
                "must be greater than 0",
            ));
        }
        if self.ef_construction() == 0 {
            return Err(ValidationError::invalid_field(
                "ef_construction",
                "must be greater than 0",
            ));
        }
        if self.ef_search() == 0 {
            return Err(ValidationError::invalid_field(
                "ef_search",
                "must be greater than 0",
            ));
        }
        if self.branch.trim().is_empty() {
            return Err(ValidationError::invalid_field(
                "branch",
                "must not be blank",
            ));
        }
        Ok(())
    }
}
