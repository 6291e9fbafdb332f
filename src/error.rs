//! Error types for Proximum.
//!
//! Proximum uses a hierarchical error system:
//! - `ProximumError` is the top-level error returned by all public APIs
//! - Category enums (`StorageError`, `ValidationError`, `BranchError`,
//!   `CompactionError`, `IntegrityError`) provide detail
//!
//! Caller-contract errors (bad dimension, empty external id, capacity,
//! collisions) are raised synchronously and never mutate visible state.
//! I/O errors surface through `sync`; the branch head is not advanced and
//! the index value stays usable for reads and retry.

use thiserror::Error;

/// Result type alias for Proximum operations.
pub type Result<T> = std::result::Result<T, ProximumError>;

/// Top-level error enum for all Proximum operations.
///
/// This is the only error type returned by public APIs.
/// Use pattern matching to handle specific error cases.
#[derive(Debug, Error)]
pub enum ProximumError {
    /// Storage layer error (I/O, corruption, transactions).
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Input validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Branch or commit bookkeeping error.
    #[error("Branch error: {0}")]
    Branch(#[from] BranchError),

    /// Online/offline compaction error.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Content-addressing integrity error.
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProximumError {
    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns true if this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a storage error.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is a branch/commit error.
    pub fn is_branch(&self) -> bool {
        matches!(self, Self::Branch(_))
    }

    /// Returns true if this is an external-id collision.
    pub fn is_collision(&self) -> bool {
        matches!(
            self,
            Self::Validation(ValidationError::ExtIdCollision { .. })
        )
    }

    /// Returns true if the index capacity was exceeded.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(
            self,
            Self::Validation(ValidationError::CapacityExceeded { .. })
        )
    }
}

/// Storage-related errors.
///
/// These errors indicate problems with the underlying key/value store
/// or the mmap vector file.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Store file or data is corrupted.
    #[error("Store corrupted: {0}")]
    Corrupted(String),

    /// Store is locked by another writer.
    #[error("Store is locked by another writer")]
    Locked,

    /// Transaction failed (commit, rollback, etc.).
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error from the redb storage engine.
    #[error("Storage engine error: {0}")]
    Redb(String),

    /// A required key was missing from the store.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Persisted format version doesn't match expected version.
    #[error("Format version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected format version.
        expected: u32,
        /// Actual version found in the store.
        found: u32,
    },

    /// The background writer is gone; its channel is closed.
    #[error("Background writer unavailable")]
    WriterGone,
}

impl StorageError {
    /// Creates a corruption error with the given message.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Creates a transaction error with the given message.
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Creates a serialization error with the given message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Creates a key-not-found error for the given key.
    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::KeyNotFound(key.into())
    }
}

// Conversions from redb error types
impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        StorageError::Redb(err.to_string())
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        StorageError::Redb(err.to_string())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::Transaction(err.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::Transaction(format!("Commit failed: {}", err))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        StorageError::Redb(format!("Table error: {}", err))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        StorageError::Redb(format!("Storage error: {}", err))
    }
}

// Convert bincode errors to StorageError
impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

// Also allow direct conversion to ProximumError for convenience
impl From<redb::Error> for ProximumError {
    fn from(err: redb::Error) -> Self {
        ProximumError::Storage(StorageError::from(err))
    }
}

impl From<redb::DatabaseError> for ProximumError {
    fn from(err: redb::DatabaseError) -> Self {
        ProximumError::Storage(StorageError::from(err))
    }
}

impl From<redb::TransactionError> for ProximumError {
    fn from(err: redb::TransactionError) -> Self {
        ProximumError::Storage(StorageError::from(err))
    }
}

impl From<redb::CommitError> for ProximumError {
    fn from(err: redb::CommitError) -> Self {
        ProximumError::Storage(StorageError::from(err))
    }
}

impl From<redb::TableError> for ProximumError {
    fn from(err: redb::TableError) -> Self {
        ProximumError::Storage(StorageError::from(err))
    }
}

impl From<redb::StorageError> for ProximumError {
    fn from(err: redb::StorageError) -> Self {
        ProximumError::Storage(StorageError::from(err))
    }
}

impl From<bincode::Error> for ProximumError {
    fn from(err: bincode::Error) -> Self {
        ProximumError::Storage(StorageError::from(err))
    }
}

/// Validation errors for input data.
///
/// These errors indicate problems with data provided by the caller.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Vector dimension doesn't match the index's configured dimension.
    #[error("Vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected dimension from index configuration.
        expected: usize,
        /// Actual dimension provided.
        got: usize,
    },

    /// External id was empty or blank.
    #[error("External id must not be empty or blank")]
    EmptyExternalId,

    /// External id already maps to a different node.
    #[error("External id collision: {external_id}")]
    ExtIdCollision {
        /// Display form of the colliding external id.
        external_id: String,
    },

    /// The index has no free slots left.
    #[error("Capacity exceeded: {capacity} vectors")]
    CapacityExceeded {
        /// Configured capacity of the index.
        capacity: u64,
    },

    /// A field has an invalid value.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Name of the invalid field.
        field: String,
        /// Why the value is invalid.
        reason: String,
    },

    /// The referenced node does not exist or is deleted.
    #[error("Node not found: {0}")]
    NodeNotFound(u32),

    /// No node is mapped to the given external id.
    #[error("External id not found: {0}")]
    ExternalIdNotFound(String),
}

impl ValidationError {
    /// Creates a dimension mismatch error.
    pub fn dimension_mismatch(expected: usize, got: usize) -> Self {
        Self::DimensionMismatch { expected, got }
    }

    /// Creates an external-id collision error.
    pub fn collision(external_id: impl ToString) -> Self {
        Self::ExtIdCollision {
            external_id: external_id.to_string(),
        }
    }

    /// Creates a capacity-exceeded error.
    pub fn capacity_exceeded(capacity: u64) -> Self {
        Self::CapacityExceeded { capacity }
    }

    /// Creates an invalid field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Branch and commit bookkeeping errors.
#[derive(Debug, Error)]
pub enum BranchError {
    /// A branch with this name already exists.
    #[error("Branch already exists: {0}")]
    Exists(String),

    /// No branch with this name is registered.
    #[error("Branch not found: {0}")]
    NotFound(String),

    /// The current branch of an index value cannot be deleted.
    #[error("Cannot delete current branch: {0}")]
    CannotDeleteCurrent(String),

    /// Branching requires at least one commit on the source branch.
    #[error("Branch '{0}' has no commits")]
    NoCommits(String),

    /// The referenced commit does not exist in the store.
    #[error("Commit not found: {0}")]
    CommitNotFound(String),
}

/// Online compaction errors.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// The delta log grew past its configured bound.
    #[error("Compaction delta overflow: {current_size} entries (max {max_delta_size})")]
    DeltaOverflow {
        /// Configured maximum delta-log size.
        max_delta_size: usize,
        /// Size the log would have grown to.
        current_size: usize,
    },

    /// Forking is not allowed while an online compaction is live.
    #[error("Fork is forbidden while compaction is in progress")]
    ForkDuringCompaction,

    /// The background copier failed.
    #[error("Compaction failed: {0}")]
    Failed(String),
}

/// Content-addressing integrity errors.
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// A chunk referenced by an address map is missing from the store.
    #[error("Chunk not found: position {position}, address {storage_addr}")]
    ChunkNotFound {
        /// Encoded chunk position (layer << 32 | chunk index).
        position: u64,
        /// Display form of the missing storage address.
        storage_addr: String,
    },

    /// Stored chunk bytes do not hash to their storage address.
    #[error("Chunk hash mismatch at position {position}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Encoded chunk position.
        position: u64,
        /// Address recorded in the address map.
        expected: String,
        /// Address recomputed from the stored bytes.
        actual: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProximumError::config("dim must be positive");
        assert_eq!(err.to_string(), "Configuration error: dim must be positive");
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::dimension_mismatch(32, 64);
        assert_eq!(
            err.to_string(),
            "Vector dimension mismatch: expected 32, got 64"
        );
    }

    #[test]
    fn test_collision_probe() {
        let err: ProximumError = ValidationError::collision("doc-1").into();
        assert!(err.is_collision());
        assert!(err.is_validation());
        assert!(!err.is_storage());
    }

    #[test]
    fn test_capacity_probe() {
        let err: ProximumError = ValidationError::capacity_exceeded(100).into();
        assert!(err.is_capacity_exceeded());
    }

    #[test]
    fn test_branch_error_display() {
        let err = BranchError::NoCommits("main".to_string());
        assert_eq!(err.to_string(), "Branch 'main' has no commits");
    }

    #[test]
    fn test_compaction_overflow_display() {
        let err = CompactionError::DeltaOverflow {
            max_delta_size: 10,
            current_size: 11,
        };
        assert_eq!(
            err.to_string(),
            "Compaction delta overflow: 11 entries (max 10)"
        );
    }

    #[test]
    fn test_error_conversion_chain() {
        fn inner() -> Result<()> {
            Err(StorageError::corrupted("bad header"))?
        }

        let result = inner();
        assert!(result.is_err());
        assert!(result.unwrap_err().is_storage());
    }
}
