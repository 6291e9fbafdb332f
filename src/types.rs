//! Core type definitions for Proximum identifiers, metadata, and timestamps.
//!
//! Internal graph nodes are dense `u32` ids; everything user-facing is keyed
//! by [`ExternalId`]. Storage addresses and commit ids are UUIDs, either
//! random or derived from SHA-512 content hashes when content addressing is
//! enabled.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use uuid::Uuid;

/// Reserved metadata field holding a node's external id.
pub const EXTERNAL_ID_FIELD: &str = "external-id";

/// Internal node identifier.
///
/// Dense, assigned monotonically on insert, never reused. Deleted nodes
/// retain their id. A node id doubles as the vector's slot in the mmap file.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Returns the id as a usize offset.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Commit identifier.
///
/// Random UUID v4, or the first 16 bytes of the combined SHA-512 commit
/// hash when content addressing is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitId(pub Uuid);

impl CommitId {
    /// Creates a fresh random commit id.
    #[inline]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derives a commit id from the parent id and the store content hashes.
    ///
    /// Two indices built from the same insert sequence under the same config
    /// hash to the same commit id.
    pub fn from_content(parent: Option<CommitId>, parts: &[&[u8]]) -> Self {
        let mut hasher = Sha512::new();
        if let Some(p) = parent {
            hasher.update(p.0.as_bytes());
        }
        for part in parts {
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a persisted chunk or PSS page in the KV store.
///
/// Random mode generates a fresh UUID on every dirty flush (copy-on-write);
/// content-addressed mode derives the address from the chunk bytes, which
/// enables deduplication and tamper detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageAddress(pub Uuid);

impl StorageAddress {
    /// Creates a fresh random address.
    #[inline]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derives an address from content bytes (first 16 bytes of SHA-512).
    pub fn from_content(bytes: &[u8]) -> Self {
        let digest = Sha512::digest(bytes);
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(raw))
    }

    /// Picks random or content-derived depending on the addressing mode.
    #[inline]
    pub fn for_chunk(bytes: &[u8], content_addressed: bool) -> Self {
        if content_addressed {
            Self::from_content(bytes)
        } else {
            Self::random()
        }
    }
}

impl fmt::Display for StorageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User-supplied identifier for a vector.
///
/// Ordering is total and deterministic across kinds: values order first by
/// class tag (Int < Str < Uuid < Tag < Composite) and then naturally within
/// a class. All integer widths are normalized to `i64`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExternalId {
    /// Integer id, normalized to 64-bit.
    Int(i64),
    /// String id. Must not be empty or blank.
    Str(String),
    /// UUID id.
    Uuid(Uuid),
    /// Keyword-like tag. Must not be empty or blank.
    Tag(String),
    /// Composite sequence of ids, compared element-wise.
    Composite(Vec<ExternalId>),
}

impl ExternalId {
    /// Class tag used as the major sort key across id kinds.
    #[inline]
    pub fn class_tag(&self) -> u8 {
        match self {
            Self::Int(_) => 0,
            Self::Str(_) => 1,
            Self::Uuid(_) => 2,
            Self::Tag(_) => 3,
            Self::Composite(_) => 4,
        }
    }

    /// Validates the id. Empty or blank strings are rejected, recursively
    /// for composites; an empty composite is rejected as well.
    pub fn validate(&self) -> Result<(), crate::error::ValidationError> {
        match self {
            Self::Int(_) | Self::Uuid(_) => Ok(()),
            Self::Str(s) | Self::Tag(s) => {
                if s.trim().is_empty() {
                    Err(crate::error::ValidationError::EmptyExternalId)
                } else {
                    Ok(())
                }
            }
            Self::Composite(parts) => {
                if parts.is_empty() {
                    return Err(crate::error::ValidationError::EmptyExternalId);
                }
                for part in parts {
                    part.validate()?;
                }
                Ok(())
            }
        }
    }
}

impl Ord for ExternalId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.class_tag()
            .cmp(&other.class_tag())
            .then_with(|| match (self, other) {
                (Self::Int(a), Self::Int(b)) => a.cmp(b),
                (Self::Str(a), Self::Str(b)) => a.cmp(b),
                (Self::Uuid(a), Self::Uuid(b)) => a.cmp(b),
                (Self::Tag(a), Self::Tag(b)) => a.cmp(b),
                (Self::Composite(a), Self::Composite(b)) => a.cmp(b),
                // Unreachable: class tags already differ.
                _ => Ordering::Equal,
            })
    }
}

impl PartialOrd for ExternalId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Str(s) => write!(f, "{}", s),
            Self::Uuid(u) => write!(f, "{}", u),
            Self::Tag(t) => write!(f, ":{}", t),
            Self::Composite(parts) => {
                write!(f, "[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", part)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i64> for ExternalId {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ExternalId {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u32> for ExternalId {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<&str> for ExternalId {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ExternalId {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Uuid> for ExternalId {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

/// Scalar metadata value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    /// 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Boolean flag.
    Bool(bool),
    /// An external id, used for the reserved `external-id` field.
    Id(ExternalId),
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Field-name → scalar mapping attached to a node.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Unix timestamp in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Creates a timestamp from milliseconds since the Unix epoch.
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns milliseconds since the Unix epoch.
    #[inline]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Returns this timestamp shifted by the given number of milliseconds.
    #[inline]
    pub const fn offset(self, millis: i64) -> Self {
        Self(self.0 + millis)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_id_cross_class_order_is_total() {
        let ids = vec![
            ExternalId::Int(5),
            ExternalId::Str("a".into()),
            ExternalId::Uuid(Uuid::nil()),
            ExternalId::Tag("alpha".into()),
            ExternalId::Composite(vec![ExternalId::Int(1)]),
        ];
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "{} should sort before {}", w[0], w[1]);
        }
    }

    #[test]
    fn test_external_id_within_class_order() {
        assert!(ExternalId::Int(-3) < ExternalId::Int(7));
        assert!(ExternalId::Str("a".into()) < ExternalId::Str("b".into()));
        assert!(
            ExternalId::Composite(vec![ExternalId::Int(1)])
                < ExternalId::Composite(vec![ExternalId::Int(1), ExternalId::Int(0)])
        );
    }

    #[test]
    fn test_blank_external_ids_rejected() {
        assert!(ExternalId::Str("".into()).validate().is_err());
        assert!(ExternalId::Str("   ".into()).validate().is_err());
        assert!(ExternalId::Tag("".into()).validate().is_err());
        assert!(ExternalId::Composite(vec![]).validate().is_err());
        assert!(
            ExternalId::Composite(vec![ExternalId::Str(" ".into())])
                .validate()
                .is_err()
        );
        assert!(ExternalId::Str("doc-1".into()).validate().is_ok());
    }

    #[test]
    fn test_content_address_is_deterministic() {
        let a = StorageAddress::from_content(b"chunk bytes");
        let b = StorageAddress::from_content(b"chunk bytes");
        let c = StorageAddress::from_content(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_random_addresses_differ() {
        assert_ne!(StorageAddress::random(), StorageAddress::random());
    }

    #[test]
    fn test_commit_id_from_content_chains_parent() {
        let root = CommitId::from_content(None, &[b"v", b"e"]);
        let child = CommitId::from_content(Some(root), &[b"v", b"e"]);
        assert_ne!(root, child);
        let child_again = CommitId::from_content(Some(root), &[b"v", b"e"]);
        assert_eq!(child, child_again);
    }

    #[test]
    fn test_external_id_serialization_roundtrip() {
        let id = ExternalId::Composite(vec![
            ExternalId::Int(42),
            ExternalId::Tag("shard-a".into()),
        ]);
        let bytes = bincode::serialize(&id).unwrap();
        let restored: ExternalId = bincode::deserialize(&bytes).unwrap();
        assert_eq!(id, restored);
    }

    #[test]
    fn test_timestamp_ordering() {
        let t1 = Timestamp::from_millis(1000);
        let t2 = t1.offset(500);
        assert!(t1 < t2);
        assert_eq!(t2.as_millis(), 1500);
    }
}
