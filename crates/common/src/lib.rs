//! meridian-common: shared types for the meridian cluster.
//!
//! Provides the 160-bit `NodeId` used for both node identities and ring
//! tokens, composite-key helpers, operation ids, and the logical clocks
//! (Lamport scalar clock and per-origin version vector).

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

pub mod clock;

pub use clock::{ClockOrder, LamportClock, VersionVector};

/// Number of bits in a meridian identifier / ring token.
pub const ID_BITS: usize = 160;

/// Number of bytes in a meridian identifier.
pub const ID_BYTES: usize = ID_BITS / 8; // 20

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// A 160-bit identifier. Used for node identities, ring tokens, and hashed
/// key placement. Ordering is big-endian byte order so tokens sort the same
/// way as their numeric value in the ring space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// The all-zeros identifier.
    pub const ZERO: Self = Self([0u8; ID_BYTES]);

    /// Create a `NodeId` from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Generate a random `NodeId`.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    /// Create a `NodeId` by SHA-1 hashing arbitrary data.
    pub fn from_sha1(data: &[u8]) -> Self {
        let hash = Sha1::digest(data);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Stable identity for a named node (`node_name` from config).
    pub fn from_name(name: &str) -> Self {
        Self::from_sha1(name.as_bytes())
    }

    /// Ring token for a key: the partition key is hashed into the same
    /// 160-bit space the tokens live in.
    pub fn token_for_key(partition_key: &str) -> Self {
        Self::from_sha1(partition_key.as_bytes())
    }

    /// The i-th virtual-node token for a node: derived deterministically so
    /// a restarting node reclaims the same ring positions.
    pub fn vnode_token(&self, index: u32) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(self.0);
        hasher.update(index.to_be_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Full 40-character lowercase hex rendering. Used as the map key for
    /// version vectors and `last_seen`.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a full 40-character hex rendering.
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(s).map_err(|_| IdError::BadHex(s.to_string()))?;
        let arr: [u8; ID_BYTES] = bytes
            .try_into()
            .map_err(|_| IdError::BadHex(s.to_string()))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show first 4 bytes as hex for readability
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "…")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("not a 160-bit hex id: {0:?}")]
    BadHex(String),
}

// ---------------------------------------------------------------------------
// Operation ids
// ---------------------------------------------------------------------------

/// Identity of a replicated operation: `<origin>:<seq>`, unique and monotonic
/// per origin. Replicas use it to apply each op at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub origin: String,
    pub seq: u64,
}

impl OpId {
    pub fn new(origin: impl Into<String>, seq: u64) -> Self {
        Self {
            origin: origin.into(),
            seq,
        }
    }

    /// Parse the wire form `"<origin>:<seq>"`.
    pub fn parse(s: &str) -> Option<Self> {
        let (origin, seq) = s.rsplit_once(':')?;
        let seq = seq.parse().ok()?;
        if origin.is_empty() {
            return None;
        }
        Some(Self {
            origin: origin.to_string(),
            seq,
        })
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.seq)
    }
}

// ---------------------------------------------------------------------------
// Composite keys
// ---------------------------------------------------------------------------

/// Separator between the partition key and the clustering key.
pub const KEY_SEPARATOR: char = '|';

/// Compose a storage key from a partition key and optional clustering key.
pub fn compose_key(partition_key: &str, clustering_key: Option<&str>) -> String {
    match clustering_key {
        Some(ck) => format!("{partition_key}{KEY_SEPARATOR}{ck}"),
        None => partition_key.to_string(),
    }
}

/// Split a storage key into `(partition_key, clustering_key)`. Only the
/// partition key participates in ring placement.
pub fn split_key(key: &str) -> (&str, Option<&str>) {
    match key.split_once(KEY_SEPARATOR) {
        Some((pk, ck)) => (pk, Some(ck)),
        None => (key, None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
