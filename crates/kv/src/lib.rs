//! meridian-kv: the replication and consistency core.
//!
//! Provides: the per-node store (Lamport clock, `last_seen` vector,
//! replication log), the quorum coordinator with sloppy quorum and read
//! repair, per-peer replication senders, the heartbeat failure detector,
//! durable hinted handoff, Merkle-tree anti-entropy, snapshot-isolation
//! transactions, and local secondary indexes.

pub mod anti_entropy;
pub mod coordinator;
pub mod heartbeat;
pub mod hints;
pub mod index;
pub mod merge;
pub mod merkle;
pub mod peer;
pub mod replication;
pub mod store;
pub mod tx;

pub use coordinator::{Coordinator, GetResult, QuorumConfig, WriteAck};
pub use peer::{PeerClient, PeerDirectory, PeerError, PeerInfo};
pub use store::NodeStore;

use meridian_common::NodeId;

/// Error taxonomy for KV operations. `NotOwner` and `StaleEpoch` prompt the
/// caller to refresh its partition map and retry once; `QuorumNotMet` leaves
/// the locally persisted write in place for anti-entropy to reconcile.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("not the owner; owner is {owner} at epoch {epoch}")]
    NotOwner { owner: NodeId, epoch: u64 },
    #[error("quorum not met: needed {needed}, got {got}")]
    QuorumNotMet { needed: usize, got: usize },
    #[error("operation timed out")]
    Timeout,
    #[error("serialization conflict")]
    SerializationConflict,
    #[error("stale epoch: incoming {incoming} <= current {current}")]
    StaleEpoch { incoming: u64, current: u64 },
    #[error("key not found")]
    UnknownKey,
    #[error("unknown transaction {0}")]
    UnknownTx(String),
    #[error("lock wait timed out for key {0}")]
    LockTimeout(String),
    #[error("shutting down")]
    Shutdown,
    #[error("storage error: {0}")]
    Storage(#[from] meridian_storage::StorageError),
    #[error("hint store error: {0}")]
    Hint(#[from] hints::HintError),
    #[error("placement error: {0}")]
    Ring(#[from] meridian_ring::RingError),
    #[error("peer error: {0}")]
    Peer(#[from] peer::PeerError),
}
