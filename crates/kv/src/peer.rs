//! Peer transport abstraction.
//!
//! The coordinator and background workers talk to remote nodes through the
//! [`PeerClient`] trait; production wires in the gRPC implementation from
//! `meridian-net`, tests substitute mocks or loopback clients. Peer
//! addresses live in a [`PeerDirectory`] keyed by node id; nodes refer to
//! each other by id only, never by owning a connection.

use async_trait::async_trait;
use meridian_common::{NodeId, VersionVector};
use meridian_ring::PartitionerState;
use meridian_storage::Record;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("RPC failed: {0}")]
    RpcFailed(String),
    #[error("RPC timed out")]
    Timeout,
    #[error("peer reports not owner (owner {owner}, epoch {epoch})")]
    NotOwner { owner: String, epoch: u64 },
    #[error("peer rejected stale epoch (current {current})")]
    StaleEpoch { current: u64 },
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),
}

/// Identity and address of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: NodeId,
    pub name: String,
    pub addr: SocketAddr,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        let name = name.into();
        Self {
            id: NodeId::from_name(&name),
            name,
            addr,
        }
    }
}

/// Acknowledgement of a direct Put/Delete.
#[derive(Debug, Clone)]
pub struct PutAck {
    /// The replica's current partition-map epoch; a mismatch tells the
    /// caller to refresh.
    pub epoch: u64,
}

/// Acknowledgement of a Replicate batch.
#[derive(Debug, Clone)]
pub struct ReplicateAck {
    /// The replica's updated `last_seen` vector; senders advance their
    /// per-peer cursors from it.
    pub last_seen: VersionVector,
}

#[derive(Debug, Clone)]
pub struct Pong {
    pub node: NodeId,
    pub epoch: u64,
}

/// RPC surface between nodes. One method per wire RPC; every call carries an
/// implicit deadline at the transport layer.
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// Direct write of one record (coordinator fan-out, read repair, hint
    /// delivery). `hinted_for` marks a sloppy-quorum write the receiver
    /// should queue for the named owner.
    async fn put_record(
        &self,
        target: &PeerInfo,
        record: &Record,
        hinted_for: Option<NodeId>,
    ) -> Result<PutAck, PeerError>;

    /// Read all versions the replica holds for a key (tombstones included).
    async fn get_record(&self, target: &PeerInfo, key: &str) -> Result<Vec<Record>, PeerError>;

    /// Push a batch of locally originated ops in per-origin sequence order.
    async fn replicate(
        &self,
        target: &PeerInfo,
        batch: &[Record],
    ) -> Result<ReplicateAck, PeerError>;

    /// Pull every op the peer knows that the given vector has not seen.
    async fn fetch_updates(
        &self,
        target: &PeerInfo,
        last_seen: &VersionVector,
    ) -> Result<Vec<Record>, PeerError>;

    async fn ping(&self, target: &PeerInfo) -> Result<Pong, PeerError>;

    /// Propagate a new partition map; rejected unless the epoch is
    /// strictly newer.
    async fn update_partition_map(
        &self,
        target: &PeerInfo,
        state: &PartitionerState,
    ) -> Result<(), PeerError>;

    /// Propagate the hash ring as raw `(token, node)` pairs under the same
    /// epoch discipline. A replica already at this epoch (because the map
    /// push landed first) answers [`PeerError::StaleEpoch`], which callers
    /// treat as acknowledgement.
    async fn update_hash_ring(
        &self,
        target: &PeerInfo,
        tokens: &[(NodeId, NodeId)],
        epoch: u64,
    ) -> Result<(), PeerError>;

    /// Merkle root per keyspace segment.
    async fn merkle_roots(&self, target: &PeerInfo) -> Result<Vec<[u8; 20]>, PeerError>;

    /// Leaf `(key, hash)` pairs of one segment, for key-level diffing.
    async fn segment_keys(
        &self,
        target: &PeerInfo,
        segment: usize,
    ) -> Result<Vec<(String, [u8; 20])>, PeerError>;

    /// Keys matching a secondary-index lookup on the peer.
    async fn list_by_index(
        &self,
        target: &PeerInfo,
        field: &str,
        value: &str,
    ) -> Result<Vec<String>, PeerError>;

    /// Forwarded range scan over one partition key on its owner.
    async fn scan(
        &self,
        target: &PeerInfo,
        partition_key: &str,
        low_ck: &str,
        high_ck: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, PeerError>;
}

/// id → peer info. Shared by the coordinator, senders, heartbeat, and hint
/// delivery; owned by none of them.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<NodeId, PeerInfo>>,
}

impl PeerDirectory {
    pub fn new(peers: impl IntoIterator<Item = PeerInfo>) -> Self {
        Self {
            peers: RwLock::new(peers.into_iter().map(|p| (p.id, p)).collect()),
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<PeerInfo> {
        self.peers.read().expect("peer directory lock").get(id).cloned()
    }

    pub fn insert(&self, peer: PeerInfo) {
        self.peers
            .write()
            .expect("peer directory lock")
            .insert(peer.id, peer);
    }

    pub fn remove(&self, id: &NodeId) -> Option<PeerInfo> {
        self.peers.write().expect("peer directory lock").remove(id)
    }

    pub fn all(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .read()
            .expect("peer directory lock")
            .values()
            .cloned()
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.all().into_iter().map(|p| p.id).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("peer directory lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
