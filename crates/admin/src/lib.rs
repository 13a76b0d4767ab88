//! meridian-admin: cluster administration.
//!
//! Membership changes (add/remove node), partition management (split,
//! merge, rebalance), hot-partition detection, and throttled partition
//! transfers. Every administrative action bumps the partition-map epoch and
//! propagates the new map to all peers; nodes reject anything not strictly
//! newer.

pub mod throttle;

pub use throttle::TokenBucket;

use meridian_common::{split_key, NodeId};
use meridian_kv::coordinator::Coordinator;
use meridian_kv::heartbeat::FailureDetector;
use meridian_kv::peer::{PeerClient, PeerDirectory, PeerInfo};
use meridian_ring::{Partitioner, PartitionerState};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("placement error: {0}")]
    Ring(#[from] meridian_ring::RingError),
    #[error("kv error: {0}")]
    Kv(#[from] meridian_kv::KvError),
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("operation not supported for this partition strategy")]
    WrongStrategy,
}

/// Outcome of a map-changing operation.
#[derive(Debug, Clone, Copy)]
pub struct MapChange {
    pub epoch: u64,
    pub partitions: usize,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Virtual-node tokens granted to a newly added node (hash strategy).
    pub partitions_per_node: usize,
    /// Ceiling on automatic hot-partition splits (`num_partitions`).
    pub max_partitions: usize,
    /// Bytes/second ceiling for partition streaming; 0 = unthrottled.
    pub max_transfer_rate: u64,
    /// Replication factor, for ownership checks during transfers.
    pub replication_factor: usize,
}

/// Administrative facade over one node. The node executing an action
/// becomes the map owner: it bumps the epoch and pushes the new state to
/// every peer.
pub struct ClusterAdmin<C: PeerClient> {
    coordinator: Arc<Coordinator<C>>,
    directory: Arc<PeerDirectory>,
    detector: Arc<FailureDetector>,
    client: Arc<C>,
    config: AdminConfig,
}

impl<C: PeerClient> ClusterAdmin<C> {
    pub fn new(
        coordinator: Arc<Coordinator<C>>,
        directory: Arc<PeerDirectory>,
        detector: Arc<FailureDetector>,
        client: Arc<C>,
        config: AdminConfig,
    ) -> Self {
        Self {
            coordinator,
            directory,
            detector,
            client,
            config,
        }
    }

    fn state_snapshot(&self) -> PartitionerState {
        self.coordinator
            .partitioner()
            .read()
            .expect("partitioner lock")
            .clone()
    }

    /// Push the current map to every peer: `UpdatePartitionMap` always,
    /// `UpdateHashRing` additionally on hash clusters. The map push already
    /// carries the tokens, so a replica that accepted it answers the ring
    /// push with `StaleEpoch`; that counts as delivered. Unreachable peers
    /// catch up when they next reject an op with `StaleEpoch` or via their
    /// own refresh.
    async fn propagate(&self) {
        let state = self.state_snapshot();
        let ring_tokens = match &state.partitioner {
            Partitioner::Hash(ring) => Some(ring.entries().to_vec()),
            Partitioner::Range(_) => None,
        };

        for peer in self.directory.all() {
            if let Err(e) = self.client.update_partition_map(&peer, &state).await {
                tracing::warn!(peer = %peer.name, error = %e, "partition map propagation failed");
                continue;
            }
            if let Some(tokens) = &ring_tokens {
                match self
                    .client
                    .update_hash_ring(&peer, tokens, state.epoch)
                    .await
                {
                    Ok(()) | Err(meridian_kv::peer::PeerError::StaleEpoch { .. }) => {}
                    Err(e) => {
                        tracing::warn!(peer = %peer.name, error = %e, "hash ring propagation failed");
                    }
                }
            }
        }
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Partitioner) -> Result<T, meridian_ring::RingError>,
    ) -> Result<(T, MapChange), AdminError> {
        let change = {
            let state_arc = self.coordinator.partitioner().clone();
            let mut state = state_arc.write().expect("partitioner lock");
            let out = f(&mut state.partitioner)?;
            let epoch = state.bump();
            let partitions = state.partitioner.num_partitions();
            (out, MapChange { epoch, partitions })
        };
        self.coordinator.persist_partitioner();
        Ok(change)
    }

    // -----------------------------------------------------------------------
    // Partition management
    // -----------------------------------------------------------------------

    /// Split a partition at an optional key; propagates the new map.
    pub async fn split_partition(
        &self,
        pid: usize,
        split_key: Option<&str>,
    ) -> Result<MapChange, AdminError> {
        let (new_pid, change) = self.mutate(|p| p.split_partition(pid, split_key))?;
        tracing::info!(pid, new_pid, epoch = change.epoch, "partition split");
        self.propagate().await;
        Ok(change)
    }

    /// Merge two adjacent partitions; propagates the new map.
    pub async fn merge_partitions(&self, pid1: usize, pid2: usize) -> Result<MapChange, AdminError> {
        let ((), change) = self.mutate(|p| p.merge_partitions(pid1, pid2))?;
        tracing::info!(pid1, pid2, epoch = change.epoch, "partitions merged");
        self.propagate().await;
        Ok(change)
    }

    /// Even redistribution across the current membership (range strategy:
    /// owners are reassigned round-robin and records streamed to their new
    /// owners; hash strategy: the ring already spreads load, so this only
    /// republishes the map).
    pub async fn rebalance(&self) -> Result<MapChange, AdminError> {
        let mut all_nodes: Vec<NodeId> = self.directory.ids();
        all_nodes.push(self.coordinator.store().id());
        all_nodes.sort_unstable();

        let (moved, change) = self.mutate(|p| {
            let mut moved = Vec::new();
            if let Partitioner::Range(ranges) = p {
                for pid in 0..ranges.num_partitions() {
                    let target = all_nodes[pid % all_nodes.len()];
                    if ranges.owner_of(pid)? != target {
                        ranges.set_owner(pid, target)?;
                        moved.push(pid);
                    }
                }
            }
            Ok(moved)
        })?;

        tracing::info!(epoch = change.epoch, moved = moved.len(), "rebalanced");
        self.propagate().await;
        self.stream_local_records_to_owners().await;
        Ok(change)
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Install a new node: register it, grant it ring tokens (hash
    /// strategy), propagate, then stream the records it now owns.
    pub async fn add_node(&self, name: &str, addr: SocketAddr) -> Result<MapChange, AdminError> {
        let peer = PeerInfo::new(name, addr);
        let id = peer.id;
        self.directory.insert(peer);
        self.detector.track(id);

        let tokens = self.config.partitions_per_node;
        let ((), change) = self.mutate(|p| {
            if let Partitioner::Hash(ring) = p {
                ring.add_node(id, tokens);
            }
            Ok(())
        })?;

        tracing::info!(node = %id, epoch = change.epoch, "node added");
        self.propagate().await;
        self.stream_local_records_to_owners().await;
        Ok(change)
    }

    /// Remove a node: strip its tokens / reassign its ranges, propagate,
    /// and stream local records to the new owners.
    pub async fn remove_node(&self, node_id: NodeId) -> Result<MapChange, AdminError> {
        if self.directory.remove(&node_id).is_none() {
            return Err(AdminError::UnknownNode(node_id.hex()));
        }
        self.detector.forget(&node_id);

        let mut survivors: Vec<NodeId> = self.directory.ids();
        survivors.push(self.coordinator.store().id());
        survivors.sort_unstable();

        let ((), change) = self.mutate(|p| {
            match p {
                Partitioner::Hash(ring) => ring.remove_node(node_id),
                Partitioner::Range(ranges) => {
                    ranges.reassign_node(node_id, &survivors);
                }
            }
            Ok(())
        })?;

        tracing::info!(node = %node_id, epoch = change.epoch, "node removed");
        self.propagate().await;
        self.stream_local_records_to_owners().await;
        Ok(change)
    }

    /// Stream every locally held record to the peers that should own it
    /// under the current map, throttled to `max_transfer_rate`. Idempotent:
    /// receivers merge by version.
    async fn stream_local_records_to_owners(&self) {
        let snapshot = self.coordinator.store().engine().snapshot_all();
        let state = self.state_snapshot();
        let n = self.config.replication_factor;
        let self_id = self.coordinator.store().id();
        let mut bucket = TokenBucket::new(self.config.max_transfer_rate);
        let mut streamed = 0usize;

        for (key, versions) in snapshot {
            let (pk, _) = split_key(&key);
            let owners = state.partitioner.owners_for_key(pk, n);
            for owner in owners.into_iter().filter(|o| *o != self_id) {
                let Some(peer) = self.directory.get(&owner) else {
                    continue;
                };
                for record in &versions {
                    let cost = record.key.len() + record.value.len();
                    bucket.throttle(cost as u64).await;
                    match self.client.put_record(&peer, record, None).await {
                        Ok(_) => streamed += 1,
                        Err(e) => {
                            tracing::debug!(peer = %peer.name, error = %e, "transfer push failed");
                        }
                    }
                }
            }
        }
        if streamed > 0 {
            tracing::info!(records = streamed, "partition transfer complete");
        }
    }

    // -----------------------------------------------------------------------
    // Hot and cold partitions
    // -----------------------------------------------------------------------

    /// Split partitions whose traffic exceeds `threshold` times the average
    /// and touched at least `min_keys` distinct keys. Counters reset after
    /// a split.
    pub async fn check_hot_partitions(
        &self,
        threshold: f64,
        min_keys: usize,
    ) -> Result<Vec<usize>, AdminError> {
        let traffic = self.coordinator.partition_traffic();
        let partitions = self.state_snapshot().partitioner.num_partitions();
        if traffic.is_empty() || partitions == 0 || partitions >= self.config.max_partitions {
            return Ok(Vec::new());
        }
        // Average over every partition, idle ones included.
        let avg = traffic.values().map(|t| t.ops).sum::<u64>() as f64 / partitions as f64;

        let hot: Vec<usize> = traffic
            .iter()
            .filter(|(_, t)| (t.ops as f64) > avg * threshold && t.keys.len() >= min_keys)
            .map(|(pid, _)| *pid)
            .collect();

        for &pid in &hot {
            match self.split_partition(pid, None).await {
                Ok(change) => {
                    tracing::info!(pid, epoch = change.epoch, "hot partition auto-split");
                }
                Err(AdminError::Ring(meridian_ring::RingError::SplitKeyRequired)) => {
                    tracing::debug!(pid, "skipping hot split: unbounded range needs a key");
                }
                Err(e) => return Err(e),
            }
        }
        if !hot.is_empty() {
            self.coordinator.reset_partition_traffic();
        }
        Ok(hot)
    }

    /// Merge adjacent partitions whose traffic fell below `threshold` times
    /// the average with at most `max_keys` distinct keys each.
    pub async fn check_cold_partitions(
        &self,
        threshold: f64,
        max_keys: usize,
    ) -> Result<Vec<(usize, usize)>, AdminError> {
        let traffic = self.coordinator.partition_traffic();
        let partitions = self.state_snapshot().partitioner.num_partitions();
        if partitions < 2 {
            return Ok(Vec::new());
        }
        let avg = traffic.values().map(|t| t.ops).sum::<u64>() as f64 / partitions as f64;

        let is_cold = |pid: usize| {
            traffic
                .get(&pid)
                .map(|t| (t.ops as f64) < avg * threshold && t.keys.len() <= max_keys)
                .unwrap_or(true)
        };

        let mut merged = Vec::new();
        let mut pid = 0;
        while pid + 1 < partitions.saturating_sub(merged.len()) {
            if is_cold(pid) && is_cold(pid + 1) {
                match self.merge_partitions(pid, pid + 1).await {
                    Ok(_) => {
                        merged.push((pid, pid + 1));
                        self.coordinator.reset_partition_traffic();
                    }
                    Err(AdminError::Ring(meridian_ring::RingError::NotContiguous)) => {}
                    Err(e) => return Err(e),
                }
            }
            pid += 1;
        }
        Ok(merged)
    }

    /// Enable salting for a hot key.
    pub async fn mark_hot_key(
        &self,
        key: &str,
        buckets: u32,
        migrate: bool,
    ) -> Result<(), AdminError> {
        self.coordinator.mark_hot_key(key, buckets, migrate).await?;
        Ok(())
    }
}
