//! Quorum coordinator: fans client operations out to replicas.
//!
//! Any node can coordinate. For a write the coordinator stamps the op with
//! its Lamport clock and op id, applies it locally, pushes it to the other
//! preferred replicas in parallel, and acknowledges after W acks (all N in
//! strong mode). Dead owners are substituted with Live non-preferred peers
//! tagged `hinted_for` (sloppy quorum); writes that still miss a replica
//! are queued as hints. Reads gather R replica answers, resolve them per
//! consistency mode, and asynchronously repair stale replicas.

use crate::heartbeat::{FailureDetector, PeerStatus};
use crate::hints::HintStore;
use crate::merge::{combine_replica_versions, reconcile};
use crate::peer::{PeerClient, PeerDirectory, PeerInfo};
use crate::store::NodeStore;
use crate::KvError;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use meridian_common::{compose_key, split_key, NodeId, VersionVector};
use meridian_ring::PartitionerState;
use meridian_storage::Record;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::time::{Duration, Instant};

/// Per-request consistency: W/R quorums or all preferred replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    #[default]
    Quorum,
    Strong,
}

/// Quorum and replication configuration (from `replication.*` config).
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    pub n: usize,
    pub w: usize,
    pub r: usize,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub read_repair: bool,
    pub hinted_handoff: bool,
    pub load_balance_reads: bool,
    pub enable_forwarding: bool,
}

/// Successful write acknowledgement.
#[derive(Debug, Clone)]
pub struct WriteAck {
    pub epoch: u64,
    pub op_id: String,
    pub acks: usize,
}

/// Resolved read result.
#[derive(Debug, Clone)]
pub struct GetResult {
    /// One winner (LWW/CRDT) or concurrent siblings (vector mode).
    pub versions: Vec<Record>,
    /// Merged causal context to echo back on a subsequent put.
    pub context: VersionVector,
    pub epoch: u64,
}

pub struct Coordinator<C: PeerClient> {
    store: Arc<NodeStore>,
    partitioner: Arc<RwLock<PartitionerState>>,
    partitioner_path: PathBuf,
    directory: Arc<PeerDirectory>,
    client: Arc<C>,
    detector: Arc<FailureDetector>,
    hints: Option<Arc<HintStore>>,
    config: QuorumConfig,
    /// Hot keys being salted: partition key → bucket count.
    salted: RwLock<HashMap<String, u32>>,
    /// Per-partition traffic counters feeding hot/cold detection.
    partition_stats: RwLock<HashMap<usize, PartitionTraffic>>,
}

/// Traffic observed for one partition since the last reset.
#[derive(Debug, Clone, Default)]
pub struct PartitionTraffic {
    pub ops: u64,
    pub keys: HashSet<String>,
}

impl<C: PeerClient> std::fmt::Debug for Coordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("node", &self.store.id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: PeerClient> Coordinator<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<NodeStore>,
        partitioner: Arc<RwLock<PartitionerState>>,
        partitioner_path: PathBuf,
        directory: Arc<PeerDirectory>,
        client: Arc<C>,
        detector: Arc<FailureDetector>,
        config: QuorumConfig,
    ) -> Self {
        Self {
            store,
            partitioner,
            partitioner_path,
            directory,
            client,
            detector,
            hints: None,
            config,
            salted: RwLock::new(HashMap::new()),
            partition_stats: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a hint store for hinted handoff.
    pub fn with_hint_store(mut self, hints: Arc<HintStore>) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    pub fn epoch(&self) -> u64 {
        self.partitioner.read().expect("partitioner lock").epoch
    }

    pub fn partitioner(&self) -> &Arc<RwLock<PartitionerState>> {
        &self.partitioner
    }

    /// Persist the current partition map (after a local administrative
    /// change; propagated updates persist on acceptance).
    pub fn persist_partitioner(&self) {
        let state = self.partitioner.read().expect("partitioner lock");
        if let Err(e) = state.store(&self.partitioner_path) {
            tracing::warn!(error = %e, "failed to persist partition map");
        }
    }

    fn placement(&self, partition_key: &str) -> (Vec<NodeId>, u64) {
        let state = self.partitioner.read().expect("partitioner lock");
        (
            state.partitioner.owners_for_key(partition_key, self.config.n),
            state.epoch,
        )
    }

    fn record_partition_op(&self, partition_key: &str) {
        let pid = {
            let state = self.partitioner.read().expect("partitioner lock");
            match state.partitioner.partition_id_for_key(partition_key) {
                Ok(pid) => pid,
                Err(_) => return,
            }
        };
        let mut stats = self.partition_stats.write().expect("partition stats lock");
        let entry = stats.entry(pid).or_default();
        entry.ops += 1;
        entry.keys.insert(partition_key.to_string());
    }

    /// Per-partition traffic since the last reset (hot/cold detection).
    pub fn partition_traffic(&self) -> HashMap<usize, PartitionTraffic> {
        self.partition_stats
            .read()
            .expect("partition stats lock")
            .clone()
    }

    /// Clear traffic counters (after an automatic split or merge).
    pub fn reset_partition_traffic(&self) {
        self.partition_stats
            .write()
            .expect("partition stats lock")
            .clear();
    }

    // -----------------------------------------------------------------------
    // Client surface
    // -----------------------------------------------------------------------

    /// PUT a value under a composite key.
    pub async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        context: Option<VersionVector>,
        consistency: Consistency,
        timeout_override: Option<Duration>,
    ) -> Result<WriteAck, KvError> {
        meridian_metrics::metrics().kv_puts.inc();
        self.write_internal(key, Some(value), context, consistency, timeout_override)
            .await
    }

    /// DELETE a key (replicates a tombstone).
    pub async fn delete(
        &self,
        key: &str,
        context: Option<VersionVector>,
        consistency: Consistency,
        timeout_override: Option<Duration>,
    ) -> Result<WriteAck, KvError> {
        meridian_metrics::metrics().kv_deletes.inc();
        self.write_internal(key, None, context, consistency, timeout_override)
            .await
    }

    /// GET a key; resolves versions per the node's consistency mode.
    pub async fn get(
        &self,
        key: &str,
        consistency: Consistency,
        timeout_override: Option<Duration>,
    ) -> Result<GetResult, KvError> {
        meridian_metrics::metrics().kv_gets.inc();

        let (pk, ck) = split_key(key);
        let buckets = self.salt_buckets(pk);
        match buckets {
            None => self.read_internal(key, consistency, timeout_override).await,
            Some(buckets) => {
                // Fan in over every salted variant and merge.
                let mut lists = Vec::new();
                let mut epoch = self.epoch();
                for bucket in 0..buckets {
                    let salted = compose_key(&format!("{bucket}#{pk}"), ck);
                    match self.read_internal(&salted, consistency, timeout_override).await {
                        Ok(result) => {
                            epoch = result.epoch;
                            lists.push(result.versions);
                        }
                        Err(KvError::UnknownKey) => {}
                        Err(e) => return Err(e),
                    }
                }
                let merged = combine_replica_versions(lists);
                let live: Vec<Record> =
                    merged.into_iter().filter(|r| !r.is_tombstone()).collect();
                if live.is_empty() {
                    return Err(KvError::UnknownKey);
                }
                let context = merged_context(&live);
                let versions = reconcile(self.store.mode(), live);
                Ok(GetResult {
                    versions,
                    context,
                    epoch,
                })
            }
        }
    }

    /// Ordered live `(clustering_key, value)` pairs of one partition key.
    pub async fn scan(
        &self,
        partition_key: &str,
        low_ck: &str,
        high_ck: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let (owners, epoch) = self.placement(partition_key);
        let self_id = self.store.id();

        if owners.contains(&self_id) {
            let low = compose_key(partition_key, Some(low_ck));
            let high = compose_key(partition_key, Some(high_ck));
            let mut out = Vec::new();
            for (key, versions) in self.store.engine().range_scan(&low, &high) {
                let winners = reconcile(self.store.mode(), versions);
                if let Some(winner) = winners.first() {
                    let (_, ck) = split_key(&key);
                    out.push((ck.unwrap_or_default().to_string(), winner.value.clone()));
                }
            }
            return Ok(out);
        }

        let owner = owners.first().copied().ok_or(KvError::UnknownKey)?;
        if !self.config.enable_forwarding {
            return Err(KvError::NotOwner { owner, epoch });
        }
        let peer = self
            .directory
            .get(&owner)
            .ok_or(KvError::NotOwner { owner, epoch })?;
        Ok(self
            .client
            .scan(&peer, partition_key, low_ck, high_ck)
            .await?)
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    async fn write_internal(
        &self,
        key: &str,
        value: Option<Vec<u8>>,
        context: Option<VersionVector>,
        consistency: Consistency,
        timeout_override: Option<Duration>,
    ) -> Result<WriteAck, KvError> {
        let key = self.salt_rewrite(key);
        let (pk, _) = split_key(&key);
        self.record_partition_op(pk);
        let (owners, epoch) = self.placement(pk);
        if owners.is_empty() {
            return Err(KvError::Ring(meridian_ring::RingError::NoNodes));
        }

        let self_id = self.store.id();
        let is_replica = owners.contains(&self_id);
        if !is_replica && !self.config.enable_forwarding {
            return Err(KvError::NotOwner {
                owner: owners[0],
                epoch,
            });
        }

        // A replica applies and logs the op locally; a forwarding non-owner
        // only stamps it, so no copy of the data lingers outside the
        // preference list.
        let record = if is_replica {
            self.store.originate(&key, value, context)?
        } else {
            self.store.stamp_forwarded(&key, value, context)
        };
        let op_id = record.meta.op_id();

        // Build the target list, substituting Live peers for Dead owners
        // (sloppy quorum). Substitutes carry the owner they stand in for.
        let mut targets: Vec<(PeerInfo, Option<NodeId>)> = Vec::new();
        let mut used: HashSet<NodeId> = owners.iter().copied().collect();

        for &owner in owners.iter().filter(|&&o| o != self_id) {
            let peer = self.directory.get(&owner);
            let status = self.detector.status(&owner);
            match (peer, status) {
                (Some(peer), PeerStatus::Live | PeerStatus::Suspect) => {
                    targets.push((peer, None));
                }
                // Dead or unknown: stand in a Live non-preferred peer, if
                // one exists; otherwise only the hint queue covers it.
                (_, _) => {
                    if let Some(substitute) = self.pick_substitute(pk, &used) {
                        used.insert(substitute.id);
                        targets.push((substitute, Some(owner)));
                    }
                }
            }
        }

        let needed = match consistency {
            Consistency::Quorum => self.config.w,
            Consistency::Strong => owners.len(),
        };

        let deadline =
            Instant::now() + timeout_override.unwrap_or(self.config.write_timeout);
        let mut futs = FuturesUnordered::new();
        for (peer, hinted_for) in &targets {
            let client = self.client.clone();
            let peer = peer.clone();
            let hinted_for = *hinted_for;
            let record = record.clone();
            futs.push(async move {
                let outcome = client.put_record(&peer, &record, hinted_for).await;
                (peer.id, hinted_for, outcome)
            });
        }

        let mut acks = usize::from(is_replica); // the local apply
        let mut acked_owners: HashSet<NodeId> = HashSet::new();
        if is_replica {
            acked_owners.insert(self_id);
        }

        while acks < needed {
            match tokio::time::timeout_at(deadline, futs.next()).await {
                Ok(Some((peer_id, hinted_for, Ok(_)))) => {
                    acks += 1;
                    acked_owners.insert(hinted_for.unwrap_or(peer_id));
                }
                Ok(Some((peer_id, _, Err(e)))) => {
                    tracing::debug!(peer = %peer_id, error = %e, "replica write failed");
                }
                Ok(None) => break,
                Err(_) => break, // deadline
            }
        }

        // Queue hints for every intended owner that did not acknowledge.
        if self.config.hinted_handoff {
            if let Some(hints) = &self.hints {
                for owner in owners
                    .iter()
                    .filter(|o| **o != self_id && !acked_owners.contains(o))
                {
                    if let Err(e) = hints.store_hint(*owner, record.clone()) {
                        tracing::warn!(owner = %owner, error = %e, "failed to store hint");
                    } else {
                        meridian_metrics::metrics().hints_stored.inc();
                    }
                }
            }
        }

        if acks < needed {
            meridian_metrics::metrics().quorum_failures.inc();
            // A replica's local write stays (anti-entropy reconciles it);
            // a forwarder's op survives only in the hint queues.
            return Err(KvError::QuorumNotMet { needed, got: acks });
        }

        Ok(WriteAck {
            epoch,
            op_id,
            acks,
        })
    }

    /// A Live node outside the preference list, closest after the owners on
    /// the walk.
    fn pick_substitute(&self, partition_key: &str, used: &HashSet<NodeId>) -> Option<PeerInfo> {
        let extended = {
            let state = self.partitioner.read().expect("partitioner lock");
            let all = state.partitioner.nodes().len();
            state.partitioner.owners_for_key(partition_key, all)
        };
        extended
            .into_iter()
            .filter(|id| !used.contains(id) && *id != self.store.id())
            .find(|id| self.detector.status(id) == PeerStatus::Live)
            .and_then(|id| self.directory.get(&id))
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    async fn read_internal(
        &self,
        key: &str,
        consistency: Consistency,
        timeout_override: Option<Duration>,
    ) -> Result<GetResult, KvError> {
        let (pk, _) = split_key(key);
        self.record_partition_op(pk);
        let (mut owners, epoch) = self.placement(pk);
        if owners.is_empty() {
            return Err(KvError::Ring(meridian_ring::RingError::NoNodes));
        }
        if self.config.load_balance_reads {
            owners.shuffle(&mut rand::thread_rng());
        }

        let needed = match consistency {
            Consistency::Quorum => self.config.r.min(owners.len()),
            Consistency::Strong => owners.len(),
        };

        let deadline = Instant::now() + timeout_override.unwrap_or(self.config.read_timeout);
        let self_id = self.store.id();
        let mut futs = FuturesUnordered::new();

        for &owner in &owners {
            if owner == self_id {
                let store = self.store.clone();
                let key = key.to_string();
                futs.push(
                    async move {
                        (
                            self_id,
                            Ok::<_, crate::peer::PeerError>(store.engine().get(&key)),
                        )
                    }
                    .boxed(),
                );
            } else {
                let Some(peer) = self.directory.get(&owner) else {
                    continue;
                };
                let client = self.client.clone();
                let key = key.to_string();
                futs.push(
                    async move {
                        let outcome = client.get_record(&peer, &key).await;
                        (peer.id, outcome)
                    }
                    .boxed(),
                );
            }
        }

        let mut replies: Vec<(NodeId, Vec<Record>)> = Vec::new();
        while replies.len() < needed {
            match tokio::time::timeout_at(deadline, futs.next()).await {
                Ok(Some((node, Ok(versions)))) => replies.push((node, versions)),
                Ok(Some((node, Err(e)))) => {
                    tracing::debug!(peer = %node, error = %e, "replica read failed");
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        if replies.len() < needed {
            meridian_metrics::metrics().quorum_failures.inc();
            return Err(KvError::QuorumNotMet {
                needed,
                got: replies.len(),
            });
        }

        let merged =
            combine_replica_versions(replies.iter().map(|(_, v)| v.clone()).collect());

        if self.config.read_repair {
            self.spawn_read_repair(merged.clone(), &replies);
        }

        let live: Vec<Record> = merged
            .into_iter()
            .filter(|r| !r.is_tombstone())
            .collect();
        if live.is_empty() {
            return Err(KvError::UnknownKey);
        }
        let context = merged_context(&live);
        let versions = reconcile(self.store.mode(), live);
        Ok(GetResult {
            versions,
            context,
            epoch,
        })
    }

    /// Push the merged version set back to every replica that answered with
    /// less. Fire-and-forget.
    fn spawn_read_repair(&self, merged: Vec<Record>, replies: &[(NodeId, Vec<Record>)]) {
        let stale: Vec<NodeId> = replies
            .iter()
            .filter(|(_, versions)| is_stale(versions, &merged))
            .map(|(node, _)| *node)
            .collect();
        if stale.is_empty() {
            return;
        }

        let client = self.client.clone();
        let directory = self.directory.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            meridian_metrics::metrics().read_repairs.inc();
            for node in stale {
                for record in &merged {
                    if node == store.id() {
                        if let Err(e) = store.apply_direct(record) {
                            tracing::warn!(error = %e, "local read repair failed");
                        }
                    } else if let Some(peer) = directory.get(&node) {
                        if let Err(e) = client.put_record(&peer, record, None).await {
                            tracing::debug!(peer = %peer.name, error = %e, "read repair push failed");
                        }
                    }
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Inbound RPC handlers (called by the transport layer)
    // -----------------------------------------------------------------------

    /// Direct Put/Delete from a peer. A record tagged `hinted_for` another
    /// node is queued for that owner instead of entering the local engine.
    pub fn handle_put(
        &self,
        record: Record,
        hinted_for: Option<NodeId>,
    ) -> Result<u64, KvError> {
        match hinted_for {
            Some(owner) if owner != self.store.id() => {
                if let Some(hints) = &self.hints {
                    hints.store_hint(owner, record)?;
                    meridian_metrics::metrics().hints_stored.inc();
                } else {
                    // No hint store: accept the data directly rather than
                    // dropping the write.
                    self.store.apply_direct(&record)?;
                }
            }
            _ => self.store.apply_direct(&record)?,
        }
        Ok(self.epoch())
    }

    /// All versions this node holds for a key (tombstones included).
    pub fn handle_get(&self, key: &str) -> Vec<Record> {
        self.store.engine().get(key)
    }

    /// Ordered replication batch; returns the updated `last_seen` vector.
    pub fn handle_replicate(&self, batch: &[Record]) -> Result<VersionVector, KvError> {
        for record in batch {
            self.store.apply_replicated(record)?;
        }
        Ok(self.store.last_seen_snapshot())
    }

    pub fn handle_fetch_updates(&self, since: &VersionVector, max: usize) -> Vec<Record> {
        self.store.fetch_updates(since, max)
    }

    /// Accept a propagated partition map if its epoch is strictly newer.
    pub fn handle_partitioner_update(&self, incoming: PartitionerState) -> Result<(), KvError> {
        let mut state = self.partitioner.write().expect("partitioner lock");
        state.accept(incoming).map_err(|e| match e {
            meridian_ring::RingError::StaleEpoch { incoming, current } => {
                KvError::StaleEpoch { incoming, current }
            }
            other => KvError::Ring(other),
        })?;
        if let Err(e) = state.store(&self.partitioner_path) {
            tracing::warn!(error = %e, "failed to persist partition map");
        }
        tracing::info!(epoch = state.epoch, "partition map updated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Hot keys and secondary indexes
    // -----------------------------------------------------------------------

    fn salt_buckets(&self, partition_key: &str) -> Option<u32> {
        self.salted
            .read()
            .expect("salt lock")
            .get(partition_key)
            .copied()
    }

    fn salt_rewrite(&self, key: &str) -> String {
        let (pk, ck) = split_key(key);
        match self.salt_buckets(pk) {
            Some(buckets) => {
                let bucket = rand::thread_rng().gen_range(0..buckets);
                compose_key(&format!("{bucket}#{pk}"), ck)
            }
            None => key.to_string(),
        }
    }

    /// Start salting a hot key over `buckets` variants; optionally copy the
    /// current value into every bucket so reads stay complete.
    pub async fn mark_hot_key(
        &self,
        partition_key: &str,
        buckets: u32,
        migrate: bool,
    ) -> Result<(), KvError> {
        self.salted
            .write()
            .expect("salt lock")
            .insert(partition_key.to_string(), buckets.max(1));
        tracing::info!(key = partition_key, buckets, migrate, "hot key salted");

        if migrate {
            let existing = reconcile(
                self.store.mode(),
                self.store.engine().get_live(partition_key),
            );
            if let Some(winner) = existing.first() {
                for bucket in 0..buckets {
                    let salted = format!("{bucket}#{partition_key}");
                    self.write_internal(
                        &salted,
                        Some(winner.value.clone()),
                        None,
                        Consistency::Quorum,
                        None,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Keys matching a secondary-index lookup, merged across the cluster.
    /// Results may be stale or duplicated until anti-entropy converges.
    pub async fn list_by_index(&self, field: &str, value: &str) -> Vec<String> {
        let mut keys: HashSet<String> =
            self.store.query_index(field, value).into_iter().collect();
        for peer in self.directory.all() {
            match self.client.list_by_index(&peer, field, value).await {
                Ok(remote) => keys.extend(remote),
                Err(e) => {
                    tracing::debug!(peer = %peer.name, error = %e, "index query failed");
                }
            }
        }
        let mut sorted: Vec<String> = keys.into_iter().collect();
        sorted.sort();
        sorted
    }
}

fn merged_context(versions: &[Record]) -> VersionVector {
    versions
        .iter()
        .filter_map(|r| r.meta.vector.as_ref())
        .fold(VersionVector::new(), |acc, v| acc.merge(v))
}

/// A replica is stale when it lacks any version of the merged set.
fn is_stale(theirs: &[Record], merged: &[Record]) -> bool {
    if theirs.len() != merged.len() {
        return true;
    }
    merged.iter().any(|m| {
        !theirs
            .iter()
            .any(|t| t.meta.op_id() == m.meta.op_id() && t.meta.lamport_ts == m.meta.lamport_ts)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerError, Pong, PutAck, ReplicateAck};
    use async_trait::async_trait;
    use meridian_config::ConsistencyMode;
    use meridian_ring::{HashRing, Partitioner};
    use meridian_storage::{FsyncPolicy, StorageOptions};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Mock transport: records calls, optionally failing specific targets,
    /// optionally answering gets with canned versions.
    #[derive(Default)]
    struct MockClient {
        fail_nodes: HashSet<NodeId>,
        puts: StdMutex<Vec<(NodeId, Record, Option<NodeId>)>>,
        get_answers: StdMutex<HashMap<NodeId, Vec<Record>>>,
    }

    impl MockClient {
        fn failing(nodes: impl IntoIterator<Item = NodeId>) -> Self {
            Self {
                fail_nodes: nodes.into_iter().collect(),
                ..Self::default()
            }
        }

        fn puts(&self) -> Vec<(NodeId, Record, Option<NodeId>)> {
            self.puts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerClient for MockClient {
        async fn put_record(
            &self,
            target: &PeerInfo,
            record: &Record,
            hinted_for: Option<NodeId>,
        ) -> Result<PutAck, PeerError> {
            if self.fail_nodes.contains(&target.id) {
                return Err(PeerError::RpcFailed("simulated failure".into()));
            }
            self.puts
                .lock()
                .unwrap()
                .push((target.id, record.clone(), hinted_for));
            Ok(PutAck { epoch: 1 })
        }

        async fn get_record(
            &self,
            target: &PeerInfo,
            _key: &str,
        ) -> Result<Vec<Record>, PeerError> {
            if self.fail_nodes.contains(&target.id) {
                return Err(PeerError::RpcFailed("simulated failure".into()));
            }
            Ok(self
                .get_answers
                .lock()
                .unwrap()
                .get(&target.id)
                .cloned()
                .unwrap_or_default())
        }

        async fn replicate(
            &self,
            _target: &PeerInfo,
            _batch: &[Record],
        ) -> Result<ReplicateAck, PeerError> {
            Ok(ReplicateAck {
                last_seen: VersionVector::new(),
            })
        }

        async fn fetch_updates(
            &self,
            _target: &PeerInfo,
            _last_seen: &VersionVector,
        ) -> Result<Vec<Record>, PeerError> {
            Ok(vec![])
        }

        async fn ping(&self, target: &PeerInfo) -> Result<Pong, PeerError> {
            Ok(Pong {
                node: target.id,
                epoch: 1,
            })
        }

        async fn update_partition_map(
            &self,
            _target: &PeerInfo,
            _state: &PartitionerState,
        ) -> Result<(), PeerError> {
            Ok(())
        }

        async fn update_hash_ring(
            &self,
            _target: &PeerInfo,
            _tokens: &[(NodeId, NodeId)],
            _epoch: u64,
        ) -> Result<(), PeerError> {
            Ok(())
        }

        async fn merkle_roots(&self, _target: &PeerInfo) -> Result<Vec<[u8; 20]>, PeerError> {
            Ok(vec![])
        }

        async fn segment_keys(
            &self,
            _target: &PeerInfo,
            _segment: usize,
        ) -> Result<Vec<(String, [u8; 20])>, PeerError> {
            Ok(vec![])
        }

        async fn list_by_index(
            &self,
            _target: &PeerInfo,
            _field: &str,
            _value: &str,
        ) -> Result<Vec<String>, PeerError> {
            Ok(vec![])
        }

        async fn scan(
            &self,
            _target: &PeerInfo,
            _partition_key: &str,
            _low_ck: &str,
            _high_ck: &str,
        ) -> Result<Vec<(String, Vec<u8>)>, PeerError> {
            Ok(vec![])
        }
    }

    struct Fixture {
        coordinator: Coordinator<MockClient>,
        client: Arc<MockClient>,
        detector: Arc<FailureDetector>,
        hints: Arc<HintStore>,
        _dir: TempDir,
    }

    /// Build a coordinator on node-a with the given peers on the ring.
    fn fixture(peer_names: &[&str], n: usize, w: usize, r: usize, client: MockClient) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            NodeStore::open(
                NodeId::from_name("node-a"),
                dir.path(),
                StorageOptions {
                    fsync: FsyncPolicy::None,
                    ..StorageOptions::default()
                },
                ConsistencyMode::Lww,
                vec![],
            )
            .unwrap(),
        );

        let mut ring = HashRing::new();
        ring.add_node(NodeId::from_name("node-a"), 8);
        let mut peers = Vec::new();
        for (i, name) in peer_names.iter().enumerate() {
            ring.add_node(NodeId::from_name(name), 8);
            peers.push(PeerInfo::new(
                *name,
                format!("127.0.0.1:{}", 7001 + i).parse().unwrap(),
            ));
        }

        let detector = Arc::new(FailureDetector::new(
            peers.iter().map(|p| p.id),
            Duration::from_secs(5),
            Duration::from_secs(15),
        ));
        // Everyone starts Live unless a test says otherwise.
        for peer in &peers {
            detector.record_reply(peer.id);
        }

        let hints = Arc::new(HintStore::open(&dir.path().join("hints")).unwrap());
        let client = Arc::new(client);
        let coordinator = Coordinator::new(
            store,
            Arc::new(RwLock::new(PartitionerState::new(Partitioner::Hash(ring)))),
            dir.path().join("partition_map.json"),
            Arc::new(PeerDirectory::new(peers)),
            client.clone(),
            detector.clone(),
            QuorumConfig {
                n,
                w,
                r,
                write_timeout: Duration::from_secs(2),
                read_timeout: Duration::from_secs(2),
                read_repair: true,
                hinted_handoff: true,
                load_balance_reads: false,
                enable_forwarding: false,
            },
        )
        .with_hint_store(hints.clone());

        Fixture {
            coordinator,
            client,
            detector,
            hints,
            _dir: dir,
        }
    }

    /// A key whose preference list includes the local node (placement is
    /// deterministic, so tests probe for one instead of hardcoding).
    fn key_owned_by_self(f: &Fixture) -> String {
        let self_id = f.coordinator.store().id();
        (0..1000)
            .map(|i| format!("probe-key-{i}"))
            .find(|k| {
                let (owners, _) = f.coordinator.placement(k);
                owners.contains(&self_id)
            })
            .expect("some key must be owned by the local node")
    }

    #[tokio::test]
    async fn test_put_and_get_single_node() {
        let f = fixture(&[], 1, 1, 1, MockClient::default());
        let ack = f
            .coordinator
            .put("user:1", b"alice".to_vec(), None, Consistency::Quorum, None)
            .await
            .unwrap();
        assert_eq!(ack.acks, 1);
        assert!(!ack.op_id.is_empty());

        let result = f
            .coordinator
            .get("user:1", Consistency::Quorum, None)
            .await
            .unwrap();
        assert_eq!(result.versions.len(), 1);
        assert_eq!(result.versions[0].value, b"alice");
    }

    #[tokio::test]
    async fn test_get_unknown_key() {
        let f = fixture(&[], 1, 1, 1, MockClient::default());
        assert!(matches!(
            f.coordinator.get("missing", Consistency::Quorum, None).await,
            Err(KvError::UnknownKey)
        ));
    }

    #[tokio::test]
    async fn test_delete_shadows_value() {
        let f = fixture(&[], 1, 1, 1, MockClient::default());
        f.coordinator
            .put("k", b"v".to_vec(), None, Consistency::Quorum, None)
            .await
            .unwrap();
        f.coordinator
            .delete("k", None, Consistency::Quorum, None)
            .await
            .unwrap();
        assert!(matches!(
            f.coordinator.get("k", Consistency::Quorum, None).await,
            Err(KvError::UnknownKey)
        ));
    }

    #[tokio::test]
    async fn test_write_fans_out_to_replicas() {
        let f = fixture(&["node-b", "node-c"], 3, 2, 2, MockClient::default());
        let key = key_owned_by_self(&f);
        f.coordinator
            .put(&key, b"v".to_vec(), None, Consistency::Quorum, None)
            .await
            .unwrap();

        let puts = f.client.puts();
        assert_eq!(puts.len(), 2, "both remote replicas receive the record");
        assert!(puts.iter().all(|(_, _, hinted)| hinted.is_none()));
    }

    #[tokio::test]
    async fn test_quorum_not_met_when_replicas_fail() {
        let fail: HashSet<NodeId> = [NodeId::from_name("node-b"), NodeId::from_name("node-c")]
            .into_iter()
            .collect();
        let f = fixture(
            &["node-b", "node-c"],
            3,
            2,
            2,
            MockClient::failing(fail),
        );
        let key = key_owned_by_self(&f);

        let err = f
            .coordinator
            .put(&key, b"v".to_vec(), None, Consistency::Quorum, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KvError::QuorumNotMet { needed: 2, got: 1 }
        ));

        // The local write survives for anti-entropy to reconcile.
        assert_eq!(f.coordinator.store().engine().get_live(&key).len(), 1);
        // And hints were queued for both silent owners.
        assert_eq!(f.hints.total_hints(), 2);
    }

    #[tokio::test]
    async fn test_sloppy_quorum_substitutes_dead_owner() {
        let f = fixture(&["node-b", "node-c", "node-d"], 3, 2, 2, MockClient::default());
        let key = key_owned_by_self(&f);

        // Find the owners for the key, mark the first remote owner Dead.
        let (owners, _) = f.coordinator.placement(&key);
        let dead_owner = *owners
            .iter()
            .find(|o| **o != f.coordinator.store().id())
            .unwrap();
        f.detector.forget(&dead_owner);

        f.coordinator
            .put(&key, b"v".to_vec(), None, Consistency::Quorum, None)
            .await
            .unwrap();

        let hinted: Vec<_> = f
            .client
            .puts()
            .into_iter()
            .filter(|(_, _, hinted)| *hinted == Some(dead_owner))
            .collect();
        assert_eq!(hinted.len(), 1, "a substitute carried the hint tag");
        assert!(
            !owners.contains(&hinted[0].0),
            "substitute must come from outside the preference list"
        );
    }

    #[tokio::test]
    async fn test_strong_write_needs_all_owners() {
        let fail: HashSet<NodeId> = [NodeId::from_name("node-b")].into_iter().collect();
        let f = fixture(&["node-b", "node-c"], 3, 1, 1, MockClient::failing(fail));
        let key = key_owned_by_self(&f);

        let err = f
            .coordinator
            .put(&key, b"v".to_vec(), None, Consistency::Strong, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::QuorumNotMet { needed: 3, .. }));
    }

    #[tokio::test]
    async fn test_read_repair_pushes_to_stale_replica() {
        let f = fixture(&["node-b"], 2, 1, 2, MockClient::default());

        // Local holds the newer version; node-b answers with an older one.
        f.coordinator
            .put("k", b"new".to_vec(), None, Consistency::Quorum, None)
            .await
            .unwrap();
        let stale = Record::new(
            "k".to_string(),
            b"old".to_vec(),
            meridian_storage::RecordMeta {
                lamport_ts: 0,
                origin: "ancient".to_string(),
                seq: 1,
                vector: None,
                tombstone: false,
            },
        );
        f.client
            .get_answers
            .lock()
            .unwrap()
            .insert(NodeId::from_name("node-b"), vec![stale]);

        let result = f
            .coordinator
            .get("k", Consistency::Quorum, None)
            .await
            .unwrap();
        assert_eq!(result.versions[0].value, b"new");

        // Give the fire-and-forget repair task a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let repairs: Vec<_> = f
            .client
            .puts()
            .into_iter()
            .filter(|(node, record, _)| {
                *node == NodeId::from_name("node-b") && record.value == b"new"
            })
            .collect();
        assert!(!repairs.is_empty(), "stale replica must be repaired");
    }

    #[tokio::test]
    async fn test_lww_conflict_resolution_on_read() {
        let f = fixture(&["node-b"], 2, 1, 2, MockClient::default());

        f.coordinator
            .put("k", b"v1".to_vec(), None, Consistency::Quorum, None)
            .await
            .unwrap();
        // node-b answers with a strictly newer stamp.
        let newer = Record::new(
            "k".to_string(),
            b"v2".to_vec(),
            meridian_storage::RecordMeta {
                lamport_ts: 1_000_000,
                origin: "zzzz".to_string(),
                seq: 1,
                vector: None,
                tombstone: false,
            },
        );
        f.client
            .get_answers
            .lock()
            .unwrap()
            .insert(NodeId::from_name("node-b"), vec![newer]);

        let result = f
            .coordinator
            .get("k", Consistency::Quorum, None)
            .await
            .unwrap();
        assert_eq!(result.versions.len(), 1);
        assert_eq!(result.versions[0].value, b"v2");
    }

    #[tokio::test]
    async fn test_handle_put_with_hint_tag_queues_only() {
        let f = fixture(&["node-b"], 2, 1, 1, MockClient::default());
        let owner = NodeId::from_name("node-b");
        let record = Record::new(
            "k".to_string(),
            b"v".to_vec(),
            meridian_storage::RecordMeta {
                lamport_ts: 1,
                origin: "x".to_string(),
                seq: 1,
                vector: None,
                tombstone: false,
            },
        );

        f.coordinator.handle_put(record, Some(owner)).unwrap();

        assert_eq!(f.hints.hints_for(&owner).len(), 1);
        assert!(
            f.coordinator.store().engine().get("k").is_empty(),
            "hinted data must stay out of the local keyspace"
        );
    }

    #[tokio::test]
    async fn test_handle_replicate_acks_last_seen() {
        let f = fixture(&[], 1, 1, 1, MockClient::default());
        let batch: Vec<Record> = (1..=3)
            .map(|seq| {
                Record::new(
                    format!("k{seq}"),
                    b"v".to_vec(),
                    meridian_storage::RecordMeta {
                        lamport_ts: seq,
                        origin: "origin-b".to_string(),
                        seq,
                        vector: None,
                        tombstone: false,
                    },
                )
            })
            .collect();

        let last_seen = f.coordinator.handle_replicate(&batch).unwrap();
        assert_eq!(last_seen.get("origin-b"), 3);

        // Redelivery is a no-op.
        let last_seen = f.coordinator.handle_replicate(&batch).unwrap();
        assert_eq!(last_seen.get("origin-b"), 3);
    }

    #[tokio::test]
    async fn test_stale_partition_map_rejected() {
        let f = fixture(&[], 1, 1, 1, MockClient::default());
        let current = f.coordinator.partitioner().read().unwrap().clone();
        assert!(matches!(
            f.coordinator.handle_partitioner_update(current),
            Err(KvError::StaleEpoch { .. })
        ));
    }

    #[tokio::test]
    async fn test_salted_hot_key_round_trip() {
        let f = fixture(&[], 1, 1, 1, MockClient::default());
        f.coordinator
            .put("hot", b"v0".to_vec(), None, Consistency::Quorum, None)
            .await
            .unwrap();
        f.coordinator.mark_hot_key("hot", 4, true).await.unwrap();

        // Subsequent writes land in some bucket; reads fan in over all.
        f.coordinator
            .put("hot", b"v1".to_vec(), None, Consistency::Quorum, None)
            .await
            .unwrap();
        let result = f
            .coordinator
            .get("hot", Consistency::Quorum, None)
            .await
            .unwrap();
        assert_eq!(result.versions.len(), 1);
        assert_eq!(result.versions[0].value, b"v1");
    }
}
