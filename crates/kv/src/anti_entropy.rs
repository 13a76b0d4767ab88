//! Merkle-tree anti-entropy worker.
//!
//! Each round picks one random Live peer, compares segment roots, descends
//! into divergent segments for key-level diffs, and pulls only the
//! differing keys, applying them through the normal merge path. The whole
//! exchange is idempotent and runs concurrently with foreground traffic.
//! Incoming live records older than the tombstone retention horizon are
//! refused so keys whose tombstones were already compacted away cannot
//! resurface.

use crate::heartbeat::FailureDetector;
use crate::merkle::{diff_leaves, Hash, SegmentDigests};
use crate::peer::{PeerClient, PeerDirectory, PeerInfo};
use crate::store::NodeStore;
use meridian_storage::record::now_ms;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct AntiEntropyConfig {
    pub interval: Duration,
    /// Number of keyspace segments digests are computed over.
    pub segments: usize,
    /// Ceiling on keys pulled per round; the rest waits for the next round.
    pub max_keys_per_round: usize,
    /// Tombstone retention horizon; incoming live records older than this
    /// are presumed deleted and skipped.
    pub retention: Duration,
}

impl Default for AntiEntropyConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            segments: 16,
            max_keys_per_round: 1000,
            retention: Duration::from_secs(86_400),
        }
    }
}

/// Segment roots of the local keyspace (serves the `MerkleDigest` RPC).
pub fn local_roots(store: &NodeStore, segments: usize) -> Vec<Hash> {
    SegmentDigests::build(&store.engine().snapshot_all(), segments).roots()
}

/// Leaf `(key, hash)` pairs of one local segment (serves `SegmentKeys`).
pub fn local_segment_keys(
    store: &NodeStore,
    segment: usize,
    segments: usize,
) -> Vec<(String, Hash)> {
    SegmentDigests::build(&store.engine().snapshot_all(), segments).leaves(segment)
}

/// Spawn the periodic anti-entropy worker.
pub fn spawn_anti_entropy_task<C: PeerClient>(
    store: Arc<NodeStore>,
    directory: Arc<PeerDirectory>,
    detector: Arc<FailureDetector>,
    client: Arc<C>,
    config: AntiEntropyConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(config.interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }

            let live = detector.live_peers();
            let candidates: Vec<PeerInfo> = directory
                .all()
                .into_iter()
                .filter(|p| live.contains(&p.id))
                .collect();
            let Some(peer) = candidates.choose(&mut rand::thread_rng()).cloned() else {
                continue;
            };

            match run_round(&store, &peer, client.as_ref(), &config).await {
                Ok(repaired) => {
                    meridian_metrics::metrics().anti_entropy_rounds.inc();
                    if repaired > 0 {
                        meridian_metrics::metrics()
                            .anti_entropy_keys_repaired
                            .inc_by(repaired as u64);
                        tracing::info!(peer = %peer.name, repaired, "anti-entropy round repaired keys");
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %peer.name, error = %e, "anti-entropy round failed");
                }
            }
        }
        tracing::debug!("anti-entropy task stopped");
    })
}

/// One reconciliation round against one peer. Returns the number of keys
/// pulled.
pub async fn run_round<C: PeerClient>(
    store: &Arc<NodeStore>,
    peer: &PeerInfo,
    client: &C,
    config: &AntiEntropyConfig,
) -> Result<usize, crate::KvError> {
    let digests = SegmentDigests::build(&store.engine().snapshot_all(), config.segments);
    let our_roots = digests.roots();
    let their_roots = client.merkle_roots(peer).await?;

    let retention_ms = config.retention.as_millis() as u64;
    let mut repaired = 0usize;

    for segment in 0..our_roots.len().min(their_roots.len()) {
        if our_roots[segment] == their_roots[segment] {
            continue;
        }

        let ours = digests.leaves(segment);
        let theirs = client.segment_keys(peer, segment).await?;
        let divergent = diff_leaves(&ours, &theirs);

        for key in divergent {
            if repaired >= config.max_keys_per_round {
                tracing::debug!(segment, "key budget exhausted; deferring to next round");
                return Ok(repaired);
            }
            let records = client.get_record(peer, &key).await?;
            if records.is_empty() {
                // The peer is the one missing data; it will pull from us on
                // its own rounds.
                continue;
            }
            let mut pulled = false;
            for record in records {
                // Never resurrect: a live record past the retention horizon
                // may predate a tombstone we already compacted away.
                if !record.is_tombstone()
                    && now_ms().saturating_sub(record.stored_at_ms) > retention_ms
                {
                    tracing::debug!(key = %record.key, "skipping record past retention horizon");
                    continue;
                }
                store.apply_direct(&record)?;
                pulled = true;
            }
            if pulled {
                repaired += 1;
            }
        }
    }
    Ok(repaired)
}

/// Pull-based catch-up after a restart: drain `FetchUpdates` from every
/// peer until each returns an empty delta.
pub async fn startup_sync<C: PeerClient>(
    store: &Arc<NodeStore>,
    directory: &Arc<PeerDirectory>,
    client: &C,
    max_batch: usize,
) {
    for peer in directory.all() {
        loop {
            let last_seen = store.last_seen_snapshot();
            match client.fetch_updates(&peer, &last_seen).await {
                Ok(ops) if ops.is_empty() => break,
                Ok(ops) => {
                    let count = ops.len();
                    for op in ops {
                        if let Err(e) = store.apply_replicated(&op) {
                            tracing::warn!(error = %e, "startup sync apply failed");
                        }
                    }
                    tracing::info!(peer = %peer.name, count, "caught up ops from peer");
                    if count < max_batch {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %peer.name, error = %e, "startup sync unavailable");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerError, Pong, PutAck, ReplicateAck};
    use async_trait::async_trait;
    use meridian_common::{NodeId, VersionVector};
    use meridian_config::ConsistencyMode;
    use meridian_ring::PartitionerState;
    use meridian_storage::{FsyncPolicy, Record, RecordMeta, StorageOptions};
    use tempfile::TempDir;

    fn open_store(dir: &std::path::Path, name: &str) -> Arc<NodeStore> {
        Arc::new(
            NodeStore::open(
                NodeId::from_name(name),
                dir,
                StorageOptions {
                    fsync: FsyncPolicy::None,
                    ..StorageOptions::default()
                },
                ConsistencyMode::Lww,
                vec![],
            )
            .unwrap(),
        )
    }

    fn rec(key: &str, value: &str, ts: u64, origin: &str, seq: u64) -> Record {
        Record::new(
            key.to_string(),
            value.as_bytes().to_vec(),
            RecordMeta {
                lamport_ts: ts,
                origin: origin.to_string(),
                seq,
                vector: None,
                tombstone: false,
            },
        )
    }

    /// Loopback transport answering from a real peer store.
    struct Loopback {
        remote: Arc<NodeStore>,
        segments: usize,
    }

    #[async_trait]
    impl PeerClient for Loopback {
        async fn put_record(
            &self,
            _target: &PeerInfo,
            record: &Record,
            _hinted_for: Option<NodeId>,
        ) -> Result<PutAck, PeerError> {
            self.remote
                .apply_direct(record)
                .map_err(|e| PeerError::RpcFailed(e.to_string()))?;
            Ok(PutAck { epoch: 1 })
        }

        async fn get_record(
            &self,
            _target: &PeerInfo,
            key: &str,
        ) -> Result<Vec<Record>, PeerError> {
            Ok(self.remote.engine().get(key))
        }

        async fn replicate(
            &self,
            _target: &PeerInfo,
            batch: &[Record],
        ) -> Result<ReplicateAck, PeerError> {
            for record in batch {
                self.remote
                    .apply_replicated(record)
                    .map_err(|e| PeerError::RpcFailed(e.to_string()))?;
            }
            Ok(ReplicateAck {
                last_seen: self.remote.last_seen_snapshot(),
            })
        }

        async fn fetch_updates(
            &self,
            _target: &PeerInfo,
            last_seen: &VersionVector,
        ) -> Result<Vec<Record>, PeerError> {
            Ok(self.remote.fetch_updates(last_seen, 100))
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

        async fn merkle_roots(&self, _target: &PeerInfo) -> Result<Vec<Hash>, PeerError> {
            Ok(local_roots(&self.remote, self.segments))
        }

        async fn segment_keys(
            &self,
            _target: &PeerInfo,
            segment: usize,
        ) -> Result<Vec<(String, Hash)>, PeerError> {
            Ok(local_segment_keys(&self.remote, segment, self.segments))
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

    fn config() -> AntiEntropyConfig {
        AntiEntropyConfig {
            interval: Duration::from_secs(30),
            segments: 8,
            max_keys_per_round: 1000,
            retention: Duration::from_secs(86_400),
        }
    }

    fn peer_info() -> PeerInfo {
        PeerInfo::new("node-b", "127.0.0.1:7001".parse().unwrap())
    }

    #[tokio::test]
    async fn test_round_pulls_missing_keys() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = open_store(dir_a.path(), "node-a");
        let b = open_store(dir_b.path(), "node-b");

        for i in 0..20 {
            b.apply_direct(&rec(&format!("k{i}"), "v", i + 1, "origin-b", i + 1))
                .unwrap();
        }

        let client = Loopback {
            remote: b.clone(),
            segments: 8,
        };
        let repaired = run_round(&a, &peer_info(), &client, &config())
            .await
            .unwrap();
        assert_eq!(repaired, 20);
        for i in 0..20 {
            assert_eq!(a.engine().get_live(&format!("k{i}"))[0].value, b"v");
        }

        // A second round finds nothing to do.
        let repaired = run_round(&a, &peer_info(), &client, &config())
            .await
            .unwrap();
        assert_eq!(repaired, 0);
    }

    #[tokio::test]
    async fn test_round_converges_newer_version() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = open_store(dir_a.path(), "node-a");
        let b = open_store(dir_b.path(), "node-b");

        a.apply_direct(&rec("k", "old", 5, "origin-a", 1)).unwrap();
        b.apply_direct(&rec("k", "new", 9, "origin-b", 1)).unwrap();

        let client = Loopback {
            remote: b.clone(),
            segments: 8,
        };
        run_round(&a, &peer_info(), &client, &config())
            .await
            .unwrap();

        let versions = a.engine().get_live("k");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].value, b"new");
    }

    #[tokio::test]
    async fn test_tombstone_dominance_propagates() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = open_store(dir_a.path(), "node-a");
        let b = open_store(dir_b.path(), "node-b");

        a.apply_direct(&rec("k", "v", 5, "origin-a", 1)).unwrap();
        let mut tomb = rec("k", "", 9, "origin-b", 1);
        tomb.meta.tombstone = true;
        b.apply_direct(&tomb).unwrap();

        let client = Loopback {
            remote: b.clone(),
            segments: 8,
        };
        run_round(&a, &peer_info(), &client, &config())
            .await
            .unwrap();

        assert!(
            a.engine().get_live("k").is_empty(),
            "no replica may report the pre-delete value"
        );
    }

    #[tokio::test]
    async fn test_retention_horizon_blocks_resurrection() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = open_store(dir_a.path(), "node-a");
        let b = open_store(dir_b.path(), "node-b");

        // The peer still holds a value so old that our tombstone for it
        // could already have been compacted away.
        let mut ancient = rec("zombie", "braaains", 1, "origin-b", 1);
        ancient.stored_at_ms = 0;
        b.apply_direct(&ancient).unwrap();

        let client = Loopback {
            remote: b.clone(),
            segments: 8,
        };
        let repaired = run_round(&a, &peer_info(), &client, &config())
            .await
            .unwrap();
        assert_eq!(repaired, 0);
        assert!(a.engine().get_live("zombie").is_empty());
    }

    #[tokio::test]
    async fn test_startup_sync_catches_up() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = open_store(dir_a.path(), "node-a");
        let b = open_store(dir_b.path(), "node-b");

        // b originated 150 ops while a was down.
        for i in 1..=150u64 {
            b.originate(&format!("k{i}"), Some(b"v".to_vec()), None)
                .unwrap();
        }

        let client = Loopback {
            remote: b.clone(),
            segments: 8,
        };
        let directory = Arc::new(PeerDirectory::new([peer_info()]));
        startup_sync(&a, &directory, &client, 100).await;

        assert_eq!(a.last_seen_snapshot().get(b.id_hex()), 150);
        assert_eq!(a.engine().get_live("k150")[0].value, b"v");
    }
}
