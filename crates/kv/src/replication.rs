//! Replication log and per-peer sender tasks.
//!
//! Locally originated ops are appended to a durable log
//! (`replication_log.json`) keyed by their per-origin sequence. One
//! background sender per peer pushes batches in sequence order via
//! `Replicate`, advances its cursor from the peer's acknowledged
//! `last_seen`, and retries forever with exponential backoff; peer
//! liveness classification belongs to the heartbeat, not to the senders.
//! Entries are truncated once every known peer has acknowledged them.

use crate::peer::{PeerClient, PeerInfo};
use meridian_storage::Record;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Duration;

const BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogState {
    /// seq → op, ascending. Only ops this node originated.
    entries: BTreeMap<u64, Record>,
    /// peer (hex id) → highest sequence that peer has acknowledged.
    peer_acks: HashMap<String, u64>,
}

/// Durable queue of locally originated ops awaiting peer acknowledgement.
#[derive(Debug)]
pub struct ReplicationLog {
    state: LogState,
    path: PathBuf,
}

impl ReplicationLog {
    pub fn open(path: &Path) -> Result<Self, std::io::Error> {
        let state = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "replication log unreadable; starting empty");
                LogState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LogState::default(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            state,
            path: path.to_path_buf(),
        })
    }

    fn save(&self) -> Result<(), std::io::Error> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(&self.state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Append a locally originated op.
    pub fn append(&mut self, record: Record) -> Result<(), std::io::Error> {
        self.state.entries.insert(record.meta.seq, record);
        self.save()
    }

    /// The next batch for a peer: entries after its cursor, in sequence
    /// order, at most `max`.
    pub fn batch_for_peer(&self, peer_hex: &str, max: usize) -> Vec<Record> {
        let cursor = self.state.peer_acks.get(peer_hex).copied().unwrap_or(0);
        self.state
            .entries
            .range(cursor + 1..)
            .take(max)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Advance a peer's cursor (never backwards).
    pub fn record_ack(&mut self, peer_hex: &str, seq: u64) -> Result<(), std::io::Error> {
        let entry = self
            .state
            .peer_acks
            .entry(peer_hex.to_string())
            .or_insert(0);
        if seq > *entry {
            *entry = seq;
            self.save()?;
        }
        Ok(())
    }

    pub fn cursor(&self, peer_hex: &str) -> u64 {
        self.state.peer_acks.get(peer_hex).copied().unwrap_or(0)
    }

    /// Drop entries every known peer has acknowledged. A peer with no
    /// recorded ack pins the whole log.
    pub fn truncate(&mut self, known_peers: &[String]) -> Result<usize, std::io::Error> {
        if known_peers.is_empty() {
            return Ok(0);
        }
        let min_acked = known_peers
            .iter()
            .map(|p| self.state.peer_acks.get(p).copied().unwrap_or(0))
            .min()
            .unwrap_or(0);
        let keep = self.state.entries.split_off(&(min_acked + 1));
        let dropped = self.state.entries.len();
        self.state.entries = keep;
        if dropped > 0 {
            self.save()?;
        }
        Ok(dropped)
    }

    pub fn pending_len(&self) -> usize {
        self.state.entries.len()
    }

    /// Highest sequence ever appended (0 when empty); restores the origin
    /// sequence counter together with the persisted `last_seen`.
    pub fn max_seq(&self) -> u64 {
        self.state.entries.keys().next_back().copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Sender task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Pass interval while the log is drained.
    pub interval: Duration,
    /// Maximum ops per Replicate batch.
    pub max_batch_size: usize,
}

/// Spawn the replication sender for one peer.
pub fn spawn_replication_sender<C: PeerClient>(
    peer: PeerInfo,
    log: Arc<Mutex<ReplicationLog>>,
    origin_hex: String,
    all_peers_hex: Vec<String>,
    client: Arc<C>,
    config: SenderConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let peer_hex = peer.id.hex();
        let mut backoff = BACKOFF_INITIAL;
        loop {
            let batch = {
                let log = log.lock().expect("replication log lock");
                log.batch_for_peer(&peer_hex, config.max_batch_size)
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(config.interval) => continue,
                    _ = shutdown.changed() => break,
                }
            }

            match client.replicate(&peer, &batch).await {
                Ok(ack) => {
                    let acked = ack.last_seen.get(&origin_hex);
                    {
                        let mut log = log.lock().expect("replication log lock");
                        if let Err(e) = log.record_ack(&peer_hex, acked) {
                            tracing::warn!(peer = %peer.name, error = %e, "failed to persist ack cursor");
                        }
                        if let Err(e) = log.truncate(&all_peers_hex) {
                            tracing::warn!(error = %e, "replication log truncation failed");
                        }
                    }
                    meridian_metrics::metrics()
                        .replication_batches_sent
                        .inc();
                    tracing::debug!(peer = %peer.name, ops = batch.len(), acked, "replicated batch");
                    backoff = BACKOFF_INITIAL;
                }
                Err(e) => {
                    tracing::debug!(peer = %peer.name, error = %e, "replicate failed; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }

            if *shutdown.borrow() {
                break;
            }
        }
        tracing::debug!(peer = %peer.name, "replication sender stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_storage::RecordMeta;
    use tempfile::TempDir;

    fn op(seq: u64) -> Record {
        Record::new(
            format!("k{seq}"),
            b"v".to_vec(),
            RecordMeta {
                lamport_ts: seq,
                origin: "self".to_string(),
                seq,
                vector: None,
                tombstone: false,
            },
        )
    }

    #[test]
    fn test_append_and_batch() {
        let dir = TempDir::new().unwrap();
        let mut log = ReplicationLog::open(&dir.path().join("replication_log.json")).unwrap();
        for seq in 1..=5 {
            log.append(op(seq)).unwrap();
        }

        let batch = log.batch_for_peer("peer-a", 3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].meta.seq, 1);
        assert_eq!(batch[2].meta.seq, 3);

        log.record_ack("peer-a", 3).unwrap();
        let batch = log.batch_for_peer("peer-a", 10);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].meta.seq, 4);
    }

    #[test]
    fn test_ack_never_regresses() {
        let dir = TempDir::new().unwrap();
        let mut log = ReplicationLog::open(&dir.path().join("log.json")).unwrap();
        log.record_ack("p", 7).unwrap();
        log.record_ack("p", 3).unwrap();
        assert_eq!(log.cursor("p"), 7);
    }

    #[test]
    fn test_truncate_at_min_ack() {
        let dir = TempDir::new().unwrap();
        let mut log = ReplicationLog::open(&dir.path().join("log.json")).unwrap();
        for seq in 1..=6 {
            log.append(op(seq)).unwrap();
        }
        log.record_ack("a", 5).unwrap();
        log.record_ack("b", 3).unwrap();

        let dropped = log
            .truncate(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(dropped, 3, "entries 1..=3 acked by everyone");
        assert_eq!(log.pending_len(), 3);
        assert_eq!(log.batch_for_peer("b", 10)[0].meta.seq, 4);
    }

    #[test]
    fn test_truncate_pinned_by_silent_peer() {
        let dir = TempDir::new().unwrap();
        let mut log = ReplicationLog::open(&dir.path().join("log.json")).unwrap();
        for seq in 1..=4 {
            log.append(op(seq)).unwrap();
        }
        log.record_ack("a", 4).unwrap();
        // Peer "b" has never acked: nothing may be dropped.
        let dropped = log
            .truncate(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(dropped, 0);
        assert_eq!(log.pending_len(), 4);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replication_log.json");
        {
            let mut log = ReplicationLog::open(&path).unwrap();
            log.append(op(1)).unwrap();
            log.append(op(2)).unwrap();
            log.record_ack("a", 1).unwrap();
        }
        let log = ReplicationLog::open(&path).unwrap();
        assert_eq!(log.pending_len(), 2);
        assert_eq!(log.cursor("a"), 1);
        assert_eq!(log.max_seq(), 2);
    }

    #[test]
    fn test_empty_known_peers_never_truncates() {
        let dir = TempDir::new().unwrap();
        let mut log = ReplicationLog::open(&dir.path().join("log.json")).unwrap();
        log.append(op(1)).unwrap();
        assert_eq!(log.truncate(&[]).unwrap(), 0);
        assert_eq!(log.pending_len(), 1);
    }
}
