//! Per-node state: engine, Lamport clock, `last_seen`, replication log,
//! secondary index.
//!
//! All counters that were process-global in older designs live here, scoped
//! to the node. Two apply paths exist on purpose:
//!
//! * [`NodeStore::apply_replicated`] serves the ordered `Replicate` /
//!   `FetchUpdates` channel: an op is applied only when its sequence
//!   advances `last_seen[origin]`, which makes delivery exactly-once and
//!   FIFO per origin.
//! * [`NodeStore::apply_direct`] serves coordinator fan-out, hint delivery,
//!   read repair, and anti-entropy: those deliveries can interleave with
//!   the ordered channel, so they rely on the storage merge being
//!   idempotent and never touch `last_seen`.

use crate::index::IndexManager;
use crate::merge::crdt_merge_incoming;
use crate::replication::ReplicationLog;
use crate::KvError;
use meridian_common::{LamportClock, NodeId, VersionVector};
use meridian_config::ConsistencyMode;
use meridian_storage::{LsmEngine, Record, RecordMeta, StorageOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Outcome of an op delivered on the ordered replication channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Sequence not beyond `last_seen[origin]`; silently ignored.
    Duplicate,
}

/// Persisted alongside the data: the applied-sequence vector and the
/// Lamport clock's high-water mark.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    last_seen: VersionVector,
    lamport: u64,
}

pub struct NodeStore {
    id: NodeId,
    id_hex: String,
    mode: ConsistencyMode,
    engine: Arc<LsmEngine>,
    clock: LamportClock,
    seq: AtomicU64,
    /// `last_seen` and its persistence share one mutex; updates are small.
    state: Mutex<StoreState>,
    state_path: PathBuf,
    replication_log: Arc<Mutex<ReplicationLog>>,
    index: Mutex<IndexManager>,
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl NodeStore {
    /// Open the node's storage under `data_dir` and restore clock, sequence
    /// counter, `last_seen`, and the replication log.
    pub fn open(
        id: NodeId,
        data_dir: &Path,
        options: StorageOptions,
        mode: ConsistencyMode,
        index_fields: Vec<String>,
    ) -> Result<Self, KvError> {
        let engine = Arc::new(LsmEngine::open(data_dir, options)?);

        let state_path = data_dir.join("last_seen.json");
        let state: StoreState = match std::fs::read(&state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(KvError::Storage(e.into())),
        };

        let replication_log = ReplicationLog::open(&data_dir.join("replication_log.json"))
            .map_err(|e| KvError::Storage(e.into()))?;

        let id_hex = id.hex();
        // The origin sequence resumes past everything we ever issued:
        // entries still in the log and entries already acknowledged away.
        let seq = replication_log.max_seq().max(state.last_seen.get(&id_hex));
        let clock = LamportClock::starting_at(state.lamport);

        let mut index = IndexManager::new(index_fields);
        if index.is_enabled() {
            for (key, versions) in engine.snapshot_all() {
                for record in versions.iter().filter(|r| !r.is_tombstone()) {
                    index.add_record(&key, &record.value);
                }
            }
        }

        Ok(Self {
            id,
            id_hex,
            mode,
            engine,
            clock,
            seq: AtomicU64::new(seq),
            state: Mutex::new(state),
            state_path,
            replication_log: Arc::new(Mutex::new(replication_log)),
            index: Mutex::new(index),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn id_hex(&self) -> &str {
        &self.id_hex
    }

    pub fn mode(&self) -> ConsistencyMode {
        self.mode
    }

    pub fn engine(&self) -> &Arc<LsmEngine> {
        &self.engine
    }

    pub fn replication_log(&self) -> &Arc<Mutex<ReplicationLog>> {
        &self.replication_log
    }

    pub fn clock_now(&self) -> u64 {
        self.clock.now()
    }

    pub fn last_seen_snapshot(&self) -> VersionVector {
        self.state.lock().expect("store state lock").last_seen.clone()
    }

    fn persist_state(&self, state: &StoreState) {
        let tmp = self.state_path.with_extension("tmp");
        let write = serde_json::to_vec(state)
            .map_err(std::io::Error::other)
            .and_then(|bytes| std::fs::write(&tmp, bytes))
            .and_then(|()| std::fs::rename(&tmp, &self.state_path));
        if let Err(e) = write {
            tracing::warn!(error = %e, "failed to persist last_seen state");
        }
    }

    // -----------------------------------------------------------------------
    // Local origination
    // -----------------------------------------------------------------------

    /// Stamp a new op with this node's Lamport time, origin, and next
    /// sequence. Pure with respect to the engine and replication log.
    fn stamp(&self, key: &str, value: Option<Vec<u8>>, context: Option<VersionVector>) -> Record {
        let lamport_ts = self.clock.tick();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        let vector = match self.mode {
            ConsistencyMode::Lww => None,
            ConsistencyMode::Vector | ConsistencyMode::Crdt => {
                Some(context.unwrap_or_default().increment(&self.id_hex))
            }
        };

        let meta = RecordMeta {
            lamport_ts,
            origin: self.id_hex.clone(),
            seq,
            vector,
            tombstone: value.is_none(),
        };
        match value {
            Some(value) => {
                let candidate = Record::new(key.to_string(), value, meta);
                if self.mode == ConsistencyMode::Crdt {
                    crdt_merge_incoming(self.engine.get_live(key), candidate)
                } else {
                    candidate
                }
            }
            None => Record::tombstone(key.to_string(), meta),
        }
    }

    /// Record durably that a sequence number has been issued, so a restart
    /// can never reuse an op id.
    fn consume_sequence(&self, seq: u64) {
        let mut state = self.state.lock().expect("store state lock");
        state.last_seen.observe(&self.id_hex, seq);
        state.lamport = self.clock.now();
        let snapshot = state.clone();
        self.persist_state(&snapshot);
    }

    /// Create, persist, and log a locally originated write. Returns the
    /// record to fan out. `context` is the client's version-vector context
    /// (vector mode); CRDT values are joined with the local state before
    /// being stamped.
    pub fn originate(
        &self,
        key: &str,
        value: Option<Vec<u8>>,
        context: Option<VersionVector>,
    ) -> Result<Record, KvError> {
        let record = self.stamp(key, value, context);

        self.engine.apply(record.clone())?;
        self.update_index(&record);

        {
            let mut log = self.replication_log.lock().expect("replication log lock");
            log.append(record.clone())
                .map_err(|e| KvError::Storage(e.into()))?;
        }
        self.consume_sequence(record.meta.seq);
        Ok(record)
    }

    /// Stamp a write for a key this node does not replicate (the forwarding
    /// path). The sequence is consumed durably, but nothing enters the
    /// local engine, index, or replication log, so a non-owner retains no
    /// copy of data it merely forwards and its anti-entropy digests stay
    /// clean.
    pub fn stamp_forwarded(
        &self,
        key: &str,
        value: Option<Vec<u8>>,
        context: Option<VersionVector>,
    ) -> Record {
        let record = self.stamp(key, value, context);
        self.consume_sequence(record.meta.seq);
        record
    }

    // -----------------------------------------------------------------------
    // Remote application
    // -----------------------------------------------------------------------

    /// Apply a record delivered outside the ordered channel. Idempotent by
    /// the storage merge; `last_seen` is untouched so the ordered channel
    /// never skips an op on this record's account.
    pub fn apply_direct(&self, record: &Record) -> Result<(), KvError> {
        self.clock.update(record.meta.lamport_ts);
        let stored = if self.mode == ConsistencyMode::Crdt && !record.is_tombstone() {
            crdt_merge_incoming(self.engine.get_live(&record.key), record.clone())
        } else {
            record.clone()
        };
        self.engine.apply(stored.clone())?;
        self.update_index(&stored);
        Ok(())
    }

    /// Apply an op from a `Replicate` / `FetchUpdates` batch. Ops at or
    /// below `last_seen[origin]` are duplicates and ignored.
    pub fn apply_replicated(&self, record: &Record) -> Result<ApplyOutcome, KvError> {
        {
            let state = self.state.lock().expect("store state lock");
            if record.meta.seq <= state.last_seen.get(&record.meta.origin) {
                return Ok(ApplyOutcome::Duplicate);
            }
        }

        self.apply_direct(record)?;

        let mut state = self.state.lock().expect("store state lock");
        state.last_seen.observe(&record.meta.origin, record.meta.seq);
        state.lamport = self.clock.now();
        let snapshot = state.clone();
        drop(state);
        self.persist_state(&snapshot);
        Ok(ApplyOutcome::Applied)
    }

    /// Ops this node knows that `requester` has not seen, ordered by
    /// `(origin, seq)`. Serves `FetchUpdates`.
    pub fn fetch_updates(&self, requester: &VersionVector, max: usize) -> Vec<Record> {
        let mut out: Vec<Record> = Vec::new();
        for (_, versions) in self.engine.snapshot_all() {
            for record in versions {
                if record.meta.seq > requester.get(&record.meta.origin) {
                    out.push(record);
                }
            }
        }
        out.sort_by(|a, b| {
            (&a.meta.origin, a.meta.seq).cmp(&(&b.meta.origin, b.meta.seq))
        });
        out.truncate(max);
        out
    }

    // -----------------------------------------------------------------------
    // Index
    // -----------------------------------------------------------------------

    fn update_index(&self, record: &Record) {
        let mut index = self.index.lock().expect("index lock");
        if !index.is_enabled() {
            return;
        }
        if record.is_tombstone() {
            index.remove_key(&record.key);
        } else {
            index.add_record(&record.key, &record.value);
        }
    }

    pub fn query_index(&self, field: &str, value: &str) -> Vec<String> {
        self.index.lock().expect("index lock").query(field, value)
    }
}
