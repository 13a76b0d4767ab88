//! Snapshot-isolation transactions with optional 2PL row locks.
//!
//! `begin` snapshots the Lamport clock; reads and writes buffer against the
//! transaction until commit. Commit validates the read set (any read key
//! whose latest committed timestamp moved past the snapshot aborts with a
//! serialization conflict), then applies the write set through the engine
//! and replication log under one commit lock. Under the 2PL strategy, reads
//! take shared and writes exclusive row locks; lock waits time out, which
//! doubles as deadlock resolution.

use crate::merge::reconcile;
use crate::store::NodeStore;
use crate::KvError;
use meridian_common::VersionVector;
use meridian_config::TxLockStrategy;
use meridian_storage::wal::WalEntry;
use meridian_storage::Record;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

const LOCK_RETRY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct TxOptions {
    pub lock_strategy: TxLockStrategy,
    pub lock_timeout: Duration,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            lock_strategy: TxLockStrategy::Optimistic,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Lock table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Multiple readers.
    Shared,
    /// Single writer, no readers.
    Exclusive,
}

#[derive(Debug)]
struct LockEntry {
    mode: LockMode,
    owners: HashSet<String>,
}

/// Keyed row locks. No global table lock: conflicts resolve per key, and
/// waits expire after the configured timeout.
#[derive(Debug, Default)]
pub struct LockTable {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl LockTable {
    fn try_acquire(&self, key: &str, tx_id: &str, mode: LockMode) -> bool {
        let mut entries = self.entries.lock().expect("lock table lock");
        match entries.get_mut(key) {
            None => {
                entries.insert(
                    key.to_string(),
                    LockEntry {
                        mode,
                        owners: HashSet::from([tx_id.to_string()]),
                    },
                );
                true
            }
            Some(entry) => {
                if entry.owners.contains(tx_id) {
                    // Re-entrant; upgrade allowed for a sole holder.
                    if mode == LockMode::Exclusive && entry.owners.len() > 1 {
                        return false;
                    }
                    if mode == LockMode::Exclusive {
                        entry.mode = LockMode::Exclusive;
                    }
                    true
                } else if entry.mode == LockMode::Shared && mode == LockMode::Shared {
                    entry.owners.insert(tx_id.to_string());
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Acquire with a deadline; expiry reports the key that could not be
    /// locked.
    pub async fn acquire(
        &self,
        key: &str,
        tx_id: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<(), KvError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire(key, tx_id, mode) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(KvError::LockTimeout(key.to_string()));
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
    }

    /// Release every lock held by a transaction (commit or abort).
    pub fn release_all(&self, tx_id: &str) {
        let mut entries = self.entries.lock().expect("lock table lock");
        entries.retain(|_, entry| {
            entry.owners.remove(tx_id);
            !entry.owners.is_empty()
        });
    }

    pub fn holder_count(&self, key: &str) -> usize {
        self.entries
            .lock()
            .expect("lock table lock")
            .get(key)
            .map(|e| e.owners.len())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Transaction manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct BufferedWrite {
    key: String,
    /// `None` buffers a delete.
    value: Option<Vec<u8>>,
    context: Option<VersionVector>,
}

#[derive(Debug, Default)]
struct TxState {
    snapshot_ts: u64,
    writes: Vec<BufferedWrite>,
    reads: HashSet<String>,
}

pub struct TxManager {
    store: Arc<NodeStore>,
    options: TxOptions,
    active: Mutex<HashMap<String, TxState>>,
    locks: LockTable,
    /// Serializes validate+apply so two commits cannot interleave.
    commit_mutex: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for TxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxManager")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl TxManager {
    pub fn new(store: Arc<NodeStore>, options: TxOptions) -> Self {
        Self {
            store,
            options,
            active: Mutex::new(HashMap::new()),
            locks: LockTable::default(),
            commit_mutex: tokio::sync::Mutex::new(()),
        }
    }

    fn with_tx<T>(
        &self,
        tx_id: &str,
        f: impl FnOnce(&mut TxState) -> T,
    ) -> Result<T, KvError> {
        let mut active = self.active.lock().expect("tx table lock");
        let state = active
            .get_mut(tx_id)
            .ok_or_else(|| KvError::UnknownTx(tx_id.to_string()))?;
        Ok(f(state))
    }

    /// Start a transaction; returns its id.
    pub fn begin(&self) -> Result<String, KvError> {
        let tx_id = uuid::Uuid::new_v4().to_string();
        let snapshot_ts = self.store.clock_now();
        self.store.engine().log_tx_marker(&WalEntry::TxBegin {
            tx_id: tx_id.clone(),
        })?;
        self.active.lock().expect("tx table lock").insert(
            tx_id.clone(),
            TxState {
                snapshot_ts,
                ..TxState::default()
            },
        );
        tracing::debug!(tx_id, snapshot_ts, "transaction started");
        Ok(tx_id)
    }

    /// Read within a transaction: the own write-set first, then the
    /// snapshot view. Records the key for commit validation.
    pub async fn read(&self, tx_id: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        if self.options.lock_strategy == TxLockStrategy::TwoPhase {
            self.locks
                .acquire(key, tx_id, LockMode::Shared, self.options.lock_timeout)
                .await?;
        }
        self.read_unlocked(tx_id, key)
    }

    /// Read with an exclusive row lock held until commit/abort, blocking
    /// conflicting writers regardless of lock strategy.
    pub async fn get_for_update(
        &self,
        tx_id: &str,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, KvError> {
        self.locks
            .acquire(
                key,
                tx_id,
                LockMode::Exclusive,
                timeout.unwrap_or(self.options.lock_timeout),
            )
            .await?;
        self.read_unlocked(tx_id, key)
    }

    fn read_unlocked(&self, tx_id: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let buffered = self.with_tx(tx_id, |state| {
            state.reads.insert(key.to_string());
            state
                .writes
                .iter()
                .rev()
                .find(|w| w.key == key)
                .map(|w| w.value.clone())
        })?;
        if let Some(own) = buffered {
            return Ok(own); // read-your-writes; None means deleted in-tx
        }
        let versions = reconcile(self.store.mode(), self.store.engine().get_live(key));
        Ok(versions.into_iter().next().map(|r| r.value))
    }

    /// Buffer a write; nothing is visible until commit.
    pub async fn write(
        &self,
        tx_id: &str,
        key: &str,
        value: Option<Vec<u8>>,
        context: Option<VersionVector>,
    ) -> Result<(), KvError> {
        if self.options.lock_strategy == TxLockStrategy::TwoPhase {
            self.locks
                .acquire(key, tx_id, LockMode::Exclusive, self.options.lock_timeout)
                .await?;
        }
        self.with_tx(tx_id, |state| {
            state.writes.push(BufferedWrite {
                key: key.to_string(),
                value,
                context,
            });
        })
    }

    /// Validate and apply. Returns the committed records so the caller can
    /// push them to replicas ahead of the background senders.
    pub async fn commit(&self, tx_id: &str) -> Result<Vec<Record>, KvError> {
        let state = {
            let mut active = self.active.lock().expect("tx table lock");
            active
                .remove(tx_id)
                .ok_or_else(|| KvError::UnknownTx(tx_id.to_string()))?
        };

        let _commit = self.commit_mutex.lock().await;

        // A read key that gained a newer committed write since our snapshot
        // invalidates the transaction.
        for key in &state.reads {
            let latest = self
                .store
                .engine()
                .get(key)
                .iter()
                .map(|r| r.meta.lamport_ts)
                .max()
                .unwrap_or(0);
            if latest > state.snapshot_ts {
                self.locks.release_all(tx_id);
                self.store.engine().log_tx_marker(&WalEntry::TxAbort {
                    tx_id: tx_id.to_string(),
                })?;
                tracing::debug!(tx_id, key, "serialization conflict");
                return Err(KvError::SerializationConflict);
            }
        }

        self.store.engine().log_tx_marker(&WalEntry::TxCommit {
            tx_id: tx_id.to_string(),
        })?;

        // Last buffered write per key wins.
        let mut final_writes: HashMap<&str, &BufferedWrite> = HashMap::new();
        for write in &state.writes {
            final_writes.insert(&write.key, write);
        }

        let mut committed = Vec::new();
        for write in final_writes.into_values() {
            let record =
                self.store
                    .originate(&write.key, write.value.clone(), write.context.clone())?;
            committed.push(record);
        }

        self.locks.release_all(tx_id);
        tracing::debug!(tx_id, writes = committed.len(), "transaction committed");
        Ok(committed)
    }

    /// Drop a transaction and its buffered writes.
    pub fn abort(&self, tx_id: &str) -> Result<(), KvError> {
        let removed = self
            .active
            .lock()
            .expect("tx table lock")
            .remove(tx_id)
            .is_some();
        self.locks.release_all(tx_id);
        if removed {
            self.store.engine().log_tx_marker(&WalEntry::TxAbort {
                tx_id: tx_id.to_string(),
            })?;
            tracing::debug!(tx_id, "transaction aborted");
        }
        Ok(())
    }

    pub fn active_transactions(&self) -> Vec<String> {
        self.active
            .lock()
            .expect("tx table lock")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::NodeId;
    use meridian_config::ConsistencyMode;
    use meridian_storage::{FsyncPolicy, StorageOptions};
    use tempfile::TempDir;

    fn manager(strategy: TxLockStrategy) -> (TxManager, Arc<NodeStore>, TempDir) {
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
        let tm = TxManager::new(
            store.clone(),
            TxOptions {
                lock_strategy: strategy,
                lock_timeout: Duration::from_millis(100),
            },
        );
        (tm, store, dir)
    }

    #[tokio::test]
    async fn test_commit_applies_writes() {
        let (tm, store, _dir) = manager(TxLockStrategy::Optimistic);
        let tx = tm.begin().unwrap();
        tm.write(&tx, "k1", Some(b"v1".to_vec()), None).await.unwrap();
        tm.write(&tx, "k2", Some(b"v2".to_vec()), None).await.unwrap();

        // Nothing visible before commit.
        assert!(store.engine().get_live("k1").is_empty());

        let committed = tm.commit(&tx).await.unwrap();
        assert_eq!(committed.len(), 2);
        assert_eq!(store.engine().get_live("k1")[0].value, b"v1");
        assert_eq!(store.engine().get_live("k2")[0].value, b"v2");
        // Committed writes enter the replication log.
        assert_eq!(store.replication_log().lock().unwrap().pending_len(), 2);
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let (tm, store, _dir) = manager(TxLockStrategy::Optimistic);
        store.originate("k", Some(b"old".to_vec()), None).unwrap();

        let tx = tm.begin().unwrap();
        assert_eq!(tm.read(&tx, "k").await.unwrap(), Some(b"old".to_vec()));
        tm.write(&tx, "k", Some(b"new".to_vec()), None).await.unwrap();
        assert_eq!(tm.read(&tx, "k").await.unwrap(), Some(b"new".to_vec()));
        tm.abort(&tx).unwrap();
        assert_eq!(store.engine().get_live("k")[0].value, b"old");
    }

    #[tokio::test]
    async fn test_serialization_conflict() {
        let (tm, store, _dir) = manager(TxLockStrategy::Optimistic);
        store.originate("k", Some(b"1".to_vec()), None).unwrap();

        // Tx1 reads k.
        let tx1 = tm.begin().unwrap();
        tm.read(&tx1, "k").await.unwrap();

        // Tx2 writes k and commits.
        let tx2 = tm.begin().unwrap();
        tm.write(&tx2, "k", Some(b"2".to_vec()), None).await.unwrap();
        tm.commit(&tx2).await.unwrap();

        // Tx1 writes something else and tries to commit.
        tm.write(&tx1, "other", Some(b"3".to_vec()), None)
            .await
            .unwrap();
        assert!(matches!(
            tm.commit(&tx1).await,
            Err(KvError::SerializationConflict)
        ));
        assert!(
            store.engine().get_live("other").is_empty(),
            "aborted write set must not apply"
        );
    }

    #[tokio::test]
    async fn test_commit_without_conflicts_when_disjoint() {
        let (tm, _store, _dir) = manager(TxLockStrategy::Optimistic);
        let tx1 = tm.begin().unwrap();
        let tx2 = tm.begin().unwrap();
        tm.write(&tx1, "a", Some(b"1".to_vec()), None).await.unwrap();
        tm.write(&tx2, "b", Some(b"2".to_vec()), None).await.unwrap();
        tm.commit(&tx2).await.unwrap();
        tm.commit(&tx1).await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_discards_and_releases() {
        let (tm, store, _dir) = manager(TxLockStrategy::TwoPhase);
        let tx = tm.begin().unwrap();
        tm.write(&tx, "k", Some(b"v".to_vec()), None).await.unwrap();
        tm.abort(&tx).unwrap();

        assert!(store.engine().get_live("k").is_empty());
        assert_eq!(tm.locks.holder_count("k"), 0);
        assert!(tm.active_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_get_for_update_blocks_writer_until_commit() {
        let (tm, _store, _dir) = manager(TxLockStrategy::TwoPhase);
        let tx1 = tm.begin().unwrap();
        tm.get_for_update(&tx1, "row", None).await.unwrap();

        // A second transaction times out trying to write the locked row.
        let tx2 = tm.begin().unwrap();
        let err = tm
            .write(&tx2, "row", Some(b"x".to_vec()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::LockTimeout(_)));

        // After commit the lock is free.
        tm.commit(&tx1).await.unwrap();
        tm.write(&tx2, "row", Some(b"x".to_vec()), None)
            .await
            .unwrap();
        tm.commit(&tx2).await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_locks_allow_concurrent_readers() {
        let (tm, store, _dir) = manager(TxLockStrategy::TwoPhase);
        store.originate("k", Some(b"v".to_vec()), None).unwrap();

        let tx1 = tm.begin().unwrap();
        let tx2 = tm.begin().unwrap();
        tm.read(&tx1, "k").await.unwrap();
        tm.read(&tx2, "k").await.unwrap();
        assert_eq!(tm.locks.holder_count("k"), 2);
    }

    #[tokio::test]
    async fn test_unknown_tx_rejected() {
        let (tm, _store, _dir) = manager(TxLockStrategy::Optimistic);
        assert!(matches!(
            tm.read("nope", "k").await,
            Err(KvError::UnknownTx(_))
        ));
        assert!(matches!(
            tm.commit("nope").await,
            Err(KvError::UnknownTx(_))
        ));
    }

    #[tokio::test]
    async fn test_last_write_per_key_wins_in_tx() {
        let (tm, store, _dir) = manager(TxLockStrategy::Optimistic);
        let tx = tm.begin().unwrap();
        tm.write(&tx, "k", Some(b"first".to_vec()), None).await.unwrap();
        tm.write(&tx, "k", Some(b"second".to_vec()), None).await.unwrap();
        let committed = tm.commit(&tx).await.unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(store.engine().get_live("k")[0].value, b"second");
    }

    #[tokio::test]
    async fn test_tx_delete_commits_tombstone() {
        let (tm, store, _dir) = manager(TxLockStrategy::Optimistic);
        store.originate("k", Some(b"v".to_vec()), None).unwrap();

        let tx = tm.begin().unwrap();
        tm.write(&tx, "k", None, None).await.unwrap();
        let committed = tm.commit(&tx).await.unwrap();
        assert!(committed[0].is_tombstone());
        assert!(store.engine().get_live("k").is_empty());
    }
}
