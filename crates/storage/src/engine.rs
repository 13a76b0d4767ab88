//! LSM engine: WAL + memtable + leveled SSTables.
//!
//! Writes append to the WAL, then the memtable; a full memtable is frozen
//! and flushed to an L0 table while the WAL rotates to a new epoch. Reads
//! merge the memtable with every level that may hold the key, newest first,
//! resolving versions by `(lamport_ts, origin)` or version vector. Compaction
//! is size-tiered at L0 and leveled beyond, and runs outside the locks:
//! inputs stay readable until the output is installed atomically.

use crate::manifest::{table_path, Manifest};
use crate::memtable::Memtable;
use crate::record::{merge_version_lists, now_ms, Record};
use crate::sstable::{SstReader, SstWriter};
use crate::wal::{FsyncPolicy, Wal, WalEntry};
use crate::StorageError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Base size bound for L1; each deeper level multiplies by
/// `level_size_ratio`.
const LEVEL_BASE_BYTES: u64 = 8 * 1024 * 1024;

/// Tuning knobs; every field mirrors a `storage.*` config option.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub fsync: FsyncPolicy,
    pub memtable_threshold: usize,
    pub flush_interval_secs: u64,
    pub l0_file_limit: usize,
    pub level_size_ratio: u64,
    pub tombstone_retention_secs: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            fsync: FsyncPolicy::Batch,
            memtable_threshold: 4096,
            flush_interval_secs: 300,
            l0_file_limit: 4,
            level_size_ratio: 10,
            tombstone_retention_secs: 86_400,
        }
    }
}

#[derive(Debug)]
struct TableHandle {
    id: u64,
    reader: SstReader,
}

type LevelSet = Vec<Vec<Arc<TableHandle>>>;

/// Counters for admin introspection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub memtable_keys: usize,
    pub memtable_versions: usize,
    pub wal_epoch: u64,
    pub tables_per_level: Vec<usize>,
    pub bytes_per_level: Vec<u64>,
}

/// The storage engine. All operations are synchronous (blocking I/O); the
/// async boundary is at the caller.
#[derive(Debug)]
pub struct LsmEngine {
    dir: PathBuf,
    opts: StorageOptions,
    wal: Mutex<Wal>,
    active: RwLock<Memtable>,
    /// Immutable snapshot of the level layout; readers clone the `Arc`,
    /// flush/compaction swap in a rebuilt snapshot under the write lock.
    levels: RwLock<Arc<LevelSet>>,
    manifest: Mutex<Manifest>,
}

impl LsmEngine {
    /// Open or create an engine at `dir`, replaying the WAL and discarding
    /// table files from interrupted flushes or compactions.
    pub fn open(dir: &Path, opts: StorageOptions) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        let wal_dir = dir.join("wal");
        let manifest_path = dir.join("manifest");

        let mut manifest = Manifest::load(&manifest_path)?;

        // Drop table files the manifest does not own (crash leftovers).
        let live: std::collections::HashSet<(usize, u64)> =
            manifest.live_tables().into_iter().collect();
        remove_orphan_tables(dir, &live)?;

        // Open live tables level by level.
        let mut levels: LevelSet = Vec::new();
        for (level, ids) in manifest.levels.iter().enumerate() {
            let mut handles = Vec::new();
            for &id in ids {
                let reader = SstReader::open(&table_path(dir, level, id))?;
                handles.push(Arc::new(TableHandle { id, reader }));
            }
            levels.push(handles);
        }

        // Replay every WAL segment still on disk into a fresh memtable.
        // Re-applying records that already reached an SSTable is harmless:
        // the version merge discards equals.
        let mut memtable = Memtable::new();
        let mut replayed = 0usize;
        for (_, entry) in Wal::replay_dir(&wal_dir)? {
            if let Some(record) = entry.record() {
                memtable.apply(record.clone());
                replayed += 1;
            }
        }

        // Never append to a segment older than one already on disk.
        let max_segment = Wal::list_segments(&wal_dir)?.last().copied().unwrap_or(0);
        if max_segment > manifest.wal_epoch {
            manifest.wal_epoch = max_segment;
            manifest.store(&manifest_path)?;
        }
        let wal = Wal::open(&wal_dir, manifest.wal_epoch, opts.fsync)?;

        tracing::info!(
            dir = %dir.display(),
            replayed,
            keys = memtable.len(),
            epoch = manifest.wal_epoch,
            "storage engine opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            opts,
            wal: Mutex::new(wal),
            active: RwLock::new(memtable),
            levels: RwLock::new(Arc::new(levels)),
            manifest: Mutex::new(manifest),
        })
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Apply a record: WAL first, then memtable. This is the single write
    /// path for local writes, replicated ops, hint delivery, and read
    /// repair; the version-merge rules make it idempotent.
    pub fn apply(&self, record: Record) -> Result<(), StorageError> {
        {
            let mut wal = self.wal.lock().expect("wal lock");
            let entry = if record.is_tombstone() {
                WalEntry::Delete {
                    record: record.clone(),
                }
            } else {
                WalEntry::Put {
                    record: record.clone(),
                }
            };
            wal.append(&entry)?;
        }
        {
            let mut active = self.active.write().expect("memtable lock");
            active.apply(record);
        }
        if self.memtable_full() {
            self.flush()?;
        }
        Ok(())
    }

    /// Append a transaction marker to the WAL (write-set records follow as
    /// ordinary Put/Delete entries).
    pub fn log_tx_marker(&self, entry: &WalEntry) -> Result<(), StorageError> {
        let mut wal = self.wal.lock().expect("wal lock");
        wal.append(entry)?;
        Ok(())
    }

    /// Fsync the WAL (batch fsync mode).
    pub fn sync(&self) -> Result<(), StorageError> {
        let mut wal = self.wal.lock().expect("wal lock");
        wal.sync()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// All non-dominated versions of a key, tombstones included. An I/O
    /// error from one table is logged and that table skipped; remaining
    /// levels still answer.
    pub fn get(&self, key: &str) -> Vec<Record> {
        let mut versions = {
            let active = self.active.read().expect("memtable lock");
            active.get(key)
        };

        let levels = self.levels_snapshot();
        for (level, tables) in levels.iter().enumerate() {
            for table in tables {
                if !table.reader.covers(key) {
                    continue;
                }
                match table.reader.get(key) {
                    Ok(found) => versions = merge_version_lists(versions, found),
                    Err(e) => {
                        tracing::error!(level, id = table.id, error = %e, "table read failed; skipping");
                    }
                }
            }
        }
        versions
    }

    /// Versions of a key with tombstones filtered out.
    pub fn get_live(&self, key: &str) -> Vec<Record> {
        self.get(key)
            .into_iter()
            .filter(|r| !r.is_tombstone())
            .collect()
    }

    /// Ordered live `(key, versions)` pairs with keys in `[low, high]`.
    pub fn range_scan(&self, low: &str, high: &str) -> Vec<(String, Vec<Record>)> {
        let mut merged: BTreeMap<String, Vec<Record>> = BTreeMap::new();

        {
            let active = self.active.read().expect("memtable lock");
            for (key, versions) in active.range_scan(low, high) {
                merged.insert(key, versions);
            }
        }

        let levels = self.levels_snapshot();
        for tables in levels.iter() {
            for table in tables {
                match table.reader.range_scan(low, high) {
                    Ok(found) => {
                        for record in found {
                            let entry = merged.entry(record.key.clone()).or_default();
                            let taken = std::mem::take(entry);
                            *entry = merge_version_lists(taken, vec![record]);
                        }
                    }
                    Err(e) => {
                        tracing::error!(id = table.id, error = %e, "table scan failed; skipping");
                    }
                }
            }
        }

        merged
            .into_iter()
            .map(|(key, versions)| {
                let live: Vec<Record> =
                    versions.into_iter().filter(|r| !r.is_tombstone()).collect();
                (key, live)
            })
            .filter(|(_, versions)| !versions.is_empty())
            .collect()
    }

    /// Merged view of the complete keyspace, tombstones included. Feeds the
    /// anti-entropy digests and partition transfers.
    pub fn snapshot_all(&self) -> BTreeMap<String, Vec<Record>> {
        let mut merged: BTreeMap<String, Vec<Record>> = BTreeMap::new();

        let levels = self.levels_snapshot();
        // Oldest data first so newer levels win ties cheaply.
        for tables in levels.iter().rev() {
            for table in tables.iter().rev() {
                match table.reader.iter_all() {
                    Ok(records) => {
                        for record in records {
                            let entry = merged.entry(record.key.clone()).or_default();
                            let taken = std::mem::take(entry);
                            *entry = merge_version_lists(taken, vec![record]);
                        }
                    }
                    Err(e) => {
                        tracing::error!(id = table.id, error = %e, "table iteration failed; skipping");
                    }
                }
            }
        }

        let active = self.active.read().expect("memtable lock");
        for (key, versions) in active.iter_in_order() {
            let entry = merged.entry(key.clone()).or_default();
            let taken = std::mem::take(entry);
            *entry = merge_version_lists(taken, versions.clone());
        }
        merged
    }

    // -----------------------------------------------------------------------
    // Flush
    // -----------------------------------------------------------------------

    fn memtable_full(&self) -> bool {
        let active = self.active.read().expect("memtable lock");
        active.version_count() >= self.opts.memtable_threshold
    }

    /// Whether the age-based flush trigger has fired.
    pub fn needs_flush(&self) -> bool {
        let active = self.active.read().expect("memtable lock");
        !active.is_empty()
            && (active.version_count() >= self.opts.memtable_threshold
                || active.age_secs() >= self.opts.flush_interval_secs)
    }

    /// Freeze the active memtable, persist it as an L0 table, rotate the
    /// WAL, and recycle segments older than the new epoch.
    pub fn flush(&self) -> Result<(), StorageError> {
        // Swap the memtable and rotate the WAL under both locks so no write
        // lands in the frozen table after its WAL segment is sealed.
        let (frozen, old_epoch, new_epoch) = {
            let mut wal = self.wal.lock().expect("wal lock");
            let mut active = self.active.write().expect("memtable lock");
            if active.is_empty() {
                return Ok(());
            }
            let old_epoch = wal.epoch();
            let new_epoch = old_epoch + 1;
            wal.rotate(new_epoch)?;
            let frozen = std::mem::take(&mut *active);
            (frozen, old_epoch, new_epoch)
        };

        // Write the new table outside the locks; reads keep answering from
        // the level snapshot, and the frozen data is still covered by the
        // old WAL segment if we crash here.
        let table_id = {
            let mut manifest = self.manifest.lock().expect("manifest lock");
            manifest.allocate_table_id()
        };
        let path = table_path(&self.dir, 0, table_id);
        let mut writer = SstWriter::create(&path)?;
        let mut written = 0u64;
        for (_, versions) in frozen.iter_in_order() {
            for record in versions {
                writer.add(record)?;
                written += 1;
            }
        }
        writer.finish()?;

        let handle = Arc::new(TableHandle {
            id: table_id,
            reader: SstReader::open(&path)?,
        });

        // Install at the front of L0 (newest first), persist the manifest,
        // then recycle the sealed WAL segments.
        {
            let mut levels = self.levels.write().expect("levels lock");
            let mut next: LevelSet = levels.as_ref().clone();
            if next.is_empty() {
                next.push(Vec::new());
            }
            next[0].insert(0, handle);
            *levels = Arc::new(next);
        }
        {
            let mut manifest = self.manifest.lock().expect("manifest lock");
            manifest.wal_epoch = new_epoch;
            manifest.levels = self.current_level_ids();
            manifest.store(&self.dir.join("manifest"))?;
        }
        for epoch in Wal::list_segments(&self.dir.join("wal"))? {
            if epoch < new_epoch {
                Wal::remove_segment(&self.dir.join("wal"), epoch)?;
            }
        }

        tracing::info!(table_id, written, old_epoch, new_epoch, "memtable flushed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Compaction
    // -----------------------------------------------------------------------

    /// Run one compaction step if any level is over its bound. Returns
    /// whether work was done. Inputs stay readable throughout; a crash
    /// discards the half-built output at next open.
    pub fn compact_once(&self) -> Result<bool, StorageError> {
        let levels = self.levels_snapshot();

        let plan = plan_compaction(&levels, self.opts.l0_file_limit, self.opts.level_size_ratio);
        let (input_levels, output_level) = match plan {
            Some(p) => p,
            None => return Ok(false),
        };

        let inputs: Vec<Arc<TableHandle>> = input_levels
            .iter()
            .flat_map(|(level, ids)| {
                levels[*level]
                    .iter()
                    .filter(|t| ids.contains(&t.id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        // Merge all input records; version merge drops shadowed entries.
        let mut merged: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for table in &inputs {
            for record in table.reader.iter_all()? {
                let entry = merged.entry(record.key.clone()).or_default();
                let taken = std::mem::take(entry);
                *entry = merge_version_lists(taken, vec![record]);
            }
        }

        // Tombstones may only disappear at the bottom of the tree, and only
        // once their retention window has passed.
        let is_bottom = output_level >= levels.len().saturating_sub(1)
            || levels[output_level + 1..].iter().all(Vec::is_empty);
        let retention_ms = self.opts.tombstone_retention_secs * 1000;
        let now = now_ms();

        let table_id = {
            let mut manifest = self.manifest.lock().expect("manifest lock");
            manifest.allocate_table_id()
        };
        let path = table_path(&self.dir, output_level, table_id);
        let mut writer = SstWriter::create(&path)?;
        let mut written = 0u64;
        let mut dropped_tombstones = 0u64;
        for (_, versions) in &merged {
            for record in versions {
                if record.is_tombstone()
                    && is_bottom
                    && now.saturating_sub(record.stored_at_ms) > retention_ms
                {
                    dropped_tombstones += 1;
                    continue;
                }
                writer.add(record)?;
                written += 1;
            }
        }
        writer.finish()?;

        let output = Arc::new(TableHandle {
            id: table_id,
            reader: SstReader::open(&path)?,
        });

        // Install: rebuild the level set from the *current* snapshot (a
        // flush may have prepended L0 tables meanwhile), dropping inputs
        // and inserting the output in key order.
        let input_ids: std::collections::HashSet<u64> = inputs.iter().map(|t| t.id).collect();
        {
            let mut current = self.levels.write().expect("levels lock");
            let mut next: LevelSet = current
                .iter()
                .map(|tables| {
                    tables
                        .iter()
                        .filter(|t| !input_ids.contains(&t.id))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .collect();
            while next.len() <= output_level {
                next.push(Vec::new());
            }
            if output.reader.item_count() > 0 {
                let pos = next[output_level]
                    .partition_point(|t| t.reader.first_key() <= output.reader.first_key());
                next[output_level].insert(pos, output.clone());
            }
            *current = Arc::new(next);
        }
        {
            let mut manifest = self.manifest.lock().expect("manifest lock");
            manifest.levels = self.current_level_ids();
            manifest.store(&self.dir.join("manifest"))?;
        }
        if output.reader.item_count() == 0 {
            std::fs::remove_file(&path)?;
        }
        for table in &inputs {
            if let Err(e) = std::fs::remove_file(table.reader.path()) {
                tracing::warn!(id = table.id, error = %e, "failed to remove compacted input");
            }
        }

        tracing::info!(
            output_level,
            table_id,
            inputs = inputs.len(),
            written,
            dropped_tombstones,
            "compaction installed"
        );
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> EngineStats {
        let active = self.active.read().expect("memtable lock");
        let levels = self.levels_snapshot();
        let wal_epoch = self.wal.lock().expect("wal lock").epoch();
        EngineStats {
            memtable_keys: active.len(),
            memtable_versions: active.version_count(),
            wal_epoch,
            tables_per_level: levels.iter().map(Vec::len).collect(),
            bytes_per_level: levels
                .iter()
                .map(|tables| tables.iter().map(|t| t.reader.size_bytes()).sum())
                .collect(),
        }
    }

    fn levels_snapshot(&self) -> Arc<LevelSet> {
        self.levels.read().expect("levels lock").clone()
    }

    fn current_level_ids(&self) -> Vec<Vec<u64>> {
        self.levels_snapshot()
            .iter()
            .map(|tables| tables.iter().map(|t| t.id).collect())
            .collect()
    }
}

/// Choose compaction inputs: `(Vec<(level, ids)>, output_level)`.
fn plan_compaction(
    levels: &LevelSet,
    l0_file_limit: usize,
    ratio: u64,
) -> Option<(Vec<(usize, Vec<u64>)>, usize)> {
    if levels.is_empty() {
        return None;
    }

    // Size-tiered at L0: too many overlapping tables -> merge them all,
    // together with the L1 tables they overlap, into L1.
    if levels[0].len() >= l0_file_limit {
        let l0_ids: Vec<u64> = levels[0].iter().map(|t| t.id).collect();
        let (low, high) = key_span(&levels[0]);
        let l1_ids: Vec<u64> = levels
            .get(1)
            .map(|tables| {
                tables
                    .iter()
                    .filter(|t| t.reader.overlaps(&low, &high))
                    .map(|t| t.id)
                    .collect()
            })
            .unwrap_or_default();
        let mut inputs = vec![(0, l0_ids)];
        if !l1_ids.is_empty() {
            inputs.push((1, l1_ids));
        }
        return Some((inputs, 1));
    }

    // Leveled beyond: the first level over its size bound donates its
    // oldest table plus the overlapping tables one level down.
    for (level, tables) in levels.iter().enumerate().skip(1) {
        let total: u64 = tables.iter().map(|t| t.reader.size_bytes()).sum();
        if total <= level_max_bytes(level, ratio) {
            continue;
        }
        let victim = tables.iter().min_by_key(|t| t.id)?;
        let next_ids: Vec<u64> = levels
            .get(level + 1)
            .map(|below| {
                below
                    .iter()
                    .filter(|t| {
                        t.reader
                            .overlaps(victim.reader.first_key(), victim.reader.last_key())
                    })
                    .map(|t| t.id)
                    .collect()
            })
            .unwrap_or_default();
        let mut inputs = vec![(level, vec![victim.id])];
        if !next_ids.is_empty() {
            inputs.push((level + 1, next_ids));
        }
        return Some((inputs, level + 1));
    }
    None
}

fn level_max_bytes(level: usize, ratio: u64) -> u64 {
    LEVEL_BASE_BYTES.saturating_mul(ratio.saturating_pow(level.saturating_sub(1) as u32))
}

fn key_span(tables: &[Arc<TableHandle>]) -> (String, String) {
    let mut low = String::new();
    let mut high = String::new();
    for table in tables {
        if table.reader.item_count() == 0 {
            continue;
        }
        if low.is_empty() || table.reader.first_key() < low.as_str() {
            low = table.reader.first_key().to_string();
        }
        if table.reader.last_key() > high.as_str() {
            high = table.reader.last_key().to_string();
        }
    }
    (low, high)
}

fn remove_orphan_tables(
    dir: &Path,
    live: &std::collections::HashSet<(usize, u64)>,
) -> Result<(), StorageError> {
    let sst_root = dir.join("sst");
    let level_dirs = match std::fs::read_dir(&sst_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StorageError::Io(e)),
    };
    for level_dir in level_dirs {
        let level_dir = level_dir?;
        let level_name = level_dir.file_name();
        let level: usize = match level_name
            .to_string_lossy()
            .strip_prefix('L')
            .and_then(|s| s.parse().ok())
        {
            Some(l) => l,
            None => continue,
        };
        for file in std::fs::read_dir(level_dir.path())? {
            let file = file?;
            let name = file.file_name();
            let id: u64 = match name
                .to_string_lossy()
                .strip_suffix(".sst")
                .and_then(|s| s.parse().ok())
            {
                Some(id) => id,
                None => continue,
            };
            if !live.contains(&(level, id)) {
                tracing::warn!(level, id, "removing orphan table file");
                std::fs::remove_file(file.path())?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordMeta;
    use tempfile::TempDir;

    fn opts_small() -> StorageOptions {
        StorageOptions {
            fsync: FsyncPolicy::None,
            memtable_threshold: 8,
            flush_interval_secs: 3600,
            l0_file_limit: 2,
            level_size_ratio: 4,
            tombstone_retention_secs: 86_400,
        }
    }

    fn rec(key: &str, value: &str, ts: u64) -> Record {
        Record::new(
            key.to_string(),
            value.as_bytes().to_vec(),
            RecordMeta {
                lamport_ts: ts,
                origin: "n1".to_string(),
                seq: ts,
                vector: None,
                tombstone: false,
            },
        )
    }

    fn tomb(key: &str, ts: u64) -> Record {
        Record::tombstone(
            key.to_string(),
            RecordMeta {
                lamport_ts: ts,
                origin: "n1".to_string(),
                seq: ts,
                vector: None,
                tombstone: true,
            },
        )
    }

    #[test]
    fn test_put_get() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();
        engine.apply(rec("k1", "v1", 1)).unwrap();
        let versions = engine.get_live("k1");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].value, b"v1");
    }

    #[test]
    fn test_crash_recovery_from_wal() {
        let dir = TempDir::new().unwrap();
        {
            let engine = LsmEngine::open(
                dir.path(),
                StorageOptions {
                    fsync: FsyncPolicy::Always,
                    ..opts_small()
                },
            )
            .unwrap();
            engine.apply(rec("k1", "v1", 1)).unwrap();
            engine.apply(rec("k2", "v2", 2)).unwrap();
            // Dropped without flush: simulates kill -9.
        }
        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();
        assert_eq!(engine.get_live("k1")[0].value, b"v1");
        assert_eq!(engine.get_live("k2")[0].value, b"v2");
    }

    #[test]
    fn test_read_spans_memtable_and_tables() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();
        engine.apply(rec("k1", "old", 1)).unwrap();
        engine.flush().unwrap();
        engine.apply(rec("k1", "new", 2)).unwrap();

        let versions = engine.get_live("k1");
        assert_eq!(versions.len(), 1);
        assert_eq!(
            versions[0].value, b"new",
            "memtable version must shadow the flushed one"
        );
    }

    #[test]
    fn test_older_version_in_memtable_loses_to_table() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();
        engine.apply(rec("k1", "newest", 9)).unwrap();
        engine.flush().unwrap();
        // A replicated op with an older stamp arrives late.
        engine.apply(rec("k1", "stale", 3)).unwrap();

        let versions = engine.get_live("k1");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].value, b"newest");
    }

    #[test]
    fn test_flush_rotates_and_recycles_wal() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();
        engine.apply(rec("k1", "v1", 1)).unwrap();
        engine.flush().unwrap();

        let segments = Wal::list_segments(&dir.path().join("wal")).unwrap();
        assert_eq!(segments, vec![1], "old segment recycled after flush");
        assert_eq!(engine.stats().tables_per_level[0], 1);

        // Data survives a reopen purely from the SSTable.
        drop(engine);
        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();
        assert_eq!(engine.get_live("k1")[0].value, b"v1");
    }

    #[test]
    fn test_memtable_threshold_triggers_flush() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();
        for i in 0..8 {
            engine.apply(rec(&format!("k{i}"), "v", i + 1)).unwrap();
        }
        let stats = engine.stats();
        assert!(
            stats.tables_per_level.first().copied().unwrap_or(0) >= 1,
            "threshold crossing should have flushed"
        );
        assert_eq!(stats.memtable_versions, 0);
    }

    #[test]
    fn test_l0_compaction_into_l1() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();

        engine.apply(rec("a", "1", 1)).unwrap();
        engine.flush().unwrap();
        engine.apply(rec("b", "2", 2)).unwrap();
        engine.flush().unwrap();

        assert!(engine.compact_once().unwrap(), "L0 at limit should compact");
        let stats = engine.stats();
        assert_eq!(stats.tables_per_level[0], 0);
        assert_eq!(stats.tables_per_level[1], 1);

        assert_eq!(engine.get_live("a")[0].value, b"1");
        assert_eq!(engine.get_live("b")[0].value, b"2");
        assert!(!engine.compact_once().unwrap(), "nothing left to compact");
    }

    #[test]
    fn test_compaction_drops_shadowed_versions() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();

        engine.apply(rec("k", "old", 1)).unwrap();
        engine.flush().unwrap();
        engine.apply(rec("k", "new", 5)).unwrap();
        engine.flush().unwrap();
        engine.compact_once().unwrap();

        let all = engine.snapshot_all();
        let versions = all.get("k").unwrap();
        assert_eq!(versions.len(), 1, "shadowed version must be gone");
        assert_eq!(versions[0].value, b"new");
    }

    #[test]
    fn test_tombstone_survives_compaction_within_retention() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();

        engine.apply(rec("k", "v", 1)).unwrap();
        engine.flush().unwrap();
        engine.apply(tomb("k", 2)).unwrap();
        engine.flush().unwrap();
        engine.compact_once().unwrap();

        assert!(engine.get_live("k").is_empty());
        let all = engine.snapshot_all();
        assert!(
            all.get("k").map(|v| v[0].is_tombstone()).unwrap_or(false),
            "tombstone must persist until retention expires"
        );
    }

    #[test]
    fn test_expired_tombstone_dropped_at_bottom() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(
            dir.path(),
            StorageOptions {
                tombstone_retention_secs: 0,
                ..opts_small()
            },
        )
        .unwrap();

        engine.apply(rec("k", "v", 1)).unwrap();
        engine.flush().unwrap();
        let mut t = tomb("k", 2);
        t.stored_at_ms = 0; // long past any retention window
        engine.apply(t).unwrap();
        engine.flush().unwrap();
        engine.compact_once().unwrap();

        let all = engine.snapshot_all();
        assert!(all.get("k").is_none(), "expired tombstone should be purged");
    }

    #[test]
    fn test_range_scan_across_levels() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();

        engine.apply(rec("user:1|a", "1", 1)).unwrap();
        engine.apply(rec("user:1|c", "3", 2)).unwrap();
        engine.flush().unwrap();
        engine.apply(rec("user:1|b", "2", 3)).unwrap();
        engine.apply(tomb("user:1|c", 4)).unwrap();

        let hits = engine.range_scan("user:1|a", "user:1|z");
        let keys: Vec<&str> = hits.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["user:1|a", "user:1|b"], "tombstoned key excluded");
    }

    #[test]
    fn test_orphan_tables_removed_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();
            engine.apply(rec("k", "v", 1)).unwrap();
            engine.flush().unwrap();
        }
        // Simulate a crash mid-flush: a table file the manifest never saw.
        let orphan = table_path(dir.path(), 0, 999);
        let mut w = SstWriter::create(&orphan).unwrap();
        w.add(&rec("zzz", "junk", 9)).unwrap();
        w.finish().unwrap();

        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();
        assert!(!orphan.exists(), "orphan table should be deleted");
        assert!(engine.get_live("zzz").is_empty());
        assert_eq!(engine.get_live("k")[0].value, b"v");
    }

    #[test]
    fn test_sibling_versions_survive_flush_and_compaction() {
        use meridian_common::VersionVector;
        use std::collections::HashMap;

        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(dir.path(), opts_small()).unwrap();

        let vec_rec = |val: &str, entries: &[(&str, u64)]| {
            let map: HashMap<String, u64> =
                entries.iter().map(|(k, v)| (k.to_string(), *v)).collect();
            Record::new(
                "k".to_string(),
                val.as_bytes().to_vec(),
                RecordMeta {
                    lamport_ts: 1,
                    origin: "a".to_string(),
                    seq: 1,
                    vector: Some(VersionVector::from_map(map)),
                    tombstone: false,
                },
            )
        };

        engine.apply(vec_rec("from-a", &[("a", 1)])).unwrap();
        engine.flush().unwrap();
        engine.apply(vec_rec("from-b", &[("b", 1)])).unwrap();
        engine.flush().unwrap();
        engine.compact_once().unwrap();

        assert_eq!(
            engine.get_live("k").len(),
            2,
            "concurrent siblings must survive the full storage path"
        );
    }
}
