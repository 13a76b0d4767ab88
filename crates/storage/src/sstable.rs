//! Immutable sorted table files.
//!
//! Layout: length-prefixed JSON records in ascending key order, then a JSON
//! footer (sparse index, bloom filter, key range, Lamport bounds, item
//! count), then a fixed trailer `[u64 footer_offset][u32 footer_crc][magic]`.
//! Files are written once and never modified.

use crate::bloom::BloomFilter;
use crate::record::Record;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One sparse-index entry every this many records.
const SPARSE_EVERY: usize = 16;

const MAGIC: &[u8; 4] = b"MSST";

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("SSTable I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("SSTable serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("SSTable corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub offset: u64,
}

/// Trailing metadata block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Footer {
    pub sparse_index: Vec<IndexEntry>,
    pub bloom: BloomFilter,
    pub first_key: String,
    pub last_key: String,
    pub min_lamport_ts: u64,
    pub max_lamport_ts: u64,
    pub item_count: u64,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Builds an SSTable. Records must be added in ascending key order (equal
/// keys adjacent for sibling versions).
pub struct SstWriter {
    writer: BufWriter<File>,
    offset: u64,
    index: Vec<IndexEntry>,
    keys: Vec<String>,
    first_key: Option<String>,
    last_key: Option<String>,
    min_ts: u64,
    max_ts: u64,
    count: u64,
}

impl SstWriter {
    pub fn create(path: &Path) -> Result<Self, TableError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            offset: 0,
            index: Vec::new(),
            keys: Vec::new(),
            first_key: None,
            last_key: None,
            min_ts: u64::MAX,
            max_ts: 0,
            count: 0,
        })
    }

    pub fn add(&mut self, record: &Record) -> Result<(), TableError> {
        if let Some(last) = &self.last_key {
            debug_assert!(*last <= record.key, "records must be added in key order");
        }

        if self.count as usize % SPARSE_EVERY == 0 {
            self.index.push(IndexEntry {
                key: record.key.clone(),
                offset: self.offset,
            });
        }

        let payload = serde_json::to_vec(record)?;
        let len = payload.len() as u32;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.offset += 4 + payload.len() as u64;

        if self.first_key.is_none() {
            self.first_key = Some(record.key.clone());
        }
        self.last_key = Some(record.key.clone());
        self.min_ts = self.min_ts.min(record.meta.lamport_ts);
        self.max_ts = self.max_ts.max(record.meta.lamport_ts);
        if self.keys.last() != Some(&record.key) {
            self.keys.push(record.key.clone());
        }
        self.count += 1;
        Ok(())
    }

    /// Write the footer and trailer, fsync, and close.
    pub fn finish(mut self) -> Result<(), TableError> {
        let footer = Footer {
            sparse_index: self.index,
            bloom: BloomFilter::build(self.keys.iter().map(String::as_str)),
            first_key: self.first_key.unwrap_or_default(),
            last_key: self.last_key.unwrap_or_default(),
            min_lamport_ts: if self.count == 0 { 0 } else { self.min_ts },
            max_lamport_ts: self.max_ts,
            item_count: self.count,
        };

        let footer_offset = self.offset;
        let payload = serde_json::to_vec(&footer)?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.write_all(&footer_offset.to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(MAGIC)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// An open, immutable SSTable.
#[derive(Debug)]
pub struct SstReader {
    path: PathBuf,
    footer: Footer,
    file: Mutex<File>,
    size_bytes: u64,
    /// File offset where entries stop and the footer begins.
    entries_end: u64,
}

impl SstReader {
    pub fn open(path: &Path) -> Result<Self, TableError> {
        let mut file = File::open(path)?;
        let size_bytes = file.metadata()?.len();
        if size_bytes < 16 {
            return Err(TableError::Corrupt(format!(
                "{}: too small for trailer",
                path.display()
            )));
        }

        file.seek(SeekFrom::End(-16))?;
        let mut trailer = [0u8; 16];
        file.read_exact(&mut trailer)?;
        if &trailer[12..16] != MAGIC {
            return Err(TableError::Corrupt(format!(
                "{}: bad magic",
                path.display()
            )));
        }
        let footer_offset = u64::from_le_bytes(trailer[0..8].try_into().expect("8 bytes"));
        let expected_crc = u32::from_le_bytes(trailer[8..12].try_into().expect("4 bytes"));

        file.seek(SeekFrom::Start(footer_offset))?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            return Err(TableError::Corrupt(format!(
                "{}: footer CRC mismatch",
                path.display()
            )));
        }
        let footer: Footer = serde_json::from_slice(&payload)?;

        Ok(Self {
            path: path.to_path_buf(),
            footer,
            file: Mutex::new(file),
            size_bytes,
            entries_end: footer_offset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_key(&self) -> &str {
        &self.footer.first_key
    }

    pub fn last_key(&self) -> &str {
        &self.footer.last_key
    }

    pub fn item_count(&self) -> u64 {
        self.footer.item_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn max_lamport_ts(&self) -> u64 {
        self.footer.max_lamport_ts
    }

    /// Whether `key` falls inside this table's key range.
    pub fn covers(&self, key: &str) -> bool {
        self.footer.item_count > 0
            && self.footer.first_key.as_str() <= key
            && key <= self.footer.last_key.as_str()
    }

    /// Whether this table's range overlaps `[low, high]`.
    pub fn overlaps(&self, low: &str, high: &str) -> bool {
        self.footer.item_count > 0
            && self.footer.first_key.as_str() <= high
            && low <= self.footer.last_key.as_str()
    }

    /// Point read: bloom check, sparse-index binary search, short scan.
    pub fn get(&self, key: &str) -> Result<Vec<Record>, TableError> {
        if !self.covers(key) || !self.footer.bloom.may_contain(key) {
            return Ok(Vec::new());
        }
        let start = match self.seek_offset(key) {
            Some(offset) => offset,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        self.scan_from(start, |record| {
            if record.key.as_str() > key {
                return ScanStep::Stop;
            }
            if record.key == key {
                out.push(record);
            }
            ScanStep::Continue
        })?;
        Ok(out)
    }

    /// All records with `low <= key <= high`, in file (key) order.
    pub fn range_scan(&self, low: &str, high: &str) -> Result<Vec<Record>, TableError> {
        if !self.overlaps(low, high) {
            return Ok(Vec::new());
        }
        let start = self.seek_offset(low).unwrap_or(0);
        let mut out = Vec::new();
        self.scan_from(start, |record| {
            if record.key.as_str() > high {
                return ScanStep::Stop;
            }
            if record.key.as_str() >= low {
                out.push(record);
            }
            ScanStep::Continue
        })?;
        Ok(out)
    }

    /// Every record in the table (compaction and anti-entropy digests).
    pub fn iter_all(&self) -> Result<Vec<Record>, TableError> {
        let mut out = Vec::new();
        self.scan_from(0, |record| {
            out.push(record);
            ScanStep::Continue
        })?;
        Ok(out)
    }

    /// Greatest sparse-index offset whose key is `<= key`.
    fn seek_offset(&self, key: &str) -> Option<u64> {
        let idx = self
            .footer
            .sparse_index
            .partition_point(|e| e.key.as_str() <= key);
        if idx == 0 {
            return None;
        }
        Some(self.footer.sparse_index[idx - 1].offset)
    }

    fn scan_from(
        &self,
        start: u64,
        mut visit: impl FnMut(Record) -> ScanStep,
    ) -> Result<(), TableError> {
        let mut file = self.file.lock().expect("sstable file lock");
        file.seek(SeekFrom::Start(start))?;
        let entries_end = self.entries_end;
        let mut reader = BufReader::new(&mut *file);
        let mut pos = start;

        while pos < entries_end {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload)?;
            pos += 4 + len as u64;

            let record: Record = serde_json::from_slice(&payload)?;
            if visit(record) == ScanStep::Stop {
                break;
            }
        }
        Ok(())
    }
}

#[derive(PartialEq)]
enum ScanStep {
    Continue,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordMeta;
    use tempfile::TempDir;

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

    fn build_table(dir: &TempDir, name: &str, records: &[Record]) -> SstReader {
        let path = dir.path().join(name);
        let mut writer = SstWriter::create(&path).unwrap();
        for record in records {
            writer.add(record).unwrap();
        }
        writer.finish().unwrap();
        SstReader::open(&path).unwrap()
    }

    #[test]
    fn test_point_reads() {
        let dir = TempDir::new().unwrap();
        let records: Vec<Record> = (0..100).map(|i| rec(&format!("key_{i:03}"), &format!("val_{i}"), i)).collect();
        let table = build_table(&dir, "t.sst", &records);

        assert_eq!(table.item_count(), 100);
        assert_eq!(table.first_key(), "key_000");
        assert_eq!(table.last_key(), "key_099");

        for i in [0usize, 1, 15, 16, 17, 50, 98, 99] {
            let found = table.get(&format!("key_{i:03}")).unwrap();
            assert_eq!(found.len(), 1, "key_{i:03}");
            assert_eq!(found[0].value, format!("val_{i}").as_bytes());
        }
        assert!(table.get("key_100").unwrap().is_empty());
        assert!(table.get("aaa").unwrap().is_empty());
        assert!(table.get("zzz").unwrap().is_empty());
    }

    #[test]
    fn test_range_scan() {
        let dir = TempDir::new().unwrap();
        let records: Vec<Record> = (0..50).map(|i| rec(&format!("k{i:02}"), "v", i)).collect();
        let table = build_table(&dir, "t.sst", &records);

        let hits = table.range_scan("k10", "k13").unwrap();
        let keys: Vec<&str> = hits.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["k10", "k11", "k12", "k13"]);

        assert!(table.range_scan("x", "z").unwrap().is_empty());
        assert_eq!(table.range_scan("k48", "zzz").unwrap().len(), 2);
    }

    #[test]
    fn test_sibling_versions_adjacent() {
        let dir = TempDir::new().unwrap();
        let mut a = rec("k1", "v-a", 1);
        a.meta.origin = "a".into();
        let mut b = rec("k1", "v-b", 1);
        b.meta.origin = "b".into();
        let table = build_table(&dir, "t.sst", &[a, b, rec("k2", "v2", 2)]);

        assert_eq!(table.get("k1").unwrap().len(), 2);
        assert_eq!(table.get("k2").unwrap().len(), 1);
    }

    #[test]
    fn test_iter_all_preserves_order() {
        let dir = TempDir::new().unwrap();
        let records: Vec<Record> = (0..40).map(|i| rec(&format!("k{i:02}"), "v", i)).collect();
        let table = build_table(&dir, "t.sst", &records);
        let all = table.iter_all().unwrap();
        assert_eq!(all.len(), 40);
        assert!(all.windows(2).all(|w| w[0].key <= w[1].key));
    }

    #[test]
    fn test_empty_table() {
        let dir = TempDir::new().unwrap();
        let table = build_table(&dir, "t.sst", &[]);
        assert_eq!(table.item_count(), 0);
        assert!(table.get("anything").unwrap().is_empty());
        assert!(!table.covers("anything"));
    }

    #[test]
    fn test_corrupt_trailer_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sst");
        let mut writer = SstWriter::create(&path).unwrap();
        writer.add(&rec("k", "v", 1)).unwrap();
        writer.finish().unwrap();

        // Stomp the magic bytes.
        let data = std::fs::read(&path).unwrap();
        let mut broken = data.clone();
        let n = broken.len();
        broken[n - 1] = b'X';
        std::fs::write(&path, &broken).unwrap();

        assert!(matches!(
            SstReader::open(&path),
            Err(TableError::Corrupt(_))
        ));
    }

    #[test]
    fn test_tombstones_are_stored() {
        let dir = TempDir::new().unwrap();
        let tomb = Record::tombstone(
            "gone".to_string(),
            RecordMeta {
                lamport_ts: 5,
                origin: "n1".to_string(),
                seq: 5,
                vector: None,
                tombstone: true,
            },
        );
        let table = build_table(&dir, "t.sst", &[tomb]);
        let found = table.get("gone").unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].is_tombstone());
    }
}
