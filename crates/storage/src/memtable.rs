//! Sorted in-memory table of recent writes.
//!
//! Keys map to version lists: a single record in LWW mode, possibly several
//! siblings in vector mode. Ordered iteration feeds flushes and range scans.

use crate::record::{merge_into_versions, Record};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Instant;

#[derive(Debug)]
pub struct Memtable {
    data: BTreeMap<String, Vec<Record>>,
    versions: usize,
    created_at: Instant,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            versions: 0,
            created_at: Instant::now(),
        }
    }

    /// Insert a record, applying the version-merge rules (dominating write
    /// replaces, dominated write is discarded, concurrent writes become
    /// siblings). Tombstones are ordinary records here.
    pub fn apply(&mut self, record: Record) {
        let versions = self.data.entry(record.key.clone()).or_default();
        let before = versions.len();
        merge_into_versions(versions, record);
        self.versions = self.versions + versions.len() - before;
    }

    /// All current versions for a key (empty if unknown).
    pub fn get(&self, key: &str) -> Vec<Record> {
        self.data.get(key).cloned().unwrap_or_default()
    }

    /// Ordered `(key, versions)` pairs with keys in `[low, high]`.
    pub fn range_scan(&self, low: &str, high: &str) -> Vec<(String, Vec<Record>)> {
        self.data
            .range::<str, _>((Bound::Included(low), Bound::Included(high)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Ordered iteration over everything (flush path).
    pub fn iter_in_order(&self) -> impl Iterator<Item = (&String, &Vec<Record>)> {
        self.data.iter()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total stored versions across keys; compared against the flush
    /// threshold.
    pub fn version_count(&self) -> usize {
        self.versions
    }

    /// Seconds since this memtable was created (age-based flush trigger).
    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}
