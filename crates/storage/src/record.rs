//! Storage record format and version ordering.

use meridian_common::clock::ClockOrder;
use meridian_common::{OpId, VersionVector};
use serde::{Deserialize, Serialize};

/// Replication metadata carried with every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Lamport timestamp assigned by the coordinating node.
    pub lamport_ts: u64,
    /// Hex node id of the originating node.
    pub origin: String,
    /// Monotonic per-origin sequence (forms the op id `origin:seq`).
    pub seq: u64,
    /// Version vector; present only in vector/CRDT modes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<VersionVector>,
    /// Whether this record is a delete marker.
    #[serde(default)]
    pub tombstone: bool,
}

impl RecordMeta {
    /// The wire form `"<origin>:<seq>"`.
    pub fn op_id(&self) -> String {
        OpId::new(self.origin.clone(), self.seq).to_string()
    }
}

/// A versioned record stored in the memtable, WAL, and SSTables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Composite key (`partition` or `partition|cluster`).
    pub key: String,
    /// Value bytes (empty for tombstones).
    pub value: Vec<u8>,
    pub meta: RecordMeta,
    /// Local wall-clock when this node stored the record (millis since
    /// epoch). Drives tombstone retention; never replicated as authority.
    pub stored_at_ms: u64,
}

impl Record {
    pub fn new(key: String, value: Vec<u8>, meta: RecordMeta) -> Self {
        Self {
            key,
            value,
            meta,
            stored_at_ms: now_ms(),
        }
    }

    pub fn tombstone(key: String, meta: RecordMeta) -> Self {
        let meta = RecordMeta {
            tombstone: true,
            ..meta
        };
        Self {
            key,
            value: Vec::new(),
            meta,
            stored_at_ms: now_ms(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.meta.tombstone
    }
}

/// Current wall clock in millis since epoch (drives `stored_at_ms`).
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Version ordering
// ---------------------------------------------------------------------------

/// Relative recency of two versions of the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrder {
    Newer,
    Older,
    Equal,
    /// Only possible when both sides carry version vectors.
    Concurrent,
}

/// Compare two record metas for the same key.
///
/// When both carry version vectors the vector partial order decides and
/// concurrent writes stay concurrent (siblings). Otherwise the total order
/// `(lamport_ts, origin)` decides, with the origin id breaking timestamp
/// ties.
pub fn compare_meta(a: &RecordMeta, b: &RecordMeta) -> RecordOrder {
    if let (Some(va), Some(vb)) = (&a.vector, &b.vector) {
        return match va.compare(vb) {
            ClockOrder::Dominates => RecordOrder::Newer,
            ClockOrder::DominatedBy => RecordOrder::Older,
            ClockOrder::Equal => RecordOrder::Equal,
            ClockOrder::Concurrent => RecordOrder::Concurrent,
        };
    }
    match (a.lamport_ts, &a.origin).cmp(&(b.lamport_ts, &b.origin)) {
        std::cmp::Ordering::Greater => RecordOrder::Newer,
        std::cmp::Ordering::Less => RecordOrder::Older,
        std::cmp::Ordering::Equal => RecordOrder::Equal,
    }
}

/// Merge a record into an existing version list for its key.
///
/// A version that is dominated by the incoming record is dropped; an incoming
/// record dominated by (or equal to) an existing version is discarded;
/// concurrent versions accumulate as siblings. The result is the set of
/// non-dominated versions: a single element everywhere outside vector mode.
pub fn merge_into_versions(versions: &mut Vec<Record>, record: Record) {
    let mut dominated = false;
    let mut drop_indices = Vec::new();

    for (i, existing) in versions.iter().enumerate() {
        match compare_meta(&record.meta, &existing.meta) {
            RecordOrder::Newer => drop_indices.push(i),
            RecordOrder::Older | RecordOrder::Equal => {
                dominated = true;
                break;
            }
            RecordOrder::Concurrent => {}
        }
    }

    if dominated {
        return;
    }
    for i in drop_indices.into_iter().rev() {
        versions.remove(i);
    }
    versions.push(record);
}

/// Merge two whole version lists (used when combining results across levels
/// and replicas). Commutative and idempotent.
pub fn merge_version_lists(mut base: Vec<Record>, incoming: Vec<Record>) -> Vec<Record> {
    for record in incoming {
        merge_into_versions(&mut base, record);
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lww_meta(ts: u64, origin: &str) -> RecordMeta {
        RecordMeta {
            lamport_ts: ts,
            origin: origin.to_string(),
            seq: ts,
            vector: None,
            tombstone: false,
        }
    }

    fn vec_meta(entries: &[(&str, u64)]) -> RecordMeta {
        let map: HashMap<String, u64> = entries.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        RecordMeta {
            lamport_ts: 1,
            origin: "a".to_string(),
            seq: 1,
            vector: Some(VersionVector::from_map(map)),
            tombstone: false,
        }
    }

    fn rec(key: &str, value: &str, meta: RecordMeta) -> Record {
        Record::new(key.to_string(), value.as_bytes().to_vec(), meta)
    }

    #[test]
    fn test_lww_ordering_by_timestamp() {
        assert_eq!(
            compare_meta(&lww_meta(7, "a"), &lww_meta(5, "b")),
            RecordOrder::Newer
        );
        assert_eq!(
            compare_meta(&lww_meta(5, "b"), &lww_meta(7, "a")),
            RecordOrder::Older
        );
    }

    #[test]
    fn test_lww_origin_breaks_ties() {
        assert_eq!(
            compare_meta(&lww_meta(5, "bb"), &lww_meta(5, "aa")),
            RecordOrder::Newer
        );
        assert_eq!(
            compare_meta(&lww_meta(5, "aa"), &lww_meta(5, "aa")),
            RecordOrder::Equal
        );
    }

    #[test]
    fn test_vector_ordering() {
        assert_eq!(
            compare_meta(&vec_meta(&[("a", 2)]), &vec_meta(&[("a", 1)])),
            RecordOrder::Newer
        );
        assert_eq!(
            compare_meta(
                &vec_meta(&[("a", 2), ("b", 1)]),
                &vec_meta(&[("a", 1), ("b", 2)])
            ),
            RecordOrder::Concurrent
        );
    }

    #[test]
    fn test_merge_dominating_replaces() {
        let mut versions = vec![rec("k", "old", lww_meta(1, "a"))];
        merge_into_versions(&mut versions, rec("k", "new", lww_meta(2, "a")));
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].value, b"new");
    }

    #[test]
    fn test_merge_dominated_discarded() {
        let mut versions = vec![rec("k", "new", lww_meta(2, "a"))];
        merge_into_versions(&mut versions, rec("k", "old", lww_meta(1, "a")));
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].value, b"new");
    }

    #[test]
    fn test_merge_concurrent_creates_siblings() {
        let mut versions = vec![rec("k", "from-a", vec_meta(&[("a", 1)]))];
        merge_into_versions(&mut versions, rec("k", "from-b", vec_meta(&[("b", 1)])));
        assert_eq!(versions.len(), 2, "concurrent vectors keep both siblings");
    }

    #[test]
    fn test_merge_collapses_siblings_on_dominating_write() {
        let mut versions = vec![
            rec("k", "from-a", vec_meta(&[("a", 1)])),
            rec("k", "from-b", vec_meta(&[("b", 1)])),
        ];
        merge_into_versions(&mut versions, rec("k", "merged", vec_meta(&[("a", 1), ("b", 1)])));
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].value, b"merged");
    }

    #[test]
    fn test_merge_idempotent() {
        let record = rec("k", "v", lww_meta(3, "a"));
        let mut versions = vec![record.clone()];
        merge_into_versions(&mut versions, record);
        assert_eq!(versions.len(), 1);
    }

    #[test]
    fn test_merge_version_lists_commutative() {
        let a = vec![rec("k", "v1", lww_meta(1, "a"))];
        let b = vec![rec("k", "v2", lww_meta(2, "b"))];
        let ab = merge_version_lists(a.clone(), b.clone());
        let ba = merge_version_lists(b, a);
        assert_eq!(ab.len(), 1);
        assert_eq!(ab[0].value, ba[0].value);
        assert_eq!(ab[0].value, b"v2");
    }

    #[test]
    fn test_tombstone_participates_in_ordering() {
        let mut versions = vec![rec("k", "v", lww_meta(3, "a"))];
        let tomb = Record::tombstone("k".to_string(), lww_meta(5, "b"));
        merge_into_versions(&mut versions, tomb);
        assert_eq!(versions.len(), 1);
        assert!(versions[0].is_tombstone());
    }

    #[test]
    fn test_serde_meta_skips_empty_vector() {
        let json = serde_json::to_string(&lww_meta(1, "a")).unwrap();
        assert!(!json.contains("vector"));
    }
}
