//! Conflict resolution strategies.
//!
//! The consistency mode is chosen once at node construction and drives how
//! replicas resolve competing versions: LWW picks the maximum
//! `(lamport_ts, origin)`, vector mode keeps concurrent siblings, CRDT mode
//! joins states. `reconcile` collapses the raw version lists collected from
//! replicas into the client-visible result.

use meridian_config::ConsistencyMode;
use meridian_storage::record::{compare_meta, merge_version_lists, RecordOrder};
use meridian_storage::Record;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reduce the merged version list to what a read returns for the given
/// mode. Input is the non-dominated version set produced by the storage
/// merge; tombstones have already been filtered by the caller.
pub fn reconcile(mode: ConsistencyMode, versions: Vec<Record>) -> Vec<Record> {
    match mode {
        ConsistencyMode::Lww => lww_winner(versions).into_iter().collect(),
        ConsistencyMode::Vector => versions,
        ConsistencyMode::Crdt => crdt_join(versions).into_iter().collect(),
    }
}

/// The single winner under `(lamport_ts, origin)`.
pub fn lww_winner(versions: Vec<Record>) -> Option<Record> {
    versions.into_iter().reduce(|best, candidate| {
        match compare_meta(&candidate.meta, &best.meta) {
            RecordOrder::Newer => candidate,
            RecordOrder::Concurrent => {
                // Vectors said concurrent; fall back to the total order.
                if (candidate.meta.lamport_ts, &candidate.meta.origin)
                    > (best.meta.lamport_ts, &best.meta.origin)
                {
                    candidate
                } else {
                    best
                }
            }
            _ => best,
        }
    })
}

/// Join sibling CRDT states into one record carrying the merged state and
/// the merged version vector.
fn crdt_join(versions: Vec<Record>) -> Option<Record> {
    let mut iter = versions.into_iter();
    let first = iter.next()?;
    let mut state = GCounter::from_bytes(&first.value).unwrap_or_default();
    let mut merged = first;
    for sibling in iter {
        if let Some(other) = GCounter::from_bytes(&sibling.value) {
            state.merge(&other);
        }
        let joined_vector = match (&merged.meta.vector, &sibling.meta.vector) {
            (Some(ours), Some(theirs)) => Some(ours.merge(theirs)),
            _ => None,
        };
        if joined_vector.is_some() {
            merged.meta.vector = joined_vector;
        }
        if sibling.meta.lamport_ts > merged.meta.lamport_ts {
            merged.meta.lamport_ts = sibling.meta.lamport_ts;
        }
    }
    merged.value = state.to_bytes();
    Some(merged)
}

/// Merge an incoming CRDT record with whatever the local engine holds,
/// producing the record that should be stored. The join is deterministic,
/// so replicas converge regardless of delivery order.
pub fn crdt_merge_incoming(existing: Vec<Record>, incoming: Record) -> Record {
    let mut all = existing;
    all.push(incoming.clone());
    let live: Vec<Record> = all.into_iter().filter(|r| !r.is_tombstone()).collect();
    match crdt_join(live) {
        Some(mut joined) => {
            joined.key = incoming.key;
            joined.meta.origin = incoming.meta.origin;
            joined.meta.seq = incoming.meta.seq;
            joined.meta.lamport_ts = joined.meta.lamport_ts.max(incoming.meta.lamport_ts);
            joined
        }
        None => incoming,
    }
}

/// Combine version lists gathered from several replicas into the merged
/// non-dominated set.
pub fn combine_replica_versions(lists: Vec<Vec<Record>>) -> Vec<Record> {
    let mut merged = Vec::new();
    for list in lists {
        merged = merge_version_lists(merged, list);
    }
    merged
}

// ---------------------------------------------------------------------------
// G-Counter
// ---------------------------------------------------------------------------

/// Grow-only counter: per-node counts, merged by element-wise max. The
/// serialized state is the value stored when a node runs in CRDT mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GCounter {
    counts: HashMap<String, u64>,
}

impl GCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, node: &str, amount: u64) {
        *self.counts.entry(node.to_string()).or_insert(0) += amount;
    }

    pub fn value(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn merge(&mut self, other: &Self) {
        for (node, &count) in &other.counts {
            let entry = self.counts.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("gcounter serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::VersionVector;
    use meridian_storage::RecordMeta;

    fn rec(value: &str, ts: u64, origin: &str) -> Record {
        Record::new(
            "k".to_string(),
            value.as_bytes().to_vec(),
            RecordMeta {
                lamport_ts: ts,
                origin: origin.to_string(),
                seq: ts,
                vector: None,
                tombstone: false,
            },
        )
    }

    fn vrec(value: &[u8], entries: &[(&str, u64)]) -> Record {
        let map: HashMap<String, u64> = entries.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        Record::new(
            "k".to_string(),
            value.to_vec(),
            RecordMeta {
                lamport_ts: 1,
                origin: "a".to_string(),
                seq: 1,
                vector: Some(VersionVector::from_map(map)),
                tombstone: false,
            },
        )
    }

    #[test]
    fn test_lww_higher_timestamp_wins() {
        let out = reconcile(
            ConsistencyMode::Lww,
            vec![rec("v1", 5, "a"), rec("v2", 7, "b")],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, b"v2");
    }

    #[test]
    fn test_lww_origin_breaks_ties() {
        let out = reconcile(
            ConsistencyMode::Lww,
            vec![rec("v1", 5, "aa"), rec("v2", 5, "bb")],
        );
        assert_eq!(out[0].value, b"v2", "higher origin id wins the tie");
    }

    #[test]
    fn test_vector_mode_returns_siblings() {
        let out = reconcile(
            ConsistencyMode::Vector,
            vec![vrec(b"s1", &[("a", 1)]), vrec(b"s2", &[("b", 1)])],
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_combine_replica_versions_drops_dominated() {
        let merged = combine_replica_versions(vec![
            vec![vrec(b"old", &[("a", 1)])],
            vec![vrec(b"new", &[("a", 2)])],
            vec![vrec(b"new", &[("a", 2)])],
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].value, b"new");
    }

    #[test]
    fn test_gcounter_merge_is_max_not_sum() {
        let mut a = GCounter::new();
        a.increment("n1", 3);
        let mut b = a.clone();
        b.increment("n2", 2);
        a.merge(&b);
        a.merge(&b); // idempotent
        assert_eq!(a.value(), 5);
    }

    #[test]
    fn test_crdt_reconcile_joins_siblings() {
        let mut c1 = GCounter::new();
        c1.increment("n1", 3);
        let mut c2 = GCounter::new();
        c2.increment("n2", 4);

        let out = reconcile(
            ConsistencyMode::Crdt,
            vec![
                vrec(&c1.to_bytes(), &[("a", 1)]),
                vrec(&c2.to_bytes(), &[("b", 1)]),
            ],
        );
        assert_eq!(out.len(), 1);
        let joined = GCounter::from_bytes(&out[0].value).unwrap();
        assert_eq!(joined.value(), 7);
    }

    #[test]
    fn test_crdt_merge_incoming_deterministic() {
        let mut c1 = GCounter::new();
        c1.increment("n1", 1);
        let mut c2 = GCounter::new();
        c2.increment("n2", 2);

        let local = vec![vrec(&c1.to_bytes(), &[("a", 1)])];
        let incoming = vrec(&c2.to_bytes(), &[("b", 1)]);

        let ab = crdt_merge_incoming(local.clone(), incoming.clone());
        let ba = crdt_merge_incoming(vec![incoming], local[0].clone());
        assert_eq!(
            GCounter::from_bytes(&ab.value).unwrap().value(),
            GCounter::from_bytes(&ba.value).unwrap().value()
        );
    }

    #[test]
    fn test_empty_versions() {
        assert!(reconcile(ConsistencyMode::Lww, vec![]).is_empty());
        assert!(reconcile(ConsistencyMode::Crdt, vec![]).is_empty());
    }
}
