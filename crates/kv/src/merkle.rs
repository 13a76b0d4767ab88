//! Segmented Merkle digests for anti-entropy.
//!
//! The keyspace is divided into a fixed number of segments by key hash;
//! each segment gets a binary Merkle tree whose leaves hash
//! `(key, lamport_ts, origin, tombstone)` for every stored version. Two
//! nodes compare segment roots, then leaf lists of only the divergent
//! segments, and finally exchange just the differing keys.

use meridian_storage::Record;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// SHA-1 hash output (20 bytes).
pub type Hash = [u8; 20];

/// Segment index for a key: uniform by hash, stable across nodes.
pub fn segment_of(key: &str, segments: usize) -> usize {
    let digest = Sha1::digest(key.as_bytes());
    let prefix = u64::from_be_bytes(digest[0..8].try_into().expect("8-byte slice"));
    (prefix % segments as u64) as usize
}

/// Digest descriptor of one key's version set. Values do not participate:
/// `(lamport_ts, origin, tombstone)` identifies a version, and hinted data
/// is absent by construction (hints never enter the engine).
fn version_descriptor(versions: &[Record]) -> Vec<u8> {
    let mut sorted: Vec<&Record> = versions.iter().collect();
    sorted.sort_by(|a, b| (&a.meta.origin, a.meta.seq).cmp(&(&b.meta.origin, b.meta.seq)));
    let mut out = Vec::new();
    for record in sorted {
        out.extend_from_slice(&record.meta.lamport_ts.to_be_bytes());
        out.extend_from_slice(record.meta.origin.as_bytes());
        out.push(record.meta.tombstone as u8);
    }
    out
}

// ---------------------------------------------------------------------------
// Merkle tree
// ---------------------------------------------------------------------------

/// A binary Merkle tree over sorted `(key, descriptor)` leaves.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    nodes: Vec<MerkleNode>,
}

#[derive(Debug, Clone)]
struct MerkleNode {
    hash: Hash,
    /// `Some(key)` for leaves, `None` for internal nodes.
    key: Option<String>,
    left: Option<usize>,
    right: Option<usize>,
}

impl MerkleTree {
    /// Build from already-sorted `(key, leaf_bytes)` entries. An empty
    /// input yields a single zero-hash root.
    pub fn build(entries: &[(String, Vec<u8>)]) -> Self {
        let mut nodes: Vec<MerkleNode> = Vec::new();

        if entries.is_empty() {
            nodes.push(MerkleNode {
                hash: [0u8; 20],
                key: None,
                left: None,
                right: None,
            });
            return Self { nodes };
        }

        let mut current_level: Vec<usize> = entries
            .iter()
            .map(|(k, bytes)| {
                let idx = nodes.len();
                nodes.push(MerkleNode {
                    hash: leaf_hash(k, bytes),
                    key: Some(k.clone()),
                    left: None,
                    right: None,
                });
                idx
            })
            .collect();

        while current_level.len() > 1 {
            let mut next_level = Vec::new();
            let mut i = 0;
            while i < current_level.len() {
                if i + 1 < current_level.len() {
                    let left = current_level[i];
                    let right = current_level[i + 1];
                    let hash = internal_hash(&nodes[left].hash, &nodes[right].hash);
                    let idx = nodes.len();
                    nodes.push(MerkleNode {
                        hash,
                        key: None,
                        left: Some(left),
                        right: Some(right),
                    });
                    next_level.push(idx);
                    i += 2;
                } else {
                    // Odd node out is promoted unchanged.
                    next_level.push(current_level[i]);
                    i += 1;
                }
            }
            current_level = next_level;
        }

        // Keep the root last so root_hash() is O(1).
        let root_idx = current_level[0];
        if root_idx != nodes.len() - 1 {
            let last = nodes.len() - 1;
            nodes.swap(root_idx, last);
            fix_references(&mut nodes, root_idx, last);
        }

        Self { nodes }
    }

    pub fn root_hash(&self) -> Hash {
        self.nodes.last().map(|n| n.hash).unwrap_or([0u8; 20])
    }

    /// Leaf `(key, hash)` pairs in the original sorted order.
    pub fn leaves(&self) -> Vec<(String, Hash)> {
        let mut out = Vec::new();
        if !self.nodes.is_empty() {
            self.collect_leaves(self.nodes.len() - 1, &mut out);
        }
        out
    }

    fn collect_leaves(&self, idx: usize, out: &mut Vec<(String, Hash)>) {
        let node = &self.nodes[idx];
        if let Some(ref key) = node.key {
            out.push((key.clone(), node.hash));
            return;
        }
        if let Some(left) = node.left {
            self.collect_leaves(left, out);
        }
        if let Some(right) = node.right {
            self.collect_leaves(right, out);
        }
    }
}

/// Keys present in only one leaf list or hashed differently in the two.
pub fn diff_leaves(ours: &[(String, Hash)], theirs: &[(String, Hash)]) -> Vec<String> {
    let mut result = Vec::new();
    let mut i = 0;
    let mut j = 0;

    while i < ours.len() && j < theirs.len() {
        let (ok, oh) = &ours[i];
        let (tk, th) = &theirs[j];
        match ok.cmp(tk) {
            std::cmp::Ordering::Equal => {
                if oh != th {
                    result.push(ok.clone());
                }
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                result.push(ok.clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                result.push(tk.clone());
                j += 1;
            }
        }
    }
    for (k, _) in &ours[i..] {
        result.push(k.clone());
    }
    for (k, _) in &theirs[j..] {
        result.push(k.clone());
    }
    result
}

fn leaf_hash(key: &str, bytes: &[u8]) -> Hash {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(bytes);
    hasher.finalize().into()
}

fn internal_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha1::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn fix_references(nodes: &mut [MerkleNode], old_a: usize, old_b: usize) {
    let swap = |idx: &mut Option<usize>| {
        if let Some(c) = idx {
            if *c == old_a {
                *c = old_b;
            } else if *c == old_b {
                *c = old_a;
            }
        }
    };
    for node in nodes.iter_mut() {
        swap(&mut node.left);
        swap(&mut node.right);
    }
}

// ---------------------------------------------------------------------------
// Segment digests
// ---------------------------------------------------------------------------

/// Per-segment trees over a keyspace snapshot.
#[derive(Debug)]
pub struct SegmentDigests {
    trees: Vec<MerkleTree>,
}

impl SegmentDigests {
    /// Build digests from the engine's merged view (tombstones included).
    pub fn build(snapshot: &BTreeMap<String, Vec<Record>>, segments: usize) -> Self {
        let mut per_segment: Vec<Vec<(String, Vec<u8>)>> = vec![Vec::new(); segments.max(1)];
        for (key, versions) in snapshot {
            per_segment[segment_of(key, segments.max(1))]
                .push((key.clone(), version_descriptor(versions)));
        }
        Self {
            trees: per_segment.iter().map(|e| MerkleTree::build(e)).collect(),
        }
    }

    pub fn num_segments(&self) -> usize {
        self.trees.len()
    }

    pub fn roots(&self) -> Vec<Hash> {
        self.trees.iter().map(MerkleTree::root_hash).collect()
    }

    pub fn leaves(&self, segment: usize) -> Vec<(String, Hash)> {
        self.trees
            .get(segment)
            .map(MerkleTree::leaves)
            .unwrap_or_default()
    }
}
