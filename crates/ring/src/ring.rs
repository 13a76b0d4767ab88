//! Consistent hash ring with virtual nodes.
//!
//! The ring is a sorted vector of `(token, node)` pairs in the 160-bit
//! token space. A key hashes to a token; walking clockwise from that token
//! and collecting the first N distinct physical nodes yields the preference
//! list. Partition ids are ring-interval indexes: pid `i` covers
//! `(token[i-1], token[i]]` (wrapping below `token[0]`).

use crate::RingError;
use meridian_common::{NodeId, ID_BYTES};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HashRing {
    /// `(token, node)` pairs sorted by token.
    entries: Vec<(NodeId, NodeId)>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(mut entries: Vec<(NodeId, NodeId)>) -> Self {
        entries.sort_by_key(|(token, _)| *token);
        entries.dedup_by_key(|(token, _)| *token);
        Self { entries }
    }

    pub fn entries(&self) -> &[(NodeId, NodeId)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of ring intervals (= partitions under the hash strategy).
    pub fn num_partitions(&self) -> usize {
        self.entries.len()
    }

    /// Distinct physical nodes present on the ring.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.entries.iter().map(|(_, n)| *n).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Add `tokens` virtual-node tokens for `node`. Tokens are derived from
    /// the node id, so a restarting node reclaims the same positions.
    pub fn add_node(&mut self, node: NodeId, tokens: usize) {
        for i in 0..tokens {
            self.insert_token(node.vnode_token(i as u32), node);
        }
    }

    /// Remove every token owned by `node`.
    pub fn remove_node(&mut self, node: NodeId) {
        self.entries.retain(|(_, n)| *n != node);
    }

    pub fn insert_token(&mut self, token: NodeId, node: NodeId) {
        match self.entries.binary_search_by_key(&token, |(t, _)| *t) {
            Ok(i) => self.entries[i].1 = node,
            Err(i) => self.entries.insert(i, (token, node)),
        }
    }

    pub fn remove_token(&mut self, token: NodeId) {
        if let Ok(i) = self.entries.binary_search_by_key(&token, |(t, _)| *t) {
            self.entries.remove(i);
        }
    }

    /// Index of the ring interval that owns `partition_key`.
    pub fn partition_id(&self, partition_key: &str) -> Result<usize, RingError> {
        if self.entries.is_empty() {
            return Err(RingError::NoNodes);
        }
        let token = NodeId::token_for_key(partition_key);
        let idx = self
            .entries
            .partition_point(|(t, _)| *t < token);
        Ok(idx % self.entries.len())
    }

    /// The first `n` distinct physical nodes clockwise from the key's token.
    pub fn preference_list(&self, partition_key: &str, n: usize) -> Vec<NodeId> {
        if self.entries.is_empty() || n == 0 {
            return Vec::new();
        }
        let start = match self.partition_id(partition_key) {
            Ok(pid) => pid,
            Err(_) => return Vec::new(),
        };
        let mut result = Vec::new();
        for i in 0..self.entries.len() {
            let (_, node) = self.entries[(start + i) % self.entries.len()];
            if !result.contains(&node) {
                result.push(node);
                if result.len() == n {
                    break;
                }
            }
        }
        result
    }

    /// Owner of partition `pid` (the node at the interval's upper token).
    pub fn owner_of(&self, pid: usize) -> Result<NodeId, RingError> {
        self.entries
            .get(pid)
            .map(|(_, n)| *n)
            .ok_or(RingError::UnknownPartition(pid))
    }

    /// pid → owner for every ring interval.
    pub fn partition_owners(&self) -> Vec<(usize, NodeId)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(pid, (_, node))| (pid, *node))
            .collect()
    }

    /// Token range `(low_exclusive, high_inclusive)` of partition `pid`.
    pub fn partition_span(&self, pid: usize) -> Result<(NodeId, NodeId), RingError> {
        let (high, _) = *self
            .entries
            .get(pid)
            .ok_or(RingError::UnknownPartition(pid))?;
        let low = if pid == 0 {
            self.entries[self.entries.len() - 1].0
        } else {
            self.entries[pid - 1].0
        };
        Ok((low, high))
    }

    /// Split ring interval `pid` by inserting a token at its midpoint,
    /// assigned to the same owner. Records stay in place; only the partition
    /// accounting becomes finer.
    pub fn split_partition(&mut self, pid: usize) -> Result<usize, RingError> {
        let owner = self.owner_of(pid)?;
        let (low, high) = self.partition_span(pid)?;
        let mid = midpoint(&low, &high);
        self.insert_token(mid, owner);
        // The new token's index is the new pid.
        Ok(self
            .entries
            .binary_search_by_key(&mid, |(t, _)| *t)
            .expect("token was just inserted"))
    }

    /// Merge adjacent ring intervals by removing the token between them.
    /// The surviving interval belongs to the higher token's owner.
    pub fn merge_partitions(&mut self, pid1: usize, pid2: usize) -> Result<(), RingError> {
        if pid1.abs_diff(pid2) != 1 {
            return Err(RingError::NotAdjacent(pid1, pid2));
        }
        let lower = pid1.min(pid2);
        let (token, _) = *self
            .entries
            .get(lower)
            .ok_or(RingError::UnknownPartition(lower))?;
        if lower + 1 >= self.entries.len() {
            return Err(RingError::UnknownPartition(lower + 1));
        }
        self.remove_token(token);
        Ok(())
    }
}

/// Midpoint of the clockwise arc from `low` to `high` in token space:
/// `low + (high - low mod 2^160) / 2`.
fn midpoint(low: &NodeId, high: &NodeId) -> NodeId {
    let span = sub_mod(high.as_bytes(), low.as_bytes());
    let half = shr1(&span);
    NodeId::from_bytes(add_mod(low.as_bytes(), &half))
}

fn sub_mod(a: &[u8; ID_BYTES], b: &[u8; ID_BYTES]) -> [u8; ID_BYTES] {
    let mut out = [0u8; ID_BYTES];
    let mut borrow = 0i16;
    for i in (0..ID_BYTES).rev() {
        let diff = i16::from(a[i]) - i16::from(b[i]) - borrow;
        if diff < 0 {
            out[i] = (diff + 256) as u8;
            borrow = 1;
        } else {
            out[i] = diff as u8;
            borrow = 0;
        }
    }
    out
}

fn add_mod(a: &[u8; ID_BYTES], b: &[u8; ID_BYTES]) -> [u8; ID_BYTES] {
    let mut out = [0u8; ID_BYTES];
    let mut carry = 0u16;
    for i in (0..ID_BYTES).rev() {
        let sum = u16::from(a[i]) + u16::from(b[i]) + carry;
        out[i] = (sum & 0xff) as u8;
        carry = sum >> 8;
    }
    out
}

fn shr1(a: &[u8; ID_BYTES]) -> [u8; ID_BYTES] {
    let mut out = [0u8; ID_BYTES];
    let mut carry = 0u8;
    for i in 0..ID_BYTES {
        out[i] = (a[i] >> 1) | (carry << 7);
        carry = a[i] & 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn node(name: &str) -> NodeId {
        NodeId::from_name(name)
    }

    fn ring_of(names: &[&str], tokens: usize) -> HashRing {
        let mut ring = HashRing::new();
        for name in names {
            ring.add_node(node(name), tokens);
        }
        ring
    }

    #[test]
    fn test_tokens_sorted_and_stable() {
        let ring = ring_of(&["a", "b", "c"], 8);
        assert_eq!(ring.num_partitions(), 24);
        assert!(ring
            .entries()
            .windows(2)
            .all(|w| w[0].0 < w[1].0));

        let again = ring_of(&["a", "b", "c"], 8);
        assert_eq!(ring, again, "token layout must be deterministic");
    }

    #[test]
    fn test_preference_list_distinct_nodes() {
        let ring = ring_of(&["a", "b", "c", "d"], 8);
        let prefs = ring.preference_list("some-key", 3);
        assert_eq!(prefs.len(), 3);
        let unique: HashSet<NodeId> = prefs.iter().copied().collect();
        assert_eq!(unique.len(), 3, "preference list holds distinct nodes");
    }

    #[test]
    fn test_preference_list_caps_at_node_count() {
        let ring = ring_of(&["a", "b"], 4);
        assert_eq!(ring.preference_list("k", 5).len(), 2);
        assert!(HashRing::new().preference_list("k", 3).is_empty());
    }

    #[test]
    fn test_partition_id_matches_preference_head() {
        let ring = ring_of(&["a", "b", "c"], 8);
        for key in ["alpha", "beta", "gamma", "delta"] {
            let pid = ring.partition_id(key).unwrap();
            let owner = ring.owner_of(pid).unwrap();
            assert_eq!(ring.preference_list(key, 1)[0], owner);
        }
    }

    #[test]
    fn test_remove_node_reassigns_keys() {
        let mut ring = ring_of(&["a", "b", "c"], 8);
        ring.remove_node(node("b"));
        assert_eq!(ring.num_partitions(), 16);
        for key in ["k1", "k2", "k3", "k4", "k5"] {
            assert_ne!(ring.preference_list(key, 1)[0], node("b"));
        }
    }

    #[test]
    fn test_rebalance_bound_on_node_add() {
        // Adding the (k+1)-th node should move roughly 1/(k+1) of keys.
        let mut ring = ring_of(&["a", "b", "c"], 32);
        let keys: Vec<String> = (0..2000).map(|i| format!("key_{i}")).collect();
        let before: HashMap<&String, NodeId> = keys
            .iter()
            .map(|k| (k, ring.preference_list(k, 1)[0]))
            .collect();

        ring.add_node(node("d"), 32);
        let moved = keys
            .iter()
            .filter(|k| ring.preference_list(k, 1)[0] != before[*k])
            .count();

        let expected = keys.len() / 4;
        assert!(
            moved < expected * 2,
            "moved {moved} of {} keys, expected about {expected}",
            keys.len()
        );
        assert!(moved > 0);
    }

    #[test]
    fn test_split_partition_preserves_owner_and_placement() {
        let mut ring = ring_of(&["a", "b"], 4);
        let keys: Vec<String> = (0..200).map(|i| format!("key_{i}")).collect();
        let before: HashMap<&String, NodeId> = keys
            .iter()
            .map(|k| (k, ring.preference_list(k, 1)[0]))
            .collect();

        let pid = 3;
        let owner = ring.owner_of(pid).unwrap();
        let new_pid = ring.split_partition(pid).unwrap();
        assert_eq!(ring.num_partitions(), 9);
        assert_eq!(ring.owner_of(new_pid).unwrap(), owner);

        for key in &keys {
            assert_eq!(
                ring.preference_list(key, 1)[0],
                before[key],
                "hash split must not move records"
            );
        }
    }

    #[test]
    fn test_merge_partitions_adjacent_only() {
        let mut ring = ring_of(&["a", "b"], 4);
        let n = ring.num_partitions();
        ring.merge_partitions(2, 3).unwrap();
        assert_eq!(ring.num_partitions(), n - 1);

        assert!(matches!(
            ring.merge_partitions(0, 4),
            Err(RingError::NotAdjacent(0, 4))
        ));
    }

    #[test]
    fn test_token_arithmetic() {
        let mut a = [0u8; ID_BYTES];
        a[ID_BYTES - 1] = 10;
        let mut b = [0u8; ID_BYTES];
        b[ID_BYTES - 1] = 4;

        assert_eq!(sub_mod(&a, &b)[ID_BYTES - 1], 6);
        assert_eq!(add_mod(&a, &b)[ID_BYTES - 1], 14);
        assert_eq!(shr1(&a)[ID_BYTES - 1], 5);

        // Wraparound subtraction: 4 - 10 mod 2^160 ends in 0xfa.
        let wrapped = sub_mod(&b, &a);
        assert_eq!(wrapped[ID_BYTES - 1], 0xfa);
        assert!(wrapped[..ID_BYTES - 1].iter().all(|&x| x == 0xff));
    }

    #[test]
    fn test_midpoint_lies_in_arc() {
        let low = NodeId::from_sha1(b"low");
        let high = NodeId::from_sha1(b"high");
        let mid = midpoint(&low, &high);
        // The midpoint must be strictly inside the clockwise arc: the
        // distance low->mid is less than low->high.
        let full = sub_mod(high.as_bytes(), low.as_bytes());
        let part = sub_mod(mid.as_bytes(), low.as_bytes());
        assert!(part < full);
        assert_ne!(mid, low);
    }
}
