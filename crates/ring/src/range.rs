//! Ordered key-range partitioning.
//!
//! The keyspace is an ordered vector of `(low, high_excl, owner)` entries
//! covering everything: the first range is open at the bottom, the last at
//! the top. Binary search finds the owner; split and merge edit boundaries.

use crate::RingError;
use meridian_common::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangePartition {
    /// Inclusive lower bound; empty string means unbounded below.
    pub low: String,
    /// Exclusive upper bound; `None` means unbounded above.
    pub high: Option<String>,
    pub owner: NodeId,
}

impl RangePartition {
    pub fn contains(&self, partition_key: &str) -> bool {
        partition_key >= self.low.as_str()
            && self
                .high
                .as_deref()
                .map(|h| partition_key < h)
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangePartitioner {
    partitions: Vec<RangePartition>,
}

impl RangePartitioner {
    /// Build from explicit boundary keys, assigning owners round-robin. An
    /// empty boundary list yields a single partition over everything.
    pub fn new(boundaries: &[String], nodes: &[NodeId]) -> Result<Self, RingError> {
        if nodes.is_empty() {
            return Err(RingError::NoNodes);
        }
        let mut partitions = Vec::new();
        let mut low = String::new();
        for (i, boundary) in boundaries.iter().enumerate() {
            partitions.push(RangePartition {
                low: low.clone(),
                high: Some(boundary.clone()),
                owner: nodes[i % nodes.len()],
            });
            low = boundary.clone();
        }
        partitions.push(RangePartition {
            low,
            high: None,
            owner: nodes[boundaries.len() % nodes.len()],
        });
        Ok(Self { partitions })
    }

    pub fn from_partitions(partitions: Vec<RangePartition>) -> Self {
        Self { partitions }
    }

    pub fn partitions(&self) -> &[RangePartition] {
        &self.partitions
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.partitions.iter().map(|p| p.owner).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Binary search for the partition containing `partition_key`.
    pub fn partition_id(&self, partition_key: &str) -> Result<usize, RingError> {
        if self.partitions.is_empty() {
            return Err(RingError::NoNodes);
        }
        let idx = self
            .partitions
            .partition_point(|p| p.low.as_str() <= partition_key);
        Ok(idx.saturating_sub(1))
    }

    pub fn owner_of(&self, pid: usize) -> Result<NodeId, RingError> {
        self.partitions
            .get(pid)
            .map(|p| p.owner)
            .ok_or(RingError::UnknownPartition(pid))
    }

    /// Preference list: the owner, then owners of the following partitions
    /// (wrapping) until `n` distinct nodes are collected.
    pub fn preference_list(&self, partition_key: &str, n: usize) -> Vec<NodeId> {
        let start = match self.partition_id(partition_key) {
            Ok(pid) => pid,
            Err(_) => return Vec::new(),
        };
        let mut result = Vec::new();
        for i in 0..self.partitions.len() {
            let owner = self.partitions[(start + i) % self.partitions.len()].owner;
            if !result.contains(&owner) {
                result.push(owner);
                if result.len() == n {
                    break;
                }
            }
        }
        result
    }

    /// Split `pid` at `split_key` (or a computed midpoint). The upper half
    /// becomes a new partition with the same owner; the caller migrates
    /// records and reassigns ownership as needed. Returns the new pid.
    pub fn split(&mut self, pid: usize, split_key: Option<&str>) -> Result<usize, RingError> {
        let partition = self
            .partitions
            .get(pid)
            .cloned()
            .ok_or(RingError::UnknownPartition(pid))?;

        let key = match split_key {
            Some(k) => {
                if !partition.contains(k) || k == partition.low {
                    return Err(RingError::SplitKeyOutOfRange {
                        pid,
                        key: k.to_string(),
                    });
                }
                k.to_string()
            }
            None => match &partition.high {
                Some(high) => midpoint_key(&partition.low, high),
                None => return Err(RingError::SplitKeyRequired),
            },
        };

        let upper = RangePartition {
            low: key.clone(),
            high: partition.high.clone(),
            owner: partition.owner,
        };
        self.partitions[pid].high = Some(key);
        self.partitions.insert(pid + 1, upper);
        Ok(pid + 1)
    }

    /// Merge two adjacent, contiguous partitions. The merged range keeps the
    /// left owner; the caller migrates the right partition's records if the
    /// owners differed.
    pub fn merge(&mut self, pid1: usize, pid2: usize) -> Result<(), RingError> {
        if pid1.abs_diff(pid2) != 1 {
            return Err(RingError::NotAdjacent(pid1, pid2));
        }
        let left = pid1.min(pid2);
        let right = left + 1;
        if right >= self.partitions.len() {
            return Err(RingError::UnknownPartition(right));
        }
        if self.partitions[left].high.as_deref() != Some(self.partitions[right].low.as_str()) {
            return Err(RingError::NotContiguous);
        }
        let high = self.partitions[right].high.clone();
        self.partitions[left].high = high;
        self.partitions.remove(right);
        Ok(())
    }

    pub fn set_owner(&mut self, pid: usize, owner: NodeId) -> Result<(), RingError> {
        self.partitions
            .get_mut(pid)
            .map(|p| p.owner = owner)
            .ok_or(RingError::UnknownPartition(pid))
    }

    /// Drop `node` by handing its partitions to the given replacements,
    /// round-robin.
    pub fn reassign_node(&mut self, node: NodeId, replacements: &[NodeId]) -> Vec<usize> {
        let mut moved = Vec::new();
        let mut next = 0usize;
        for (pid, partition) in self.partitions.iter_mut().enumerate() {
            if partition.owner == node && !replacements.is_empty() {
                partition.owner = replacements[next % replacements.len()];
                next += 1;
                moved.push(pid);
            }
        }
        moved
    }
}

/// A key strictly between `low` and `high` when one exists; used when a
/// split is requested without an explicit key.
fn midpoint_key(low: &str, high: &str) -> String {
    let lo = low.as_bytes();
    let hi = high.as_bytes();
    let mut out: Vec<u8> = Vec::new();
    for i in 0..hi.len() {
        let l = lo.get(i).copied().unwrap_or(0);
        let h = hi[i];
        if l == h {
            out.push(l);
            continue;
        }
        let mid = l + (h - l) / 2;
        if mid > l {
            out.push(mid);
            return String::from_utf8_lossy(&out).into_owned();
        }
        // Adjacent bytes: keep the low byte and extend to fall inside.
        out.push(l);
    }
    out.push(b'm');
    String::from_utf8_lossy(&out).into_owned()
}
