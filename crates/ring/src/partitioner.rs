//! Strategy facade and the epoch-stamped partition map.

use crate::range::RangePartitioner;
use crate::ring::HashRing;
use crate::RingError;
use meridian_common::NodeId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Either placement strategy, behind one interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum Partitioner {
    Hash(HashRing),
    Range(RangePartitioner),
}

impl Partitioner {
    pub fn partition_id_for_key(&self, partition_key: &str) -> Result<usize, RingError> {
        match self {
            Partitioner::Hash(ring) => ring.partition_id(partition_key),
            Partitioner::Range(ranges) => ranges.partition_id(partition_key),
        }
    }

    /// The N nodes that should hold replicas of `partition_key`, owner
    /// first.
    pub fn owners_for_key(&self, partition_key: &str, n: usize) -> Vec<NodeId> {
        match self {
            Partitioner::Hash(ring) => ring.preference_list(partition_key, n),
            Partitioner::Range(ranges) => ranges.preference_list(partition_key, n),
        }
    }

    pub fn owner_of(&self, pid: usize) -> Result<NodeId, RingError> {
        match self {
            Partitioner::Hash(ring) => ring.owner_of(pid),
            Partitioner::Range(ranges) => ranges.owner_of(pid),
        }
    }

    pub fn num_partitions(&self) -> usize {
        match self {
            Partitioner::Hash(ring) => ring.num_partitions(),
            Partitioner::Range(ranges) => ranges.num_partitions(),
        }
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        match self {
            Partitioner::Hash(ring) => ring.nodes(),
            Partitioner::Range(ranges) => ranges.nodes(),
        }
    }

    /// pid → owner for every partition. Every partition has exactly one
    /// owner at any snapshot of this map.
    pub fn partition_owners(&self) -> Vec<(usize, NodeId)> {
        match self {
            Partitioner::Hash(ring) => ring.partition_owners(),
            Partitioner::Range(ranges) => ranges
                .partitions()
                .iter()
                .enumerate()
                .map(|(pid, p)| (pid, p.owner))
                .collect(),
        }
    }

    /// Split a partition. Hash intervals split at their token midpoint and
    /// ignore `split_key`; ranges split at the given (or computed) key.
    pub fn split_partition(
        &mut self,
        pid: usize,
        split_key: Option<&str>,
    ) -> Result<usize, RingError> {
        match self {
            Partitioner::Hash(ring) => ring.split_partition(pid),
            Partitioner::Range(ranges) => ranges.split(pid, split_key),
        }
    }

    pub fn merge_partitions(&mut self, pid1: usize, pid2: usize) -> Result<(), RingError> {
        match self {
            Partitioner::Hash(ring) => ring.merge_partitions(pid1, pid2),
            Partitioner::Range(ranges) => ranges.merge(pid1, pid2),
        }
    }
}

/// The partition map a node holds: the partitioner plus a monotonic epoch.
/// Persisted to `partition_map.json`; replicated via `UpdatePartitionMap` /
/// `UpdateHashRing`, accepted only with a strictly greater epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionerState {
    pub epoch: u64,
    pub partitioner: Partitioner,
}

impl PartitionerState {
    pub fn new(partitioner: Partitioner) -> Self {
        Self {
            epoch: 1,
            partitioner,
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>, RingError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RingError::Io(e)),
        }
    }

    pub fn store(&self, path: &Path) -> Result<(), RingError> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Bump the epoch after an administrative change.
    pub fn bump(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Replace this state with an incoming one if its epoch is strictly
    /// newer; otherwise report `StaleEpoch`.
    pub fn accept(&mut self, incoming: PartitionerState) -> Result<(), RingError> {
        if incoming.epoch <= self.epoch {
            return Err(RingError::StaleEpoch {
                incoming: incoming.epoch,
                current: self.epoch,
            });
        }
        *self = incoming;
        Ok(())
    }
}
