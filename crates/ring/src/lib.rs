//! meridian-ring: key placement.
//!
//! Two partitioning strategies behind one `Partitioner` facade: a consistent
//! hash ring with virtual nodes (partition ids are ring intervals), and
//! ordered key ranges with explicit boundaries. Both expose
//! `partition_id_for_key` and `owners_for_key`, and both support dynamic
//! split/merge under a monotonically increasing map epoch.

pub mod partitioner;
pub mod range;
pub mod ring;

pub use partitioner::{Partitioner, PartitionerState};
pub use range::{RangePartition, RangePartitioner};
pub use ring::HashRing;

use meridian_common::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("unknown partition {0}")]
    UnknownPartition(usize),
    #[error("partitions {0} and {1} are not adjacent")]
    NotAdjacent(usize, usize),
    #[error("partition ranges are not contiguous")]
    NotContiguous,
    #[error("split key {key:?} outside partition {pid}")]
    SplitKeyOutOfRange { pid: usize, key: String },
    #[error("a split key is required for an unbounded range")]
    SplitKeyRequired,
    #[error("ring has no nodes")]
    NoNodes,
    #[error("stale epoch: incoming {incoming} <= current {current}")]
    StaleEpoch { incoming: u64, current: u64 },
    #[error("node {0} not in ring")]
    UnknownNode(NodeId),
    #[error("partition state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("partition state parse error: {0}")]
    Serde(#[from] serde_json::Error),
}
