//! Generated gRPC code for the meridian protobuf definitions.

/// Common types (Record, RecordMeta, VersionVector, Ack).
pub mod common {
    tonic::include_proto!("meridian.common");
}

/// Node-to-node replica service (PutRecord, Replicate, FetchUpdates,
/// Ping, UpdatePartitionMap, MerkleDigest, SegmentKeys).
pub mod replica {
    tonic::include_proto!("meridian.replica");
}

/// Client-facing KV service (Put, Get, Delete, Scan, transactions,
/// ListByIndex).
pub mod kv {
    tonic::include_proto!("meridian.kv");
}

/// Admin service (Health, Stats, partition management, hot keys).
pub mod admin {
    tonic::include_proto!("meridian.admin");
}
