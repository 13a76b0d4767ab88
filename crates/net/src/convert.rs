//! Conversions between domain types and protobuf messages.

use meridian_common::{NodeId, VersionVector};
use meridian_kv::KvError;
use meridian_storage::{Record, RecordMeta};
use std::collections::HashMap;
use tonic::Status;

pub fn record_to_proto(record: &Record) -> meridian_proto::common::Record {
    meridian_proto::common::Record {
        key: record.key.clone(),
        value: record.value.clone(),
        meta: Some(meta_to_proto(&record.meta)),
        stored_at_ms: record.stored_at_ms,
    }
}

pub fn record_from_proto(proto: meridian_proto::common::Record) -> Result<Record, Status> {
    let meta = proto
        .meta
        .ok_or_else(|| Status::invalid_argument("missing record meta"))?;
    Ok(Record {
        key: proto.key,
        value: proto.value,
        meta: meta_from_proto(meta),
        stored_at_ms: proto.stored_at_ms,
    })
}

pub fn meta_to_proto(meta: &RecordMeta) -> meridian_proto::common::RecordMeta {
    meridian_proto::common::RecordMeta {
        lamport_ts: meta.lamport_ts,
        origin: meta.origin.clone(),
        seq: meta.seq,
        vector: meta
            .vector
            .as_ref()
            .map(|v| v.entries().clone())
            .unwrap_or_default(),
        tombstone: meta.tombstone,
    }
}

pub fn meta_from_proto(proto: meridian_proto::common::RecordMeta) -> RecordMeta {
    RecordMeta {
        lamport_ts: proto.lamport_ts,
        origin: proto.origin,
        seq: proto.seq,
        vector: if proto.vector.is_empty() {
            None
        } else {
            Some(VersionVector::from_map(proto.vector))
        },
        tombstone: proto.tombstone,
    }
}

pub fn vector_to_proto(vector: &VersionVector) -> meridian_proto::common::VersionVector {
    meridian_proto::common::VersionVector {
        entries: vector.entries().clone(),
    }
}

pub fn vector_from_proto(
    proto: Option<meridian_proto::common::VersionVector>,
) -> VersionVector {
    VersionVector::from_map(proto.map(|v| v.entries).unwrap_or_else(HashMap::new))
}

/// `hinted_for` travels as a hex node id; empty means a direct write.
pub fn hinted_for_from_proto(hex: &str) -> Result<Option<NodeId>, Status> {
    if hex.is_empty() {
        return Ok(None);
    }
    NodeId::from_hex(hex)
        .map(Some)
        .map_err(|_| Status::invalid_argument("bad hinted_for id"))
}

pub fn consistency_from_proto(value: i32) -> meridian_kv::coordinator::Consistency {
    match meridian_proto::kv::Consistency::try_from(value) {
        Ok(meridian_proto::kv::Consistency::Strong) => {
            meridian_kv::coordinator::Consistency::Strong
        }
        _ => meridian_kv::coordinator::Consistency::Quorum,
    }
}

/// Map the error taxonomy onto gRPC status codes. The typed kind leads the
/// message so routers and drivers can react (`NotOwner` carries the owner id
/// and epoch).
pub fn kv_error_to_status(e: KvError) -> Status {
    match e {
        KvError::NotOwner { owner, epoch } => Status::failed_precondition(format!(
            "NotOwner: owner={} epoch={}",
            owner.hex(),
            epoch
        )),
        KvError::StaleEpoch { incoming, current } => Status::failed_precondition(format!(
            "StaleEpoch: incoming={incoming} current={current}"
        )),
        KvError::QuorumNotMet { needed, got } => {
            Status::unavailable(format!("QuorumNotMet: needed={needed} got={got}"))
        }
        KvError::Timeout => Status::deadline_exceeded("Timeout"),
        KvError::SerializationConflict => Status::aborted("SerializationConflict"),
        KvError::UnknownKey => Status::not_found("UnknownKey"),
        KvError::UnknownTx(id) => Status::not_found(format!("UnknownTx: {id}")),
        KvError::LockTimeout(key) => Status::aborted(format!("LockTimeout: {key}")),
        KvError::Shutdown => Status::unavailable("Shutdown"),
        other => Status::internal(other.to_string()),
    }
}
