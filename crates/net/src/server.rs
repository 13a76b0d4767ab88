//! gRPC service implementations.
//!
//! Bridges the tonic-generated service traits to the coordinator,
//! transaction manager, and cluster admin.

use crate::convert;
use meridian_admin::{AdminError, ClusterAdmin};
use meridian_common::NodeId;
use meridian_kv::anti_entropy;
use meridian_kv::coordinator::Coordinator;
use meridian_kv::hints::HintStore;
use meridian_kv::peer::PeerClient;
use meridian_kv::tx::TxManager;
use meridian_storage::Record;
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};

fn count_inbound(rpc_type: &str) {
    let m = meridian_metrics::metrics();
    m.rpcs_received.inc();
    m.rpcs_received_by_type.with_label_values(&[rpc_type]).inc();
}

// ---------------------------------------------------------------------------
// Replica service (node-to-node)
// ---------------------------------------------------------------------------

pub struct ReplicaServiceImpl<C: PeerClient> {
    pub coordinator: Arc<Coordinator<C>>,
    pub merkle_segments: usize,
}

impl<C: PeerClient> std::fmt::Debug for ReplicaServiceImpl<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaServiceImpl").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl<C: PeerClient> meridian_proto::replica::replica_service_server::ReplicaService
    for ReplicaServiceImpl<C>
{
    async fn put_record(
        &self,
        request: Request<meridian_proto::replica::PutRecordRequest>,
    ) -> Result<Response<meridian_proto::common::Ack>, Status> {
        count_inbound("put_record");
        let _timer = meridian_metrics::start_rpc_timer("put_record", "inbound");
        let req = request.into_inner();

        let record = convert::record_from_proto(
            req.record
                .ok_or_else(|| Status::invalid_argument("missing record"))?,
        )?;
        let hinted_for = convert::hinted_for_from_proto(&req.hinted_for)?;

        let epoch = self
            .coordinator
            .handle_put(record, hinted_for)
            .map_err(convert::kv_error_to_status)?;
        Ok(Response::new(meridian_proto::common::Ack { epoch }))
    }

    async fn get_record(
        &self,
        request: Request<meridian_proto::replica::GetRecordRequest>,
    ) -> Result<Response<meridian_proto::replica::GetRecordResponse>, Status> {
        count_inbound("get_record");
        let req = request.into_inner();
        let versions = self
            .coordinator
            .handle_get(&req.key)
            .iter()
            .map(convert::record_to_proto)
            .collect();
        Ok(Response::new(
            meridian_proto::replica::GetRecordResponse { versions },
        ))
    }

    async fn replicate(
        &self,
        request: Request<meridian_proto::replica::ReplicateRequest>,
    ) -> Result<Response<meridian_proto::replica::ReplicateResponse>, Status> {
        count_inbound("replicate");
        let _timer = meridian_metrics::start_rpc_timer("replicate", "inbound");
        let req = request.into_inner();

        let batch: Vec<Record> = req
            .batch
            .into_iter()
            .map(convert::record_from_proto)
            .collect::<Result<_, _>>()?;
        let last_seen = self
            .coordinator
            .handle_replicate(&batch)
            .map_err(convert::kv_error_to_status)?;
        Ok(Response::new(meridian_proto::replica::ReplicateResponse {
            last_seen: Some(convert::vector_to_proto(&last_seen)),
        }))
    }

    async fn fetch_updates(
        &self,
        request: Request<meridian_proto::replica::FetchUpdatesRequest>,
    ) -> Result<Response<meridian_proto::replica::FetchUpdatesResponse>, Status> {
        count_inbound("fetch_updates");
        let req = request.into_inner();
        let since = convert::vector_from_proto(req.last_seen);
        let max = if req.max_ops == 0 {
            1000
        } else {
            req.max_ops as usize
        };
        let ops = self
            .coordinator
            .handle_fetch_updates(&since, max)
            .iter()
            .map(convert::record_to_proto)
            .collect();
        Ok(Response::new(
            meridian_proto::replica::FetchUpdatesResponse { ops },
        ))
    }

    async fn ping(
        &self,
        _request: Request<meridian_proto::replica::PingRequest>,
    ) -> Result<Response<meridian_proto::replica::PingResponse>, Status> {
        count_inbound("ping");
        Ok(Response::new(meridian_proto::replica::PingResponse {
            node: self.coordinator.store().id().hex(),
            epoch: self.coordinator.epoch(),
        }))
    }

    async fn update_partition_map(
        &self,
        request: Request<meridian_proto::replica::UpdatePartitionMapRequest>,
    ) -> Result<Response<meridian_proto::common::Ack>, Status> {
        count_inbound("update_partition_map");
        let req = request.into_inner();
        let incoming: meridian_ring::PartitionerState = serde_json::from_str(&req.state_json)
            .map_err(|e| Status::invalid_argument(format!("bad partition state: {e}")))?;
        self.coordinator
            .handle_partitioner_update(incoming)
            .map_err(convert::kv_error_to_status)?;
        Ok(Response::new(meridian_proto::common::Ack {
            epoch: self.coordinator.epoch(),
        }))
    }

    async fn update_hash_ring(
        &self,
        request: Request<meridian_proto::replica::UpdateHashRingRequest>,
    ) -> Result<Response<meridian_proto::common::Ack>, Status> {
        count_inbound("update_hash_ring");
        let req = request.into_inner();
        let entries = req
            .tokens
            .into_iter()
            .map(|t| {
                let token = NodeId::from_hex(&t.token)
                    .map_err(|_| Status::invalid_argument("bad ring token"))?;
                let node = NodeId::from_hex(&t.node)
                    .map_err(|_| Status::invalid_argument("bad ring node id"))?;
                Ok::<_, Status>((token, node))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let incoming = meridian_ring::PartitionerState {
            epoch: req.epoch,
            partitioner: meridian_ring::Partitioner::Hash(meridian_ring::HashRing::from_entries(
                entries,
            )),
        };
        self.coordinator
            .handle_partitioner_update(incoming)
            .map_err(convert::kv_error_to_status)?;
        Ok(Response::new(meridian_proto::common::Ack {
            epoch: self.coordinator.epoch(),
        }))
    }

    async fn merkle_digest(
        &self,
        _request: Request<meridian_proto::replica::MerkleDigestRequest>,
    ) -> Result<Response<meridian_proto::replica::MerkleDigestResponse>, Status> {
        count_inbound("merkle_digest");
        let roots = anti_entropy::local_roots(self.coordinator.store(), self.merkle_segments)
            .into_iter()
            .map(|h| h.to_vec())
            .collect();
        Ok(Response::new(
            meridian_proto::replica::MerkleDigestResponse { roots },
        ))
    }

    async fn segment_keys(
        &self,
        request: Request<meridian_proto::replica::SegmentKeysRequest>,
    ) -> Result<Response<meridian_proto::replica::SegmentKeysResponse>, Status> {
        count_inbound("segment_keys");
        let req = request.into_inner();
        let leaves = anti_entropy::local_segment_keys(
            self.coordinator.store(),
            req.segment as usize,
            self.merkle_segments,
        )
        .into_iter()
        .map(|(key, hash)| meridian_proto::replica::SegmentLeaf {
            key,
            hash: hash.to_vec(),
        })
        .collect();
        Ok(Response::new(
            meridian_proto::replica::SegmentKeysResponse { leaves },
        ))
    }

    async fn index_lookup(
        &self,
        request: Request<meridian_proto::replica::IndexLookupRequest>,
    ) -> Result<Response<meridian_proto::replica::IndexLookupResponse>, Status> {
        count_inbound("index_lookup");
        let req = request.into_inner();
        let keys = self.coordinator.store().query_index(&req.field, &req.value);
        Ok(Response::new(
            meridian_proto::replica::IndexLookupResponse { keys },
        ))
    }
}

// ---------------------------------------------------------------------------
// KV service (client-facing)
// ---------------------------------------------------------------------------

pub struct KvServiceImpl<C: PeerClient> {
    pub coordinator: Arc<Coordinator<C>>,
    pub tx: Arc<TxManager>,
}

impl<C: PeerClient> std::fmt::Debug for KvServiceImpl<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvServiceImpl").finish_non_exhaustive()
    }
}

fn timeout_override(ms: u32) -> Option<tokio::time::Duration> {
    (ms > 0).then(|| tokio::time::Duration::from_millis(u64::from(ms)))
}

#[tonic::async_trait]
impl<C: PeerClient> meridian_proto::kv::kv_service_server::KvService for KvServiceImpl<C> {
    async fn put(
        &self,
        request: Request<meridian_proto::kv::PutRequest>,
    ) -> Result<Response<meridian_proto::kv::PutResponse>, Status> {
        count_inbound("put");
        let _timer = meridian_metrics::start_kv_timer("put");
        let req = request.into_inner();
        let context = req.context.map(|v| {
            meridian_common::VersionVector::from_map(v.entries)
        });

        if !req.tx_id.is_empty() {
            self.tx
                .write(&req.tx_id, &req.key, Some(req.value), context)
                .await
                .map_err(convert::kv_error_to_status)?;
            return Ok(Response::new(meridian_proto::kv::PutResponse {
                epoch: self.coordinator.epoch(),
                op_id: String::new(),
                acks: 0,
            }));
        }

        let ack = self
            .coordinator
            .put(
                &req.key,
                req.value,
                context,
                convert::consistency_from_proto(req.consistency),
                timeout_override(req.timeout_ms),
            )
            .await
            .map_err(convert::kv_error_to_status)?;
        Ok(Response::new(meridian_proto::kv::PutResponse {
            epoch: ack.epoch,
            op_id: ack.op_id,
            acks: ack.acks as u32,
        }))
    }

    async fn get(
        &self,
        request: Request<meridian_proto::kv::GetRequest>,
    ) -> Result<Response<meridian_proto::kv::GetResponse>, Status> {
        count_inbound("get");
        let _timer = meridian_metrics::start_kv_timer("get");
        let req = request.into_inner();

        if !req.tx_id.is_empty() {
            let value = self
                .tx
                .read(&req.tx_id, &req.key)
                .await
                .map_err(convert::kv_error_to_status)?;
            return Ok(Response::new(tx_read_response(
                &req.key,
                value,
                self.coordinator.epoch(),
            )));
        }

        let result = self
            .coordinator
            .get(
                &req.key,
                convert::consistency_from_proto(req.consistency),
                timeout_override(req.timeout_ms),
            )
            .await
            .map_err(convert::kv_error_to_status)?;
        Ok(Response::new(meridian_proto::kv::GetResponse {
            versions: result.versions.iter().map(convert::record_to_proto).collect(),
            context: Some(convert::vector_to_proto(&result.context)),
            epoch: result.epoch,
        }))
    }

    async fn delete(
        &self,
        request: Request<meridian_proto::kv::DeleteRequest>,
    ) -> Result<Response<meridian_proto::kv::PutResponse>, Status> {
        count_inbound("delete");
        let _timer = meridian_metrics::start_kv_timer("delete");
        let req = request.into_inner();
        let context = req
            .context
            .map(|v| meridian_common::VersionVector::from_map(v.entries));

        if !req.tx_id.is_empty() {
            self.tx
                .write(&req.tx_id, &req.key, None, context)
                .await
                .map_err(convert::kv_error_to_status)?;
            return Ok(Response::new(meridian_proto::kv::PutResponse {
                epoch: self.coordinator.epoch(),
                op_id: String::new(),
                acks: 0,
            }));
        }

        let ack = self
            .coordinator
            .delete(
                &req.key,
                context,
                convert::consistency_from_proto(req.consistency),
                timeout_override(req.timeout_ms),
            )
            .await
            .map_err(convert::kv_error_to_status)?;
        Ok(Response::new(meridian_proto::kv::PutResponse {
            epoch: ack.epoch,
            op_id: ack.op_id,
            acks: ack.acks as u32,
        }))
    }

    async fn scan(
        &self,
        request: Request<meridian_proto::kv::ScanRequest>,
    ) -> Result<Response<meridian_proto::kv::ScanResponse>, Status> {
        count_inbound("scan");
        let req = request.into_inner();
        let items = self
            .coordinator
            .scan(&req.partition_key, &req.low_ck, &req.high_ck)
            .await
            .map_err(convert::kv_error_to_status)?
            .into_iter()
            .map(|(clustering_key, value)| meridian_proto::kv::ScanItem {
                clustering_key,
                value,
            })
            .collect();
        Ok(Response::new(meridian_proto::kv::ScanResponse { items }))
    }

    async fn begin_transaction(
        &self,
        _request: Request<meridian_proto::kv::BeginTransactionRequest>,
    ) -> Result<Response<meridian_proto::kv::BeginTransactionResponse>, Status> {
        count_inbound("begin_transaction");
        let tx_id = self.tx.begin().map_err(convert::kv_error_to_status)?;
        Ok(Response::new(
            meridian_proto::kv::BeginTransactionResponse { tx_id },
        ))
    }

    async fn commit_transaction(
        &self,
        request: Request<meridian_proto::kv::CommitTransactionRequest>,
    ) -> Result<Response<meridian_proto::kv::CommitTransactionResponse>, Status> {
        count_inbound("commit_transaction");
        let req = request.into_inner();
        self.tx
            .commit(&req.tx_id)
            .await
            .map_err(convert::kv_error_to_status)?;
        Ok(Response::new(
            meridian_proto::kv::CommitTransactionResponse { committed: true },
        ))
    }

    async fn abort_transaction(
        &self,
        request: Request<meridian_proto::kv::AbortTransactionRequest>,
    ) -> Result<Response<meridian_proto::common::Ack>, Status> {
        count_inbound("abort_transaction");
        let req = request.into_inner();
        self.tx
            .abort(&req.tx_id)
            .map_err(convert::kv_error_to_status)?;
        Ok(Response::new(meridian_proto::common::Ack {
            epoch: self.coordinator.epoch(),
        }))
    }

    async fn get_for_update(
        &self,
        request: Request<meridian_proto::kv::GetForUpdateRequest>,
    ) -> Result<Response<meridian_proto::kv::GetResponse>, Status> {
        count_inbound("get_for_update");
        let req = request.into_inner();
        let value = self
            .tx
            .get_for_update(&req.tx_id, &req.key, timeout_override(req.timeout_ms))
            .await
            .map_err(convert::kv_error_to_status)?;
        Ok(Response::new(tx_read_response(
            &req.key,
            value,
            self.coordinator.epoch(),
        )))
    }

    async fn list_by_index(
        &self,
        request: Request<meridian_proto::kv::ListByIndexRequest>,
    ) -> Result<Response<meridian_proto::kv::ListByIndexResponse>, Status> {
        count_inbound("list_by_index");
        let req = request.into_inner();
        let keys = self.coordinator.list_by_index(&req.field, &req.value).await;
        Ok(Response::new(meridian_proto::kv::ListByIndexResponse {
            keys,
        }))
    }
}

/// Transactional reads return plain values; shape them as a bare record so
/// Get and GetForUpdate share one response type.
fn tx_read_response(
    key: &str,
    value: Option<Vec<u8>>,
    epoch: u64,
) -> meridian_proto::kv::GetResponse {
    meridian_proto::kv::GetResponse {
        versions: value
            .map(|v| {
                vec![meridian_proto::common::Record {
                    key: key.to_string(),
                    value: v,
                    meta: None,
                    stored_at_ms: 0,
                }]
            })
            .unwrap_or_default(),
        context: None,
        epoch,
    }
}

// ---------------------------------------------------------------------------
// Admin service
// ---------------------------------------------------------------------------

pub struct AdminServiceImpl<C: PeerClient> {
    pub coordinator: Arc<Coordinator<C>>,
    pub admin: Arc<ClusterAdmin<C>>,
    pub hints: Option<Arc<HintStore>>,
    pub start_time: Instant,
}

impl<C: PeerClient> std::fmt::Debug for AdminServiceImpl<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminServiceImpl").finish_non_exhaustive()
    }
}

fn admin_error_to_status(e: AdminError) -> Status {
    match e {
        AdminError::Kv(kv) => convert::kv_error_to_status(kv),
        AdminError::UnknownNode(id) => Status::not_found(format!("UnknownNode: {id}")),
        AdminError::WrongStrategy => {
            Status::failed_precondition("operation not supported for this strategy")
        }
        AdminError::Ring(e) => Status::failed_precondition(e.to_string()),
    }
}

fn map_response(
    change: meridian_admin::MapChange,
) -> Response<meridian_proto::admin::PartitionMapResponse> {
    Response::new(meridian_proto::admin::PartitionMapResponse {
        epoch: change.epoch,
        partitions: change.partitions as u64,
    })
}

#[tonic::async_trait]
impl<C: PeerClient> meridian_proto::admin::admin_service_server::AdminService
    for AdminServiceImpl<C>
{
    async fn health(
        &self,
        _request: Request<meridian_proto::admin::HealthRequest>,
    ) -> Result<Response<meridian_proto::admin::HealthResponse>, Status> {
        Ok(Response::new(meridian_proto::admin::HealthResponse {
            healthy: true,
            node_id: self.coordinator.store().id().hex(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }))
    }

    async fn stats(
        &self,
        _request: Request<meridian_proto::admin::StatsRequest>,
    ) -> Result<Response<meridian_proto::admin::StatsResponse>, Status> {
        let store = self.coordinator.store();
        let engine = store.engine().stats();
        let replication_pending = store
            .replication_log()
            .lock()
            .expect("replication log lock")
            .pending_len();
        let state = self
            .coordinator
            .partitioner()
            .read()
            .expect("partitioner lock")
            .clone();

        Ok(Response::new(meridian_proto::admin::StatsResponse {
            node_id: store.id().hex(),
            epoch: state.epoch,
            partitions: state.partitioner.num_partitions() as u64,
            memtable_keys: engine.memtable_keys as u64,
            wal_epoch: engine.wal_epoch,
            tables_per_level: engine.tables_per_level.iter().map(|&n| n as u64).collect(),
            replication_pending: replication_pending as u64,
            hints_pending: self
                .hints
                .as_ref()
                .map(|h| h.total_hints() as u64)
                .unwrap_or(0),
            lamport_now: store.clock_now(),
        }))
    }

    async fn split_partition(
        &self,
        request: Request<meridian_proto::admin::SplitPartitionRequest>,
    ) -> Result<Response<meridian_proto::admin::PartitionMapResponse>, Status> {
        let req = request.into_inner();
        let split_key = (!req.split_key.is_empty()).then_some(req.split_key.as_str());
        let change = self
            .admin
            .split_partition(req.pid as usize, split_key)
            .await
            .map_err(admin_error_to_status)?;
        Ok(map_response(change))
    }

    async fn merge_partitions(
        &self,
        request: Request<meridian_proto::admin::MergePartitionsRequest>,
    ) -> Result<Response<meridian_proto::admin::PartitionMapResponse>, Status> {
        let req = request.into_inner();
        let change = self
            .admin
            .merge_partitions(req.pid1 as usize, req.pid2 as usize)
            .await
            .map_err(admin_error_to_status)?;
        Ok(map_response(change))
    }

    async fn rebalance(
        &self,
        _request: Request<meridian_proto::admin::RebalanceRequest>,
    ) -> Result<Response<meridian_proto::admin::PartitionMapResponse>, Status> {
        let change = self.admin.rebalance().await.map_err(admin_error_to_status)?;
        Ok(map_response(change))
    }

    async fn add_node(
        &self,
        request: Request<meridian_proto::admin::AddNodeRequest>,
    ) -> Result<Response<meridian_proto::admin::PartitionMapResponse>, Status> {
        let req = request.into_inner();
        let addr = req
            .addr
            .parse()
            .map_err(|_| Status::invalid_argument("bad node address"))?;
        let change = self
            .admin
            .add_node(&req.name, addr)
            .await
            .map_err(admin_error_to_status)?;
        Ok(map_response(change))
    }

    async fn remove_node(
        &self,
        request: Request<meridian_proto::admin::RemoveNodeRequest>,
    ) -> Result<Response<meridian_proto::admin::PartitionMapResponse>, Status> {
        let req = request.into_inner();
        let node_id = NodeId::from_hex(&req.node_id)
            .map_err(|_| Status::invalid_argument("bad node id"))?;
        let change = self
            .admin
            .remove_node(node_id)
            .await
            .map_err(admin_error_to_status)?;
        Ok(map_response(change))
    }

    async fn mark_hot_key(
        &self,
        request: Request<meridian_proto::admin::MarkHotKeyRequest>,
    ) -> Result<Response<meridian_proto::common::Ack>, Status> {
        let req = request.into_inner();
        self.admin
            .mark_hot_key(&req.key, req.buckets, req.migrate)
            .await
            .map_err(admin_error_to_status)?;
        Ok(Response::new(meridian_proto::common::Ack {
            epoch: self.coordinator.epoch(),
        }))
    }

    async fn check_hot_partitions(
        &self,
        request: Request<meridian_proto::admin::CheckHotPartitionsRequest>,
    ) -> Result<Response<meridian_proto::admin::PartitionMapResponse>, Status> {
        let req = request.into_inner();
        self.admin
            .check_hot_partitions(req.threshold, req.min_keys as usize)
            .await
            .map_err(admin_error_to_status)?;
        let state = self
            .coordinator
            .partitioner()
            .read()
            .expect("partitioner lock")
            .clone();
        Ok(Response::new(meridian_proto::admin::PartitionMapResponse {
            epoch: state.epoch,
            partitions: state.partitioner.num_partitions() as u64,
        }))
    }
}
