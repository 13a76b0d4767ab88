//! gRPC client implementing the `PeerClient` trait.
//!
//! Maintains a pool of tonic channels keyed by node id; a broken channel is
//! dropped from the pool so the next call reconnects.

use crate::convert;
use async_trait::async_trait;
use meridian_common::{NodeId, VersionVector};
use meridian_kv::merkle::Hash;
use meridian_kv::peer::{PeerClient, PeerError, PeerInfo, Pong, PutAck, ReplicateAck};
use meridian_ring::PartitionerState;
use meridian_storage::Record;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tonic::transport::Channel;

use meridian_proto::replica::replica_service_client::ReplicaServiceClient;

pub struct GrpcPeerClient {
    /// This node's hex id, sent with pings.
    self_hex: String,
    channels: Arc<RwLock<HashMap<NodeId, Channel>>>,
}

impl std::fmt::Debug for GrpcPeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcPeerClient")
            .field("self_hex", &self.self_hex)
            .finish_non_exhaustive()
    }
}

impl GrpcPeerClient {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_hex: self_id.hex(),
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn channel(&self, target: &PeerInfo) -> Result<Channel, PeerError> {
        {
            let cache = self.channels.read().await;
            if let Some(channel) = cache.get(&target.id) {
                return Ok(channel.clone());
            }
        }

        let endpoint = format!("http://{}", target.addr);
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| PeerError::RpcFailed(format!("invalid endpoint: {e}")))?
            .connect_timeout(std::time::Duration::from_secs(2))
            .timeout(std::time::Duration::from_secs(10))
            .connect()
            .await
            .map_err(|e| PeerError::RpcFailed(format!("connect failed: {e}")))?;

        self.channels.write().await.insert(target.id, channel.clone());
        Ok(channel)
    }

    async fn drop_channel(&self, target: &PeerInfo) {
        self.channels.write().await.remove(&target.id);
    }

    async fn call<T, F, Fut>(&self, target: &PeerInfo, rpc_type: &str, f: F) -> Result<T, PeerError>
    where
        F: FnOnce(ReplicaServiceClient<Channel>) -> Fut,
        Fut: std::future::Future<Output = Result<T, tonic::Status>>,
    {
        let m = meridian_metrics::metrics();
        m.rpcs_sent.inc();
        m.rpcs_sent_by_type.with_label_values(&[rpc_type]).inc();
        let _timer = meridian_metrics::start_rpc_timer(rpc_type, "outbound");

        let channel = self.channel(target).await?;
        let client = ReplicaServiceClient::new(channel);
        match f(client).await {
            Ok(out) => Ok(out),
            Err(status) => {
                if status.code() == tonic::Code::Unavailable {
                    self.drop_channel(target).await;
                }
                Err(status_to_peer_error(status))
            }
        }
    }
}

fn status_to_peer_error(status: tonic::Status) -> PeerError {
    match status.code() {
        tonic::Code::DeadlineExceeded => PeerError::Timeout,
        tonic::Code::FailedPrecondition => {
            // The error taxonomy rides in the message, kind first.
            if status.message().starts_with("StaleEpoch") {
                let current = status
                    .message()
                    .split("current=")
                    .nth(1)
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(0);
                return PeerError::StaleEpoch { current };
            }
            PeerError::RpcFailed(format!("{}: {}", status.code(), status.message()))
        }
        _ => PeerError::RpcFailed(format!("{}: {}", status.code(), status.message())),
    }
}

#[async_trait]
impl PeerClient for GrpcPeerClient {
    async fn put_record(
        &self,
        target: &PeerInfo,
        record: &Record,
        hinted_for: Option<NodeId>,
    ) -> Result<PutAck, PeerError> {
        let request = meridian_proto::replica::PutRecordRequest {
            record: Some(convert::record_to_proto(record)),
            hinted_for: hinted_for.map(|id| id.hex()).unwrap_or_default(),
        };
        let response = self
            .call(target, "put_record", |mut c| async move {
                c.put_record(request).await
            })
            .await?;
        Ok(PutAck {
            epoch: response.into_inner().epoch,
        })
    }

    async fn get_record(&self, target: &PeerInfo, key: &str) -> Result<Vec<Record>, PeerError> {
        let request = meridian_proto::replica::GetRecordRequest {
            key: key.to_string(),
        };
        let response = self
            .call(target, "get_record", |mut c| async move {
                c.get_record(request).await
            })
            .await?;
        response
            .into_inner()
            .versions
            .into_iter()
            .map(|r| {
                convert::record_from_proto(r)
                    .map_err(|e| PeerError::RpcFailed(e.message().to_string()))
            })
            .collect()
    }

    async fn replicate(
        &self,
        target: &PeerInfo,
        batch: &[Record],
    ) -> Result<ReplicateAck, PeerError> {
        let request = meridian_proto::replica::ReplicateRequest {
            batch: batch.iter().map(convert::record_to_proto).collect(),
        };
        let response = self
            .call(target, "replicate", |mut c| async move {
                c.replicate(request).await
            })
            .await?;
        Ok(ReplicateAck {
            last_seen: convert::vector_from_proto(response.into_inner().last_seen),
        })
    }

    async fn fetch_updates(
        &self,
        target: &PeerInfo,
        last_seen: &VersionVector,
    ) -> Result<Vec<Record>, PeerError> {
        let request = meridian_proto::replica::FetchUpdatesRequest {
            last_seen: Some(convert::vector_to_proto(last_seen)),
            max_ops: 0,
        };
        let response = self
            .call(target, "fetch_updates", |mut c| async move {
                c.fetch_updates(request).await
            })
            .await?;
        response
            .into_inner()
            .ops
            .into_iter()
            .map(|r| {
                convert::record_from_proto(r)
                    .map_err(|e| PeerError::RpcFailed(e.message().to_string()))
            })
            .collect()
    }

    async fn ping(&self, target: &PeerInfo) -> Result<Pong, PeerError> {
        let request = meridian_proto::replica::PingRequest {
            sender: self.self_hex.clone(),
        };
        let response = self
            .call(target, "ping", |mut c| async move { c.ping(request).await })
            .await?;
        let inner = response.into_inner();
        let node = NodeId::from_hex(&inner.node)
            .map_err(|_| PeerError::RpcFailed("bad node id in pong".into()))?;
        Ok(Pong {
            node,
            epoch: inner.epoch,
        })
    }

    async fn update_partition_map(
        &self,
        target: &PeerInfo,
        state: &PartitionerState,
    ) -> Result<(), PeerError> {
        let state_json = serde_json::to_string(state)
            .map_err(|e| PeerError::RpcFailed(format!("serialize map: {e}")))?;
        let request = meridian_proto::replica::UpdatePartitionMapRequest {
            state_json,
            epoch: state.epoch,
        };
        self.call(target, "update_partition_map", |mut c| async move {
            c.update_partition_map(request).await
        })
        .await?;
        Ok(())
    }

    async fn update_hash_ring(
        &self,
        target: &PeerInfo,
        tokens: &[(NodeId, NodeId)],
        epoch: u64,
    ) -> Result<(), PeerError> {
        let request = meridian_proto::replica::UpdateHashRingRequest {
            tokens: tokens
                .iter()
                .map(|(token, node)| meridian_proto::replica::TokenEntry {
                    token: token.hex(),
                    node: node.hex(),
                })
                .collect(),
            epoch,
        };
        self.call(target, "update_hash_ring", |mut c| async move {
            c.update_hash_ring(request).await
        })
        .await?;
        Ok(())
    }

    async fn merkle_roots(&self, target: &PeerInfo) -> Result<Vec<Hash>, PeerError> {
        let request = meridian_proto::replica::MerkleDigestRequest {};
        let response = self
            .call(target, "merkle_digest", |mut c| async move {
                c.merkle_digest(request).await
            })
            .await?;
        response
            .into_inner()
            .roots
            .into_iter()
            .map(|bytes| {
                bytes
                    .try_into()
                    .map_err(|_| PeerError::RpcFailed("bad digest length".into()))
            })
            .collect()
    }

    async fn segment_keys(
        &self,
        target: &PeerInfo,
        segment: usize,
    ) -> Result<Vec<(String, Hash)>, PeerError> {
        let request = meridian_proto::replica::SegmentKeysRequest {
            segment: segment as u32,
        };
        let response = self
            .call(target, "segment_keys", |mut c| async move {
                c.segment_keys(request).await
            })
            .await?;
        response
            .into_inner()
            .leaves
            .into_iter()
            .map(|leaf| {
                let hash: Hash = leaf
                    .hash
                    .try_into()
                    .map_err(|_| PeerError::RpcFailed("bad leaf hash length".into()))?;
                Ok((leaf.key, hash))
            })
            .collect()
    }

    async fn list_by_index(
        &self,
        target: &PeerInfo,
        field: &str,
        value: &str,
    ) -> Result<Vec<String>, PeerError> {
        let request = meridian_proto::replica::IndexLookupRequest {
            field: field.to_string(),
            value: value.to_string(),
        };
        let response = self
            .call(target, "index_lookup", |mut c| async move {
                c.index_lookup(request).await
            })
            .await?;
        Ok(response.into_inner().keys)
    }

    async fn scan(
        &self,
        target: &PeerInfo,
        partition_key: &str,
        low_ck: &str,
        high_ck: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, PeerError> {
        let channel = self.channel(target).await?;
        let mut client =
            meridian_proto::kv::kv_service_client::KvServiceClient::new(channel);
        let response = client
            .scan(meridian_proto::kv::ScanRequest {
                partition_key: partition_key.to_string(),
                low_ck: low_ck.to_string(),
                high_ck: high_ck.to_string(),
            })
            .await
            .map_err(status_to_peer_error)?;
        Ok(response
            .into_inner()
            .items
            .into_iter()
            .map(|item| (item.clustering_key, item.value))
            .collect())
    }
}
