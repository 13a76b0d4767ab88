//! gRPC networking layer for meridian.
//!
//! Provides:
//! - `GrpcPeerClient`: implements the `PeerClient` trait over tonic
//! - `ReplicaServiceImpl`: node-to-node surface (replication, anti-entropy)
//! - `KvServiceImpl`: client-facing surface (KV ops, transactions)
//! - `AdminServiceImpl`: health, stats, partition management
//! - `build_server`: assembles all services into a tonic `Router`

pub mod client;
pub mod convert;
pub mod server;

pub use client::GrpcPeerClient;
pub use server::{AdminServiceImpl, KvServiceImpl, ReplicaServiceImpl};

use meridian_admin::ClusterAdmin;
use meridian_kv::coordinator::Coordinator;
use meridian_kv::hints::HintStore;
use meridian_kv::tx::TxManager;
use std::sync::Arc;
use std::time::Instant;

/// Build a tonic `Router` with all gRPC services.
pub fn build_server(
    coordinator: Arc<Coordinator<GrpcPeerClient>>,
    tx: Arc<TxManager>,
    admin: Arc<ClusterAdmin<GrpcPeerClient>>,
    hints: Option<Arc<HintStore>>,
    merkle_segments: usize,
) -> tonic::transport::server::Router {
    let replica_svc = ReplicaServiceImpl {
        coordinator: coordinator.clone(),
        merkle_segments,
    };
    let kv_svc = KvServiceImpl {
        coordinator: coordinator.clone(),
        tx,
    };
    let admin_svc = AdminServiceImpl {
        coordinator,
        admin,
        hints,
        start_time: Instant::now(),
    };

    tonic::transport::Server::builder()
        .add_service(
            meridian_proto::replica::replica_service_server::ReplicaServiceServer::new(
                replica_svc,
            ),
        )
        .add_service(meridian_proto::kv::kv_service_server::KvServiceServer::new(kv_svc))
        .add_service(
            meridian_proto::admin::admin_service_server::AdminServiceServer::new(admin_svc),
        )
}
