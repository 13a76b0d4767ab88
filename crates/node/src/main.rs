//! meridian-node: entry point for a meridian cluster node.
//!
//! Loads config, opens the storage engine and per-node state, restores or
//! builds the partition map, wires the coordinator and transaction manager,
//! spawns every background role (heartbeat, replication senders, hint
//! delivery, anti-entropy, storage maintenance), then serves all gRPC
//! services on the configured listen address until Ctrl+C.

use meridian_common::NodeId;
use meridian_config::{NodeConfig, PartitionStrategy};
use meridian_kv::anti_entropy::{self, AntiEntropyConfig};
use meridian_kv::coordinator::{Coordinator, QuorumConfig};
use meridian_kv::heartbeat::{spawn_heartbeat_task, FailureDetector};
use meridian_kv::hints::{spawn_hint_delivery_task, HintDeliveryConfig, HintStore};
use meridian_kv::peer::{PeerDirectory, PeerInfo};
use meridian_kv::replication::{spawn_replication_sender, SenderConfig};
use meridian_kv::tx::{TxManager, TxOptions};
use meridian_kv::NodeStore;
use meridian_net::GrpcPeerClient;
use meridian_ring::{HashRing, Partitioner, PartitionerState, RangePartitioner};
use meridian_storage::{FsyncPolicy, LsmEngine, StorageOptions};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    meridian_metrics::init_tracing();

    // First CLI arg is the YAML config path.
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = meridian_config::load_from_file(std::path::Path::new(&config_path))?;

    let node_id = NodeId::from_name(&config.name);
    tracing::info!(name = %config.name, id = %node_id, listen = %config.listen, "starting node");

    // ── Storage and per-node state ──
    let storage_options = StorageOptions {
        fsync: FsyncPolicy::from_str_config(&config.storage.fsync),
        memtable_threshold: config.storage.memtable_threshold,
        flush_interval_secs: config.storage.flush_interval_secs,
        l0_file_limit: config.storage.l0_file_limit,
        level_size_ratio: config.storage.level_size_ratio,
        tombstone_retention_secs: config.storage.tombstone_retention_secs,
    };
    let store = Arc::new(NodeStore::open(
        node_id,
        &config.storage.data_dir,
        storage_options,
        config.replication.consistency_mode,
        config.index_fields.clone(),
    )?);

    // ── Partition map: restore the persisted one or build the initial ──
    let partitioner_path = config.storage.data_dir.join("partition_map.json");
    let state = match PartitionerState::load(&partitioner_path)? {
        Some(state) => {
            tracing::info!(epoch = state.epoch, "restored partition map");
            state
        }
        None => {
            let state = initial_partitioner(&config, node_id)?;
            state.store(&partitioner_path)?;
            state
        }
    };
    let partitioner = Arc::new(RwLock::new(state));

    // ── Peers, transport, failure detector ──
    let peers: Vec<PeerInfo> = config
        .peers
        .iter()
        .map(|p| PeerInfo::new(&p.name, p.addr))
        .collect();
    let directory = Arc::new(PeerDirectory::new(peers.clone()));
    let client = Arc::new(GrpcPeerClient::new(node_id));
    let detector = Arc::new(FailureDetector::new(
        peers.iter().map(|p| p.id),
        Duration::from_millis(config.replication.suspect_timeout_ms),
        Duration::from_millis(config.replication.dead_timeout_ms),
    ));

    // ── Hinted handoff ──
    let hints = if config.replication.hinted_handoff {
        Some(Arc::new(HintStore::open(
            &config.storage.data_dir.join("hints"),
        )?))
    } else {
        None
    };

    // ── Coordinator and transactions ──
    let quorum = QuorumConfig {
        n: config.replication.replication_factor,
        w: config.replication.write_quorum,
        r: config.replication.read_quorum,
        write_timeout: Duration::from_millis(config.replication.rpc_timeout_ms),
        read_timeout: Duration::from_millis(config.replication.rpc_timeout_ms),
        read_repair: config.replication.read_repair,
        hinted_handoff: config.replication.hinted_handoff,
        load_balance_reads: config.replication.load_balance_reads,
        enable_forwarding: config.replication.enable_forwarding,
    };
    let mut coordinator = Coordinator::new(
        store.clone(),
        partitioner.clone(),
        partitioner_path,
        directory.clone(),
        client.clone(),
        detector.clone(),
        quorum,
    );
    if let Some(ref hints) = hints {
        coordinator = coordinator.with_hint_store(hints.clone());
    }
    let coordinator = Arc::new(coordinator);

    let tx = Arc::new(TxManager::new(
        store.clone(),
        TxOptions {
            lock_strategy: config.transactions.lock_strategy,
            lock_timeout: Duration::from_millis(config.transactions.lock_timeout_ms),
        },
    ));

    let admin = Arc::new(meridian_admin::ClusterAdmin::new(
        coordinator.clone(),
        directory.clone(),
        detector.clone(),
        client.clone(),
        meridian_admin::AdminConfig {
            partitions_per_node: config.partitioning.partitions_per_node,
            max_partitions: config.partitioning.num_partitions,
            max_transfer_rate: config.partitioning.max_transfer_rate,
            replication_factor: config.replication.replication_factor,
        },
    ));

    // ── Background roles ──
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    spawn_heartbeat_task(
        detector.clone(),
        directory.clone(),
        client.clone(),
        Duration::from_millis(config.replication.heartbeat_interval_ms),
        shutdown_rx.clone(),
    );

    let all_peers_hex: Vec<String> = peers.iter().map(|p| p.id.hex()).collect();
    for peer in &peers {
        spawn_replication_sender(
            peer.clone(),
            store.replication_log().clone(),
            store.id_hex().to_string(),
            all_peers_hex.clone(),
            client.clone(),
            SenderConfig {
                interval: Duration::from_millis(config.replication.sender_interval_ms),
                max_batch_size: config.replication.max_batch_size,
            },
            shutdown_rx.clone(),
        );
    }

    if let Some(ref hints) = hints {
        spawn_hint_delivery_task(
            hints.clone(),
            detector.clone(),
            directory.clone(),
            client.clone(),
            HintDeliveryConfig {
                check_interval: Duration::from_millis(
                    config.replication.hinted_handoff_interval_ms,
                ),
                max_hints_per_cycle: config.replication.max_batch_size,
            },
            shutdown_rx.clone(),
        );
    }

    anti_entropy::spawn_anti_entropy_task(
        store.clone(),
        directory.clone(),
        detector.clone(),
        client.clone(),
        AntiEntropyConfig {
            interval: Duration::from_millis(config.replication.anti_entropy_interval_ms),
            segments: config.replication.merkle_segments,
            max_keys_per_round: config.replication.max_batch_size * 10,
            retention: Duration::from_secs(config.storage.tombstone_retention_secs),
        },
        shutdown_rx.clone(),
    );

    spawn_storage_maintenance(store.engine().clone(), shutdown_rx.clone());

    // Catch up on ops missed while down, once peers answer.
    {
        let store = store.clone();
        let directory = directory.clone();
        let client = client.clone();
        let max_batch = config.replication.max_batch_size;
        tokio::spawn(async move {
            anti_entropy::startup_sync(&store, &directory, client.as_ref(), max_batch).await;
        });
    }

    if let Some(port) = config.metrics_port {
        let addr: std::net::SocketAddr = format!("0.0.0.0:{port}").parse()?;
        tokio::spawn(async move {
            if let Err(e) = meridian_metrics::serve_metrics(addr).await {
                tracing::warn!(error = %e, "metrics server failed");
            }
        });
    }

    // ── Serve ──
    let router = meridian_net::build_server(
        coordinator,
        tx,
        admin,
        hints,
        config.replication.merkle_segments,
    );
    tracing::info!(listen = %config.listen, "serving gRPC");
    tokio::select! {
        result = router.serve(config.listen) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    // Drain: stop background roles, seal the WAL. The replication log and
    // last_seen persist on every mutation, so there is nothing else to save.
    let _ = shutdown_tx.send(true);
    store.engine().sync()?;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Build the initial partition map when none is persisted: all configured
/// nodes (self included) placed by the configured strategy.
fn initial_partitioner(
    config: &NodeConfig,
    node_id: NodeId,
) -> Result<PartitionerState, Box<dyn std::error::Error>> {
    let mut nodes: Vec<NodeId> = config
        .peers
        .iter()
        .map(|p| NodeId::from_name(&p.name))
        .collect();
    nodes.push(node_id);
    nodes.sort_unstable();

    let partitioner = match config.partitioning.strategy {
        PartitionStrategy::Hash => {
            let mut ring = HashRing::new();
            for node in &nodes {
                ring.add_node(*node, config.partitioning.partitions_per_node);
            }
            Partitioner::Hash(ring)
        }
        PartitionStrategy::Range => {
            let boundaries = if config.partitioning.key_ranges.is_empty() {
                Vec::new()
            } else {
                config.partitioning.key_ranges.clone()
            };
            Partitioner::Range(RangePartitioner::new(&boundaries, &nodes)?)
        }
    };
    tracing::info!(
        partitions = partitioner.num_partitions(),
        nodes = nodes.len(),
        "built initial partition map"
    );
    Ok(PartitionerState::new(partitioner))
}

/// Flush the memtable on its age/size triggers, run compaction steps, and
/// push batched fsyncs. One long-lived task per node.
fn spawn_storage_maintenance(
    engine: Arc<LsmEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }

            if engine.needs_flush() {
                match engine.flush() {
                    Ok(()) => meridian_metrics::metrics().memtable_flushes.inc(),
                    Err(e) => tracing::error!(error = %e, "memtable flush failed"),
                }
            }
            loop {
                match engine.compact_once() {
                    Ok(true) => {
                        meridian_metrics::metrics().compactions.inc();
                    }
                    Ok(false) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "compaction failed");
                        break;
                    }
                }
            }
            if let Err(e) = engine.sync() {
                tracing::error!(error = %e, "wal sync failed");
            }
        }
        tracing::debug!("storage maintenance stopped");
    })
}
