//! Configuration schema and loader for meridian nodes.
//!
//! Every recognized option is an explicit field here, validated at load time.
//! There are no hidden defaults anywhere else in the codebase.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// How replicas resolve conflicting versions of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    /// Last-write-wins by `(lamport_ts, origin)`.
    Lww,
    /// Version vectors; concurrent writes surface as siblings.
    Vector,
    /// Values are CRDT states; conflicts merge deterministically.
    Crdt,
}

/// How keys map to partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStrategy {
    /// Consistent hash ring with virtual nodes.
    Hash,
    /// Ordered contiguous key ranges.
    Range,
}

/// Transaction locking discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxLockStrategy {
    /// Validate the read set at commit; no locks while the tx runs.
    Optimistic,
    /// Two-phase row locks; `GetForUpdate` blocks conflicting writers.
    #[serde(rename = "2pl")]
    TwoPhase,
}

/// A peer node this node replicates with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Stable node name; the 160-bit node id is derived from it.
    pub name: String,
    /// gRPC listen address of the peer.
    pub addr: SocketAddr,
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable name of this node (e.g. "node-a"). Identity, ring tokens, and
    /// replication op ids all derive from it, so it must survive restarts.
    pub name: String,

    /// This node's gRPC listen address.
    pub listen: SocketAddr,

    /// All peer nodes (excluding this node).
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub partitioning: PartitioningConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub transactions: TxConfig,

    /// Fields to maintain local secondary indexes over (values must be JSON
    /// objects for indexing to apply).
    #[serde(default)]
    pub index_fields: Vec<String>,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Replication factor (N).
    #[serde(default = "default_n")]
    pub replication_factor: usize,

    /// Write quorum (W).
    #[serde(default = "default_quorum")]
    pub write_quorum: usize,

    /// Read quorum (R).
    #[serde(default = "default_quorum")]
    pub read_quorum: usize,

    /// Conflict resolution mode, fixed at node construction.
    #[serde(default = "default_consistency_mode")]
    pub consistency_mode: ConsistencyMode,

    /// Read/write fan-out deadline in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Heartbeat ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Missed-reply window before a peer turns Suspect, in milliseconds.
    #[serde(default = "default_suspect_timeout_ms")]
    pub suspect_timeout_ms: u64,

    /// Window before a Suspect peer turns Dead, in milliseconds.
    #[serde(default = "default_dead_timeout_ms")]
    pub dead_timeout_ms: u64,

    /// Hint delivery check interval in milliseconds.
    #[serde(default = "default_hinted_handoff_interval_ms")]
    pub hinted_handoff_interval_ms: u64,

    /// Anti-entropy round interval in milliseconds.
    #[serde(default = "default_anti_entropy_interval_ms")]
    pub anti_entropy_interval_ms: u64,

    /// Number of Merkle segments the keyspace is divided into.
    #[serde(default = "default_merkle_segments")]
    pub merkle_segments: usize,

    /// Replication sender pass interval in milliseconds.
    #[serde(default = "default_sender_interval_ms")]
    pub sender_interval_ms: u64,

    /// Maximum ops per Replicate / FetchUpdates batch.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Whether to perform async read repair.
    #[serde(default = "default_true")]
    pub read_repair: bool,

    /// Whether to store hints for unreachable replicas.
    #[serde(default = "default_true")]
    pub hinted_handoff: bool,

    /// Shuffle the preference list before reads.
    #[serde(default)]
    pub load_balance_reads: bool,

    /// Forward misrouted client requests to the owner instead of replying
    /// NotOwner.
    #[serde(default)]
    pub enable_forwarding: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_n(),
            write_quorum: default_quorum(),
            read_quorum: default_quorum(),
            consistency_mode: default_consistency_mode(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            suspect_timeout_ms: default_suspect_timeout_ms(),
            dead_timeout_ms: default_dead_timeout_ms(),
            hinted_handoff_interval_ms: default_hinted_handoff_interval_ms(),
            anti_entropy_interval_ms: default_anti_entropy_interval_ms(),
            merkle_segments: default_merkle_segments(),
            sender_interval_ms: default_sender_interval_ms(),
            max_batch_size: default_max_batch_size(),
            read_repair: true,
            hinted_handoff: true,
            load_balance_reads: false,
            enable_forwarding: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitioningConfig {
    /// Hash ring or ordered ranges.
    #[serde(default = "default_partition_strategy")]
    pub strategy: PartitionStrategy,

    /// Virtual-node tokens per physical node (hash strategy).
    #[serde(default = "default_partitions_per_node")]
    pub partitions_per_node: usize,

    /// Ceiling on the number of partitions automatic hot-splits may create.
    /// Range strategy starts from `key_ranges` (or one partition) and
    /// grows toward this bound.
    #[serde(default = "default_num_partitions")]
    pub num_partitions: usize,

    /// Explicit range boundaries (range strategy). Overrides
    /// `num_partitions` when present; must be ordered.
    #[serde(default)]
    pub key_ranges: Vec<String>,

    /// Bytes/second ceiling for partition transfers during
    /// add/remove/rebalance. 0 disables throttling.
    #[serde(default)]
    pub max_transfer_rate: u64,
}

impl Default for PartitioningConfig {
    fn default() -> Self {
        Self {
            strategy: default_partition_strategy(),
            partitions_per_node: default_partitions_per_node(),
            num_partitions: default_num_partitions(),
            key_ranges: Vec::new(),
            max_transfer_rate: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for WAL segments, SSTables, and replication state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,

    /// Memtable entry count that triggers a flush.
    #[serde(default = "default_memtable_threshold")]
    pub memtable_threshold: usize,

    /// Seconds after which a non-empty memtable is flushed regardless of
    /// size.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Number of L0 tables that triggers compaction into L1.
    #[serde(default = "default_l0_file_limit")]
    pub l0_file_limit: usize,

    /// Growth factor of the per-level size bound.
    #[serde(default = "default_level_size_ratio")]
    pub level_size_ratio: u64,

    /// Seconds a tombstone survives bottom-level compaction. Must exceed the
    /// worst-case node downtime plus one anti-entropy interval, or deleted
    /// keys can resurface.
    #[serde(default = "default_tombstone_retention_secs")]
    pub tombstone_retention_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
            memtable_threshold: default_memtable_threshold(),
            flush_interval_secs: default_flush_interval_secs(),
            l0_file_limit: default_l0_file_limit(),
            level_size_ratio: default_level_size_ratio(),
            tombstone_retention_secs: default_tombstone_retention_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxConfig {
    /// Optimistic validation or 2PL row locks.
    #[serde(default = "default_tx_lock_strategy")]
    pub lock_strategy: TxLockStrategy,

    /// Row-lock wait budget in milliseconds; expiry resolves deadlocks.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            lock_strategy: default_tx_lock_strategy(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

// --- Defaults ---

fn default_n() -> usize {
    3
}
fn default_quorum() -> usize {
    2
}
fn default_consistency_mode() -> ConsistencyMode {
    ConsistencyMode::Lww
}
fn default_rpc_timeout_ms() -> u64 {
    5000
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_suspect_timeout_ms() -> u64 {
    5000
}
fn default_dead_timeout_ms() -> u64 {
    15_000
}
fn default_hinted_handoff_interval_ms() -> u64 {
    10_000
}
fn default_anti_entropy_interval_ms() -> u64 {
    30_000
}
fn default_merkle_segments() -> usize {
    16
}
fn default_sender_interval_ms() -> u64 {
    500
}
fn default_max_batch_size() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_partition_strategy() -> PartitionStrategy {
    PartitionStrategy::Hash
}
fn default_partitions_per_node() -> usize {
    8
}
fn default_num_partitions() -> usize {
    16
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}
fn default_memtable_threshold() -> usize {
    4096
}
fn default_flush_interval_secs() -> u64 {
    300
}
fn default_l0_file_limit() -> usize {
    4
}
fn default_level_size_ratio() -> u64 {
    10
}
fn default_tombstone_retention_secs() -> u64 {
    86_400
}
fn default_tx_lock_strategy() -> TxLockStrategy {
    TxLockStrategy::Optimistic
}
fn default_lock_timeout_ms() -> u64 {
    5000
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".into()));
        }
        let r = &self.replication;
        if r.replication_factor == 0 {
            return Err(ConfigError::Invalid(
                "replication.replication_factor must be > 0".into(),
            ));
        }
        if r.write_quorum == 0 || r.write_quorum > r.replication_factor {
            return Err(ConfigError::Invalid(format!(
                "replication.write_quorum ({}) must be in 1..=replication_factor ({})",
                r.write_quorum, r.replication_factor
            )));
        }
        if r.read_quorum == 0 || r.read_quorum > r.replication_factor {
            return Err(ConfigError::Invalid(format!(
                "replication.read_quorum ({}) must be in 1..=replication_factor ({})",
                r.read_quorum, r.replication_factor
            )));
        }
        if r.suspect_timeout_ms >= r.dead_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "replication.suspect_timeout_ms ({}) must be < dead_timeout_ms ({})",
                r.suspect_timeout_ms, r.dead_timeout_ms
            )));
        }
        if r.merkle_segments == 0 {
            return Err(ConfigError::Invalid(
                "replication.merkle_segments must be > 0".into(),
            ));
        }
        if r.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "replication.max_batch_size must be > 0".into(),
            ));
        }
        let p = &self.partitioning;
        match p.strategy {
            PartitionStrategy::Hash => {
                if p.partitions_per_node == 0 {
                    return Err(ConfigError::Invalid(
                        "partitioning.partitions_per_node must be > 0".into(),
                    ));
                }
                if !p.key_ranges.is_empty() {
                    return Err(ConfigError::Invalid(
                        "partitioning.key_ranges only applies to the range strategy".into(),
                    ));
                }
            }
            PartitionStrategy::Range => {
                if p.key_ranges.is_empty() && p.num_partitions == 0 {
                    return Err(ConfigError::Invalid(
                        "partitioning.num_partitions must be > 0 (or set key_ranges)".into(),
                    ));
                }
                let mut prev: Option<&String> = None;
                for boundary in &p.key_ranges {
                    if let Some(p) = prev {
                        if boundary <= p {
                            return Err(ConfigError::Invalid(
                                "partitioning.key_ranges must be strictly increasing".into(),
                            ));
                        }
                    }
                    prev = Some(boundary);
                }
            }
        }
        let s = &self.storage;
        if s.memtable_threshold == 0 {
            return Err(ConfigError::Invalid(
                "storage.memtable_threshold must be > 0".into(),
            ));
        }
        if s.l0_file_limit == 0 {
            return Err(ConfigError::Invalid(
                "storage.l0_file_limit must be > 0".into(),
            ));
        }
        if s.level_size_ratio < 2 {
            return Err(ConfigError::Invalid(
                "storage.level_size_ratio must be >= 2".into(),
            ));
        }
        if !matches!(s.fsync.as_str(), "always" | "batch" | "none") {
            return Err(ConfigError::Invalid(format!(
                "storage.fsync must be one of always/batch/none, got {:?}",
                s.fsync
            )));
        }
        for peer in &self.peers {
            if peer.name == self.name {
                return Err(ConfigError::Invalid(format!(
                    "peer {:?} has the same name as this node",
                    peer.name
                )));
            }
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
