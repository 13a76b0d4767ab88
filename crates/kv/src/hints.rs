//! Durable hinted handoff.
//!
//! When a write cannot reach an owner, the coordinator (or a sloppy-quorum
//! substitute) queues the record under the owner's id at
//! `hints/<owner_hex>.log`. A background worker drains a queue when the
//! heartbeat reports its owner Live again, deleting each hint only after
//! the owner acknowledged it. Hinted records never enter the local engine,
//! so anti-entropy digests exclude them and divergence does not loop.

use crate::heartbeat::{FailureDetector, PeerStatus};
use crate::peer::{PeerClient, PeerDirectory};
use meridian_common::NodeId;
use meridian_storage::Record;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hint {
    pub record: Record,
    pub created_at_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum HintError {
    #[error("hint store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hint store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Per-destination durable hint queues.
#[derive(Debug)]
pub struct HintStore {
    dir: PathBuf,
    queues: Mutex<HashMap<NodeId, Vec<Hint>>>,
}

impl HintStore {
    /// Open the store, loading any queues persisted under `dir`.
    pub fn open(dir: &Path) -> Result<Self, HintError> {
        std::fs::create_dir_all(dir)?;
        let mut queues = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(hex) = name.to_string_lossy().strip_suffix(".log").map(String::from) else {
                continue;
            };
            let Ok(target) = NodeId::from_hex(&hex) else {
                continue;
            };
            let contents = std::fs::read_to_string(entry.path())?;
            let hints: Vec<Hint> = contents
                .lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect();
            if !hints.is_empty() {
                queues.insert(target, hints);
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            queues: Mutex::new(queues),
        })
    }

    fn queue_path(&self, target: &NodeId) -> PathBuf {
        self.dir.join(format!("{}.log", target.hex()))
    }

    /// Queue a record for an unreachable owner.
    pub fn store_hint(&self, target: NodeId, record: Record) -> Result<(), HintError> {
        let hint = Hint {
            created_at_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            record,
        };

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.queue_path(&target))?;
        let mut line = serde_json::to_vec(&hint)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_all()?;

        self.queues
            .lock()
            .expect("hint queues lock")
            .entry(target)
            .or_default()
            .push(hint);
        Ok(())
    }

    /// Pending hints for one destination, oldest first.
    pub fn hints_for(&self, target: &NodeId) -> Vec<Hint> {
        self.queues
            .lock()
            .expect("hint queues lock")
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    /// Destinations that currently have pending hints.
    pub fn targets(&self) -> Vec<NodeId> {
        self.queues
            .lock()
            .expect("hint queues lock")
            .keys()
            .copied()
            .collect()
    }

    pub fn total_hints(&self) -> usize {
        self.queues
            .lock()
            .expect("hint queues lock")
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Remove one delivered hint (matched by op id) and rewrite the queue
    /// file. A hint is deleted only after successful delivery.
    pub fn mark_delivered(&self, target: &NodeId, record: &Record) -> Result<(), HintError> {
        let mut queues = self.queues.lock().expect("hint queues lock");
        let Some(queue) = queues.get_mut(target) else {
            return Ok(());
        };
        let op_id = record.meta.op_id();
        if let Some(pos) = queue.iter().position(|h| h.record.meta.op_id() == op_id) {
            queue.remove(pos);
        }

        let path = self.queue_path(target);
        if queue.is_empty() {
            queues.remove(target);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(HintError::Io(e)),
            }
            return Ok(());
        }

        let tmp = path.with_extension("tmp");
        let mut out = Vec::new();
        for hint in queue.iter() {
            out.extend(serde_json::to_vec(hint)?);
            out.push(b'\n');
        }
        std::fs::write(&tmp, out)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Delivery task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HintDeliveryConfig {
    /// Fallback scan interval; Live transitions trigger delivery sooner.
    pub check_interval: Duration,
    /// Maximum hints pushed per cycle.
    pub max_hints_per_cycle: usize,
}

impl Default for HintDeliveryConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            max_hints_per_cycle: 100,
        }
    }
}

/// Spawn the hint delivery worker. Wakes on the interval and on every
/// peer-status event; drains queues whose destination is Live.
pub fn spawn_hint_delivery_task<C: PeerClient>(
    hints: Arc<HintStore>,
    detector: Arc<FailureDetector>,
    directory: Arc<PeerDirectory>,
    client: Arc<C>,
    config: HintDeliveryConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = detector.subscribe();
        let mut tick = tokio::time::interval(config.check_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                event = events.recv() => {
                    match event {
                        Ok(e) if e.status == PeerStatus::Live => {}
                        Ok(_) => continue,
                        Err(_) => continue,
                    }
                }
                _ = shutdown.changed() => break,
            }
            deliver_hints(
                &hints,
                &detector,
                &directory,
                &client,
                config.max_hints_per_cycle,
            )
            .await;
        }
        tracing::debug!("hint delivery task stopped");
    })
}

/// One delivery cycle.
pub async fn deliver_hints<C: PeerClient>(
    hints: &Arc<HintStore>,
    detector: &Arc<FailureDetector>,
    directory: &Arc<PeerDirectory>,
    client: &Arc<C>,
    max_hints: usize,
) {
    let mut delivered = 0usize;

    for target in hints.targets() {
        if delivered >= max_hints {
            break;
        }
        if detector.status(&target) != PeerStatus::Live {
            continue;
        }
        let Some(peer) = directory.get(&target) else {
            tracing::debug!(target = %target, "hint target not in directory; skipping");
            continue;
        };

        for hint in hints.hints_for(&target) {
            if delivered >= max_hints {
                break;
            }
            match client.put_record(&peer, &hint.record, None).await {
                Ok(_) => {
                    if let Err(e) = hints.mark_delivered(&target, &hint.record) {
                        tracing::warn!(error = %e, "failed to delete delivered hint");
                    }
                    delivered += 1;
                    meridian_metrics::metrics().hints_delivered.inc();
                }
                Err(e) => {
                    tracing::debug!(target = %peer.name, error = %e, "hint delivery failed; will retry");
                    break;
                }
            }
        }
    }

    if delivered > 0 {
        tracing::info!(delivered, "hint delivery cycle complete");
    }
}
