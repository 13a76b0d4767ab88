//! Heartbeat pinger and failure detector.
//!
//! Every node pings each peer on a fixed interval. A peer with a recent
//! reply is Live; one silent past `suspect_timeout` turns Suspect, past
//! `dead_timeout` Dead; any reply resets to Live. Transitions are published
//! on a broadcast hub consumed by hint delivery, the coordinator, and
//! anti-entropy, never via direct callbacks.

use crate::peer::{PeerClient, PeerDirectory};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use meridian_common::NodeId;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

/// Liveness classification of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Live,
    Suspect,
    Dead,
}

/// A published status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEvent {
    pub peer: NodeId,
    pub status: PeerStatus,
}

#[derive(Debug, Clone, Copy)]
struct PeerHealth {
    status: PeerStatus,
    last_reply: Option<Instant>,
    since: Instant,
}

#[derive(Debug)]
pub struct FailureDetector {
    peers: RwLock<HashMap<NodeId, PeerHealth>>,
    events: broadcast::Sender<PeerEvent>,
    suspect_timeout: Duration,
    dead_timeout: Duration,
}

impl FailureDetector {
    /// Peers start Suspect: they earn Live with their first reply.
    pub fn new(
        peers: impl IntoIterator<Item = NodeId>,
        suspect_timeout: Duration,
        dead_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        let (events, _) = broadcast::channel(64);
        Self {
            peers: RwLock::new(
                peers
                    .into_iter()
                    .map(|id| {
                        (
                            id,
                            PeerHealth {
                                status: PeerStatus::Suspect,
                                last_reply: None,
                                since: now,
                            },
                        )
                    })
                    .collect(),
            ),
            events,
            suspect_timeout,
            dead_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn track(&self, peer: NodeId) {
        self.peers
            .write()
            .expect("detector lock")
            .entry(peer)
            .or_insert(PeerHealth {
                status: PeerStatus::Suspect,
                last_reply: None,
                since: Instant::now(),
            });
    }

    pub fn forget(&self, peer: &NodeId) {
        self.peers.write().expect("detector lock").remove(peer);
    }

    pub fn status(&self, peer: &NodeId) -> PeerStatus {
        self.peers
            .read()
            .expect("detector lock")
            .get(peer)
            .map(|h| h.status)
            .unwrap_or(PeerStatus::Dead)
    }

    pub fn live_peers(&self) -> Vec<NodeId> {
        self.peers
            .read()
            .expect("detector lock")
            .iter()
            .filter(|(_, h)| h.status == PeerStatus::Live)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Record a reply; publishes a transition back to Live if needed.
    pub fn record_reply(&self, peer: NodeId) {
        let mut peers = self.peers.write().expect("detector lock");
        let now = Instant::now();
        let health = peers.entry(peer).or_insert(PeerHealth {
            status: PeerStatus::Suspect,
            last_reply: None,
            since: now,
        });
        health.last_reply = Some(now);
        if health.status != PeerStatus::Live {
            health.status = PeerStatus::Live;
            health.since = now;
            drop(peers);
            self.publish(peer, PeerStatus::Live);
        }
    }

    /// Advance the state machine on elapsed silence. Called once per ping
    /// round.
    pub fn sweep(&self) {
        let mut transitions = Vec::new();
        {
            let mut peers = self.peers.write().expect("detector lock");
            let now = Instant::now();
            for (id, health) in peers.iter_mut() {
                let silent_for = match health.last_reply {
                    Some(at) => now.duration_since(at),
                    None => now.duration_since(health.since),
                };
                let next = if silent_for >= self.dead_timeout {
                    PeerStatus::Dead
                } else if silent_for >= self.suspect_timeout {
                    PeerStatus::Suspect
                } else {
                    health.status
                };
                if next != health.status {
                    health.status = next;
                    health.since = now;
                    transitions.push((*id, next));
                }
            }
        }
        for (peer, status) in transitions {
            self.publish(peer, status);
        }
    }

    fn publish(&self, peer: NodeId, status: PeerStatus) {
        tracing::info!(peer = %peer, ?status, "peer status changed");
        let _ = self.events.send(PeerEvent { peer, status });
    }
}

/// Spawn the pinger: ping every peer each `interval`, record replies, then
/// sweep the detector.
pub fn spawn_heartbeat_task<C: PeerClient>(
    detector: std::sync::Arc<FailureDetector>,
    directory: std::sync::Arc<PeerDirectory>,
    client: std::sync::Arc<C>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }

            let peers = directory.all();
            let mut pings = FuturesUnordered::new();
            for peer in peers {
                let client = client.clone();
                pings.push(async move {
                    let outcome = client.ping(&peer).await;
                    (peer.id, outcome)
                });
            }
            while let Some((peer, outcome)) = pings.next().await {
                if outcome.is_ok() {
                    detector.record_reply(peer);
                }
            }
            detector.sweep();
        }
        tracing::debug!("heartbeat task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::from_name(name)
    }

    fn detector() -> FailureDetector {
        FailureDetector::new(
            [node("b"), node("c")],
            Duration::from_millis(50),
            Duration::from_millis(150),
        )
    }

    #[test]
    fn test_reply_makes_live() {
        let d = detector();
        assert_eq!(d.status(&node("b")), PeerStatus::Suspect);
        d.record_reply(node("b"));
        assert_eq!(d.status(&node("b")), PeerStatus::Live);
        assert_eq!(d.live_peers(), vec![node("b")]);
    }

    #[test]
    fn test_silence_degrades_live_to_suspect_to_dead() {
        let d = detector();
        d.record_reply(node("b"));

        std::thread::sleep(Duration::from_millis(60));
        d.sweep();
        assert_eq!(d.status(&node("b")), PeerStatus::Suspect);

        std::thread::sleep(Duration::from_millis(100));
        d.sweep();
        assert_eq!(d.status(&node("b")), PeerStatus::Dead);
    }

    #[test]
    fn test_reply_resets_dead_to_live() {
        let d = detector();
        std::thread::sleep(Duration::from_millis(160));
        d.sweep();
        assert_eq!(d.status(&node("b")), PeerStatus::Dead);

        d.record_reply(node("b"));
        assert_eq!(d.status(&node("b")), PeerStatus::Live);
    }

    #[test]
    fn test_transitions_are_published() {
        let d = detector();
        let mut events = d.subscribe();

        d.record_reply(node("b"));
        let event = events.try_recv().unwrap();
        assert_eq!(event.peer, node("b"));
        assert_eq!(event.status, PeerStatus::Live);

        std::thread::sleep(Duration::from_millis(160));
        d.sweep();
        let event = events.try_recv().unwrap();
        assert_eq!(event.status, PeerStatus::Dead);
    }

    #[test]
    fn test_unknown_peer_is_dead() {
        let d = detector();
        assert_eq!(d.status(&node("stranger")), PeerStatus::Dead);
    }

    #[test]
    fn test_track_and_forget() {
        let d = detector();
        d.track(node("d"));
        assert_eq!(d.status(&node("d")), PeerStatus::Suspect);
        d.forget(&node("d"));
        assert_eq!(d.status(&node("d")), PeerStatus::Dead);
    }
}
