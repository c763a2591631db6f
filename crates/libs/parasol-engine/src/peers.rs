//! Directory of peers currently on the mesh.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parasol_wire::PeerId;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::events::{EventSink, MeshEvent};

/// What we know about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub nickname: String,
    pub last_seen: Instant,
    pub rssi: Option<i16>,
    /// Whether the peer has announced itself, as opposed to being known
    /// only from a message it sent.
    pub announced: bool,
}

struct PeerState {
    peers: HashMap<PeerId, PeerRecord>,
    /// Peers we already announced ourselves back to during a handshake.
    announced_to: HashSet<PeerId>,
}

/// Tracks active peers and raises connect, disconnect and list events.
///
/// Records go stale after [`EngineConfig::peer_stale_after`] without
/// traffic and are evicted by [`PeerTable::sweep`]. A device that
/// reconnects under a fresh peer id but the same nickname leaves a ghost
/// record behind; announces evict those quietly once they are old enough.
pub struct PeerTable {
    own_peer: PeerId,
    stale_after: Duration,
    nickname_eviction_age: Duration,
    events: EventSink,
    state: Mutex<PeerState>,
}

impl PeerTable {
    pub fn new(own_peer: PeerId, events: EventSink, config: &EngineConfig) -> Self {
        Self {
            own_peer,
            stale_after: config.peer_stale_after,
            nickname_eviction_age: config.nickname_eviction_age,
            events,
            state: Mutex::new(PeerState {
                peers: HashMap::new(),
                announced_to: HashSet::new(),
            }),
        }
    }

    /// Records an announce from `peer`. Returns true for the first
    /// announce of this peer, which is when the connect event fires.
    pub async fn add_or_update_peer(&self, peer: PeerId, nickname: &str) -> bool {
        if peer.is_unknown() || peer == self.own_peer {
            return false;
        }

        let mut state = self.state.lock().await;

        let ghosts: Vec<PeerId> = state
            .peers
            .iter()
            .filter(|(id, record)| {
                **id != peer
                    && record.nickname == nickname
                    && record.last_seen.elapsed() > self.nickname_eviction_age
            })
            .map(|(id, _)| *id)
            .collect();
        for ghost in ghosts {
            state.peers.remove(&ghost);
            state.announced_to.remove(&ghost);
            log::debug!("peers: evicted ghost {ghost} for nickname {nickname:?}");
        }

        let first_announce = match state.peers.get_mut(&peer) {
            Some(record) => {
                let first = !record.announced;
                record.nickname = nickname.to_string();
                record.last_seen = Instant::now();
                record.announced = true;
                first
            }
            None => {
                state.peers.insert(
                    peer,
                    PeerRecord {
                        nickname: nickname.to_string(),
                        last_seen: Instant::now(),
                        rssi: None,
                        announced: true,
                    },
                );
                true
            }
        };

        if first_announce {
            let active = sorted_peers(&state.peers);
            drop(state);
            log::info!("peers: {peer} connected as {nickname:?}");
            self.events.emit(MeshEvent::PeerConnected {
                peer,
                nickname: nickname.to_string(),
            });
            self.events.emit(MeshEvent::PeerListUpdated(active));
        }
        first_announce
    }

    /// Learns a nickname from message traffic without treating it as an
    /// announce. No events fire from this path.
    pub async fn note_nickname(&self, peer: PeerId, nickname: &str) {
        if peer.is_unknown() || peer == self.own_peer {
            return;
        }
        let mut state = self.state.lock().await;
        match state.peers.get_mut(&peer) {
            Some(record) => {
                record.nickname = nickname.to_string();
                record.last_seen = Instant::now();
            }
            None => {
                state.peers.insert(
                    peer,
                    PeerRecord {
                        nickname: nickname.to_string(),
                        last_seen: Instant::now(),
                        rssi: None,
                        announced: false,
                    },
                );
            }
        }
    }

    /// Refreshes the liveness clock of an already known peer.
    pub async fn update_last_seen(&self, peer: PeerId) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.peers.get_mut(&peer) {
            record.last_seen = Instant::now();
        }
    }

    /// Stores the latest signal strength reading for a known peer.
    pub async fn update_rssi(&self, peer: PeerId, rssi: i16) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.peers.get_mut(&peer) {
            record.rssi = Some(rssi);
        }
    }

    /// Removes a peer, returning its nickname if it was known. This is
    /// the only place a disconnect event for an explicit leave fires.
    pub async fn remove_peer(&self, peer: PeerId) -> Option<String> {
        let mut state = self.state.lock().await;
        state.announced_to.remove(&peer);
        let removed = state.peers.remove(&peer);
        match removed {
            Some(record) => {
                let active = sorted_peers(&state.peers);
                drop(state);
                log::info!("peers: {peer} left ({:?})", record.nickname);
                self.events.emit(MeshEvent::PeerDisconnected {
                    peer,
                    nickname: Some(record.nickname.clone()),
                });
                self.events.emit(MeshEvent::PeerListUpdated(active));
                Some(record.nickname)
            }
            None => None,
        }
    }

    /// Marks that we answered `peer`'s handshake with our own announce.
    /// Returns false when that already happened.
    pub async fn mark_announced_to(&self, peer: PeerId) -> bool {
        self.state.lock().await.announced_to.insert(peer)
    }

    pub async fn has_announced_to(&self, peer: PeerId) -> bool {
        self.state.lock().await.announced_to.contains(&peer)
    }

    pub async fn peer_record(&self, peer: PeerId) -> Option<PeerRecord> {
        self.state.lock().await.peers.get(&peer).cloned()
    }

    pub async fn all_nicknames(&self) -> HashMap<PeerId, String> {
        let state = self.state.lock().await;
        state
            .peers
            .iter()
            .map(|(id, record)| (*id, record.nickname.clone()))
            .collect()
    }

    pub async fn active_peers(&self) -> Vec<PeerId> {
        sorted_peers(&self.state.lock().await.peers)
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn is_active(&self, peer: PeerId) -> bool {
        self.state.lock().await.peers.contains_key(&peer)
    }

    /// Evicts peers unseen past the stale threshold, raising a disconnect
    /// per eviction and a single list update at the end.
    pub async fn sweep(&self) {
        let mut state = self.state.lock().await;
        let stale: Vec<(PeerId, String)> = state
            .peers
            .iter()
            .filter(|(_, record)| record.last_seen.elapsed() > self.stale_after)
            .map(|(id, record)| (*id, record.nickname.clone()))
            .collect();
        if stale.is_empty() {
            return;
        }
        for (peer, _) in &stale {
            state.peers.remove(peer);
            state.announced_to.remove(peer);
        }
        let active = sorted_peers(&state.peers);
        drop(state);

        for (peer, nickname) in stale {
            log::info!("peers: {peer} timed out ({nickname:?})");
            self.events.emit(MeshEvent::PeerDisconnected {
                peer,
                nickname: Some(nickname),
            });
        }
        self.events.emit(MeshEvent::PeerListUpdated(active));
    }
}

fn sorted_peers(peers: &HashMap<PeerId, PeerRecord>) -> Vec<PeerId> {
    let mut active: Vec<PeerId> = peers.keys().copied().collect();
    active.sort();
    active
}
