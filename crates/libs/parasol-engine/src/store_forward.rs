//! Caching addressed packets for peers that are currently offline.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parasol_wire::{Packet, PacketType, PeerId};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::traits::FavoritePolicy;

struct CachedPacket {
    packet: Packet,
    message_id: String,
    cached_at: Instant,
}

struct CacheState {
    /// Per-recipient queues for favorites; retained until delivered.
    favorite_queues: HashMap<PeerId, VecDeque<CachedPacket>>,
    /// Shared queue for everyone else; entries age out.
    ordinary: VecDeque<CachedPacket>,
    delivered: HashSet<String>,
    flushed_to: HashSet<PeerId>,
}

/// Store-and-forward cache.
///
/// Messages for favorite peers wait in a roomy per-peer queue with no
/// age limit; everyone else shares one small queue whose entries expire
/// after [`EngineConfig::cached_message_ttl`]. Each peer is flushed at
/// most once per process run.
pub struct StoreForward {
    favorite_cap: usize,
    ordinary_cap: usize,
    message_ttl: Duration,
    max_delivered: usize,
    max_flushed: usize,
    favorites: Arc<dyn FavoritePolicy>,
    state: Mutex<CacheState>,
}

impl StoreForward {
    pub fn new(favorites: Arc<dyn FavoritePolicy>, config: &EngineConfig) -> Self {
        Self {
            favorite_cap: config.favorite_queue_cap,
            ordinary_cap: config.ordinary_queue_cap,
            message_ttl: config.cached_message_ttl,
            max_delivered: config.max_delivered_bookkeeping,
            max_flushed: config.max_flushed_bookkeeping,
            favorites,
            state: Mutex::new(CacheState {
                favorite_queues: HashMap::new(),
                ordinary: VecDeque::new(),
                delivered: HashSet::new(),
                flushed_to: HashSet::new(),
            }),
        }
    }

    /// Queues a packet for later delivery to its recipient.
    ///
    /// Mesh management packets and anything without a direct recipient
    /// are never cached. Full queues drop their oldest entry.
    pub async fn cache_packet(&self, packet: Packet, message_id: String) {
        if matches!(
            packet.known_type(),
            Ok(PacketType::Announce | PacketType::Leave | PacketType::KeyExchange)
        ) {
            return;
        }
        let recipient = match packet.recipient {
            Some(recipient) if !recipient.is_broadcast() => recipient,
            _ => return,
        };

        let entry = CachedPacket {
            packet,
            message_id,
            cached_at: Instant::now(),
        };

        let mut state = self.state.lock().await;
        if self.favorites.is_favorite(&recipient) {
            let queue = state.favorite_queues.entry(recipient).or_default();
            if queue.len() >= self.favorite_cap {
                queue.pop_front();
            }
            queue.push_back(entry);
            log::debug!("storeforward: cached for favorite {recipient}");
        } else {
            if state.ordinary.len() >= self.ordinary_cap {
                state.ordinary.pop_front();
            }
            state.ordinary.push_back(entry);
            log::debug!("storeforward: cached for {recipient}");
        }
    }

    /// Hands back everything waiting for `peer`, oldest first.
    ///
    /// Only the first call per peer returns anything; the peer is marked
    /// flushed up front so overlapping handshakes cannot double-send.
    /// Returned messages are marked delivered and leave the cache.
    pub async fn flush_for(&self, peer: PeerId) -> Vec<Packet> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.flushed_to.insert(peer) {
            return Vec::new();
        }

        let mut collected: Vec<CachedPacket> = state
            .favorite_queues
            .remove(&peer)
            .map(Vec::from)
            .unwrap_or_default();

        let mut remaining = VecDeque::new();
        while let Some(entry) = state.ordinary.pop_front() {
            if entry.packet.recipient == Some(peer) {
                collected.push(entry);
            } else {
                remaining.push_back(entry);
            }
        }
        state.ordinary = remaining;

        collected.retain(|entry| !state.delivered.contains(&entry.message_id));
        collected.sort_by_key(|entry| entry.cached_at);

        let packets: Vec<Packet> = collected
            .into_iter()
            .map(|entry| {
                state.delivered.insert(entry.message_id);
                entry.packet
            })
            .collect();
        if !packets.is_empty() {
            log::info!("storeforward: flushing {} cached messages to {peer}", packets.len());
        }
        packets
    }

    /// Expires aged ordinary entries and trims the bookkeeping sets.
    pub async fn sweep(&self) {
        let mut state = self.state.lock().await;
        let ttl = self.message_ttl;
        let before = state.ordinary.len();
        state.ordinary.retain(|entry| entry.cached_at.elapsed() <= ttl);
        let expired = before - state.ordinary.len();
        if expired > 0 {
            log::debug!("storeforward: expired {expired} cached messages");
        }
        if state.delivered.len() > self.max_delivered {
            state.delivered.clear();
        }
        if state.flushed_to.len() > self.max_flushed {
            state.flushed_to.clear();
        }
    }

    /// Total entries currently cached across all queues.
    pub async fn cached_count(&self) -> usize {
        let state = self.state.lock().await;
        let favorites: usize = state.favorite_queues.values().map(VecDeque::len).sum();
        favorites + state.ordinary.len()
    }
}
