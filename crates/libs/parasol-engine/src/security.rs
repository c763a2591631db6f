//! Inbound packet vetting: origin, TTL, freshness and duplicates.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parasol_crypto::{CryptoError, Keyring};
use parasol_wire::{Packet, PeerId};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::now_ms;

/// Why a packet was refused before any handler saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketReject {
    #[error("echo of our own packet")]
    SelfOrigin,
    #[error("ttl exhausted before reaching its recipient")]
    ExpiredTtl,
    #[error("empty payload")]
    EmptyPayload,
    #[error("timestamp outside the accept window")]
    StaleTimestamp,
    #[error("already processed")]
    Duplicate,
}

struct SecurityState {
    processed_messages: HashMap<String, Instant>,
    message_order: VecDeque<String>,
    processed_exchanges: HashSet<String>,
    exchange_order: VecDeque<String>,
}

/// Gatekeeper every received packet passes through exactly once.
///
/// Duplicate detection is keyed on timestamp, sender and a payload
/// digest, so the same packet arriving over two relay paths is counted
/// once. Key exchanges get their own dedup record so a replayed bundle
/// cannot re-trigger the handshake dance.
pub struct SecurityManager {
    own_peer: PeerId,
    keyring: Arc<Keyring>,
    window: Duration,
    max_messages: usize,
    max_exchanges: usize,
    state: Mutex<SecurityState>,
}

impl SecurityManager {
    pub fn new(own_peer: PeerId, keyring: Arc<Keyring>, config: &EngineConfig) -> Self {
        Self {
            own_peer,
            keyring,
            window: config.dedup_window,
            max_messages: config.max_processed_messages,
            max_exchanges: config.max_processed_exchanges,
            state: Mutex::new(SecurityState {
                processed_messages: HashMap::new(),
                message_order: VecDeque::new(),
                processed_exchanges: HashSet::new(),
                exchange_order: VecDeque::new(),
            }),
        }
    }

    /// Runs the full acceptance gauntlet and records the packet as seen.
    ///
    /// A TTL of zero still passes when the packet is addressed to us
    /// directly; it has arrived and needs no further hops. Checking and
    /// recording the dedup id happen under one lock so two copies racing
    /// in cannot both pass.
    pub async fn validate_packet(&self, packet: &Packet) -> Result<(), PacketReject> {
        if packet.sender == self.own_peer {
            return Err(PacketReject::SelfOrigin);
        }
        if packet.ttl == 0 && packet.recipient != Some(self.own_peer) {
            return Err(PacketReject::ExpiredTtl);
        }
        if packet.payload.is_empty() {
            return Err(PacketReject::EmptyPayload);
        }
        if now_ms().abs_diff(packet.timestamp) > self.window.as_millis() as u64 {
            return Err(PacketReject::StaleTimestamp);
        }

        let id = dedup_id(packet);
        let mut state = self.state.lock().await;
        if state.processed_messages.contains_key(&id) {
            return Err(PacketReject::Duplicate);
        }
        state.processed_messages.insert(id.clone(), Instant::now());
        state.message_order.push_back(id);
        while state.processed_messages.len() > self.max_messages {
            match state.message_order.pop_front() {
                Some(oldest) => {
                    state.processed_messages.remove(&oldest);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Installs the keys from a key exchange payload.
    ///
    /// Returns `Ok(true)` only for a first-seen, successfully installed
    /// bundle; echoes of our own exchange, empty payloads and replays all
    /// come back `Ok(false)`. The exchange is recorded as seen before the
    /// install so a bad bundle is not retried on every copy.
    pub async fn handle_key_exchange(&self, packet: &Packet) -> Result<bool, CryptoError> {
        if packet.sender == self.own_peer || packet.payload.is_empty() {
            return Ok(false);
        }

        let id = exchange_id(packet);
        {
            let mut state = self.state.lock().await;
            if !state.processed_exchanges.insert(id.clone()) {
                return Ok(false);
            }
            state.exchange_order.push_back(id);
            while state.processed_exchanges.len() > self.max_exchanges {
                match state.exchange_order.pop_front() {
                    Some(oldest) => {
                        state.processed_exchanges.remove(&oldest);
                    }
                    None => break,
                }
            }
        }

        self.keyring
            .add_peer_public_key(packet.sender, &packet.payload)?;
        Ok(true)
    }

    /// Unsigned packets pass; signed packets must verify against the
    /// sender's known signing key.
    pub fn verify_signature(&self, packet: &Packet) -> bool {
        match &packet.signature {
            None => true,
            Some(signature) => self.keyring.verify(signature, &packet.payload, packet.sender),
        }
    }

    /// Expires dedup records older than the accept window.
    pub async fn sweep(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let window = self.window;
        let before = state.processed_messages.len();
        state
            .processed_messages
            .retain(|_, seen| seen.elapsed() <= window);
        let expired = before - state.processed_messages.len();
        if expired > 0 {
            let processed = &state.processed_messages;
            state.message_order.retain(|id| processed.contains_key(id));
            log::debug!("security: expired {expired} dedup records");
        }
    }

    /// How many message dedup records are currently held.
    pub async fn tracked_messages(&self) -> usize {
        self.state.lock().await.processed_messages.len()
    }
}

/// Dedup identity of a packet.
///
/// Fragments of one group share timestamp and sender and differ only in
/// payload, so they hash the whole payload and mix in the type byte.
/// Everything else hashes a 64 byte payload prefix, enough to tell
/// messages apart without digesting bulk data twice.
fn dedup_id(packet: &Packet) -> String {
    let sender = hex::encode(packet.sender.as_bytes());
    let is_fragment = matches!(packet.known_type(), Ok(t) if t.is_fragment());
    if is_fragment {
        let digest = Sha256::digest(&packet.payload);
        format!(
            "{}-{sender}-{:02x}-{}",
            packet.timestamp,
            packet.packet_type,
            hex::encode(&digest[..8])
        )
    } else {
        let prefix = &packet.payload[..packet.payload.len().min(64)];
        let digest = Sha256::digest(prefix);
        format!("{}-{sender}-{}", packet.timestamp, hex::encode(&digest[..8]))
    }
}

/// Dedup identity of a key exchange, keyed on the bundle prefix so the
/// same bundle replayed later is still recognized.
fn exchange_id(packet: &Packet) -> String {
    let prefix = &packet.payload[..packet.payload.len().min(16)];
    let digest = Sha256::digest(prefix);
    format!(
        "{}-{}",
        hex::encode(packet.sender.as_bytes()),
        hex::encode(&digest[..8])
    )
}
