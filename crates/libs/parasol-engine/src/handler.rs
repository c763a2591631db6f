//! Per-type packet handling and the flood control policy.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use parasol_crypto::{unpad, Keyring};
use parasol_wire::{
    ChatMessage, DeliveryAck, MessageContent, Packet, PacketType, PeerId, ReadReceipt,
};
use rand_core::{OsRng, RngCore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::events::{EventSink, MeshEvent};
use crate::now_ms;
use crate::peers::PeerTable;
use crate::security::SecurityManager;
use crate::traits::{ChannelCipher, Transport};

/// Content prefix marking cover traffic. Such messages are relayed like
/// any other but never surfaced and never acknowledged.
pub const COVER_TRAFFIC_MARKER: &str = "☂DUMMY☂";

/// Stand-in content for channel messages we hold no key for.
pub const ENCRYPTED_PLACEHOLDER: &str = "[Encrypted message - password required]";

/// Probability of relaying a packet given the current mesh size.
///
/// Small meshes relay everything; the larger the mesh, the more copies
/// of each packet are already in flight and the less each node needs to
/// add its own.
pub fn relay_probability(network_size: usize) -> f64 {
    match network_size {
        0..=10 => 1.0,
        11..=30 => 0.85,
        31..=50 => 0.7,
        51..=100 => 0.55,
        _ => 0.4,
    }
}

/// Relay decision for a packet whose TTL has already been decremented.
///
/// Packets still holding four or more hops always go out, as does
/// everything on a mesh of three nodes or fewer. Past that the `roll`
/// in `[0, 1)` is measured against [`relay_probability`].
pub fn should_relay(ttl_after_decrement: u8, network_size: usize, roll: f64) -> bool {
    ttl_after_decrement >= 4 || network_size <= 3 || roll < relay_probability(network_size)
}

/// Handles validated packets by type: delivery to the application,
/// acknowledgments, peer table upkeep and onward relaying.
pub struct MessageHandler {
    own_peer: PeerId,
    own_nickname: String,
    config: EngineConfig,
    keyring: Arc<Keyring>,
    peers: Arc<PeerTable>,
    security: Arc<SecurityManager>,
    transport: Arc<dyn Transport>,
    events: EventSink,
    channel_cipher: Arc<dyn ChannelCipher>,
    cancel: CancellationToken,
}

impl MessageHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        own_peer: PeerId,
        own_nickname: String,
        config: EngineConfig,
        keyring: Arc<Keyring>,
        peers: Arc<PeerTable>,
        security: Arc<SecurityManager>,
        transport: Arc<dyn Transport>,
        events: EventSink,
        channel_cipher: Arc<dyn ChannelCipher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            own_peer,
            own_nickname,
            config,
            keyring,
            peers,
            security,
            transport,
            events,
            channel_cipher,
            cancel,
        }
    }

    /// Records the announcing peer and forwards the announce one hop.
    /// Returns true when this was the peer's first announce.
    pub async fn handle_announce(&self, packet: &Packet) -> bool {
        let nickname = String::from_utf8_lossy(&packet.payload).to_string();
        let first = self.peers.add_or_update_peer(packet.sender, &nickname).await;

        // Announces flood with a decrement but without the probability
        // roll; the peer list only converges if they reach everyone.
        self.direct_relay(packet, Some(self.config.announce_relay_jitter.clone()));
        first
    }

    /// Routes a MESSAGE packet: broadcast delivery, private delivery or
    /// onward relay when it is addressed to somebody else.
    pub async fn handle_message(&self, packet: &Packet) {
        if packet.is_broadcast() {
            self.handle_broadcast(packet).await;
        } else if packet.recipient == Some(self.own_peer) {
            self.handle_private(packet).await;
        } else {
            self.relay(packet).await;
        }
    }

    async fn handle_broadcast(&self, packet: &Packet) {
        let mut message = match ChatMessage::decode(&packet.payload) {
            Ok(message) => message,
            Err(err) => {
                // Not ours to judge; another node may still decode it.
                log::debug!("handler: undecodable broadcast from {}: {err}", packet.sender);
                self.relay(packet).await;
                return;
            }
        };

        if let MessageContent::Plain(text) = &message.content {
            if text.starts_with(COVER_TRAFFIC_MARKER) {
                self.relay(packet).await;
                return;
            }
        }

        self.peers.note_nickname(packet.sender, &message.sender).await;

        if let (Some(channel), MessageContent::Encrypted(data)) =
            (&message.channel, &message.content)
        {
            message.content = match self.channel_cipher.decrypt_channel(data, channel) {
                Some(text) => MessageContent::Plain(text),
                None => MessageContent::Plain(ENCRYPTED_PLACEHOLDER.to_string()),
            };
        }

        message.sender_peer_id = Some(packet.sender.to_string());
        self.events.emit(MeshEvent::MessageReceived(message));

        self.relay(packet).await;
    }

    async fn handle_private(&self, packet: &Packet) {
        // A signature is optional on private messages, but a present one
        // has to verify against the sender's announced signing key.
        if packet.signature.is_some() && !self.security.verify_signature(packet) {
            log::warn!("handler: bad signature on private message from {}", packet.sender);
            return;
        }

        let decrypted = match self.keyring.decrypt(&packet.payload, packet.sender) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                log::debug!("handler: cannot decrypt private message from {}: {err}", packet.sender);
                return;
            }
        };
        let body = unpad(&decrypted);

        let mut message = match ChatMessage::decode(&body) {
            Ok(message) => message,
            Err(err) => {
                log::debug!("handler: undecodable private message from {}: {err}", packet.sender);
                return;
            }
        };

        if let MessageContent::Plain(text) = &message.content {
            if text.starts_with(COVER_TRAFFIC_MARKER) {
                return;
            }
        }

        self.peers.note_nickname(packet.sender, &message.sender).await;
        message.sender_peer_id = Some(packet.sender.to_string());
        let message_id = message.id.clone();
        self.events.emit(MeshEvent::MessageReceived(message));

        self.send_delivery_ack(packet, message_id);
    }

    /// Builds and sends the end-to-end encrypted acknowledgment for a
    /// private message we just delivered locally.
    fn send_delivery_ack(&self, packet: &Packet, message_id: String) {
        let mut ack_id = [0u8; 16];
        OsRng.fill_bytes(&mut ack_id);
        let ack = DeliveryAck {
            original_message_id: message_id,
            ack_id: hex::encode(ack_id),
            recipient_id: self.own_peer.to_string(),
            recipient_nickname: self.own_nickname.clone(),
            timestamp: now_ms(),
            hop_count: self.config.message_ttl.saturating_sub(packet.ttl),
        };

        let body = match ack.encode() {
            Ok(body) => body,
            Err(err) => {
                log::warn!("handler: ack body failed to serialize: {err}");
                return;
            }
        };
        let encrypted = match self.keyring.encrypt(&body, packet.sender) {
            Ok(encrypted) => encrypted,
            Err(err) => {
                log::warn!("handler: ack encryption for {} failed: {err}", packet.sender);
                return;
            }
        };

        let ack_packet = Packet::new(
            PacketType::DeliveryAck,
            self.config.ack_ttl,
            now_ms(),
            self.own_peer,
            Some(packet.sender),
            encrypted,
        );
        self.spawn_send(ack_packet, Duration::ZERO);
    }

    /// Handles a LEAVE packet: a channel departure when the payload names
    /// a channel, otherwise a full departure from the mesh.
    pub async fn handle_leave(&self, packet: &Packet) {
        let content = String::from_utf8_lossy(&packet.payload).trim().to_string();
        if content.starts_with('#') {
            self.events.emit(MeshEvent::ChannelLeave {
                channel: content,
                peer: packet.sender,
            });
        } else {
            self.peers.remove_peer(packet.sender).await;
        }

        self.direct_relay(packet, None);
    }

    /// Delivers an acknowledgment addressed to us, or relays it onward.
    pub async fn handle_delivery_ack(&self, packet: &Packet) {
        if packet.recipient != Some(self.own_peer) {
            self.relay(packet).await;
            return;
        }
        let body = match self.keyring.decrypt(&packet.payload, packet.sender) {
            Ok(body) => body,
            Err(err) => {
                log::debug!("handler: cannot decrypt ack from {}: {err}", packet.sender);
                return;
            }
        };
        match DeliveryAck::decode(&body) {
            Ok(ack) => self.events.emit(MeshEvent::DeliveryAckReceived(ack)),
            Err(err) => log::debug!("handler: malformed ack body from {}: {err}", packet.sender),
        }
    }

    /// Delivers a read receipt addressed to us, or relays it onward.
    pub async fn handle_read_receipt(&self, packet: &Packet) {
        if packet.recipient != Some(self.own_peer) {
            self.relay(packet).await;
            return;
        }
        let body = match self.keyring.decrypt(&packet.payload, packet.sender) {
            Ok(body) => body,
            Err(err) => {
                log::debug!("handler: cannot decrypt receipt from {}: {err}", packet.sender);
                return;
            }
        };
        match ReadReceipt::decode(&body) {
            Ok(receipt) => self.events.emit(MeshEvent::ReadReceiptReceived(receipt)),
            Err(err) => {
                log::debug!("handler: malformed receipt body from {}: {err}", packet.sender)
            }
        }
    }

    /// Probabilistic relay with TTL decrement and a randomized delay.
    pub async fn relay(&self, packet: &Packet) {
        if packet.ttl == 0 {
            return;
        }
        let new_ttl = packet.ttl - 1;
        if new_ttl == 0 && packet.is_broadcast() {
            // An exhausted broadcast would be dropped by every receiver.
            return;
        }

        let network = self.peers.active_count().await;
        let roll = random_unit();
        if !should_relay(new_ttl, network, roll) {
            log::trace!("relay: suppressed at network size {network}");
            return;
        }

        let delay = jitter_ms(&self.config.relay_jitter);
        self.spawn_send(packet.with_ttl(new_ttl), Duration::from_millis(delay));
    }

    /// Unconditional one-hop forward used for announces, leaves and
    /// fragments, optionally jittered.
    pub fn direct_relay(&self, packet: &Packet, jitter: Option<Range<u64>>) {
        if packet.ttl == 0 {
            return;
        }
        let new_ttl = packet.ttl - 1;
        if new_ttl == 0 && packet.is_broadcast() {
            return;
        }
        let delay = jitter.map(|range| jitter_ms(&range)).unwrap_or(0);
        self.spawn_send(packet.with_ttl(new_ttl), Duration::from_millis(delay));
    }

    /// Encodes and sends on a background task after `delay`, abandoned
    /// on shutdown.
    pub fn spawn_send(&self, packet: Packet, delay: Duration) {
        let transport = Arc::clone(&self.transport);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(delay) => {
                    if let Err(err) = transport.send_packet(&packet.encode()).await {
                        log::debug!("relay: send failed: {err}");
                    }
                }
            }
        });
    }
}

/// Uniform draw from `[0, 1)` built from the top 53 bits of an OS
/// random word.
fn random_unit() -> f64 {
    (OsRng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
}

/// Uniform draw from a millisecond range; an empty range yields its
/// start so zeroed test configs stay deterministic.
fn jitter_ms(range: &Range<u64>) -> u64 {
    if range.is_empty() {
        range.start
    } else {
        range.start + OsRng.next_u64() % (range.end - range.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probability_tiers_follow_mesh_size() {
        assert_eq!(relay_probability(0), 1.0);
        assert_eq!(relay_probability(10), 1.0);
        assert_eq!(relay_probability(11), 0.85);
        assert_eq!(relay_probability(30), 0.85);
        assert_eq!(relay_probability(31), 0.7);
        assert_eq!(relay_probability(50), 0.7);
        assert_eq!(relay_probability(51), 0.55);
        assert_eq!(relay_probability(100), 0.55);
        assert_eq!(relay_probability(101), 0.4);
        assert_eq!(relay_probability(10_000), 0.4);
    }

    #[test]
    fn high_ttl_and_tiny_mesh_always_relay() {
        // Worst possible roll loses to both unconditional gates.
        assert!(should_relay(4, 10_000, 0.999_999));
        assert!(should_relay(0, 3, 0.999_999));
        assert!(should_relay(7, 2, 0.999_999));
    }

    #[test]
    fn mid_mesh_relay_follows_the_roll() {
        assert!(should_relay(2, 40, 0.69));
        assert!(!should_relay(2, 40, 0.7));
        assert!(should_relay(1, 200, 0.39));
        assert!(!should_relay(1, 200, 0.41));
    }

    #[test]
    fn random_unit_stays_in_range() {
        for _ in 0..1000 {
            let value = random_unit();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn jitter_respects_bounds_and_empty_ranges() {
        for _ in 0..100 {
            let value = jitter_ms(&(50..500));
            assert!((50..500).contains(&value));
        }
        assert_eq!(jitter_ms(&(0..0)), 0);
        assert_eq!(jitter_ms(&(7..7)), 7);
    }
}
