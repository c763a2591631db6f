//! Routes validated packets to their type handlers.

use std::sync::Arc;

use parasol_wire::{Packet, PacketType, PeerId};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::events::{EventSink, MeshEvent};
use crate::fragments::FragmentManager;
use crate::handler::MessageHandler;
use crate::now_ms;
use crate::peers::PeerTable;
use crate::security::SecurityManager;
use crate::store_forward::StoreForward;
use crate::traits::Transport;

/// Entry point for every packet the transport hands us.
///
/// Each packet passes the security gauntlet once, then branches by type.
/// Key exchanges additionally drive the handshake choreography: announce
/// ourselves back after a beat, then flush anything cached for the peer.
pub struct PacketDispatcher {
    own_peer: PeerId,
    own_nickname: String,
    config: EngineConfig,
    security: Arc<SecurityManager>,
    fragments: Arc<FragmentManager>,
    peers: Arc<PeerTable>,
    store: Arc<StoreForward>,
    handler: Arc<MessageHandler>,
    transport: Arc<dyn Transport>,
    events: EventSink,
    cancel: CancellationToken,
}

impl PacketDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        own_peer: PeerId,
        own_nickname: String,
        config: EngineConfig,
        security: Arc<SecurityManager>,
        fragments: Arc<FragmentManager>,
        peers: Arc<PeerTable>,
        store: Arc<StoreForward>,
        handler: Arc<MessageHandler>,
        transport: Arc<dyn Transport>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            own_peer,
            own_nickname,
            config,
            security,
            fragments,
            peers,
            store,
            handler,
            transport,
            events,
            cancel,
        }
    }

    /// Vets and routes one packet. `from` is the link-layer neighbor the
    /// bytes arrived over, which for relayed packets differs from the
    /// original sender in the envelope.
    pub async fn dispatch(&self, packet: Packet, from: PeerId) {
        if let Err(reject) = self.security.validate_packet(&packet).await {
            log::debug!(
                "dispatch: dropped type 0x{:02x} from {}: {reject}",
                packet.packet_type,
                packet.sender
            );
            return;
        }
        self.peers.update_last_seen(from).await;

        match packet.known_type() {
            Ok(PacketType::KeyExchange) => self.handle_key_exchange(&packet).await,
            Ok(PacketType::Announce) => {
                self.handler.handle_announce(&packet).await;
            }
            Ok(PacketType::Leave) => self.handler.handle_leave(&packet).await,
            Ok(PacketType::Message) => self.handler.handle_message(&packet).await,
            Ok(PacketType::DeliveryAck) => self.handler.handle_delivery_ack(&packet).await,
            Ok(PacketType::ReadReceipt) => self.handler.handle_read_receipt(&packet).await,
            Ok(t) if t.is_fragment() => {
                if let Some(rebuilt) = self.fragments.handle_fragment(&packet).await {
                    Box::pin(self.dispatch(rebuilt, from)).await;
                }
                if packet.recipient != Some(self.own_peer) {
                    self.handler.direct_relay(&packet, None);
                }
            }
            Ok(other) => {
                log::debug!("dispatch: ignoring unhandled type {other:?} from {}", packet.sender);
            }
            Err(err) => {
                log::debug!("dispatch: {err} from {}", packet.sender);
            }
        }
    }

    /// First contact: install the peer's keys, confirm to the app, then
    /// run the timed announce-back and cache flush.
    async fn handle_key_exchange(&self, packet: &Packet) {
        match self.security.handle_key_exchange(packet).await {
            Ok(true) => {
                log::info!("dispatch: key exchange completed with {}", packet.sender);
                self.events.emit(MeshEvent::KeyExchangeCompleted {
                    peer: packet.sender,
                });
                sleep(self.config.handshake_announce_delay).await;
                self.announce_back(packet.sender).await;
                sleep(self.config.handshake_flush_delay).await;
                self.flush_cached(packet.sender).await;
            }
            Ok(false) => {}
            Err(err) => {
                log::warn!("dispatch: key exchange from {} rejected: {err}", packet.sender);
            }
        }
    }

    /// Sends our announce directly to a freshly keyed peer, once.
    async fn announce_back(&self, peer: PeerId) {
        if !self.peers.mark_announced_to(peer).await {
            return;
        }
        let announce = Packet::new(
            PacketType::Announce,
            self.config.announce_ttl,
            now_ms(),
            self.own_peer,
            None,
            self.own_nickname.clone().into_bytes(),
        );
        if let Err(err) = self.transport.send_packet(&announce.encode()).await {
            log::debug!("dispatch: handshake announce failed: {err}");
        }
    }

    /// Drains the store-and-forward queue for `peer`, pacing the sends so
    /// a burst of cached history does not monopolize the link.
    async fn flush_cached(&self, peer: PeerId) {
        let packets = self.store.flush_for(peer).await;
        if packets.is_empty() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let spacing = self.config.cached_send_spacing;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            for (i, packet) in packets.into_iter().enumerate() {
                if i > 0 {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(spacing) => {}
                    }
                }
                if let Err(err) = transport.send_packet(&packet.encode()).await {
                    log::debug!("dispatch: cached send failed: {err}");
                }
            }
        });
    }
}
