//! The assembled mesh node.

use std::sync::Arc;

use parasol_crypto::{optimal_block_size, pad_to_block, Keyring, SecretStore};
use parasol_wire::{ChatMessage, MessageContent, Packet, PacketType, PeerId, ReadReceipt};
use rand_core::{OsRng, RngCore};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::dispatcher::PacketDispatcher;
use crate::events::{EventSink, MeshEvent};
use crate::fragments::FragmentManager;
use crate::handler::MessageHandler;
use crate::now_ms;
use crate::peers::PeerTable;
use crate::security::SecurityManager;
use crate::store_forward::StoreForward;
use crate::traits::{ChannelCipher, FavoritePolicy, Transport};
use crate::EngineError;

/// One node on the mesh: wiring, background sweeps and the send API.
///
/// Construction hands back the node and the receiving end of its event
/// stream. Feed transport bytes in with [`MeshNode::packet_received`];
/// everything the application should see comes out as [`MeshEvent`]s.
pub struct MeshNode {
    own_peer: PeerId,
    nickname: String,
    config: EngineConfig,
    keyring: Arc<Keyring>,
    peers: Arc<PeerTable>,
    security: Arc<SecurityManager>,
    fragments: Arc<FragmentManager>,
    store: Arc<StoreForward>,
    dispatcher: Arc<PacketDispatcher>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
}

impl MeshNode {
    pub fn new(
        peer_id: PeerId,
        nickname: &str,
        config: EngineConfig,
        secrets: Arc<dyn SecretStore>,
        transport: Arc<dyn Transport>,
        favorites: Arc<dyn FavoritePolicy>,
        channels: Arc<dyn ChannelCipher>,
    ) -> Result<(Arc<Self>, UnboundedReceiver<MeshEvent>), EngineError> {
        let (events, event_rx) = EventSink::channel();
        let cancel = CancellationToken::new();
        let keyring = Arc::new(Keyring::new(secrets)?);

        let peers = Arc::new(PeerTable::new(peer_id, events.clone(), &config));
        let security = Arc::new(SecurityManager::new(peer_id, Arc::clone(&keyring), &config));
        let fragments = Arc::new(FragmentManager::new(&config));
        let store = Arc::new(StoreForward::new(favorites, &config));

        let handler = Arc::new(MessageHandler::new(
            peer_id,
            nickname.to_string(),
            config.clone(),
            Arc::clone(&keyring),
            Arc::clone(&peers),
            Arc::clone(&security),
            Arc::clone(&transport),
            events.clone(),
            channels,
            cancel.clone(),
        ));
        let dispatcher = Arc::new(PacketDispatcher::new(
            peer_id,
            nickname.to_string(),
            config.clone(),
            Arc::clone(&security),
            Arc::clone(&fragments),
            Arc::clone(&peers),
            Arc::clone(&store),
            handler,
            Arc::clone(&transport),
            events,
            cancel.clone(),
        ));

        let node = Arc::new(Self {
            own_peer: peer_id,
            nickname: nickname.to_string(),
            config,
            keyring,
            peers,
            security,
            fragments,
            store,
            dispatcher,
            transport,
            cancel,
        });
        node.spawn_sweeps();
        log::info!("node: {peer_id} up as {nickname:?}");
        Ok((node, event_rx))
    }

    /// Periodic state maintenance, one task per component so a slow
    /// sweep cannot hold up the others.
    fn spawn_sweeps(self: &Arc<Self>) {
        let fragments = Arc::clone(&self.fragments);
        let cancel = self.cancel.clone();
        let interval = self.config.fragment_sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(interval) => fragments.sweep().await,
                }
            }
        });

        let security = Arc::clone(&self.security);
        let cancel = self.cancel.clone();
        let interval = self.config.security_sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(interval) => security.sweep().await,
                }
            }
        });

        let peers = Arc::clone(&self.peers);
        let cancel = self.cancel.clone();
        let interval = self.config.peer_sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(interval) => peers.sweep().await,
                }
            }
        });

        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        let interval = self.config.cache_sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(interval) => store.sweep().await,
                }
            }
        });
    }

    /// Entry point for raw frames from the transport. Undecodable frames
    /// are logged and dropped; everything else is dispatched on its own
    /// task so the transport callback never blocks.
    pub fn packet_received(self: &Arc<Self>, data: &[u8], from: PeerId) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                log::debug!("node: undecodable frame from {from}: {err}");
                return;
            }
        };
        let node = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = node.cancel.cancelled() => {}
                _ = node.dispatcher.dispatch(packet, from) => {}
            }
        });
    }

    /// Records a signal strength reading reported by the transport.
    pub fn peer_rssi(self: &Arc<Self>, peer: PeerId, rssi: i16) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.peers.update_rssi(peer, rssi).await;
        });
    }

    /// Sends a public message to the whole mesh. Returns the message id
    /// the application can match acknowledgments against.
    pub async fn send_broadcast(
        &self,
        content: &str,
        mentions: Vec<String>,
        channel: Option<String>,
    ) -> Result<String, EngineError> {
        let id = random_message_id();
        let mut message = ChatMessage::new(
            &id,
            &self.nickname,
            MessageContent::Plain(content.to_string()),
            now_ms(),
        );
        message.mentions = mentions;
        message.channel = channel;
        message.sender_peer_id = Some(self.own_peer.to_string());

        let packet = Packet::new(
            PacketType::Message,
            self.config.message_ttl,
            message.timestamp,
            self.own_peer,
            Some(PeerId::BROADCAST),
            message.encode(),
        );
        self.fragment_and_send(&packet).await?;
        Ok(id)
    }

    /// Sends an end-to-end encrypted message to one peer.
    ///
    /// The body is padded to a standard block before encryption and the
    /// ciphertext is signed with our session key. If the recipient is not
    /// currently on the mesh the packet goes to the store-and-forward
    /// cache instead of the air.
    pub async fn send_private(
        &self,
        content: &str,
        recipient: PeerId,
        recipient_nickname: &str,
    ) -> Result<String, EngineError> {
        let id = random_message_id();
        let mut message = ChatMessage::new(
            &id,
            &self.nickname,
            MessageContent::Plain(content.to_string()),
            now_ms(),
        );
        message.is_private = true;
        message.recipient_nickname = Some(recipient_nickname.to_string());
        message.sender_peer_id = Some(self.own_peer.to_string());

        let body = message.encode();
        let padded = pad_to_block(&body, optimal_block_size(body.len()));
        let encrypted = self.keyring.encrypt(&padded, recipient)?;

        let mut packet = Packet::new(
            PacketType::Message,
            self.config.message_ttl,
            message.timestamp,
            self.own_peer,
            Some(recipient),
            encrypted,
        );
        packet.signature = Some(self.keyring.sign(&packet.payload));

        if self.peers.is_active(recipient).await {
            self.fragment_and_send(&packet).await?;
        } else {
            log::info!("node: {recipient} offline, caching message {id}");
            self.store.cache_packet(packet, id.clone()).await;
        }
        Ok(id)
    }

    /// Announces our presence and nickname to the mesh.
    pub async fn send_announce(&self) -> Result<(), EngineError> {
        let packet = Packet::new(
            PacketType::Announce,
            self.config.announce_ttl,
            now_ms(),
            self.own_peer,
            None,
            self.nickname.clone().into_bytes(),
        );
        self.transport.send_packet(&packet.encode()).await
    }

    /// Announces departure, either from the mesh (plain payload) or from
    /// a channel (`#name` payload).
    pub async fn send_leave(&self, content: &str) -> Result<(), EngineError> {
        let packet = Packet::new(
            PacketType::Leave,
            self.config.leave_ttl,
            now_ms(),
            self.own_peer,
            None,
            content.as_bytes().to_vec(),
        );
        self.transport.send_packet(&packet.encode()).await
    }

    /// Broadcasts our public key bundle to open encrypted sessions with
    /// whoever hears it. Single hop; neighbors answer with their own.
    pub async fn send_key_exchange(&self) -> Result<(), EngineError> {
        let packet = Packet::new(
            PacketType::KeyExchange,
            self.config.key_exchange_ttl,
            now_ms(),
            self.own_peer,
            None,
            self.keyring.combined_public_key_data().to_vec(),
        );
        self.transport.send_packet(&packet.encode()).await
    }

    /// Sends an encrypted read receipt back to a message's author.
    pub async fn send_read_receipt(
        &self,
        receipt: ReadReceipt,
        to: PeerId,
    ) -> Result<(), EngineError> {
        let body = receipt.encode()?;
        let encrypted = self.keyring.encrypt(&body, to)?;
        let packet = Packet::new(
            PacketType::ReadReceipt,
            self.config.ack_ttl,
            now_ms(),
            self.own_peer,
            Some(to),
            encrypted,
        );
        self.transport.send_packet(&packet.encode()).await
    }

    /// Stops the sweep loops and abandons pending delayed sends.
    pub fn shutdown(&self) {
        log::info!("node: {} shutting down", self.own_peer);
        self.cancel.cancel();
    }

    pub fn peer_id(&self) -> PeerId {
        self.own_peer
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Hex fingerprint of the long-lived identity key, for out-of-band
    /// verification between users.
    pub fn identity_fingerprint(&self) -> String {
        self.keyring.identity_fingerprint()
    }

    pub async fn active_peers(&self) -> Vec<PeerId> {
        self.peers.active_peers().await
    }

    pub async fn peer_nicknames(&self) -> std::collections::HashMap<PeerId, String> {
        self.peers.all_nicknames().await
    }

    async fn fragment_and_send(&self, packet: &Packet) -> Result<(), EngineError> {
        for fragment in self.fragments.create_fragments(packet) {
            self.transport.send_packet(&fragment.encode()).await?;
        }
        Ok(())
    }
}

/// Fresh random peer id for a session: four random bytes, hex encoded to
/// exactly eight printable bytes.
pub fn random_peer_id() -> PeerId {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    PeerId::from_str_id(&hex::encode(bytes))
}

fn random_message_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
