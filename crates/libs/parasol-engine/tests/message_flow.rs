use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parasol_crypto::{optimal_block_size, pad_to_block, unpad, Keyring, MemorySecretStore};
use parasol_engine::config::EngineConfig;
use parasol_engine::events::MeshEvent;
use parasol_engine::node::MeshNode;
use parasol_engine::traits::{NoChannelKeys, NoFavorites, Transport};
use parasol_engine::{now_ms, EngineError, COVER_TRAFFIC_MARKER, ENCRYPTED_PLACEHOLDER};
use parasol_wire::{
    ChatMessage, DeliveryAck, MessageContent, Packet, PacketType, PeerId, ReadReceipt,
};
use tokio::sync::mpsc::UnboundedReceiver;

struct RecordingTransport {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl RecordingTransport {
    fn sent_packets(&self) -> Vec<Packet> {
        self.sent
            .lock()
            .expect("transport lock")
            .iter()
            .map(|bytes| Packet::decode(bytes).expect("sent packet decodes"))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_packet(&self, data: &[u8]) -> Result<(), EngineError> {
        self.sent.lock().expect("transport lock").push(data.to_vec());
        Ok(())
    }
}

fn mesh_node(
    id: &str,
    nickname: &str,
) -> (
    Arc<MeshNode>,
    UnboundedReceiver<MeshEvent>,
    Arc<RecordingTransport>,
) {
    let transport = Arc::new(RecordingTransport {
        sent: Mutex::new(Vec::new()),
    });
    let (node, events) = MeshNode::new(
        PeerId::from_str_id(id),
        nickname,
        EngineConfig::immediate(),
        Arc::new(MemorySecretStore::new()),
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(NoFavorites),
        Arc::new(NoChannelKeys),
    )
    .expect("node");
    (node, events, transport)
}

/// A scripted far-side peer with its own keys.
struct Remote {
    peer: PeerId,
    nickname: &'static str,
    keyring: Keyring,
}

impl Remote {
    fn new(id: &str, nickname: &'static str) -> Self {
        Self {
            peer: PeerId::from_str_id(id),
            nickname,
            keyring: Keyring::new(Arc::new(MemorySecretStore::new())).expect("keyring"),
        }
    }

    fn key_exchange(&self) -> Packet {
        Packet::new(
            PacketType::KeyExchange,
            1,
            now_ms(),
            self.peer,
            None,
            self.keyring.combined_public_key_data().to_vec(),
        )
    }

    fn announce(&self, ttl: u8) -> Packet {
        Packet::new(
            PacketType::Announce,
            ttl,
            now_ms(),
            self.peer,
            None,
            self.nickname.as_bytes().to_vec(),
        )
    }

    fn broadcast_chat(&self, id: &str, content: MessageContent, channel: Option<&str>) -> Packet {
        let mut message = ChatMessage::new(id, self.nickname, content, now_ms());
        message.channel = channel.map(str::to_string);
        Packet::new(
            PacketType::Message,
            7,
            now_ms(),
            self.peer,
            Some(PeerId::BROADCAST),
            message.encode(),
        )
    }

    fn private_chat(&self, to: PeerId, to_nickname: &str, id: &str, text: &str, ttl: u8) -> Packet {
        let mut message = ChatMessage::new(
            id,
            self.nickname,
            MessageContent::Plain(text.to_string()),
            now_ms(),
        );
        message.is_private = true;
        message.recipient_nickname = Some(to_nickname.to_string());
        let body = message.encode();
        let padded = pad_to_block(&body, optimal_block_size(body.len()));
        let encrypted = self.keyring.encrypt(&padded, to).expect("encrypt");
        let mut packet = Packet::new(PacketType::Message, ttl, now_ms(), self.peer, Some(to), encrypted);
        packet.signature = Some(self.keyring.sign(&packet.payload));
        packet
    }
}

fn packets_of_type(transport: &RecordingTransport, wanted: PacketType) -> Vec<Packet> {
    transport
        .sent_packets()
        .into_iter()
        .filter(|p| matches!(p.known_type(), Ok(t) if t == wanted))
        .collect()
}

fn messages_in(events: Vec<MeshEvent>) -> Vec<ChatMessage> {
    events
        .into_iter()
        .filter_map(|event| match event {
            MeshEvent::MessageReceived(message) => Some(message),
            _ => None,
        })
        .collect()
}

fn drain(rx: &mut UnboundedReceiver<MeshEvent>) -> Vec<MeshEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Bob and a remote that have exchanged keys in both directions.
async fn keyed_pair() -> (
    Arc<MeshNode>,
    UnboundedReceiver<MeshEvent>,
    Arc<RecordingTransport>,
    Remote,
) {
    let (node, mut events, transport) = mesh_node("bobb0001", "bob");
    let carol = Remote::new("cccc2222", "carol");
    node.packet_received(&carol.key_exchange().encode(), carol.peer);
    settle().await;
    node.send_key_exchange().await.expect("broadcast keys");
    let bundle = packets_of_type(&transport, PacketType::KeyExchange)
        .pop()
        .expect("own bundle")
        .payload;
    carol
        .keyring
        .add_peer_public_key(node.peer_id(), &bundle)
        .expect("learn bob");
    drain(&mut events);
    (node, events, transport, carol)
}

#[tokio::test(flavor = "current_thread")]
async fn broadcast_messages_deliver_and_relay() {
    let (node, mut events, transport) = mesh_node("bobb0001", "bob");
    let carol = Remote::new("cccc2222", "carol");

    let packet = carol.broadcast_chat("m-1", MessageContent::Plain("hello mesh".into()), None);
    node.packet_received(&packet.encode(), carol.peer);
    settle().await;

    let received = messages_in(drain(&mut events));
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].content, MessageContent::Plain("hello mesh".into()));
    assert_eq!(received[0].sender, "carol");
    assert_eq!(received[0].sender_peer_id.as_deref(), Some("cccc2222"));

    let relayed = packets_of_type(&transport, PacketType::Message);
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].ttl, 6, "relay copies go out with ttl - 1");
    assert_eq!(relayed[0].sender, carol.peer, "the original sender survives the relay");

    // The chat body's nickname sticks even without an announce.
    let nicknames = node.peer_nicknames().await;
    assert_eq!(nicknames.get(&carol.peer).map(String::as_str), Some("carol"));
}

#[tokio::test(flavor = "current_thread")]
async fn private_messages_deliver_on_the_last_hop() {
    let (node, mut events, transport, carol) = keyed_pair().await;
    let before = packets_of_type(&transport, PacketType::Message).len();

    // ttl already burned down to zero, but the packet is addressed to us.
    let packet = carol.private_chat(node.peer_id(), "bob", "m-77", "for your eyes", 0);
    node.packet_received(&packet.encode(), carol.peer);
    settle().await;

    let received = messages_in(drain(&mut events));
    assert_eq!(received.len(), 1);
    assert!(received[0].is_private);
    assert_eq!(received[0].content, MessageContent::Plain("for your eyes".into()));
    assert_eq!(received[0].sender_peer_id.as_deref(), Some("cccc2222"));

    assert_eq!(
        packets_of_type(&transport, PacketType::Message).len(),
        before,
        "a packet that ended its journey here is not relayed"
    );

    let acks = packets_of_type(&transport, PacketType::DeliveryAck);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].recipient, Some(carol.peer));
    let body = carol
        .keyring
        .decrypt(&acks[0].payload, node.peer_id())
        .expect("open ack");
    let ack = DeliveryAck::decode(&body).expect("ack json");
    assert_eq!(ack.original_message_id, "m-77");
    assert_eq!(ack.recipient_nickname, "bob");
    assert_eq!(ack.hop_count, 7, "seven hops used up out of the starting ttl");
}

#[tokio::test(flavor = "current_thread")]
async fn tampered_signatures_drop_the_message() {
    let (node, mut events, transport, carol) = keyed_pair().await;

    let mut packet = carol.private_chat(node.peer_id(), "bob", "m-13", "trust me", 5);
    if let Some(signature) = packet.signature.as_mut() {
        signature[0] ^= 0xFF;
    }
    node.packet_received(&packet.encode(), carol.peer);
    settle().await;

    assert!(messages_in(drain(&mut events)).is_empty());
    assert!(packets_of_type(&transport, PacketType::DeliveryAck).is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn cover_traffic_relays_without_surfacing() {
    let (node, mut events, transport) = mesh_node("bobb0001", "bob");
    let carol = Remote::new("cccc2222", "carol");

    let noise = format!("{COVER_TRAFFIC_MARKER} nothing to see");
    let packet = carol.broadcast_chat("m-2", MessageContent::Plain(noise), None);
    node.packet_received(&packet.encode(), carol.peer);
    settle().await;

    assert!(messages_in(drain(&mut events)).is_empty());
    let relayed = packets_of_type(&transport, PacketType::Message);
    assert_eq!(relayed.len(), 1, "dummies still travel so traffic shape holds");
    assert_eq!(relayed[0].ttl, 6);
}

#[tokio::test(flavor = "current_thread")]
async fn channel_messages_without_a_key_show_a_placeholder() {
    let (node, mut events, _transport) = mesh_node("bobb0001", "bob");
    let carol = Remote::new("cccc2222", "carol");

    let packet = carol.broadcast_chat(
        "m-3",
        MessageContent::Encrypted(vec![0xDE, 0xAD, 0xBE, 0xEF]),
        Some("#rust"),
    );
    node.packet_received(&packet.encode(), carol.peer);
    settle().await;

    let received = messages_in(drain(&mut events));
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0].content,
        MessageContent::Plain(ENCRYPTED_PLACEHOLDER.to_string())
    );
    assert_eq!(received[0].channel.as_deref(), Some("#rust"));
}

#[tokio::test(flavor = "current_thread")]
async fn private_messages_for_others_relay_onward() {
    let (node, mut events, transport) = mesh_node("bobb0001", "bob");
    let carol = Remote::new("cccc2222", "carol");
    let dave = PeerId::from_str_id("dddd3333");

    // Opaque ciphertext for somebody else, we just pass it along.
    let packet = Packet::new(
        PacketType::Message,
        5,
        now_ms(),
        carol.peer,
        Some(dave),
        vec![0xAA; 48],
    );
    node.packet_received(&packet.encode(), carol.peer);
    settle().await;

    assert!(messages_in(drain(&mut events)).is_empty());
    let relayed = packets_of_type(&transport, PacketType::Message);
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].ttl, 4);
    assert_eq!(relayed[0].recipient, Some(dave));
    assert_eq!(relayed[0].payload, vec![0xAA; 48]);
}

#[tokio::test(flavor = "current_thread")]
async fn announce_and_leave_lifecycle() {
    let (node, mut events, transport) = mesh_node("bobb0001", "bob");
    let carol = Remote::new("cccc2222", "carol");

    node.packet_received(&carol.announce(3).encode(), carol.peer);
    settle().await;

    let after_announce = drain(&mut events);
    assert!(matches!(
        after_announce.as_slice(),
        [
            MeshEvent::PeerConnected { peer, nickname },
            MeshEvent::PeerListUpdated(list),
        ] if *peer == carol.peer && nickname == "carol" && list == &[carol.peer]
    ));
    let relayed = packets_of_type(&transport, PacketType::Announce);
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].ttl, 2);

    // Leaving a channel does not take the peer off the mesh.
    let channel_leave = Packet::new(
        PacketType::Leave,
        3,
        now_ms() + 1,
        carol.peer,
        None,
        b"#rust".to_vec(),
    );
    node.packet_received(&channel_leave.encode(), carol.peer);
    settle().await;

    let after_channel = drain(&mut events);
    assert!(matches!(
        after_channel.as_slice(),
        [MeshEvent::ChannelLeave { channel, peer }]
            if channel == "#rust" && *peer == carol.peer
    ));
    assert_eq!(node.active_peers().await, vec![carol.peer]);

    // A bare leave is a mesh goodbye. Timestamp nudged so the envelope
    // is not mistaken for a replay of the announce.
    let mesh_leave = Packet::new(
        PacketType::Leave,
        3,
        now_ms() + 2,
        carol.peer,
        None,
        b"carol".to_vec(),
    );
    node.packet_received(&mesh_leave.encode(), carol.peer);
    settle().await;

    let after_leave = drain(&mut events);
    assert!(matches!(
        after_leave.as_slice(),
        [
            MeshEvent::PeerDisconnected { peer, nickname: Some(nick) },
            MeshEvent::PeerListUpdated(list),
        ] if *peer == carol.peer && nick == "carol" && list.is_empty()
    ));
    assert!(node.active_peers().await.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn delivery_acks_and_read_receipts_come_back() {
    let (node, mut events, transport, carol) = keyed_pair().await;

    // Carol is on the mesh, so the private message goes straight out.
    node.packet_received(&carol.announce(3).encode(), carol.peer);
    settle().await;
    drain(&mut events);

    let message_id = node
        .send_private("ping", carol.peer, "carol")
        .await
        .expect("send");
    let sent = packets_of_type(&transport, PacketType::Message)
        .into_iter()
        .find(|p| p.recipient == Some(carol.peer))
        .expect("direct send");
    let opened = ChatMessage::decode(&unpad(
        &carol
            .keyring
            .decrypt(&sent.payload, node.peer_id())
            .expect("decrypt"),
    ))
    .expect("chat message");
    assert_eq!(opened.id, message_id);

    // Carol acknowledges delivery.
    let ack = DeliveryAck {
        original_message_id: message_id.clone(),
        ack_id: "ack-1".into(),
        recipient_id: carol.peer.to_hex(),
        recipient_nickname: "carol".into(),
        timestamp: now_ms(),
        hop_count: 1,
    };
    let ack_payload = carol
        .keyring
        .encrypt(&ack.encode().expect("ack json"), node.peer_id())
        .expect("seal ack");
    let ack_packet = Packet::new(
        PacketType::DeliveryAck,
        3,
        now_ms(),
        carol.peer,
        Some(node.peer_id()),
        ack_payload,
    );
    node.packet_received(&ack_packet.encode(), carol.peer);
    settle().await;

    let after_ack = drain(&mut events);
    assert!(matches!(
        after_ack.as_slice(),
        [MeshEvent::DeliveryAckReceived(got)]
            if got.original_message_id == message_id && got.ack_id == "ack-1"
    ));

    // Later she reads it.
    let receipt = ReadReceipt {
        original_message_id: message_id.clone(),
        receipt_id: "rcpt-1".into(),
        reader_id: carol.peer.to_hex(),
        reader_nickname: "carol".into(),
        timestamp: now_ms(),
    };
    let receipt_payload = carol
        .keyring
        .encrypt(&receipt.encode().expect("receipt json"), node.peer_id())
        .expect("seal receipt");
    let receipt_packet = Packet::new(
        PacketType::ReadReceipt,
        3,
        now_ms() + 1,
        carol.peer,
        Some(node.peer_id()),
        receipt_payload,
    );
    node.packet_received(&receipt_packet.encode(), carol.peer);
    settle().await;

    let after_receipt = drain(&mut events);
    assert!(matches!(
        after_receipt.as_slice(),
        [MeshEvent::ReadReceiptReceived(got)]
            if got.original_message_id == message_id && got.receipt_id == "rcpt-1"
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn oversized_broadcasts_reassemble_on_the_far_side() {
    let (alice_node, _alice_events, alice_transport) = mesh_node("aaaa1111", "alice");
    let (bob_node, mut bob_events, _bob_transport) = mesh_node("bobb0001", "bob");

    let long_text = "all work and no play makes a dull mesh. ".repeat(20);
    let id = alice_node
        .send_broadcast(&long_text, Vec::new(), None)
        .await
        .expect("send");

    let pieces = alice_transport.sent_packets();
    assert!(pieces.len() >= 2, "a 800 byte chat cannot fit one packet");
    assert!(pieces
        .iter()
        .all(|p| matches!(p.known_type(), Ok(t) if t.is_fragment())));

    for piece in &pieces {
        bob_node.packet_received(&piece.encode(), alice_node.peer_id());
        settle().await;
    }

    let received = messages_in(drain(&mut bob_events));
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, id);
    assert_eq!(received[0].content, MessageContent::Plain(long_text));
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_packet_types_are_ignored() {
    let (node, mut events, transport) = mesh_node("bobb0001", "bob");
    let carol = Remote::new("cccc2222", "carol");

    let mut odd = Packet::new(PacketType::Message, 5, now_ms(), carol.peer, None, b"?".to_vec());
    odd.packet_type = 0x63;
    node.packet_received(&odd.encode(), carol.peer);
    settle().await;

    assert!(drain(&mut events).is_empty());
    assert!(transport.sent_packets().is_empty());
}
