//! Events surfaced to the embedding application.

use parasol_wire::{ChatMessage, DeliveryAck, PeerId, ReadReceipt};
use tokio::sync::mpsc;

/// Everything the engine wants the application to know about.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A broadcast or private message addressed to us was delivered.
    MessageReceived(ChatMessage),
    /// A peer announced itself for the first time.
    PeerConnected { peer: PeerId, nickname: String },
    /// A peer left or went stale.
    PeerDisconnected {
        peer: PeerId,
        nickname: Option<String>,
    },
    /// The active peer set changed.
    PeerListUpdated(Vec<PeerId>),
    /// A peer left a channel without leaving the mesh.
    ChannelLeave { channel: String, peer: PeerId },
    /// A recipient confirmed one of our private messages.
    DeliveryAckReceived(DeliveryAck),
    /// A reader confirmed reading one of our private messages.
    ReadReceiptReceived(ReadReceipt),
    /// A key exchange installed keys for this peer.
    KeyExchangeCompleted { peer: PeerId },
}

/// Sending half of the event stream handed to the application.
///
/// Emission never fails; if the application dropped its receiver the
/// event is discarded with a trace log.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: MeshEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("events: receiver dropped, event discarded");
        }
    }
}
