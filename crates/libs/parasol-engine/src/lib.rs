//! Parasol mesh protocol engine.
//!
//! Sits between a broadcast-style transport (short-range radio, no
//! central server) and an application. The transport feeds raw packet
//! bytes in; the engine validates, deduplicates, reassembles, decrypts
//! and delivers upward as [`MeshEvent`]s, relays across the mesh under a
//! probabilistic flood policy, and caches undeliverable private messages
//! for peers that come back later.
//!
//! [`MeshNode`] is the assembled engine. The components underneath
//! ([`SecurityManager`], [`FragmentManager`], [`PeerTable`],
//! [`StoreForward`], [`MessageHandler`], [`PacketDispatcher`]) each own
//! their state behind their own lock and can be exercised in isolation.

pub mod config;
pub mod dispatcher;
pub mod events;
pub mod fragments;
pub mod handler;
pub mod node;
pub mod peers;
pub mod security;
pub mod store_forward;
pub mod traits;

pub use config::EngineConfig;
pub use dispatcher::PacketDispatcher;
pub use events::{EventSink, MeshEvent};
pub use fragments::FragmentManager;
pub use handler::{
    relay_probability, should_relay, MessageHandler, COVER_TRAFFIC_MARKER, ENCRYPTED_PLACEHOLDER,
};
pub use node::{random_peer_id, MeshNode};
pub use peers::{PeerRecord, PeerTable};
pub use security::{PacketReject, SecurityManager};
pub use store_forward::StoreForward;
pub use traits::{ChannelCipher, FavoritePolicy, NoChannelKeys, NoFavorites, Transport};

use parasol_crypto::CryptoError;
use parasol_wire::WireError;

/// Errors surfaced by engine operations. Inbound packet problems are
/// logged and dropped instead; this covers the caller-facing send paths.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("wire codec: {0}")]
    Wire(#[from] WireError),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("receipt body: {0}")]
    Receipt(#[from] serde_json::Error),

    #[error("transport send failed: {0}")]
    Transport(String),
}

/// Milliseconds since the Unix epoch. Zero for clocks set before 1970.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
