//! Seams between the engine and the embedding application.

use async_trait::async_trait;
use parasol_wire::PeerId;

use crate::EngineError;

/// Outbound byte transport. The engine hands over fully encoded packets
/// and the implementation broadcasts them over whatever radio or socket
/// it owns.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_packet(&self, data: &[u8]) -> Result<(), EngineError>;
}

/// Application policy for which peers get the large offline queue.
pub trait FavoritePolicy: Send + Sync {
    fn is_favorite(&self, peer: &PeerId) -> bool;
}

/// Nobody is a favorite. Default policy for applications without one.
pub struct NoFavorites;

impl FavoritePolicy for NoFavorites {
    fn is_favorite(&self, _peer: &PeerId) -> bool {
        false
    }
}

/// Application-held channel keys. The engine asks this to open encrypted
/// channel messages; `None` means the key is missing and a placeholder is
/// delivered instead.
pub trait ChannelCipher: Send + Sync {
    fn decrypt_channel(&self, data: &[u8], channel: &str) -> Option<String>;
}

/// No channel keys at all.
pub struct NoChannelKeys;

impl ChannelCipher for NoChannelKeys {
    fn decrypt_channel(&self, _data: &[u8], _channel: &str) -> Option<String> {
        None
    }
}
