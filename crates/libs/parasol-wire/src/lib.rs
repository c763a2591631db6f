//! Parasol wire formats.
//!
//! Two codecs live here: the outer packet envelope ([`Packet`]) every mesh
//! frame travels in, and the chat payload ([`ChatMessage`]) nested inside
//! MESSAGE packets. Both are hand-rolled big-endian formats; independent
//! implementations must agree byte-for-byte.

pub mod packet;
pub mod payload;
pub mod receipts;

pub use packet::{Packet, PacketType, PeerId, WireError};
pub use payload::{ChatMessage, DeliveryStatus, MessageContent, PayloadError};
pub use receipts::{DeliveryAck, ReadReceipt};

/// Envelope format version. Decoders reject anything else.
pub const WIRE_VERSION: u8 = 1;
