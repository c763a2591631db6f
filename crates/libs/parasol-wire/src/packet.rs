//! Mesh packet envelope encode/decode.
//!
//! Layout, all integers big-endian:
//! version(1) type(1) ttl(1) timestamp_ms(8) flags(1) payload_len(2),
//! then sender(8), optional recipient(8), payload, optional signature(64).

use std::fmt;

use crate::WIRE_VERSION;

/// Fixed header size: 1 (version) + 1 (type) + 1 (ttl) + 8 (timestamp)
/// + 1 (flags) + 2 (payload length) = 14.
pub const HEADER_SIZE: usize = 14;
/// Sender and recipient ids are fixed 8-byte fields, zero padded.
pub const PEER_ID_SIZE: usize = 8;
/// Detached Ed25519 signature length.
pub const SIGNATURE_SIZE: usize = 64;
/// Smallest decodable packet: header plus sender id.
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + PEER_ID_SIZE;

const FLAG_HAS_RECIPIENT: u8 = 0x01;
const FLAG_HAS_SIGNATURE: u8 = 0x02;
const FLAG_IS_COMPRESSED: u8 = 0x04;

/// Errors from packet envelope operations.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("packet too short: {0} bytes (minimum {MIN_PACKET_SIZE})")]
    TooShort(usize),

    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("truncated packet: {0}")]
    Truncated(&'static str),

    #[error("compressed payloads are not supported")]
    CompressionUnsupported,
}

/// Packet types carried in the envelope's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Announce = 0x01,
    KeyExchange = 0x02,
    Leave = 0x03,
    Message = 0x04,
    FragmentStart = 0x05,
    FragmentContinue = 0x06,
    FragmentEnd = 0x07,
    ChannelAnnounce = 0x08,
    ChannelRetention = 0x09,
    DeliveryAck = 0x0A,
    DeliveryStatusRequest = 0x0B,
    ReadReceipt = 0x0C,
}

impl PacketType {
    /// Convert from the raw type byte.
    pub fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            0x01 => Ok(Self::Announce),
            0x02 => Ok(Self::KeyExchange),
            0x03 => Ok(Self::Leave),
            0x04 => Ok(Self::Message),
            0x05 => Ok(Self::FragmentStart),
            0x06 => Ok(Self::FragmentContinue),
            0x07 => Ok(Self::FragmentEnd),
            0x08 => Ok(Self::ChannelAnnounce),
            0x09 => Ok(Self::ChannelRetention),
            0x0A => Ok(Self::DeliveryAck),
            0x0B => Ok(Self::DeliveryStatusRequest),
            0x0C => Ok(Self::ReadReceipt),
            _ => Err(WireError::UnknownPacketType(b)),
        }
    }

    /// Fragment chain types (`FRAGMENT_START`/`CONTINUE`/`END`).
    pub fn is_fragment(self) -> bool {
        matches!(
            self,
            Self::FragmentStart | Self::FragmentContinue | Self::FragmentEnd
        )
    }
}

/// Fixed 8-byte mesh peer identifier.
///
/// String ids are zero padded or truncated to exactly eight bytes, which
/// keeps envelope round-trips exact at the type level.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Broadcast recipient sentinel, all 0xFF.
    pub const BROADCAST: PeerId = PeerId([0xFF; PEER_ID_SIZE]);
    /// Placeholder id a transport reports before it has identified a peer.
    pub const UNKNOWN: PeerId = PeerId(*b"unknown\0");

    pub const fn new(bytes: [u8; PEER_ID_SIZE]) -> Self {
        PeerId(bytes)
    }

    /// Build from a string id, zero padding or truncating to eight bytes.
    pub fn from_str_id(id: &str) -> Self {
        Self::from_bytes(id.as_bytes())
    }

    /// Build from raw bytes, zero padding or truncating to eight bytes.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut bytes = [0u8; PEER_ID_SIZE];
        let n = raw.len().min(PEER_ID_SIZE);
        bytes[..n].copy_from_slice(&raw[..n]);
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        let trimmed = &self.0[..end];
        match std::str::from_utf8(trimmed) {
            Ok(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_graphic()) => f.write_str(s),
            _ => f.write_str(&hex::encode(self.0)),
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// A mesh packet envelope.
///
/// The type byte is kept raw so packets with type values outside
/// [`PacketType`] still decode; the dispatcher decides what to drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: u8,
    pub ttl: u8,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub sender: PeerId,
    pub recipient: Option<PeerId>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Packet {
    pub fn new(
        packet_type: PacketType,
        ttl: u8,
        timestamp: u64,
        sender: PeerId,
        recipient: Option<PeerId>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: WIRE_VERSION,
            packet_type: packet_type as u8,
            ttl,
            timestamp,
            sender,
            recipient,
            payload,
            signature: None,
        }
    }

    /// Resolve the raw type byte against the protocol table.
    pub fn known_type(&self) -> Result<PacketType, WireError> {
        PacketType::from_byte(self.packet_type)
    }

    /// Addressed to everyone: no recipient, or the broadcast sentinel.
    pub fn is_broadcast(&self) -> bool {
        match self.recipient {
            None => true,
            Some(r) => r.is_broadcast(),
        }
    }

    /// Relay copy with a replacement ttl. A fresh packet, never in-place
    /// mutation, so concurrent relay paths cannot alias.
    pub fn with_ttl(&self, ttl: u8) -> Packet {
        let mut relayed = self.clone();
        relayed.ttl = ttl;
        relayed
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload_len = self.payload.len().min(u16::MAX as usize);
        let mut out = Vec::with_capacity(
            HEADER_SIZE
                + PEER_ID_SIZE
                + self.recipient.map_or(0, |_| PEER_ID_SIZE)
                + payload_len
                + self.signature.map_or(0, |_| SIGNATURE_SIZE),
        );
        out.push(self.version);
        out.push(self.packet_type);
        out.push(self.ttl);
        out.extend_from_slice(&self.timestamp.to_be_bytes());

        let mut flags = 0u8;
        if self.recipient.is_some() {
            flags |= FLAG_HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            flags |= FLAG_HAS_SIGNATURE;
        }
        out.push(flags);
        out.extend_from_slice(&(payload_len as u16).to_be_bytes());

        out.extend_from_slice(self.sender.as_bytes());
        if let Some(recipient) = &self.recipient {
            out.extend_from_slice(recipient.as_bytes());
        }
        out.extend_from_slice(&self.payload[..payload_len]);
        if let Some(signature) = &self.signature {
            out.extend_from_slice(signature);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Packet, WireError> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(WireError::TooShort(data.len()));
        }
        let version = data[0];
        if version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let packet_type = data[1];
        let ttl = data[2];

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[3..11]);
        let timestamp = u64::from_be_bytes(ts);

        let flags = data[11];
        let has_recipient = flags & FLAG_HAS_RECIPIENT != 0;
        let has_signature = flags & FLAG_HAS_SIGNATURE != 0;
        let is_compressed = flags & FLAG_IS_COMPRESSED != 0;
        let payload_len = u16::from_be_bytes([data[12], data[13]]) as usize;

        let expected = HEADER_SIZE
            + PEER_ID_SIZE
            + if has_recipient { PEER_ID_SIZE } else { 0 }
            + payload_len
            + if has_signature { SIGNATURE_SIZE } else { 0 };
        if data.len() < expected {
            return Err(WireError::Truncated("declared lengths exceed buffer"));
        }

        let mut idx = HEADER_SIZE;
        let sender = PeerId::from_bytes(&data[idx..idx + PEER_ID_SIZE]);
        idx += PEER_ID_SIZE;

        let recipient = if has_recipient {
            let r = PeerId::from_bytes(&data[idx..idx + PEER_ID_SIZE]);
            idx += PEER_ID_SIZE;
            Some(r)
        } else {
            None
        };

        if is_compressed {
            // The flag and its 2-byte original-size prefix stay on the wire
            // for forward compatibility, but no encoder here produces them
            // and no decompressor is wired in.
            if payload_len < 2 {
                return Err(WireError::Truncated("compressed payload size prefix"));
            }
            return Err(WireError::CompressionUnsupported);
        }
        let payload = data[idx..idx + payload_len].to_vec();
        idx += payload_len;

        let signature = if has_signature {
            let mut sig = [0u8; SIGNATURE_SIZE];
            sig.copy_from_slice(&data[idx..idx + SIGNATURE_SIZE]);
            Some(sig)
        } else {
            None
        };

        Ok(Packet {
            version,
            packet_type,
            ttl,
            timestamp,
            sender,
            recipient,
            payload,
            signature,
        })
    }
}
