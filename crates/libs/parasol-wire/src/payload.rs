//! Chat message payload codec.
//!
//! Flag-prefixed TLV body nested inside MESSAGE packets. Short string
//! fields carry a 1-byte length, content a 2-byte length; anything longer
//! than its prefix can express is silently truncated at encode time. That
//! lossy edge is part of the format, not a failure.

const FLAG_IS_RELAY: u8 = 0x01;
const FLAG_IS_PRIVATE: u8 = 0x02;
const FLAG_HAS_ORIGINAL_SENDER: u8 = 0x04;
const FLAG_HAS_RECIPIENT_NICKNAME: u8 = 0x08;
const FLAG_HAS_SENDER_PEER_ID: u8 = 0x10;
const FLAG_HAS_MENTIONS: u8 = 0x20;
const FLAG_HAS_CHANNEL: u8 = 0x40;
const FLAG_IS_ENCRYPTED: u8 = 0x80;

const SHORT_FIELD_MAX: usize = u8::MAX as usize;
const CONTENT_MAX: usize = u16::MAX as usize;
const MAX_MENTIONS: usize = u8::MAX as usize;

/// Smallest decodable body: flags(1) + timestamp(8) + id length(1)
/// + sender length(1) + content length(2).
pub const MIN_PAYLOAD_SIZE: usize = 13;

/// Errors from chat payload decode.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload too short: {0} bytes (minimum {MIN_PAYLOAD_SIZE})")]
    TooShort(usize),

    #[error("truncated payload: {0}")]
    Truncated(&'static str),
}

/// Message body, either readable or end-to-end encrypted. Exactly one of
/// the two is meaningful for a given message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Plain(String),
    Encrypted(Vec<u8>),
}

impl MessageContent {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }
}

/// Local delivery progress for a sent message. Never wire-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered { to: String, at: u64 },
    Read { by: String, at: u64 },
    Failed { reason: String },
    PartiallyDelivered { reached: u32, total: u32 },
}

/// A chat message as carried inside a MESSAGE packet payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub sender: String,
    pub content: MessageContent,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub is_relay: bool,
    pub is_private: bool,
    pub original_sender: Option<String>,
    pub recipient_nickname: Option<String>,
    pub sender_peer_id: Option<String>,
    pub mentions: Vec<String>,
    pub channel: Option<String>,
    pub delivery_status: Option<DeliveryStatus>,
}

impl ChatMessage {
    pub fn new(id: &str, sender: &str, content: MessageContent, timestamp: u64) -> Self {
        Self {
            id: id.to_string(),
            sender: sender.to_string(),
            content,
            timestamp,
            is_relay: false,
            is_private: false,
            original_sender: None,
            recipient_nickname: None,
            sender_peer_id: None,
            mentions: Vec::new(),
            channel: None,
            delivery_status: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_PAYLOAD_SIZE + 64);

        let mut flags = 0u8;
        if self.is_relay {
            flags |= FLAG_IS_RELAY;
        }
        if self.is_private {
            flags |= FLAG_IS_PRIVATE;
        }
        if self.original_sender.is_some() {
            flags |= FLAG_HAS_ORIGINAL_SENDER;
        }
        if self.recipient_nickname.is_some() {
            flags |= FLAG_HAS_RECIPIENT_NICKNAME;
        }
        if self.sender_peer_id.is_some() {
            flags |= FLAG_HAS_SENDER_PEER_ID;
        }
        if !self.mentions.is_empty() {
            flags |= FLAG_HAS_MENTIONS;
        }
        if self.channel.is_some() {
            flags |= FLAG_HAS_CHANNEL;
        }
        if self.content.is_encrypted() {
            flags |= FLAG_IS_ENCRYPTED;
        }
        out.push(flags);

        out.extend_from_slice(&self.timestamp.to_be_bytes());
        put_short(&mut out, self.id.as_bytes());
        put_short(&mut out, self.sender.as_bytes());

        match &self.content {
            MessageContent::Plain(text) => put_content(&mut out, text.as_bytes()),
            MessageContent::Encrypted(data) => put_content(&mut out, data),
        }

        if let Some(original_sender) = &self.original_sender {
            put_short(&mut out, original_sender.as_bytes());
        }
        if let Some(recipient_nickname) = &self.recipient_nickname {
            put_short(&mut out, recipient_nickname.as_bytes());
        }
        if let Some(sender_peer_id) = &self.sender_peer_id {
            put_short(&mut out, sender_peer_id.as_bytes());
        }
        if !self.mentions.is_empty() {
            let count = self.mentions.len().min(MAX_MENTIONS);
            out.push(count as u8);
            for mention in self.mentions.iter().take(count) {
                put_short(&mut out, mention.as_bytes());
            }
        }
        if let Some(channel) = &self.channel {
            put_short(&mut out, channel.as_bytes());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<ChatMessage, PayloadError> {
        if data.len() < MIN_PAYLOAD_SIZE {
            return Err(PayloadError::TooShort(data.len()));
        }
        let mut r = Reader { data, idx: 0 };

        let flags = r.u8("flags")?;
        let is_relay = flags & FLAG_IS_RELAY != 0;
        let is_private = flags & FLAG_IS_PRIVATE != 0;
        let is_encrypted = flags & FLAG_IS_ENCRYPTED != 0;

        let timestamp = r.u64("timestamp")?;
        let id = r.short_string("id")?;
        let sender = r.short_string("sender")?;

        let content_len = r.u16("content length")? as usize;
        let content_bytes = r.take(content_len, "content")?;
        let content = if is_encrypted {
            MessageContent::Encrypted(content_bytes.to_vec())
        } else {
            MessageContent::Plain(String::from_utf8_lossy(content_bytes).into_owned())
        };

        let original_sender = if flags & FLAG_HAS_ORIGINAL_SENDER != 0 {
            Some(r.short_string("original sender")?)
        } else {
            None
        };
        let recipient_nickname = if flags & FLAG_HAS_RECIPIENT_NICKNAME != 0 {
            Some(r.short_string("recipient nickname")?)
        } else {
            None
        };
        let sender_peer_id = if flags & FLAG_HAS_SENDER_PEER_ID != 0 {
            Some(r.short_string("sender peer id")?)
        } else {
            None
        };
        let mentions = if flags & FLAG_HAS_MENTIONS != 0 {
            let count = r.u8("mention count")? as usize;
            let mut list = Vec::with_capacity(count);
            for _ in 0..count {
                list.push(r.short_string("mention")?);
            }
            list
        } else {
            Vec::new()
        };
        let channel = if flags & FLAG_HAS_CHANNEL != 0 {
            Some(r.short_string("channel")?)
        } else {
            None
        };

        Ok(ChatMessage {
            id,
            sender,
            content,
            timestamp,
            is_relay,
            is_private,
            original_sender,
            recipient_nickname,
            sender_peer_id,
            mentions,
            channel,
            delivery_status: None,
        })
    }
}

fn put_short(out: &mut Vec<u8>, raw: &[u8]) {
    let len = raw.len().min(SHORT_FIELD_MAX);
    out.push(len as u8);
    out.extend_from_slice(&raw[..len]);
}

fn put_content(out: &mut Vec<u8>, raw: &[u8]) {
    let len = raw.len().min(CONTENT_MAX);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&raw[..len]);
}

struct Reader<'a> {
    data: &'a [u8],
    idx: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], PayloadError> {
        if self.data.len() - self.idx < n {
            return Err(PayloadError::Truncated(what));
        }
        let slice = &self.data[self.idx..self.idx + n];
        self.idx += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, PayloadError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, PayloadError> {
        let raw = self.take(2, what)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, PayloadError> {
        let raw = self.take(8, what)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_be_bytes(bytes))
    }

    fn short_string(&mut self, what: &'static str) -> Result<String, PayloadError> {
        let len = self.u8(what)? as usize;
        let raw = self.take(len, what)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }
}
