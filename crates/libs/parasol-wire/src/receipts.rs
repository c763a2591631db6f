//! Delivery acknowledgment and read receipt bodies.
//!
//! These travel end-to-end encrypted inside DELIVERY_ACK / READ_RECEIPT
//! packets as JSON. Key casing is fixed by the wire contract.

use serde::{Deserialize, Serialize};

/// Acknowledgment a recipient sends back for a delivered private message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAck {
    #[serde(rename = "originalMessageID")]
    pub original_message_id: String,
    #[serde(rename = "ackID")]
    pub ack_id: String,
    #[serde(rename = "recipientID")]
    pub recipient_id: String,
    pub recipient_nickname: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub hop_count: u8,
}

impl DeliveryAck {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Receipt a reader sends back once a private message has been read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(rename = "originalMessageID")]
    pub original_message_id: String,
    #[serde(rename = "receiptID")]
    pub receipt_id: String,
    #[serde(rename = "readerID")]
    pub reader_id: String,
    pub reader_nickname: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl ReadReceipt {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
