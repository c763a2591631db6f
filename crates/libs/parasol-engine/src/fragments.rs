//! Splitting oversized packets and reassembling them on arrival.
//!
//! A fragment payload is a 13 byte sub-header followed by a slice of the
//! original packet's encoded bytes:
//!
//! ```text
//! group id (8) | index u16 BE (2) | total u16 BE (2) | original type (1) | data
//! ```
//!
//! The first fragment of a group goes out as `FragmentStart`, the last as
//! `FragmentEnd`, everything between as `FragmentContinue`. Reassembly
//! concatenates the data slices in index order and decodes the result as
//! a fresh packet.

use std::collections::HashMap;
use std::time::Duration;

use parasol_wire::{Packet, PacketType};
use rand_core::{OsRng, RngCore};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::now_ms;

/// Bytes of sub-header preceding the data slice in every fragment.
pub const FRAGMENT_HEADER_SIZE: usize = 13;

const GROUP_ID_SIZE: usize = 8;

struct FragmentAssembly {
    original_type: u8,
    total: u16,
    created_at: Instant,
    chunks: HashMap<u16, Vec<u8>>,
}

/// Collects fragments per group id until a packet can be rebuilt.
///
/// Incomplete groups are dropped by [`FragmentManager::sweep`] once they
/// exceed the assembly timeout.
pub struct FragmentManager {
    max_packet_size: usize,
    chunk_size: usize,
    timeout: Duration,
    assemblies: Mutex<HashMap<[u8; GROUP_ID_SIZE], FragmentAssembly>>,
}

impl FragmentManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_packet_size: config.max_packet_size,
            chunk_size: config.fragment_chunk_size(),
            timeout: config.fragment_timeout,
            assemblies: Mutex::new(HashMap::new()),
        }
    }

    /// Splits `packet` if its encoding exceeds the transport frame size.
    ///
    /// Small packets come back as a single-element vector holding a clone
    /// of the input. Fragments inherit sender, recipient and TTL; the
    /// timestamp is taken fresh and signatures are not carried over, each
    /// fragment stands alone on the wire.
    pub fn create_fragments(&self, packet: &Packet) -> Vec<Packet> {
        let encoded = packet.encode();
        if encoded.len() <= self.max_packet_size {
            return vec![packet.clone()];
        }

        let mut group_id = [0u8; GROUP_ID_SIZE];
        OsRng.fill_bytes(&mut group_id);

        let chunks: Vec<&[u8]> = encoded.chunks(self.chunk_size).collect();
        let total = chunks.len() as u16;
        let timestamp = now_ms();

        chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let fragment_type = if index == 0 {
                    PacketType::FragmentStart
                } else if index == chunks.len() - 1 {
                    PacketType::FragmentEnd
                } else {
                    PacketType::FragmentContinue
                };

                let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
                payload.extend_from_slice(&group_id);
                payload.extend_from_slice(&(index as u16).to_be_bytes());
                payload.extend_from_slice(&total.to_be_bytes());
                payload.push(packet.packet_type);
                payload.extend_from_slice(chunk);

                Packet {
                    version: packet.version,
                    packet_type: fragment_type as u8,
                    ttl: packet.ttl,
                    timestamp,
                    sender: packet.sender,
                    recipient: packet.recipient,
                    payload,
                    signature: None,
                }
            })
            .collect()
    }

    /// Feeds one received fragment into its assembly.
    ///
    /// Returns the rebuilt packet once the final piece of the group has
    /// arrived, `None` while pieces are still missing or the fragment is
    /// malformed.
    pub async fn handle_fragment(&self, packet: &Packet) -> Option<Packet> {
        let payload = &packet.payload;
        if payload.len() < FRAGMENT_HEADER_SIZE {
            log::debug!(
                "fragments: payload {} bytes, below sub-header size",
                payload.len()
            );
            return None;
        }

        let mut group_id = [0u8; GROUP_ID_SIZE];
        group_id.copy_from_slice(&payload[..GROUP_ID_SIZE]);
        let index = u16::from_be_bytes([payload[8], payload[9]]);
        let total = u16::from_be_bytes([payload[10], payload[11]]);
        let original_type = payload[12];
        let data = payload[FRAGMENT_HEADER_SIZE..].to_vec();

        if index >= total {
            log::debug!("fragments: index {index} out of range for total {total}");
            return None;
        }

        let mut assemblies = self.assemblies.lock().await;
        let assembly = assemblies
            .entry(group_id)
            .or_insert_with(|| FragmentAssembly {
                original_type,
                total,
                created_at: Instant::now(),
                chunks: HashMap::new(),
            });
        assembly.chunks.insert(index, data);

        if assembly.chunks.len() < assembly.total as usize {
            return None;
        }

        let mut bytes = Vec::new();
        for i in 0..assembly.total {
            bytes.extend_from_slice(assembly.chunks.get(&i)?);
        }
        let expected_type = assembly.original_type;
        assemblies.remove(&group_id);
        drop(assemblies);

        match Packet::decode(&bytes) {
            Ok(rebuilt) => {
                if rebuilt.packet_type != expected_type {
                    log::debug!(
                        "fragments: rebuilt type 0x{:02x} disagrees with sub-header 0x{expected_type:02x}",
                        rebuilt.packet_type
                    );
                }
                Some(rebuilt)
            }
            Err(err) => {
                log::debug!("fragments: reassembled bytes failed to decode: {err}");
                None
            }
        }
    }

    /// Drops assemblies older than the configured timeout.
    pub async fn sweep(&self) {
        let mut assemblies = self.assemblies.lock().await;
        let before = assemblies.len();
        assemblies.retain(|_, assembly| assembly.created_at.elapsed() <= self.timeout);
        let dropped = before - assemblies.len();
        if dropped > 0 {
            log::debug!("fragments: dropped {dropped} stale assemblies");
        }
    }

    /// Number of groups currently waiting on more pieces.
    pub async fn pending_groups(&self) -> usize {
        self.assemblies.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parasol_wire::PeerId;

    fn big_packet(payload_len: usize) -> Packet {
        Packet::new(
            PacketType::Message,
            5,
            now_ms(),
            PeerId::from_str_id("cafe0001"),
            None,
            vec![0xAB; payload_len],
        )
    }

    #[test]
    fn small_packet_is_not_fragmented() {
        let manager = FragmentManager::new(&EngineConfig::default());
        let packet = big_packet(100);
        let fragments = manager.create_fragments(&packet);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].payload, packet.payload);
    }

    #[test]
    fn fragments_carry_subheader_and_slices() {
        let manager = FragmentManager::new(&EngineConfig::default());
        let packet = big_packet(1000);
        let encoded = packet.encode();

        let fragments = manager.create_fragments(&packet);
        let expected = encoded.len().div_ceil(487);
        assert_eq!(fragments.len(), expected);

        assert_eq!(fragments[0].packet_type, PacketType::FragmentStart as u8);
        assert_eq!(
            fragments.last().map(|f| f.packet_type),
            Some(PacketType::FragmentEnd as u8)
        );

        let mut rebuilt = Vec::new();
        for (i, fragment) in fragments.iter().enumerate() {
            let payload = &fragment.payload;
            assert_eq!(&payload[..8], &fragments[0].payload[..8], "group id");
            assert_eq!(u16::from_be_bytes([payload[8], payload[9]]), i as u16);
            assert_eq!(
                u16::from_be_bytes([payload[10], payload[11]]),
                fragments.len() as u16
            );
            assert_eq!(payload[12], PacketType::Message as u8);
            rebuilt.extend_from_slice(&payload[13..]);
        }
        assert_eq!(rebuilt, encoded);
    }

    #[test]
    fn fragments_keep_routing_fields() {
        let manager = FragmentManager::new(&EngineConfig::default());
        let mut packet = big_packet(600);
        packet.recipient = Some(PeerId::from_str_id("beef0002"));

        for fragment in manager.create_fragments(&packet) {
            assert_eq!(fragment.sender, packet.sender);
            assert_eq!(fragment.recipient, packet.recipient);
            assert_eq!(fragment.ttl, packet.ttl);
            assert!(fragment.signature.is_none());
        }
    }
}
