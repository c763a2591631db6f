//! Engine tunables.

use std::ops::Range;
use std::time::Duration;

use crate::fragments::FRAGMENT_HEADER_SIZE;

/// Every interval, cap, jitter range and hop budget the engine uses.
///
/// The defaults are the wire-compatible values; changing a cap or sweep
/// interval is safe, changing `max_packet_size` is a protocol decision.
/// Tests zero the jitter ranges and delays to make timing deterministic.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Largest packet the transport will take in one frame.
    pub max_packet_size: usize,

    /// Partial fragment groups older than this are discarded.
    pub fragment_timeout: Duration,
    pub fragment_sweep_interval: Duration,

    /// Accept window around a packet's timestamp, and the dedup horizon.
    pub dedup_window: Duration,
    pub security_sweep_interval: Duration,
    pub max_processed_messages: usize,
    pub max_processed_exchanges: usize,

    /// Peers unseen for this long are evicted.
    pub peer_stale_after: Duration,
    pub peer_sweep_interval: Duration,
    /// Age beyond which a same-nickname record under another peer id is
    /// treated as a ghost and evicted on announce.
    pub nickname_eviction_age: Duration,

    pub favorite_queue_cap: usize,
    pub ordinary_queue_cap: usize,
    /// Lifetime of entries in the ordinary store-and-forward queue.
    pub cached_message_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub max_delivered_bookkeeping: usize,
    pub max_flushed_bookkeeping: usize,
    /// Gap between consecutive cached sends when flushing to a peer.
    pub cached_send_spacing: Duration,

    /// Randomized wait before relaying an announce, in milliseconds.
    pub announce_relay_jitter: Range<u64>,
    /// Randomized wait before a policy relay, in milliseconds.
    pub relay_jitter: Range<u64>,

    /// Handshake sequencing: wait, announce back, wait, flush cache.
    pub handshake_announce_delay: Duration,
    pub handshake_flush_delay: Duration,

    pub message_ttl: u8,
    pub announce_ttl: u8,
    pub leave_ttl: u8,
    pub ack_ttl: u8,
    pub key_exchange_ttl: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 500,
            fragment_timeout: Duration::from_secs(30),
            fragment_sweep_interval: Duration::from_secs(10),
            dedup_window: Duration::from_secs(5 * 60),
            security_sweep_interval: Duration::from_secs(5 * 60),
            max_processed_messages: 10_000,
            max_processed_exchanges: 1_000,
            peer_stale_after: Duration::from_secs(3 * 60),
            peer_sweep_interval: Duration::from_secs(60),
            nickname_eviction_age: Duration::from_secs(10),
            favorite_queue_cap: 1_000,
            ordinary_queue_cap: 100,
            cached_message_ttl: Duration::from_secs(12 * 60 * 60),
            cache_sweep_interval: Duration::from_secs(10 * 60),
            max_delivered_bookkeeping: 1_000,
            max_flushed_bookkeeping: 200,
            cached_send_spacing: Duration::from_millis(100),
            announce_relay_jitter: 100..300,
            relay_jitter: 50..500,
            handshake_announce_delay: Duration::from_millis(100),
            handshake_flush_delay: Duration::from_millis(500),
            message_ttl: 7,
            announce_ttl: 3,
            leave_ttl: 3,
            ack_ttl: 3,
            key_exchange_ttl: 1,
        }
    }
}

impl EngineConfig {
    /// Payload bytes left for fragment data once the sub-header is in.
    pub fn fragment_chunk_size(&self) -> usize {
        self.max_packet_size.saturating_sub(FRAGMENT_HEADER_SIZE)
    }

    /// Variant with zeroed jitters and delays for deterministic tests.
    pub fn immediate() -> Self {
        Self {
            announce_relay_jitter: 0..0,
            relay_jitter: 0..0,
            handshake_announce_delay: Duration::ZERO,
            handshake_flush_delay: Duration::ZERO,
            cached_send_spacing: Duration::ZERO,
            ..Self::default()
        }
    }
}
