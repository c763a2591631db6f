//! Parasol cryptographic engine.
//!
//! Owns the node's key material: a persisted Ed25519 identity, per-session
//! X25519 agreement and Ed25519 signing keypairs, and per-peer symmetric
//! keys derived from key exchange. AEAD framing and the traffic-shape
//! padding scheme live here too. Session keys never touch storage; only
//! the identity key persists, through a [`SecretStore`].

pub mod error;
pub mod keyring;
pub mod padding;
pub mod store;

pub use error::CryptoError;
pub use keyring::{Keyring, KEY_BUNDLE_SIZE, NONCE_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
pub use padding::{optimal_block_size, pad_to_block, unpad};
pub use store::{FileSecretStore, MemorySecretStore, SecretStore};
