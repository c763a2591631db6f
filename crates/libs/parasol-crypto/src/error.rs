use parasol_wire::PeerId;

use crate::keyring::KEY_BUNDLE_SIZE;

/// Errors from key management and AEAD operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("secret storage i/o: {0}")]
    Storage(#[from] std::io::Error),

    #[error("invalid secret name")]
    InvalidSecretName,

    #[error("key bundle must be {KEY_BUNDLE_SIZE} bytes, got {0}")]
    InvalidKeyBundle(usize),

    #[error("invalid {0}")]
    InvalidKey(&'static str),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("no shared secret for peer {0}")]
    UnknownPeer(PeerId),

    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("encryption failed")]
    EncryptFailed,

    #[error("authenticated decryption failed")]
    DecryptFailed,

    #[error("key table lock poisoned")]
    LockPoisoned,
}
