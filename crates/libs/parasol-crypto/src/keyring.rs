//! Node key material and per-peer shared secrets.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use parasol_wire::PeerId;

use crate::error::CryptoError;
use crate::store::SecretStore;

/// Raw public key length for both curve families.
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Combined handshake blob: agreement ‖ session signing ‖ identity keys.
pub const KEY_BUNDLE_SIZE: usize = PUBLIC_KEY_SIZE * 3;
/// AES-GCM nonce length.
pub const NONCE_SIZE: usize = 12;
/// AES-GCM authentication tag length.
pub const TAG_SIZE: usize = 16;
/// Detached Ed25519 signature length.
pub const SIGNATURE_SIZE: usize = 64;

const HKDF_SALT: &[u8] = b"parasol-v1";
const IDENTITY_STORE_KEY: &str = "identity_key";

struct PeerKeys {
    agreement: PublicKey,
    signing: VerifyingKey,
    identity: VerifyingKey,
    shared_key: Zeroizing<[u8; 32]>,
}

/// The node's cryptographic engine.
///
/// Session keypairs are fresh per construction and never persisted; the
/// identity keypair loads from the [`SecretStore`] or is generated and
/// saved on first run. Per-peer derived keys live only in memory.
pub struct Keyring {
    store: Arc<dyn SecretStore>,
    agreement_secret: StaticSecret,
    agreement_public: PublicKey,
    session_signing: SigningKey,
    identity: SigningKey,
    peers: RwLock<HashMap<PeerId, PeerKeys>>,
}

impl Keyring {
    pub fn new(store: Arc<dyn SecretStore>) -> Result<Self, CryptoError> {
        let agreement_secret = StaticSecret::random_from_rng(OsRng);
        let agreement_public = PublicKey::from(&agreement_secret);
        let session_signing = SigningKey::generate(&mut OsRng);
        let identity = Self::load_or_create_identity(store.as_ref())?;
        Ok(Self {
            store,
            agreement_secret,
            agreement_public,
            session_signing,
            identity,
            peers: RwLock::new(HashMap::new()),
        })
    }

    fn load_or_create_identity(store: &dyn SecretStore) -> Result<SigningKey, CryptoError> {
        if let Some(bytes) = store.load(IDENTITY_STORE_KEY)? {
            let bytes = Zeroizing::new(bytes);
            match <[u8; 32]>::try_from(bytes.as_slice()) {
                Ok(seed) => return Ok(SigningKey::from_bytes(&seed)),
                Err(_) => {
                    log::warn!("keyring: stored identity key has wrong length, regenerating");
                }
            }
        }
        let identity = SigningKey::generate(&mut OsRng);
        store.save(IDENTITY_STORE_KEY, identity.to_bytes().as_slice())?;
        log::info!("keyring: generated new identity key");
        Ok(identity)
    }

    /// The 96-byte handshake blob sent in KEY_EXCHANGE packets.
    pub fn combined_public_key_data(&self) -> [u8; KEY_BUNDLE_SIZE] {
        let mut out = [0u8; KEY_BUNDLE_SIZE];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(self.agreement_public.as_bytes());
        out[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE * 2]
            .copy_from_slice(self.session_signing.verifying_key().as_bytes());
        out[PUBLIC_KEY_SIZE * 2..].copy_from_slice(self.identity.verifying_key().as_bytes());
        out
    }

    /// Install a peer's handshake blob and derive the shared symmetric key.
    ///
    /// The derived key is cached per peer id and reused for every
    /// encrypt/decrypt with that peer until the process restarts.
    pub fn add_peer_public_key(&self, peer: PeerId, blob: &[u8]) -> Result<(), CryptoError> {
        if blob.len() != KEY_BUNDLE_SIZE {
            return Err(CryptoError::InvalidKeyBundle(blob.len()));
        }
        let mut agreement_bytes = [0u8; PUBLIC_KEY_SIZE];
        agreement_bytes.copy_from_slice(&blob[..PUBLIC_KEY_SIZE]);
        let agreement = PublicKey::from(agreement_bytes);

        let mut signing_bytes = [0u8; PUBLIC_KEY_SIZE];
        signing_bytes.copy_from_slice(&blob[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE * 2]);
        let signing = VerifyingKey::from_bytes(&signing_bytes)
            .map_err(|_| CryptoError::InvalidKey("peer session signing key"))?;

        let mut identity_bytes = [0u8; PUBLIC_KEY_SIZE];
        identity_bytes.copy_from_slice(&blob[PUBLIC_KEY_SIZE * 2..]);
        let identity = VerifyingKey::from_bytes(&identity_bytes)
            .map_err(|_| CryptoError::InvalidKey("peer identity key"))?;

        let raw_secret = self.agreement_secret.diffie_hellman(&agreement);
        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), raw_secret.as_bytes());
        let mut shared_key = Zeroizing::new([0u8; 32]);
        hkdf.expand(&[], shared_key.as_mut())
            .map_err(|_| CryptoError::KeyDerivation)?;

        let mut peers = self.peers.write().map_err(|_| CryptoError::LockPoisoned)?;
        peers.insert(
            peer,
            PeerKeys {
                agreement,
                signing,
                identity,
                shared_key,
            },
        );
        log::debug!("keyring: derived shared secret for {peer}");
        Ok(())
    }

    /// AEAD-encrypt for a peer. Output is nonce ‖ ciphertext+tag, nonce
    /// first, with a fresh random nonce per call.
    pub fn encrypt(&self, plaintext: &[u8], peer: PeerId) -> Result<Vec<u8>, CryptoError> {
        let key = self.shared_key_for(peer)?;
        let cipher =
            Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| CryptoError::EncryptFailed)?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt nonce ‖ ciphertext+tag from a peer.
    pub fn decrypt(&self, data: &[u8], peer: PeerId) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort(data.len()));
        }
        let key = self.shared_key_for(peer)?;
        let cipher =
            Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| CryptoError::DecryptFailed)?;
        cipher
            .decrypt(Nonce::from_slice(&data[..NONCE_SIZE]), &data[NONCE_SIZE..])
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// Sign with the session signing key.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.session_signing.sign(data).to_bytes()
    }

    /// Verify against a peer's session signing key. Unknown peers, bad
    /// signature bytes and failed verification all come back false.
    pub fn verify(&self, signature: &[u8], data: &[u8], peer: PeerId) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        let Ok(peers) = self.peers.read() else {
            return false;
        };
        match peers.get(&peer) {
            Some(keys) => keys.signing.verify(data, &signature).is_ok(),
            None => false,
        }
    }

    /// A peer's long-term identity key, for trust binding independent of
    /// session keys.
    pub fn peer_identity_key(&self, peer: PeerId) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        let peers = self.peers.read().ok()?;
        peers.get(&peer).map(|keys| keys.identity.to_bytes())
    }

    /// A peer's session agreement key as received in its handshake blob.
    pub fn peer_agreement_key(&self, peer: PeerId) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        let peers = self.peers.read().ok()?;
        peers.get(&peer).map(|keys| *keys.agreement.as_bytes())
    }

    /// Whether key exchange has completed with this peer.
    pub fn has_peer(&self, peer: PeerId) -> bool {
        self.peers
            .read()
            .map(|peers| peers.contains_key(&peer))
            .unwrap_or(false)
    }

    /// Hex SHA-256 of the identity public key. Stable across restarts.
    pub fn identity_fingerprint(&self) -> String {
        let digest = Sha256::digest(self.identity.verifying_key().as_bytes());
        hex::encode(digest)
    }

    /// Remove the persisted identity key. The in-memory identity stays
    /// valid for this session; the next start generates a fresh one.
    pub fn clear_persistent_identity(&self) -> Result<(), CryptoError> {
        self.store.delete(IDENTITY_STORE_KEY)
    }

    fn shared_key_for(&self, peer: PeerId) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let peers = self.peers.read().map_err(|_| CryptoError::LockPoisoned)?;
        peers
            .get(&peer)
            .map(|keys| keys.shared_key.clone())
            .ok_or(CryptoError::UnknownPeer(peer))
    }
}
