//! Named-secret persistence collaborators.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::CryptoError;

/// Opaque named-blob persistence for long-lived key material.
///
/// Single-key operations are atomic; nothing more is guaranteed.
pub trait SecretStore: Send + Sync {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), CryptoError>;
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;
    fn delete(&self, key: &str) -> Result<(), CryptoError>;
    fn clear_all(&self) -> Result<(), CryptoError>;
}

/// In-memory store for tests and hosts that handle persistence themselves.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), CryptoError> {
        let mut secrets = self.secrets.write().map_err(|_| CryptoError::LockPoisoned)?;
        secrets.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        let secrets = self.secrets.read().map_err(|_| CryptoError::LockPoisoned)?;
        Ok(secrets.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), CryptoError> {
        let mut secrets = self.secrets.write().map_err(|_| CryptoError::LockPoisoned)?;
        secrets.remove(key);
        Ok(())
    }

    fn clear_all(&self) -> Result<(), CryptoError> {
        let mut secrets = self.secrets.write().map_err(|_| CryptoError::LockPoisoned)?;
        secrets.clear();
        Ok(())
    }
}

/// One file per secret under a private directory.
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CryptoError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CryptoError> {
        if !is_valid_secret_name(key) {
            return Err(CryptoError::InvalidSecretName);
        }
        Ok(self.root.join(format!("{key}.secret")))
    }
}

fn is_valid_secret_name(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 64
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

impl SecretStore for FileSecretStore {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), CryptoError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(path)?))
    }

    fn delete(&self, key: &str) -> Result<(), CryptoError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn clear_all(&self) -> Result<(), CryptoError> {
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("secret") {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}
