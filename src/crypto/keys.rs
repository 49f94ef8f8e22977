//! Mount key management

use crate::config::EncryptionConfig;
use crate::crypto::{derive_key, KEY_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;
use std::path::Path;
use zeroize::Zeroizing;

/// The symmetric key of one mount (zeroized on drop)
pub struct MountKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl MountKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(key.as_mut());
        Self { key }
    }

    /// Derive the key from a passphrase with the configured Argon2 parameters
    pub fn from_password(password: &[u8], config: &EncryptionConfig) -> Result<Self> {
        let derived = derive_key(password, &config.salt, config)?;
        Ok(Self::from_bytes(*derived.key()))
    }

    /// Load a key file holding either 32 raw bytes or 64 hex characters
    pub fn load(path: &Path) -> Result<Self> {
        let data = Zeroizing::new(std::fs::read(path).map_err(|e| {
            Error::KeyDerivation(format!("Failed to read key file {:?}: {}", path, e))
        })?);

        if data.len() == KEY_SIZE {
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(&data);
            return Ok(Self::from_bytes(key));
        }

        let text = std::str::from_utf8(&data)
            .map_err(|_| Error::KeyDerivation(format!("Key file {:?} is not valid", path)))?
            .trim();
        let mut key = [0u8; KEY_SIZE];
        hex::decode_to_slice(text, &mut key).map_err(|_| {
            Error::KeyDerivation(format!(
                "Key file {:?} must hold {} raw bytes or {} hex characters",
                path,
                KEY_SIZE,
                KEY_SIZE * 2
            ))
        })?;
        Ok(Self::from_bytes(key))
    }

    /// Write the key as raw bytes, readable by the owner only
    pub fn save(&self, path: &Path) -> Result<()> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(self.key.as_ref())?;
        file.sync_all()?;
        Ok(())
    }

    /// Get the key bytes
    pub fn bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for MountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MountKey(..)")
    }
}
