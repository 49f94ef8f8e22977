//! Passphrase key derivation using Argon2id
//!
//! Mounts without a key file derive their AES key from a passphrase. The salt
//! lives in the config so the same passphrase reopens the same backing store.

use crate::config::EncryptionConfig;
use crate::crypto::{KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::Zeroizing;

/// Key material derived from a passphrase
pub struct DerivedKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl DerivedKey {
    /// Get the key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

/// Derive a mount key from a passphrase
///
/// The salt must be at least [`SALT_SIZE`] bytes; only the first
/// [`SALT_SIZE`] bytes are used.
pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    config: &EncryptionConfig,
) -> Result<DerivedKey> {
    if salt.len() < SALT_SIZE {
        return Err(Error::KeyDerivation(format!(
            "Salt too short: {} bytes, need {}",
            salt.len(),
            SALT_SIZE
        )));
    }

    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivation(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(password, &salt[..SALT_SIZE], key.as_mut())
        .map_err(|e| Error::KeyDerivation(format!("Key derivation failed: {}", e)))?;

    Ok(DerivedKey { key })
}

/// Generate a random salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EncryptionConfig {
        EncryptionConfig {
            argon2_memory_kib: 1024, // Low for testing
            argon2_iterations: 1,
            argon2_parallelism: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let config = test_config();
        let salt = generate_salt();

        let key1 = derive_key(b"password", &salt, &config).unwrap();
        let key2 = derive_key(b"password", &salt, &config).unwrap();

        assert_eq!(key1.key(), key2.key());
    }

    #[test]
    fn test_different_passwords_different_keys() {
        let config = test_config();
        let salt = generate_salt();

        let key1 = derive_key(b"password1", &salt, &config).unwrap();
        let key2 = derive_key(b"password2", &salt, &config).unwrap();

        assert_ne!(key1.key(), key2.key());
    }

    #[test]
    fn test_short_salt_rejected() {
        let config = test_config();
        let result = derive_key(b"password", &[0u8; 8], &config);
        assert!(matches!(result, Err(Error::KeyDerivation(_))));
    }
}
