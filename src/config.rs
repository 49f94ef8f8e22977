//! Configuration management for cryptbridge

use crate::crypto::NONCE_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default plaintext block size: 4KB
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Largest block size accepted by validation: 1MB
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Mount configuration
    pub mount: MountConfig,

    /// Encryption configuration
    pub encryption: EncryptionConfig,

    /// Path to the data directory
    pub data_dir: PathBuf,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Virtual mount point path
    pub mount_point: PathBuf,

    /// Directory holding the encrypted files
    pub backing_root: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Plaintext bytes per encrypted block
    pub block_size: usize,

    /// Per-mount nonce base, combined with file identity and block index
    #[serde(with = "hex_serde")]
    pub base_nonce: Vec<u8>,

    /// Raw 32-byte key file; a passphrase is prompted for when unset
    pub key_file: Option<PathBuf>,

    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Salt for key derivation (will be generated if not set)
    #[serde(with = "hex_serde")]
    pub salt: Vec<u8>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cryptbridge");

        Config {
            mount: MountConfig {
                mount_point: PathBuf::from("/mnt/cryptbridge"),
                backing_root: data_dir.join("backing"),
                allow_other: false,
                auto_unmount: true,
            },
            encryption: EncryptionConfig::default(),
            data_dir,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            base_nonce: Vec::new(), // Generated by `init`
            key_file: None,
            argon2_memory_kib: 65536, // 64 MiB
            argon2_iterations: 3,
            argon2_parallelism: 4,
            salt: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("CRYPTBRIDGE_BACKING_ROOT") {
            let root = root.trim();
            if !root.is_empty() {
                self.mount.backing_root = PathBuf::from(root);
            }
        }

        if let Ok(mount_point) = std::env::var("CRYPTBRIDGE_MOUNT_POINT") {
            let mount_point = mount_point.trim();
            if !mount_point.is_empty() {
                self.mount.mount_point = PathBuf::from(mount_point);
            }
        }

        if let Ok(block_size) = std::env::var("CRYPTBRIDGE_BLOCK_SIZE") {
            if let Ok(size) = block_size.trim().parse::<usize>() {
                self.encryption.block_size = size;
            }
        }

        if let Ok(key_file) = std::env::var("CRYPTBRIDGE_KEY_FILE") {
            let key_file = key_file.trim();
            if !key_file.is_empty() {
                self.encryption.key_file = Some(PathBuf::from(key_file));
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let block_size = self.encryption.block_size;
        if block_size == 0 {
            return Err(Error::InvalidConfig(
                "Block size must be greater than 0".to_string(),
            ));
        }

        if block_size > MAX_BLOCK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Block size {} exceeds the {} byte limit",
                block_size, MAX_BLOCK_SIZE
            )));
        }

        if self.encryption.base_nonce.len() != NONCE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Base nonce must be {} bytes, got {}",
                NONCE_SIZE,
                self.encryption.base_nonce.len()
            )));
        }

        if self.mount.backing_root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Backing root is required".to_string(),
            ));
        }

        if self.mount.mount_point.starts_with(&self.mount.backing_root) {
            return Err(Error::InvalidConfig(
                "Mount point must not be inside the backing root".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.mount.backing_root)?;
        Ok(())
    }
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
