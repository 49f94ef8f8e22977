//! Mount context: everything fixed for the lifetime of one mount

use crate::config::Config;
use crate::crypto::{MountKey, NONCE_SIZE};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Immutable per-mount state, built once at mount time
#[derive(Debug)]
pub struct MountContext {
    key: MountKey,
    base_nonce: [u8; NONCE_SIZE],
    backing_root: PathBuf,
    block_size: usize,
}

impl MountContext {
    pub fn new(
        key: MountKey,
        base_nonce: [u8; NONCE_SIZE],
        backing_root: impl Into<PathBuf>,
        block_size: usize,
    ) -> Self {
        Self {
            key,
            base_nonce,
            backing_root: backing_root.into(),
            block_size,
        }
    }

    /// Build the context from a validated configuration
    pub fn from_config(config: &Config, key: MountKey) -> Result<Self> {
        let base_nonce: [u8; NONCE_SIZE] = config
            .encryption
            .base_nonce
            .as_slice()
            .try_into()
            .map_err(|_| {
                Error::InvalidConfig(format!("Base nonce must be {} bytes", NONCE_SIZE))
            })?;

        let backing_root = config.mount.backing_root.canonicalize().map_err(|e| {
            Error::Config(format!(
                "Backing root {:?} is not accessible: {}",
                config.mount.backing_root, e
            ))
        })?;

        Ok(Self::new(
            key,
            base_nonce,
            backing_root,
            config.encryption.block_size,
        ))
    }

    pub fn key(&self) -> &MountKey {
        &self.key
    }

    pub fn base_nonce(&self) -> [u8; NONCE_SIZE] {
        self.base_nonce
    }

    pub fn backing_root(&self) -> &Path {
        &self.backing_root
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}
