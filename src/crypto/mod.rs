//! Cryptography module for cryptbridge
//!
//! Provides block-wise AES-256-GCM content encryption with per-block nonces,
//! plus Argon2id key derivation for passphrase-protected mounts.

mod block;
mod kdf;
mod keys;

pub use block::{BlockCipher, BlockLayout, BlockSource, BlockTarget, SealedBlock};
pub use kdf::{derive_key, generate_salt, DerivedKey};
pub use keys::MountKey;

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of salt for key derivation
pub const SALT_SIZE: usize = 32;
