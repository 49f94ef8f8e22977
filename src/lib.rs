//! CryptBridge - Transparent block-encrypting FUSE filesystem
//!
//! This library mirrors a backing directory at a mount point. File contents
//! are stored as independently authenticated AES-256-GCM blocks; names,
//! directories and metadata pass through unchanged.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod mount;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::{BlockCipher, MountKey};
    pub use crate::error::{Error, Result};
    pub use crate::fs::{CryptFs, Dispatcher};
    pub use crate::mount::MountContext;
}
