//! Error types for cryptbridge
//!
//! Every failure the core can produce maps onto an errno through
//! [`Error::errno`], which is what the FUSE adapter hands back to the kernel.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Virtual path cannot be mapped onto the backing store
    #[error("Path resolution failed: {0}")]
    PathResolution(String),

    /// Raw I/O against the backing store failed
    #[error("Backing I/O error: {0}")]
    BackingIo(#[from] io::Error),

    /// Authentication tag mismatch: data or tag corrupted or tampered
    #[error("Integrity check failed for block {block}")]
    Integrity { block: u64 },

    /// Backing store returned fewer bytes than a block record requires
    #[error("Short read on block {block}: expected {expected} bytes, got {actual}")]
    ShortRead {
        block: u64,
        expected: usize,
        actual: usize,
    },

    /// Caller passed an argument the engine cannot honor
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Offset lies past the last addressable block
    #[error("File too large: offset {0} exceeds the addressable block range")]
    FileTooLarge(u64),

    /// Unknown file handle
    #[error("Bad file handle: {0}")]
    BadHandle(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map to the errno reported to the kernel
    pub fn errno(&self) -> i32 {
        match self {
            Error::PathResolution(_) => libc::EINVAL,
            Error::BackingIo(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Integrity { .. } => libc::EIO,
            Error::ShortRead { .. } => libc::EIO,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::FileTooLarge(_) => libc::EFBIG,
            Error::BadHandle(_) => libc::EBADF,
            Error::Config(_)
            | Error::InvalidConfig(_)
            | Error::KeyDerivation(_)
            | Error::Internal(_) => libc::EIO,
        }
    }

    /// True when the failure means stored data was corrupted or tampered with
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::Integrity { .. } | Error::ShortRead { .. })
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::BackingIo(io::Error::from_raw_os_error(errno as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let not_found = Error::from(io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(not_found.errno(), libc::ENOENT);

        let synthetic = Error::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(synthetic.errno(), libc::EIO);

        assert_eq!(Error::Integrity { block: 3 }.errno(), libc::EIO);
        assert_eq!(Error::FileTooLarge(1).errno(), libc::EFBIG);
        assert_eq!(Error::BadHandle(9).errno(), libc::EBADF);
        assert_eq!(Error::PathResolution("..".into()).errno(), libc::EINVAL);
    }

    #[test]
    fn test_integrity_is_distinct_from_io() {
        assert!(Error::Integrity { block: 0 }.is_integrity());
        assert!(Error::ShortRead { block: 0, expected: 20, actual: 4 }.is_integrity());
        assert!(!Error::from(io::Error::from_raw_os_error(libc::EIO)).is_integrity());
    }

    #[test]
    fn test_nix_errno_conversion() {
        let err = Error::from(nix::errno::Errno::EACCES);
        assert_eq!(err.errno(), libc::EACCES);
    }
}
