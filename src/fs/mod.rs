//! FUSE filesystem implementation
//!
//! Presents the backing directory through the mount point, encrypting file
//! contents block by block and passing the namespace through unchanged.

mod dispatcher;
mod filesystem;
mod handle;
mod inode;
mod locks;
mod path;

pub use dispatcher::{Attributes, DirEntry, Dispatcher, EntryKind, FsStats, TimeUpdate};
pub use filesystem::CryptFs;
pub use handle::{FileHandle, HandleManager};
pub use inode::{InodeTable, ROOT_INO, UNLISTED_INO};
pub use locks::LockTable;
pub use path::PathTranslator;
