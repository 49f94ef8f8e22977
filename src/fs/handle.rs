//! Open backing file handles

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An open backing file
pub struct FileHandle {
    /// Backing file, always opened readable
    pub file: File,
    /// Identity used for nonce derivation (backing inode number)
    pub file_id: u64,
    /// Virtual path at open time
    pub path: PathBuf,
    /// Open flags as requested by the caller
    pub flags: i32,
}

impl FileHandle {
    pub fn new(file: File, file_id: u64, path: PathBuf, flags: i32) -> Self {
        FileHandle {
            file,
            file_id,
            path,
            flags,
        }
    }

    /// Check if opened for reading
    pub fn is_readable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    /// Check if opened for append
    pub fn is_append(&self) -> bool {
        (self.flags & libc::O_APPEND) != 0
    }
}

/// Manages open file handles
pub struct HandleManager {
    next_id: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<FileHandle>>>,
}

impl HandleManager {
    pub fn new() -> Self {
        HandleManager {
            next_id: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register an open file and return its handle ID
    pub fn open(&self, handle: FileHandle) -> u64 {
        let fh = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(fh, Arc::new(handle));
        fh
    }

    /// Get a handle by ID
    pub fn get(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.read().get(&fh).cloned()
    }

    /// Close a handle; the backing file closes once no call still uses it
    pub fn close(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.write().remove(&fh)
    }

    /// Check if a handle is valid
    pub fn is_valid(&self, fh: u64) -> bool {
        self.handles.read().contains_key(&fh)
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(flags: i32) -> FileHandle {
        FileHandle::new(tempfile::tempfile().unwrap(), 1, PathBuf::from("/f"), flags)
    }

    #[test]
    fn test_file_handle_flags() {
        let read_handle = handle(libc::O_RDONLY);
        assert!(read_handle.is_readable());
        assert!(!read_handle.is_writable());

        let write_handle = handle(libc::O_WRONLY);
        assert!(!write_handle.is_readable());
        assert!(write_handle.is_writable());

        let append_handle = handle(libc::O_RDWR | libc::O_APPEND);
        assert!(append_handle.is_readable());
        assert!(append_handle.is_writable());
        assert!(append_handle.is_append());
    }

    #[test]
    fn test_handle_manager() {
        let manager = HandleManager::new();

        let fh1 = manager.open(handle(libc::O_RDONLY));
        let fh2 = manager.open(handle(libc::O_RDWR));

        assert!(manager.is_valid(fh1));
        assert!(manager.is_valid(fh2));
        assert!(!manager.is_valid(999));
        assert_eq!(manager.len(), 2);

        manager.close(fh1);
        assert!(!manager.is_valid(fh1));
        assert!(manager.get(fh2).is_some());
    }
}
