//! Filesystem operation dispatcher
//!
//! One method per filesystem verb, all addressed by virtual path. Content
//! verbs (read, write, truncate) run the block cipher around positioned I/O
//! on the backing file; every other verb passes straight through to the
//! backing path.

use super::handle::{FileHandle, HandleManager};
use super::locks::LockTable;
use super::path::PathTranslator;
use crate::crypto::{BlockCipher, BlockSource};
use crate::error::{Error, Result};
use crate::mount::MountContext;
use std::ffi::{CString, OsString};
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Open flags forwarded to the backing file as-is
const PASSTHROUGH_FLAGS: i32 = libc::O_NOFOLLOW | libc::O_SYNC | libc::O_DSYNC | libc::O_NOATIME;

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<fs::FileType> for EntryKind {
    fn from(ft: fs::FileType) -> Self {
        if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_block_device() {
            EntryKind::BlockDevice
        } else if ft.is_char_device() {
            EntryKind::CharDevice
        } else if ft.is_fifo() {
            EntryKind::Fifo
        } else if ft.is_socket() {
            EntryKind::Socket
        } else {
            EntryKind::RegularFile
        }
    }
}

/// Attributes of a virtual entry
#[derive(Debug, Clone)]
pub struct Attributes {
    /// Backing inode number, also the file identity
    pub file_id: u64,
    /// Plaintext size for regular files, backing size otherwise
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub kind: EntryKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

/// One directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

/// Filesystem statistics of the backing store
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Timestamp update for `utimens`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUpdate {
    /// Leave unchanged
    Omit,
    /// Set to the current time
    Now,
    /// Set to a specific time
    At(SystemTime),
}

impl TimeUpdate {
    fn to_timespec(self) -> libc::timespec {
        match self {
            TimeUpdate::Omit => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            TimeUpdate::Now => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_NOW,
            },
            TimeUpdate::At(time) => {
                let since = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
                libc::timespec {
                    tv_sec: since.as_secs() as libc::time_t,
                    tv_nsec: since.subsec_nanos() as _,
                }
            }
        }
    }
}

/// The filesystem verb table
pub struct Dispatcher {
    context: MountContext,
    paths: PathTranslator,
    cipher: BlockCipher,
    handles: HandleManager,
    locks: LockTable,
}

impl Dispatcher {
    /// Create a dispatcher owning the mount context
    pub fn new(context: MountContext) -> Result<Self> {
        let cipher = BlockCipher::new(context.key(), context.base_nonce(), context.block_size())?;
        let paths = PathTranslator::new(context.backing_root());

        info!(
            backing_root = ?context.backing_root(),
            block_size = context.block_size(),
            "dispatcher ready"
        );

        Ok(Self {
            context,
            paths,
            cipher,
            handles: HandleManager::new(),
            locks: LockTable::new(),
        })
    }

    pub fn context(&self) -> &MountContext {
        &self.context
    }

    pub fn cipher(&self) -> &BlockCipher {
        &self.cipher
    }

    /// Backing path for a virtual path
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        self.paths.resolve(path)
    }

    fn handle(&self, fh: u64) -> Result<Arc<FileHandle>> {
        self.handles.get(fh).ok_or(Error::BadHandle(fh))
    }

    fn attributes(&self, meta: &fs::Metadata) -> Attributes {
        let kind = EntryKind::from(meta.file_type());
        let size = if kind == EntryKind::RegularFile {
            match self.cipher.plaintext_len(meta.len()) {
                Ok(size) => size,
                Err(e) => {
                    warn!(ino = meta.ino(), error = %e, "torn final block, reporting complete blocks only");
                    self.cipher.layout().complete_plaintext_len(meta.len())
                }
            }
        } else {
            meta.len()
        };

        Attributes {
            file_id: meta.ino(),
            size,
            blocks: meta.blocks(),
            atime: meta.accessed().unwrap_or(UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(UNIX_EPOCH),
            ctime: UNIX_EPOCH + Duration::new(meta.ctime().max(0) as u64, meta.ctime_nsec().max(0) as u32),
            crtime: meta.created().unwrap_or(UNIX_EPOCH),
            kind,
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: self.cipher.block_size() as u32,
        }
    }

    fn open_backing(&self, path: &Path, backing: &Path, options: &OpenOptions, flags: i32) -> Result<u64> {
        let file = options.open(backing)?;
        let file_id = file.metadata()?.ino();
        let handle = FileHandle::new(file, file_id, path.to_path_buf(), flags);

        if flags & libc::O_TRUNC != 0 && handle.is_writable() {
            self.locks
                .with_write(file_id, || self.cipher.truncate(file_id, 0, &handle.file))?;
        }

        let fh = self.handles.open(handle);
        debug!(?path, fh, file_id, flags, "opened");
        Ok(fh)
    }

    fn backing_options(flags: i32) -> OpenOptions {
        // Write-only opens still need to read partial blocks back
        let mut options = OpenOptions::new();
        options.read(true);
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            options.write(true);
        }
        options.custom_flags(flags & PASSTHROUGH_FLAGS);
        options
    }

    // Content verbs

    /// Open an existing file
    pub fn open(&self, path: &Path, flags: i32) -> Result<u64> {
        let backing = self.resolve(path)?;
        self.open_backing(path, &backing, &Self::backing_options(flags), flags)
    }

    /// Create and open a file
    pub fn create(&self, path: &Path, flags: i32, mode: u32) -> Result<(u64, Attributes)> {
        let backing = self.resolve(path)?;
        let mut options = Self::backing_options(flags);
        options.write(true).mode(mode);
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }

        let fh = self.open_backing(path, &backing, &options, flags)?;
        let handle = self.handle(fh)?;
        let attrs = self.attributes(&handle.file.metadata()?);
        info!(?path, fh, "created");
        Ok((fh, attrs))
    }

    /// Read up to `size` plaintext bytes at `offset`
    pub fn read(&self, path: &Path, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        let handle = self.handle(fh)?;
        if !handle.is_readable() {
            return Err(Error::BadHandle(fh));
        }

        debug!(?path, fh, offset, size, "read");
        self.locks.with_read(handle.file_id, || {
            self.cipher
                .decrypt_range(handle.file_id, size, offset, &handle.file)
        })
    }

    /// Write `data` at `offset`, returning the number of bytes accepted
    pub fn write(&self, path: &Path, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let handle = self.handle(fh)?;
        if !handle.is_writable() {
            return Err(Error::BadHandle(fh));
        }

        self.locks.with_write(handle.file_id, || {
            let offset = if handle.is_append() {
                self.cipher
                    .layout()
                    .complete_plaintext_len(handle.file.backing_len()?)
            } else {
                offset
            };
            debug!(?path, fh, offset, len = data.len(), "write");
            self.cipher
                .write_range(handle.file_id, data, offset, &handle.file)
        })
    }

    /// Set the plaintext length of a file
    pub fn truncate(&self, path: &Path, length: u64, fh: Option<u64>) -> Result<()> {
        let handle = match fh.and_then(|fh| self.handles.get(fh)) {
            Some(handle) if handle.is_writable() => handle,
            _ => {
                let backing = self.resolve(path)?;
                let file = OpenOptions::new().read(true).write(true).open(&backing)?;
                let file_id = file.metadata()?.ino();
                Arc::new(FileHandle::new(file, file_id, path.to_path_buf(), libc::O_RDWR))
            }
        };

        debug!(?path, length, file_id = handle.file_id, "truncate");
        self.locks.with_write(handle.file_id, || {
            self.cipher.truncate(handle.file_id, length, &handle.file)
        })
    }

    /// Flush a handle's data to stable storage
    pub fn flush(&self, fh: u64) -> Result<()> {
        let handle = self.handle(fh)?;
        if handle.is_writable() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// fsync a handle
    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        let handle = self.handle(fh)?;
        if datasync {
            handle.file.sync_data()?;
        } else {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Close a handle
    pub fn release(&self, fh: u64) -> Result<()> {
        let handle = self.handles.close(fh).ok_or(Error::BadHandle(fh))?;
        debug!(path = ?handle.path, fh, "released");
        Ok(())
    }

    // Metadata verbs

    /// Attributes with the plaintext size
    pub fn getattr(&self, path: &Path) -> Result<Attributes> {
        let meta = fs::symlink_metadata(self.resolve(path)?)?;
        Ok(self.attributes(&meta))
    }

    /// Statistics of the filesystem holding the backing root
    pub fn statfs(&self, path: &Path) -> Result<FsStats> {
        let stat = nix::sys::statvfs::statvfs(&self.resolve(path)?)?;
        Ok(FsStats {
            blocks: stat.blocks() as u64,
            bfree: stat.blocks_free() as u64,
            bavail: stat.blocks_available() as u64,
            files: stat.files() as u64,
            ffree: stat.files_free() as u64,
            bsize: stat.block_size() as u32,
            namelen: stat.name_max() as u32,
            frsize: stat.fragment_size() as u32,
        })
    }

    /// List a directory (without `.` and `..`)
    pub fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path)?)? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name(),
                kind: EntryKind::from(entry.file_type()?),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<Attributes> {
        let backing = self.resolve(path)?;
        fs::DirBuilder::new().mode(mode).create(&backing)?;
        debug!(?path, mode, "mkdir");
        self.getattr(path)
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(self.resolve(path)?)?;
        debug!(?path, "rmdir");
        Ok(())
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(self.resolve(path)?)?;
        debug!(?path, "unlink");
        Ok(())
    }

    /// Create a symlink at `path`; the target is stored verbatim
    pub fn symlink(&self, target: &Path, path: &Path) -> Result<Attributes> {
        std::os::unix::fs::symlink(target, self.resolve(path)?)?;
        debug!(?path, ?target, "symlink");
        self.getattr(path)
    }

    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(self.resolve(path)?)?)
    }

    /// Rename; `RENAME_NOREPLACE` is honored, other flags are refused
    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> Result<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;

        if flags & !(libc::RENAME_NOREPLACE) != 0 {
            return Err(Error::BackingIo(io::Error::from_raw_os_error(libc::EINVAL)));
        }
        if flags & libc::RENAME_NOREPLACE != 0 && fs::symlink_metadata(&target).is_ok() {
            return Err(Error::BackingIo(io::Error::from_raw_os_error(libc::EEXIST)));
        }

        fs::rename(&source, &target)?;
        debug!(?from, ?to, "rename");
        Ok(())
    }

    /// Hard link; both names share one backing inode and so one identity
    pub fn link(&self, existing: &Path, new: &Path) -> Result<Attributes> {
        fs::hard_link(self.resolve(existing)?, self.resolve(new)?)?;
        debug!(?existing, ?new, "link");
        self.getattr(new)
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(self.resolve(path)?, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        std::os::unix::fs::lchown(self.resolve(path)?, uid, gid)?;
        Ok(())
    }

    /// Update access and modification times without following symlinks
    pub fn utimens(&self, path: &Path, atime: TimeUpdate, mtime: TimeUpdate) -> Result<()> {
        let backing = self.resolve(path)?;
        let c_path = CString::new(backing.as_os_str().as_bytes())
            .map_err(|_| Error::PathResolution(format!("{:?} contains a NUL byte", path)))?;
        let times = [atime.to_timespec(), mtime.to_timespec()];

        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c_path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc != 0 {
            return Err(Error::BackingIo(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Number of open handles
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }
}
