//! FUSE adapter
//!
//! Translates kernel requests (inode numbers, raw flags) into dispatcher
//! calls on virtual paths and replies with the result or its errno.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::ENOENT;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use super::dispatcher::{Attributes, Dispatcher, EntryKind, TimeUpdate};
use super::inode::{InodeTable, ROOT_INO, UNLISTED_INO};
use super::path::PathTranslator;
use crate::error::Error;

const TTL: Duration = Duration::from_secs(1);

impl From<EntryKind> for FileType {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::RegularFile => FileType::RegularFile,
            EntryKind::Directory => FileType::Directory,
            EntryKind::Symlink => FileType::Symlink,
            EntryKind::BlockDevice => FileType::BlockDevice,
            EntryKind::CharDevice => FileType::CharDevice,
            EntryKind::Fifo => FileType::NamedPipe,
            EntryKind::Socket => FileType::Socket,
        }
    }
}

fn to_file_attr(ino: u64, attrs: &Attributes) -> FileAttr {
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.blocks,
        atime: attrs.atime,
        mtime: attrs.mtime,
        ctime: attrs.ctime,
        crtime: attrs.crtime,
        kind: attrs.kind.into(),
        perm: attrs.perm,
        nlink: attrs.nlink,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: attrs.rdev,
        blksize: attrs.blksize,
        flags: 0,
    }
}

fn time_update(time: Option<TimeOrNow>) -> TimeUpdate {
    match time {
        None => TimeUpdate::Omit,
        Some(TimeOrNow::Now) => TimeUpdate::Now,
        Some(TimeOrNow::SpecificTime(at)) => TimeUpdate::At(at),
    }
}

/// Log a failed request and return the errno to reply with
fn errno(verb: &str, path: &Path, err: &Error) -> i32 {
    if err.is_integrity() {
        error!(verb, ?path, error = %err, "integrity check failed");
    } else if err.errno() == ENOENT {
        debug!(verb, ?path, "not found");
    } else {
        error!(verb, ?path, error = %err, "request failed");
    }
    err.errno()
}

/// The mounted encrypting filesystem
pub struct CryptFs {
    dispatcher: Arc<Dispatcher>,
    inodes: InodeTable,
}

impl CryptFs {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            inodes: InodeTable::new(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn path(&self, ino: u64) -> Result<PathBuf, i32> {
        self.inodes.path(ino).ok_or(ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<PathBuf, i32> {
        let parent = self.path(parent)?;
        PathTranslator::child(&parent, name).map_err(|e| errno("lookup", &parent, &e))
    }

    /// Stat a path and register it with the kernel
    fn entry(&self, verb: &str, path: &Path, reply: ReplyEntry) {
        match self.dispatcher.getattr(path) {
            Ok(attrs) => {
                let ino = self.inodes.lookup(path);
                reply.entry(&TTL, &to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(errno(verb, path, &e)),
        }
    }
}

impl Filesystem for CryptFs {
    fn destroy(&mut self) {
        info!(
            open_handles = self.dispatcher.open_handles(),
            "filesystem unmounted"
        );
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        match self.child(parent, name) {
            Ok(path) => self.entry("lookup", &path, reply),
            Err(e) => reply.error(e),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.getattr(&path) {
            Ok(attrs) => reply.attr(&TTL, &to_file_attr(ino, &attrs)),
            Err(e) => reply.error(errno("getattr", &path, &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino, mode, uid, gid, size
        );
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        let result = (|| {
            if let Some(mode) = mode {
                self.dispatcher.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.dispatcher.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                self.dispatcher.truncate(&path, size, fh)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.dispatcher
                    .utimens(&path, time_update(atime), time_update(mtime))?;
            }
            self.dispatcher.getattr(&path)
        })();

        match result {
            Ok(attrs) => reply.attr(&TTL, &to_file_attr(ino, &attrs)),
            Err(e) => reply.error(errno("setattr", &path, &e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno("readlink", &path, &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.mkdir(&path, mode & !umask) {
            Ok(attrs) => {
                let ino = self.inodes.lookup(&path);
                reply.entry(&TTL, &to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(errno("mkdir", &path, &e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.unlink(&path) {
            Ok(()) => {
                self.inodes.unlink(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("unlink", &path, &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.rmdir(&path) {
            Ok(()) => {
                self.inodes.unlink(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("rmdir", &path, &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);
        let path = match self.child(parent, link_name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.symlink(target, &path) {
            Ok(attrs) => {
                let ino = self.inodes.lookup(&path);
                reply.entry(&TTL, &to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(errno("symlink", &path, &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        let (from, to) = match (self.child(parent, name), self.child(newparent, newname)) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(e), _) | (_, Err(e)) => return reply.error(e),
        };
        match self.dispatcher.rename(&from, &to, flags) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(errno("rename", &from, &e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);
        let (existing, new) = match (self.path(ino), self.child(newparent, newname)) {
            (Ok(existing), Ok(new)) => (existing, new),
            (Err(e), _) | (_, Err(e)) => return reply.error(e),
        };
        match self.dispatcher.link(&existing, &new) {
            Ok(attrs) => {
                let ino = self.inodes.lookup(&new);
                reply.entry(&TTL, &to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(errno("link", &new, &e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#o})", ino, flags);
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", &path, &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.create(&path, flags, mode & !umask) {
            Ok((fh, attrs)) => {
                let ino = self.inodes.lookup(&path);
                reply.created(&TTL, &to_file_attr(ino, &attrs), 0, fh, 0);
            }
            Err(e) => reply.error(errno("create", &path, &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        let path = self.inodes.path(ino).unwrap_or_default();
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self
            .dispatcher
            .read(&path, fh, offset as u64, size as usize)
        {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &path, &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        let path = self.inodes.path(ino).unwrap_or_default();
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.dispatcher.write(&path, fh, offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno("write", &path, &e)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);
        match self.dispatcher.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &self.inodes.path(ino).unwrap_or_default(), &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        match self.dispatcher.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", &self.inodes.path(ino).unwrap_or_default(), &e)),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);
        match self.dispatcher.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", &self.inodes.path(ino).unwrap_or_default(), &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let listing = match self.dispatcher.readdir(&path) {
            Ok(listing) => listing,
            Err(e) => return reply.error(errno("readdir", &path, &e)),
        };

        let parent_ino = match path.parent() {
            Some(parent) if ino != ROOT_INO => self.inodes.peek(parent).unwrap_or(UNLISTED_INO),
            _ => ROOT_INO,
        };

        let mut entries = vec![
            (ino, FileType::Directory, OsStr::new(".").to_os_string()),
            (parent_ino, FileType::Directory, OsStr::new("..").to_os_string()),
        ];
        for entry in listing {
            let child_ino = self
                .inodes
                .peek(&path.join(&entry.name))
                .unwrap_or(UNLISTED_INO);
            entries.push((child_ino, entry.kind.into(), entry.name));
        }

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let path = self.inodes.path(ino).unwrap_or_else(|| PathBuf::from("/"));
        match self.dispatcher.statfs(&path) {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
            ),
            Err(e) => reply.error(errno("statfs", &path, &e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{MountKey, KEY_SIZE, NONCE_SIZE};
    use crate::mount::MountContext;
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CryptFs) {
        let dir = TempDir::new().unwrap();
        let context = MountContext::new(
            MountKey::from_bytes([7; KEY_SIZE]),
            [0u8; NONCE_SIZE],
            dir.path(),
            4096,
        );
        let dispatcher = Arc::new(Dispatcher::new(context).unwrap());
        (dir, CryptFs::new(dispatcher))
    }

    #[test]
    fn test_entry_kind_mapping() {
        assert_eq!(FileType::from(EntryKind::Fifo), FileType::NamedPipe);
        assert_eq!(FileType::from(EntryKind::Directory), FileType::Directory);
        assert_eq!(FileType::from(EntryKind::Symlink), FileType::Symlink);
    }

    #[test]
    fn test_file_attr_uses_virtual_ino() {
        let (_dir, fs) = setup();
        let fh = fs
            .dispatcher()
            .create(Path::new("/f"), libc::O_RDWR, 0o640)
            .unwrap()
            .0;
        fs.dispatcher().write(Path::new("/f"), fh, 0, b"abc").unwrap();

        let attrs = fs.dispatcher().getattr(Path::new("/f")).unwrap();
        let attr = to_file_attr(42, &attrs);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 3);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o640);
    }

    #[test]
    fn test_child_paths() {
        let (_dir, fs) = setup();
        assert_eq!(
            fs.child(ROOT_INO, OsStr::new("a.txt")).unwrap(),
            PathBuf::from("/a.txt")
        );
        assert_eq!(fs.child(999, OsStr::new("a.txt")).unwrap_err(), ENOENT);
        assert_eq!(fs.child(ROOT_INO, OsStr::new("..")).unwrap_err(), libc::EINVAL);
    }

    #[test]
    fn test_time_update_conversion() {
        let at = UNIX_EPOCH + Duration::from_secs(5);
        assert_eq!(time_update(None), TimeUpdate::Omit);
        assert_eq!(time_update(Some(TimeOrNow::Now)), TimeUpdate::Now);
        assert_eq!(time_update(Some(TimeOrNow::SpecificTime(at))), TimeUpdate::At(at));
    }
}
