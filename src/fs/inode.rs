//! FUSE inode number to virtual path mapping
//!
//! The kernel addresses everything by inode number while the dispatcher works
//! on virtual paths. This table hands out numbers on lookup and keeps the
//! mapping current across rename and unlink.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

/// Reported in listings for names the kernel has not looked up yet
pub const UNLISTED_INO: u64 = u64::MAX;

struct InodeEntry {
    path: PathBuf,
    lookups: u64,
    /// Name removed or replaced; kept only until the kernel forgets it
    detached: bool,
}

struct Inner {
    next_ino: u64,
    inodes: HashMap<u64, InodeEntry>,
    path_to_ino: HashMap<PathBuf, u64>,
}

/// Manages inode allocation and mapping
pub struct InodeTable {
    inner: RwLock<Inner>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut inodes = HashMap::new();
        let mut path_to_ino = HashMap::new();
        inodes.insert(
            ROOT_INO,
            InodeEntry {
                path: PathBuf::from("/"),
                lookups: 1,
                detached: false,
            },
        );
        path_to_ino.insert(PathBuf::from("/"), ROOT_INO);

        Self {
            inner: RwLock::new(Inner {
                next_ino: ROOT_INO + 1,
                inodes,
                path_to_ino,
            }),
        }
    }

    /// Virtual path of an inode; `None` once its name is gone
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.inner
            .read()
            .inodes
            .get(&ino)
            .filter(|e| !e.detached)
            .map(|e| e.path.clone())
    }

    /// Inode for a path handed to the kernel in a lookup reply
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut inner = self.inner.write();
        let ino = match inner.path_to_ino.get(path).copied() {
            Some(ino) => ino,
            None => {
                let ino = inner.next_ino;
                inner.next_ino += 1;
                inner.inodes.insert(
                    ino,
                    InodeEntry {
                        path: path.to_path_buf(),
                        lookups: 0,
                        detached: false,
                    },
                );
                inner.path_to_ino.insert(path.to_path_buf(), ino);
                ino
            }
        };
        if let Some(entry) = inner.inodes.get_mut(&ino) {
            entry.lookups += 1;
        }
        ino
    }

    /// Inode already known for a path; never allocates
    pub fn peek(&self, path: &Path) -> Option<u64> {
        self.inner.read().path_to_ino.get(path).copied()
    }

    /// Drop `nlookup` kernel references; the inode is freed at zero
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inner = self.inner.write();
        let remove = match inner.inodes.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                entry.lookups == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = inner.inodes.remove(&ino) {
                if inner.path_to_ino.get(&entry.path) == Some(&ino) {
                    inner.path_to_ino.remove(&entry.path);
                }
            }
        }
    }

    /// Forget the name of a removed entry; the inode stays until forgotten
    pub fn unlink(&self, path: &Path) {
        let mut inner = self.inner.write();
        if let Some(ino) = inner.path_to_ino.remove(path) {
            Self::detach(&mut inner.inodes, ino);
        }
    }

    fn detach(inodes: &mut HashMap<u64, InodeEntry>, ino: u64) {
        let unreferenced = match inodes.get_mut(&ino) {
            Some(entry) => {
                entry.detached = true;
                entry.lookups == 0
            }
            None => false,
        };
        if unreferenced && ino != ROOT_INO {
            inodes.remove(&ino);
        }
    }

    /// Move `from` and everything below it to `to`
    pub fn rename(&self, from: &Path, to: &Path) {
        if from == to {
            return;
        }
        let mut inner = self.inner.write();
        let Inner {
            inodes,
            path_to_ino,
            ..
        } = &mut *inner;

        // An overwritten target loses its name
        let replaced: Vec<u64> = path_to_ino
            .iter()
            .filter(|(p, _)| p.starts_with(to))
            .map(|(_, &ino)| ino)
            .collect();
        path_to_ino.retain(|p, _| !p.starts_with(to));
        for ino in replaced {
            Self::detach(inodes, ino);
        }

        let moved: Vec<(PathBuf, u64)> = path_to_ino
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();

        for (old, ino) in moved {
            path_to_ino.remove(&old);
            let new = match old.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            if let Some(entry) = inodes.get_mut(&ino) {
                entry.path = new.clone();
            }
            path_to_ino.insert(new, ino);
        }
    }

    /// Number of live inodes
    pub fn len(&self) -> usize {
        self.inner.read().inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
