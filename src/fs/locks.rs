//! Per-file locks serialising read-modify-write of blocks
//!
//! Writers hold a file's lock exclusively for the whole merge, seal and
//! write cycle. Readers share it, so they never see a block mid-rewrite.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Reader/writer lock per file identity
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<u64, Arc<RwLock<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, file_id: u64) -> Arc<RwLock<()>> {
        self.locks.entry(file_id).or_default().clone()
    }

    /// Drop the entry when nobody else holds it
    fn prune(&self, file_id: u64) {
        self.locks
            .remove_if(&file_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Run `f` with shared access to the file
    pub fn with_read<R>(&self, file_id: u64, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(file_id);
        let result = {
            let _guard = lock.read();
            f()
        };
        drop(lock);
        self.prune(file_id);
        result
    }

    /// Run `f` with exclusive access to the file
    pub fn with_write<R>(&self, file_id: u64, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(file_id);
        let result = {
            let _guard = lock.write();
            f()
        };
        drop(lock);
        self.prune(file_id);
        result
    }

    /// Number of files with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_entries_pruned_after_use() {
        let table = LockTable::new();
        assert_eq!(table.with_write(7, || 42), 42);
        assert_eq!(table.with_read(7, || 1), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_writers_are_exclusive() {
        let table = Arc::new(LockTable::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        table.with_write(1, || {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert!(table.is_empty());
    }
}
