//! Shard-granular lock table for multi-key critical sections.
//!
//! A fixed power-of-two table of raw read/write locks, addressed with the same
//! FNV-1a hash as [`crate::datastruct::dict::ConcurrentDict`]. Commands that
//! touch several keys take every shard they hit in one call: shard indices are
//! deduplicated, sorted ascending and then acquired in that order, write locks
//! for shards containing a write key and read locks for the rest. The guard
//! releases in descending index order on drop. This ordering is the only
//! deadlock-avoidance mechanism in the system; no other code path may nest
//! shard locks.

use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::RawRwLock;

use crate::datastruct::dict::{compute_capacity, fnv32};

pub struct LockMap {
    table: Vec<RawRwLock>,
}

/// Holds the shard locks taken by [`LockMap::rw_locks`]. Indices are stored
/// ascending with their lock kind and unlocked in reverse on drop.
pub struct RwLocksGuard<'a> {
    locks: &'a LockMap,
    // (shard index, is write lock), ascending
    indices: Vec<(usize, bool)>,
}

impl LockMap {
    pub fn new(table_size_hint: usize) -> Self {
        let table_size = compute_capacity(table_size_hint);
        let mut table = Vec::with_capacity(table_size);
        for _ in 0..table_size {
            table.push(<RawRwLock as RawRwLockApi>::INIT);
        }
        LockMap { table }
    }

    fn spread(&self, key: &str) -> usize {
        (fnv32(key) as usize) & (self.table.len() - 1)
    }

    /// Deduplicated, ascending shard indices touched by `keys`.
    fn to_lock_indices<S: AsRef<str>>(&self, keys: &[S]) -> Vec<usize> {
        let mut indices: Vec<usize> = keys.iter().map(|key| self.spread(key.as_ref())).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Locks every shard touched by `write_keys` and `read_keys`. A shard that
    /// contains at least one write key gets the exclusive lock, the rest get
    /// the shared lock. Acquisition order is ascending shard index.
    pub fn rw_locks<'a, S: AsRef<str>>(
        &'a self,
        write_keys: &[S],
        read_keys: &[S],
    ) -> RwLocksGuard<'a> {
        let mut all: Vec<&str> = Vec::with_capacity(write_keys.len() + read_keys.len());
        all.extend(write_keys.iter().map(|key| key.as_ref()));
        all.extend(read_keys.iter().map(|key| key.as_ref()));
        let indices = self.to_lock_indices(&all);

        let write_set: std::collections::HashSet<usize> = write_keys
            .iter()
            .map(|key| self.spread(key.as_ref()))
            .collect();

        let mut held = Vec::with_capacity(indices.len());
        for index in indices {
            let is_write = write_set.contains(&index);
            if is_write {
                self.table[index].lock_exclusive();
            } else {
                self.table[index].lock_shared();
            }
            held.push((index, is_write));
        }
        RwLocksGuard {
            locks: self,
            indices: held,
        }
    }
}

impl Drop for RwLocksGuard<'_> {
    fn drop(&mut self) {
        // Release in reverse acquisition order.
        for &(index, is_write) in self.indices.iter().rev() {
            unsafe {
                if is_write {
                    self.locks.table[index].unlock_exclusive();
                } else {
                    self.locks.table[index].unlock_shared();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_indices_sorted_and_deduped() {
        let locks = LockMap::new(16);
        let keys: Vec<String> = (0..100).map(|i| format!("key:{}", i)).collect();
        let indices = locks.to_lock_indices(&keys);
        for window in indices.windows(2) {
            assert!(window[0] < window[1], "indices must be strictly ascending");
        }
    }

    #[test]
    fn test_reacquire_after_release() {
        let locks = LockMap::new(16);
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        {
            let _guard = locks.rw_locks(&keys, &[]);
        }
        // The same shards must be lockable again once the guard is gone.
        let _guard = locks.rw_locks(&keys, &[]);
    }

    #[test]
    fn test_read_locks_are_shared() {
        let locks = Arc::new(LockMap::new(16));
        let keys = vec!["shared".to_string()];
        let _outer = locks.rw_locks::<String>(&[], &keys);
        let locks2 = Arc::clone(&locks);
        let handle = std::thread::spawn(move || {
            let keys = vec!["shared".to_string()];
            let _inner = locks2.rw_locks::<String>(&[], &keys);
            true
        });
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_mixed_write_read_on_same_shard_prefers_write() {
        let locks = LockMap::new(16);
        // The same key in both sets must end up write-locked exactly once.
        let keys = vec!["dup".to_string()];
        let guard = locks.rw_locks(&keys, &keys);
        assert_eq!(guard.indices.len(), 1);
        assert!(guard.indices[0].1, "shard with a write key is write locked");
    }

    #[test]
    fn test_concurrent_disjoint_writers_make_progress() {
        let locks = Arc::new(LockMap::new(1024));
        let mut handles = Vec::new();
        for t in 0..8 {
            let locks = Arc::clone(&locks);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let write = vec![format!("w{}:{}", t, i)];
                    let read = vec![format!("r{}:{}", t, i)];
                    let _guard = locks.rw_locks(&write, &read);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
