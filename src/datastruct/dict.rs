//! Sharded concurrent hash map.
//!
//! The map is split into a power-of-two number of shards, each guarded by its
//! own read/write lock. Keys are routed to shards with the 32-bit FNV-1a hash,
//! so the shard index is a cheap bitwise AND instead of a modulo. The same
//! hash and mask are used by [`crate::datastruct::lockmap::LockMap`], which
//! lets callers take multi-key critical sections over the exact shards a set
//! of keys lives in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use globset::Glob;
use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use rand::Rng;

const MIN_SHARD_COUNT: usize = 16;

/// Smallest power of two that is >= `param`, with a floor of 16.
pub(crate) fn compute_capacity(param: usize) -> usize {
    if param <= MIN_SHARD_COUNT {
        return MIN_SHARD_COUNT;
    }
    param.next_power_of_two()
}

/// 32-bit FNV-1a over the raw bytes of the key.
pub(crate) fn fnv32(key: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in key.as_bytes() {
        hash = hash.wrapping_mul(16777619);
        hash ^= u32::from(*byte);
    }
    hash
}

struct Shard<V> {
    map: RwLock<HashMap<String, V>>,
}

pub struct ConcurrentDict<V> {
    table: Vec<Shard<V>>,
    count: AtomicUsize,
}

impl<V> ConcurrentDict<V> {
    pub fn new(shard_count_hint: usize) -> Self {
        let shard_count = compute_capacity(shard_count_hint);
        let mut table = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            table.push(Shard {
                map: RwLock::new(HashMap::new()),
            });
        }
        ConcurrentDict {
            table,
            count: AtomicUsize::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.table.len()
    }

    /// Shard index for `key`. Stable for the lifetime of the dict.
    pub fn spread(&self, key: &str) -> usize {
        (fnv32(key) as usize) & (self.table.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let shard = &self.table[self.spread(key)];
        shard.map.read().contains_key(key)
    }

    /// Runs `f` against the value under the shard read lock.
    pub fn with<R>(&self, key: &str, f: impl FnOnce(&V) -> R) -> Option<R> {
        let shard = &self.table[self.spread(key)];
        let guard = shard.map.read();
        guard.get(key).map(f)
    }

    /// Runs `f` against the value under the shard write lock.
    pub fn with_mut<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let shard = &self.table[self.spread(key)];
        let mut guard = shard.map.write();
        guard.get_mut(key).map(f)
    }

    /// Inserts or overwrites. Returns 1 when a new key was inserted, 0 when an
    /// existing value was overwritten.
    pub fn put(&self, key: &str, val: V) -> usize {
        let shard = &self.table[self.spread(key)];
        let mut guard = shard.map.write();
        if guard.insert(key.to_string(), val).is_some() {
            0
        } else {
            self.count.fetch_add(1, Ordering::Relaxed);
            1
        }
    }

    /// Inserts only when the key is absent. Returns 1 on insert, 0 otherwise.
    pub fn put_if_absent(&self, key: &str, val: V) -> usize {
        let shard = &self.table[self.spread(key)];
        let mut guard = shard.map.write();
        if guard.contains_key(key) {
            return 0;
        }
        guard.insert(key.to_string(), val);
        self.count.fetch_add(1, Ordering::Relaxed);
        1
    }

    /// Overwrites only when the key exists. Returns 1 on overwrite, 0 otherwise.
    pub fn put_if_exists(&self, key: &str, val: V) -> usize {
        let shard = &self.table[self.spread(key)];
        let mut guard = shard.map.write();
        match guard.get_mut(key) {
            Some(slot) => {
                *slot = val;
                1
            }
            None => 0,
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let shard = &self.table[self.spread(key)];
        let mut guard = shard.map.write();
        let removed = guard.remove(key);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Visits entries shard by shard under each shard's read lock. The
    /// callback returning `false` stops the walk. There is no global snapshot:
    /// mutations in shards already visited are not observed.
    pub fn for_each(&self, mut consumer: impl FnMut(&str, &V) -> bool) {
        for shard in &self.table {
            let guard = shard.map.read();
            for (key, val) in guard.iter() {
                if !consumer(key, val) {
                    return;
                }
            }
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|key, _| {
            keys.push(key.to_string());
            true
        });
        keys
    }

    /// Up to `limit` keys sampled from random shards. May contain duplicates.
    pub fn random_keys(&self, limit: usize) -> Vec<String> {
        if limit >= self.len() {
            return self.keys();
        }
        let mut rng = rand::rng();
        let shard_count = self.table.len();
        let mut result = Vec::with_capacity(limit);
        while result.len() < limit {
            let shard = &self.table[rng.random_range(0..shard_count)];
            let guard = shard.map.read();
            if let Some(key) = guard.keys().choose(&mut rng) {
                result.push(key.clone());
            }
        }
        result
    }

    /// Up to `min(limit, len)` distinct keys, best-effort sampled from random
    /// shards.
    pub fn random_distinct_keys(&self, limit: usize) -> Vec<String> {
        if limit >= self.len() {
            return self.keys();
        }
        let mut rng = rand::rng();
        let shard_count = self.table.len();
        let mut picked = std::collections::HashSet::with_capacity(limit);
        while picked.len() < limit {
            let shard = &self.table[rng.random_range(0..shard_count)];
            let guard = shard.map.read();
            if let Some(key) = guard.keys().choose(&mut rng) {
                picked.insert(key.clone());
            }
        }
        picked.into_iter().collect()
    }

    pub fn clear(&self) {
        for shard in &self.table {
            shard.map.write().clear();
        }
        self.count.store(0, Ordering::Relaxed);
    }

    /// Incremental scan. Starting at shard `cursor`, whole shards are read
    /// until either adding the next shard would push the result past `count`
    /// (the next shard index is returned as the new cursor) or every shard has
    /// been visited (cursor 0 is returned). An invalid glob pattern yields
    /// `(empty, -1)`.
    pub fn dict_scan(&self, cursor: usize, count: usize, pattern: &str) -> (Vec<String>, i64) {
        let size = self.len();
        if pattern == "*" && count >= size {
            return (self.keys(), 0);
        }
        let matcher = match Glob::new(pattern) {
            Ok(glob) => glob.compile_matcher(),
            Err(_) => return (Vec::new(), -1),
        };
        let shard_count = self.table.len();
        let mut result = Vec::new();
        let mut shard_index = cursor;
        while shard_index < shard_count {
            let shard = &self.table[shard_index];
            let guard = shard.map.read();
            if result.len() + guard.len() > count && shard_index > cursor {
                return (result, shard_index as i64);
            }
            for key in guard.keys() {
                if pattern == "*" || matcher.is_match(key) {
                    result.push(key.clone());
                }
            }
            shard_index += 1;
        }
        (result, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_capacity() {
        let test_cases = [
            (0, 16),
            (1, 16),
            (16, 16),
            (17, 32),
            (100, 128),
            (1024, 1024),
            (1025, 2048),
        ];
        for (input, expected) in test_cases {
            assert_eq!(compute_capacity(input), expected, "capacity for {}", input);
        }
    }

    #[test]
    fn test_put_get_remove() {
        let dict: ConcurrentDict<i64> = ConcurrentDict::new(16);
        assert_eq!(dict.put("a", 1), 1);
        assert_eq!(dict.put("a", 2), 0);
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.with("a", |v| *v), Some(2));
        assert_eq!(dict.remove("a"), Some(2));
        assert_eq!(dict.remove("a"), None);
        assert_eq!(dict.len(), 0);
    }

    #[test]
    fn test_put_if_absent_and_if_exists() {
        let dict: ConcurrentDict<i64> = ConcurrentDict::new(16);
        assert_eq!(dict.put_if_exists("a", 1), 0);
        assert_eq!(dict.put_if_absent("a", 1), 1);
        assert_eq!(dict.put_if_absent("a", 2), 0);
        assert_eq!(dict.with("a", |v| *v), Some(1));
        assert_eq!(dict.put_if_exists("a", 3), 1);
        assert_eq!(dict.with("a", |v| *v), Some(3));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_for_each_stops_on_false() {
        let dict: ConcurrentDict<i64> = ConcurrentDict::new(16);
        for i in 0..100 {
            dict.put(&format!("key:{}", i), i);
        }
        let mut seen = 0;
        dict.for_each(|_, _| {
            seen += 1;
            seen < 10
        });
        assert_eq!(seen, 10);
    }

    #[test]
    fn test_random_distinct_keys() {
        let dict: ConcurrentDict<i64> = ConcurrentDict::new(16);
        for i in 0..50 {
            dict.put(&format!("key:{}", i), i);
        }
        let keys = dict.random_distinct_keys(10);
        assert_eq!(keys.len(), 10);
        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), 10);

        let all = dict.random_distinct_keys(500);
        assert_eq!(all.len(), 50);
    }

    #[test]
    fn test_dict_scan_visits_every_key() {
        let dict: ConcurrentDict<i64> = ConcurrentDict::new(16);
        for i in 0..200 {
            dict.put(&format!("key:{}", i), i);
        }
        let mut cursor = 0;
        let mut collected = Vec::new();
        loop {
            let (mut batch, next) = dict.dict_scan(cursor, 20, "key:*");
            collected.append(&mut batch);
            assert_ne!(next, -1);
            if next == 0 {
                break;
            }
            cursor = next as usize;
        }
        collected.sort();
        collected.dedup();
        assert_eq!(collected.len(), 200);
    }

    #[test]
    fn test_dict_scan_invalid_pattern() {
        let dict: ConcurrentDict<i64> = ConcurrentDict::new(16);
        dict.put("a", 1);
        let (keys, cursor) = dict.dict_scan(0, 10, "[invalid");
        assert!(keys.is_empty());
        assert_eq!(cursor, -1);
    }

    #[test]
    fn test_concurrent_puts() {
        use std::sync::Arc;
        let dict: Arc<ConcurrentDict<i64>> = Arc::new(ConcurrentDict::new(16));
        let mut handles = Vec::new();
        for t in 0..4 {
            let dict = Arc::clone(&dict);
            handles.push(std::thread::spawn(move || {
                for i in 0..250 {
                    dict.put(&format!("t{}:{}", t, i), i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(dict.len(), 1000);
    }
}
