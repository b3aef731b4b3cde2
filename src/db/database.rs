//! One logical key space.
//!
//! A database is three concurrent maps over the same keys: the data itself,
//! absolute expiration instants in milliseconds, and a monotonic version
//! counter bumped on every write, plus the shard lock table that command
//! execution uses for multi-key critical sections. Expiration is lazy: a
//! read that finds a past-due TTL deletes the key and reports it missing,
//! and iteration filters expired keys the same way. Key creation and
//! deletion fire registered callbacks, which is how cluster mode keeps its
//! per-slot key sets current.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::datastruct::dict::ConcurrentDict;
use crate::datastruct::lockmap::LockMap;
use crate::db::entity::DataEntity;

const DATA_DICT_SHARDS: usize = 1024;
const TTL_DICT_SHARDS: usize = 64;
const LOCKER_SHARDS: usize = 1024;

/// Fired with `(db index, key)` when a key is created or deleted.
pub type KeyEventCallback = Arc<dyn Fn(usize, &str) + Send + Sync>;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    jiff::Timestamp::now().as_millisecond()
}

pub struct Database {
    pub index: usize,
    data: ConcurrentDict<DataEntity>,
    ttl_map: ConcurrentDict<i64>,
    version_map: ConcurrentDict<u64>,
    locker: LockMap,
    insert_callback: RwLock<Option<KeyEventCallback>>,
    delete_callback: RwLock<Option<KeyEventCallback>>,
}

impl Database {
    pub fn new(index: usize) -> Self {
        Database {
            index,
            data: ConcurrentDict::new(DATA_DICT_SHARDS),
            ttl_map: ConcurrentDict::new(TTL_DICT_SHARDS),
            version_map: ConcurrentDict::new(DATA_DICT_SHARDS),
            locker: LockMap::new(LOCKER_SHARDS),
            insert_callback: RwLock::new(None),
            delete_callback: RwLock::new(None),
        }
    }

    pub fn locker(&self) -> &LockMap {
        &self.locker
    }

    pub fn set_insert_callback(&self, cb: Option<KeyEventCallback>) {
        *self.insert_callback.write() = cb;
    }

    pub fn set_delete_callback(&self, cb: Option<KeyEventCallback>) {
        *self.delete_callback.write() = cb;
    }

    fn fire_insert(&self, key: &str) {
        if let Some(cb) = self.insert_callback.read().as_ref() {
            cb(self.index, key);
        }
    }

    fn fire_delete(&self, key: &str) {
        if let Some(cb) = self.delete_callback.read().as_ref() {
            cb(self.index, key);
        }
    }

    /// Deletes the key now when its TTL has passed. Returns true when the key
    /// was expired and removed.
    pub fn expire_if_needed(&self, key: &str) -> bool {
        let Some(expire_at) = self.ttl_map.with(key, |at| *at) else {
            return false;
        };
        if expire_at > now_ms() {
            return false;
        }
        self.ttl_map.remove(key);
        if self.data.remove(key).is_some() {
            self.fire_delete(key);
        }
        true
    }

    pub fn exists(&self, key: &str) -> bool {
        if self.expire_if_needed(key) {
            return false;
        }
        self.data.contains_key(key)
    }

    pub fn with_entity<R>(&self, key: &str, f: impl FnOnce(&DataEntity) -> R) -> Option<R> {
        if self.expire_if_needed(key) {
            return None;
        }
        self.data.with(key, f)
    }

    pub fn with_entity_mut<R>(&self, key: &str, f: impl FnOnce(&mut DataEntity) -> R) -> Option<R> {
        if self.expire_if_needed(key) {
            return None;
        }
        self.data.with_mut(key, f)
    }

    pub fn get_entity_clone(&self, key: &str) -> Option<DataEntity> {
        self.with_entity(key, |entity| entity.clone())
    }

    /// Inserts or overwrites. Returns 1 when the key is new.
    pub fn put_entity(&self, key: &str, entity: DataEntity) -> usize {
        let inserted = self.data.put(key, entity);
        if inserted == 1 {
            self.fire_insert(key);
        }
        inserted
    }

    pub fn put_if_absent_entity(&self, key: &str, entity: DataEntity) -> usize {
        self.expire_if_needed(key);
        let inserted = self.data.put_if_absent(key, entity);
        if inserted == 1 {
            self.fire_insert(key);
        }
        inserted
    }

    pub fn put_if_exists_entity(&self, key: &str, entity: DataEntity) -> usize {
        if self.expire_if_needed(key) {
            return 0;
        }
        self.data.put_if_exists(key, entity)
    }

    /// Removes the key and its TTL. Returns true when the key existed.
    pub fn remove_key(&self, key: &str) -> bool {
        self.ttl_map.remove(key);
        let removed = self.data.remove(key).is_some();
        if removed {
            self.fire_delete(key);
        }
        removed
    }

    pub fn expire_at(&self, key: &str, at_ms: i64) {
        self.ttl_map.put(key, at_ms);
    }

    /// Drops the TTL. Returns true when a TTL existed.
    pub fn persist(&self, key: &str) -> bool {
        self.ttl_map.remove(key).is_some()
    }

    /// The absolute expiration instant, if one is set and still in the future.
    pub fn ttl_at(&self, key: &str) -> Option<i64> {
        if self.expire_if_needed(key) {
            return None;
        }
        self.ttl_map.with(key, |at| *at)
    }

    pub fn add_version<S: AsRef<str>>(&self, keys: &[S]) {
        for key in keys {
            let key = key.as_ref();
            let bumped = self.version_map.with_mut(key, |version| {
                *version += 1;
            });
            if bumped.is_none() {
                self.version_map.put(key, 1);
            }
        }
    }

    pub fn get_version(&self, key: &str) -> u64 {
        self.version_map.with(key, |version| *version).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn ttl_count(&self) -> usize {
        self.ttl_map.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.keys()
    }

    pub fn scan(&self, cursor: usize, count: usize, pattern: &str) -> (Vec<String>, i64) {
        self.data.dict_scan(cursor, count, pattern)
    }

    /// Visits live entries with their optional expiration. Entries found
    /// expired during the walk are evicted afterwards and never surface.
    pub fn for_each(&self, mut cb: impl FnMut(&str, &DataEntity, Option<i64>) -> bool) {
        let now = now_ms();
        let mut expired = Vec::new();
        self.data.for_each(|key, entity| {
            let expire_at = self.ttl_map.with(key, |at| *at);
            if let Some(at) = expire_at {
                if at <= now {
                    expired.push(key.to_string());
                    return true;
                }
            }
            cb(key, entity, expire_at)
        });
        for key in expired {
            self.expire_if_needed(&key);
        }
    }

    /// Clears data, TTLs and versions.
    pub fn flush(&self) {
        self.data.clear();
        self.ttl_map.clear();
        self.version_map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let db = Database::new(0);
        assert_eq!(db.put_entity("k", DataEntity::Str("v".to_string())), 1);
        assert_eq!(db.put_entity("k", DataEntity::Str("w".to_string())), 0);
        let value = db.with_entity("k", |entity| match entity {
            DataEntity::Str(s) => s.clone(),
            _ => panic!("wrong variant"),
        });
        assert_eq!(value, Some("w".to_string()));
        assert!(db.remove_key("k"));
        assert!(!db.remove_key("k"));
        assert!(!db.exists("k"));
    }

    #[test]
    fn test_lazy_expiration() {
        let db = Database::new(0);
        db.put_entity("k", DataEntity::Str("v".to_string()));
        db.expire_at("k", now_ms() - 10);
        assert!(!db.exists("k"));
        assert_eq!(db.len(), 0, "expired key must be evicted on access");

        db.put_entity("k", DataEntity::Str("v".to_string()));
        db.expire_at("k", now_ms() + 60_000);
        assert!(db.exists("k"));
        assert!(db.ttl_at("k").is_some());
        assert!(db.persist("k"));
        assert_eq!(db.ttl_at("k"), None);
    }

    #[test]
    fn test_for_each_filters_expired() {
        let db = Database::new(0);
        db.put_entity("live", DataEntity::Str("v".to_string()));
        db.put_entity("dead", DataEntity::Str("v".to_string()));
        db.expire_at("dead", now_ms() - 1);

        let mut seen = Vec::new();
        db.for_each(|key, _, _| {
            seen.push(key.to_string());
            true
        });
        assert_eq!(seen, vec!["live".to_string()]);
        assert_eq!(db.len(), 1, "expired key evicted after iteration");
    }

    #[test]
    fn test_versions() {
        let db = Database::new(0);
        assert_eq!(db.get_version("k"), 0);
        db.add_version(&["k"]);
        db.add_version(&["k"]);
        assert_eq!(db.get_version("k"), 2);
    }

    #[test]
    fn test_callbacks_fire_on_insert_and_delete() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let db = Database::new(3);
        let inserts = Arc::new(AtomicUsize::new(0));
        let deletes = Arc::new(AtomicUsize::new(0));
        {
            let inserts = Arc::clone(&inserts);
            db.set_insert_callback(Some(Arc::new(move |db_index, _key| {
                assert_eq!(db_index, 3);
                inserts.fetch_add(1, Ordering::Relaxed);
            })));
        }
        {
            let deletes = Arc::clone(&deletes);
            db.set_delete_callback(Some(Arc::new(move |_, _| {
                deletes.fetch_add(1, Ordering::Relaxed);
            })));
        }
        db.put_entity("a", DataEntity::Str("1".to_string()));
        db.put_entity("a", DataEntity::Str("2".to_string()));
        db.remove_key("a");
        assert_eq!(inserts.load(Ordering::Relaxed), 1);
        assert_eq!(deletes.load(Ordering::Relaxed), 1);
    }
}
