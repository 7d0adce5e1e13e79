//! Bounded object cache.
//!
//! Read-through LRU keyed by UUID. Mutations and bus notifications
//! evict entries rather than patching them; types can be excluded from
//! caching entirely (hot-churn types are not worth the invalidation
//! traffic).

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::record::StoredObject;

/// Cache tuning knobs.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Maximum number of cached objects.
    pub entries: usize,
    /// Types never cached.
    pub excluded_types: HashSet<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entries: 10_000,
            excluded_types: HashSet::new(),
        }
    }
}

/// LRU cache of stored objects.
pub struct ObjectCache {
    inner: Mutex<LruCache<String, StoredObject>>,
    excluded_types: HashSet<String>,
}

impl ObjectCache {
    /// Creates a cache per the config. A zero entry count disables
    /// caching.
    pub fn new(config: CacheConfig) -> Self {
        let cap = NonZeroUsize::new(config.entries.max(1)).expect("nonzero");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            excluded_types: config.excluded_types,
        }
    }

    /// Looks up an object by UUID.
    pub fn get(&self, uuid: &str) -> Option<StoredObject> {
        self.inner.lock().expect("lock poisoned").get(uuid).cloned()
    }

    /// Inserts an object unless its type is excluded.
    pub fn put(&self, obj: &StoredObject) {
        if self.excluded_types.contains(&obj.record.type_name) {
            return;
        }
        self.inner
            .lock()
            .expect("lock poisoned")
            .put(obj.record.uuid.clone(), obj.clone());
    }

    /// Evicts an object by UUID.
    pub fn evict(&self, uuid: &str) {
        self.inner.lock().expect("lock poisoned").pop(uuid);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").len()
    }

    /// UUIDs currently cached, most recently used first.
    pub fn cached_uuids(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(uuid, _)| uuid.clone())
            .collect()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ObjectRecord;

    fn obj(type_name: &str, uuid: &str) -> StoredObject {
        StoredObject {
            record: ObjectRecord::new(type_name, uuid, &["d", "p", uuid]),
            ..Default::default()
        }
    }

    #[test]
    fn test_put_get_evict() {
        let cache = ObjectCache::new(CacheConfig::default());
        cache.put(&obj("virtual-network", "u1"));
        assert!(cache.get("u1").is_some());
        cache.evict("u1");
        assert!(cache.get("u1").is_none());
    }

    #[test]
    fn test_excluded_type_not_cached() {
        let mut config = CacheConfig::default();
        config.excluded_types.insert("instance-ip".to_string());
        let cache = ObjectCache::new(config);
        cache.put(&obj("instance-ip", "u1"));
        assert!(cache.get("u1").is_none());
    }

    #[test]
    fn test_lru_bound() {
        let cache = ObjectCache::new(CacheConfig {
            entries: 2,
            excluded_types: HashSet::new(),
        });
        cache.put(&obj("t", "u1"));
        cache.put(&obj("t", "u2"));
        cache.put(&obj("t", "u3"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("u1").is_none());
        assert!(cache.get("u3").is_some());
        let uuids = cache.cached_uuids();
        assert!(uuids.contains(&"u2".to_string()) && uuids.contains(&"u3".to_string()));
    }
}
