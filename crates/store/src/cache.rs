use std::num::NonZeroUsize;
use std::sync::Mutex;

/// A bounded LRU cache of loaded bucket snapshots, shared by all in-flight
/// requests. Values are handed out as `Arc` clones so a replacement never
/// invalidates a reader mid-request.
pub struct BucketCache {
    entries: Mutex<lru::LruCache<String, std::sync::Arc<crate::catalog::BucketSnapshot>>>,
}

impl BucketCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: Mutex::new(lru::LruCache::new(capacity)),
        }
    }

    fn key(name: &str) -> String {
        format!("/{}", name)
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<crate::catalog::BucketSnapshot>> {
        self.entries.lock().unwrap().get(&Self::key(name)).cloned()
    }

    pub fn put(&self, name: &str, snapshot: std::sync::Arc<crate::catalog::BucketSnapshot>) {
        self.entries.lock().unwrap().put(Self::key(name), snapshot);
    }

    /// Shootdown: drop a cached descriptor which is stale relative to a
    /// concurrent writer.
    pub fn invalidate(&self, name: &str) {
        self.entries.lock().unwrap().pop(&Self::key(name));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::BucketSnapshot;
    use models::BucketDescriptor;
    use std::sync::Arc;

    fn snapshot(name: &str) -> Arc<BucketSnapshot> {
        Arc::new(BucketSnapshot {
            desc: BucketDescriptor {
                name: name.to_string(),
                index: Default::default(),
                pre: vec![],
                post: vec![],
                options: Default::default(),
                reindex_active: Default::default(),
                mtime: chrono::Utc::now(),
            },
            pre: vec![],
            post: vec![],
        })
    }

    #[test]
    fn get_put_invalidate() {
        let cache = BucketCache::new(2);
        assert!(cache.get("a").is_none());

        cache.put("a", snapshot("a"));
        assert_eq!(cache.get("a").unwrap().desc.name, "a");

        cache.invalidate("a");
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = BucketCache::new(2);
        cache.put("a", snapshot("a"));
        cache.put("b", snapshot("b"));
        cache.get("a"); // touch so "b" is the eviction candidate
        cache.put("c", snapshot("c"));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }
}
