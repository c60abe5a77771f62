//! Shared cache instances.

use super::MemoizationCache;
use crate::config::CacheConfig;
use crate::substrate::KeyValueStore;
use crate::sync::ConcurrentMap;
use crate::utils::{Clock, SystemClock};
use std::sync::Arc;

/// Hands out one [`MemoizationCache`] per (namespace, cache name), so all
/// callers of a cache share its lock.
pub struct CacheFactory {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    caches: ConcurrentMap<(String, String), Arc<MemoizationCache>>,
}

impl CacheFactory {
    /// Creates a factory over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
            caches: ConcurrentMap::new(),
        }
    }

    /// Sets the clock handed to new caches.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the cache `name` in `namespace`, creating it on first use.
    pub fn get_cache(&self, namespace: &str, name: &str) -> Arc<MemoizationCache> {
        let key = (namespace.to_string(), name.to_string());
        if let Some(cache) = self.caches.load(&key) {
            return cache;
        }
        let cache = MemoizationCache::new(namespace, name, Arc::clone(&self.store))
            .with_clock(Arc::clone(&self.clock))
            .with_conflict_retries(self.config.conflict_retries);
        self.caches.load_or_store(key, Arc::new(cache)).0
    }

    /// Number of caches handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    /// True when no cache was handed out yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Outputs;
    use crate::substrate::memory::InMemoryKeyValueStore;

    #[tokio::test]
    async fn test_same_name_same_instance() {
        let factory = CacheFactory::new(Arc::new(InMemoryKeyValueStore::new()), CacheConfig::default());
        let a = factory.get_cache("argo", "c1");
        let b = factory.get_cache("argo", "c1");
        let c = factory.get_cache("other", "c1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(factory.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_saves_share_cache() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let factory = Arc::new(CacheFactory::new(store.clone(), CacheConfig::default()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let factory = Arc::clone(&factory);
            handles.push(tokio::spawn(async move {
                let cache = factory.get_cache("argo", "shared");
                cache
                    .save(&format!("k{i}"), &format!("n{i}"), &Outputs::new())
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.object("argo", "shared").unwrap().data.len(), 8);
    }
}
