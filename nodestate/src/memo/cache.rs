//! A named memoization cache stored in one labelled key-value object.

use super::duration::parse_duration;
use super::entry::{validate_cache_key, CacheEntry};
use super::{CONFIGMAP_TYPE_CACHE, CONFIGMAP_TYPE_LABEL, GC_AFTER_NOT_HIT_LABEL};
use crate::core::Outputs;
use crate::errors::{NodeStateError, Result};
use crate::substrate::{KeyValueStore, KvObject};
use crate::utils::{Clock, SystemClock};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_CONFLICT_RETRIES: usize = 3;

/// Memoized step outputs, keyed by cache key.
///
/// Every entry lives in the data map of one object named after the cache.
/// Loads and saves on one instance are serialized; writes from other
/// processes are detected through the object's resource version.
pub struct MemoizationCache {
    namespace: String,
    name: String,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    conflict_retries: usize,
    gc_after_not_hit: Option<String>,
    lock: Mutex<()>,
}

impl MemoizationCache {
    /// Creates a cache backed by the object `namespace/name`.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            store,
            clock: Arc::new(SystemClock),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            gc_after_not_hit: None,
            lock: Mutex::new(()),
        }
    }

    /// Sets the clock used for entry timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets how many times a save is attempted on conflicts.
    #[must_use]
    pub fn with_conflict_retries(mut self, retries: usize) -> Self {
        self.conflict_retries = retries.max(1);
        self
    }

    /// Labels a newly created backing object for reaping after `duration`
    /// without hits (for example `"24h"`).
    #[must_use]
    pub fn with_gc_after_not_hit(mut self, duration: impl Into<String>) -> Self {
        self.gc_after_not_hit = Some(duration.into());
        self
    }

    /// Cache name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace of the backing object.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn object_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Looks up `key` and records the hit.
    ///
    /// A missing object or key is a miss. When the hit cannot be written back
    /// the entry is still returned, with its previous hit time.
    pub async fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        validate_cache_key(key)?;
        let _guard = self.lock.lock().await;

        let Some(mut object) = self.store.get(&self.namespace, &self.name).await? else {
            debug!(cache = %self.object_key(), key = %key, "Cache miss: no backing object");
            return Ok(None);
        };
        check_is_cache(&object)?;
        let Some(raw) = object.data.get(key) else {
            debug!(cache = %self.object_key(), key = %key, "Cache miss");
            return Ok(None);
        };

        let entry = CacheEntry::decode(key, raw)?;
        let mut hit = entry.clone();
        hit.touch(self.clock.now());
        object.data.insert(key.to_string(), hit.encode()?);

        match self.store.update(object).await {
            Ok(_) => {
                debug!(cache = %self.object_key(), key = %key, node_id = %hit.node_id, "Cache hit");
                Ok(Some(hit))
            }
            Err(e) => {
                warn!(
                    cache = %self.object_key(),
                    key = %key,
                    error = %e,
                    "Cache hit not recorded"
                );
                Ok(Some(entry))
            }
        }
    }

    /// Stores the outputs of `node_id` under `key`.
    ///
    /// Creates the backing object when missing and refuses objects that are
    /// not labelled as caches. Conflicts are retried.
    pub async fn save(&self, key: &str, node_id: &str, outputs: &Outputs) -> Result<()> {
        validate_cache_key(key)?;
        if let Some(duration) = &self.gc_after_not_hit {
            parse_duration(duration).map_err(|e| e.context(GC_AFTER_NOT_HIT_LABEL))?;
        }
        let _guard = self.lock.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_save(key, node_id, outputs).await {
                Ok(()) => {
                    debug!(cache = %self.object_key(), key = %key, node_id = %node_id, "Saved cache entry");
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < self.conflict_retries => {
                    debug!(cache = %self.object_key(), key = %key, attempt, "Conflict saving cache entry, retrying");
                }
                Err(e) => return Err(e.context(format!("save cache entry {} {key}", self.object_key()))),
            }
        }
    }

    async fn try_save(&self, key: &str, node_id: &str, outputs: &Outputs) -> Result<()> {
        let entry = CacheEntry::new(node_id, outputs.clone(), self.clock.now());
        let encoded = entry.encode()?;

        match self.store.get(&self.namespace, &self.name).await? {
            Some(mut object) => {
                check_is_cache(&object)?;
                object.data.insert(key.to_string(), encoded);
                self.store.update(object).await?;
            }
            None => {
                let mut object = KvObject::new(&self.namespace, &self.name)
                    .with_label(CONFIGMAP_TYPE_LABEL, CONFIGMAP_TYPE_CACHE)
                    .with_data(key, encoded);
                if let Some(duration) = &self.gc_after_not_hit {
                    object = object.with_label(GC_AFTER_NOT_HIT_LABEL, duration.as_str());
                }
                self.store.create(object).await?;
            }
        }
        Ok(())
    }

    /// Like [`load`](Self::load), but any error is logged and reported as a
    /// miss.
    pub async fn load_or_miss(&self, key: &str) -> Option<CacheEntry> {
        match self.load(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(cache = %self.object_key(), key = %key, error = %e, "Cache load failed, treating as miss");
                None
            }
        }
    }

    /// Like [`save`](Self::save), but any error is logged and ignored.
    ///
    /// Returns true if the entry was stored.
    pub async fn save_best_effort(&self, key: &str, node_id: &str, outputs: &Outputs) -> bool {
        match self.save(key, node_id, outputs).await {
            Ok(()) => true,
            Err(e) => {
                warn!(cache = %self.object_key(), key = %key, error = %e, "Cache save failed, continuing");
                false
            }
        }
    }
}

impl std::fmt::Debug for MemoizationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoizationCache")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("conflict_retries", &self.conflict_retries)
            .finish_non_exhaustive()
    }
}

fn check_is_cache(object: &KvObject) -> Result<()> {
    match object.label(CONFIGMAP_TYPE_LABEL) {
        Some(CONFIGMAP_TYPE_CACHE) => Ok(()),
        Some(other) => Err(NodeStateError::validation(format!(
            "object {} is a '{other}', not a cache",
            object.key()
        ))),
        None => Err(NodeStateError::validation(format!(
            "object {} is not labelled {CONFIGMAP_TYPE_LABEL}={CONFIGMAP_TYPE_CACHE}",
            object.key()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::substrate::memory::InMemoryKeyValueStore;
    use crate::utils::ManualClock;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<InMemoryKeyValueStore>, Arc<ManualClock>, MemoizationCache) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let clock = Arc::new(ManualClock::new(
            chrono::Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let cache = MemoizationCache::new("argo", "c1", store.clone()).with_clock(clock.clone());
        (store, clock, cache)
    }

    fn outputs() -> Outputs {
        Outputs::new().with_parameter("out", "42")
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (store, clock, cache) = setup();
        assert_eq!(cache.load("k1").await.unwrap(), None);
        assert!(store.is_empty());

        cache.save("k1", "n1", &outputs()).await.unwrap();
        let saved_at = clock.now();
        let object = store.object("argo", "c1").unwrap();
        assert_eq!(object.label(CONFIGMAP_TYPE_LABEL), Some(CONFIGMAP_TYPE_CACHE));

        clock.advance(chrono::Duration::seconds(1));
        let first = cache.load("k1").await.unwrap().unwrap();
        assert_eq!(first.node_id, "n1");
        assert_eq!(first.outputs, outputs());
        assert_eq!(first.creation_timestamp, saved_at);
        assert!(first.last_hit_timestamp > saved_at);

        clock.advance(chrono::Duration::seconds(1));
        let second = cache.load("k1").await.unwrap().unwrap();
        assert!(second.last_hit_timestamp > first.last_hit_timestamp);
    }

    #[tokio::test]
    async fn test_invalid_key_touches_nothing() {
        let (store, _, cache) = setup();
        let err = cache.save("-bad", "n1", &outputs()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(cache.load("a_b").await.unwrap_err().kind(), ErrorKind::Validation);
        assert!(store.is_empty());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_refuses_unlabelled_object() {
        let (store, _, cache) = setup();
        store.insert(KvObject::new("argo", "c1").with_data("other", "x"));
        let before = store.object("argo", "c1");

        let err = cache.save("k1", "n1", &outputs()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(store.object("argo", "c1"), before);
        assert_eq!(cache.load("other").await.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_refuses_conflicting_type_label() {
        let (store, _, cache) = setup();
        store.insert(KvObject::new("argo", "c1").with_label(CONFIGMAP_TYPE_LABEL, "Parameter"));
        let err = cache.save("k1", "n1", &outputs()).await.unwrap_err();
        assert!(err.to_string().contains("not a cache"));
    }

    #[tokio::test]
    async fn test_save_retries_conflicts() {
        let (store, _, cache) = setup();
        cache.save("k1", "n1", &outputs()).await.unwrap();

        store.inject_conflicts(2);
        cache.save("k2", "n2", &outputs()).await.unwrap();
        assert!(store.object("argo", "c1").unwrap().data.contains_key("k2"));

        store.inject_conflicts(3);
        let err = cache.save("k3", "n3", &outputs()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!store.object("argo", "c1").unwrap().data.contains_key("k3"));
    }

    #[tokio::test]
    async fn test_load_returns_entry_when_hit_not_recorded() {
        let (store, clock, cache) = setup();
        cache.save("k1", "n1", &outputs()).await.unwrap();
        let saved_at = clock.now();

        clock.advance(chrono::Duration::minutes(1));
        store.inject_conflicts(1);
        let entry = cache.load("k1").await.unwrap().unwrap();
        assert_eq!(entry.last_hit_timestamp, saved_at);
    }

    #[tokio::test]
    async fn test_gc_label_on_create() {
        let (store, _, cache) = setup();
        let cache = cache.with_gc_after_not_hit("30m");
        cache.save("k1", "n1", &outputs()).await.unwrap();
        let object = store.object("argo", "c1").unwrap();
        assert_eq!(object.label(GC_AFTER_NOT_HIT_LABEL), Some("30m"));
    }

    #[tokio::test]
    async fn test_bad_gc_label_rejected_before_write() {
        let (store, _, cache) = setup();
        let cache = cache.with_gc_after_not_hit("soon");
        assert_eq!(
            cache.save("k1", "n1", &outputs()).await.unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_best_effort_helpers_swallow_errors() {
        let (store, _, cache) = setup();
        store.insert(KvObject::new("argo", "c1"));
        assert!(!cache.save_best_effort("k1", "n1", &outputs()).await);
        assert_eq!(cache.load_or_miss("k1").await, None);
        assert_eq!(cache.load_or_miss("bad_key").await, None);
    }
}
