//! Background eviction of idle cache entries.

use super::duration::parse_duration;
use super::entry::CacheEntry;
use super::{CONFIGMAP_TYPE_CACHE, CONFIGMAP_TYPE_LABEL, GC_AFTER_NOT_HIT_LABEL};
use crate::cancellation::CancellationToken;
use crate::config::CacheConfig;
use crate::errors::Result;
use crate::substrate::{KeyValueStore, KvObject, LabelSelector, WatchEvent, WatchStream};
use crate::utils::{Clock, SystemClock};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one reaping pass did to a cache object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReapStats {
    /// Objects examined.
    pub objects: usize,
    /// Entries removed.
    pub entries_removed: usize,
    /// Objects deleted because they became empty.
    pub objects_deleted: usize,
    /// Objects that could not be processed.
    pub failures: usize,
}

/// Removes cache entries that have not been hit for longer than the duration
/// in their object's `cache-gc-after-not-hit-duration` label.
///
/// Objects to reap are tracked from a watch and refreshed by a periodic full
/// list. Each reaping pass works through the tracked objects one by one; a
/// failure on one object is logged and the pass moves on.
pub struct CacheReaper {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    namespace: Option<String>,
    tracked: Mutex<BTreeSet<(String, String)>>,
}

impl CacheReaper {
    /// Creates a reaper for all namespaces.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
            namespace: None,
            tracked: Mutex::new(BTreeSet::new()),
        }
    }

    /// Restricts the reaper to one namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn selector() -> LabelSelector {
        LabelSelector::everything()
            .with_equals(CONFIGMAP_TYPE_LABEL, CONFIGMAP_TYPE_CACHE)
            .with_exists(GC_AFTER_NOT_HIT_LABEL)
    }

    /// Number of objects currently tracked.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Replaces the tracked set with a fresh list. Returns the list's
    /// resource version.
    pub async fn resync(&self) -> Result<String> {
        let list = self
            .store
            .list(self.namespace.as_deref(), &Self::selector())
            .await?;
        let keys: BTreeSet<_> = list
            .items
            .iter()
            .map(|o| (o.metadata.namespace.clone(), o.metadata.name.clone()))
            .collect();
        debug!(objects = keys.len(), "Resynced cache objects");
        *self.tracked.lock() = keys;
        Ok(list.resource_version)
    }

    /// Runs one reaping pass over the tracked objects.
    pub async fn run_cycle(&self) -> ReapStats {
        let keys: Vec<_> = self.tracked.lock().iter().cloned().collect();
        let mut stats = ReapStats::default();
        for (namespace, name) in keys {
            stats.objects += 1;
            match self.reap_object(&namespace, &name).await {
                Ok((removed, deleted)) => {
                    stats.entries_removed += removed;
                    if deleted {
                        stats.objects_deleted += 1;
                    }
                }
                Err(e) => {
                    stats.failures += 1;
                    warn!(
                        cache = %format!("{namespace}/{name}"),
                        error = %e,
                        "Failed to reap cache object"
                    );
                }
            }
        }
        if stats.entries_removed > 0 {
            info!(
                objects = stats.objects,
                entries_removed = stats.entries_removed,
                objects_deleted = stats.objects_deleted,
                "Reaped idle cache entries"
            );
        }
        stats
    }

    async fn reap_object(&self, namespace: &str, name: &str) -> Result<(usize, bool)> {
        let Some(mut object) = self.store.get(namespace, name).await? else {
            self.untrack(namespace, name);
            return Ok((0, false));
        };
        let Some(label) = object.label(GC_AFTER_NOT_HIT_LABEL) else {
            self.untrack(namespace, name);
            return Ok((0, false));
        };
        let ttl = parse_duration(label).map_err(|e| e.context(object.key()))?;
        let now = self.clock.now();

        let before = object.data.len();
        object.data.retain(|key, raw| match CacheEntry::decode(key, raw) {
            Ok(entry) => !entry.is_idle_longer_than(now, ttl),
            Err(e) => {
                warn!(key = %key, error = %e, "Keeping unreadable cache entry");
                true
            }
        });
        let removed = before - object.data.len();
        if removed == 0 {
            return Ok((0, false));
        }

        if object.data.is_empty() {
            self.store
                .delete(namespace, name, object.metadata.resource_version.as_deref())
                .await?;
            self.untrack(namespace, name);
            debug!(cache = %object.key(), removed, "Deleted empty cache object");
            Ok((removed, true))
        } else {
            let key = object.key();
            self.store.update(object).await?;
            debug!(cache = %key, removed, "Pruned cache object");
            Ok((removed, false))
        }
    }

    fn untrack(&self, namespace: &str, name: &str) {
        self.tracked
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    fn observe(&self, event: WatchEvent<KvObject>) {
        let object = event.object();
        let key = (object.metadata.namespace.clone(), object.metadata.name.clone());
        match event {
            WatchEvent::Added(_) | WatchEvent::Modified(_) => {
                self.tracked.lock().insert(key);
            }
            WatchEvent::Deleted(_) => {
                self.tracked.lock().remove(&key);
            }
        }
    }

    async fn open_watch(&self, since: Option<&str>) -> Option<WatchStream<KvObject>> {
        match self
            .store
            .watch(self.namespace.as_deref(), &Self::selector(), since)
            .await
        {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "Failed to watch cache objects");
                None
            }
        }
    }

    async fn resync_and_watch(&self) -> Option<WatchStream<KvObject>> {
        match self.resync().await {
            Ok(version) => self.open_watch(Some(&version)).await,
            Err(e) => {
                warn!(error = %e, "Failed to list cache objects");
                self.open_watch(None).await
            }
        }
    }

    /// Reaps every `gc_period` until `token` is cancelled.
    pub async fn run(&self, token: Arc<CancellationToken>) {
        info!(
            period_ms = self.config.gc_period_ms,
            namespace = self.namespace.as_deref().unwrap_or("*"),
            "Starting cache reaper"
        );
        let mut gc = tokio::time::interval(self.config.gc_period());
        gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let resync_period = self.config.resync_period();
        let mut resync = tokio::time::interval_at(tokio::time::Instant::now() + resync_period, resync_period);
        let mut watch = self.resync_and_watch().await;

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = gc.tick() => {
                    self.run_cycle().await;
                }
                _ = resync.tick() => {
                    watch = self.resync_and_watch().await;
                }
                event = next_event(&mut watch) => match event {
                    Some(Ok(event)) => self.observe(event),
                    Some(Err(e)) => {
                        warn!(error = %e, "Cache watch failed, relisting");
                        watch = self.resync_and_watch().await;
                    }
                    None => {
                        debug!("Cache watch closed, relisting");
                        watch = self.resync_and_watch().await;
                    }
                },
            }
        }
        info!("Cache reaper stopped");
    }
}

async fn next_event(
    watch: &mut Option<WatchStream<KvObject>>,
) -> Option<Result<WatchEvent<KvObject>>> {
    match watch {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Outputs;
    use crate::substrate::memory::InMemoryKeyValueStore;
    use crate::utils::{ManualClock, Timestamp};
    use chrono::TimeZone;
    use std::time::Duration;

    fn t0() -> Timestamp {
        chrono::Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn entry_json(last_hit: Timestamp) -> String {
        let mut entry = CacheEntry::new("n1", Outputs::new(), last_hit - chrono::Duration::hours(1));
        entry.touch(last_hit);
        entry.encode().unwrap()
    }

    fn cache_object(name: &str, ttl: &str) -> KvObject {
        KvObject::new("argo", name)
            .with_label(CONFIGMAP_TYPE_LABEL, CONFIGMAP_TYPE_CACHE)
            .with_label(GC_AFTER_NOT_HIT_LABEL, ttl)
    }

    fn reaper(store: &Arc<InMemoryKeyValueStore>, now: Timestamp) -> CacheReaper {
        CacheReaper::new(store.clone(), CacheConfig::default())
            .with_clock(Arc::new(ManualClock::new(now)))
    }

    #[tokio::test]
    async fn test_idle_entry_removed_and_object_deleted() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        store.insert(cache_object("c1", "5m").with_data("k1", entry_json(t0())));

        let reaper = reaper(&store, t0() + chrono::Duration::minutes(6));
        reaper.resync().await.unwrap();
        let stats = reaper.run_cycle().await;

        assert_eq!(stats.entries_removed, 1);
        assert_eq!(stats.objects_deleted, 1);
        assert!(store.object("argo", "c1").is_none());
        assert_eq!(reaper.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_recent_entries_kept() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let now = t0() + chrono::Duration::minutes(6);
        store.insert(
            cache_object("c1", "5m")
                .with_data("old", entry_json(t0()))
                .with_data("fresh", entry_json(now - chrono::Duration::minutes(5))),
        );

        let reaper = reaper(&store, now);
        reaper.resync().await.unwrap();
        let stats = reaper.run_cycle().await;

        assert_eq!(stats.entries_removed, 1);
        let object = store.object("argo", "c1").unwrap();
        assert!(object.data.contains_key("fresh"));
        assert!(!object.data.contains_key("old"));
    }

    #[tokio::test]
    async fn test_unlabelled_caches_ignored() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        store.insert(
            KvObject::new("argo", "forever")
                .with_label(CONFIGMAP_TYPE_LABEL, CONFIGMAP_TYPE_CACHE)
                .with_data("k1", entry_json(t0())),
        );
        let reaper = reaper(&store, t0() + chrono::Duration::days(30));
        reaper.resync().await.unwrap();
        assert_eq!(reaper.tracked_count(), 0);
        assert_eq!(reaper.run_cycle().await, ReapStats::default());
        assert!(store.object("argo", "forever").is_some());
    }

    #[tokio::test]
    async fn test_failure_on_one_object_continues() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        store.insert(cache_object("bad", "sometime").with_data("k1", entry_json(t0())));
        store.insert(cache_object("good", "5m").with_data("k1", entry_json(t0())));

        let reaper = reaper(&store, t0() + chrono::Duration::minutes(6));
        reaper.resync().await.unwrap();
        let stats = reaper.run_cycle().await;

        assert_eq!(stats.objects, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.objects_deleted, 1);
        assert!(store.object("argo", "bad").is_some());
    }

    #[tokio::test]
    async fn test_conflict_retried_next_cycle() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let now = t0() + chrono::Duration::minutes(10);
        store.insert(
            cache_object("c1", "5m")
                .with_data("old", entry_json(t0()))
                .with_data("fresh", entry_json(now)),
        );
        let reaper = reaper(&store, now);
        reaper.resync().await.unwrap();

        store.inject_conflicts(1);
        assert_eq!(reaper.run_cycle().await.failures, 1);
        assert_eq!(reaper.run_cycle().await.entries_removed, 1);
        assert!(!store.object("argo", "c1").unwrap().data.contains_key("old"));
    }

    #[tokio::test]
    async fn test_run_reaps_objects_seen_by_watch() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let config = CacheConfig::default().with_gc_period(Duration::from_millis(20));
        let reaper = Arc::new(
            CacheReaper::new(store.clone(), config)
                .with_clock(Arc::new(ManualClock::new(t0() + chrono::Duration::hours(2)))),
        );
        let token = Arc::new(CancellationToken::new());
        let handle = {
            let reaper = Arc::clone(&reaper);
            let token = Arc::clone(&token);
            tokio::spawn(async move { reaper.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        store
            .create(cache_object("late", "30m").with_data("k1", entry_json(t0())))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.object("argo", "late").is_some() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.object("argo", "late").is_none());

        token.cancel("test done");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
