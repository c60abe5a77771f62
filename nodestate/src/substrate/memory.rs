//! In-process substrate implementations.
//!
//! These back the unit tests and local runs. They honour the same contracts as
//! the Kubernetes implementations: resource versions are checked on update,
//! deletes are observable through watches, and missing secrets are not-found
//! errors.

use super::{
    ByteStream, KeyValueStore, KvObject, LabelSelector, NodeStatusRepository, ObjectList, PodApi,
    PodInfo, PodLogOptions, PodPhase, SecretStore, WatchEvent, WatchStream, WorkflowEvent,
    WorkflowWatcher, EXPIRED,
};
use crate::core::Nodes;
use crate::errors::{NodeStateError, Result};
use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 1024;

fn broadcast_stream<T>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// In-memory [`KeyValueStore`].
#[derive(Debug)]
pub struct InMemoryKeyValueStore {
    objects: Mutex<BTreeMap<(String, String), KvObject>>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent<KvObject>>,
    injected_conflicts: AtomicUsize,
    writes: AtomicUsize,
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKeyValueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            events,
            injected_conflicts: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Stores an object directly, bypassing version checks.
    pub fn insert(&self, mut object: KvObject) -> KvObject {
        object.metadata.resource_version = Some(self.next_version());
        let key = (object.metadata.namespace.clone(), object.metadata.name.clone());
        self.objects.lock().insert(key, object.clone());
        let _ = self.events.send(WatchEvent::Added(object.clone()));
        object
    }

    /// Returns a copy of a stored object.
    #[must_use]
    pub fn object(&self, namespace: &str, name: &str) -> Option<KvObject> {
        self.objects
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Returns true when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Makes the next `n` updates fail with a conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Number of successful creates, updates and deletes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<KvObject>> {
        Ok(self.object(namespace, name))
    }

    async fn create(&self, mut object: KvObject) -> Result<KvObject> {
        let key = (object.metadata.namespace.clone(), object.metadata.name.clone());
        {
            let mut objects = self.objects.lock();
            if objects.contains_key(&key) {
                return Err(NodeStateError::conflict(object.key()));
            }
            object.metadata.resource_version = Some(self.next_version());
            objects.insert(key, object.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(WatchEvent::Added(object.clone()));
        Ok(object)
    }

    async fn update(&self, mut object: KvObject) -> Result<KvObject> {
        if self.take_injected_conflict() {
            return Err(NodeStateError::conflict(object.key()));
        }
        let key = (object.metadata.namespace.clone(), object.metadata.name.clone());
        {
            let mut objects = self.objects.lock();
            let Some(current) = objects.get(&key) else {
                return Err(NodeStateError::not_found(object.key()));
            };
            if let Some(expected) = &object.metadata.resource_version {
                if current.metadata.resource_version.as_ref() != Some(expected) {
                    return Err(NodeStateError::conflict(object.key()));
                }
            }
            object.metadata.resource_version = Some(self.next_version());
            objects.insert(key, object.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(WatchEvent::Modified(object.clone()));
        Ok(object)
    }

    async fn delete(&self, namespace: &str, name: &str, resource_version: Option<&str>) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let removed = {
            let mut objects = self.objects.lock();
            let Some(current) = objects.get(&key) else {
                return Err(NodeStateError::not_found(format!("{namespace}/{name}")));
            };
            if let Some(expected) = resource_version {
                if current.metadata.resource_version.as_deref() != Some(expected) {
                    return Err(NodeStateError::conflict(format!("{namespace}/{name}")));
                }
            }
            objects.remove(&key)
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(object) = removed {
            let _ = self.events.send(WatchEvent::Deleted(object));
        }
        Ok(())
    }

    async fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<ObjectList<KvObject>> {
        let items = self
            .objects
            .lock()
            .values()
            .filter(|o| namespace.map_or(true, |ns| o.metadata.namespace == ns))
            .filter(|o| selector.matches(&o.metadata.labels))
            .cloned()
            .collect();
        Ok(ObjectList {
            items,
            resource_version: self.version.load(Ordering::SeqCst).to_string(),
        })
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
        _since: Option<&str>,
    ) -> Result<WatchStream<KvObject>> {
        let namespace = namespace.map(str::to_string);
        let selector = selector.clone();
        let stream = broadcast_stream(self.events.subscribe()).filter_map(move |event| {
            let object = event.object();
            let keep = namespace
                .as_deref()
                .map_or(true, |ns| object.metadata.namespace == ns)
                && selector.matches(&object.metadata.labels);
            futures::future::ready(keep.then_some(Ok(event)))
        });
        Ok(stream.boxed())
    }
}

/// Pod events since the last compaction, and the live feed.
#[derive(Debug)]
struct PodHistory {
    events: broadcast::Sender<WatchEvent<PodInfo>>,
    retained: Vec<(u64, WatchEvent<PodInfo>)>,
    version: u64,
    compacted: u64,
}

/// In-memory [`PodApi`]. Log lines are stored with their timestamp prefix.
///
/// A watch resumed from a version replays the retained events after it;
/// versions older than the last [`InMemoryPodApi::compact`] are expired.
#[derive(Debug)]
pub struct InMemoryPodApi {
    pods: Mutex<BTreeMap<(String, String), PodInfo>>,
    logs: Mutex<HashMap<String, Vec<String>>>,
    log_requests: Mutex<HashMap<String, usize>>,
    history: Mutex<PodHistory>,
    lists: AtomicUsize,
}

impl Default for InMemoryPodApi {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPodApi {
    /// Creates an empty pod API.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            pods: Mutex::new(BTreeMap::new()),
            logs: Mutex::new(HashMap::new()),
            log_requests: Mutex::new(HashMap::new()),
            history: Mutex::new(PodHistory {
                events,
                retained: Vec::new(),
                version: 0,
                compacted: 0,
            }),
            lists: AtomicUsize::new(0),
        }
    }

    /// Adds or replaces a pod and notifies watchers.
    pub fn upsert_pod(&self, mut pod: PodInfo) {
        let mut history = self.history.lock();
        history.version += 1;
        let version = history.version;
        pod.resource_version = Some(version.to_string());
        let key = (pod.namespace.clone(), pod.name.clone());
        let existed = self.pods.lock().insert(key, pod.clone()).is_some();
        let event = if existed {
            WatchEvent::Modified(pod)
        } else {
            WatchEvent::Added(pod)
        };
        history.retained.push((version, event.clone()));
        let _ = history.events.send(event);
    }

    /// Changes the phase of an existing pod.
    pub fn set_phase(&self, namespace: &str, name: &str, phase: PodPhase) {
        let pod = self
            .pods
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned();
        if let Some(mut pod) = pod {
            pod.phase = phase;
            self.upsert_pod(pod);
        }
    }

    /// Forgets retained events; watches from older versions then fail as
    /// expired.
    pub fn compact(&self) {
        let mut history = self.history.lock();
        history.retained.clear();
        history.compacted = history.version;
    }

    /// Ends every open watch stream.
    pub fn close_watches(&self) {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        self.history.lock().events = events;
    }

    /// Sets the log lines of a pod, each `"<rfc3339> <content>"`.
    pub fn set_logs<I, S>(&self, name: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.logs
            .lock()
            .insert(name.to_string(), lines.into_iter().map(Into::into).collect());
    }

    /// Number of log streams opened for a pod.
    #[must_use]
    pub fn log_requests(&self, name: &str) -> usize {
        self.log_requests.lock().get(name).copied().unwrap_or(0)
    }

    /// Number of list calls served.
    #[must_use]
    pub fn list_requests(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PodApi for InMemoryPodApi {
    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<ObjectList<PodInfo>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let history = self.history.lock();
        let items = self
            .pods
            .lock()
            .values()
            .filter(|p| p.namespace == namespace && selector.matches(&p.labels))
            .cloned()
            .collect();
        Ok(ObjectList {
            items,
            resource_version: history.version.to_string(),
        })
    }

    async fn watch(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        since: Option<&str>,
    ) -> Result<WatchStream<PodInfo>> {
        let since = since
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| NodeStateError::validation(format!("invalid resource version '{v}'")))
            })
            .transpose()?;

        // Subscribing under the lock keeps replay and live events disjoint.
        let history = self.history.lock();
        let live = history.events.subscribe();
        let replay: Vec<WatchEvent<PodInfo>> = match since {
            Some(since) if since < history.compacted => {
                return Err(NodeStateError::remote(
                    EXPIRED,
                    format!("resource version {since} is older than {}", history.compacted),
                ));
            }
            Some(since) => history
                .retained
                .iter()
                .filter(|(version, _)| *version > since)
                .map(|(_, event)| event.clone())
                .collect(),
            None => Vec::new(),
        };
        drop(history);

        let namespace = namespace.to_string();
        let selector = selector.clone();
        let stream = futures::stream::iter(replay)
            .chain(broadcast_stream(live))
            .filter_map(move |event| {
                let pod = event.object();
                let keep = pod.namespace == namespace && selector.matches(&pod.labels);
                futures::future::ready(keep.then_some(Ok(event)))
            });
        Ok(stream.boxed())
    }

    async fn get_logs(&self, namespace: &str, name: &str, options: &PodLogOptions) -> Result<ByteStream> {
        if !self
            .pods
            .lock()
            .contains_key(&(namespace.to_string(), name.to_string()))
        {
            return Err(NodeStateError::not_found(format!("pod {namespace}/{name}")));
        }
        *self.log_requests.lock().entry(name.to_string()).or_insert(0) += 1;

        let mut lines = self.logs.lock().get(name).cloned().unwrap_or_default();
        if let Some(tail) = options.tail_lines.and_then(|t| usize::try_from(t).ok()) {
            let skip = lines.len().saturating_sub(tail);
            lines.drain(..skip);
        }
        let chunks: Vec<Result<Bytes>> = lines
            .into_iter()
            .map(|line| {
                let line = if options.timestamps {
                    line
                } else {
                    line.split_once(' ').map_or(line.clone(), |(_, rest)| rest.to_string())
                };
                Ok(Bytes::from(format!("{line}\n")))
            })
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// In-memory [`SecretStore`].
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    secrets: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemorySecretStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a secret value.
    #[must_use]
    pub fn with_secret(self, name: &str, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.secrets
            .lock()
            .insert((name.to_string(), key.to_string()), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn read(&self, name: &str, key: &str) -> Result<Vec<u8>> {
        self.secrets
            .lock()
            .get(&(name.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| NodeStateError::not_found(format!("secret {name}/{key}")))
    }
}

#[derive(Debug, Clone)]
struct OffloadRow {
    namespace: String,
    nodes: Nodes,
    created_at: Timestamp,
}

/// In-memory [`NodeStatusRepository`] keyed by (workflow UID, version).
#[derive(Debug)]
pub struct InMemoryNodeStatusRepository {
    rows: Mutex<HashMap<(String, String), OffloadRow>>,
    next_version: AtomicU64,
    enabled: bool,
    failing_gets: AtomicUsize,
    saves: AtomicUsize,
    gets: AtomicUsize,
}

impl Default for InMemoryNodeStatusRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNodeStatusRepository {
    /// Creates an enabled repository whose first version is `v1`.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a repository whose first version is `v{first}`.
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(first),
            enabled: true,
            failing_gets: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        }
    }

    /// Creates a repository that reports offloading as not configured.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Makes the next `n` reads fail with a transient error.
    pub fn fail_next_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Number of saves.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of read attempts.
    #[must_use]
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Namespace and creation time recorded for a row.
    #[must_use]
    pub fn row_info(&self, workflow_uid: &str, version: &str) -> Option<(String, Timestamp)> {
        self.rows
            .lock()
            .get(&(workflow_uid.to_string(), version.to_string()))
            .map(|row| (row.namespace.clone(), row.created_at))
    }
}

#[async_trait]
impl NodeStatusRepository for InMemoryNodeStatusRepository {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn get(&self, workflow_uid: &str, version: &str) -> Result<Nodes> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(NodeStateError::transient("offload repository unavailable"));
        }
        self.rows
            .lock()
            .get(&(workflow_uid.to_string(), version.to_string()))
            .map(|row| row.nodes.clone())
            .ok_or_else(|| {
                NodeStateError::not_found(format!("offloaded nodes {workflow_uid}/{version}"))
            })
    }

    async fn save(&self, workflow_uid: &str, namespace: &str, nodes: &Nodes) -> Result<String> {
        if !self.enabled {
            return Err(NodeStateError::permanent("node status offloading is not enabled"));
        }
        let version = format!("v{}", self.next_version.fetch_add(1, Ordering::SeqCst));
        self.rows.lock().insert(
            (workflow_uid.to_string(), version.clone()),
            OffloadRow {
                namespace: namespace.to_string(),
                nodes: nodes.clone(),
                created_at: now_utc(),
            },
        );
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }
}

/// In-memory [`WorkflowWatcher`] driven by [`InMemoryWorkflowWatcher::publish`].
#[derive(Debug)]
pub struct InMemoryWorkflowWatcher {
    events: broadcast::Sender<(String, String, WorkflowEvent)>,
}

impl Default for InMemoryWorkflowWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkflowWatcher {
    /// Creates a watcher with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self { events }
    }

    /// Publishes an event for `namespace/name`.
    pub fn publish(&self, namespace: &str, name: &str, event: WorkflowEvent) {
        let _ = self
            .events
            .send((namespace.to_string(), name.to_string(), event));
    }
}

#[async_trait]
impl WorkflowWatcher for InMemoryWorkflowWatcher {
    async fn watch_phase(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, Result<WorkflowEvent>>> {
        let target = (namespace.to_string(), name.to_string());
        let stream = broadcast_stream(self.events.subscribe()).filter_map(move |(ns, n, ev)| {
            let keep = ns == target.0 && n == target.1;
            futures::future::ready(keep.then_some(Ok(ev)))
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NodePhase, NodeStatus, NodeType};
    use crate::errors::ErrorKind;

    #[tokio::test]
    async fn test_kv_update_checks_resource_version() {
        let store = InMemoryKeyValueStore::new();
        let created = store.create(KvObject::new("ns", "c1")).await.unwrap();

        let mut stale = created.clone();
        let updated = store.update(created.with_data("k", "v")).await.unwrap();
        assert_ne!(updated.metadata.resource_version, stale.metadata.resource_version);

        stale.data.insert("k".into(), "other".into());
        let err = store.update(stale).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_kv_create_twice_conflicts() {
        let store = InMemoryKeyValueStore::new();
        store.create(KvObject::new("ns", "c1")).await.unwrap();
        let err = store.create(KvObject::new("ns", "c1")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_kv_list_by_label() {
        let store = InMemoryKeyValueStore::new();
        store.insert(KvObject::new("ns", "a").with_label("gc", "5m"));
        store.insert(KvObject::new("ns", "b"));
        store.insert(KvObject::new("other", "c").with_label("gc", "1h"));

        let sel = LabelSelector::everything().with_exists("gc");
        assert_eq!(store.list(None, &sel).await.unwrap().items.len(), 2);
        assert_eq!(store.list(Some("ns"), &sel).await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn test_kv_watch_sees_delete() {
        let store = InMemoryKeyValueStore::new();
        let mut watch = store
            .watch(Some("ns"), &LabelSelector::everything(), None)
            .await
            .unwrap();
        store.create(KvObject::new("ns", "c1")).await.unwrap();
        store.delete("ns", "c1", None).await.unwrap();

        assert!(matches!(watch.next().await, Some(Ok(WatchEvent::Added(_)))));
        assert!(matches!(watch.next().await, Some(Ok(WatchEvent::Deleted(_)))));
    }

    #[tokio::test]
    async fn test_pod_logs_tail_and_count() {
        let pods = InMemoryPodApi::new();
        pods.upsert_pod(PodInfo::new("ns", "p1", PodPhase::Running));
        pods.set_logs("p1", ["2024-01-01T00:00:00Z a", "2024-01-01T00:00:01Z b"]);

        let opts = PodLogOptions {
            tail_lines: Some(1),
            timestamps: false,
            ..PodLogOptions::default()
        };
        let chunks: Vec<_> = pods.get_logs("ns", "p1", &opts).await.unwrap().collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap().as_ref(), b"b\n");
        assert_eq!(pods.log_requests("p1"), 1);
    }

    #[tokio::test]
    async fn test_pod_watch_resumes_after_version() {
        let pods = InMemoryPodApi::new();
        pods.upsert_pod(PodInfo::new("ns", "p1", PodPhase::Running));
        let listed = pods.list("ns", &LabelSelector::everything()).await.unwrap();
        assert_eq!(listed.items[0].resource_version.as_deref(), Some("1"));
        pods.upsert_pod(PodInfo::new("ns", "p2", PodPhase::Running));

        let mut watch = pods
            .watch("ns", &LabelSelector::everything(), Some(&listed.resource_version))
            .await
            .unwrap();
        pods.upsert_pod(PodInfo::new("ns", "p3", PodPhase::Running));
        let first = watch.next().await.unwrap().unwrap();
        let second = watch.next().await.unwrap().unwrap();
        assert_eq!(first.object().name, "p2");
        assert_eq!(second.object().name, "p3");

        pods.close_watches();
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_pod_watch_from_compacted_version_expires() {
        let pods = InMemoryPodApi::new();
        pods.upsert_pod(PodInfo::new("ns", "p1", PodPhase::Running));
        pods.upsert_pod(PodInfo::new("ns", "p2", PodPhase::Running));
        pods.compact();

        let err = pods
            .watch("ns", &LabelSelector::everything(), Some("1"))
            .await
            .err()
            .unwrap();
        assert!(crate::substrate::is_expired(&err));
        assert!(pods.watch("ns", &LabelSelector::everything(), Some("2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_secret_missing_is_not_found() {
        let secrets = InMemorySecretStore::new().with_secret("creds", "accessKey", "AK");
        assert_eq!(secrets.read("creds", "accessKey").await.unwrap(), b"AK");
        assert!(secrets.read("creds", "secretKey").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_repository_versions() {
        let repo = InMemoryNodeStatusRepository::starting_at(7);
        let mut nodes = Nodes::new();
        nodes.insert(
            "n1".into(),
            NodeStatus::new("n1", NodeType::Pod).with_phase(NodePhase::Succeeded),
        );

        let version = repo.save("u1", "ns", &nodes).await.unwrap();
        assert_eq!(version, "v7");
        assert_eq!(repo.get("u1", "v7").await.unwrap(), nodes);
        assert!(repo.get("u1", "v8").await.unwrap_err().is_not_found());
        assert_eq!(repo.row_info("u1", "v7").map(|(ns, _)| ns), Some("ns".to_string()));
    }

    #[tokio::test]
    async fn test_workflow_watcher_filters_by_name() {
        let watcher = InMemoryWorkflowWatcher::new();
        let mut stream = watcher.watch_phase("ns", "wf-1").await.unwrap();
        watcher.publish("ns", "wf-2", WorkflowEvent::Deleted);
        watcher.publish("ns", "wf-1", WorkflowEvent::Phase(crate::core::WorkflowPhase::Succeeded));

        let ev = stream.next().await.unwrap().unwrap();
        assert_eq!(ev, WorkflowEvent::Phase(crate::core::WorkflowPhase::Succeeded));
    }
}
