//! Kubernetes-backed substrate: config maps, pods, secrets and workflow objects.

use super::{
    ByteStream, KeyValueStore, KvObject, LabelSelector, ObjectList, PodApi, PodInfo, PodLogOptions,
    PodPhase, SecretStore, WatchEvent, WatchStream, WorkflowEvent, WorkflowWatcher, EXPIRED,
};
use crate::core::{ObjectMeta, WorkflowPhase};
use crate::errors::{NodeStateError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::io::AsyncReadExt;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as KubeMeta;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, LogParams,
    PostParams, Preconditions, WatchEvent as KubeWatchEvent, WatchParams,
};
use kube::Client;
use tracing::debug;

const LOG_READ_BUFFER: usize = 64 * 1024;

fn map_kube_error(err: kube::Error, resource: &str) -> NodeStateError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => NodeStateError::not_found(resource),
            409 => NodeStateError::conflict(resource),
            410 => NodeStateError::remote(EXPIRED, response.message).context(resource.to_string()),
            429 => NodeStateError::remote("Throttling", response.message).context(resource.to_string()),
            500..=599 => NodeStateError::remote("InternalError", response.message)
                .context(resource.to_string()),
            _ => NodeStateError::permanent(format!("{resource}: {}", response.message)),
        },
        kube::Error::HyperError(e) => NodeStateError::remote("RequestError", e.to_string()),
        other => NodeStateError::permanent(format!("{resource}: {other}")),
    }
}

fn meta_from_kube(meta: KubeMeta) -> ObjectMeta {
    ObjectMeta {
        name: meta.name.unwrap_or_default(),
        namespace: meta.namespace.unwrap_or_default(),
        uid: meta.uid.unwrap_or_default(),
        resource_version: meta.resource_version,
        labels: meta.labels.unwrap_or_default(),
        annotations: meta.annotations.unwrap_or_default(),
    }
}

fn config_map_to_object(cm: ConfigMap) -> KvObject {
    KvObject {
        metadata: meta_from_kube(cm.metadata),
        data: cm.data.unwrap_or_default(),
    }
}

fn object_to_config_map(object: KvObject) -> ConfigMap {
    let meta = object.metadata;
    ConfigMap {
        metadata: KubeMeta {
            name: Some(meta.name),
            namespace: Some(meta.namespace),
            resource_version: meta.resource_version,
            labels: (!meta.labels.is_empty()).then_some(meta.labels),
            annotations: (!meta.annotations.is_empty()).then_some(meta.annotations),
            ..KubeMeta::default()
        },
        data: Some(object.data),
        ..ConfigMap::default()
    }
}

fn map_watch_event<K, T>(event: std::result::Result<KubeWatchEvent<K>, kube::Error>, convert: fn(K) -> T) -> Option<Result<WatchEvent<T>>>
where
    K: Clone,
{
    match event {
        Ok(KubeWatchEvent::Added(o)) => Some(Ok(WatchEvent::Added(convert(o)))),
        Ok(KubeWatchEvent::Modified(o)) => Some(Ok(WatchEvent::Modified(convert(o)))),
        Ok(KubeWatchEvent::Deleted(o)) => Some(Ok(WatchEvent::Deleted(convert(o)))),
        Ok(KubeWatchEvent::Bookmark(_)) => None,
        Ok(KubeWatchEvent::Error(e)) if e.code == 410 => Some(Err(NodeStateError::remote(EXPIRED, e.message))),
        Ok(KubeWatchEvent::Error(e)) => Some(Err(NodeStateError::remote(
            e.reason.clone(),
            e.message,
        ))),
        Err(e) => Some(Err(map_kube_error(e, "watch"))),
    }
}

/// [`KeyValueStore`] over config maps.
#[derive(Clone)]
pub struct KubeKeyValueStore {
    client: Client,
}

impl KubeKeyValueStore {
    /// Creates a store using `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: Option<&str>) -> Api<ConfigMap> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl KeyValueStore for KubeKeyValueStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<KvObject>> {
        let cm = self
            .api(Some(namespace))
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(e, &format!("configmap {namespace}/{name}")))?;
        Ok(cm.map(config_map_to_object))
    }

    async fn create(&self, object: KvObject) -> Result<KvObject> {
        let resource = format!("configmap {}", object.key());
        let namespace = object.metadata.namespace.clone();
        let created = self
            .api(Some(&namespace))
            .create(&PostParams::default(), &object_to_config_map(object))
            .await
            .map_err(|e| map_kube_error(e, &resource))?;
        Ok(config_map_to_object(created))
    }

    async fn update(&self, object: KvObject) -> Result<KvObject> {
        let resource = format!("configmap {}", object.key());
        let namespace = object.metadata.namespace.clone();
        let name = object.metadata.name.clone();
        let updated = self
            .api(Some(&namespace))
            .replace(&name, &PostParams::default(), &object_to_config_map(object))
            .await
            .map_err(|e| map_kube_error(e, &resource))?;
        Ok(config_map_to_object(updated))
    }

    async fn delete(&self, namespace: &str, name: &str, resource_version: Option<&str>) -> Result<()> {
        let params = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..DeleteParams::default()
        };
        self.api(Some(namespace))
            .delete(name, &params)
            .await
            .map_err(|e| map_kube_error(e, &format!("configmap {namespace}/{name}")))?;
        Ok(())
    }

    async fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<ObjectList<KvObject>> {
        let list = self
            .api(namespace)
            .list(&ListParams::default().labels(&selector.to_string()))
            .await
            .map_err(|e| map_kube_error(e, "configmaps"))?;
        Ok(ObjectList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items.into_iter().map(config_map_to_object).collect(),
        })
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
        since: Option<&str>,
    ) -> Result<WatchStream<KvObject>> {
        let stream = self
            .api(namespace)
            .watch(
                &WatchParams::default().labels(&selector.to_string()),
                since.unwrap_or("0"),
            )
            .await
            .map_err(|e| map_kube_error(e, "configmaps"))?;
        Ok(stream
            .filter_map(|ev| futures::future::ready(map_watch_event(ev, config_map_to_object)))
            .boxed())
    }
}

fn pod_to_info(pod: Pod) -> PodInfo {
    let status = pod.status.unwrap_or_default();
    let phase = match status.phase.as_deref() {
        Some("Pending") => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        _ => PodPhase::Unknown,
    };
    PodInfo {
        name: pod.metadata.name.unwrap_or_default(),
        namespace: pod.metadata.namespace.unwrap_or_default(),
        phase,
        start_time: status.start_time.map(|t| t.0),
        labels: pod.metadata.labels.unwrap_or_default(),
        resource_version: pod.metadata.resource_version,
    }
}

/// [`PodApi`] over the core pods API.
#[derive(Clone)]
pub struct KubePodApi {
    client: Client,
}

impl KubePodApi {
    /// Creates a pod API using `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<ObjectList<PodInfo>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(&selector.to_string()))
            .await
            .map_err(|e| map_kube_error(e, "pods"))?;
        Ok(ObjectList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items.into_iter().map(pod_to_info).collect(),
        })
    }

    async fn watch(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        since: Option<&str>,
    ) -> Result<WatchStream<PodInfo>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let stream = api
            .watch(
                &WatchParams::default().labels(&selector.to_string()),
                since.unwrap_or("0"),
            )
            .await
            .map_err(|e| map_kube_error(e, "pods"))?;
        Ok(stream
            .filter_map(|ev| futures::future::ready(map_watch_event(ev, pod_to_info)))
            .boxed())
    }

    async fn get_logs(&self, namespace: &str, name: &str, options: &PodLogOptions) -> Result<ByteStream> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: options.container.clone(),
            follow: options.follow,
            tail_lines: options.tail_lines,
            since_seconds: options.since_seconds,
            timestamps: options.timestamps,
            previous: options.previous,
            ..LogParams::default()
        };
        let reader = api
            .log_stream(name, &params)
            .await
            .map_err(|e| map_kube_error(e, &format!("pod {namespace}/{name} logs")))?;
        debug!(namespace = %namespace, pod = %name, follow = options.follow, "Opened pod log stream");

        let stream = futures::stream::unfold(Some(Box::pin(reader)), |state| async move {
            let mut reader = state?;
            let mut buf = vec![0u8; LOG_READ_BUFFER];
            match reader.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), Some(reader)))
                }
                Err(e) => Some((Err(NodeStateError::from(e)), None)),
            }
        });
        Ok(stream.boxed())
    }
}

/// [`SecretStore`] over secrets in a single namespace.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
    namespace: String,
}

impl KubeSecretStore {
    /// Creates a store reading secrets from `namespace`.
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn read(&self, name: &str, key: &str) -> Result<Vec<u8>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = api
            .get(name)
            .await
            .map_err(|e| map_kube_error(e, &format!("secret {}/{name}", self.namespace)))?;
        secret
            .data
            .and_then(|mut data| data.remove(key))
            .map(|bytes| bytes.0)
            .ok_or_else(|| NodeStateError::not_found(format!("secret {name}/{key}")))
    }
}

/// [`WorkflowWatcher`] over the workflow custom resource.
#[derive(Clone)]
pub struct KubeWorkflowWatcher {
    client: Client,
    resource: ApiResource,
}

impl KubeWorkflowWatcher {
    /// Creates a watcher for `workflows.nodestate.io/v1alpha1`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("workflows.nodestate.io", "v1alpha1", "Workflow");
        Self::with_resource(client, ApiResource::from_gvk(&gvk))
    }

    /// Creates a watcher for an explicit workflow resource.
    #[must_use]
    pub fn with_resource(client: Client, resource: ApiResource) -> Self {
        Self { client, resource }
    }
}

fn workflow_phase(obj: &DynamicObject) -> WorkflowPhase {
    match obj.data["status"]["phase"].as_str() {
        Some("Running") => WorkflowPhase::Running,
        Some("Succeeded") => WorkflowPhase::Succeeded,
        Some("Failed") => WorkflowPhase::Failed,
        Some("Error") => WorkflowPhase::Error,
        _ => WorkflowPhase::Pending,
    }
}

#[async_trait]
impl WorkflowWatcher for KubeWorkflowWatcher {
    async fn watch_phase(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, Result<WorkflowEvent>>> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.resource);
        let params = WatchParams::default().fields(&format!("metadata.name={name}"));
        let stream = api
            .watch(&params, "0")
            .await
            .map_err(|e| map_kube_error(e, &format!("workflow {namespace}/{name}")))?;
        Ok(stream
            .map_err(|e| map_kube_error(e, "workflow watch"))
            .try_filter_map(|ev| {
                futures::future::ready(Ok(match ev {
                    KubeWatchEvent::Added(o) | KubeWatchEvent::Modified(o) => {
                        Some(WorkflowEvent::Phase(workflow_phase(&o)))
                    }
                    KubeWatchEvent::Deleted(_) => Some(WorkflowEvent::Deleted),
                    KubeWatchEvent::Bookmark(_) | KubeWatchEvent::Error(_) => None,
                }))
            })
            .boxed())
    }
}
