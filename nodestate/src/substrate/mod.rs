//! The orchestration substrate this layer talks to.
//!
//! Every external system is reached through one of the traits here:
//! - [`KeyValueStore`]: labelled objects with optimistic concurrency
//! - [`PodApi`]: pod discovery and log streams
//! - [`SecretStore`]: credential lookup for artifact drivers
//! - [`NodeStatusRepository`]: the offloaded node status table
//! - [`WorkflowWatcher`]: phase changes of a single workflow
//!
//! [`memory`] provides in-process implementations used by tests and local
//! runs. Kubernetes-backed implementations live in `kube` behind the `kube`
//! feature.

mod labels;
pub mod memory;

#[cfg(feature = "kube")]
pub mod kube;

pub use labels::LabelSelector;

use crate::core::{Nodes, ObjectMeta, WorkflowPhase};
use crate::errors::{NodeStateError, Result};
use crate::utils::Timestamp;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

/// A stream of byte chunks.
pub type ByteStream = Pin<Box<dyn futures::Stream<Item = Result<Bytes>> + Send>>;

/// A stream of watch events.
pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>>>;

/// Remote error code of a watch whose resume version is no longer retained.
pub const EXPIRED: &str = "Expired";

/// True when `err` says a watch must relist because its resource version
/// expired.
#[must_use]
pub fn is_expired(err: &NodeStateError) -> bool {
    err.as_remote().is_some_and(|remote| remote.code == EXPIRED)
}

/// A change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    /// The object was created.
    Added(T),
    /// The object was updated.
    Modified(T),
    /// The object was deleted.
    Deleted(T),
}

impl<T> WatchEvent<T> {
    /// The object carried by the event.
    pub fn object(&self) -> &T {
        match self {
            Self::Added(o) | Self::Modified(o) | Self::Deleted(o) => o,
        }
    }

    /// Consumes the event and returns its object.
    pub fn into_object(self) -> T {
        match self {
            Self::Added(o) | Self::Modified(o) | Self::Deleted(o) => o,
        }
    }
}

/// A labelled string map stored by the substrate (a config map).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KvObject {
    /// Metadata, including labels and resource version.
    pub metadata: ObjectMeta,
    /// String data.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl KvObject {
    /// Creates an empty object.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..ObjectMeta::default()
            },
            data: BTreeMap::new(),
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Adds a data entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Returns the value of a label.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(String::as_str)
    }

    /// `namespace/name`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }
}

/// The result of a list call.
#[derive(Debug, Clone, Default)]
pub struct ObjectList<T> {
    /// Matching objects.
    pub items: Vec<T>,
    /// Collection version to resume a watch from.
    pub resource_version: String,
}

/// Labelled objects with optimistic concurrency.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetches an object; `None` if absent.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<KvObject>>;

    /// Creates an object. Fails with a conflict if it already exists.
    async fn create(&self, object: KvObject) -> Result<KvObject>;

    /// Replaces an object. Fails with a conflict if the resource version is stale.
    async fn update(&self, object: KvObject) -> Result<KvObject>;

    /// Deletes an object, optionally only at a given resource version.
    async fn delete(&self, namespace: &str, name: &str, resource_version: Option<&str>) -> Result<()>;

    /// Lists objects matching `selector`, in one namespace or all of them.
    async fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<ObjectList<KvObject>>;

    /// Watches objects matching `selector`, starting after `since` when given.
    async fn watch(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
        since: Option<&str>,
    ) -> Result<WatchStream<KvObject>>;
}

/// Lifecycle phase of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PodPhase {
    /// Not yet scheduled or pulling images.
    #[default]
    Pending,
    /// At least one container running.
    Running,
    /// All containers exited zero.
    Succeeded,
    /// A container exited non-zero.
    Failed,
    /// State could not be obtained.
    Unknown,
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// The parts of a pod the log multiplexer needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PodInfo {
    /// Pod name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Phase.
    pub phase: PodPhase,
    /// When the pod started.
    pub start_time: Option<Timestamp>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Version of the pod object; a watch resumes after it.
    pub resource_version: Option<String>,
}

impl PodInfo {
    /// Creates a pod record.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, phase: PodPhase) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            phase,
            ..Self::default()
        }
    }

    /// Sets the start time.
    #[must_use]
    pub fn with_start_time(mut self, start: Timestamp) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Options for a pod log request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodLogOptions {
    /// Container to read; the main container when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Keep the stream open for new lines.
    #[serde(default)]
    pub follow: bool,
    /// Only the last N lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail_lines: Option<i64>,
    /// Only lines newer than this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_seconds: Option<i64>,
    /// Prefix each line with an RFC 3339 timestamp.
    #[serde(default)]
    pub timestamps: bool,
    /// Read the previous container instance.
    #[serde(default)]
    pub previous: bool,
}

/// Pod discovery and logs.
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Lists pods matching `selector`.
    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<ObjectList<PodInfo>>;

    /// Watches pods matching `selector`, starting after `since` when given.
    async fn watch(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        since: Option<&str>,
    ) -> Result<WatchStream<PodInfo>>;

    /// Opens a log stream for one pod.
    async fn get_logs(&self, namespace: &str, name: &str, options: &PodLogOptions) -> Result<ByteStream>;
}

/// Reads credentials by secret name and key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the raw bytes stored under `key` in secret `name`.
    async fn read(&self, name: &str, key: &str) -> Result<Vec<u8>>;
}

/// External table holding offloaded node status.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeStatusRepository: Send + Sync {
    /// Whether offloading is configured at all.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Fetches the nodes stored for (workflow UID, version).
    async fn get(&self, workflow_uid: &str, version: &str) -> Result<Nodes>;

    /// Stores nodes and returns the new version token.
    async fn save(&self, workflow_uid: &str, namespace: &str, nodes: &Nodes) -> Result<String>;
}

/// A change to one workflow, as seen by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEvent {
    /// The workflow now has this phase.
    Phase(WorkflowPhase),
    /// The workflow was deleted.
    Deleted,
}

/// Watches a single workflow.
#[async_trait]
pub trait WorkflowWatcher: Send + Sync {
    /// Streams phase changes for `namespace/name`.
    async fn watch_phase(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, Result<WorkflowEvent>>>;
}
