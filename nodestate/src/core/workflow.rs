//! The workflow aggregate.

use super::{NodeStatus, Nodes, ResourcesDuration};
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The phase of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkflowPhase {
    /// Accepted but not started.
    #[default]
    Pending,
    /// Running.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed with a failed step.
    Failed,
    /// Completed with an infrastructure error.
    Error,
}

impl WorkflowPhase {
    /// Returns true if the phase is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Error)
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Object metadata shared by substrate objects.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Immutable UID.
    #[serde(default)]
    pub uid: String,
    /// Optimistic-concurrency token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Status of a workflow. This layer only ever mutates the status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    /// Overall phase.
    #[serde(default)]
    pub phase: WorkflowPhase,
    /// Inline node status, keyed by node ID.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: Nodes,
    /// `base64(gzip(json(nodes)))` when compressed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compressed_nodes: String,
    /// Version token of the offloaded copy of `nodes`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub offload_node_status_version: String,
    /// Aggregate resource usage of pod nodes.
    #[serde(default, skip_serializing_if = "ResourcesDuration::is_empty")]
    pub resources_duration: ResourcesDuration,
    /// Human-readable status message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// Finish time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

/// A workflow: metadata, an opaque user spec, and status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Workflow {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// User-authored spec, never modified here.
    #[serde(default)]
    pub spec: serde_json::Value,
    /// Status.
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Workflow {
    /// Creates an empty workflow.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                uid: uid.into(),
                ..ObjectMeta::default()
            },
            ..Self::default()
        }
    }

    /// Adds a node, keyed by its ID.
    #[must_use]
    pub fn with_node(mut self, node: NodeStatus) -> Self {
        self.status.nodes.insert(node.id.clone(), node);
        self
    }

    /// Sets the phase.
    #[must_use]
    pub fn with_phase(mut self, phase: WorkflowPhase) -> Self {
        self.status.phase = phase;
        self
    }

    /// Workflow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Workflow namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Workflow UID.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    /// `namespace/name`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    /// Looks up a node by ID.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&NodeStatus> {
        self.status.nodes.get(id)
    }

    /// Looks up a node by ID for mutation.
    pub fn node_mut(&mut self, id: &str) -> Option<&mut NodeStatus> {
        self.status.nodes.get_mut(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NodePhase, NodeType};

    #[test]
    fn test_workflow_phase_terminal() {
        assert!(!WorkflowPhase::Pending.is_terminal());
        assert!(!WorkflowPhase::Running.is_terminal());
        assert!(WorkflowPhase::Succeeded.is_terminal());
        assert!(WorkflowPhase::Failed.is_terminal());
        assert!(WorkflowPhase::Error.is_terminal());
    }

    #[test]
    fn test_workflow_nodes_keyed_by_id() {
        let wf = Workflow::new("argo", "wf-1", "u1")
            .with_node(NodeStatus::new("n1", NodeType::Pod).with_phase(NodePhase::Running));
        assert_eq!(wf.key(), "argo/wf-1");
        assert_eq!(wf.node("n1").map(|n| n.phase), Some(NodePhase::Running));
        assert!(wf.node("n2").is_none());
    }

    #[test]
    fn test_status_omits_empty_representations() {
        let wf = Workflow::new("argo", "wf-1", "u1");
        let json = serde_json::to_value(&wf.status).unwrap();
        assert!(json.get("nodes").is_none());
        assert!(json.get("compressedNodes").is_none());
        assert!(json.get("offloadNodeStatusVersion").is_none());
    }
}
