//! Node status and its phase and type enums.

use super::{Outputs, ResourcesDuration};
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Mapping from node ID to node status.
pub type Nodes = BTreeMap<String, NodeStatus>;

/// The kind of step a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeType {
    /// A container step running in its own pod.
    #[default]
    Pod,
    /// A DAG template.
    #[serde(rename = "DAG")]
    Dag,
    /// A steps template.
    Steps,
    /// A retry wrapper around its attempts.
    Retry,
    /// A skipped step.
    Skipped,
    /// An HTTP step executed by the agent.
    #[serde(rename = "HTTP")]
    Http,
    /// A plugin step executed by the agent.
    Plugin,
}

impl NodeType {
    /// Returns true for steps executed outside a pod by the step executor.
    #[must_use]
    pub fn is_external(self) -> bool {
        matches!(self, Self::Http | Self::Plugin)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pod => write!(f, "Pod"),
            Self::Dag => write!(f, "DAG"),
            Self::Steps => write!(f, "Steps"),
            Self::Retry => write!(f, "Retry"),
            Self::Skipped => write!(f, "Skipped"),
            Self::Http => write!(f, "HTTP"),
            Self::Plugin => write!(f, "Plugin"),
        }
    }
}

/// The execution phase of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodePhase {
    /// Waiting to run.
    #[default]
    Pending,
    /// Running.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed with a step failure.
    Failed,
    /// Completed with an infrastructure error.
    Error,
    /// Not run.
    Skipped,
}

impl NodePhase {
    /// Returns true if the phase is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Error | Self::Skipped
        )
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Error => write!(f, "Error"),
            Self::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Execution state of one step within a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Stable node ID.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Fully qualified node name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Short name shown to users.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    /// Node type.
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    /// Current phase.
    #[serde(default)]
    pub phase: NodePhase,
    /// Human-readable reason for the current phase.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Child node IDs, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    /// Outputs, once produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    /// Resource usage in seconds.
    #[serde(default, skip_serializing_if = "ResourcesDuration::is_empty")]
    pub resources_duration: ResourcesDuration,
    /// When the node started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the node finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

impl NodeStatus {
    /// Creates a pending node.
    #[must_use]
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            ..Self::default()
        }
    }

    /// Sets the phase.
    #[must_use]
    pub fn with_phase(mut self, phase: NodePhase) -> Self {
        self.phase = phase;
        self
    }

    /// Sets the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Appends a child.
    #[must_use]
    pub fn with_child(mut self, child: impl Into<String>) -> Self {
        self.children.push(child.into());
        self
    }

    /// Sets the outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: Outputs) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Sets the resource usage.
    #[must_use]
    pub fn with_resources_duration(mut self, duration: ResourcesDuration) -> Self {
        self.resources_duration = duration;
        self
    }

    /// Returns true once the node reached a terminal phase.
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Returns true for pod-typed nodes.
    #[must_use]
    pub fn is_pod(&self) -> bool {
        self.node_type == NodeType::Pod
    }
}

/// Derives a stable node ID from the workflow UID and the node's position
/// in the template tree.
#[must_use]
pub fn node_id(workflow_uid: &str, position: &str) -> String {
    let digest = Sha256::digest(position.as_bytes());
    format!("{workflow_uid}-{}", &hex::encode(digest)[..10])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_terminal() {
        assert!(!NodePhase::Pending.is_terminal());
        assert!(!NodePhase::Running.is_terminal());
        assert!(NodePhase::Succeeded.is_terminal());
        assert!(NodePhase::Failed.is_terminal());
        assert!(NodePhase::Error.is_terminal());
        assert!(NodePhase::Skipped.is_terminal());
    }

    #[test]
    fn test_node_type_wire_names() {
        assert_eq!(serde_json::to_string(&NodeType::Dag).unwrap(), "\"DAG\"");
        assert_eq!(serde_json::to_string(&NodeType::Http).unwrap(), "\"HTTP\"");
        assert_eq!(NodeType::Plugin.to_string(), "Plugin");
        assert!(NodeType::Http.is_external());
        assert!(!NodeType::Pod.is_external());
    }

    #[test]
    fn test_minimal_node_deserializes() {
        let node: NodeStatus = serde_json::from_str(r#"{"phase":"Succeeded"}"#).unwrap();
        assert_eq!(node.phase, NodePhase::Succeeded);
        assert_eq!(node.node_type, NodeType::Pod);
        assert!(node.children.is_empty());
    }

    #[test]
    fn test_node_id_is_stable() {
        let a = node_id("u1", "main.step-a");
        let b = node_id("u1", "main.step-a");
        let c = node_id("u1", "main.step-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("u1-"));
        assert_eq!(a.len(), "u1-".len() + 10);
    }
}
