//! Workflow and node fixtures.

use crate::core::{NodePhase, NodeStatus, NodeType, ResourcesDuration, Workflow, WorkflowPhase};

/// A pod node with a phase and resource usage.
#[must_use]
pub fn pod_node(id: &str, phase: NodePhase, resources: &[(&str, i64)]) -> NodeStatus {
    let duration = resources
        .iter()
        .fold(ResourcesDuration::new(), |acc, (name, secs)| acc.with(*name, *secs));
    NodeStatus::new(id, NodeType::Pod)
        .with_name(id)
        .with_phase(phase)
        .with_resources_duration(duration)
}

/// A DAG node with children.
#[must_use]
pub fn dag_node(id: &str, phase: NodePhase, children: &[&str]) -> NodeStatus {
    children.iter().fold(
        NodeStatus::new(id, NodeType::Dag).with_name(id).with_phase(phase),
        |node, child| node.with_child(*child),
    )
}

/// A finished workflow whose DAG has a diamond:
/// `root -> {left, right} -> join`, plus a pod `solo` under `root`.
///
/// Pods carry cpu durations 1 (`left`), 2 (`right`), 4 (`join`) and 8 (`solo`).
#[must_use]
pub fn diamond_workflow() -> Workflow {
    TestWorkflow::new("argo", "diamond")
        .with_phase(WorkflowPhase::Succeeded)
        .with_node(dag_node("root", NodePhase::Succeeded, &["left", "right", "solo"]))
        .with_node(
            pod_node("left", NodePhase::Succeeded, &[("cpu", 1)]).with_child("join"),
        )
        .with_node(
            pod_node("right", NodePhase::Succeeded, &[("cpu", 2)]).with_child("join"),
        )
        .with_node(pod_node("join", NodePhase::Succeeded, &[("cpu", 4)]))
        .with_node(pod_node("solo", NodePhase::Succeeded, &[("cpu", 8), ("memory", 3)]))
        .build()
}

/// Builder for test workflows.
#[derive(Debug, Clone)]
pub struct TestWorkflow {
    workflow: Workflow,
}

impl TestWorkflow {
    /// Starts a workflow with a UID derived from its name.
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            workflow: Workflow::new(namespace, name, format!("uid-{name}")),
        }
    }

    /// Sets the UID.
    #[must_use]
    pub fn with_uid(mut self, uid: &str) -> Self {
        self.workflow.metadata.uid = uid.to_string();
        self
    }

    /// Sets the phase.
    #[must_use]
    pub fn with_phase(mut self, phase: WorkflowPhase) -> Self {
        self.workflow = self.workflow.with_phase(phase);
        self
    }

    /// Adds a node.
    #[must_use]
    pub fn with_node(mut self, node: NodeStatus) -> Self {
        self.workflow = self.workflow.with_node(node);
        self
    }

    /// Adds `count` succeeded pod nodes named `pod-0..`.
    #[must_use]
    pub fn with_pods(mut self, count: usize) -> Self {
        for i in 0..count {
            let id = format!("pod-{i}");
            self.workflow = self
                .workflow
                .with_node(pod_node(&id, NodePhase::Succeeded, &[("cpu", 1)]));
        }
        self
    }

    /// Returns the workflow.
    #[must_use]
    pub fn build(self) -> Workflow {
        self.workflow
    }
}
