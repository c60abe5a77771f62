//! Resource duration rollup over the node graph.

use crate::core::{Nodes, ResourcesDuration, WorkflowStatus};
use crate::errors::{NodeStateError, Result};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Orders node IDs so every node precedes its children.
///
/// Children that are not in `nodes` are ignored. A cycle is a validation
/// error.
pub fn topological_order(nodes: &Nodes) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = nodes.keys().map(|id| (id.as_str(), 0)).collect();
    for node in nodes.values() {
        for child in &node.children {
            if let Some(degree) = in_degree.get_mut(child.as_str()) {
                *degree += 1;
            }
        }
    }

    let mut ready: VecDeque<&str> = nodes
        .keys()
        .map(String::as_str)
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(id) = ready.pop_front() {
        order.push(id.to_string());
        let Some(node) = nodes.get(id) else { continue };
        for child in &node.children {
            if let Some(degree) = in_degree.get_mut(child.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(child.as_str());
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(id, _)| *id)
            .collect();
        return Err(NodeStateError::validation(format!(
            "node children form a cycle through {} node(s), e.g. '{}'",
            stuck.len(),
            stuck.iter().min().copied().unwrap_or_default()
        )));
    }
    Ok(order)
}

/// Recomputes `status.resourcesDuration` and the durations of fulfilled
/// non-pod nodes.
///
/// Pods contribute their own usage to the workflow total. Each fulfilled
/// non-pod node receives the sum over its distinct pod descendants, so a pod
/// reachable along several paths is counted once. On error the status is left
/// untouched.
pub fn rollup_resources_duration(status: &mut WorkflowStatus) -> Result<()> {
    let order = topological_order(&status.nodes)?;

    // Pod descendants per node, built children-first.
    let mut descendants: HashMap<&str, BTreeSet<&str>> = HashMap::with_capacity(order.len());
    for id in order.iter().rev() {
        let Some(node) = status.nodes.get(id) else { continue };
        let mut pods = BTreeSet::new();
        for child in &node.children {
            let Some(child_node) = status.nodes.get(child) else { continue };
            if child_node.is_pod() {
                pods.insert(child.as_str());
            }
            if let Some(below) = descendants.get(child.as_str()) {
                pods.extend(below.iter().copied());
            }
        }
        descendants.insert(id.as_str(), pods);
    }

    let mut total = ResourcesDuration::new();
    let mut rolled: Vec<(String, ResourcesDuration)> = Vec::new();
    for id in &order {
        let Some(node) = status.nodes.get(id) else { continue };
        if node.is_pod() {
            total.add(&node.resources_duration);
        } else if node.is_fulfilled() {
            let mut sum = ResourcesDuration::new();
            for pod in descendants.get(id.as_str()).into_iter().flatten() {
                if let Some(pod_node) = status.nodes.get(*pod) {
                    sum.add(&pod_node.resources_duration);
                }
            }
            rolled.push((id.clone(), sum));
        }
    }

    for (id, sum) in rolled {
        if let Some(node) = status.nodes.get_mut(&id) {
            node.resources_duration = sum;
        }
    }
    status.resources_duration = total;
    Ok(())
}
