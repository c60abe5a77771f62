//! Node status hydration.
//!
//! A workflow carries its node status in one of three forms:
//! - inline: `status.nodes`
//! - compressed: `status.compressedNodes`, see [`compress_nodes`]
//! - offloaded: `status.offloadNodeStatusVersion`, with the nodes held by a
//!   [`NodeStatusRepository`]
//!
//! [`Hydrator::hydrate`] brings a workflow to the inline form before the
//! reconcile loop inspects it, and [`Hydrator::dehydrate`] packs it again
//! before it is persisted.

mod compress;
mod rollup;

pub use compress::{compress_nodes, decompress_nodes};
pub use rollup::{rollup_resources_duration, topological_order};

use crate::config::HydratorConfig;
use crate::core::{Nodes, Workflow};
use crate::errors::{NodeStateError, Result};
use crate::objectstore::TransientClassifier;
use crate::observability::OperationTimer;
use crate::retry::with_retry;
use crate::substrate::NodeStatusRepository;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Moves workflow node status between its inline, compressed and offloaded
/// forms.
///
/// Calls for one workflow must be serialized by the caller; distinct
/// workflows may be processed concurrently.
pub struct Hydrator {
    repository: Arc<dyn NodeStatusRepository>,
    config: HydratorConfig,
    classifier: TransientClassifier,
}

impl Hydrator {
    /// Creates a hydrator over the offload repository.
    #[must_use]
    pub fn new(repository: Arc<dyn NodeStatusRepository>, config: HydratorConfig) -> Self {
        Self {
            repository,
            config,
            classifier: TransientClassifier::default(),
        }
    }

    /// Sets the classifier deciding which repository errors are retried.
    #[must_use]
    pub fn with_classifier(mut self, classifier: TransientClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &HydratorConfig {
        &self.config
    }

    /// True when the nodes are inline.
    #[must_use]
    pub fn is_hydrated(workflow: &Workflow) -> bool {
        workflow.status.compressed_nodes.is_empty()
            && workflow.status.offload_node_status_version.is_empty()
    }

    /// Brings the nodes inline.
    ///
    /// The workflow is only modified once the nodes were obtained, so a
    /// failure leaves it exactly as it was.
    pub async fn hydrate(&self, workflow: &mut Workflow) -> Result<()> {
        if !workflow.status.compressed_nodes.is_empty() {
            let nodes = decompress_nodes(&workflow.status.compressed_nodes)
                .map_err(|e| e.context(format!("decompress nodes of {}", workflow.key())))?;
            debug!(workflow = %workflow.key(), nodes = nodes.len(), "Decompressed node status");
            self.hydrate_with_nodes(workflow, nodes);
            return Ok(());
        }

        if !workflow.status.offload_node_status_version.is_empty() {
            let timer = OperationTimer::start("hydrate");
            let uid = workflow.uid().to_string();
            let version = workflow.status.offload_node_status_version.clone();
            let nodes = with_retry(
                &self.config.retry,
                "get offloaded nodes",
                |e| self.classifier.is_transient(e),
                || self.repository.get(&uid, &version),
            )
            .await
            .map_err(|e| {
                warn!(workflow = %workflow.key(), version = %version, error = %e, "Failed to hydrate node status");
                e.context(format!("get offloaded nodes {uid}/{version}"))
            })?;
            debug!(
                workflow = %workflow.key(),
                version = %version,
                nodes = nodes.len(),
                duration_ms = timer.elapsed_ms(),
                "Fetched offloaded node status"
            );
            self.hydrate_with_nodes(workflow, nodes);
        }
        Ok(())
    }

    /// Replaces the nodes and clears the other representations.
    pub fn hydrate_with_nodes(&self, workflow: &mut Workflow, nodes: Nodes) {
        workflow.status.nodes = nodes;
        workflow.status.compressed_nodes.clear();
        workflow.status.offload_node_status_version.clear();
    }

    /// Packs the nodes for persistence.
    ///
    /// Compressed nodes stay on the workflow when their encoded length is
    /// within `max_inlined_bytes`; otherwise, or when `always_offload` is set,
    /// they go to the repository.
    pub async fn dehydrate(&self, workflow: &mut Workflow) -> Result<()> {
        if !Self::is_hydrated(workflow) || workflow.status.nodes.is_empty() {
            return Ok(());
        }

        if !self.config.always_offload {
            let compressed = compress_nodes(&workflow.status.nodes)?;
            if compressed.len() <= self.config.max_inlined_bytes {
                debug!(
                    workflow = %workflow.key(),
                    bytes = compressed.len(),
                    "Compressed node status"
                );
                workflow.status.compressed_nodes = compressed;
                workflow.status.nodes.clear();
                return Ok(());
            }
            if !self.repository.is_enabled() {
                return Err(NodeStateError::permanent(format!(
                    "workflow {} node status is {} bytes compressed, longer than the maximum allowed size {}",
                    workflow.key(),
                    compressed.len(),
                    self.config.max_inlined_bytes
                )));
            }
        } else if !self.repository.is_enabled() {
            return Err(NodeStateError::permanent(format!(
                "workflow {} must be offloaded but node status offloading is not enabled",
                workflow.key()
            )));
        }

        let timer = OperationTimer::start("dehydrate");
        let uid = workflow.uid().to_string();
        let namespace = workflow.namespace().to_string();
        let nodes = &workflow.status.nodes;
        let version = with_retry(
            &self.config.retry,
            "save offloaded nodes",
            |e| self.classifier.is_transient(e),
            || self.repository.save(&uid, &namespace, nodes),
        )
        .await
        .map_err(|e| e.context(format!("offload nodes of {}", workflow.key())))?;

        info!(
            workflow = %workflow.key(),
            version = %version,
            nodes = workflow.status.nodes.len(),
            duration_ms = timer.elapsed_ms(),
            "Offloaded node status"
        );
        workflow.status.nodes.clear();
        workflow.status.compressed_nodes.clear();
        workflow.status.offload_node_status_version = version;
        Ok(())
    }

    /// Recomputes resource durations on a hydrated workflow.
    pub fn rollup(&self, workflow: &mut Workflow) -> Result<()> {
        if !Self::is_hydrated(workflow) {
            return Err(NodeStateError::validation(format!(
                "workflow {} must be hydrated before rollup",
                workflow.key()
            )));
        }
        rollup_resources_duration(&mut workflow.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NodePhase, NodeStatus, NodeType};
    use crate::errors::ErrorKind;
    use crate::retry::RetryPolicy;
    use crate::substrate::memory::InMemoryNodeStatusRepository;
    use crate::substrate::MockNodeStatusRepository;
    use crate::testing::{diamond_workflow, pod_node, TestWorkflow};
    use pretty_assertions::assert_eq;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay_ms(1)
            .with_max_delay_ms(2)
            .with_jitter(0.0)
    }

    fn hydrator(repo: Arc<dyn NodeStatusRepository>, config: HydratorConfig) -> Hydrator {
        Hydrator::new(repo, config.with_retry(fast_retry()))
    }

    fn one_node_workflow() -> Workflow {
        TestWorkflow::new("argo", "small")
            .with_node(pod_node("n1", NodePhase::Succeeded, &[("cpu", 1)]))
            .build()
    }

    #[tokio::test]
    async fn test_compressed_round_trip() {
        let repo = Arc::new(InMemoryNodeStatusRepository::new());
        let h = hydrator(repo.clone(), HydratorConfig::new().with_max_inlined_bytes(4096));
        let original = one_node_workflow();
        let mut wf = original.clone();

        h.dehydrate(&mut wf).await.unwrap();
        assert!(wf.status.nodes.is_empty());
        assert!(!wf.status.compressed_nodes.is_empty());
        assert!(wf.status.offload_node_status_version.is_empty());
        assert!(!Hydrator::is_hydrated(&wf));
        assert_eq!(repo.save_count(), 0);

        h.hydrate(&mut wf).await.unwrap();
        assert!(Hydrator::is_hydrated(&wf));
        assert_eq!(wf, original);
    }

    #[tokio::test]
    async fn test_small_ceiling_offloads() {
        let repo = Arc::new(InMemoryNodeStatusRepository::new());
        let h = hydrator(repo.clone(), HydratorConfig::new().with_max_inlined_bytes(16));
        let mut wf = one_node_workflow();

        h.dehydrate(&mut wf).await.unwrap();
        assert!(wf.status.compressed_nodes.is_empty());
        assert_eq!(wf.status.offload_node_status_version, "v1");
        assert_eq!(repo.save_count(), 1);
    }

    #[tokio::test]
    async fn test_ceiling_measures_encoded_length() {
        let wf = one_node_workflow();
        let encoded = compress_nodes(&wf.status.nodes).unwrap().len();

        let repo = Arc::new(InMemoryNodeStatusRepository::new());
        let mut exact = wf.clone();
        hydrator(repo.clone(), HydratorConfig::new().with_max_inlined_bytes(encoded))
            .dehydrate(&mut exact)
            .await
            .unwrap();
        assert_eq!(exact.status.compressed_nodes.len(), encoded);
        assert_eq!(repo.save_count(), 0);

        let mut over = wf;
        hydrator(repo.clone(), HydratorConfig::new().with_max_inlined_bytes(encoded - 1))
            .dehydrate(&mut over)
            .await
            .unwrap();
        assert!(over.status.compressed_nodes.is_empty());
        assert_eq!(repo.save_count(), 1);
    }

    #[tokio::test]
    async fn test_always_offload_round_trip() {
        let repo = Arc::new(InMemoryNodeStatusRepository::starting_at(7));
        let h = hydrator(repo.clone(), HydratorConfig::new().with_always_offload(true));
        let original = diamond_workflow();
        let mut wf = original.clone();

        h.dehydrate(&mut wf).await.unwrap();
        assert_eq!(wf.status.offload_node_status_version, "v7");
        assert!(wf.status.nodes.is_empty());
        assert!(wf.status.compressed_nodes.is_empty());
        assert_eq!(
            repo.row_info("uid-diamond", "v7").map(|(ns, _)| ns),
            Some("argo".to_string())
        );

        h.hydrate(&mut wf).await.unwrap();
        assert_eq!(wf, original);
    }

    #[tokio::test]
    async fn test_dehydrate_is_idempotent() {
        let repo = Arc::new(InMemoryNodeStatusRepository::new());
        let h = hydrator(repo.clone(), HydratorConfig::new().with_always_offload(true));
        let mut wf = one_node_workflow();

        h.dehydrate(&mut wf).await.unwrap();
        let packed = wf.clone();
        h.dehydrate(&mut wf).await.unwrap();
        assert_eq!(wf, packed);
        assert_eq!(repo.save_count(), 1);
    }

    #[tokio::test]
    async fn test_too_large_without_offload_fails() {
        let repo = Arc::new(InMemoryNodeStatusRepository::disabled());
        let h = hydrator(repo, HydratorConfig::new().with_max_inlined_bytes(0));
        let original = one_node_workflow();
        let mut wf = original.clone();

        let err = h.dehydrate(&mut wf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.to_string().contains("maximum allowed size 0"));
        assert_eq!(wf, original);
    }

    #[tokio::test]
    async fn test_hydrate_retries_transient_reads() {
        let repo = Arc::new(InMemoryNodeStatusRepository::new());
        let h = hydrator(repo.clone(), HydratorConfig::new().with_always_offload(true));
        let original = one_node_workflow();
        let mut wf = original.clone();
        h.dehydrate(&mut wf).await.unwrap();

        repo.fail_next_gets(2);
        h.hydrate(&mut wf).await.unwrap();
        assert_eq!(repo.get_count(), 3);
        assert_eq!(wf, original);
    }

    #[tokio::test]
    async fn test_failed_hydrate_leaves_workflow() {
        let repo = Arc::new(InMemoryNodeStatusRepository::new());
        let h = hydrator(repo.clone(), HydratorConfig::new().with_always_offload(true));
        let mut wf = one_node_workflow();
        h.dehydrate(&mut wf).await.unwrap();
        let packed = wf.clone();

        repo.fail_next_gets(10);
        let err = h.hydrate(&mut wf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(repo.get_count(), 3);
        assert_eq!(wf, packed);
    }

    #[tokio::test]
    async fn test_missing_offload_row_not_retried() {
        let repo = Arc::new(InMemoryNodeStatusRepository::new());
        let h = hydrator(repo.clone(), HydratorConfig::new());
        let mut wf = one_node_workflow();
        wf.status.nodes.clear();
        wf.status.offload_node_status_version = "v42".into();

        assert!(h.hydrate(&mut wf).await.unwrap_err().is_not_found());
        assert_eq!(repo.get_count(), 1);
    }

    #[tokio::test]
    async fn test_offload_passes_uid_and_namespace() {
        let mut repo = MockNodeStatusRepository::new();
        repo.expect_is_enabled().return_const(true);
        repo.expect_save()
            .withf(|uid, namespace, nodes| {
                uid.to_string() == "uid-small" && namespace.to_string() == "argo" && nodes.len() == 1
            })
            .times(1)
            .returning(|_, _, _| Ok("v3".to_string()));
        let h = hydrator(Arc::new(repo), HydratorConfig::new().with_always_offload(true));

        let mut wf = one_node_workflow();
        h.dehydrate(&mut wf).await.unwrap();
        assert_eq!(wf.status.offload_node_status_version, "v3");
    }

    #[tokio::test]
    async fn test_hydrate_with_nodes_clears_other_forms() {
        let h = hydrator(Arc::new(InMemoryNodeStatusRepository::new()), HydratorConfig::new());
        let mut wf = one_node_workflow();
        wf.status.offload_node_status_version = "v9".into();

        let mut nodes = Nodes::new();
        nodes.insert("x".into(), NodeStatus::new("x", NodeType::Dag));
        h.hydrate_with_nodes(&mut wf, nodes);
        assert!(Hydrator::is_hydrated(&wf));
        assert_eq!(wf.status.nodes.keys().collect::<Vec<_>>(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_rollup_requires_hydrated() {
        let h = hydrator(Arc::new(InMemoryNodeStatusRepository::new()), HydratorConfig::new());
        let mut wf = diamond_workflow();
        h.rollup(&mut wf).unwrap();
        assert_eq!(wf.status.resources_duration.get("cpu"), Some(15));

        wf.status.compressed_nodes = "x".into();
        assert_eq!(h.rollup(&mut wf).unwrap_err().kind(), ErrorKind::Validation);
    }
}
