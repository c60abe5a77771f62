//! Core types for workflows, nodes, outputs and artifacts.
//!
//! This module contains the fundamental data types used throughout nodestate:
//! - [`Workflow`] and [`WorkflowStatus`]: the aggregate this layer mutates
//! - [`NodeStatus`], [`NodeType`], [`NodePhase`]: per-step execution state
//! - [`Outputs`] and [`Parameter`]: typed step outputs
//! - [`Artifact`] and its location variants

mod artifact;
mod node;
mod outputs;
mod workflow;

pub use artifact::{
    Artifact, ArtifactLocation, BasicAuth, Header, HttpArtifact, InlineArtifact, S3Artifact,
    S3EncryptionOptions, SecretKeySelector, VolumeArtifact,
};
pub use node::{node_id, NodePhase, NodeStatus, NodeType, Nodes};
pub use outputs::{Outputs, Parameter, ResourcesDuration};
pub use workflow::{ObjectMeta, Workflow, WorkflowPhase, WorkflowStatus};
