//! Testing utilities for code built on the node-state layer.
//!
//! This module provides:
//! - Workflow and node fixtures
//! - A scripted HTTP server for exercising HTTP drivers and steps

mod fixtures;
mod http;

pub use fixtures::{dag_node, diamond_workflow, pod_node, TestWorkflow};
pub use http::{MockHttpServer, RecordedRequest};
