//! External step execution.
//!
//! HTTP and plugin steps run outside any pod. The reconcile loop calls
//! [`StepExecutor::execute`] on every pass; the executor queues each step at
//! most once per (namespace, workflow, node), runs it on a worker, and keeps
//! the [`Outcome`] until [`StepExecutor::reconcile_node`] applies it to the
//! node.

mod executor;
mod expression;
mod http;
mod outcome;
mod payload;
mod queue;
mod rpc;

pub use executor::{StepExecutor, StepState};
pub use expression::{value_to_string, ExpressionEvaluator, JsonPathEvaluator};
pub use http::HttpRunner;
pub use outcome::OutcomeStore;
pub use payload::{HttpMethod, HttpStep, Outcome, OutputParameter, RpcStep, StepKey, StepPayload, StepWorkItem};
pub use queue::WorkQueue;
pub use rpc::{RpcRunner, METHOD_NOT_FOUND};

use crate::errors::Result;
use async_trait::async_trait;

/// Executes one kind of step payload.
///
/// Errors are worker failures: transient ones are retried and the rest
/// become a failed outcome. Answers from the remote side are outcomes.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Runs `item` once.
    async fn run(&self, item: &StepWorkItem) -> Result<Outcome>;
}
