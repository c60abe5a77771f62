//! Runs plugin steps over JSON-RPC 2.0.

use super::expression::{value_to_string, ExpressionEvaluator, JsonPathEvaluator};
use super::{Outcome, RpcStep, StepPayload, StepRunner, StepWorkItem};
use crate::artifacts::status_error;
use crate::core::Outputs;
use crate::errors::{NodeStateError, Result};
use crate::sync::ConcurrentMap;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    #[serde(default)]
    message: String,
}

/// The node a plugin reports back.
#[derive(Debug, Default, Deserialize)]
struct PluginNode {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    outputs: Option<Outputs>,
}

#[derive(Debug, Default, Deserialize)]
struct PluginReply {
    #[serde(default)]
    node: Option<PluginNode>,
}

/// Calls plugin methods and turns their replies into outcomes.
///
/// A plugin that does not know the method (`-32601`, or an HTTP 404/501)
/// is remembered per (endpoint, method); later calls succeed with empty
/// outputs without a request.
pub struct RpcRunner {
    client: reqwest::Client,
    evaluator: Arc<dyn ExpressionEvaluator>,
    default_timeout: Duration,
    unsupported: ConcurrentMap<(String, String), ()>,
}

impl RpcRunner {
    /// Creates a runner using `client`.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            evaluator: Arc::new(JsonPathEvaluator::new()),
            default_timeout: DEFAULT_TIMEOUT,
            unsupported: ConcurrentMap::new(),
        }
    }

    /// Replaces the expression evaluator.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Sets the call deadline.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn mark_unsupported(&self, step: &RpcStep, key: (String, String)) -> Outcome {
        info!(endpoint = %step.endpoint, method = %step.method, "Plugin does not implement method, skipping from now on");
        self.unsupported.store(key, ());
        Outcome::Succeeded(Outputs::new())
    }

    /// Executes one plugin call.
    pub async fn execute(&self, step: &RpcStep) -> Result<Outcome> {
        let key = (step.endpoint.clone(), step.method.clone());
        if self.unsupported.contains(&key) {
            debug!(endpoint = %step.endpoint, method = %step.method, "Skipping unsupported plugin method");
            return Ok(Outcome::Succeeded(Outputs::new()));
        }

        let request = json!({
            "jsonrpc": "2.0",
            "id": Uuid::new_v4().to_string(),
            "method": step.method,
            "params": step.params,
        });
        let response = self
            .client
            .post(&step.endpoint)
            .timeout(self.default_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| NodeStateError::from(e).context(format!("call {} at {}", step.method, step.endpoint)))?;

        let status = response.status();
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::NOT_IMPLEMENTED) {
            return Ok(self.mark_unsupported(step, key));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
            return Err(status_error(status, &step.endpoint));
        }
        if !status.is_success() {
            return Ok(Outcome::failed(format!("received non-2xx response code: {}", status.as_u16())));
        }

        let text = response
            .text()
            .await
            .map_err(|e| NodeStateError::from(e).context(format!("read reply of {}", step.method)))?;
        let reply: RpcResponse = match serde_json::from_str(&text) {
            Ok(reply) => reply,
            Err(e) => return Ok(Outcome::failed(format!("invalid reply from plugin method {}: {e}", step.method))),
        };

        if let Some(error) = reply.error {
            if error.code == METHOD_NOT_FOUND {
                return Ok(self.mark_unsupported(step, key));
            }
            return Ok(Outcome::failed(format!(
                "plugin method {} failed with code {}: {}",
                step.method, error.code, error.message
            )));
        }

        let result = reply.result.unwrap_or(Value::Null);
        let node = serde_json::from_value::<PluginReply>(result.clone())
            .unwrap_or_default()
            .node
            .unwrap_or_default();
        if matches!(node.phase.as_deref(), Some("Failed" | "Error")) {
            let message = if node.message.is_empty() {
                format!("plugin method {} reported {}", step.method, node.phase.unwrap_or_default())
            } else {
                node.message
            };
            return Ok(Outcome::Failed(message));
        }

        let mut outputs = node.outputs.unwrap_or_default();
        for parameter in &step.output_parameters {
            match self.evaluator.eval(&parameter.expression, &result) {
                Ok(value) => outputs = outputs.with_parameter(&parameter.name, value_to_string(&value)),
                Err(e) => {
                    return Ok(Outcome::failed(format!(
                        "failed to evaluate output parameter '{}': {e}",
                        parameter.name
                    )))
                }
            }
        }
        Ok(Outcome::Succeeded(outputs))
    }
}

#[async_trait]
impl StepRunner for RpcRunner {
    async fn run(&self, item: &StepWorkItem) -> Result<Outcome> {
        match &item.payload {
            StepPayload::Plugin(step) => self.execute(step).await,
            StepPayload::Http(_) => Err(NodeStateError::validation(format!(
                "{} is an HTTP step, not a plugin step",
                item.key
            ))),
        }
    }
}

impl std::fmt::Debug for RpcRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRunner")
            .field("default_timeout", &self.default_timeout)
            .field("unsupported", &self.unsupported.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHttpServer;
    use crate::objectstore::TransientClassifier;
    use pretty_assertions::assert_eq;

    fn runner() -> RpcRunner {
        RpcRunner::new(reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_method_not_found_short_circuits() {
        let server = MockHttpServer::start(vec![(
            200,
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#.into(),
        )])
        .await
        .unwrap();
        let runner = runner();
        let step = RpcStep::new(server.url(), "template.execute");

        assert_eq!(runner.execute(&step).await.unwrap(), Outcome::Succeeded(Outputs::new()));
        assert_eq!(runner.execute(&step).await.unwrap(), Outcome::Succeeded(Outputs::new()));
        assert_eq!(server.calls(), 1);

        let sent: Value = serde_json::from_slice(&server.requests()[0].body).unwrap();
        assert_eq!(sent["jsonrpc"], "2.0");
        assert_eq!(sent["method"], "template.execute");
        assert!(sent["id"].as_str().is_some_and(|id| Uuid::parse_str(id).is_ok()));
    }

    #[tokio::test]
    async fn test_reply_outputs_and_parameters() {
        let server = MockHttpServer::start(vec![(
            200,
            r#"{"jsonrpc":"2.0","id":1,"result":{"node":{"phase":"Succeeded","outputs":{"parameters":[{"name":"a","value":"1"}]}},"extra":{"b":"two"}}}"#.into(),
        )])
        .await
        .unwrap();
        let step = RpcStep::new(server.url(), "template.execute")
            .with_params(json!({"workflow": "wf"}))
            .with_output_parameter("b", "$.extra.b");

        let Outcome::Succeeded(outputs) = runner().execute(&step).await.unwrap() else {
            panic!("expected success");
        };
        assert_eq!(outputs.parameter("a"), Some("1"));
        assert_eq!(outputs.parameter("b"), Some("two"));
    }

    #[tokio::test]
    async fn test_reported_failure_and_rpc_error() {
        let failed = MockHttpServer::start(vec![(
            200,
            r#"{"jsonrpc":"2.0","id":1,"result":{"node":{"phase":"Failed","message":"quota exceeded"}}}"#.into(),
        )])
        .await
        .unwrap();
        let step = RpcStep::new(failed.url(), "template.execute");
        assert_eq!(runner().execute(&step).await.unwrap(), Outcome::failed("quota exceeded"));

        let errored = MockHttpServer::start(vec![(
            200,
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"boom"}}"#.into(),
        )])
        .await
        .unwrap();
        let step = RpcStep::new(errored.url(), "template.execute");
        assert_eq!(
            runner().execute(&step).await.unwrap(),
            Outcome::failed("plugin method template.execute failed with code -32000: boom")
        );
    }

    #[tokio::test]
    async fn test_http_status_policy() {
        let unavailable = MockHttpServer::start(vec![(503, String::new())]).await.unwrap();
        let err = runner()
            .execute(&RpcStep::new(unavailable.url(), "m"))
            .await
            .unwrap_err();
        assert!(TransientClassifier::new().is_transient(&err));

        let missing = MockHttpServer::start(vec![(404, String::new())]).await.unwrap();
        let runner = runner();
        let step = RpcStep::new(missing.url(), "m");
        assert!(runner.execute(&step).await.unwrap().is_success());
        runner.execute(&step).await.unwrap();
        assert_eq!(missing.calls(), 1);
    }
}
