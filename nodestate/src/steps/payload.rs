//! Work items and outcomes of external steps.

use crate::core::{Header, NodeType, Outputs, Workflow};
use crate::errors::{NodeStateError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifies one external step: at most one item per key is queued or
/// running at a time.
///
/// The workflow UID is part of the key, so a workflow recreated under the
/// same name never sees outcomes of its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepKey {
    /// Workflow namespace.
    pub namespace: String,
    /// Workflow name.
    pub name: String,
    /// Workflow UID.
    pub workflow_uid: String,
    /// Node ID.
    pub node_id: String,
}

impl StepKey {
    /// Creates a key with an empty workflow UID.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            workflow_uid: String::new(),
            node_id: node_id.into(),
        }
    }

    /// The key of `node_id` in `workflow`.
    #[must_use]
    pub fn for_node(workflow: &Workflow, node_id: &str) -> Self {
        Self::new(workflow.namespace(), workflow.name(), node_id).with_workflow_uid(workflow.uid())
    }

    /// Sets the workflow UID.
    #[must_use]
    pub fn with_workflow_uid(mut self, uid: impl Into<String>) -> Self {
        self.workflow_uid = uid.into();
        self
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.node_id)
    }
}

/// HTTP methods an HTTP step may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET.
    #[default]
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// PATCH.
    Patch,
    /// DELETE.
    Delete,
}

impl HttpMethod {
    /// Parses a method name, ignoring case.
    pub fn parse(method: &str) -> Result<Self> {
        match method.to_ascii_uppercase().as_str() {
            "" | "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(NodeStateError::validation(format!("unsupported HTTP method '{other}'"))),
        }
    }

    pub(crate) fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Patch => write!(f, "PATCH"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// An output parameter computed from a step's response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputParameter {
    /// Parameter name.
    pub name: String,
    /// Expression evaluated against the response.
    pub expression: String,
}

impl OutputParameter {
    /// Creates an output parameter.
    #[must_use]
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
        }
    }
}

/// A single HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpStep {
    /// Request method.
    #[serde(default)]
    pub method: HttpMethod,
    /// Target URL.
    pub url: String,
    /// Request headers; values may come from secrets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,
    /// Request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request deadline in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Expression deciding success instead of the 2xx rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_condition: Option<String>,
    /// Output parameters evaluated against the response body.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_parameters: Vec<OutputParameter>,
}

impl HttpStep {
    /// Creates a step with `method` and `url`.
    #[must_use]
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            ..Self::default()
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets the request deadline.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Sets the success condition.
    #[must_use]
    pub fn with_success_condition(mut self, expression: impl Into<String>) -> Self {
        self.success_condition = Some(expression.into());
        self
    }

    /// Declares an output parameter.
    #[must_use]
    pub fn with_output_parameter(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.output_parameters.push(OutputParameter::new(name, expression));
        self
    }

    /// Request deadline, if the step sets one.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

/// A call to a named method of a JSON-RPC plugin.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcStep {
    /// Plugin endpoint URL.
    pub endpoint: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Output parameters evaluated against the call result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_parameters: Vec<OutputParameter>,
}

impl RpcStep {
    /// Creates a call of `method` at `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            params: serde_json::Value::Null,
            output_parameters: Vec::new(),
        }
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Declares an output parameter.
    #[must_use]
    pub fn with_output_parameter(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.output_parameters.push(OutputParameter::new(name, expression));
        self
    }
}

/// What an external step executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepPayload {
    /// An HTTP request.
    Http(HttpStep),
    /// A plugin RPC.
    Plugin(RpcStep),
}

impl StepPayload {
    /// Node type of steps carrying this payload.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Http(_) => NodeType::Http,
            Self::Plugin(_) => NodeType::Plugin,
        }
    }
}

/// A queued step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepWorkItem {
    /// Deduplication key.
    pub key: StepKey,
    /// What to execute.
    pub payload: StepPayload,
}

/// The recorded result of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The step succeeded with these outputs.
    Succeeded(Outputs),
    /// The step failed with this message.
    Failed(String),
}

impl Outcome {
    /// Creates a failure outcome.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// True for success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!(HttpMethod::parse("post").unwrap(), HttpMethod::Post);
        assert_eq!(HttpMethod::parse("").unwrap(), HttpMethod::Get);
        assert!(HttpMethod::parse("TRACE").is_err());
        assert_eq!(HttpMethod::Patch.to_string(), "PATCH");
    }

    #[test]
    fn test_payload_wire_shape() {
        let payload = StepPayload::Http(
            HttpStep::new(HttpMethod::Post, "http://svc/run")
                .with_timeout_seconds(5)
                .with_output_parameter("id", "$.id"),
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "http");
        assert_eq!(json["method"], "POST");
        assert_eq!(json["timeoutSeconds"], 5);
        let back: StepPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.node_type(), NodeType::Http);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(StepKey::new("argo", "wf", "n1").to_string(), "argo/wf/n1");
    }

    #[test]
    fn test_key_distinguishes_workflow_uid() {
        let old = StepKey::new("argo", "wf", "n1").with_workflow_uid("uid-1");
        let recreated = StepKey::new("argo", "wf", "n1").with_workflow_uid("uid-2");
        assert_ne!(old, recreated);
        assert_eq!(old.to_string(), recreated.to_string());
    }
}
