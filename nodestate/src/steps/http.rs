//! Runs HTTP steps.

use super::expression::{value_to_string, ExpressionEvaluator, JsonPathEvaluator};
use super::{HttpMethod, HttpStep, Outcome, StepPayload, StepRunner, StepWorkItem};
use crate::core::Outputs;
use crate::errors::{NodeStateError, Result};
use crate::substrate::SecretStore;
use crate::sync::ConcurrentMap;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Sends one request per step and turns the response into an [`Outcome`].
///
/// Transport failures are returned as errors so the caller can retry them;
/// anything the endpoint answered becomes an outcome. A 501 answer marks the
/// (method, URL) pair unsupported and later identical calls succeed without
/// a request.
pub struct HttpRunner {
    client: reqwest::Client,
    secrets: Arc<dyn SecretStore>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    default_timeout: Duration,
    unsupported: ConcurrentMap<(HttpMethod, String), ()>,
}

impl HttpRunner {
    /// Creates a runner resolving header secrets through `secrets`.
    #[must_use]
    pub fn new(client: reqwest::Client, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            client,
            secrets,
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

    /// Sets the deadline for steps without their own.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// True once `method` on `url` answered 501.
    #[must_use]
    pub fn is_unsupported(&self, method: HttpMethod, url: &str) -> bool {
        self.unsupported.contains(&(method, url.to_string()))
    }

    async fn resolve_headers(&self, step: &HttpStep) -> Result<Vec<(String, String, bool)>> {
        let mut resolved = Vec::with_capacity(step.headers.len());
        for header in &step.headers {
            match &header.value_from {
                Some(selector) => {
                    let raw = self.secrets.read(&selector.name, &selector.key).await.map_err(|e| {
                        e.context(format!("header '{}' from secret {}/{}", header.name, selector.name, selector.key))
                    })?;
                    let value = String::from_utf8(raw).map_err(|_| {
                        NodeStateError::validation(format!("secret value for header '{}' is not UTF-8", header.name))
                    })?;
                    resolved.push((header.name.clone(), value, true));
                }
                None => resolved.push((header.name.clone(), header.value.clone(), false)),
            }
        }
        Ok(resolved)
    }

    /// Executes one HTTP step.
    pub async fn execute(&self, step: &HttpStep) -> Result<Outcome> {
        let unsupported_key = (step.method, step.url.clone());
        if self.unsupported.contains(&unsupported_key) {
            debug!(method = %step.method, url = %step.url, "Skipping unsupported HTTP step");
            return Ok(Outcome::Succeeded(Outputs::new()));
        }

        let headers = self.resolve_headers(step).await?;
        let mut request = self
            .client
            .request(step.method.as_reqwest(), &step.url)
            .timeout(step.timeout().unwrap_or(self.default_timeout));
        for (name, value, _) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &step.body {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| NodeStateError::from(e).context(format!("{} {}", step.method, step.url)))?;
        let status = response.status().as_u16();
        let response_headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), Value::String(v.to_str().ok()?.to_string()))))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| NodeStateError::from(e).context(format!("read response of {}", step.url)))?;

        if status == 501 {
            info!(method = %step.method, url = %step.url, "Endpoint does not implement method, skipping from now on");
            self.unsupported.store(unsupported_key, ());
            return Ok(Outcome::Succeeded(Outputs::new()));
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| Value::String(text.clone()));

        match &step.success_condition {
            Some(condition) => {
                // Secret header values stay out of the environment.
                let request_headers: Map<String, Value> = headers
                    .iter()
                    .filter(|(_, _, secret)| !secret)
                    .map(|(name, value, _)| (name.clone(), Value::String(value.clone())))
                    .collect();
                let env = json!({
                    "request": {
                        "method": step.method.to_string(),
                        "url": step.url,
                        "body": step.body.clone().unwrap_or_default(),
                        "headers": request_headers,
                    },
                    "response": {
                        "statusCode": status,
                        "body": body,
                        "headers": response_headers,
                    },
                });
                match self.evaluator.eval_bool(condition, &env) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Ok(Outcome::failed(format!("successCondition '{condition}' evaluated false")))
                    }
                    Err(e) => {
                        return Ok(Outcome::failed(format!(
                            "failed to evaluate successCondition '{condition}': {e}"
                        )))
                    }
                }
            }
            None if !(200..300).contains(&status) => {
                return Ok(Outcome::failed(format!("received non-2xx response code: {status}")));
            }
            None => {}
        }

        let mut outputs = Outputs::new().with_result(text);
        for parameter in &step.output_parameters {
            match self.evaluator.eval(&parameter.expression, &body) {
                Ok(value) => outputs = outputs.with_parameter(&parameter.name, value_to_string(&value)),
                Err(e) => {
                    return Ok(Outcome::failed(format!(
                        "failed to evaluate output parameter '{}': {e}",
                        parameter.name
                    )))
                }
            }
        }
        debug!(method = %step.method, url = %step.url, status = status, "HTTP step succeeded");
        Ok(Outcome::Succeeded(outputs))
    }
}

#[async_trait]
impl StepRunner for HttpRunner {
    async fn run(&self, item: &StepWorkItem) -> Result<Outcome> {
        match &item.payload {
            StepPayload::Http(step) => self.execute(step).await,
            StepPayload::Plugin(_) => Err(NodeStateError::validation(format!(
                "{} is a plugin step, not an HTTP step",
                item.key
            ))),
        }
    }
}

impl std::fmt::Debug for HttpRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRunner")
            .field("default_timeout", &self.default_timeout)
            .field("unsupported", &self.unsupported.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Header, SecretKeySelector};
    use crate::errors::ErrorKind;
    use crate::substrate::memory::InMemorySecretStore;
    use crate::testing::MockHttpServer;
    use pretty_assertions::assert_eq;

    fn runner() -> HttpRunner {
        HttpRunner::new(reqwest::Client::new(), Arc::new(InMemorySecretStore::new()))
    }

    #[tokio::test]
    async fn test_output_parameters_and_result() {
        let server = MockHttpServer::start(vec![(200, r#"{"id":"abc","n":[1,2]}"#.into())])
            .await
            .unwrap();
        let step = HttpStep::new(HttpMethod::Post, format!("{}/run", server.url()))
            .with_body("{}")
            .with_output_parameter("id", "$.id")
            .with_output_parameter("second", "$.n[1]");

        let outcome = runner().execute(&step).await.unwrap();
        let Outcome::Succeeded(outputs) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(outputs.parameter("id"), Some("abc"));
        assert_eq!(outputs.parameter("second"), Some("2"));
        assert_eq!(outputs.result.as_deref(), Some(r#"{"id":"abc","n":[1,2]}"#));
        assert_eq!(server.requests()[0].method, "POST");
        assert_eq!(server.requests()[0].body, b"{}");
    }

    #[tokio::test]
    async fn test_non_2xx_fails_with_code() {
        let server = MockHttpServer::start(vec![(404, "nope".into())]).await.unwrap();
        let outcome = runner()
            .execute(&HttpStep::new(HttpMethod::Get, server.url()))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::failed("received non-2xx response code: 404"));
    }

    #[tokio::test]
    async fn test_success_condition_replaces_status_rule() {
        let server = MockHttpServer::start(vec![(404, r#"{"state":"gone"}"#.into())])
            .await
            .unwrap();
        let ok = HttpStep::new(HttpMethod::Get, server.url())
            .with_success_condition("response.statusCode == 404 && response.body.state == 'gone'");
        assert!(runner().execute(&ok).await.unwrap().is_success());

        let strict = HttpStep::new(HttpMethod::Get, server.url()).with_success_condition("response.statusCode == 200");
        assert_eq!(
            runner().execute(&strict).await.unwrap(),
            Outcome::failed("successCondition 'response.statusCode == 200' evaluated false")
        );
    }

    #[tokio::test]
    async fn test_bad_output_expression_names_parameter() {
        let server = MockHttpServer::start(vec![(200, r#"{"id":"abc"}"#.into())]).await.unwrap();
        let step = HttpStep::new(HttpMethod::Get, server.url()).with_output_parameter("missing", "$.nothing");
        let Outcome::Failed(message) = runner().execute(&step).await.unwrap() else {
            panic!("expected failure");
        };
        assert!(message.starts_with("failed to evaluate output parameter 'missing'"), "{message}");
    }

    #[tokio::test]
    async fn test_not_implemented_short_circuits() {
        let server = MockHttpServer::start(vec![(501, String::new())]).await.unwrap();
        let runner = runner();
        let step = HttpStep::new(HttpMethod::Put, server.url()).with_output_parameter("id", "$.id");

        assert_eq!(runner.execute(&step).await.unwrap(), Outcome::Succeeded(Outputs::new()));
        assert!(runner.is_unsupported(HttpMethod::Put, server.url()));
        assert_eq!(runner.execute(&step).await.unwrap(), Outcome::Succeeded(Outputs::new()));
        assert_eq!(server.calls(), 1);

        // A different method on the same URL still goes out.
        runner.execute(&HttpStep::new(HttpMethod::Get, server.url())).await.unwrap();
        assert_eq!(server.calls(), 2);
    }

    #[tokio::test]
    async fn test_secret_and_host_headers() {
        let server = MockHttpServer::start(vec![(200, "{}".into())]).await.unwrap();
        let secrets = InMemorySecretStore::new().with_secret("api", "token", "Bearer s3cr3t");
        let runner = HttpRunner::new(reqwest::Client::new(), Arc::new(secrets));
        let step = HttpStep::new(HttpMethod::Get, server.url())
            .with_header(Header {
                name: "Authorization".into(),
                value: String::new(),
                value_from: Some(SecretKeySelector::new("api", "token")),
            })
            .with_header(Header::new("Host", "api.example.com"));

        assert!(runner.execute(&step).await.unwrap().is_success());
        let request = &server.requests()[0];
        assert_eq!(request.header("authorization"), Some("Bearer s3cr3t"));
        assert_eq!(request.header("host"), Some("api.example.com"));
    }

    #[tokio::test]
    async fn test_missing_secret_is_error() {
        let step = HttpStep::new(HttpMethod::Get, "http://127.0.0.1:1").with_header(Header {
            name: "Authorization".into(),
            value: String::new(),
            value_from: Some(SecretKeySelector::new("absent", "token")),
        });
        let err = runner().execute(&step).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_connection_refused_is_error() {
        let err = runner()
            .execute(&HttpStep::new(HttpMethod::Get, "http://127.0.0.1:1/"))
            .await
            .unwrap_err();
        assert!(crate::objectstore::TransientClassifier::new().is_transient(&err), "{err}");
    }
}
