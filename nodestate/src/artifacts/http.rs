//! Artifacts fetched from and written to HTTP endpoints.

use super::{ArtifactDriver, ByteStream};
use crate::core::{Artifact, HttpArtifact};
use crate::errors::{NodeStateError, RemoteError, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

const DEFAULT_WRITE_METHOD: &str = "PUT";

/// Maps a non-success status to an error.
pub(crate) fn status_error(status: StatusCode, url: &str) -> NodeStateError {
    let code = match status.as_u16() {
        404 => return NodeStateError::not_found(url.to_string()),
        408 => "RequestTimeout",
        429 => "Throttling",
        500 => "InternalError",
        503 => "ServiceUnavailable",
        _ => "HttpError",
    };
    RemoteError::new(code, format!("{url} returned {status}"))
        .with_status(status.as_u16())
        .into()
}

/// Reads artifacts with GET and writes them with PUT (or the artifact's
/// method). Credentials are resolved before construction.
#[derive(Debug, Clone)]
pub struct HttpDriver {
    client: reqwest::Client,
    headers: Vec<(String, String)>,
    basic_auth: Option<(String, String)>,
    timeout: Option<Duration>,
}

impl HttpDriver {
    /// Creates a driver using `client`.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            headers: Vec::new(),
            basic_auth: None,
            timeout: None,
        }
    }

    /// Sets the resolved request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Sets basic-auth credentials.
    #[must_use]
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }

    /// Sets a per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn request(&self, method: Method, http: &HttpArtifact) -> RequestBuilder {
        let mut request = self.client.request(method, &http.url);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some((user, pass)) = &self.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        request
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response> {
        let response = request.send().await.map_err(|e| NodeStateError::from(e).context(url.to_string()))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), url));
        }
        Ok(response)
    }

    fn write_method(http: &HttpArtifact) -> Result<Method> {
        let name = http.method.as_deref().unwrap_or(DEFAULT_WRITE_METHOD).to_ascii_uppercase();
        Method::from_bytes(name.as_bytes())
            .map_err(|_| NodeStateError::validation(format!("invalid HTTP method '{name}'")))
    }
}

#[async_trait]
impl ArtifactDriver for HttpDriver {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<()> {
        let mut stream = self.open_stream(artifact).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(url = %artifact.as_http()?.url, bytes = written, "Downloaded HTTP artifact");
        Ok(())
    }

    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<()> {
        let meta = tokio::fs::metadata(path).await?;
        if meta.is_dir() {
            return Err(NodeStateError::not_implemented(format!(
                "uploading directory {} over HTTP",
                path.display()
            )));
        }
        let file = tokio::fs::File::open(path).await?;
        let stream = ReaderStream::new(file).map_err(NodeStateError::from).boxed();
        self.put_stream(stream, Some(meta.len()), artifact).await
    }

    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream> {
        let http = artifact.as_http()?;
        let response = self.send(self.request(Method::GET, http), &http.url).await?;
        Ok(response.bytes_stream().map_err(NodeStateError::from).boxed())
    }

    async fn put_stream(&self, data: ByteStream, size: Option<u64>, artifact: &Artifact) -> Result<()> {
        let http = artifact.as_http()?;
        let mut request = self
            .request(Self::write_method(http)?, http)
            .body(reqwest::Body::wrap_stream(data));
        if let Some(size) = size {
            request = request.header(reqwest::header::CONTENT_LENGTH, size);
        }
        self.send(request, &http.url).await?;
        debug!(url = %http.url, size = ?size, "Uploaded HTTP artifact");
        Ok(())
    }

    async fn delete(&self, artifact: &Artifact) -> Result<()> {
        let http = artifact.as_http()?;
        self.send(self.request(Method::DELETE, http), &http.url).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::testing::MockHttpServer;

    #[tokio::test]
    async fn test_load_writes_body() {
        let server = MockHttpServer::start(vec![(200, "artifact body".into())]).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out.txt");

        HttpDriver::new(reqwest::Client::new())
            .with_headers(vec![("X-Token".into(), "abc".into())])
            .load(&Artifact::http("a", format!("{}/files/a", server.url())), &dst)
            .await
            .unwrap();

        assert_eq!(tokio::fs::read_to_string(&dst).await.unwrap(), "artifact body");
        let request = &server.requests()[0];
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/files/a");
        assert_eq!(request.header("x-token"), Some("abc"));
    }

    #[tokio::test]
    async fn test_save_puts_file_with_basic_auth() {
        let server = MockHttpServer::start(vec![(201, String::new())]).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.txt");
        tokio::fs::write(&src, "upload me").await.unwrap();

        HttpDriver::new(reqwest::Client::new())
            .with_basic_auth("user", "pass")
            .save(&src, &Artifact::http("a", format!("{}/up", server.url())))
            .await
            .unwrap();

        let request = &server.requests()[0];
        assert_eq!(request.method, "PUT");
        assert_eq!(request.body, b"upload me");
        assert_eq!(request.header("authorization"), Some("Basic dXNlcjpwYXNz"));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockHttpServer::start(vec![(404, String::new()), (503, String::new())])
            .await
            .unwrap();
        let driver = HttpDriver::new(reqwest::Client::new());
        let artifact = Artifact::http("a", server.url().to_string());

        let err = driver.open_stream(&artifact).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = driver.open_stream(&artifact).await.err().unwrap();
        let remote = err.as_remote().unwrap();
        assert_eq!(remote.code, "ServiceUnavailable");
        assert_eq!(remote.status, Some(503));
    }
}
