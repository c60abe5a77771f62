//! Per-operation logging around any driver.

use super::{ArtifactDriver, ByteStream};
use crate::core::Artifact;
use crate::errors::Result;
use crate::observability::OperationTimer;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Logs the duration and outcome of every call to the wrapped driver.
pub struct LoggingDriver {
    inner: Arc<dyn ArtifactDriver>,
}

impl LoggingDriver {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn ArtifactDriver>) -> Self {
        Self { inner }
    }

    fn record<T>(&self, timer: &OperationTimer, artifact: &Artifact, result: &Result<T>) {
        match result {
            Ok(_) => info!(
                driver = self.inner.name(),
                operation = timer.name(),
                artifact = %artifact.name,
                duration_ms = timer.elapsed_ms(),
                "Artifact operation succeeded"
            ),
            Err(err) => warn!(
                driver = self.inner.name(),
                operation = timer.name(),
                artifact = %artifact.name,
                duration_ms = timer.elapsed_ms(),
                kind = %err.kind(),
                error = %err,
                "Artifact operation failed"
            ),
        }
    }
}

#[async_trait]
impl ArtifactDriver for LoggingDriver {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<()> {
        let timer = OperationTimer::start("load");
        let result = self.inner.load(artifact, path).await;
        self.record(&timer, artifact, &result);
        result
    }

    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<()> {
        let timer = OperationTimer::start("save");
        let result = self.inner.save(path, artifact).await;
        self.record(&timer, artifact, &result);
        result
    }

    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream> {
        let timer = OperationTimer::start("open_stream");
        let result = self.inner.open_stream(artifact).await;
        self.record(&timer, artifact, &result);
        result
    }

    async fn put_stream(&self, data: ByteStream, size: Option<u64>, artifact: &Artifact) -> Result<()> {
        let timer = OperationTimer::start("put_stream");
        let result = self.inner.put_stream(data, size, artifact).await;
        self.record(&timer, artifact, &result);
        result
    }

    async fn delete(&self, artifact: &Artifact) -> Result<()> {
        let timer = OperationTimer::start("delete");
        let result = self.inner.delete(artifact).await;
        self.record(&timer, artifact, &result);
        result
    }

    async fn list_objects(&self, artifact: &Artifact) -> Result<Vec<String>> {
        let timer = OperationTimer::start("list_objects");
        let result = self.inner.list_objects(artifact).await;
        self.record(&timer, artifact, &result);
        result
    }

    async fn is_directory(&self, artifact: &Artifact) -> Result<bool> {
        let timer = OperationTimer::start("is_directory");
        let result = self.inner.is_directory(artifact).await;
        self.record(&timer, artifact, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::InlineDriver;

    #[tokio::test]
    async fn test_passes_results_through() {
        let driver = LoggingDriver::new(Arc::new(InlineDriver));
        assert_eq!(driver.name(), "inline");
        assert!(!driver.is_directory(&Artifact::inline("a", "x")).await.unwrap());
        assert!(driver.delete(&Artifact::inline("a", "x")).await.is_err());
    }
}
