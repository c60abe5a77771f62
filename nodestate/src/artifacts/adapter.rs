//! Streaming on top of load/save-only drivers.
//!
//! Each streamed read first loads the artifact into a temporary directory and
//! each streamed write first spools to one, so a transfer costs twice the
//! artifact size in disk plus the copy in memory buffers.

use super::{ArtifactDriver, ByteStream};
use crate::core::Artifact;
use crate::errors::{NodeStateError, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

const SPOOL_FILE: &str = "artifact";

/// A driver that can only move whole files or directories.
#[async_trait]
pub trait LoadSaveDriver: Send + Sync {
    /// Short name of the driver.
    fn name(&self) -> &'static str;

    /// Downloads the artifact to `path`.
    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<()>;

    /// Uploads `path` to the artifact's location.
    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<()>;

    /// Deletes the artifact.
    async fn delete(&self, _artifact: &Artifact) -> Result<()> {
        Err(NodeStateError::not_implemented(format!("{} delete", self.name())))
    }

    /// Returns true if the artifact is a directory.
    async fn is_directory(&self, _artifact: &Artifact) -> Result<bool> {
        Err(NodeStateError::not_implemented(format!("{} is_directory", self.name())))
    }
}

/// Gives a [`LoadSaveDriver`] the streaming half of [`ArtifactDriver`].
#[derive(Debug)]
pub struct StreamingAdapter<D> {
    inner: D,
}

impl<D: LoadSaveDriver> StreamingAdapter<D> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    /// The wrapped driver.
    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

#[async_trait]
impl<D: LoadSaveDriver> ArtifactDriver for StreamingAdapter<D> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<()> {
        self.inner.load(artifact, path).await
    }

    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<()> {
        self.inner.save(path, artifact).await
    }

    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream> {
        let spool = tempfile::tempdir()?;
        let path = spool.path().join(SPOOL_FILE);
        self.inner.load(artifact, &path).await?;
        if tokio::fs::metadata(&path).await?.is_dir() {
            return Err(NodeStateError::not_implemented(format!(
                "streaming directory artifact '{}' from {}",
                artifact.name,
                self.inner.name()
            )));
        }
        let file = tokio::fs::File::open(&path).await?;
        debug!(driver = self.inner.name(), artifact = %artifact.name, "Streaming from spooled copy");

        // The spool directory is removed once the stream is dropped.
        let stream = ReaderStream::new(file).map_err(NodeStateError::from).map(move |chunk| {
            let _ = &spool;
            chunk
        });
        Ok(stream.boxed())
    }

    async fn put_stream(&self, mut data: ByteStream, _size: Option<u64>, artifact: &Artifact) -> Result<()> {
        let spool = tempfile::tempdir()?;
        let path = spool.path().join(SPOOL_FILE);
        let mut file = tokio::fs::File::create(&path).await?;
        while let Some(chunk) = data.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);
        self.inner.save(&path, artifact).await
    }

    async fn delete(&self, artifact: &Artifact) -> Result<()> {
        self.inner.delete(artifact).await
    }

    async fn is_directory(&self, artifact: &Artifact) -> Result<bool> {
        self.inner.is_directory(artifact).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapDriver {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl LoadSaveDriver for MapDriver {
        fn name(&self) -> &'static str {
            "map"
        }

        async fn load(&self, artifact: &Artifact, path: &Path) -> Result<()> {
            let data = self
                .files
                .lock()
                .get(&artifact.name)
                .cloned()
                .ok_or_else(|| NodeStateError::not_found(artifact.name.clone()))?;
            tokio::fs::write(path, data).await?;
            Ok(())
        }

        async fn save(&self, path: &Path, artifact: &Artifact) -> Result<()> {
            let data = tokio::fs::read(path).await?;
            self.files.lock().insert(artifact.name.clone(), data);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stream_round_trip_through_spool() {
        let adapter = StreamingAdapter::new(MapDriver::default());
        let artifact = Artifact::inline("doc", "");
        let upload: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ])
        .boxed();
        adapter.put_stream(upload, None, &artifact).await.unwrap();

        let chunks: Vec<Bytes> = adapter.open_stream(&artifact).await.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello world");
    }

    #[tokio::test]
    async fn test_missing_artifact_propagates() {
        let adapter = StreamingAdapter::new(MapDriver::default());
        let err = adapter.open_stream(&Artifact::inline("nope", "")).await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_defaults_not_implemented() {
        let adapter = StreamingAdapter::new(MapDriver::default());
        let err = adapter.delete(&Artifact::inline("doc", "")).await.unwrap_err();
        assert!(matches!(err, NodeStateError::NotImplemented { .. }));
        let err = adapter.list_objects(&Artifact::inline("doc", "")).await.unwrap_err();
        assert!(matches!(err, NodeStateError::NotImplemented { .. }));
    }
}
