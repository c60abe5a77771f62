//! Artifacts whose content is carried in the descriptor itself.

use super::{ArtifactDriver, ByteStream};
use crate::core::{Artifact, ArtifactLocation};
use crate::errors::{NodeStateError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::Path;

/// Serves inline artifact data. Writes are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDriver;

impl InlineDriver {
    fn data(artifact: &Artifact) -> Result<&str> {
        match &artifact.location {
            ArtifactLocation::Inline(inline) => Ok(&inline.data),
            other => Err(NodeStateError::validation(format!(
                "artifact '{}' is a {} artifact, not inline",
                artifact.name,
                other.kind()
            ))),
        }
    }

    fn read_only(artifact: &Artifact) -> NodeStateError {
        NodeStateError::validation(format!("inline artifact '{}' is read-only", artifact.name))
    }
}

#[async_trait]
impl ArtifactDriver for InlineDriver {
    fn name(&self) -> &'static str {
        "inline"
    }

    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<()> {
        let data = Self::data(artifact)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn save(&self, _path: &Path, artifact: &Artifact) -> Result<()> {
        Err(Self::read_only(artifact))
    }

    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream> {
        let data = Bytes::from(Self::data(artifact)?.to_string());
        Ok(futures::stream::once(async move { Ok(data) }).boxed())
    }

    async fn put_stream(&self, _data: ByteStream, _size: Option<u64>, artifact: &Artifact) -> Result<()> {
        Err(Self::read_only(artifact))
    }

    async fn is_directory(&self, artifact: &Artifact) -> Result<bool> {
        Self::data(artifact).map(|_| false)
    }
}
