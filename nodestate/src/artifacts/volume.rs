//! Artifacts on a volume mounted into this process.
//!
//! An artifact lives at `<root>/<volumeName>/<subPath>`. Files and whole
//! directories are copied in both directions.

use super::LoadSaveDriver;
use crate::core::{Artifact, VolumeArtifact};
use crate::errors::{NodeStateError, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Copies artifacts to and from mounted volumes.
#[derive(Debug, Clone)]
pub struct VolumeDriver {
    root: PathBuf,
}

impl VolumeDriver {
    /// Creates a driver for volumes mounted under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the artifact's location, refusing paths that leave the volume.
    pub fn resolve(&self, volume: &VolumeArtifact) -> Result<PathBuf> {
        for (field, value) in [("volumeName", &volume.volume_name), ("subPath", &volume.sub_path)] {
            let escapes = Path::new(value)
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
            if escapes {
                return Err(NodeStateError::validation(format!(
                    "volume artifact {field} '{value}' must be a relative path inside the volume"
                )));
            }
        }
        if volume.volume_name.is_empty() {
            return Err(NodeStateError::validation("volume artifact needs a volumeName"));
        }
        Ok(self.root.join(&volume.volume_name).join(&volume.sub_path))
    }
}

/// Copies a file or directory tree from `src` to `dst`.
async fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    let meta = tokio::fs::metadata(src).await?;
    if !meta.is_dir() {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        return Ok(tokio::fs::copy(src, dst).await?);
    }

    let mut copied = 0;
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                stack.push((entry.path(), target));
            } else if file_type.is_file() {
                copied += tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(copied)
}

#[async_trait]
impl LoadSaveDriver for VolumeDriver {
    fn name(&self) -> &'static str {
        "volume"
    }

    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<()> {
        let src = self.resolve(artifact.as_volume()?)?;
        let bytes = copy_tree(&src, path)
            .await
            .map_err(|e| e.context(format!("load {}", src.display())))?;
        debug!(src = %src.display(), dst = %path.display(), bytes, "Loaded volume artifact");
        Ok(())
    }

    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<()> {
        let dst = self.resolve(artifact.as_volume()?)?;
        let bytes = copy_tree(path, &dst)
            .await
            .map_err(|e| e.context(format!("save {}", dst.display())))?;
        debug!(src = %path.display(), dst = %dst.display(), bytes, "Saved volume artifact");
        Ok(())
    }

    async fn delete(&self, artifact: &Artifact) -> Result<()> {
        let target = self.resolve(artifact.as_volume()?)?;
        if tokio::fs::metadata(&target).await?.is_dir() {
            tokio::fs::remove_dir_all(&target).await?;
        } else {
            tokio::fs::remove_file(&target).await?;
        }
        Ok(())
    }

    async fn is_directory(&self, artifact: &Artifact) -> Result<bool> {
        let target = self.resolve(artifact.as_volume()?)?;
        Ok(tokio::fs::metadata(&target).await?.is_dir())
    }
}
