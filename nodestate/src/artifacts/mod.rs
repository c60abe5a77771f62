//! Artifact drivers.
//!
//! An [`ArtifactDriver`] moves artifact bytes between a local path or stream
//! and the artifact's location. Drivers are built by the [`DriverFactory`],
//! which picks the implementation from the location variant, resolves
//! credentials through the secret store, and wraps the result in a
//! [`LoggingDriver`].
//!
//! Streaming is the primary path. Drivers that can only load and save files
//! implement [`LoadSaveDriver`] and gain streaming through [`StreamingAdapter`].

mod adapter;
mod factory;
mod http;
mod inline;
mod logging;
mod volume;

pub use adapter::{LoadSaveDriver, StreamingAdapter};
pub use factory::DriverFactory;
pub use http::HttpDriver;
pub use inline::InlineDriver;
pub use logging::LoggingDriver;
pub use volume::VolumeDriver;

pub(crate) use http::status_error;

pub use crate::substrate::ByteStream;

use crate::core::Artifact;
use crate::errors::{NodeStateError, Result};
use async_trait::async_trait;
use std::path::Path;

/// Reads and writes artifacts at their location.
///
/// Implementations are safe to share across tasks working on unrelated
/// artifacts. Concurrent writes to the same location are last-writer-wins.
#[async_trait]
pub trait ArtifactDriver: Send + Sync {
    /// Short name of the driver, used in logs.
    fn name(&self) -> &'static str;

    /// Downloads the artifact to `path`.
    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<()>;

    /// Uploads the file or directory at `path` to the artifact's location.
    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<()>;

    /// Opens the artifact for streaming reads.
    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream>;

    /// Uploads a stream. `size` is the content length when known.
    async fn put_stream(&self, data: ByteStream, size: Option<u64>, artifact: &Artifact) -> Result<()>;

    /// Deletes the artifact.
    async fn delete(&self, _artifact: &Artifact) -> Result<()> {
        Err(NodeStateError::not_implemented(format!("{} delete", self.name())))
    }

    /// Lists object keys below the artifact's location.
    async fn list_objects(&self, _artifact: &Artifact) -> Result<Vec<String>> {
        Err(NodeStateError::not_implemented(format!("{} list_objects", self.name())))
    }

    /// Returns true if the artifact's location is a directory.
    async fn is_directory(&self, _artifact: &Artifact) -> Result<bool> {
        Err(NodeStateError::not_implemented(format!("{} is_directory", self.name())))
    }
}
