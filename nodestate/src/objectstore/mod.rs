//! S3-compatible object storage.
//!
//! The [`S3Client`] trait is the wire seam: one method per remote call the
//! driver needs. On top of it sit the [`TransferEngine`], which moves whole
//! directories with a bounded worker pool, and the [`S3Driver`], which
//! implements [`ArtifactDriver`](crate::artifacts::ArtifactDriver) with
//! transient-error retries, bucket creation and key validation.

mod driver;
mod encryption;
mod keys;
pub mod memory;
mod transfer;
mod transient;
mod upload;

#[cfg(feature = "aws")]
pub mod aws;

pub use driver::S3Driver;
pub use encryption::ServerSideEncryption;
pub use keys::{join_key, relative_key, validate_key, MAX_KEY_BYTES};
pub use memory::{InMemoryS3Client, InMemoryS3ClientFactory};
pub use transfer::{TransferEngine, TransferTask};
pub use transient::{TransientClassifier, TRANSIENT_ERROR_CODES};

use crate::errors::Result;
use crate::substrate::ByteStream;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Connection parameters with credentials already resolved.
#[derive(Clone, Default)]
pub struct S3ClientOptions {
    /// Endpoint host (and optional port).
    pub endpoint: String,
    /// Region.
    pub region: Option<String>,
    /// Use TLS.
    pub secure: bool,
    /// Access key.
    pub access_key: Option<String>,
    /// Secret key.
    pub secret_key: Option<String>,
    /// Session token.
    pub session_token: Option<String>,
    /// Server-side encryption applied to reads and writes.
    pub encryption: Option<ServerSideEncryption>,
}

impl fmt::Debug for S3ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ClientOptions")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("secure", &self.secure)
            .field("has_access_key", &self.access_key.is_some())
            .field("has_session_token", &self.session_token.is_some())
            .field("encryption", &self.encryption.as_ref().map(ServerSideEncryption::kind))
            .finish()
    }
}

/// The remote calls made against an S3-compatible store.
///
/// Missing keys are reported as not-found errors; service failures as remote
/// errors carrying the service error code.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait S3Client: Send + Sync {
    /// Uploads a local file to `bucket/key`.
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()>;

    /// Uploads a stream. Multipart uploads are aborted if the stream or a
    /// part upload fails.
    async fn put_stream(&self, bucket: &str, key: &str, data: ByteStream, size: Option<u64>) -> Result<()>;

    /// Downloads `bucket/key` to a local file.
    async fn get_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()>;

    /// Opens `bucket/key` for streaming reads.
    async fn open_file(&self, bucket: &str, key: &str) -> Result<ByteStream>;

    /// Returns true if `bucket/key` exists.
    async fn key_exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Deletes `bucket/key`.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Lists every object key under `prefix`, recursively.
    async fn list_directory(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Returns true if at least one object lives under `prefix/`.
    async fn is_directory(&self, bucket: &str, prefix: &str) -> Result<bool>;

    /// Returns true if the bucket exists.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Creates a bucket.
    async fn make_bucket(&self, bucket: &str, region: Option<String>) -> Result<()>;
}

/// Builds clients from resolved connection parameters.
#[async_trait]
pub trait S3ClientFactory: Send + Sync {
    /// Returns a client for `options`.
    async fn client(&self, options: S3ClientOptions) -> Result<Arc<dyn S3Client>>;
}
