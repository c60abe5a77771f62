//! The S3 artifact driver.

use super::keys::{directory_prefix, validate_key};
use super::transfer::TransferEngine;
use super::{S3Client, TransientClassifier};
use crate::artifacts::{ArtifactDriver, ByteStream};
use crate::config::TransferConfig;
use crate::core::{Artifact, S3Artifact};
use crate::errors::{NodeStateError, Result};
use crate::retry::{with_retry, RetryPolicy};
use crate::sync::ConcurrentMap;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const BUCKET_EXISTS_CODES: &[&str] = &["BucketAlreadyExists", "BucketAlreadyOwnedByYou"];

/// Reads and writes artifacts in an S3-compatible store.
///
/// Idempotent calls are retried while the [`TransientClassifier`] accepts
/// the error and the [`RetryPolicy`] allows. Streamed uploads are not
/// retried since their source cannot be replayed.
pub struct S3Driver {
    client: Arc<dyn S3Client>,
    region: Option<String>,
    transfer: TransferConfig,
    retry: RetryPolicy,
    classifier: TransientClassifier,
    ready_buckets: ConcurrentMap<String, ()>,
}

impl S3Driver {
    /// Creates a driver over `client`.
    #[must_use]
    pub fn new(client: Arc<dyn S3Client>) -> Self {
        Self {
            client,
            region: None,
            transfer: TransferConfig::default(),
            retry: RetryPolicy::default(),
            classifier: TransientClassifier::default(),
            ready_buckets: ConcurrentMap::new(),
        }
    }

    /// Sets the region used when creating buckets.
    #[must_use]
    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    /// Sets the default directory transfer options.
    #[must_use]
    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the transient-error classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: TransientClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    fn engine(&self, s3: &S3Artifact) -> TransferEngine {
        TransferEngine::new(Arc::clone(&self.client), s3.transfer.unwrap_or(self.transfer))
            .with_retry(self.retry.clone())
            .with_classifier(self.classifier.clone())
    }

    async fn retried<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        with_retry(&self.retry, operation, |e| self.classifier.is_transient(e), op).await
    }

    /// Creates the bucket before the first write when the artifact asks for it.
    async fn ensure_bucket(&self, s3: &S3Artifact) -> Result<()> {
        if !s3.create_bucket_if_not_present || self.ready_buckets.contains(&s3.bucket) {
            return Ok(());
        }
        let bucket = s3.bucket.as_str();
        let region = s3.region.as_deref().or(self.region.as_deref());
        self.retried("make_bucket", || async move {
            if self.client.bucket_exists(bucket).await? {
                return Ok(());
            }
            match self.client.make_bucket(bucket, region.map(str::to_string)).await {
                Ok(()) => {
                    info!(bucket = %bucket, region = ?region, "Created bucket");
                    Ok(())
                }
                Err(e) if e.as_remote().is_some_and(|r| BUCKET_EXISTS_CODES.contains(&r.code.as_str())) => {
                    debug!(bucket = %bucket, "Bucket already exists");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| e.context(format!("create bucket {bucket}")))?;
        self.ready_buckets.store(s3.bucket.clone(), ());
        Ok(())
    }

    async fn is_directory_key(&self, s3: &S3Artifact) -> Result<bool> {
        self.retried("is_directory", || self.client.is_directory(&s3.bucket, &s3.key))
            .await
    }
}

fn location(s3: &S3Artifact) -> String {
    format!("s3://{}/{}", s3.bucket, s3.key)
}

#[async_trait]
impl ArtifactDriver for S3Driver {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<()> {
        let s3 = artifact.as_s3()?;
        validate_key(&s3.key)?;
        self.retried("load", || async move {
            match self.client.get_file(&s3.bucket, &s3.key, path).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => {
                    if !self.client.is_directory(&s3.bucket, &s3.key).await? {
                        return Err(e);
                    }
                    debug!(location = %location(s3), "Key is a directory, downloading prefix");
                    self.engine(s3).get_directory(&s3.bucket, &s3.key, path).await.map(|_| ())
                }
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| e.context(format!("load {}", location(s3))))
    }

    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<()> {
        let s3 = artifact.as_s3()?;
        validate_key(&s3.key)?;
        self.ensure_bucket(s3).await?;

        let meta = tokio::fs::metadata(path).await?;
        if meta.is_dir() {
            self.engine(s3).put_directory(&s3.bucket, path, &s3.key).await?;
            return Ok(());
        }
        self.retried("put_file", || self.client.put_file(&s3.bucket, &s3.key, path))
            .await
            .map_err(|e| e.context(format!("save {}", location(s3))))
    }

    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream> {
        let s3 = artifact.as_s3()?;
        validate_key(&s3.key)?;
        match self.retried("open_file", || self.client.open_file(&s3.bucket, &s3.key)).await {
            Ok(stream) => Ok(stream),
            Err(e) if e.is_not_found() => {
                if self.is_directory_key(s3).await? {
                    Err(NodeStateError::not_implemented(format!(
                        "streaming directory {}",
                        location(s3)
                    )))
                } else {
                    Err(e.context(format!("open {}", location(s3))))
                }
            }
            Err(e) => Err(e.context(format!("open {}", location(s3)))),
        }
    }

    async fn put_stream(&self, data: ByteStream, size: Option<u64>, artifact: &Artifact) -> Result<()> {
        let s3 = artifact.as_s3()?;
        validate_key(&s3.key)?;
        self.ensure_bucket(s3).await?;
        self.client
            .put_stream(&s3.bucket, &s3.key, data, size)
            .await
            .map_err(|e| e.context(format!("put stream {}", location(s3))))
    }

    async fn delete(&self, artifact: &Artifact) -> Result<()> {
        let s3 = artifact.as_s3()?;
        validate_key(&s3.key)?;
        if !s3.key.ends_with('/') {
            return self
                .retried("delete", || self.client.delete(&s3.bucket, &s3.key))
                .await
                .map_err(|e| e.context(format!("delete {}", location(s3))));
        }

        let keys = self
            .retried("list_directory", || self.client.list_directory(&s3.bucket, &s3.key))
            .await?;
        for key in &keys {
            self.retried("delete", || self.client.delete(&s3.bucket, key))
                .await
                .map_err(|e| e.context(format!("delete s3://{}/{key}", s3.bucket)))?;
        }
        info!(bucket = %s3.bucket, prefix = %directory_prefix(&s3.key), objects = keys.len(), "Deleted prefix");
        Ok(())
    }

    async fn list_objects(&self, artifact: &Artifact) -> Result<Vec<String>> {
        let s3 = artifact.as_s3()?;
        self.retried("list_directory", || self.client.list_directory(&s3.bucket, &s3.key))
            .await
    }

    async fn is_directory(&self, artifact: &Artifact) -> Result<bool> {
        let s3 = artifact.as_s3()?;
        validate_key(&s3.key)?;
        self.is_directory_key(s3).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::objectstore::{InMemoryS3Client, MockS3Client};
    use bytes::Bytes;
    use futures::StreamExt;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(4)
            .with_base_delay_ms(1)
            .with_max_delay_ms(2)
            .with_jitter(0.0)
    }

    fn driver(client: &Arc<InMemoryS3Client>) -> S3Driver {
        S3Driver::new(client.clone() as Arc<dyn S3Client>).with_retry(fast_retry())
    }

    #[tokio::test]
    async fn test_load_file() {
        let client = Arc::new(InMemoryS3Client::new());
        client.insert("b", "out/report.txt", "report");
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("report.txt");

        driver(&client)
            .load(&Artifact::s3("report", "b", "out/report.txt"), &dst)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read_to_string(&dst).await.unwrap(), "report");
    }

    #[tokio::test]
    async fn test_load_missing_key_falls_back_to_directory() {
        let client = Arc::new(InMemoryS3Client::new());
        client.insert("b", "out/a.txt", "a");
        client.insert("b", "out/sub/b.txt", "b");
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out");

        driver(&client)
            .load(&Artifact::s3("out", "b", "out"), &dst)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read_to_string(dst.join("sub/b.txt")).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let client = Arc::new(InMemoryS3Client::new().with_bucket("b"));
        let dir = tempfile::tempdir().unwrap();
        let err = driver(&client)
            .load(&Artifact::s3("x", "b", "missing.txt"), &dir.path().join("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(client.calls("get_file"), 1);
    }

    #[tokio::test]
    async fn test_transient_get_is_retried() {
        let client = Arc::new(InMemoryS3Client::new());
        client.insert("b", "k", "v");
        client.inject_fault("get_file", Some("k"), "ServiceUnavailable", 2);
        let dir = tempfile::tempdir().unwrap();

        driver(&client)
            .load(&Artifact::s3("k", "b", "k"), &dir.path().join("k"))
            .await
            .unwrap();
        assert_eq!(client.calls("get_file"), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let mut mock = MockS3Client::new();
        mock.expect_get_file()
            .times(1)
            .returning(|_, _, _| Err(NodeStateError::remote("AccessDenied", "denied")));
        let driver = S3Driver::new(Arc::new(mock)).with_retry(fast_retry());

        let err = driver
            .load(&Artifact::s3("k", "b", "k"), Path::new("/tmp/never"))
            .await
            .unwrap_err();
        assert_eq!(err.as_remote().unwrap().code, "AccessDenied");
    }

    #[tokio::test]
    async fn test_invalid_key_makes_no_calls() {
        let client = Arc::new(InMemoryS3Client::new().with_bucket("b"));
        let err = driver(&client)
            .open_stream(&Artifact::s3("k", "b", "   "))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(client.calls("open_file"), 0);
    }

    #[tokio::test]
    async fn test_open_stream_of_directory_not_implemented() {
        let client = Arc::new(InMemoryS3Client::new());
        client.insert("b", "dir/a.txt", "a");
        let err = driver(&client)
            .open_stream(&Artifact::s3("d", "b", "dir"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err.root(), NodeStateError::NotImplemented { .. }));
    }

    #[tokio::test]
    async fn test_open_stream_reads_object() {
        let client = Arc::new(InMemoryS3Client::new());
        client.insert("b", "k", "streamed content");
        let mut stream = driver(&client).open_stream(&Artifact::s3("k", "b", "k")).await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"streamed content");
    }

    #[tokio::test]
    async fn test_save_creates_bucket_once() {
        let client = Arc::new(InMemoryS3Client::new());
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        tokio::fs::write(&src, "a").await.unwrap();

        let mut artifact = Artifact::s3("a", "fresh", "a.txt");
        if let crate::core::ArtifactLocation::S3(s3) = &mut artifact.location {
            s3.create_bucket_if_not_present = true;
        }
        let driver = driver(&client);
        driver.save(&src, &artifact).await.unwrap();
        driver.save(&src, &artifact).await.unwrap();

        assert!(client.object("fresh", "a.txt").is_some());
        assert_eq!(client.calls("make_bucket"), 1);
        assert_eq!(client.calls("bucket_exists"), 1);
    }

    #[tokio::test]
    async fn test_bucket_already_exists_is_accepted() {
        let mut mock = MockS3Client::new();
        mock.expect_bucket_exists().times(1).returning(|_| Ok(false));
        mock.expect_make_bucket()
            .times(1)
            .returning(|_, _| Err(NodeStateError::remote("BucketAlreadyExists", "raced")));
        mock.expect_put_file().times(1).returning(|_, _, _| Ok(()));
        let driver = S3Driver::new(Arc::new(mock)).with_retry(fast_retry());

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        tokio::fs::write(&src, "a").await.unwrap();
        let mut artifact = Artifact::s3("a", "b", "a.txt");
        if let crate::core::ArtifactLocation::S3(s3) = &mut artifact.location {
            s3.create_bucket_if_not_present = true;
        }
        driver.save(&src, &artifact).await.unwrap();
    }

    #[tokio::test]
    async fn test_bucket_check_retried_before_stream() {
        let client = Arc::new(InMemoryS3Client::new().with_bucket("b"));
        client.inject_fault("bucket_exists", None, "SlowDown", 1);
        let mut artifact = Artifact::s3("a", "b", "a.txt");
        if let crate::core::ArtifactLocation::S3(s3) = &mut artifact.location {
            s3.create_bucket_if_not_present = true;
        }
        let stream: ByteStream = futures::stream::iter(vec![Ok(Bytes::from_static(b"x"))]).boxed();
        driver(&client).put_stream(stream, Some(1), &artifact).await.unwrap();
        assert_eq!(client.object("b", "a.txt").unwrap().data, Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_cancelled_stream_upload_is_aborted() {
        let client = Arc::new(InMemoryS3Client::new().with_bucket("b"));
        let stream: ByteStream = futures::stream::iter(vec![Ok(Bytes::from_static(b"part"))])
            .chain(futures::stream::pending())
            .boxed();
        let artifact = Artifact::s3("a", "b", "big.bin");

        let driver = driver(&client);
        let upload = driver.put_stream(stream, None, &artifact);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), upload)
            .await
            .is_err());

        assert_eq!(client.aborted_uploads(), 1);
        assert!(client.object("b", "big.bin").is_none());
    }

    #[tokio::test]
    async fn test_save_directory() {
        let client = Arc::new(InMemoryS3Client::new().with_bucket("b"));
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "a").await.unwrap();
        tokio::fs::write(dir.path().join("sub/b.txt"), "b").await.unwrap();

        driver(&client)
            .save(dir.path(), &Artifact::s3("out", "b", "run-1/out"))
            .await
            .unwrap();
        assert_eq!(
            client.keys("b"),
            vec!["run-1/out/a.txt".to_string(), "run-1/out/sub/b.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let client = Arc::new(InMemoryS3Client::new());
        client.insert("b", "out/a", "a");
        client.insert("b", "out/b", "b");
        client.insert("b", "keep", "k");

        driver(&client).delete(&Artifact::s3("out", "b", "out/")).await.unwrap();
        assert_eq!(client.keys("b"), vec!["keep".to_string()]);
    }

    #[tokio::test]
    async fn test_wrong_location_is_validation() {
        let client = Arc::new(InMemoryS3Client::new());
        let err = driver(&client)
            .list_objects(&Artifact::http("h", "https://example.com/x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
