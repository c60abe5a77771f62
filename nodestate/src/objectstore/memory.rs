//! In-process S3 client.
//!
//! Objects live in memory. Faults can be injected per operation and key, and
//! the client counts calls and concurrent uploads so tests can assert on the
//! engine's behavior.

use super::keys::directory_prefix;
use super::upload::AbortOnDrop;
use super::{S3Client, S3ClientFactory, S3ClientOptions};
use crate::errors::{NodeStateError, RemoteError, Result};
use crate::substrate::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CHUNK_BYTES: usize = 64 * 1024;

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object content.
    pub data: Bytes,
    /// Hex MD5 of the content.
    pub etag: String,
}

impl StoredObject {
    fn new(data: Bytes) -> Self {
        let etag = hex::encode(Md5::digest(&data));
        Self { data, etag }
    }
}

#[derive(Debug)]
struct Fault {
    operation: &'static str,
    key: Option<String>,
    error: RemoteError,
    remaining: usize,
}

struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An in-memory S3-compatible store.
#[derive(Debug, Default)]
pub struct InMemoryS3Client {
    buckets: Mutex<HashMap<String, BTreeMap<String, StoredObject>>>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    put_delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    aborted_uploads: AtomicUsize,
}

impl InMemoryS3Client {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty bucket.
    #[must_use]
    pub fn with_bucket(self, bucket: &str) -> Self {
        self.buckets.lock().entry(bucket.to_string()).or_default();
        self
    }

    /// Makes every upload take at least `delay`.
    #[must_use]
    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = Some(delay);
        self
    }

    /// Fails the next `times` calls of `operation` (optionally only for `key`)
    /// with a remote error carrying `code`.
    pub fn inject_fault(&self, operation: &'static str, key: Option<&str>, code: &str, times: usize) {
        self.faults.lock().push(Fault {
            operation,
            key: key.map(str::to_string),
            error: RemoteError::new(code, format!("injected {code}")),
            remaining: times,
        });
    }

    /// Stores an object directly, creating the bucket if needed.
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.buckets
            .lock()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), StoredObject::new(data.into()));
    }

    /// Returns a stored object.
    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.buckets.lock().get(bucket)?.get(key).cloned()
    }

    /// Every key in a bucket, sorted.
    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .lock()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns true if the bucket exists.
    #[must_use]
    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.lock().contains_key(bucket)
    }

    /// Number of calls made to `operation`.
    #[must_use]
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    /// Highest number of uploads observed in flight at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Number of streamed uploads that were aborted.
    #[must_use]
    pub fn aborted_uploads(&self) -> usize {
        self.aborted_uploads.load(Ordering::SeqCst)
    }

    fn enter(&self, operation: &'static str, key: &str) -> Result<()> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;
        let mut faults = self.faults.lock();
        let hit = faults.iter_mut().find(|f| {
            f.operation == operation && f.remaining > 0 && f.key.as_deref().map_or(true, |k| k == key)
        });
        match hit {
            Some(fault) => {
                fault.remaining -= 1;
                Err(fault.error.clone().into())
            }
            None => Ok(()),
        }
    }

    fn store(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let objects = buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        objects.insert(key.to_string(), StoredObject::new(data));
        Ok(())
    }

    fn fetch(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let buckets = self.buckets.lock();
        let objects = buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| NodeStateError::not_found(format!("s3://{bucket}/{key}")))
    }

    async fn upload_delay(&self) {
        if let Some(delay) = self.put_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn no_such_bucket(bucket: &str) -> NodeStateError {
    RemoteError::new("NoSuchBucket", format!("bucket '{bucket}' does not exist"))
        .with_status(404)
        .into()
}

#[async_trait]
impl S3Client for InMemoryS3Client {
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        self.enter("put_file", key)?;
        let _guard = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        let data = tokio::fs::read(path).await?;
        self.upload_delay().await;
        self.store(bucket, key, Bytes::from(data))
    }

    async fn put_stream(&self, bucket: &str, key: &str, mut data: ByteStream, _size: Option<u64>) -> Result<()> {
        self.enter("put_stream", key)?;
        let _guard = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        let upload = AbortOnDrop::new(|| {
            self.aborted_uploads.fetch_add(1, Ordering::SeqCst);
        });
        let mut buffer = Vec::new();
        while let Some(chunk) = data.next().await {
            match chunk {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(err) => return Err(err.context(format!("upload of s3://{bucket}/{key} aborted"))),
            }
        }
        self.upload_delay().await;
        upload.disarm();
        self.store(bucket, key, Bytes::from(buffer))
    }

    async fn get_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        self.enter("get_file", key)?;
        let data = self.fetch(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &data).await?;
        Ok(())
    }

    async fn open_file(&self, bucket: &str, key: &str) -> Result<ByteStream> {
        self.enter("open_file", key)?;
        let data = self.fetch(bucket, key)?;
        let chunks: Vec<Result<Bytes>> = (0..data.len())
            .step_by(CHUNK_BYTES)
            .map(|start| Ok(data.slice(start..(start + CHUNK_BYTES).min(data.len()))))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn key_exists(&self, bucket: &str, key: &str) -> Result<bool> {
        self.enter("key_exists", key)?;
        let buckets = self.buckets.lock();
        let objects = buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        Ok(objects.contains_key(key))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.enter("delete", key)?;
        let mut buckets = self.buckets.lock();
        let objects = buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        objects.remove(key);
        Ok(())
    }

    async fn list_directory(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.enter("list_directory", prefix)?;
        let dir = directory_prefix(prefix);
        let buckets = self.buckets.lock();
        let objects = buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(&dir) && !k.ends_with('/'))
            .cloned()
            .collect())
    }

    async fn is_directory(&self, bucket: &str, prefix: &str) -> Result<bool> {
        self.enter("is_directory", prefix)?;
        let dir = directory_prefix(prefix);
        let buckets = self.buckets.lock();
        let objects = buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        Ok(objects.keys().any(|k| k.starts_with(&dir)))
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.enter("bucket_exists", bucket)?;
        Ok(self.has_bucket(bucket))
    }

    async fn make_bucket(&self, bucket: &str, _region: Option<String>) -> Result<()> {
        self.enter("make_bucket", bucket)?;
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(bucket) {
            return Err(RemoteError::new("BucketAlreadyOwnedByYou", format!("bucket '{bucket}' exists"))
                .with_status(409)
                .into());
        }
        buckets.insert(bucket.to_string(), BTreeMap::new());
        Ok(())
    }
}

/// Hands out one shared [`InMemoryS3Client`] and records the options it was
/// asked for.
#[derive(Debug, Default)]
pub struct InMemoryS3ClientFactory {
    client: Arc<InMemoryS3Client>,
    requests: Mutex<Vec<S3ClientOptions>>,
}

impl InMemoryS3ClientFactory {
    /// Creates a factory around `client`.
    #[must_use]
    pub fn new(client: Arc<InMemoryS3Client>) -> Self {
        Self {
            client,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// The shared client.
    #[must_use]
    pub fn store(&self) -> Arc<InMemoryS3Client> {
        Arc::clone(&self.client)
    }

    /// Options passed to the most recent `client` call.
    #[must_use]
    pub fn last_options(&self) -> Option<S3ClientOptions> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl S3ClientFactory for InMemoryS3ClientFactory {
    async fn client(&self, options: S3ClientOptions) -> Result<Arc<dyn S3Client>> {
        self.requests.lock().push(options);
        Ok(Arc::clone(&self.client) as Arc<dyn S3Client>)
    }
}
