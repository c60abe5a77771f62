//! Directory transfers with a bounded worker pool.
//!
//! Uploads walk the local tree on a blocking thread and feed a bounded
//! channel, so large trees are never materialized up front. The first
//! `file_count_threshold` tasks are buffered to decide between sequential and
//! parallel mode; after that, workers pull from the buffer and then the
//! channel. The first failing worker ends the transfer, dropping the others.

use super::keys::{directory_prefix, join_key, relative_key, validate_key};
use super::{S3Client, TransientClassifier};
use crate::config::TransferConfig;
use crate::errors::{NodeStateError, Result};
use crate::observability::OperationTimer;
use crate::retry::{with_retry, RetryPolicy};
use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

const WALK_CHANNEL_CAPACITY: usize = 64;

/// One file to move between a local path and an object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    /// Object key.
    pub key: String,
    /// Local file path.
    pub path: PathBuf,
}

/// Buffered head of the task list followed by the rest of the walk.
struct TaskSource {
    buffered: VecDeque<Result<TransferTask>>,
    rest: Option<mpsc::Receiver<Result<TransferTask>>>,
}

impl TaskSource {
    async fn next(&mut self) -> Option<Result<TransferTask>> {
        if let Some(task) = self.buffered.pop_front() {
            return Some(task);
        }
        self.rest.as_mut()?.recv().await
    }
}

/// Moves directories between the local filesystem and an object store.
#[derive(Clone)]
pub struct TransferEngine {
    client: Arc<dyn S3Client>,
    config: TransferConfig,
    retry: RetryPolicy,
    classifier: TransientClassifier,
}

impl TransferEngine {
    /// Creates an engine over `client`.
    #[must_use]
    pub fn new(client: Arc<dyn S3Client>, config: TransferConfig) -> Self {
        Self {
            client,
            config,
            retry: RetryPolicy::default(),
            classifier: TransientClassifier::default(),
        }
    }

    /// Sets the per-file retry policy.
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

    /// The transfer options in effect.
    #[must_use]
    pub fn config(&self) -> TransferConfig {
        self.config
    }

    /// Uploads every regular file under `dir` to `bucket` below `prefix`.
    ///
    /// Returns the number of files uploaded.
    pub async fn put_directory(&self, bucket: &str, dir: &Path, prefix: &str) -> Result<usize> {
        let timer = OperationTimer::start("put_directory");
        let mut rx = spawn_walk(dir.to_path_buf(), prefix.to_string());

        let mut buffered = VecDeque::new();
        let mut exhausted = false;
        while buffered.len() < self.config.file_count_threshold.max(1) {
            match rx.recv().await {
                Some(task) => buffered.push_back(task),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        let workers = if exhausted {
            self.config.workers_for(buffered.len())
        } else {
            self.config.workers_for(usize::MAX)
        };
        let source = TaskSource {
            buffered,
            rest: (!exhausted).then_some(rx),
        };

        let count = run_workers(source, workers, move |task| async move {
            validate_key(&task.key)?;
            debug!(bucket = %bucket, key = %task.key, path = %task.path.display(), "Uploading file");
            with_retry(
                &self.retry,
                "put_file",
                |e| self.classifier.is_transient(e),
                || self.client.put_file(bucket, &task.key, &task.path),
            )
            .await
            .map_err(|e| e.context(format!("upload {} to s3://{bucket}/{}", task.path.display(), task.key)))
        })
        .await?;

        info!(
            bucket = %bucket,
            prefix = %prefix,
            files = count,
            workers,
            duration_ms = timer.elapsed_ms(),
            "Uploaded directory"
        );
        Ok(count)
    }

    /// Downloads every object below `prefix` into `dir`, keeping the relative
    /// layout. Returns the number of files downloaded.
    pub async fn get_directory(&self, bucket: &str, prefix: &str, dir: &Path) -> Result<usize> {
        let timer = OperationTimer::start("get_directory");
        let keys = with_retry(
            &self.retry,
            "list_directory",
            |e| self.classifier.is_transient(e),
            || self.client.list_directory(bucket, prefix),
        )
        .await?;

        let tasks: VecDeque<Result<TransferTask>> = keys
            .iter()
            .filter(|key| !key.ends_with('/'))
            .map(|key| {
                let relative = relative_key(prefix, key)?;
                Ok(TransferTask {
                    key: key.clone(),
                    path: local_path(dir, relative)?,
                })
            })
            .collect();

        let workers = self.config.workers_for(tasks.len());
        let source = TaskSource {
            buffered: tasks,
            rest: None,
        };

        let count = run_workers(source, workers, move |task| async move {
            if let Some(parent) = task.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            debug!(bucket = %bucket, key = %task.key, path = %task.path.display(), "Downloading file");
            with_retry(
                &self.retry,
                "get_file",
                |e| self.classifier.is_transient(e),
                || self.client.get_file(bucket, &task.key, &task.path),
            )
            .await
            .map_err(|e| e.context(format!("download s3://{bucket}/{}", task.key)))
        })
        .await?;

        info!(
            bucket = %bucket,
            prefix = %directory_prefix(prefix),
            files = count,
            workers,
            duration_ms = timer.elapsed_ms(),
            "Downloaded directory"
        );
        Ok(count)
    }
}

/// Runs `workers` loops that pull tasks from `source` until it is empty.
/// The first error drops the remaining workers and is returned.
async fn run_workers<F, Fut>(source: TaskSource, workers: usize, transfer: F) -> Result<usize>
where
    F: Fn(TransferTask) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let source = Mutex::new(source);
    let transfer = &transfer;
    let source = &source;

    let worker = |_id: usize| async move {
        let mut done = 0usize;
        loop {
            let next = source.lock().await.next().await;
            match next {
                Some(task) => {
                    transfer(task?).await?;
                    done += 1;
                }
                None => return Ok::<usize, NodeStateError>(done),
            }
        }
    };

    let counts = futures::future::try_join_all((0..workers.max(1)).map(worker)).await?;
    Ok(counts.into_iter().sum())
}

/// Walks `root` on a blocking thread, emitting one task per regular file.
/// Directories are descended and symlinks skipped. The walk stops as soon as
/// the receiver is dropped.
fn spawn_walk(root: PathBuf, prefix: String) -> mpsc::Receiver<Result<TransferTask>> {
    let (tx, rx) = mpsc::channel(WALK_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || {
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    let _ = tx.blocking_send(Err(NodeStateError::from(e).context(format!("read {}", dir.display()))));
                    return;
                }
            };
            let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
            paths.sort();
            for path in paths {
                let meta = match std::fs::symlink_metadata(&path) {
                    Ok(meta) => meta,
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e.into()));
                        return;
                    }
                };
                if meta.file_type().is_symlink() {
                    continue;
                }
                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }
                let task = path
                    .strip_prefix(&root)
                    .map_err(|e| NodeStateError::validation(e.to_string()))
                    .map(|rel| TransferTask {
                        key: join_key(&prefix, &slash_path(rel)),
                        path: path.clone(),
                    });
                if tx.blocking_send(task).is_err() {
                    return;
                }
            }
        }
    });
    rx
}

fn slash_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Maps a relative key onto `dir`, refusing to escape it.
fn local_path(dir: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(NodeStateError::validation(format!(
            "object key segment '{relative}' escapes the destination directory"
        )));
    }
    Ok(dir.join(rel))
}
