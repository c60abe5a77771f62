//! A supervised set of tasks keyed by name.

use super::CancellationToken;
use crate::sync::ConcurrentMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A group of tasks where each key runs at most once.
///
/// Every task receives the group's cancellation token; cancelling the group
/// asks all of them to stop. Keys stay claimed after their task finishes, so
/// re-discovering the same key never spawns a second task.
pub struct KeyedTaskGroup {
    /// The cancellation token for this group.
    cancel_token: Arc<CancellationToken>,
    /// Keys that have been claimed.
    claimed: ConcurrentMap<String, ()>,
    /// Handles to spawned tasks.
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl KeyedTaskGroup {
    /// Creates a group with its own token.
    #[must_use]
    pub fn new() -> Self {
        Self::with_token(Arc::new(CancellationToken::new()))
    }

    /// Creates a group driven by an existing token.
    #[must_use]
    pub fn with_token(cancel_token: Arc<CancellationToken>) -> Self {
        Self {
            cancel_token,
            claimed: ConcurrentMap::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel_token
    }

    /// Spawns `task` under `key` unless the key was already claimed.
    ///
    /// Returns true if a task was spawned.
    pub fn spawn_unique<F, Fut>(&self, key: &str, task: F) -> bool
    where
        F: FnOnce(Arc<CancellationToken>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.cancel_token.is_cancelled() {
            return false;
        }
        let (_, already) = self.claimed.load_or_store(key.to_string(), ());
        if already {
            debug!(key = %key, "Task already claimed");
            return false;
        }

        let token = self.cancel_token.clone();
        let handle = tokio::spawn(task(token));
        self.handles.lock().push(handle);
        true
    }

    /// Returns true if `key` has been claimed.
    #[must_use]
    pub fn is_claimed(&self, key: &str) -> bool {
        self.claimed.contains(&key.to_string())
    }

    /// Cancels all tasks in the group.
    pub fn cancel_all(&self, reason: &str) {
        self.cancel_token.cancel(reason);
    }

    /// Waits for every task spawned so far, including ones spawned while waiting.
    pub async fn join_all(&self) {
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Supervised task ended abnormally");
                }
            }
        }
    }

    /// Number of tasks not yet joined.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }
}

impl Default for KeyedTaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyedTaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedTaskGroup")
            .field("task_count", &self.task_count())
            .field("claimed", &self.claimed.len())
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_unique_once_per_key() {
        let group = KeyedTaskGroup::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            group.spawn_unique("pod-a", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let c = counter.clone();
        assert!(group.spawn_unique("pod-b", move |_| async move {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        group.join_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(group.is_claimed("pod-a"));
    }

    #[tokio::test]
    async fn test_key_stays_claimed_after_finish() {
        let group = KeyedTaskGroup::new();
        assert!(group.spawn_unique("pod-a", |_| async {}));
        group.join_all().await;
        assert!(!group.spawn_unique("pod-a", |_| async {}));
    }

    #[tokio::test]
    async fn test_cancel_all_stops_tasks() {
        let group = KeyedTaskGroup::new();
        group.spawn_unique("long", |token| async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
        });

        group.cancel_all("shutdown");
        tokio::time::timeout(Duration::from_secs(1), group.join_all())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_spawn_after_cancel() {
        let group = KeyedTaskGroup::new();
        group.cancel_all("done");
        assert!(!group.spawn_unique("late", |_| async {}));
    }
}
