//! Bounded, deduplicating work queue.

use super::{StepKey, StepWorkItem};
use crate::errors::{NodeStateError, Result};
use crate::sync::ConcurrentMap;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Queue of step items where each key is queued or running at most once.
///
/// A key is claimed by [`WorkQueue::add`] and released by
/// [`WorkQueue::done`]; adds of a claimed key are no-ops.
pub struct WorkQueue {
    sender: mpsc::Sender<StepWorkItem>,
    receiver: Mutex<mpsc::Receiver<StepWorkItem>>,
    claimed: ConcurrentMap<StepKey, ()>,
}

impl WorkQueue {
    /// Creates a queue holding up to `capacity` waiting items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
            claimed: ConcurrentMap::new(),
        }
    }

    /// Queues `item` unless its key is already claimed.
    ///
    /// Returns false for duplicates. A full queue is a transient error and
    /// leaves the key unclaimed.
    pub fn add(&self, item: StepWorkItem) -> Result<bool> {
        if !self.claim(&item.key) {
            debug!(key = %item.key, "Step already queued");
            return Ok(false);
        }
        self.push_claimed(item)?;
        Ok(true)
    }

    /// Claims `key` without queueing anything. Returns false if it was
    /// already claimed.
    ///
    /// The caller either queues the item with [`WorkQueue::push_claimed`] or
    /// releases the key with [`WorkQueue::done`].
    pub fn claim(&self, key: &StepKey) -> bool {
        !self.claimed.load_or_store(key.clone(), ()).1
    }

    /// Queues an item whose key the caller claimed. On failure the key is
    /// released.
    pub fn push_claimed(&self, item: StepWorkItem) -> Result<()> {
        let key = item.key.clone();
        self.sender.try_send(item).map_err(|e| {
            self.claimed.delete(&key);
            match e {
                mpsc::error::TrySendError::Full(_) => NodeStateError::transient(format!("step queue is full, dropping {key}")),
                mpsc::error::TrySendError::Closed(_) => NodeStateError::cancelled("step queue is closed"),
            }
        })
    }

    /// Puts a claimed item back without releasing its key.
    pub fn requeue(&self, item: StepWorkItem) -> Result<()> {
        let key = item.key.clone();
        self.sender.try_send(item).map_err(|_| {
            self.claimed.delete(&key);
            NodeStateError::transient(format!("could not requeue {key}"))
        })
    }

    /// Waits for the next item.
    pub async fn next(&self) -> Option<StepWorkItem> {
        self.receiver.lock().await.recv().await
    }

    /// Releases `key` after its item finished.
    pub fn done(&self, key: &StepKey) {
        self.claimed.delete(key);
    }

    /// True while `key` is queued or running.
    #[must_use]
    pub fn is_claimed(&self, key: &StepKey) -> bool {
        self.claimed.contains(key)
    }

    /// Number of queued or running items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    /// True when nothing is queued or running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("claimed", &self.claimed.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::steps::{HttpMethod, HttpStep, StepPayload};

    fn item(node: &str) -> StepWorkItem {
        StepWorkItem {
            key: StepKey::new("argo", "wf", node).with_workflow_uid("uid-wf"),
            payload: StepPayload::Http(HttpStep::new(HttpMethod::Get, "http://svc")),
        }
    }

    #[tokio::test]
    async fn test_duplicate_add_is_noop_until_done() {
        let queue = WorkQueue::new(4);
        assert!(queue.add(item("n1")).unwrap());
        assert!(!queue.add(item("n1")).unwrap());
        assert!(queue.add(item("n2")).unwrap());
        assert_eq!(queue.len(), 2);

        let first = queue.next().await.unwrap();
        assert_eq!(first.key.node_id, "n1");
        assert!(!queue.add(item("n1")).unwrap(), "running keys stay claimed");

        queue.done(&first.key);
        assert!(queue.add(item("n1")).unwrap());
    }

    #[tokio::test]
    async fn test_full_queue_is_transient_and_unclaims() {
        let queue = WorkQueue::new(1);
        tokio_test::assert_ok!(queue.add(item("n1")));
        let err = tokio_test::assert_err!(queue.add(item("n2")));
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(!queue.is_claimed(&StepKey::new("argo", "wf", "n2").with_workflow_uid("uid-wf")));
    }

    #[tokio::test]
    async fn test_claim_then_push() {
        let queue = WorkQueue::new(2);
        let key = item("n1").key;
        assert!(queue.claim(&key));
        assert!(!queue.claim(&key));
        assert!(!queue.add(item("n1")).unwrap());

        tokio_test::assert_ok!(queue.push_claimed(item("n1")));
        assert_eq!(queue.next().await.unwrap().key, key);
        queue.done(&key);
        assert!(!queue.is_claimed(&key));
    }

    #[tokio::test]
    async fn test_requeue_keeps_claim() {
        let queue = WorkQueue::new(2);
        queue.add(item("n1")).unwrap();
        let taken = queue.next().await.unwrap();
        queue.requeue(taken.clone()).unwrap();
        assert!(queue.is_claimed(&taken.key));
        assert_eq!(queue.next().await.unwrap(), taken);
    }
}
