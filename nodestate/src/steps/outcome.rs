//! Process-local store of finished step outcomes.

use super::{Outcome, StepKey};
use crate::sync::ConcurrentMap;

/// Outcomes waiting to be consumed by the reconciler.
///
/// Entries outlive the worker that produced them and are removed when taken.
/// Nothing survives a restart; the reconciler re-enqueues still-pending nodes.
#[derive(Debug, Default)]
pub struct OutcomeStore {
    outcomes: ConcurrentMap<StepKey, Outcome>,
}

impl OutcomeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of `key`, replacing any unconsumed one.
    pub fn record(&self, key: StepKey, outcome: Outcome) {
        self.outcomes.store(key, outcome);
    }

    /// Removes and returns the outcome of `key`.
    pub fn take(&self, key: &StepKey) -> Option<Outcome> {
        self.outcomes.load_and_delete(key)
    }

    /// True if an outcome for `key` waits.
    #[must_use]
    pub fn contains(&self, key: &StepKey) -> bool {
        self.outcomes.contains(key)
    }

    /// Number of unconsumed outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// True if nothing waits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}
