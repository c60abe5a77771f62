//! A concurrent map with atomic insert-if-absent and take-and-remove.
//!
//! The step executor keeps its outcomes in one of these and the log
//! multiplexer tracks streaming pods in another; both rely on the two
//! atomic operations below rather than on check-then-act sequences.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;

/// Concurrent associative container.
#[derive(Debug)]
pub struct ConcurrentMap<K, V>
where
    K: Eq + Hash,
{
    inner: DashMap<K, V>,
}

impl<K, V> Default for ConcurrentMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` if `key` is absent.
    ///
    /// Returns the existing value and `true` when the key was already
    /// present, otherwise the stored value and `false`.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        match self.inner.entry(key) {
            Entry::Occupied(existing) => (existing.get().clone(), true),
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
                (value, false)
            }
        }
    }

    /// Removes and returns the value for `key`.
    pub fn load_and_delete(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    /// Returns a copy of the value for `key`.
    #[must_use]
    pub fn load(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|v| v.clone())
    }

    /// Inserts or replaces the value for `key`.
    pub fn store(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    /// Removes `key`.
    pub fn delete(&self, key: &K) {
        self.inner.remove(key);
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Snapshot of the keys.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_load_or_store() {
        let map = ConcurrentMap::new();
        assert_eq!(map.load_or_store("a", 1), (1, false));
        assert_eq!(map.load_or_store("a", 2), (1, true));
        assert_eq!(map.load(&"a"), Some(1));
    }

    #[test]
    fn test_load_and_delete() {
        let map = ConcurrentMap::new();
        map.store("a".to_string(), 1);
        assert_eq!(map.load_and_delete(&"a".to_string()), Some(1));
        assert_eq!(map.load_and_delete(&"a".to_string()), None);
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_load_or_store_single_winner() {
        let map = Arc::new(ConcurrentMap::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let map = map.clone();
            handles.push(tokio::spawn(async move { map.load_or_store("pod", i).1 }));
        }
        let mut winners = 0;
        for h in handles {
            if !h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
