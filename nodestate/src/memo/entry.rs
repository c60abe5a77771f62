//! Cache entries and cache keys.

use crate::core::Outputs;
use crate::errors::{NodeStateError, Result, ValidationError};
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Rejects keys that are not `[a-zA-Z0-9][-a-zA-Z0-9]*`.
pub fn validate_cache_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new(format!(
            "invalid cache key '{key}': must match [a-zA-Z0-9][-a-zA-Z0-9]*"
        ))
        .with_field("key")
        .into())
    }
}

/// Derives a valid cache key from content: its hex SHA-256.
#[must_use]
pub fn cache_key_from_content(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Memoized outputs of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Node that produced the outputs.
    #[serde(rename = "nodeID")]
    pub node_id: String,
    /// The memoized outputs.
    #[serde(default)]
    pub outputs: Outputs,
    /// When the entry was written.
    pub creation_timestamp: Timestamp,
    /// When the entry was last read.
    pub last_hit_timestamp: Timestamp,
}

impl CacheEntry {
    /// Creates an entry written and hit at `now`.
    #[must_use]
    pub fn new(node_id: impl Into<String>, outputs: Outputs, now: Timestamp) -> Self {
        Self {
            node_id: node_id.into(),
            outputs,
            creation_timestamp: now,
            last_hit_timestamp: now,
        }
    }

    /// Records a hit, never moving the hit time before creation.
    pub fn touch(&mut self, now: Timestamp) {
        self.last_hit_timestamp = now.max(self.creation_timestamp);
    }

    /// True when the entry has not been hit for longer than `ttl`.
    #[must_use]
    pub fn is_idle_longer_than(&self, now: Timestamp, ttl: Duration) -> bool {
        (now - self.last_hit_timestamp)
            .to_std()
            .is_ok_and(|idle| idle > ttl)
    }

    pub(crate) fn decode(key: &str, raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| {
            NodeStateError::validation(format!("cache entry '{key}' is malformed: {e}"))
        })
    }

    pub(crate) fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> Timestamp {
        chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_key_validation() {
        for good in ["a", "0", "abc-123", "A-b-C", "x--y"] {
            assert!(validate_cache_key(good).is_ok(), "{good}");
        }
        for bad in ["", "-a", "a_b", "a.b", "a b", "ü"] {
            assert!(validate_cache_key(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_content_key_is_valid() {
        let key = cache_key_from_content(b"inputs");
        assert_eq!(key.len(), 64);
        assert!(validate_cache_key(&key).is_ok());
        assert_eq!(key, cache_key_from_content(b"inputs"));
    }

    #[test]
    fn test_wire_field_names() {
        let entry = CacheEntry::new("n1", Outputs::new().with_parameter("p", "v"), t0());
        let json: serde_json::Value = serde_json::from_str(&entry.encode().unwrap()).unwrap();
        assert_eq!(json["nodeID"], "n1");
        assert!(json.get("creationTimestamp").is_some());
        assert!(json.get("lastHitTimestamp").is_some());
        assert_eq!(CacheEntry::decode("k", &entry.encode().unwrap()).unwrap(), entry);
    }

    #[test]
    fn test_idle_and_touch() {
        let mut entry = CacheEntry::new("n1", Outputs::new(), t0());
        let five_min = Duration::from_secs(300);
        assert!(!entry.is_idle_longer_than(t0() + chrono::Duration::minutes(5), five_min));
        assert!(entry.is_idle_longer_than(t0() + chrono::Duration::minutes(6), five_min));

        entry.touch(t0() - chrono::Duration::minutes(1));
        assert_eq!(entry.last_hit_timestamp, entry.creation_timestamp);
        entry.touch(t0() + chrono::Duration::minutes(2));
        assert!(!entry.is_idle_longer_than(t0() + chrono::Duration::minutes(6), five_min));
    }
}
