//! Memoization of step outputs.
//!
//! A cache is a named, labelled key-value object whose data map holds one
//! JSON [`CacheEntry`] per cache key. [`MemoizationCache`] reads and writes
//! entries, [`CacheFactory`] shares cache instances between callers, and
//! [`CacheReaper`] evicts entries that have not been hit for longer than the
//! object's `cache-gc-after-not-hit-duration` label.
//!
//! Cache failures are never fatal to the reconcile loop: callers use
//! [`MemoizationCache::load_or_miss`] and [`MemoizationCache::save_best_effort`].

mod cache;
mod duration;
mod entry;
mod factory;
mod reaper;

pub use cache::MemoizationCache;
pub use duration::parse_duration;
pub use entry::{cache_key_from_content, validate_cache_key, CacheEntry};
pub use factory::CacheFactory;
pub use reaper::{CacheReaper, ReapStats};

/// Label identifying the kind of a key-value object.
pub const CONFIGMAP_TYPE_LABEL: &str = "workflows.nodestate.io/configmap-type";
/// Value of [`CONFIGMAP_TYPE_LABEL`] for memoization caches.
pub const CONFIGMAP_TYPE_CACHE: &str = "Cache";
/// Label holding the idle duration after which entries are reaped.
pub const GC_AFTER_NOT_HIT_LABEL: &str = "workflows.nodestate.io/cache-gc-after-not-hit-duration";
