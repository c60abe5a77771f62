//! Configuration for the node-state layer.
//!
//! Every component takes its configuration by construction. [`LayerConfig`]
//! aggregates them and is the only place that reads the process environment.

use crate::errors::{NodeStateError, Result};
use crate::observability::LogFormat;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable forcing node status offload.
pub const ENV_ALWAYS_OFFLOAD: &str = "ALWAYS_OFFLOAD_NODE_STATUS";
/// Environment variable holding an extra transient-error regex.
pub const ENV_TRANSIENT_ERROR_PATTERN: &str = "TRANSIENT_ERROR_PATTERN";
/// Environment variable overriding the inline node status ceiling.
pub const ENV_MAX_INLINED_BYTES: &str = "MAX_INLINED_NODE_STATUS_BYTES";
/// Environment variable overriding the cache reaper period.
pub const ENV_CACHE_GC_PERIOD: &str = "CACHE_GC_PERIOD";
/// Environment variable overriding the step worker count.
pub const ENV_STEP_WORKERS: &str = "STEP_WORKERS";
/// Environment variable selecting the log format.
pub const ENV_LOG_FORMAT: &str = "NODESTATE_LOG_FORMAT";

/// Directory transfer options for object stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// Allow parallel transfers.
    #[serde(default = "default_enable_parallelism")]
    pub enable_parallelism: bool,
    /// Below this many files, transfer sequentially.
    #[serde(default = "default_file_count_threshold")]
    pub file_count_threshold: usize,
    /// Worker count when parallel.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_enable_parallelism() -> bool {
    true
}

fn default_file_count_threshold() -> usize {
    5
}

fn default_parallelism() -> usize {
    3
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enable_parallelism: default_enable_parallelism(),
            file_count_threshold: default_file_count_threshold(),
            parallelism: default_parallelism(),
        }
    }
}

impl TransferConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables parallelism.
    #[must_use]
    pub fn with_parallelism_enabled(mut self, enabled: bool) -> Self {
        self.enable_parallelism = enabled;
        self
    }

    /// Sets the file count threshold.
    #[must_use]
    pub fn with_file_count_threshold(mut self, threshold: usize) -> Self {
        self.file_count_threshold = threshold;
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Number of workers to use for `task_count` files.
    #[must_use]
    pub fn workers_for(&self, task_count: usize) -> usize {
        if self.enable_parallelism && task_count >= self.file_count_threshold {
            self.parallelism.max(1).min(task_count.max(1))
        } else {
            1
        }
    }
}

/// Node status hydrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HydratorConfig {
    /// Largest encoded `compressedNodes` kept on the workflow.
    ///
    /// The limit applies to the base64 text of the gzipped node JSON, not to
    /// the raw JSON, so a very small ceiling offloads even tiny node maps.
    #[serde(default = "default_max_inlined_bytes")]
    pub max_inlined_bytes: usize,
    /// Always offload, even when the compressed nodes would fit.
    #[serde(default)]
    pub always_offload: bool,
    /// Retry policy for reads from the offload repository.
    #[serde(default = "default_hydrate_retry")]
    pub retry: RetryPolicy,
}

fn default_max_inlined_bytes() -> usize {
    1024 * 1024
}

fn default_hydrate_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(5)
        .with_deadline(Duration::from_secs(60))
}

impl Default for HydratorConfig {
    fn default() -> Self {
        Self {
            max_inlined_bytes: default_max_inlined_bytes(),
            always_offload: false,
            retry: default_hydrate_retry(),
        }
    }
}

impl HydratorConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the inline ceiling.
    #[must_use]
    pub fn with_max_inlined_bytes(mut self, bytes: usize) -> Self {
        self.max_inlined_bytes = bytes;
        self
    }

    /// Forces offloading.
    #[must_use]
    pub fn with_always_offload(mut self, always: bool) -> Self {
        self.always_offload = always;
        self
    }

    /// Sets the repository read retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Memoization cache and reaper configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Reaper cycle period.
    #[serde(default = "default_gc_period_ms")]
    pub gc_period_ms: u64,
    /// Full list+resync period for the reaper's watch.
    #[serde(default = "default_resync_period_ms")]
    pub resync_period_ms: u64,
    /// Save attempts on resource-version conflicts.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: usize,
}

fn default_gc_period_ms() -> u64 {
    10_000
}

fn default_resync_period_ms() -> u64 {
    20 * 60 * 1000
}

fn default_conflict_retries() -> usize {
    3
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gc_period_ms: default_gc_period_ms(),
            resync_period_ms: default_resync_period_ms(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

impl CacheConfig {
    /// Sets the reaper period.
    #[must_use]
    pub fn with_gc_period(mut self, period: Duration) -> Self {
        self.gc_period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Reaper period as a Duration.
    #[must_use]
    pub fn gc_period(&self) -> Duration {
        Duration::from_millis(self.gc_period_ms)
    }

    /// Resync period as a Duration.
    #[must_use]
    pub fn resync_period(&self) -> Duration {
        Duration::from_millis(self.resync_period_ms)
    }
}

/// External step executor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutorConfig {
    /// Number of queue workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Request deadline when a step sets none.
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Retry policy for transient request failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_workers() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

impl Default for StepExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            default_timeout_ms: default_request_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl StepExecutorConfig {
    /// Sets the worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Default request deadline.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Pod log multiplexer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMultiplexerConfig {
    /// Capacity of the unsorted entry channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Drain window.
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// Lines longer than this are split.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Delay before re-establishing a closed watch.
    #[serde(default = "default_rewatch_delay_ms")]
    pub rewatch_delay_ms: u64,
}

fn default_channel_capacity() -> usize {
    128
}

fn default_drain_interval_ms() -> u64 {
    1000
}

fn default_max_line_bytes() -> usize {
    1024 * 1024
}

fn default_rewatch_delay_ms() -> u64 {
    1000
}

impl Default for LogMultiplexerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            drain_interval_ms: default_drain_interval_ms(),
            max_line_bytes: default_max_line_bytes(),
            rewatch_delay_ms: default_rewatch_delay_ms(),
        }
    }
}

impl LogMultiplexerConfig {
    /// Sets the drain window.
    #[must_use]
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the delay before a failed watch is opened again.
    #[must_use]
    pub fn with_rewatch_delay(mut self, delay: Duration) -> Self {
        self.rewatch_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Drain window as a Duration.
    #[must_use]
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Watch re-establish delay as a Duration.
    #[must_use]
    pub fn rewatch_delay(&self) -> Duration {
        Duration::from_millis(self.rewatch_delay_ms)
    }
}

/// Aggregate configuration for every component.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Hydrator.
    #[serde(default)]
    pub hydrator: HydratorConfig,
    /// Default directory transfer options.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Artifact operation retry policy.
    #[serde(default)]
    pub artifact_retry: RetryPolicy,
    /// Cache and reaper.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Step executor.
    #[serde(default)]
    pub steps: StepExecutorConfig,
    /// Log multiplexer.
    #[serde(default)]
    pub logs: LogMultiplexerConfig,
    /// Extra regex for transient errors.
    #[serde(default)]
    pub transient_error_pattern: Option<String>,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl LayerConfig {
    /// Builds a configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_ALWAYS_OFFLOAD) {
            config.hydrator.always_offload = parse_bool(ENV_ALWAYS_OFFLOAD, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_INLINED_BYTES) {
            config.hydrator.max_inlined_bytes = value.trim().parse().map_err(|_| {
                NodeStateError::validation(format!("{ENV_MAX_INLINED_BYTES}: invalid size '{value}'"))
            })?;
        }
        if let Some(value) = lookup(ENV_TRANSIENT_ERROR_PATTERN) {
            if !value.is_empty() {
                regex::Regex::new(&value).map_err(|e| {
                    NodeStateError::validation(format!("{ENV_TRANSIENT_ERROR_PATTERN}: {e}"))
                })?;
                config.transient_error_pattern = Some(value);
            }
        }
        if let Some(value) = lookup(ENV_CACHE_GC_PERIOD) {
            let period = crate::memo::parse_duration(&value)
                .map_err(|e| e.context(ENV_CACHE_GC_PERIOD))?;
            config.cache = config.cache.with_gc_period(period);
        }
        if let Some(value) = lookup(ENV_STEP_WORKERS) {
            let workers: usize = value.trim().parse().map_err(|_| {
                NodeStateError::validation(format!("{ENV_STEP_WORKERS}: invalid count '{value}'"))
            })?;
            config.steps = config.steps.with_workers(workers);
        }
        if let Some(value) = lookup(ENV_LOG_FORMAT) {
            config.log_format = value.parse()?;
        }

        Ok(config)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        _ => Err(NodeStateError::validation(format!(
            "{name}: expected true or false, got '{value}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_transfer_defaults() {
        let config = TransferConfig::default();
        assert!(config.enable_parallelism);
        assert_eq!(config.file_count_threshold, 5);
        assert_eq!(config.parallelism, 3);
    }

    #[test]
    fn test_workers_for() {
        let config = TransferConfig::default();
        assert_eq!(config.workers_for(4), 1);
        assert_eq!(config.workers_for(5), 3);
        assert_eq!(config.workers_for(100), 3);
        assert_eq!(config.with_parallelism(10).workers_for(6), 6);
        assert_eq!(config.with_parallelism_enabled(false).workers_for(100), 1);
    }

    #[test]
    fn test_transfer_config_partial_json() {
        let config: TransferConfig = serde_json::from_str(r#"{"parallelism": 8}"#).unwrap();
        assert_eq!(config.parallelism, 8);
        assert_eq!(config.file_count_threshold, 5);
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = LayerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, LayerConfig::default());
        assert!(!config.hydrator.always_offload);
        assert_eq!(config.cache.gc_period(), Duration::from_secs(10));
        assert_eq!(config.logs.channel_capacity, 128);
    }

    #[test]
    fn test_from_lookup_binds_variables() {
        let config = LayerConfig::from_lookup(lookup(&[
            (ENV_ALWAYS_OFFLOAD, "true"),
            (ENV_TRANSIENT_ERROR_PATTERN, "connection refused"),
            (ENV_MAX_INLINED_BYTES, "2048"),
            (ENV_CACHE_GC_PERIOD, "1m"),
            (ENV_STEP_WORKERS, "4"),
            (ENV_LOG_FORMAT, "json"),
        ]))
        .unwrap();

        assert!(config.hydrator.always_offload);
        assert_eq!(config.hydrator.max_inlined_bytes, 2048);
        assert_eq!(config.transient_error_pattern.as_deref(), Some("connection refused"));
        assert_eq!(config.cache.gc_period(), Duration::from_secs(60));
        assert_eq!(config.steps.workers, 4);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        assert!(LayerConfig::from_lookup(lookup(&[(ENV_ALWAYS_OFFLOAD, "maybe")])).is_err());
        assert!(LayerConfig::from_lookup(lookup(&[(ENV_TRANSIENT_ERROR_PATTERN, "(")])).is_err());
        assert!(LayerConfig::from_lookup(lookup(&[(ENV_STEP_WORKERS, "many")])).is_err());
    }
}
