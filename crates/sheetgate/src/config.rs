//! Pipeline configuration.
//!
//! Every field has a serde default so partial JSON/YAML documents load, and
//! [`GateConfig::validate`] rejects combinations the components cannot honour.

use crate::error::ConfigError;
use crate::resolver::DuplicateHeaderPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Batch window
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// How long the first queued intent waits for others to merge with.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Flush early once this many intents are pending.
    #[serde(default = "default_max_batch_intents")]
    pub max_intents: usize,
    /// Bound of the submission channel.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

const fn default_window_ms() -> u64 {
    50
}

const fn default_max_batch_intents() -> usize {
    500
}

const fn default_queue_capacity() -> usize {
    4096
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_intents: default_max_batch_intents(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl BatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_reads_per_minute")]
    pub reads_per_minute: u32,
    #[serde(default = "default_writes_per_minute")]
    pub writes_per_minute: u32,
    /// Bucket capacity (calls allowed back-to-back from a full bucket).
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// `acquire` fails with `RateLimitTimeout` after waiting this long.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Multiplier applied to the refill rate right after a quota error.
    #[serde(default = "default_throttle_factor")]
    pub throttle_factor: f64,
    /// How long the reduced rate holds before recovery starts.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Length of the linear ramp from the reduced rate back to nominal.
    #[serde(default = "default_restore_ms")]
    pub restore_ms: u64,
}

const fn default_reads_per_minute() -> u32 {
    300
}

const fn default_writes_per_minute() -> u32 {
    60
}

const fn default_burst() -> u32 {
    10
}

const fn default_acquire_timeout_ms() -> u64 {
    30_000
}

const fn default_throttle_factor() -> f64 {
    0.5
}

const fn default_cooldown_ms() -> u64 {
    60_000
}

const fn default_restore_ms() -> u64 {
    30_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            reads_per_minute: default_reads_per_minute(),
            writes_per_minute: default_writes_per_minute(),
            burst: default_burst(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            throttle_factor: default_throttle_factor(),
            cooldown_ms: default_cooldown_ms(),
            restore_ms: default_restore_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn restore(&self) -> Duration {
        Duration::from_millis(self.restore_ms)
    }
}

// ============================================================================
// Retry, dedup, cache, diff
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts for a throttled call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_base_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    16_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given 1-based retry, never below the backend hint.
    pub fn backoff(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let exp = self
            .base_backoff_ms
            .saturating_mul(1u64 << retry.saturating_sub(1).min(20));
        let computed = Duration::from_millis(exp.min(self.max_backoff_ms));
        hint.map_or(computed, |h| h.max(computed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// How long a completed call's result is still shared with identical calls.
    #[serde(default = "default_completed_ttl_ms")]
    pub completed_ttl_ms: u64,
}

const fn default_completed_ttl_ms() -> u64 {
    3_000
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            completed_ttl_ms: default_completed_ttl_ms(),
        }
    }
}

impl DedupConfig {
    pub fn completed_ttl(&self) -> Duration {
        Duration::from_millis(self.completed_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Memory ceiling; LRU eviction starts above it.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// Optional entry-count ceiling, applied in addition to `max_bytes`.
    #[serde(default)]
    pub max_entries: Option<usize>,
}

const fn default_ttl_ms() -> u64 {
    300_000
}

const fn default_max_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_ttl_ms(),
            max_bytes: default_max_bytes(),
            max_entries: None,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Rows captured by a SAMPLE diff.
    #[serde(default = "default_sample_rows")]
    pub sample_rows: u32,
    /// Largest affected-cell estimate that still gets a FULL diff.
    #[serde(default = "default_full_threshold")]
    pub full_threshold_cells: u64,
    /// FULL may not be forced above this without an explicit override.
    #[serde(default = "default_full_ceiling")]
    pub full_ceiling_cells: u64,
    /// Changed cells listed in a diff result.
    #[serde(default = "default_max_listed_changes")]
    pub max_listed_changes: usize,
}

const fn default_sample_rows() -> u32 {
    1_000
}

const fn default_full_threshold() -> u64 {
    10_000
}

const fn default_full_ceiling() -> u64 {
    100_000
}

const fn default_max_listed_changes() -> usize {
    200
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            sample_rows: default_sample_rows(),
            full_threshold_cells: default_full_threshold(),
            full_ceiling_cells: default_full_ceiling(),
            max_listed_changes: default_max_listed_changes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Versions kept across all objects; the least recently used go first.
    #[serde(default = "default_conflict_max_entries")]
    pub max_entries: usize,
    /// A version not refreshed within this long is dropped.
    #[serde(default = "default_conflict_ttl_ms")]
    pub ttl_ms: u64,
}

const fn default_conflict_max_entries() -> usize {
    10_000
}

const fn default_conflict_ttl_ms() -> u64 {
    600_000
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            max_entries: default_conflict_max_entries(),
            ttl_ms: default_conflict_ttl_ms(),
        }
    }
}

impl ConflictConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Committed and rolled-back transactions stay queryable this long.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
}

const fn default_retention_ms() -> u64 {
    600_000
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            retention_ms: default_retention_ms(),
        }
    }
}

impl TransactionConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub duplicate_headers: DuplicateHeaderPolicy,
}

// ============================================================================
// Top level
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub conflicts: ConflictConfig,
    #[serde(default)]
    pub transactions: TransactionConfig,
    /// Live structure is refetched at most this often per object.
    #[serde(default = "default_structure_ttl_ms")]
    pub structure_ttl_ms: u64,
    /// Recorded as the modifier of ConflictVersions produced by our own writes.
    #[serde(default = "default_actor_id")]
    pub actor_id: String,
}

const fn default_structure_ttl_ms() -> u64 {
    2_000
}

fn default_actor_id() -> String {
    "sheetgate".to_string()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            dedup: DedupConfig::default(),
            cache: CacheConfig::default(),
            diff: DiffConfig::default(),
            resolver: ResolverConfig::default(),
            conflicts: ConflictConfig::default(),
            transactions: TransactionConfig::default(),
            structure_ttl_ms: default_structure_ttl_ms(),
            actor_id: default_actor_id(),
        }
    }
}

impl GateConfig {
    /// Short window, small cache: interactive editing sessions.
    pub fn interactive() -> Self {
        Self {
            batch: BatchConfig {
                window_ms: 20,
                max_intents: 100,
                ..Default::default()
            },
            cache: CacheConfig {
                max_bytes: 16 * 1024 * 1024,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Longer window and bigger batches for imports and bulk rewrites.
    pub fn bulk() -> Self {
        Self {
            batch: BatchConfig {
                window_ms: 250,
                max_intents: 5_000,
                queue_capacity: 16_384,
            },
            cache: CacheConfig {
                max_bytes: 256 * 1024 * 1024,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn structure_ttl(&self) -> Duration {
        Duration::from_millis(self.structure_ttl_ms)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: GateConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: GateConfig =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.batch.max_intents == 0 {
            return Err(invalid("batch.max_intents", "must be at least 1"));
        }
        if self.batch.queue_capacity == 0 {
            return Err(invalid("batch.queue_capacity", "must be at least 1"));
        }
        let rl = &self.rate_limit;
        if rl.reads_per_minute == 0 || rl.writes_per_minute == 0 {
            return Err(invalid("rate_limit", "per-minute quotas must be positive"));
        }
        if rl.burst == 0 {
            return Err(invalid("rate_limit.burst", "must be at least 1"));
        }
        if !(rl.throttle_factor > 0.0 && rl.throttle_factor <= 1.0) {
            return Err(invalid(
                "rate_limit.throttle_factor",
                format!("{} is outside (0, 1]", rl.throttle_factor),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        let diff = &self.diff;
        if diff.sample_rows == 0 {
            return Err(invalid("diff.sample_rows", "must be at least 1"));
        }
        if diff.full_ceiling_cells < diff.full_threshold_cells {
            return Err(invalid(
                "diff.full_ceiling_cells",
                "must not be below diff.full_threshold_cells",
            ));
        }
        if self.cache.max_bytes == 0 {
            return Err(invalid("cache.max_bytes", "must be positive"));
        }
        if self.conflicts.max_entries == 0 {
            return Err(invalid("conflicts.max_entries", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = GateConfig::from_json_str(r#"{"batch": {"window_ms": 10}}"#).unwrap();
        assert_eq!(cfg.batch.window(), Duration::from_millis(10));
        assert_eq!(cfg.batch.max_intents, 500);
        assert_eq!(cfg.rate_limit.throttle_factor, 0.5);
        assert_eq!(cfg.diff.sample_rows, 1_000);
        assert_eq!(cfg.conflicts.max_entries, 10_000);
        assert_eq!(cfg.transactions.retention(), Duration::from_secs(600));
    }

    #[test]
    fn zero_conflict_bound_is_rejected() {
        assert!(matches!(
            GateConfig::from_json_str(r#"{"conflicts": {"max_entries": 0}}"#),
            Err(ConfigError::Invalid { field: "conflicts.max_entries", .. })
        ));
    }

    #[test]
    fn yaml_loads_and_validates() {
        let yaml = "rate_limit:\n  writes_per_minute: 120\nresolver:\n  duplicate_headers: reject\n";
        let cfg = GateConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.rate_limit.writes_per_minute, 120);
        assert_eq!(cfg.resolver.duplicate_headers, DuplicateHeaderPolicy::Reject);

        let bad = "rate_limit:\n  throttle_factor: 1.5\n";
        assert!(matches!(
            GateConfig::from_yaml_str(bad),
            Err(ConfigError::Invalid { field: "rate_limit.throttle_factor", .. })
        ));
    }

    #[test]
    fn backoff_grows_and_respects_hint() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(1, None), Duration::from_millis(500));
        assert_eq!(retry.backoff(2, None), Duration::from_millis(1_000));
        assert_eq!(retry.backoff(10, None), Duration::from_millis(16_000));
        assert_eq!(
            retry.backoff(1, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn presets_are_valid() {
        GateConfig::interactive().validate().unwrap();
        GateConfig::bulk().validate().unwrap();
        GateConfig::default().validate().unwrap();
    }
}
