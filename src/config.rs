//! Configuration knobs for the enrichment gateway
//!
//! All tunable behavior is expressed as named numeric/boolean knobs
//! supplied at construction. Durations serialize in human-readable form
//! ("30s", "5m") for config files and the debug dashboard.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub cache: CacheConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub optimizer: OptimizerConfig,
    pub batcher: BatcherConfig,
    pub preloader: PreloaderConfig,
    pub monitor: MonitorConfig,
    pub tuner: TunerConfig,
}

impl GatewayConfig {
    /// Validate cross-field constraints before construction
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_entries == 0 {
            return Err(Error::Config("cache.max_entries must be > 0".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "breaker.failure_threshold must be > 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be > 0".into()));
        }
        if self.optimizer.max_concurrent == 0 {
            return Err(Error::Config(
                "optimizer.max_concurrent must be > 0".into(),
            ));
        }
        if self.optimizer.min_timeout > self.optimizer.max_timeout {
            return Err(Error::Config(
                "optimizer.min_timeout exceeds optimizer.max_timeout".into(),
            ));
        }
        if self.optimizer.timeout_safety_factor < 1.0 {
            return Err(Error::Config(
                "optimizer.timeout_safety_factor must be >= 1.0".into(),
            ));
        }
        if self.batcher.max_batch_size == 0 || self.batcher.max_concurrent_batches == 0 {
            return Err(Error::Config(
                "batcher sizes must be > 0".into(),
            ));
        }
        if self.tuner.concurrency_floor > self.tuner.concurrency_ceiling {
            return Err(Error::Config(
                "tuner.concurrency_floor exceeds tuner.concurrency_ceiling".into(),
            ));
        }
        if !(self.tuner.concurrency_floor..=self.tuner.concurrency_ceiling)
            .contains(&self.optimizer.max_concurrent)
        {
            return Err(Error::Config(
                "optimizer.max_concurrent outside tuner bounds".into(),
            ));
        }
        Ok(())
    }
}

/// Cache layer knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction kicks in
    pub max_entries: usize,
    /// TTL applied when the caller does not supply one
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// How often the background sweep reclaims expired entries
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 2_000,
            default_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker knobs, shared by every per-category breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe
    #[serde(with = "humantime_serde")]
    pub cool_down: Duration,
    /// Cool-down multiplier applied when a half-open probe fails
    pub cool_down_extension: f64,
    /// Upper bound on the extended cool-down
    #[serde(with = "humantime_serde")]
    pub max_cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            cool_down_extension: 2.0,
            max_cool_down: Duration::from_secs(5 * 60),
        }
    }
}

/// Retry controller knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per admitted call (first try included)
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap on the computed backoff delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor (0.0 to 1.0) applied on top of the backoff
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.3,
        }
    }
}

/// Execution optimizer knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Concurrency limit for upstream calls (tuner-adjustable at runtime)
    pub max_concurrent: usize,
    /// Admission waiters beyond this are rejected with a capacity error
    pub max_queue_depth: usize,
    /// Number of latency samples retained per category
    pub latency_window: usize,
    /// Multiplier applied to the p95 latency when deriving the timeout
    pub timeout_safety_factor: f64,
    /// Lower clamp for the adaptive timeout; also the no-history fallback
    #[serde(with = "humantime_serde")]
    pub min_timeout: Duration,
    /// Upper clamp for the adaptive timeout
    #[serde(with = "humantime_serde")]
    pub max_timeout: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            max_queue_depth: 256,
            latency_window: 100,
            timeout_safety_factor: 1.5,
            min_timeout: Duration::from_secs(2),
            max_timeout: Duration::from_secs(20),
        }
    }
}

/// Request batcher knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// A bucket flushes as soon as it holds this many requests
    pub max_batch_size: usize,
    /// A bucket flushes when this much time passes after its first request
    #[serde(with = "humantime_serde")]
    pub batch_window: Duration,
    /// Global cap on buckets executing at once; excess flushes wait
    pub max_concurrent_batches: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            batch_window: Duration::from_millis(50),
            max_concurrent_batches: 3,
        }
    }
}

/// Preloader knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloaderConfig {
    /// Whether the preload loop starts enabled
    pub enabled: bool,
    /// Observations of a signature before it becomes a candidate
    pub usage_threshold: u64,
    /// Fixed interval between preload cycles
    #[serde(with = "humantime_serde")]
    pub cycle_interval: Duration,
    /// Candidates issued per cycle (tuner-adjustable at runtime)
    pub max_concurrent_preloads: usize,
    /// Result count requested per speculative fetch
    pub preload_result_count: usize,
    /// Bound on candidates considered in one cycle
    pub max_candidates: usize,
    /// Usage patterns idle longer than this are pruned
    #[serde(with = "humantime_serde")]
    pub pattern_retention: Duration,
    /// Half-life of the recency component of the priority score
    #[serde(with = "humantime_serde")]
    pub recency_half_life: Duration,
    /// Skip the cycle entirely when the admission queue is deeper than this
    pub max_queue_depth: usize,
    /// Halve preload concurrency when cache memory exceeds this estimate
    pub memory_soft_limit_bytes: u64,
}

impl Default for PreloaderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            usage_threshold: 3,
            cycle_interval: Duration::from_secs(30),
            max_concurrent_preloads: 2,
            preload_result_count: 10,
            max_candidates: 32,
            pattern_retention: Duration::from_secs(24 * 3600),
            recency_half_life: Duration::from_secs(24 * 3600),
            max_queue_depth: 0,
            memory_soft_limit_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Monitor knobs and alert thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Snapshot sampling interval
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Snapshots older than this are pruned from history
    #[serde(with = "humantime_serde")]
    pub history_retention: Duration,
    /// Hard cap on retained snapshots
    pub max_history: usize,
    /// Latency samples retained per category for snapshot means
    pub latency_window: usize,
    /// Alert thresholds checked against every snapshot
    pub thresholds: AlertThresholds,
    /// A breach beyond threshold x this multiple escalates to CRITICAL
    pub escalation_multiple: f64,
    /// Trailing window for trend classification
    #[serde(with = "humantime_serde")]
    pub trend_window: Duration,
    /// Minimum relative change before a trend counts as a move (0.05 = 5%)
    pub trend_min_change: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(10),
            history_retention: Duration::from_secs(3600),
            max_history: 512,
            latency_window: 256,
            thresholds: AlertThresholds::default(),
            escalation_multiple: 2.0,
            trend_window: Duration::from_secs(300),
            trend_min_change: 0.05,
        }
    }
}

/// Threshold set evaluated against each metric snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub max_mean_latency_ms: f64,
    pub max_error_ratio: f64,
    pub min_cache_hit_ratio: f64,
    pub max_queue_depth: usize,
    pub max_memory_bytes: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_mean_latency_ms: 2_000.0,
            max_error_ratio: 0.25,
            min_cache_hit_ratio: 0.10,
            max_queue_depth: 32,
            max_memory_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Auto-tuner knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerConfig {
    /// Tuning cycle interval
    #[serde(with = "humantime_serde")]
    pub cycle_interval: Duration,
    /// Concurrency adjustment applied per decision
    pub concurrency_step: usize,
    /// Tuner never lowers the concurrency limit below this
    pub concurrency_floor: usize,
    /// Tuner never raises the concurrency limit above this
    pub concurrency_ceiling: usize,
    /// Consecutive under-loaded checks required before any increase
    pub underload_checks_required: u32,
    /// Mean latency below this counts as under-loaded
    pub underload_latency_ms: f64,
    /// Memory estimate below this counts as under-loaded
    pub underload_memory_bytes: u64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(30),
            concurrency_step: 1,
            concurrency_floor: 2,
            concurrency_ceiling: 16,
            underload_checks_required: 3,
            underload_latency_ms: 300.0,
            underload_memory_bytes: 16 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = GatewayConfig::default();
        config.optimizer.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_timeout_bounds() {
        let mut config = GatewayConfig::default();
        config.optimizer.min_timeout = Duration::from_secs(30);
        config.optimizer.max_timeout = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_concurrency_outside_tuner_bounds() {
        let mut config = GatewayConfig::default();
        config.optimizer.max_concurrent = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn durations_roundtrip_as_humantime() {
        let config = GatewayConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"30s\""));
        let back: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.breaker.cool_down, config.breaker.cool_down);
    }
}
