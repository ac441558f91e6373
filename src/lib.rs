//! Enrichment Gateway - adaptive request optimization for rate-limited
//! cultural-data APIs
//!
//! Persona generation fans out many small enrichment calls against an
//! upstream with a tight request budget, variable latency and partial
//! reliability. This crate is the self-regulating layer between the two:
//! - cache: coarse-keyed TTL/LRU caching of enrichment results
//! - resilience: per-category circuit breakers and retry with backoff
//! - optimizer: one execution pipeline (cache, dedup, admission, timeout)
//! - batcher: groups small same-category calls into scheduling units
//! - preloader: demand-driven background cache warming
//! - monitor: rolling metric snapshots, alerts and trends
//! - tuner: closes the loop with small, reversible knob adjustments
//!
//! Everything is wired through [`EnrichmentService`]; applications inject
//! an [`EnrichmentFetcher`] and never talk to the internals directly.

pub mod batcher;
pub mod cache;
pub mod config;
pub mod error;
pub mod monitor;
pub mod optimizer;
pub mod preloader;
pub mod resilience;
pub mod service;
pub mod tuner;
pub mod upstream;

// Re-export commonly used types for easy access
pub use batcher::{BatcherStats, RequestBatcher};
pub use cache::{enrichment_key, CacheStats, ResponseCache};
pub use config::{
    AlertThresholds, BatcherConfig, CacheConfig, CircuitBreakerConfig, GatewayConfig,
    MonitorConfig, OptimizerConfig, PreloaderConfig, RetryConfig, TunerConfig,
};
pub use error::{Error, FailureClass, Result};
pub use monitor::{
    AlertSeverity, MetricSnapshot, Monitor, MonitorStats, PerformanceAlert, Trend, TrendReport,
};
pub use optimizer::{ExecutionConstraints, OptimizerStats, Priority, RequestOptimizer};
pub use preloader::{Preloader, PreloaderStats, UsagePattern};
pub use resilience::{BreakerRegistry, BreakerStats, CircuitBreaker, CircuitState};
pub use service::{DashboardSnapshot, EnrichmentService};
pub use tuner::{AutoTuner, TunerStats};
pub use upstream::{DemographicParams, EnrichmentFetcher, FnFetcher};
