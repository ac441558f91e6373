//! Request execution optimizer
//!
//! Orchestrates one logical upstream call: cache lookup, in-flight
//! deduplication, circuit check, FIFO admission, adaptive timeout, retry
//! with backoff, and cache population. Side effects are confined to the
//! four maps this module owns: the cache handle, the in-flight table,
//! the breaker registry and the admission counter.

pub mod admission;
pub mod inflight;
pub mod latency;

use crate::cache::ResponseCache;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::monitor::Monitor;
use crate::resilience::{BreakerRegistry, BreakerStats, ProbeSlot, RetryController};
use admission::{AdmissionControl, AdmissionStats};
use futures::future::BoxFuture;
use futures::FutureExt;
use inflight::{waiter_outcome, Attachment, InflightTable};
use latency::{CategoryLatencyStats, LatencyTracker};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Scheduling priority for a logical request
///
/// A soft ordering hint: the batcher flushes higher-priority buckets
/// first under contention and the preloader always submits at `Low`.
/// Admission itself stays FIFO.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Per-call execution constraints
#[derive(Debug, Clone, Default)]
pub struct ExecutionConstraints {
    /// Overrides the adaptive timeout when set
    pub timeout: Option<Duration>,
    /// Overrides the configured retry bound when set
    pub max_retries: Option<u32>,
    pub priority: Priority,
}

impl ExecutionConstraints {
    pub fn low_priority() -> Self {
        Self {
            priority: Priority::Low,
            ..Default::default()
        }
    }
}

/// Optimizer statistics for the observability boundary
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStats {
    pub executions: u64,
    pub upstream_calls: u64,
    pub dedup_hits: u64,
    pub in_flight: usize,
    pub admission: AdmissionStats,
    pub breakers: Vec<BreakerStats>,
    pub latency: Vec<CategoryLatencyStats>,
}

/// Orchestrates logical enrichment calls against the upstream budget
pub struct RequestOptimizer<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    cache: Arc<ResponseCache<V>>,
    inflight: InflightTable<V>,
    breakers: BreakerRegistry,
    retry: RetryController,
    latency: LatencyTracker,
    admission: Arc<AdmissionControl>,
    monitor: Arc<Monitor>,
    config: crate::config::OptimizerConfig,
    executions: AtomicU64,
    upstream_calls: AtomicU64,
}

impl<V> RequestOptimizer<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    pub fn new(config: &GatewayConfig, cache: Arc<ResponseCache<V>>, monitor: Arc<Monitor>) -> Self {
        Self {
            cache,
            inflight: InflightTable::new(),
            breakers: BreakerRegistry::new(config.breaker.clone()),
            retry: RetryController::new(config.retry.clone()),
            latency: LatencyTracker::new(config.optimizer.latency_window),
            admission: Arc::new(AdmissionControl::new(
                config.optimizer.max_concurrent,
                config.optimizer.max_queue_depth,
            )),
            monitor,
            config: config.optimizer.clone(),
            executions: AtomicU64::new(0),
            upstream_calls: AtomicU64::new(0),
        }
    }

    /// Execute one logical call for `key`.
    ///
    /// `work` produces the upstream future and may be invoked multiple
    /// times by the retry controller. Deduplicated callers never invoke
    /// it; they receive the leader's settled outcome.
    pub async fn execute<F>(
        &self,
        key: &str,
        category: &str,
        constraints: ExecutionConstraints,
        mut work: F,
    ) -> Result<V>
    where
        F: FnMut() -> BoxFuture<'static, Result<V>> + Send,
    {
        self.executions.fetch_add(1, Ordering::Relaxed);

        if let Some(value) = self.cache.get(key) {
            self.monitor.record_request(category, 0.0, true, true);
            return Ok(value);
        }

        let guard = match self.inflight.attach(key) {
            Attachment::Waiter(mut rx) => {
                log::debug!("joining in-flight request for '{}'", key);
                return waiter_outcome(rx.recv().await, key);
            }
            Attachment::Leader(guard) => guard,
        };

        let outcome = self.run_leader(category, &constraints, &mut work).await;

        // The in-flight marker is removed before the entry materializes:
        // a key is either being produced or cached, never both.
        guard.settle(outcome.clone());
        if let Ok(value) = &outcome {
            self.cache.insert(key, value.clone());
        }
        outcome
    }

    async fn run_leader<F>(
        &self,
        category: &str,
        constraints: &ExecutionConstraints,
        work: &mut F,
    ) -> Result<V>
    where
        F: FnMut() -> BoxFuture<'static, Result<V>> + Send,
    {
        let breaker = self.breakers.get(category);
        let grant = breaker.check_admit()?;
        // Held across every await below; a probe that never reaches the
        // upstream, including a cancelled one, frees its slot on drop.
        let _probe_slot = ProbeSlot::new(&breaker, grant.probe);

        let permit = match self.admission.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                log::debug!(
                    "admission rejected {:?}-priority call for '{}': {}",
                    constraints.priority,
                    category,
                    e
                );
                return Err(e);
            }
        };

        let timeout = constraints
            .timeout
            .unwrap_or_else(|| self.latency.adaptive_timeout(category, &self.config));

        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = self
            .retry
            .run(constraints.max_retries, || {
                let attempt = work();
                async move {
                    match tokio::time::timeout(timeout, attempt).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(crate::error::Error::Timeout(timeout)),
                    }
                }
                .boxed()
            })
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        drop(permit);

        self.latency.record(category, elapsed_ms);
        match &result {
            Ok(_) => {
                breaker.record_success();
                self.monitor.record_request(category, elapsed_ms, true, false);
            }
            Err(e) => {
                if e.counts_against_breaker() {
                    breaker.record_failure();
                }
                self.monitor
                    .record_request(category, elapsed_ms, false, false);
            }
        }
        result
    }

    /// Cache handle shared with the preloader's double-check path
    pub fn cache(&self) -> &Arc<ResponseCache<V>> {
        &self.cache
    }

    /// Runtime-adjustable concurrency limit (auto-tuner knob)
    pub fn set_concurrency_limit(&self, limit: usize) {
        log::info!("concurrency limit set to {}", limit.max(1));
        self.admission.set_limit(limit);
    }

    pub fn concurrency_limit(&self) -> usize {
        self.admission.limit()
    }

    /// Current admission queue depth (monitor gauge)
    pub fn queued(&self) -> usize {
        self.admission.queued()
    }

    pub fn stats(&self) -> OptimizerStats {
        OptimizerStats {
            executions: self.executions.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            dedup_hits: self.inflight.dedup_hits(),
            in_flight: self.inflight.len(),
            admission: self.admission.stats(),
            breakers: self.breakers.snapshot(),
            latency: self.latency.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::error::Error;
    use std::sync::atomic::AtomicU32;

    fn build_optimizer(mutate: impl FnOnce(&mut GatewayConfig)) -> RequestOptimizer<u32> {
        let mut config = GatewayConfig::default();
        config.retry.base_delay = Duration::from_millis(5);
        mutate(&mut config);
        let cache = Arc::new(ResponseCache::new(&config.cache));
        let monitor = Arc::new(Monitor::new(MonitorConfig::default()));
        RequestOptimizer::new(&config, cache, monitor)
    }

    #[tokio::test]
    async fn concurrent_identical_keys_share_one_upstream_call() {
        let optimizer = Arc::new(build_optimizer(|_| {}));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let optimizer = optimizer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                optimizer
                    .execute("music:20s:paris:none", "music", Default::default(), move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(41u32)
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 41);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(optimizer.stats().dedup_hits, 2);
    }

    #[tokio::test]
    async fn success_populates_cache_for_next_call() {
        let optimizer = build_optimizer(|_| {});
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let value = optimizer
                .execute("brand:30s:lyon:none", "brand", Default::default(), move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(7u32)
                    }
                    .boxed()
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_upstream_attempt() {
        let optimizer = build_optimizer(|config| {
            config.breaker.failure_threshold = 2;
            config.retry.max_attempts = 1;
        });
        let calls = Arc::new(AtomicU32::new(0));

        for i in 0..2 {
            let calls = calls.clone();
            let result = optimizer
                .execute(&format!("music:k{}", i), "music", Default::default(), move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<u32, _>(Error::Upstream("boom".into()))
                    }
                    .boxed()
                })
                .await;
            assert!(result.is_err());
        }

        let calls_before = calls.load(Ordering::SeqCst);
        let result = optimizer
            .execute("music:k9", "music", Default::default(), move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1u32)
                }
                .boxed()
            })
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen(_))));
        assert_eq!(calls_before, 2);
    }

    #[tokio::test]
    async fn timeout_is_retried_and_recovers() {
        let optimizer = build_optimizer(|_| {});
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let constraints = ExecutionConstraints {
            timeout: Some(Duration::from_millis(40)),
            ..Default::default()
        };
        let value = optimizer
            .execute("music:slow", "music", constraints, move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Ok(5u32)
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let optimizer = build_optimizer(|_| {});
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = optimizer
            .execute("music:bad", "music", Default::default(), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(Error::BadRequest("missing field".into()))
                }
                .boxed()
            })
            .await;

        assert!(matches!(result, Err(Error::BadRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_probe_call_frees_the_breaker() {
        let optimizer = Arc::new(build_optimizer(|config| {
            config.breaker.failure_threshold = 1;
            config.breaker.cool_down = Duration::from_millis(20);
            config.retry.max_attempts = 1;
        }));

        let _ = optimizer
            .execute("music:k0", "music", Default::default(), || {
                async { Err::<u32, _>(Error::Upstream("down".into())) }.boxed()
            })
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Half-open probe hangs upstream; cancel the caller mid-flight
        let probe = {
            let optimizer = optimizer.clone();
            tokio::spawn(async move {
                optimizer
                    .execute("music:k1", "music", Default::default(), || {
                        async {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            Ok(1u32)
                        }
                        .boxed()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        probe.abort();
        let _ = probe.await;

        // The freed probe slot admits the next call, which closes the
        // circuit
        let value = optimizer
            .execute("music:k2", "music", Default::default(), || {
                async { Ok(2u32) }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let optimizer = build_optimizer(|config| {
            config.retry.max_attempts = 1;
        });
        let calls = Arc::new(AtomicU32::new(0));

        for expected in [1u32, 2] {
            let inner = calls.clone();
            let _ = optimizer
                .execute("music:flaky", "music", Default::default(), move || {
                    let calls = inner.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<u32, _>(Error::Upstream("boom".into()))
                    }
                    .boxed()
                })
                .await;
            assert_eq!(calls.load(Ordering::SeqCst), expected);
        }
    }
}
