//! Service wiring, lifecycle and the observability boundary
//!
//! `EnrichmentService` is the single long-lived object applications
//! construct: it owns the cache, optimizer, batcher, preloader, monitor
//! and tuner, spawns their background loops on `start()` and aborts them
//! on `shutdown()`. All dependencies are injected; nothing lives at
//! module scope.

use crate::batcher::{BatcherStats, RequestBatcher};
use crate::cache::{enrichment_key, CacheStats, ResponseCache};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::monitor::{Monitor, MonitorStats};
use crate::optimizer::{ExecutionConstraints, OptimizerStats, Priority, RequestOptimizer};
use crate::preloader::{Preloader, PreloaderStats};
use crate::tuner::{AutoTuner, TunerStats};
use crate::upstream::{DemographicParams, EnrichmentFetcher};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Version tag for the combined dashboard aggregate
const DASHBOARD_SCHEMA_VERSION: u32 = 1;

/// Combined read-only snapshot for the debug dashboard
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub schema_version: u32,
    pub generated_at_ms: u64,
    pub cache: CacheStats,
    pub optimizer: OptimizerStats,
    pub batcher: BatcherStats,
    pub preloader: PreloaderStats,
    pub monitor: MonitorStats,
    pub tuner: TunerStats,
}

/// The enrichment gateway service
pub struct EnrichmentService {
    config: GatewayConfig,
    fetcher: Arc<dyn EnrichmentFetcher>,
    cache: Arc<ResponseCache<Vec<String>>>,
    optimizer: Arc<RequestOptimizer<Vec<String>>>,
    batcher: Arc<RequestBatcher>,
    preloader: Arc<Preloader>,
    monitor: Arc<Monitor>,
    tuner: Arc<AutoTuner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl EnrichmentService {
    /// Wire up the gateway from configuration and an injected fetcher.
    pub fn new(config: GatewayConfig, fetcher: Arc<dyn EnrichmentFetcher>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(ResponseCache::new(&config.cache));
        let monitor = Arc::new(Monitor::new(config.monitor.clone()));
        let optimizer = Arc::new(RequestOptimizer::new(
            &config,
            cache.clone(),
            monitor.clone(),
        ));
        let batcher = Arc::new(RequestBatcher::new(
            config.batcher.clone(),
            optimizer.clone(),
            fetcher.clone(),
        ));
        let preloader = Arc::new(Preloader::new(
            config.preloader.clone(),
            optimizer.clone(),
            fetcher.clone(),
            monitor.clone(),
        ));
        let tuner = Arc::new(AutoTuner::new(
            config.tuner.clone(),
            config.monitor.thresholds.clone(),
            optimizer.clone(),
            preloader.clone(),
            monitor.clone(),
        ));

        Ok(Self {
            config,
            fetcher,
            cache,
            optimizer,
            batcher,
            preloader,
            monitor,
            tuner,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Fetch enrichment results for one persona attribute category.
    ///
    /// The cache key ignores `count`, so a coarser cached or preloaded
    /// list may be longer than requested; it is truncated here.
    pub async fn enrich(
        &self,
        category: &str,
        params: &DemographicParams,
        count: usize,
    ) -> Result<Vec<String>> {
        let key = enrichment_key(category, params);
        let started = Instant::now();

        let fetcher = self.fetcher.clone();
        let fetch_params = params.clone();
        let fetch_category = category.to_string();
        let result = self
            .optimizer
            .execute(&key, category, ExecutionConstraints::default(), move || {
                let fetcher = fetcher.clone();
                let params = fetch_params.clone();
                let category = fetch_category.clone();
                async move { fetcher.fetch(&category, &params, count).await }.boxed()
            })
            .await
            .map(|mut values| {
                values.truncate(count);
                values
            });

        self.preloader.record_usage(
            category,
            params,
            started.elapsed().as_secs_f64() * 1_000.0,
        );
        result
    }

    /// Submit through the batcher; small same-category calls arriving
    /// within the wait window share one scheduling unit.
    pub async fn enrich_batched(
        &self,
        category: &str,
        params: DemographicParams,
        count: usize,
        priority: Priority,
    ) -> Result<Vec<String>> {
        let started = Instant::now();
        let result = self
            .batcher
            .submit(category, params.clone(), count, priority)
            .await;
        self.preloader.record_usage(
            category,
            &params,
            started.elapsed().as_secs_f64() * 1_000.0,
        );
        result
    }

    /// Spawn the background loops: cache sweep, monitor sampling,
    /// preload cycle and tuning cycle. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn({
            let cache = self.cache.clone();
            let interval = self.config.cache.sweep_interval;
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    cache.sweep();
                }
            }
        }));

        tasks.push(tokio::spawn({
            let monitor = self.monitor.clone();
            let optimizer = self.optimizer.clone();
            let cache = self.cache.clone();
            let interval = self.config.monitor.sample_interval;
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    monitor.take_snapshot(optimizer.queued(), cache.memory_bytes());
                }
            }
        }));

        tasks.push(tokio::spawn({
            let preloader = self.preloader.clone();
            let interval = self.config.preloader.cycle_interval;
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    preloader.run_cycle().await;
                }
            }
        }));

        tasks.push(tokio::spawn({
            let tuner = self.tuner.clone();
            let interval = self.config.tuner.cycle_interval;
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    tuner.run_cycle().await;
                }
            }
        }));

        log::info!("enrichment gateway started with 4 background tasks");
    }

    /// Abort the background loops. In-flight foreground calls finish on
    /// their own; only the periodic work stops.
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        log::info!("enrichment gateway stopped");
    }

    /// Read-only aggregate for the debug dashboard.
    pub fn dashboard(&self) -> DashboardSnapshot {
        DashboardSnapshot {
            schema_version: DASHBOARD_SCHEMA_VERSION,
            generated_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            cache: self.cache.stats(),
            optimizer: self.optimizer.stats(),
            batcher: self.batcher.stats(),
            preloader: self.preloader.stats(),
            monitor: self.monitor.stats(),
            tuner: self.tuner.stats(),
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache<Vec<String>>> {
        &self.cache
    }

    pub fn optimizer(&self) -> &Arc<RequestOptimizer<Vec<String>>> {
        &self.optimizer
    }

    pub fn preloader(&self) -> &Arc<Preloader> {
        &self.preloader
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }
}

impl Drop for EnrichmentService {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
