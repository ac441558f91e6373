//! Conservative auto-tuning of optimizer and preloader knobs
//!
//! Each cycle reads the latest metric snapshot and any alerts since the
//! previous cycle, then applies at most one small, bounded, reversible
//! adjustment. Load sheds immediately; capacity grows only after several
//! consecutive under-loaded checks, because a wrong increase under load
//! compounds the original problem.

use crate::config::{AlertThresholds, TunerConfig};
use crate::monitor::{AlertSeverity, Monitor, PerformanceAlert};
use crate::optimizer::RequestOptimizer;
use crate::preloader::Preloader;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Tuner statistics for the observability boundary
#[derive(Debug, Clone, Serialize)]
pub struct TunerStats {
    pub cycles: u64,
    pub decreases: u64,
    pub increases: u64,
    pub warmups: u64,
    pub underload_streak: u32,
    pub preload_throttled: bool,
    pub last_action: String,
}

/// Closes the monitoring feedback loop with bounded adjustments
pub struct AutoTuner {
    config: TunerConfig,
    thresholds: AlertThresholds,
    optimizer: Arc<RequestOptimizer<Vec<String>>>,
    preloader: Arc<Preloader>,
    monitor: Arc<Monitor>,
    alerts: Mutex<broadcast::Receiver<PerformanceAlert>>,
    underload_streak: AtomicU32,
    throttled_preload: AtomicBool,
    running: AtomicBool,
    cycles: AtomicU64,
    decreases: AtomicU64,
    increases: AtomicU64,
    warmups: AtomicU64,
    last_action: Mutex<String>,
}

impl AutoTuner {
    pub fn new(
        config: TunerConfig,
        thresholds: AlertThresholds,
        optimizer: Arc<RequestOptimizer<Vec<String>>>,
        preloader: Arc<Preloader>,
        monitor: Arc<Monitor>,
    ) -> Self {
        let alerts = Mutex::new(monitor.subscribe());
        Self {
            config,
            thresholds,
            optimizer,
            preloader,
            monitor,
            alerts,
            underload_streak: AtomicU32::new(0),
            throttled_preload: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            decreases: AtomicU64::new(0),
            increases: AtomicU64::new(0),
            warmups: AtomicU64::new(0),
            last_action: Mutex::new("none".to_string()),
        }
    }

    /// Run one tuning cycle. Overlapping invocations are dropped.
    pub async fn run_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("tuning cycle still in progress, dropping tick");
            return;
        }
        self.cycle_inner().await;
        self.running.store(false, Ordering::Release);
    }

    async fn cycle_inner(&self) {
        let critical_alerts = self.drain_critical_alerts();
        let snapshot = match self.monitor.latest() {
            Some(snapshot) => snapshot,
            None => return,
        };

        let overloaded = critical_alerts > 0
            || snapshot.queue_depth > self.thresholds.max_queue_depth
            || snapshot.memory_bytes > self.thresholds.max_memory_bytes;

        if overloaded {
            self.underload_streak.store(0, Ordering::Release);
            self.shed_load(critical_alerts, snapshot.queue_depth, snapshot.memory_bytes);
            return;
        }

        // Load is normal again: a tuner-imposed preload throttle lifts
        if self.throttled_preload.swap(false, Ordering::AcqRel) {
            self.preloader.set_enabled(true);
            self.note_action("re-enabled preloading after recovery");
        }

        let underloaded = snapshot.mean_latency_ms < self.config.underload_latency_ms
            && snapshot.queue_depth == 0
            && snapshot.memory_bytes < self.config.underload_memory_bytes;

        if !underloaded {
            self.underload_streak.store(0, Ordering::Release);
            return;
        }

        let streak = self.underload_streak.fetch_add(1, Ordering::AcqRel) + 1;
        if streak < self.config.underload_checks_required {
            debug!(
                streak,
                required = self.config.underload_checks_required,
                "system under-loaded, waiting for consecutive confirmation"
            );
            return;
        }
        self.underload_streak.store(0, Ordering::Release);
        self.grow_capacity().await;
    }

    fn shed_load(&self, critical_alerts: usize, queue_depth: usize, memory_bytes: u64) {
        let current = self.optimizer.concurrency_limit();
        let target = current
            .saturating_sub(self.config.concurrency_step)
            .max(self.config.concurrency_floor);
        if target < current {
            self.optimizer.set_concurrency_limit(target);
            self.decreases.fetch_add(1, Ordering::Relaxed);
        }

        if self.preloader.is_enabled() {
            self.preloader.set_enabled(false);
            self.throttled_preload.store(true, Ordering::Release);
        }

        info!(
            critical_alerts,
            queue_depth,
            memory_bytes,
            concurrency = target,
            "tuner shed load"
        );
        self.note_action("reduced concurrency and throttled preloading");
    }

    async fn grow_capacity(&self) {
        let current = self.optimizer.concurrency_limit();
        let target = (current + self.config.concurrency_step).min(self.config.concurrency_ceiling);
        if target > current {
            self.optimizer.set_concurrency_limit(target);
            self.increases.fetch_add(1, Ordering::Relaxed);
            info!(concurrency = target, "tuner raised concurrency");
            self.note_action("raised concurrency after sustained underload");
        }

        // Idle capacity is a good moment to warm the cache
        self.warmups.fetch_add(1, Ordering::Relaxed);
        let warmed = self.preloader.run_cycle().await;
        if warmed > 0 {
            debug!(warmed, "tuner-triggered cache warm-up");
        }
    }

    fn drain_critical_alerts(&self) -> usize {
        let mut receiver = self.alerts.lock();
        let mut critical = 0;
        loop {
            match receiver.try_recv() {
                Ok(alert) => {
                    if alert.severity == AlertSeverity::Critical {
                        critical += 1;
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    debug!(missed, "tuner lagged behind alert stream");
                }
                Err(_) => break,
            }
        }
        critical
    }

    fn note_action(&self, action: &str) {
        *self.last_action.lock() = action.to_string();
    }

    pub fn stats(&self) -> TunerStats {
        TunerStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            decreases: self.decreases.load(Ordering::Relaxed),
            increases: self.increases.load(Ordering::Relaxed),
            warmups: self.warmups.load(Ordering::Relaxed),
            underload_streak: self.underload_streak.load(Ordering::Acquire),
            preload_throttled: self.throttled_preload.load(Ordering::Acquire),
            last_action: self.last_action.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::config::GatewayConfig;
    use crate::error::Result;
    use crate::upstream::{DemographicParams, EnrichmentFetcher};
    use async_trait::async_trait;

    struct NullFetcher;

    #[async_trait]
    impl EnrichmentFetcher for NullFetcher {
        async fn fetch(
            &self,
            _category: &str,
            _params: &DemographicParams,
            _count: usize,
        ) -> Result<Vec<String>> {
            Ok(vec!["result".to_string()])
        }
    }

    struct Fixture {
        tuner: AutoTuner,
        optimizer: Arc<RequestOptimizer<Vec<String>>>,
        preloader: Arc<Preloader>,
        monitor: Arc<Monitor>,
    }

    fn fixture(mutate: impl FnOnce(&mut GatewayConfig)) -> Fixture {
        let mut config = GatewayConfig::default();
        config.tuner.underload_checks_required = 2;
        mutate(&mut config);

        let cache = Arc::new(ResponseCache::new(&config.cache));
        let monitor = Arc::new(Monitor::new(config.monitor.clone()));
        let optimizer = Arc::new(RequestOptimizer::new(&config, cache, monitor.clone()));
        let preloader = Arc::new(Preloader::new(
            config.preloader.clone(),
            optimizer.clone(),
            Arc::new(NullFetcher),
            monitor.clone(),
        ));
        let tuner = AutoTuner::new(
            config.tuner.clone(),
            config.monitor.thresholds.clone(),
            optimizer.clone(),
            preloader.clone(),
            monitor.clone(),
        );
        Fixture {
            tuner,
            optimizer,
            preloader,
            monitor,
        }
    }

    #[tokio::test]
    async fn queue_pressure_sheds_load() {
        let f = fixture(|_| {});
        let before = f.optimizer.concurrency_limit();

        // Queue depth over the alert threshold
        f.monitor.take_snapshot(100, 0).unwrap();
        f.tuner.run_cycle().await;

        assert_eq!(f.optimizer.concurrency_limit(), before - 1);
        assert!(!f.preloader.is_enabled());
        assert!(f.tuner.stats().preload_throttled);
    }

    #[tokio::test]
    async fn concurrency_never_drops_below_floor() {
        let f = fixture(|config| {
            config.optimizer.max_concurrent = 2;
            config.tuner.concurrency_floor = 2;
        });

        for _ in 0..3 {
            f.monitor.take_snapshot(100, 0).unwrap();
            f.tuner.run_cycle().await;
        }
        assert_eq!(f.optimizer.concurrency_limit(), 2);
    }

    #[tokio::test]
    async fn increase_requires_consecutive_underload() {
        let f = fixture(|_| {});
        let before = f.optimizer.concurrency_limit();

        f.monitor.take_snapshot(0, 0).unwrap();
        f.tuner.run_cycle().await;
        assert_eq!(f.optimizer.concurrency_limit(), before);

        f.monitor.take_snapshot(0, 0).unwrap();
        f.tuner.run_cycle().await;
        assert_eq!(f.optimizer.concurrency_limit(), before + 1);
        assert_eq!(f.tuner.stats().increases, 1);
    }

    #[tokio::test]
    async fn load_blip_resets_the_streak() {
        let f = fixture(|_| {});
        let before = f.optimizer.concurrency_limit();

        f.monitor.take_snapshot(0, 0).unwrap();
        f.tuner.run_cycle().await;
        // Busy check in between: queue not empty but under threshold
        f.monitor.take_snapshot(4, 0).unwrap();
        f.tuner.run_cycle().await;
        f.monitor.take_snapshot(0, 0).unwrap();
        f.tuner.run_cycle().await;

        // Only one underloaded check since the blip
        assert_eq!(f.optimizer.concurrency_limit(), before);
    }

    #[tokio::test]
    async fn recovery_reenables_preloading() {
        let f = fixture(|_| {});

        f.monitor.take_snapshot(100, 0).unwrap();
        f.tuner.run_cycle().await;
        assert!(!f.preloader.is_enabled());

        f.monitor.take_snapshot(0, 0).unwrap();
        f.tuner.run_cycle().await;
        assert!(f.preloader.is_enabled());
        assert!(!f.tuner.stats().preload_throttled);
    }

    #[tokio::test]
    async fn operator_disabled_preloading_stays_disabled() {
        let f = fixture(|config| {
            config.preloader.enabled = false;
        });

        f.monitor.take_snapshot(100, 0).unwrap();
        f.tuner.run_cycle().await;
        f.monitor.take_snapshot(0, 0).unwrap();
        f.tuner.run_cycle().await;

        // The tuner never throttled it, so it must not re-enable it
        assert!(!f.preloader.is_enabled());
    }

    #[tokio::test]
    async fn critical_alert_sheds_load_without_gauge_pressure() {
        let f = fixture(|config| {
            config.monitor.thresholds.max_mean_latency_ms = 100.0;
        });
        let before = f.optimizer.concurrency_limit();

        // Mean latency far over 2x threshold emits a critical alert
        for _ in 0..5 {
            f.monitor.record_request("music", 500.0, true, false);
        }
        f.monitor.take_snapshot(0, 0).unwrap();
        f.tuner.run_cycle().await;

        assert_eq!(f.optimizer.concurrency_limit(), before - 1);
    }
}
