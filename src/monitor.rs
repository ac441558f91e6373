//! Real-time performance monitoring
//!
//! Turns raw per-request observations into decision-grade aggregates:
//! periodic metric snapshots with bounded history, threshold-based
//! alerts fanned out over a broadcast channel, and trend classification
//! over a trailing window.

use crate::config::MonitorConfig;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Minimum lookups before the cache-hit-ratio threshold is evaluated;
/// a cold cache is not an incident.
const HIT_RATIO_MIN_LOOKUPS: u64 = 20;

/// Minimum requests before a single category's error ratio is evaluated
const CATEGORY_ALERT_MIN_REQUESTS: u64 = 5;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Threshold breach emitted to the auto-tuner and the log
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceAlert {
    pub severity: AlertSeverity,
    pub metric: String,
    pub observed: f64,
    pub threshold: f64,
    pub timestamp_ms: u64,
    pub category: Option<String>,
}

/// Per-category breakdown inside a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CategorySnapshot {
    pub category: String,
    pub requests: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub mean_latency_ms: f64,
}

/// Immutable point-in-time aggregate of system health
#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub timestamp_ms: u64,
    pub mean_latency_ms: f64,
    pub cache_hit_ratio: f64,
    pub error_ratio: f64,
    pub throughput_rps: f64,
    pub queue_depth: usize,
    pub memory_bytes: u64,
    pub categories: Vec<CategorySnapshot>,
}

/// Direction of a metric over the trailing trend window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trend {
    Improving,
    Degrading,
    Stable,
}

/// Trend classification per headline metric
#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub mean_latency: Trend,
    pub error_ratio: Trend,
    pub cache_hit_ratio: Trend,
    pub throughput: Trend,
}

/// Monitor summary for the observability boundary
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub snapshots_retained: usize,
    pub alerts_emitted: u64,
    pub latest: Option<MetricSnapshot>,
    pub trend: TrendReport,
}

struct CategoryTotals {
    requests: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    latencies: Mutex<VecDeque<f64>>,
}

impl CategoryTotals {
    fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::new()),
        }
    }
}

struct SampleCursor {
    at: Instant,
    requests_seen: u64,
}

/// Aggregates rolling metrics and raises threshold-based alerts
pub struct Monitor {
    config: MonitorConfig,
    categories: DashMap<String, Arc<CategoryTotals>>,
    history: RwLock<VecDeque<MetricSnapshot>>,
    alert_tx: broadcast::Sender<PerformanceAlert>,
    cursor: Mutex<SampleCursor>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_lookups: AtomicU64,
    total_cache_hits: AtomicU64,
    alerts_emitted: AtomicU64,
    sampling: AtomicBool,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (alert_tx, _) = broadcast::channel(256);
        Self {
            config,
            categories: DashMap::new(),
            history: RwLock::new(VecDeque::new()),
            alert_tx,
            cursor: Mutex::new(SampleCursor {
                at: Instant::now(),
                requests_seen: 0,
            }),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_lookups: AtomicU64::new(0),
            total_cache_hits: AtomicU64::new(0),
            alerts_emitted: AtomicU64::new(0),
            sampling: AtomicBool::new(false),
        }
    }

    /// Record one observed request outcome.
    ///
    /// Cache hits count toward the hit ratio only; latency and failure
    /// accounting applies to requests that actually reached the upstream
    /// path.
    pub fn record_request(&self, category: &str, latency_ms: f64, success: bool, cache_hit: bool) {
        self.total_lookups.fetch_add(1, Ordering::Relaxed);
        let totals = self
            .categories
            .entry(category.to_string())
            .or_insert_with(|| Arc::new(CategoryTotals::new()))
            .clone();

        if cache_hit {
            self.total_cache_hits.fetch_add(1, Ordering::Relaxed);
            totals.cache_hits.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        totals.requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
            totals.failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut latencies = totals.latencies.lock();
        latencies.push_back(latency_ms);
        while latencies.len() > self.config.latency_window {
            latencies.pop_front();
        }
    }

    /// Subscribe to alert notifications (used by the auto-tuner).
    pub fn subscribe(&self) -> broadcast::Receiver<PerformanceAlert> {
        self.alert_tx.subscribe()
    }

    /// Compute a snapshot from the running totals, append it to history,
    /// and run threshold checks against it. `queue_depth` and
    /// `memory_bytes` are gauges sampled by the caller. Returns `None`
    /// when a previous sampling pass is still in progress.
    pub fn take_snapshot(&self, queue_depth: usize, memory_bytes: u64) -> Option<MetricSnapshot> {
        if self.sampling.swap(true, Ordering::AcqRel) {
            debug!("snapshot sampling already in progress, skipping tick");
            return None;
        }

        let snapshot = self.build_snapshot(queue_depth, memory_bytes);

        {
            let mut history = self.history.write();
            history.push_back(snapshot.clone());
            let retention_ms = self.config.history_retention.as_millis() as u64;
            let now_ms = snapshot.timestamp_ms;
            while history.len() > self.config.max_history
                || history
                    .front()
                    .map(|old| now_ms.saturating_sub(old.timestamp_ms) > retention_ms)
                    .unwrap_or(false)
            {
                history.pop_front();
            }
        }

        self.check_thresholds(&snapshot);
        self.sampling.store(false, Ordering::Release);
        Some(snapshot)
    }

    fn build_snapshot(&self, queue_depth: usize, memory_bytes: u64) -> MetricSnapshot {
        let mut categories = Vec::new();
        let mut latency_sum = 0.0;
        let mut latency_count = 0usize;

        for entry in self.categories.iter() {
            let totals = entry.value();
            let latencies = totals.latencies.lock();
            let mean = if latencies.is_empty() {
                0.0
            } else {
                latencies.iter().sum::<f64>() / latencies.len() as f64
            };
            latency_sum += latencies.iter().sum::<f64>();
            latency_count += latencies.len();
            categories.push(CategorySnapshot {
                category: entry.key().clone(),
                requests: totals.requests.load(Ordering::Relaxed),
                failures: totals.failures.load(Ordering::Relaxed),
                cache_hits: totals.cache_hits.load(Ordering::Relaxed),
                mean_latency_ms: mean,
            });
        }
        categories.sort_by(|a, b| a.category.cmp(&b.category));

        let requests = self.total_requests.load(Ordering::Relaxed);
        let failures = self.total_failures.load(Ordering::Relaxed);
        let lookups = self.total_lookups.load(Ordering::Relaxed);
        let cache_hits = self.total_cache_hits.load(Ordering::Relaxed);

        let throughput = {
            let mut cursor = self.cursor.lock();
            let elapsed = cursor.at.elapsed().as_secs_f64();
            let delta = requests.saturating_sub(cursor.requests_seen);
            cursor.at = Instant::now();
            cursor.requests_seen = requests;
            if elapsed > 0.0 {
                delta as f64 / elapsed
            } else {
                0.0
            }
        };

        MetricSnapshot {
            timestamp_ms: unix_millis(),
            mean_latency_ms: if latency_count == 0 {
                0.0
            } else {
                latency_sum / latency_count as f64
            },
            cache_hit_ratio: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
            error_ratio: if requests == 0 {
                0.0
            } else {
                failures as f64 / requests as f64
            },
            throughput_rps: throughput,
            queue_depth,
            memory_bytes,
            categories,
        }
    }

    fn check_thresholds(&self, snapshot: &MetricSnapshot) {
        let thresholds = &self.config.thresholds;

        if snapshot.mean_latency_ms > thresholds.max_mean_latency_ms {
            self.emit_alert(
                "mean_latency_ms",
                snapshot.mean_latency_ms,
                thresholds.max_mean_latency_ms,
                None,
            );
        }
        if snapshot.error_ratio > thresholds.max_error_ratio {
            self.emit_alert(
                "error_ratio",
                snapshot.error_ratio,
                thresholds.max_error_ratio,
                None,
            );
        }
        if self.total_lookups.load(Ordering::Relaxed) >= HIT_RATIO_MIN_LOOKUPS
            && snapshot.cache_hit_ratio < thresholds.min_cache_hit_ratio
        {
            self.emit_low_watermark_alert(
                "cache_hit_ratio",
                snapshot.cache_hit_ratio,
                thresholds.min_cache_hit_ratio,
            );
        }
        // A single failing category should be nameable by the consumer
        for category in &snapshot.categories {
            if category.requests >= CATEGORY_ALERT_MIN_REQUESTS {
                let ratio = category.failures as f64 / category.requests as f64;
                if ratio > thresholds.max_error_ratio {
                    self.emit_alert(
                        "error_ratio",
                        ratio,
                        thresholds.max_error_ratio,
                        Some(category.category.clone()),
                    );
                }
            }
        }
        if snapshot.queue_depth > thresholds.max_queue_depth {
            self.emit_alert(
                "queue_depth",
                snapshot.queue_depth as f64,
                thresholds.max_queue_depth as f64,
                None,
            );
        }
        if snapshot.memory_bytes > thresholds.max_memory_bytes {
            self.emit_alert(
                "memory_bytes",
                snapshot.memory_bytes as f64,
                thresholds.max_memory_bytes as f64,
                None,
            );
        }
    }

    fn emit_alert(&self, metric: &str, observed: f64, threshold: f64, category: Option<String>) {
        let severity = if threshold > 0.0 && observed >= threshold * self.config.escalation_multiple
        {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        self.dispatch(PerformanceAlert {
            severity,
            metric: metric.to_string(),
            observed,
            threshold,
            timestamp_ms: unix_millis(),
            category,
        });
    }

    /// For metrics where lower is worse; escalates when the observed
    /// value falls below threshold / escalation multiple.
    fn emit_low_watermark_alert(&self, metric: &str, observed: f64, threshold: f64) {
        let severity = if observed <= threshold / self.config.escalation_multiple {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        self.dispatch(PerformanceAlert {
            severity,
            metric: metric.to_string(),
            observed,
            threshold,
            timestamp_ms: unix_millis(),
            category: None,
        });
    }

    fn dispatch(&self, alert: PerformanceAlert) {
        self.alerts_emitted.fetch_add(1, Ordering::Relaxed);
        warn!(
            metric = %alert.metric,
            observed = alert.observed,
            threshold = alert.threshold,
            severity = ?alert.severity,
            "performance threshold breached"
        );
        // No subscribers is fine; alerts are also visible in the log
        let _ = self.alert_tx.send(alert);
    }

    /// Most recent snapshot, if any have been taken.
    pub fn latest(&self) -> Option<MetricSnapshot> {
        self.history.read().back().cloned()
    }

    pub fn history(&self) -> Vec<MetricSnapshot> {
        self.history.read().iter().cloned().collect()
    }

    /// Compare the oldest and newest snapshot in the trailing window and
    /// classify each headline metric.
    pub fn trend(&self) -> TrendReport {
        let history = self.history.read();
        let window_ms = self.config.trend_window.as_millis() as u64;
        let newest = match history.back() {
            Some(snapshot) => snapshot,
            None => return TrendReport::stable(),
        };
        let oldest_idx = history
            .iter()
            .position(|s| newest.timestamp_ms.saturating_sub(s.timestamp_ms) <= window_ms);
        let oldest = match oldest_idx {
            // Two distinct snapshots inside the window, or nothing to say
            Some(idx) if idx + 1 < history.len() => &history[idx],
            _ => return TrendReport::stable(),
        };

        let min_change = self.config.trend_min_change;
        TrendReport {
            mean_latency: classify(
                oldest.mean_latency_ms,
                newest.mean_latency_ms,
                min_change,
                false,
            ),
            error_ratio: classify(oldest.error_ratio, newest.error_ratio, min_change, false),
            cache_hit_ratio: classify(
                oldest.cache_hit_ratio,
                newest.cache_hit_ratio,
                min_change,
                true,
            ),
            throughput: classify(
                oldest.throughput_rps,
                newest.throughput_rps,
                min_change,
                true,
            ),
        }
    }

    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            snapshots_retained: self.history.read().len(),
            alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
            latest: self.latest(),
            trend: self.trend(),
        }
    }
}

impl TrendReport {
    fn stable() -> Self {
        Self {
            mean_latency: Trend::Stable,
            error_ratio: Trend::Stable,
            cache_hit_ratio: Trend::Stable,
            throughput: Trend::Stable,
        }
    }
}

/// Classify a metric move; `higher_is_better` flips the direction.
fn classify(old: f64, new: f64, min_change: f64, higher_is_better: bool) -> Trend {
    let baseline = old.abs().max(f64::EPSILON);
    let relative = (new - old) / baseline;
    if relative.abs() < min_change {
        return Trend::Stable;
    }
    match (relative > 0.0, higher_is_better) {
        (true, true) | (false, false) => Trend::Improving,
        _ => Trend::Degrading,
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertThresholds;
    use std::time::Duration;

    fn quick_config() -> MonitorConfig {
        MonitorConfig {
            sample_interval: Duration::from_millis(10),
            history_retention: Duration::from_secs(60),
            max_history: 8,
            latency_window: 16,
            thresholds: AlertThresholds {
                max_mean_latency_ms: 100.0,
                max_error_ratio: 0.5,
                min_cache_hit_ratio: 0.10,
                max_queue_depth: 4,
                max_memory_bytes: 1024,
            },
            escalation_multiple: 2.0,
            trend_window: Duration::from_secs(60),
            trend_min_change: 0.05,
        }
    }

    #[test]
    fn snapshot_aggregates_running_totals() {
        let monitor = Monitor::new(quick_config());
        monitor.record_request("music", 40.0, true, false);
        monitor.record_request("music", 60.0, false, false);
        monitor.record_request("music", 0.0, true, true);

        let snapshot = monitor.take_snapshot(1, 512).unwrap();
        assert!((snapshot.mean_latency_ms - 50.0).abs() < 1e-9);
        assert!((snapshot.error_ratio - 0.5).abs() < 1e-9);
        assert!((snapshot.cache_hit_ratio - (1.0 / 3.0)).abs() < 1e-9);
        assert_eq!(snapshot.queue_depth, 1);
        assert_eq!(snapshot.categories.len(), 1);
        assert_eq!(snapshot.categories[0].requests, 2);
    }

    #[test]
    fn latency_breach_emits_warning_then_critical() {
        let monitor = Monitor::new(quick_config());
        let mut alerts = monitor.subscribe();

        monitor.record_request("music", 150.0, true, false);
        monitor.take_snapshot(0, 0).unwrap();
        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.metric, "mean_latency_ms");
        assert_eq!(alert.severity, AlertSeverity::Warning);

        // Push the mean past 2x the threshold
        for _ in 0..10 {
            monitor.record_request("music", 400.0, true, false);
        }
        monitor.take_snapshot(0, 0).unwrap();
        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
    }

    #[test]
    fn cold_cache_does_not_alert_on_hit_ratio() {
        let monitor = Monitor::new(quick_config());
        let mut alerts = monitor.subscribe();
        monitor.record_request("music", 10.0, true, false);
        monitor.take_snapshot(0, 0).unwrap();
        assert!(alerts.try_recv().is_err());
    }

    #[test]
    fn category_error_breach_names_the_category() {
        let monitor = Monitor::new(quick_config());
        let mut alerts = monitor.subscribe();

        for _ in 0..5 {
            monitor.record_request("brand", 10.0, false, false);
        }
        // Healthy traffic elsewhere keeps this about "brand"
        for _ in 0..5 {
            monitor.record_request("music", 10.0, true, false);
        }
        monitor.take_snapshot(0, 0).unwrap();

        let mut saw_category_alert = false;
        while let Ok(alert) = alerts.try_recv() {
            if alert.category.as_deref() == Some("brand") {
                assert_eq!(alert.metric, "error_ratio");
                saw_category_alert = true;
            }
        }
        assert!(saw_category_alert);
    }

    #[test]
    fn queue_depth_breach_alerts() {
        let monitor = Monitor::new(quick_config());
        let mut alerts = monitor.subscribe();
        monitor.take_snapshot(10, 0).unwrap();
        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.metric, "queue_depth");
        assert_eq!(alert.severity, AlertSeverity::Critical);
    }

    #[test]
    fn history_is_bounded() {
        let monitor = Monitor::new(quick_config());
        for _ in 0..20 {
            monitor.take_snapshot(0, 0).unwrap();
        }
        assert_eq!(monitor.history().len(), 8);
    }

    #[test]
    fn trend_degrades_when_latency_rises() {
        let monitor = Monitor::new(quick_config());
        monitor.record_request("music", 10.0, true, false);
        monitor.take_snapshot(0, 0).unwrap();
        for _ in 0..20 {
            monitor.record_request("music", 500.0, true, false);
        }
        monitor.take_snapshot(0, 0).unwrap();

        let trend = monitor.trend();
        assert_eq!(trend.mean_latency, Trend::Degrading);
    }

    #[test]
    fn trend_stable_under_min_change() {
        let monitor = Monitor::new(quick_config());
        for _ in 0..4 {
            monitor.record_request("music", 100.0, true, false);
        }
        monitor.take_snapshot(0, 0).unwrap();
        monitor.record_request("music", 101.0, true, false);
        monitor.take_snapshot(0, 0).unwrap();
        assert_eq!(monitor.trend().mean_latency, Trend::Stable);
    }
}
