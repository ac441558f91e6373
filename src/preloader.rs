//! Intelligent preloading of likely-needed enrichment results
//!
//! Observed demand is tracked per normalized signature; signatures that
//! cross the usage threshold become preload candidates scored 0-100 by
//! recency, frequency and an inverse-latency bonus. A background cycle
//! issues the top candidates through the optimizer at low priority,
//! using the same injected fetcher as foreground requests. Preloading is
//! self-limiting: it backs off entirely when the system is under load.

use crate::config::PreloaderConfig;
use crate::monitor::Monitor;
use crate::optimizer::{ExecutionConstraints, RequestOptimizer};
use crate::upstream::{DemographicParams, EnrichmentFetcher};
use crate::cache::enrichment_key;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Score weights: recency dominates, frequency close behind, cheapness
/// breaks ties. Must sum to 1.0 so scores stay on the 0-100 scale.
const RECENCY_WEIGHT: f64 = 0.5;
const FREQUENCY_WEIGHT: f64 = 0.35;
const LATENCY_WEIGHT: f64 = 0.15;

/// Observation count at which the frequency component reaches ~63%
const FREQUENCY_SATURATION: f64 = 5.0;

/// Per-signature usage record
#[derive(Debug, Clone)]
pub struct UsagePattern {
    pub category: String,
    pub params: DemographicParams,
    pub count: u64,
    pub last_access: Instant,
    pub avg_latency_ms: f64,
}

/// A speculative fetch derived from a usage pattern
#[derive(Debug, Clone)]
struct PreloadCandidate {
    key: String,
    category: String,
    params: DemographicParams,
    score: f64,
}

/// Preloader statistics for the observability boundary
#[derive(Debug, Clone, Serialize)]
pub struct PreloaderStats {
    pub enabled: bool,
    pub max_concurrent: usize,
    pub tracked_patterns: usize,
    pub eligible_candidates: usize,
    pub cycles: u64,
    pub cycles_skipped: u64,
    pub preloads_issued: u64,
    pub preloads_suppressed: u64,
    pub preload_failures: u64,
}

/// Converts observed demand into proactive low-priority fetches
pub struct Preloader {
    config: PreloaderConfig,
    optimizer: Arc<RequestOptimizer<Vec<String>>>,
    fetcher: Arc<dyn EnrichmentFetcher>,
    monitor: Arc<Monitor>,
    patterns: DashMap<String, UsagePattern>,
    enabled: AtomicBool,
    max_concurrent: AtomicUsize,
    running: AtomicBool,
    cycles: AtomicU64,
    cycles_skipped: AtomicU64,
    preloads_issued: AtomicU64,
    preloads_suppressed: AtomicU64,
    preload_failures: AtomicU64,
}

impl Preloader {
    pub fn new(
        config: PreloaderConfig,
        optimizer: Arc<RequestOptimizer<Vec<String>>>,
        fetcher: Arc<dyn EnrichmentFetcher>,
        monitor: Arc<Monitor>,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            max_concurrent: AtomicUsize::new(config.max_concurrent_preloads.max(1)),
            config,
            optimizer,
            fetcher,
            monitor,
            patterns: DashMap::new(),
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            cycles_skipped: AtomicU64::new(0),
            preloads_issued: AtomicU64::new(0),
            preloads_suppressed: AtomicU64::new(0),
            preload_failures: AtomicU64::new(0),
        }
    }

    /// Record one observed request so future demand can be predicted.
    pub fn record_usage(&self, category: &str, params: &DemographicParams, latency_ms: f64) {
        let signature = enrichment_key(category, params);
        match self.patterns.entry(signature) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let pattern = entry.get_mut();
                pattern.count += 1;
                pattern.last_access = Instant::now();
                // Running average keeps the record O(1)
                pattern.avg_latency_ms +=
                    (latency_ms - pattern.avg_latency_ms) / pattern.count as f64;
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(UsagePattern {
                    category: category.to_string(),
                    params: params.clone(),
                    count: 1,
                    last_access: Instant::now(),
                    avg_latency_ms: latency_ms.max(0.0),
                });
            }
        }
    }

    /// Combined 0-100 priority score for a pattern
    fn priority_score(&self, pattern: &UsagePattern, now: Instant) -> f64 {
        let half_life = self.config.recency_half_life.as_secs_f64().max(1.0);
        let age = now
            .saturating_duration_since(pattern.last_access)
            .as_secs_f64();
        let recency = 0.5f64.powf(age / half_life);
        let frequency = 1.0 - (-(pattern.count as f64) / FREQUENCY_SATURATION).exp();
        let latency_bonus = 1.0 / (1.0 + pattern.avg_latency_ms / 1_000.0);

        ((RECENCY_WEIGHT * recency
            + FREQUENCY_WEIGHT * frequency
            + LATENCY_WEIGHT * latency_bonus)
            * 100.0)
            .clamp(0.0, 100.0)
    }

    fn candidates(&self) -> Vec<PreloadCandidate> {
        let now = Instant::now();
        let mut candidates: Vec<PreloadCandidate> = self
            .patterns
            .iter()
            .filter(|entry| entry.value().count >= self.config.usage_threshold)
            .map(|entry| PreloadCandidate {
                key: entry.key().clone(),
                category: entry.value().category.clone(),
                params: entry.value().params.clone(),
                score: self.priority_score(entry.value(), now),
            })
            .collect();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(self.config.max_candidates);
        candidates
    }

    /// Run one preload cycle; returns the number of fetches issued.
    ///
    /// Guarded against overlapping invocations: a cycle that fires while
    /// the previous one still runs is dropped.
    pub async fn run_cycle(&self) -> usize {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if !self.enabled.load(Ordering::Acquire) {
            return 0;
        }
        if self.running.swap(true, Ordering::AcqRel) {
            log::debug!("preload cycle still in progress, dropping tick");
            return 0;
        }
        let issued = self.cycle_inner().await;
        self.running.store(false, Ordering::Release);
        issued
    }

    async fn cycle_inner(&self) -> usize {
        self.prune_patterns();

        // Load check: foreground traffic always wins. Queue pressure
        // skips the cycle outright; memory pressure halves concurrency.
        let snapshot = self.monitor.latest();
        let queue_depth = snapshot
            .as_ref()
            .map(|s| s.queue_depth)
            .unwrap_or(0)
            .max(self.optimizer.queued());
        if queue_depth > self.config.max_queue_depth {
            self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "skipping preload cycle, admission queue depth {} over limit {}",
                queue_depth,
                self.config.max_queue_depth
            );
            return 0;
        }

        let memory_bytes = snapshot
            .as_ref()
            .map(|s| s.memory_bytes)
            .unwrap_or(0)
            .max(self.optimizer.cache().memory_bytes());
        let mut budget = self.max_concurrent.load(Ordering::Acquire).max(1);
        if memory_bytes > self.config.memory_soft_limit_bytes {
            budget = (budget / 2).max(1);
            log::debug!(
                "memory estimate {}B over soft limit, preload budget reduced to {}",
                memory_bytes,
                budget
            );
        }

        let mut tasks = Vec::new();
        for candidate in self.candidates() {
            if tasks.len() >= budget {
                break;
            }
            // Another path may have populated the key since scoring
            if self.optimizer.cache().get(&candidate.key).is_some() {
                self.preloads_suppressed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            tasks.push(self.issue(candidate));
        }

        let issued = tasks.len();
        if issued > 0 {
            log::debug!("issuing {} preload fetches", issued);
            futures::future::join_all(tasks).await;
        }
        issued
    }

    async fn issue(&self, candidate: PreloadCandidate) {
        let fetcher = self.fetcher.clone();
        let params = candidate.params.clone();
        let category = candidate.category.clone();
        let count = self.config.preload_result_count;

        let outcome = self
            .optimizer
            .execute(
                &candidate.key,
                &candidate.category,
                ExecutionConstraints::low_priority(),
                move || {
                    let fetcher = fetcher.clone();
                    let params = params.clone();
                    let category = category.clone();
                    async move { fetcher.fetch(&category, &params, count).await }.boxed()
                },
            )
            .await;

        match outcome {
            Ok(_) => {
                self.preloads_issued.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.preload_failures.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "preload for '{}' (score {:.1}) failed: {}",
                    candidate.key,
                    candidate.score,
                    e
                );
            }
        }
    }

    fn prune_patterns(&self) {
        let retention = self.config.pattern_retention;
        self.patterns
            .retain(|_, pattern| pattern.last_access.elapsed() <= retention);
    }

    /// Tuner knob: pause or resume speculative fetching
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            log::info!(
                "preloading {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Tuner knob: per-cycle fetch budget
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        self.max_concurrent
            .store(max_concurrent.max(1), Ordering::Release);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PreloaderStats {
        let eligible = self
            .patterns
            .iter()
            .filter(|entry| entry.value().count >= self.config.usage_threshold)
            .count();
        PreloaderStats {
            enabled: self.is_enabled(),
            max_concurrent: self.max_concurrent(),
            tracked_patterns: self.patterns.len(),
            eligible_candidates: eligible,
            cycles: self.cycles.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            preloads_issued: self.preloads_issued.load(Ordering::Relaxed),
            preloads_suppressed: self.preloads_suppressed.load(Ordering::Relaxed),
            preload_failures: self.preload_failures.load(Ordering::Relaxed),
        }
    }
}
