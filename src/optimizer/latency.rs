//! Per-category latency history and adaptive timeout derivation
//!
//! The timeout for a category is derived from the 95th percentile of its
//! recent latencies, scaled by a safety factor and clamped to configured
//! bounds. With no history the configured minimum applies.

use crate::config::OptimizerConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Latency summary for one category
#[derive(Debug, Clone, Serialize)]
pub struct CategoryLatencyStats {
    pub category: String,
    pub samples: usize,
    pub mean_ms: f64,
    pub p95_ms: f64,
}

/// Bounded per-category latency windows
pub struct LatencyTracker {
    windows: DashMap<String, VecDeque<f64>>,
    window_size: usize,
}

impl LatencyTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            windows: DashMap::new(),
            window_size: window_size.max(1),
        }
    }

    /// Record an observed latency for a category
    pub fn record(&self, category: &str, latency_ms: f64) {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return;
        }
        let mut window = self
            .windows
            .entry(category.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.window_size));
        window.push_back(latency_ms);
        while window.len() > self.window_size {
            window.pop_front();
        }
    }

    /// 95th percentile of the recorded window, if any samples exist
    pub fn p95(&self, category: &str) -> Option<f64> {
        let window = self.windows.get(category)?;
        if window.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Some(sorted[rank.clamp(1, sorted.len()) - 1])
    }

    /// Derive the execution timeout for a category
    pub fn adaptive_timeout(&self, category: &str, config: &OptimizerConfig) -> Duration {
        match self.p95(category) {
            Some(p95_ms) => {
                let scaled_ms = p95_ms * config.timeout_safety_factor;
                Duration::from_millis(scaled_ms as u64)
                    .clamp(config.min_timeout, config.max_timeout)
            }
            None => config.min_timeout,
        }
    }

    pub fn snapshot(&self) -> Vec<CategoryLatencyStats> {
        let mut stats: Vec<CategoryLatencyStats> = self
            .windows
            .iter()
            .map(|entry| {
                let window = entry.value();
                let mean = if window.is_empty() {
                    0.0
                } else {
                    window.iter().sum::<f64>() / window.len() as f64
                };
                CategoryLatencyStats {
                    category: entry.key().clone(),
                    samples: window.len(),
                    mean_ms: mean,
                    p95_ms: self.p95(entry.key()).unwrap_or(0.0),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.category.cmp(&b.category));
        stats
    }
}
