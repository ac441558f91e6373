//! Circuit breaker for upstream category calls
//!
//! Prevents cascading failures by rejecting calls to a failing category
//! until its cool-down elapses, then admitting a single half-open probe
//! whose outcome decides the next state.

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failing, calls rejected without a network attempt
    Open,
    /// Cool-down elapsed, one probe call allowed through
    HalfOpen,
}

/// Outcome of a successful admission check
#[derive(Debug, Clone, Copy)]
pub struct AdmitGrant {
    /// This call is the half-open probe; its settlement decides the next
    /// state, and a locally-aborted probe must call `abort_probe`.
    pub probe: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    next_retry_at: Option<Instant>,
    current_cool_down: Duration,
    probe_in_flight: bool,
}

/// Per-category circuit breaker
pub struct CircuitBreaker {
    category: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    rejected: AtomicU64,
    opened_count: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(category: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let current_cool_down = config.cool_down;
        Self {
            category: category.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                next_retry_at: None,
                current_cool_down,
                probe_in_flight: false,
            }),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            opened_count: AtomicU32::new(0),
        }
    }

    /// Decide whether a call may proceed. In half-open exactly one probe
    /// is admitted; everything else is rejected until the probe settles.
    pub fn check_admit(&self) -> Result<AdmitGrant> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(AdmitGrant { probe: false }),
            CircuitState::Open => {
                let due = inner
                    .next_retry_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if due {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    log::info!(
                        "circuit breaker '{}' half-open, admitting probe",
                        self.category
                    );
                    Ok(AdmitGrant { probe: true })
                } else {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(Error::CircuitOpen(self.category.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(Error::CircuitOpen(self.category.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(AdmitGrant { probe: true })
                }
            }
        }
    }

    /// Release a probe slot that never reached the upstream (admission
    /// rejected it locally). Leaves the open/half-open state untouched so
    /// the next caller gets the probe instead.
    pub fn abort_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
            inner.probe_in_flight = false;
            log::debug!(
                "circuit breaker '{}' probe aborted before upstream attempt",
                self.category
            );
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
                inner.next_retry_at = None;
                inner.current_cool_down = self.config.cool_down;
                log::info!(
                    "circuit breaker '{}' closed after successful probe",
                    self.category
                );
            }
            CircuitState::Open => {
                // Late success from a call admitted before the trip
                log::debug!(
                    "circuit breaker '{}' ignoring success while open",
                    self.category
                );
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed: extend the cool-down and reopen
                let extended = inner.current_cool_down.mul_f64(self.config.cool_down_extension);
                inner.current_cool_down = extended.min(self.config.max_cool_down);
                inner.probe_in_flight = false;
                self.trip(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.next_retry_at = Some(Instant::now() + inner.current_cool_down);
        self.opened_count.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "circuit breaker '{}' opened for {:?} after {} consecutive failures",
            self.category,
            inner.current_cool_down,
            inner.consecutive_failures
        );
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Reset to closed; used by operators and tests
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        inner.next_retry_at = None;
        inner.current_cool_down = self.config.cool_down;
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            category: self.category.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            opened_count: self.opened_count.load(Ordering::Relaxed),
            cool_down_remaining_ms: inner
                .next_retry_at
                .and_then(|at| at.checked_duration_since(Instant::now()))
                .map(|remaining| remaining.as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

/// RAII handle for a granted half-open probe
///
/// Dropping the slot releases the probe unless its outcome was already
/// recorded, so a cancelled probe call cannot wedge the breaker in
/// half-open. Releasing after settlement is a no-op.
pub struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> ProbeSlot<'a> {
    pub fn new(breaker: &'a CircuitBreaker, armed: bool) -> Self {
        Self { breaker, armed }
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abort_probe();
        }
    }
}

/// Point-in-time breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub category: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub rejected: u64,
    pub opened_count: u32,
    pub cool_down_remaining_ms: u64,
}

/// Registry of circuit breakers, one per upstream category
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Get or create the breaker for a category
    pub fn get(&self, category: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(category.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(category, self.config.clone()))
            })
            .clone()
    }

    pub fn snapshot(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<BreakerStats> = self
            .breakers
            .iter()
            .map(|entry| entry.value().stats())
            .collect();
        stats.sort_by(|a, b| a.category.cmp(&b.category));
        stats
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            cool_down: Duration::from_millis(50),
            cool_down_extension: 2.0,
            max_cool_down: Duration::from_secs(1),
        }
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("music", quick_config());

        for _ in 0..3 {
            assert!(breaker.check_admit().is_ok());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.check_admit(),
            Err(Error::CircuitOpen(category)) if category == "music"
        ));
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("music", quick_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        // 2 after the reset, threshold is 3
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let breaker = CircuitBreaker::new("music", quick_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(70));

        assert!(breaker.check_admit().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Second caller is rejected while the probe is outstanding
        assert!(breaker.check_admit().is_err());
    }

    #[test]
    fn probe_success_closes_circuit() {
        let breaker = CircuitBreaker::new("music", quick_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(70));
        assert!(breaker.check_admit().is_ok());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check_admit().is_ok());
    }

    #[test]
    fn probe_failure_extends_cool_down() {
        let breaker = CircuitBreaker::new("music", quick_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(70));
        assert!(breaker.check_admit().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Original cool-down has elapsed but the extended one has not
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.check_admit().is_err());
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.check_admit().is_ok());
    }

    #[test]
    fn aborted_probe_frees_the_slot() {
        let breaker = CircuitBreaker::new("music", quick_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(70));

        let grant = breaker.check_admit().unwrap();
        assert!(grant.probe);
        assert!(breaker.check_admit().is_err());

        breaker.abort_probe();
        // State unchanged, next caller takes the probe
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.check_admit().unwrap().probe);
    }

    #[test]
    fn probe_slot_releases_on_drop() {
        let breaker = CircuitBreaker::new("music", quick_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(70));

        let grant = breaker.check_admit().unwrap();
        {
            let _slot = ProbeSlot::new(&breaker, grant.probe);
            assert!(breaker.check_admit().is_err());
        }
        // Dropped without settling: the next caller takes the probe
        assert!(breaker.check_admit().unwrap().probe);

        // Settled probes make the release a no-op
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check_admit().is_ok());
    }

    #[test]
    fn registry_isolates_categories() {
        let registry = BreakerRegistry::new(quick_config());
        for _ in 0..3 {
            registry.get("music").record_failure();
        }
        assert_eq!(registry.get("music").state(), CircuitState::Open);
        assert_eq!(registry.get("brand").state(), CircuitState::Closed);
        assert_eq!(registry.snapshot().len(), 2);
    }
}
