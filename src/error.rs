//! Error types and classification for the enrichment gateway
//!
//! Upstream failures are mapped onto a small fixed vocabulary so the
//! retry controller and circuit breaker can make decisions without
//! inspecting transport details.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// How a failure should be treated by the execution pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Worth retrying with backoff (timeouts, generic upstream errors,
    /// rate limits)
    Transient,
    /// Fail fast, never retry (malformed request, auth, not found)
    Terminal,
    /// Local backpressure, not an upstream fault (breaker open, queue full)
    Capacity,
    /// Cache-layer faults; always absorbed, never surfaced to callers
    Infrastructure,
}

/// Gateway error types
///
/// All payloads are plain data so the enum stays `Clone`; a single
/// settled outcome is fanned out to every deduplicated waiter.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Upstream rejected request: {0}")]
    BadRequest(String),

    #[error("Upstream authentication failed: {0}")]
    Unauthorized(String),

    #[error("Upstream denied access: {0}")]
    Forbidden(String),

    #[error("Upstream entity not found: {0}")]
    NotFound(String),

    #[error("Upstream rate limit exceeded")]
    RateLimited {
        /// Server-suggested wait before the next attempt
        retry_after: Option<Duration>,
    },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Circuit breaker open for category '{0}'")]
    CircuitOpen(String),

    #[error("Admission queue full ({0} waiting)")]
    QueueFull(usize),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request abandoned before completion: {0}")]
    Abandoned(String),
}

impl Error {
    /// Classify this error per the gateway failure taxonomy
    pub fn class(&self) -> FailureClass {
        match self {
            Error::BadRequest(_)
            | Error::Unauthorized(_)
            | Error::Forbidden(_)
            | Error::NotFound(_)
            | Error::Config(_) => FailureClass::Terminal,

            Error::RateLimited { .. }
            | Error::Upstream(_)
            | Error::Timeout(_)
            | Error::RetriesExhausted { .. }
            | Error::Abandoned(_) => FailureClass::Transient,

            Error::CircuitOpen(_) | Error::QueueFull(_) => FailureClass::Capacity,

            Error::Cache(_) => FailureClass::Infrastructure,
        }
    }

    /// Whether the retry controller may attempt this operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::Upstream(_) | Error::Timeout(_)
        )
    }

    /// Whether this is local backpressure rather than an upstream fault
    pub fn is_capacity(&self) -> bool {
        self.class() == FailureClass::Capacity
    }

    /// Whether this failure should count against the category's circuit
    /// breaker. Capacity and cache faults are local conditions and must
    /// not trip the breaker.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self.class(),
            FailureClass::Transient | FailureClass::Terminal
        ) && !matches!(self, Error::Config(_))
    }

    /// Server-suggested wait for rate-limited responses
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_errors_are_not_retryable() {
        for err in [
            Error::BadRequest("age field".into()),
            Error::Unauthorized("bad key".into()),
            Error::Forbidden("plan limit".into()),
            Error::NotFound("category".into()),
        ] {
            assert_eq!(err.class(), FailureClass::Terminal);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn rate_limit_carries_wait_hint() {
        let err = Error::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn capacity_errors_never_feed_the_breaker() {
        assert!(!Error::CircuitOpen("music".into()).counts_against_breaker());
        assert!(!Error::QueueFull(12).counts_against_breaker());
        assert!(!Error::Cache("store".into()).counts_against_breaker());
        assert!(Error::Timeout(Duration::from_secs(1)).counts_against_breaker());
        assert!(Error::NotFound("x".into()).counts_against_breaker());
    }
}
