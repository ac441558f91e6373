//! Fault-tolerance mechanisms around the upstream API
//!
//! Per-category circuit breakers stop calls to a failing category while
//! it recovers; the retry controller applies bounded exponential backoff
//! with jitter around each admitted call.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    AdmitGrant, BreakerRegistry, BreakerStats, CircuitBreaker, CircuitState, ProbeSlot,
};
pub use retry::RetryController;
