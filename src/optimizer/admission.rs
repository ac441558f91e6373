//! Concurrency admission control
//!
//! A fair semaphore bounds concurrent upstream calls; waiters queue FIFO
//! and are the system's single backpressure point. The limit is mutable
//! at runtime so the auto-tuner's decisions take effect.

use crate::error::{Error, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Admission statistics for the observability boundary
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub limit: usize,
    pub active: usize,
    pub queued: usize,
    pub total_admitted: u64,
    pub total_rejected: u64,
}

/// FIFO admission queue with a runtime-adjustable concurrency limit
pub struct AdmissionControl {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    waiting: AtomicUsize,
    max_queue_depth: usize,
    total_admitted: AtomicU64,
    total_rejected: AtomicU64,
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AdmissionControl {
    pub fn new(limit: usize, max_queue_depth: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
            waiting: AtomicUsize::new(0),
            max_queue_depth,
            total_admitted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    /// Wait for an admission slot. Rejects with a capacity error when the
    /// wait queue is already at its bound, so callers can distinguish
    /// backpressure from upstream failure.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let queued = self.waiting.fetch_add(1, Ordering::AcqRel);
        let _guard = WaitGuard(&self.waiting);

        if self.semaphore.available_permits() == 0 && queued >= self.max_queue_depth {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::QueueFull(queued));
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Abandoned("admission semaphore closed".into()))?;

        self.total_admitted.fetch_add(1, Ordering::Relaxed);
        Ok(permit)
    }

    /// Change the concurrency limit. Increases release queued waiters
    /// immediately; decreases drain permits as active calls finish.
    pub fn set_limit(&self, new_limit: usize) {
        let new_limit = new_limit.max(1);
        let old = self.limit.swap(new_limit, Ordering::AcqRel);
        if new_limit > old {
            self.semaphore.add_permits(new_limit - old);
        } else if new_limit < old {
            let semaphore = self.semaphore.clone();
            let excess = old - new_limit;
            tokio::spawn(async move {
                for _ in 0..excess {
                    match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit.forget(),
                        Err(_) => break,
                    }
                }
            });
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Calls currently holding a slot (approximate while a resize drains)
    pub fn active(&self) -> usize {
        self.limit().saturating_sub(self.semaphore.available_permits())
    }

    /// Callers currently waiting for a slot
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            limit: self.limit(),
            active: self.active(),
            queued: self.queued(),
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}
