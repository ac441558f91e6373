//! Request batching for small same-category calls
//!
//! Requests for one category accumulate in a bucket that flushes when it
//! reaches its maximum size or when the wait window elapses, whichever
//! comes first. Flushed requests still execute individually through the
//! optimizer, so caching and deduplication apply, and every caller is
//! settled independently: one failure never fails its siblings.

use crate::cache::enrichment_key;
use crate::config::BatcherConfig;
use crate::error::{Error, Result};
use crate::optimizer::{ExecutionConstraints, Priority, RequestOptimizer};
use crate::upstream::{DemographicParams, EnrichmentFetcher};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Semaphore};

struct BatchRequest {
    params: DemographicParams,
    count: usize,
    priority: Priority,
    tx: oneshot::Sender<Result<Vec<String>>>,
}

struct Bucket {
    id: u64,
    category: String,
    opened_at: Instant,
    max_priority: Priority,
    requests: Vec<BatchRequest>,
}

/// A bucket waiting for a flush slot; ordered by priority, then FIFO.
struct PendingFlush {
    priority: Priority,
    seq: u64,
    bucket: Bucket,
}

impl PartialEq for PendingFlush {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PendingFlush {}
impl PartialOrd for PendingFlush {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingFlush {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, lower sequence (older) first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Batcher statistics for the observability boundary
#[derive(Debug, Clone, Serialize)]
pub struct BatcherStats {
    pub submitted: u64,
    pub batches_flushed: u64,
    pub flushed_by_size: u64,
    pub flushed_by_timer: u64,
    pub open_buckets: usize,
    pub pending_flushes: usize,
}

struct BatcherShared {
    optimizer: Arc<RequestOptimizer<Vec<String>>>,
    fetcher: Arc<dyn EnrichmentFetcher>,
    config: BatcherConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
    pending: Mutex<BinaryHeap<PendingFlush>>,
    flush_slots: Arc<Semaphore>,
    bucket_seq: AtomicU64,
    submitted: AtomicU64,
    batches_flushed: AtomicU64,
    flushed_by_size: AtomicU64,
    flushed_by_timer: AtomicU64,
}

/// Groups small same-category requests into scheduling units
pub struct RequestBatcher {
    shared: Arc<BatcherShared>,
}

impl RequestBatcher {
    pub fn new(
        config: BatcherConfig,
        optimizer: Arc<RequestOptimizer<Vec<String>>>,
        fetcher: Arc<dyn EnrichmentFetcher>,
    ) -> Self {
        Self {
            shared: Arc::new(BatcherShared {
                optimizer,
                fetcher,
                flush_slots: Arc::new(Semaphore::new(config.max_concurrent_batches.max(1))),
                config,
                buckets: Mutex::new(HashMap::new()),
                pending: Mutex::new(BinaryHeap::new()),
                bucket_seq: AtomicU64::new(0),
                submitted: AtomicU64::new(0),
                batches_flushed: AtomicU64::new(0),
                flushed_by_size: AtomicU64::new(0),
                flushed_by_timer: AtomicU64::new(0),
            }),
        }
    }

    /// Submit a request and await its individual outcome.
    pub async fn submit(
        &self,
        category: &str,
        params: DemographicParams,
        count: usize,
        priority: Priority,
    ) -> Result<Vec<String>> {
        let shared = &self.shared;
        shared.submitted.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let full_bucket = {
            let mut buckets = shared.buckets.lock();
            let bucket = buckets.entry(category.to_string()).or_insert_with(|| {
                let id = shared.bucket_seq.fetch_add(1, Ordering::Relaxed);
                BatcherShared::arm_window_timer(shared.clone(), category.to_string(), id);
                Bucket {
                    id,
                    category: category.to_string(),
                    opened_at: Instant::now(),
                    max_priority: priority,
                    requests: Vec::with_capacity(shared.config.max_batch_size),
                }
            });
            bucket.max_priority = bucket.max_priority.max(priority);
            bucket.requests.push(BatchRequest {
                params,
                count,
                priority,
                tx,
            });
            if bucket.requests.len() >= shared.config.max_batch_size {
                buckets.remove(category)
            } else {
                None
            }
        };

        if let Some(bucket) = full_bucket {
            shared.flushed_by_size.fetch_add(1, Ordering::Relaxed);
            BatcherShared::enqueue_flush(shared.clone(), bucket);
        }

        rx.await
            .unwrap_or_else(|_| Err(Error::Abandoned(format!("batch for '{}'", category))))
    }

    pub fn stats(&self) -> BatcherStats {
        let shared = &self.shared;
        BatcherStats {
            submitted: shared.submitted.load(Ordering::Relaxed),
            batches_flushed: shared.batches_flushed.load(Ordering::Relaxed),
            flushed_by_size: shared.flushed_by_size.load(Ordering::Relaxed),
            flushed_by_timer: shared.flushed_by_timer.load(Ordering::Relaxed),
            open_buckets: shared.buckets.lock().len(),
            pending_flushes: shared.pending.lock().len(),
        }
    }
}

impl BatcherShared {
    /// First request in a bucket arms its wait-window timer. The bucket
    /// id guards against flushing a successor bucket for the same
    /// category.
    fn arm_window_timer(shared: Arc<Self>, category: String, bucket_id: u64) {
        tokio::spawn(async move {
            tokio::time::sleep(shared.config.batch_window).await;
            let expired = {
                let mut buckets = shared.buckets.lock();
                match buckets.get(&category) {
                    Some(bucket) if bucket.id == bucket_id => buckets.remove(&category),
                    _ => None,
                }
            };
            if let Some(bucket) = expired {
                shared.flushed_by_timer.fetch_add(1, Ordering::Relaxed);
                Self::enqueue_flush(shared, bucket);
            }
        });
    }

    /// Queue a bucket for execution and spawn a dispatcher. Each
    /// dispatcher takes the highest-priority pending bucket once a flush
    /// slot frees up, so priority orders flushes under contention.
    fn enqueue_flush(shared: Arc<Self>, bucket: Bucket) {
        {
            let mut pending = shared.pending.lock();
            pending.push(PendingFlush {
                priority: bucket.max_priority,
                seq: bucket.id,
                bucket,
            });
        }

        tokio::spawn(async move {
            let permit = match shared.flush_slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let next = shared.pending.lock().pop();
            if let Some(flush) = next {
                shared.run_bucket(flush.bucket).await;
                shared.batches_flushed.fetch_add(1, Ordering::Relaxed);
            }
            drop(permit);
        });
    }

    async fn run_bucket(&self, bucket: Bucket) {
        log::debug!(
            "flushing bucket '{}' ({} requests, waited {:?})",
            bucket.category,
            bucket.requests.len(),
            bucket.opened_at.elapsed()
        );

        let category = bucket.category;
        let tasks = bucket.requests.into_iter().map(|request| {
            let optimizer = self.optimizer.clone();
            let fetcher = self.fetcher.clone();
            let category = category.clone();
            async move {
                let key = enrichment_key(&category, &request.params);
                let constraints = ExecutionConstraints {
                    priority: request.priority,
                    ..Default::default()
                };
                let params = request.params.clone();
                let count = request.count;
                let fetch_category = category.clone();
                let outcome = optimizer
                    .execute(&key, &category, constraints, move || {
                        let fetcher = fetcher.clone();
                        let params = params.clone();
                        let category = fetch_category.clone();
                        async move { fetcher.fetch(&category, &params, count).await }.boxed()
                    })
                    .await
                    // The coarse key ignores count; a longer cached list
                    // is trimmed to what this caller asked for
                    .map(|mut values| {
                        values.truncate(count);
                        values
                    });
                // Caller may have given up waiting; that is its business
                let _ = request.tx.send(outcome);
            }
        });
        futures::future::join_all(tasks).await;
    }
}
