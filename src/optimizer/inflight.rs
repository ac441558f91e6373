//! In-flight request deduplication
//!
//! Concurrent calls for the same cache key collapse onto one upstream
//! invocation: the first caller becomes the leader and drives the work,
//! later callers subscribe to the leader's settled outcome. The table
//! entry is removed when the call settles, however it settles.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Outcome of attaching to the in-flight table
pub enum Attachment<V: Clone> {
    /// This caller drives the upstream call and must settle the guard
    Leader(InflightGuard<V>),
    /// Another caller is already driving; await its outcome
    Waiter(broadcast::Receiver<Result<V>>),
}

/// Deduplication table keyed by cache key
pub struct InflightTable<V: Clone> {
    entries: Arc<DashMap<String, broadcast::Sender<Result<V>>>>,
    dedup_hits: AtomicU64,
}

impl<V: Clone> InflightTable<V> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            dedup_hits: AtomicU64::new(0),
        }
    }

    /// Join the in-flight call for `key`, or become its leader.
    pub fn attach(&self, key: &str) -> Attachment<V> {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                self.dedup_hits.fetch_add(1, Ordering::Relaxed);
                Attachment::Waiter(entry.get().subscribe())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(1);
                entry.insert(tx);
                Attachment::Leader(InflightGuard {
                    entries: self.entries.clone(),
                    key: key.to_string(),
                    settled: false,
                })
            }
        }
    }

    /// Keys currently being produced
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dedup_hits(&self) -> u64 {
        self.dedup_hits.load(Ordering::Relaxed)
    }
}

impl<V: Clone> Default for InflightTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Leader-side handle; settling removes the table entry and fans the
/// outcome out to every waiter. Dropping without settling broadcasts an
/// abandonment error so no key stays in-flight forever.
pub struct InflightGuard<V: Clone> {
    entries: Arc<DashMap<String, broadcast::Sender<Result<V>>>>,
    key: String,
    settled: bool,
}

impl<V: Clone> InflightGuard<V> {
    /// Settle the in-flight call with its final outcome.
    pub fn settle(mut self, outcome: Result<V>) {
        self.settled = true;
        if let Some((_, tx)) = self.entries.remove(&self.key) {
            // No waiters is fine; send only fails when none subscribed
            let _ = tx.send(outcome);
        }
    }
}

impl<V: Clone> Drop for InflightGuard<V> {
    fn drop(&mut self) {
        if !self.settled {
            if let Some((_, tx)) = self.entries.remove(&self.key) {
                log::warn!("in-flight leader for '{}' dropped before settling", self.key);
                let _ = tx.send(Err(Error::Abandoned(self.key.clone())));
            }
        }
    }
}

/// Map a waiter's receive error onto the gateway vocabulary.
pub fn waiter_outcome<V: Clone>(
    received: std::result::Result<Result<V>, broadcast::error::RecvError>,
    key: &str,
) -> Result<V> {
    match received {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::Abandoned(key.to_string())),
    }
}
