//! Time-bounded cache of finished task results.
//!
//! Entries expire `ttl` after they are stored. Expiry is checked lazily on
//! every read and a periodic sweep drops entries nobody asked for again.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::task::{TaskId, TaskOutcome};

struct CachedResult {
    outcome: TaskOutcome,
    stored_at: Instant,
}

impl CachedResult {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= ttl
    }
}

/// Task id -> outcome map with a single, cache-wide TTL.
pub struct ResultCache {
    entries: DashMap<TaskId, CachedResult>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store an outcome, replacing any previous entry for the same id.
    pub fn put(&self, id: TaskId, outcome: TaskOutcome) {
        let previous = self.entries.insert(
            id,
            CachedResult {
                outcome,
                stored_at: Instant::now(),
            },
        );
        if previous.is_some() {
            tracing::warn!(task_id = %id, "Overwrote existing result");
        }
    }

    /// Outcome for `id`, or `None` if absent or past its TTL.
    ///
    /// Reading does not consume the entry; repeated reads within the TTL
    /// return the same outcome.
    pub fn get(&self, id: TaskId) -> Option<TaskOutcome> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(&id) {
            if !entry.is_expired(self.ttl, now) {
                return Some(entry.outcome.clone());
            }
        } else {
            return None;
        }
        self.entries
            .remove_if(&id, |_, entry| entry.is_expired(self.ttl, now));
        tracing::trace!(task_id = %id, "Result expired");
        None
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(self.ttl, now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Sweep `cache` every `interval` until `shutdown` is cancelled.
pub async fn run_sweeper(cache: Arc<ResultCache>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, remaining = cache.len(), "Swept expired results");
                }
            }
        }
    }
    tracing::trace!("Result sweeper exiting");
}
