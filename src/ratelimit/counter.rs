//! Fixed-window counters kept in a store with native increment and TTL.
//!
//! Every consume increments a counter by the usage of the phase (one request
//! before the request runs, the elapsed time after) and derives the remaining
//! budget from the post-increment value. The counter's TTL is only set when
//! that value equals the usage just added, i.e. when this call created the
//! counter, so later increments never extend the window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::clock::Clock;
use super::engine::ConsumeStrategy;
use super::handler::ErrorHandler;
use super::rate::{add_millis, remaining_after, saturating_i64, Rate};
use super::quota_key;
use crate::error::Result;
use crate::policy::Policy;

/// A store of integer counters with expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `by` to the counter, creating it at zero, and return the new value.
    async fn increment(&self, key: &str, by: i64) -> Result<i64>;

    /// Expire the counter `ttl_secs` seconds from now.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
struct CounterEntry {
    value: i64,
    expires_at: Option<DateTime<Utc>>,
}

impl CounterEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Increments between sweeps of expired counters.
pub const SWEEP_INTERVAL: u64 = 1024;

/// Process-local counter store. Expired counters restart at zero and are
/// swept out every [`SWEEP_INTERVAL`] increments.
#[derive(Debug)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
    increments: AtomicU64,
}

impl InMemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
            increments: AtomicU64::new(0),
        }
    }

    /// Number of counters held, expired or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop expired counters, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Current value of a live counter.
    pub fn get(&self, key: &str) -> Option<i64> {
        let now = self.clock.now();
        self.counters
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value)
    }

    /// When a live counter expires, if it has a TTL.
    pub fn expires_at(&self, key: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.counters
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        // Sweep before taking the entry guard; retain locks every shard.
        let count = self.increments.fetch_add(1, Ordering::Relaxed);
        if count % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            let purged = self.purge_expired();
            trace!(purged, "Swept expired counters");
        }

        let now = self.clock.now();
        let mut entry = self.counters.entry(key.to_string()).or_default();
        if entry.is_expired(now) {
            *entry = CounterEntry::default();
        }
        entry.value = entry.value.saturating_add(by);
        Ok(entry.value)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        if let Some(mut entry) = self.counters.get_mut(key) {
            let ttl_millis = ttl_secs.saturating_mul(1000);
            entry.expires_at = Some(add_millis(self.clock.now(), ttl_millis));
        }
        Ok(())
    }
}

/// Fixed-window strategy over a [`CounterStore`].
#[derive(Debug)]
pub struct CounterStrategy<C> {
    store: C,
}

impl<C: CounterStore> CounterStrategy<C> {
    pub fn new(store: C) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    async fn remaining(
        &self,
        key: &str,
        budget: u64,
        usage: i64,
        refresh_interval: u64,
        errors: &dyn ErrorHandler,
    ) -> i64 {
        let current = match self.store.increment(key, usage).await {
            Ok(current) => {
                if current == usage {
                    if let Err(e) = self.store.expire(key, refresh_interval).await {
                        errors.handle_error(
                            &format!("Failed setting expiration for {}", key),
                            &e,
                        );
                    }
                }
                current
            }
            Err(e) => {
                errors.handle_error(&format!("Failed incrementing counter for {}", key), &e);
                0
            }
        };

        remaining_after(saturating_i64(budget), current)
    }
}

#[async_trait]
impl<C: CounterStore> ConsumeStrategy for CounterStrategy<C> {
    fn name(&self) -> &'static str {
        "counter"
    }

    async fn apply(
        &self,
        policy: &Policy,
        rate: &mut Rate,
        elapsed_millis: Option<u64>,
        errors: &dyn ErrorHandler,
    ) {
        if let Some(limit) = policy.limit {
            let usage = if elapsed_millis.is_none() { 1 } else { 0 };
            let remaining = self
                .remaining(&rate.key, limit, usage, policy.refresh_interval, errors)
                .await;
            rate.remaining = Some(remaining);
        }

        if let Some(quota) = policy.quota_millis() {
            let usage = elapsed_millis.map(saturating_i64).unwrap_or(0);
            let key = quota_key(&rate.key);
            let remaining = self
                .remaining(&key, quota, usage, policy.refresh_interval, errors)
                .await;
            rate.remaining_quota_millis = Some(remaining);
        }

        rate.reset_millis = policy.refresh_interval_millis();
    }
}
