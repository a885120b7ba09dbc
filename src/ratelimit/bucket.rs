//! Token-bucket strategy.
//!
//! Each policy dimension gets a bucket holding `capacity` tokens that refills
//! greedily over the refresh interval. Requests take one token from the limit
//! bucket before they run; the quota bucket is charged the elapsed
//! milliseconds afterwards. A failed consume drains whatever is left so the
//! refill timer reflects a fully spent bucket.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::clock::Clock;
use super::counter::SWEEP_INTERVAL;
use super::engine::ConsumeStrategy;
use super::handler::ErrorHandler;
use super::quota_key;
use super::rate::{saturating_i64, Rate, EXHAUSTED};
use crate::error::Result;
use crate::policy::Policy;

const NANOS_PER_MILLI: u64 = 1_000_000;

/// Capacity and refill period of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSpec {
    pub capacity: u64,
    pub period: Duration,
}

impl BucketSpec {
    pub fn new(capacity: u64, refresh_interval_secs: u64) -> Self {
        Self {
            capacity,
            period: Duration::from_secs(refresh_interval_secs),
        }
    }
}

/// Result of a consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionProbe {
    pub consumed: bool,
    pub remaining_tokens: u64,
    pub nanos_to_full_refill: u64,
}

/// Bucket state without consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub available_tokens: u64,
    pub nanos_to_full_refill: u64,
}

/// Keyed token buckets.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Take `tokens` if available.
    async fn try_consume(&self, key: &str, spec: BucketSpec, tokens: u64)
        -> Result<ConsumptionProbe>;

    /// Take up to `limit` tokens and report the state left behind.
    async fn consume_as_much_as_possible(
        &self,
        key: &str,
        spec: BucketSpec,
        limit: u64,
    ) -> Result<BucketSnapshot>;

    /// Report the state without taking anything.
    async fn probe(&self, key: &str, spec: BucketSpec) -> Result<BucketSnapshot>;
}

/// A greedily refilling token bucket.
///
/// Tokens are held in fixed point, scaled by the period in nanoseconds, so a
/// refill adds exactly `capacity * elapsed_nanos` units and a bucket is full
/// again exactly one period after it was drained.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    spec: BucketSpec,
    scaled_tokens: u128,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// A full bucket.
    pub fn full(spec: BucketSpec, now: DateTime<Utc>) -> Self {
        let mut bucket = Self {
            spec,
            scaled_tokens: 0,
            last_refill: now,
        };
        bucket.scaled_tokens = bucket.scaled_capacity();
        bucket
    }

    pub fn spec(&self) -> BucketSpec {
        self.spec
    }

    /// Switch to a new spec, keeping at most the new capacity.
    pub fn reconfigure(&mut self, spec: BucketSpec, now: DateTime<Utc>) {
        self.refill(now);
        let kept = self.available().min(spec.capacity);
        self.spec = spec;
        self.scaled_tokens = self.scale(kept);
    }

    pub fn try_consume(&mut self, tokens: u64, now: DateTime<Utc>) -> ConsumptionProbe {
        self.refill(now);
        let needed = self.scale(tokens);
        let consumed = self.scaled_tokens >= needed;
        if consumed {
            self.scaled_tokens -= needed;
        }
        ConsumptionProbe {
            consumed,
            remaining_tokens: self.available(),
            nanos_to_full_refill: self.nanos_to_full_refill(),
        }
    }

    /// Take up to `limit` whole tokens, returning how many were taken.
    pub fn consume_as_much_as_possible(&mut self, limit: u64, now: DateTime<Utc>) -> u64 {
        self.refill(now);
        let taken = self.available().min(limit);
        self.scaled_tokens -= self.scale(taken);
        taken
    }

    pub fn snapshot(&mut self, now: DateTime<Utc>) -> BucketSnapshot {
        self.refill(now);
        BucketSnapshot {
            available_tokens: self.available(),
            nanos_to_full_refill: self.nanos_to_full_refill(),
        }
    }

    /// Whether the bucket is full at `now`, making it indistinguishable
    /// from a fresh one.
    pub fn is_full(&mut self, now: DateTime<Utc>) -> bool {
        self.refill(now);
        self.scaled_tokens >= self.scaled_capacity()
    }

    fn period_nanos(&self) -> u128 {
        self.spec.period.as_nanos().max(1)
    }

    fn scale(&self, tokens: u64) -> u128 {
        u128::from(tokens).saturating_mul(self.period_nanos())
    }

    fn scaled_capacity(&self) -> u128 {
        self.scale(self.spec.capacity)
    }

    fn available(&self) -> u64 {
        u64::try_from(self.scaled_tokens / self.period_nanos()).unwrap_or(u64::MAX)
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = now - self.last_refill;
        if elapsed <= chrono::Duration::zero() {
            return;
        }
        let elapsed_nanos = elapsed
            .num_nanoseconds()
            .and_then(|nanos| u128::try_from(nanos).ok())
            .unwrap_or(u128::MAX);
        let added = u128::from(self.spec.capacity).saturating_mul(elapsed_nanos);
        self.scaled_tokens = self
            .scaled_tokens
            .saturating_add(added)
            .min(self.scaled_capacity());
        self.last_refill = now;
    }

    fn nanos_to_full_refill(&self) -> u64 {
        let capacity = u128::from(self.spec.capacity);
        let missing = self.scaled_capacity().saturating_sub(self.scaled_tokens);
        if missing == 0 || capacity == 0 {
            return 0;
        }
        u64::try_from(missing.div_ceil(capacity)).unwrap_or(u64::MAX)
    }
}

/// Process-local bucket store.
///
/// Buckets that have refilled completely are swept out every
/// [`SWEEP_INTERVAL`] operations; a later request recreates them full.
#[derive(Debug)]
pub struct InMemoryBucketStore {
    buckets: DashMap<String, TokenBucket>,
    clock: Arc<dyn Clock>,
    operations: AtomicU64,
}

impl InMemoryBucketStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
            operations: AtomicU64::new(0),
        }
    }

    /// Number of buckets held.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets that are full again, returning how many were removed.
    pub fn purge_full(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_full(now));
        before.saturating_sub(self.buckets.len())
    }

    fn with_bucket<T>(
        &self,
        key: &str,
        spec: BucketSpec,
        f: impl FnOnce(&mut TokenBucket, DateTime<Utc>) -> T,
    ) -> T {
        let count = self.operations.fetch_add(1, Ordering::Relaxed);
        if count % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            let purged = self.purge_full();
            trace!(purged, "Swept refilled buckets");
        }

        let now = self.clock.now();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(spec, now));
        if bucket.spec() != spec {
            bucket.reconfigure(spec, now);
        }
        f(&mut bucket, now)
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn try_consume(
        &self,
        key: &str,
        spec: BucketSpec,
        tokens: u64,
    ) -> Result<ConsumptionProbe> {
        Ok(self.with_bucket(key, spec, |bucket, now| bucket.try_consume(tokens, now)))
    }

    async fn consume_as_much_as_possible(
        &self,
        key: &str,
        spec: BucketSpec,
        limit: u64,
    ) -> Result<BucketSnapshot> {
        Ok(self.with_bucket(key, spec, |bucket, now| {
            bucket.consume_as_much_as_possible(limit, now);
            bucket.snapshot(now)
        }))
    }

    async fn probe(&self, key: &str, spec: BucketSpec) -> Result<BucketSnapshot> {
        Ok(self.with_bucket(key, spec, |bucket, now| bucket.snapshot(now)))
    }
}

/// Outcome of touching one bucket: remaining value and refill timer.
type BucketView = (i64, u64);

/// Token-bucket strategy over a [`BucketStore`].
#[derive(Debug)]
pub struct BucketStrategy<B> {
    store: B,
}

impl<B: BucketStore> BucketStrategy<B> {
    pub fn new(store: B) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &B {
        &self.store
    }

    async fn consume(
        &self,
        key: &str,
        spec: BucketSpec,
        tokens: u64,
        errors: &dyn ErrorHandler,
    ) -> Option<BucketView> {
        let outcome = match self.store.try_consume(key, spec, tokens).await {
            Ok(outcome) => outcome,
            Err(e) => {
                errors.handle_error(&format!("Failed consuming bucket {}", key), &e);
                return None;
            }
        };

        if outcome.consumed {
            return Some((
                saturating_i64(outcome.remaining_tokens),
                outcome.nanos_to_full_refill,
            ));
        }

        match self.store.consume_as_much_as_possible(key, spec, tokens).await {
            Ok(drained) => Some((EXHAUSTED, drained.nanos_to_full_refill)),
            Err(e) => {
                errors.handle_error(&format!("Failed draining bucket {}", key), &e);
                Some((EXHAUSTED, outcome.nanos_to_full_refill))
            }
        }
    }

    async fn peek(
        &self,
        key: &str,
        spec: BucketSpec,
        errors: &dyn ErrorHandler,
    ) -> Option<BucketView> {
        match self.store.probe(key, spec).await {
            Ok(snapshot) => {
                let remaining = if snapshot.available_tokens > 0 {
                    saturating_i64(snapshot.available_tokens)
                } else {
                    EXHAUSTED
                };
                Some((remaining, snapshot.nanos_to_full_refill))
            }
            Err(e) => {
                errors.handle_error(&format!("Failed probing bucket {}", key), &e);
                None
            }
        }
    }
}

#[async_trait]
impl<B: BucketStore> ConsumeStrategy for BucketStrategy<B> {
    fn name(&self) -> &'static str {
        "bucket"
    }

    async fn apply(
        &self,
        policy: &Policy,
        rate: &mut Rate,
        elapsed_millis: Option<u64>,
        errors: &dyn ErrorHandler,
    ) {
        let mut reset_nanos = None;

        if let Some(limit) = policy.limit {
            let spec = BucketSpec::new(limit, policy.refresh_interval);
            let view = match elapsed_millis {
                None => self.consume(&rate.key, spec, 1, errors).await,
                Some(_) => self.peek(&rate.key, spec, errors).await,
            };
            if let Some((remaining, nanos)) = view {
                rate.remaining = Some(remaining);
                reset_nanos = reset_nanos.max(Some(nanos));
            }
        }

        if let Some(quota) = policy.quota_millis() {
            let spec = BucketSpec::new(quota, policy.refresh_interval);
            let key = quota_key(&rate.key);
            // A zero-length request charges nothing, so it only peeks.
            let view = match elapsed_millis {
                Some(elapsed) if elapsed > 0 => self.consume(&key, spec, elapsed, errors).await,
                _ => self.peek(&key, spec, errors).await,
            };
            if let Some((remaining, nanos)) = view {
                rate.remaining_quota_millis = Some(remaining);
                reset_nanos = reset_nanos.max(Some(nanos));
            }
        }

        if let Some(nanos) = reset_nanos {
            rate.reset_millis = nanos / NANOS_PER_MILLI;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RatewardenError;
    use crate::ratelimit::handler::testing::RecordingErrorHandler;
    use crate::ratelimit::{LoggingErrorHandler, ManualClock};

    fn strategy(clock: Arc<ManualClock>) -> BucketStrategy<InMemoryBucketStore> {
        BucketStrategy::new(InMemoryBucketStore::new(clock))
    }

    async fn consume(
        strategy: &BucketStrategy<InMemoryBucketStore>,
        policy: &Policy,
        elapsed_millis: Option<u64>,
    ) -> Rate {
        let mut rate = Rate::new_window(policy, "k", Utc::now());
        strategy
            .apply(policy, &mut rate, elapsed_millis, &LoggingErrorHandler)
            .await;
        rate
    }

    #[test]
    fn test_token_bucket_refills_over_period() {
        let now = Utc::now();
        let mut bucket = TokenBucket::full(BucketSpec::new(2, 60), now);

        assert!(bucket.try_consume(2, now).consumed);
        assert!(!bucket.try_consume(1, now).consumed);

        let later = now + chrono::Duration::seconds(30);
        let outcome = bucket.try_consume(1, later);
        assert!(outcome.consumed);
        assert_eq!(outcome.remaining_tokens, 0);
        assert_eq!(outcome.nanos_to_full_refill, 60 * 1_000_000_000);
    }

    #[test]
    fn test_token_bucket_refills_exactly_over_stepped_period() {
        let start = Utc::now();
        let mut bucket = TokenBucket::full(BucketSpec::new(3, 7), start);
        assert_eq!(bucket.consume_as_much_as_possible(3, start), 3);

        let available: Vec<u64> = (1..=7)
            .map(|second| {
                let at = start + chrono::Duration::seconds(second);
                bucket.snapshot(at).available_tokens
            })
            .collect();

        assert_eq!(available, vec![0, 0, 1, 1, 2, 2, 3]);
        assert!(bucket.is_full(start + chrono::Duration::seconds(7)));
    }

    #[test]
    fn test_refill_timer_counts_down_exactly() {
        let start = Utc::now();
        let mut bucket = TokenBucket::full(BucketSpec::new(3, 7), start);
        bucket.consume_as_much_as_possible(3, start);

        let snapshot = bucket.snapshot(start + chrono::Duration::milliseconds(2500));
        assert_eq!(snapshot.nanos_to_full_refill, 4_500_000_000);
    }

    #[test]
    fn test_token_bucket_never_overfills() {
        let now = Utc::now();
        let mut bucket = TokenBucket::full(BucketSpec::new(3, 60), now);
        bucket.try_consume(1, now);

        let snapshot = bucket.snapshot(now + chrono::Duration::hours(1));
        assert_eq!(snapshot.available_tokens, 3);
        assert_eq!(snapshot.nanos_to_full_refill, 0);
    }

    #[test]
    fn test_reconfigure_caps_tokens() {
        let now = Utc::now();
        let mut bucket = TokenBucket::full(BucketSpec::new(10, 60), now);
        bucket.reconfigure(BucketSpec::new(4, 60), now);
        assert_eq!(bucket.snapshot(now).available_tokens, 4);
    }

    #[tokio::test]
    async fn test_limit_bucket_rejects_when_empty() {
        let strategy = strategy(Arc::new(ManualClock::default()));
        let policy = Policy::with_limit(2, 60);

        let first = consume(&strategy, &policy, None).await;
        assert_eq!(first.remaining, Some(1));
        assert_eq!(first.reset_millis, 30_000);

        assert_eq!(consume(&strategy, &policy, None).await.remaining, Some(0));

        let rejected = consume(&strategy, &policy, None).await;
        assert_eq!(rejected.remaining, Some(-1));
        assert_eq!(rejected.reset_millis, 60_000);
    }

    #[tokio::test]
    async fn test_limit_bucket_refills_with_time() {
        let clock = Arc::new(ManualClock::default());
        let strategy = strategy(clock.clone());
        let policy = Policy::with_limit(2, 60);

        for _ in 0..3 {
            consume(&strategy, &policy, None).await;
        }
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(consume(&strategy, &policy, None).await.remaining, Some(0));
    }

    #[tokio::test]
    async fn test_quota_overrun_drains_bucket() {
        let strategy = strategy(Arc::new(ManualClock::default()));
        let policy = Policy::with_quota(1, 60);

        let rate = consume(&strategy, &policy, None).await;
        assert_eq!(rate.remaining_quota_millis, Some(1000));

        let rate = consume(&strategy, &policy, Some(700)).await;
        assert_eq!(rate.remaining_quota_millis, Some(300));

        let rate = consume(&strategy, &policy, Some(400)).await;
        assert_eq!(rate.remaining_quota_millis, Some(-1));
        assert_eq!(rate.reset_millis, 60_000);

        let rate = consume(&strategy, &policy, None).await;
        assert_eq!(rate.remaining_quota_millis, Some(-1));
    }

    #[tokio::test]
    async fn test_completion_peeks_limit_bucket() {
        let strategy = strategy(Arc::new(ManualClock::default()));
        let policy = Policy {
            limit: Some(2),
            quota: Some(10),
            ..Default::default()
        };

        consume(&strategy, &policy, None).await;
        let rate = consume(&strategy, &policy, Some(100)).await;
        assert_eq!(rate.remaining, Some(1));
        assert_eq!(rate.remaining_quota_millis, Some(9900));
    }

    struct UnavailableStore;

    #[async_trait]
    impl BucketStore for UnavailableStore {
        async fn try_consume(
            &self,
            _key: &str,
            _spec: BucketSpec,
            _tokens: u64,
        ) -> Result<ConsumptionProbe> {
            Err(RatewardenError::Storage("bucket store offline".to_string()))
        }

        async fn consume_as_much_as_possible(
            &self,
            _key: &str,
            _spec: BucketSpec,
            _limit: u64,
        ) -> Result<BucketSnapshot> {
            Err(RatewardenError::Storage("bucket store offline".to_string()))
        }

        async fn probe(&self, _key: &str, _spec: BucketSpec) -> Result<BucketSnapshot> {
            Err(RatewardenError::Storage("bucket store offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_keeps_window_estimate() {
        let errors = RecordingErrorHandler::default();
        let strategy = BucketStrategy::new(UnavailableStore);
        let policy = Policy::with_limit(5, 60);
        let mut rate = Rate::new_window(&policy, "k", Utc::now());

        strategy.apply(&policy, &mut rate, None, &errors).await;

        assert_eq!(rate.remaining, Some(5));
        assert_eq!(rate.reset_millis, 60_000);
        assert_eq!(errors.events(), vec!["error:Failed consuming bucket k"]);
    }

    #[tokio::test]
    async fn test_zero_elapsed_completion_only_peeks_quota() {
        let strategy = strategy(Arc::new(ManualClock::default()));
        let policy = Policy::with_quota(1, 60);

        consume(&strategy, &policy, Some(1000)).await;
        let rate = consume(&strategy, &policy, Some(0)).await;
        assert_eq!(rate.remaining_quota_millis, Some(-1));

        let snapshot = strategy
            .store()
            .probe("k-quota", BucketSpec::new(1000, 60))
            .await
            .unwrap();
        assert_eq!(snapshot.available_tokens, 0);
        assert_eq!(snapshot.nanos_to_full_refill, 60_000_000_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumes_admit_exactly_the_limit() {
        let strategy = Arc::new(strategy(Arc::new(ManualClock::default())));
        let policy = Policy::with_limit(32, 60);

        let tasks: Vec<_> = (0..33)
            .map(|_| {
                let strategy = strategy.clone();
                let policy = policy.clone();
                tokio::spawn(async move {
                    let mut rate = Rate::new_window(&policy, "k", Utc::now());
                    strategy
                        .apply(&policy, &mut rate, None, &LoggingErrorHandler)
                        .await;
                    rate.remaining
                })
            })
            .collect();

        let mut seen = Vec::new();
        for task in tasks {
            seen.push(task.await.unwrap().unwrap());
        }
        seen.sort_unstable();

        let expected: Vec<i64> = std::iter::once(-1).chain(0..32).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_refilled_buckets_are_swept() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryBucketStore::new(clock.clone());
        let spec = BucketSpec::new(5, 60);

        for i in 0..100 {
            let key = format!("client-{}", i);
            store.try_consume(&key, spec, 1).await.unwrap();
        }
        store.try_consume("busy", spec, 5).await.unwrap();
        assert_eq!(store.purge_full(), 0);

        clock.advance(chrono::Duration::seconds(60));
        store.try_consume("busy", spec, 5).await.unwrap();
        for _ in 102..SWEEP_INTERVAL {
            store.probe("busy", spec).await.unwrap();
        }
        assert_eq!(store.len(), 1);
    }
}
