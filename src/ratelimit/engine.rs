//! The consume engine shared by every storage strategy.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::handler::{ErrorHandler, LoggingErrorHandler};
use super::rate::Rate;
use crate::error::Result;
use crate::policy::Policy;

/// How a storage backend loads, updates and persists a [`Rate`].
///
/// Backends that keep whole rates implement `fetch` and `persist`; backends
/// that only keep counters or buckets leave both as no-ops, so every call
/// starts from a fresh window estimate and `apply` fills in the real values.
#[async_trait]
pub trait ConsumeStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Load the stored rate for `key`, if this backend keeps one.
    async fn fetch(&self, _key: &str) -> Result<Option<Rate>> {
        Ok(None)
    }

    /// Spend capacity. `elapsed_millis` is `None` before the request is
    /// handled and the measured duration afterwards.
    async fn apply(
        &self,
        policy: &Policy,
        rate: &mut Rate,
        elapsed_millis: Option<u64>,
        errors: &dyn ErrorHandler,
    );

    /// Persist the updated rate.
    async fn persist(&self, _rate: &Rate) -> Result<()> {
        Ok(())
    }
}

/// Runs fetch, expiry, arithmetic and persist for one strategy.
pub struct RateLimiter<S> {
    strategy: S,
    clock: Arc<dyn Clock>,
    errors: Arc<dyn ErrorHandler>,
    /// Per-key local mutexes, not a distributed lock: they only order the
    /// consumes this process issues for one key. Cross-process atomicity is
    /// the store's job. An entry lives only while some consume holds it.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: ConsumeStrategy> RateLimiter<S> {
    /// Create an engine using the system clock and logging error handler.
    pub fn new(strategy: S) -> Self {
        Self {
            strategy,
            clock: Arc::new(SystemClock),
            errors: Arc::new(LoggingErrorHandler),
            locks: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_error_handler(mut self, errors: Arc<dyn ErrorHandler>) -> Self {
        self.errors = errors;
        self
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Consume capacity for `key` and return the resulting view.
    pub async fn consume(&self, policy: &Policy, key: &str, elapsed_millis: Option<u64>) -> Rate {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        let rate = {
            let _guard = lock.lock().await;
            self.consume_locked(policy, key, elapsed_millis).await
        };

        drop(lock);
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        rate
    }

    async fn consume_locked(&self, policy: &Policy, key: &str, elapsed_millis: Option<u64>) -> Rate {
        let now = self.clock.now();

        let stored = match self.strategy.fetch(key).await {
            Ok(rate) => rate,
            Err(e) => {
                self.errors.handle_fetch_error(key, &e);
                None
            }
        };

        let mut rate = match stored {
            Some(mut rate) if !rate.is_expired(now) => {
                if rate.reset_millis > 0 {
                    rate.refresh_reset(now);
                }
                rate
            }
            _ => {
                debug!(
                    key = %key,
                    strategy = self.strategy.name(),
                    refresh_interval = policy.refresh_interval,
                    "Starting new rate window"
                );
                Rate::new_window(policy, key, now)
            }
        };

        self.strategy
            .apply(policy, &mut rate, elapsed_millis, self.errors.as_ref())
            .await;

        if let Err(e) = self.strategy.persist(&rate).await {
            self.errors.handle_save_error(key, &e);
        }

        trace!(
            key = %key,
            strategy = self.strategy.name(),
            elapsed_millis = ?elapsed_millis,
            remaining = ?rate.remaining,
            remaining_quota_millis = ?rate.remaining_quota_millis,
            reset_millis = rate.reset_millis,
            "Consumed rate"
        );

        rate
    }
}

#[async_trait]
impl<S: ConsumeStrategy> RateLimiterBackend for RateLimiter<S> {
    async fn consume(&self, policy: &Policy, key: &str, elapsed_millis: Option<u64>) -> Rate {
        RateLimiter::consume(self, policy, key, elapsed_millis).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RatewardenError;
    use crate::ratelimit::handler::testing::RecordingErrorHandler;
    use crate::ratelimit::stored::{InMemoryRateRepository, RateRepository, StoredRateStrategy};
    use crate::ratelimit::ManualClock;
    use chrono::Duration;
    use tokio::sync::Notify;

    fn limiter(
        clock: Arc<ManualClock>,
    ) -> RateLimiter<StoredRateStrategy<InMemoryRateRepository>> {
        RateLimiter::new(StoredRateStrategy::new(InMemoryRateRepository::new())).with_clock(clock)
    }

    /// Repository whose reads and writes can be made to fail.
    #[derive(Default)]
    struct FlakyRepository {
        inner: InMemoryRateRepository,
        fail_find: bool,
        fail_save: bool,
    }

    #[async_trait]
    impl RateRepository for FlakyRepository {
        async fn find(&self, key: &str) -> Result<Option<Rate>> {
            if self.fail_find {
                return Err(RatewardenError::Storage("read timed out".to_string()));
            }
            self.inner.find(key).await
        }

        async fn save(&self, rate: &Rate) -> Result<()> {
            if self.fail_save {
                return Err(RatewardenError::Storage("write rejected".to_string()));
            }
            self.inner.save(rate).await
        }
    }

    #[tokio::test]
    async fn test_limit_counts_down_then_floors() {
        let limiter = limiter(Arc::new(ManualClock::default()));
        let policy = Policy::with_limit(3, 60);

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(limiter.consume(&policy, "k", None).await.remaining);
        }
        assert_eq!(seen, vec![Some(2), Some(1), Some(0), Some(-1), Some(-1)]);
    }

    #[tokio::test]
    async fn test_new_window_after_expiry() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(clock.clone());
        let policy = Policy::with_limit(2, 60);

        for _ in 0..3 {
            limiter.consume(&policy, "k", None).await;
        }
        clock.advance(Duration::seconds(59));
        assert_eq!(limiter.consume(&policy, "k", None).await.remaining, Some(-1));

        clock.advance(Duration::seconds(1));
        let rate = limiter.consume(&policy, "k", None).await;
        assert_eq!(rate.remaining, Some(1));
        assert_eq!(rate.reset_millis, 60_000);
    }

    #[tokio::test]
    async fn test_reset_counts_down_within_window() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(clock.clone());
        let policy = Policy::with_limit(5, 60);

        assert_eq!(limiter.consume(&policy, "k", None).await.reset_millis, 60_000);
        clock.advance(Duration::seconds(20));
        assert_eq!(limiter.consume(&policy, "k", None).await.reset_millis, 40_000);
    }

    #[tokio::test]
    async fn test_quota_only_spent_after_request() {
        let limiter = limiter(Arc::new(ManualClock::default()));
        let policy = Policy::with_quota(1, 60);

        let rate = limiter.consume(&policy, "k", None).await;
        assert_eq!(rate.remaining_quota_millis, Some(1000));
        assert_eq!(rate.remaining, None);

        let rate = limiter.consume(&policy, "k", Some(700)).await;
        assert_eq!(rate.remaining_quota_millis, Some(300));

        let rate = limiter.consume(&policy, "k", Some(400)).await;
        assert_eq!(rate.remaining_quota_millis, Some(-1));
        assert!(limiter.consume(&policy, "k", None).await.is_exceeded());
    }

    #[tokio::test]
    async fn test_phase_b_does_not_spend_limit() {
        let limiter = limiter(Arc::new(ManualClock::default()));
        let policy = Policy {
            limit: Some(2),
            quota: Some(10),
            ..Default::default()
        };

        limiter.consume(&policy, "k", None).await;
        let rate = limiter.consume(&policy, "k", Some(250)).await;
        assert_eq!(rate.remaining, Some(1));
        assert_eq!(rate.remaining_quota_millis, Some(9750));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter(Arc::new(ManualClock::default()));
        let policy = Policy::with_limit(1, 60);

        assert_eq!(limiter.consume(&policy, "a", None).await.remaining, Some(0));
        assert_eq!(limiter.consume(&policy, "b", None).await.remaining, Some(0));
    }

    #[tokio::test]
    async fn test_fetch_failure_starts_new_window() {
        let errors = Arc::new(RecordingErrorHandler::default());
        let repository = FlakyRepository {
            fail_find: true,
            ..Default::default()
        };
        let limiter = RateLimiter::new(StoredRateStrategy::new(repository))
            .with_clock(Arc::new(ManualClock::default()))
            .with_error_handler(errors.clone());
        let policy = Policy::with_limit(2, 60);

        for _ in 0..3 {
            assert_eq!(limiter.consume(&policy, "k", None).await.remaining, Some(1));
        }
        assert_eq!(errors.events(), vec!["fetch:k", "fetch:k", "fetch:k"]);
    }

    #[tokio::test]
    async fn test_save_failure_still_returns_rate() {
        let errors = Arc::new(RecordingErrorHandler::default());
        let repository = FlakyRepository {
            fail_save: true,
            ..Default::default()
        };
        let limiter = RateLimiter::new(StoredRateStrategy::new(repository))
            .with_clock(Arc::new(ManualClock::default()))
            .with_error_handler(errors.clone());

        let rate = limiter.consume(&Policy::with_limit(0, 60), "k", None).await;
        assert_eq!(rate.remaining, Some(-1));
        assert!(rate.is_exceeded());
        assert_eq!(errors.events(), vec!["save:k"]);
    }

    #[tokio::test]
    async fn test_concurrent_consumes_are_serialized() {
        let limiter = Arc::new(limiter(Arc::new(ManualClock::default())));
        let policy = Policy::with_limit(50, 60);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                let policy = policy.clone();
                tokio::spawn(async move { limiter.consume(&policy, "k", None).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(limiter.consume(&policy, "k", None).await.remaining, Some(-1));
    }

    #[tokio::test]
    async fn test_oversized_interval_consumes_without_overflow() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(clock.clone());
        let policy = Policy::with_limit(1, 10_000_000_000_000);

        assert_eq!(limiter.consume(&policy, "k", None).await.remaining, Some(0));
        clock.advance(Duration::days(365));
        let rate = limiter.consume(&policy, "k", None).await;
        assert_eq!(rate.remaining, Some(-1));
        assert!(rate.reset_millis > 0);
    }

    /// Holds consumes of the key "slow" until released.
    #[derive(Default)]
    struct GatedStrategy {
        release: Notify,
    }

    #[async_trait]
    impl ConsumeStrategy for GatedStrategy {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn apply(
            &self,
            _policy: &Policy,
            rate: &mut Rate,
            _elapsed_millis: Option<u64>,
            _errors: &dyn ErrorHandler,
        ) {
            if rate.key == "slow" {
                self.release.notified().await;
            }
        }
    }

    #[tokio::test]
    async fn test_consumes_for_other_keys_are_not_blocked() {
        let limiter = Arc::new(RateLimiter::new(GatedStrategy::default()));
        let policy = Policy::with_limit(5, 60);

        let slow = {
            let limiter = limiter.clone();
            let policy = policy.clone();
            tokio::spawn(async move { limiter.consume(&policy, "slow", None).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.locks.len(), 1);

        let fast = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            limiter.consume(&policy, "fast", None),
        )
        .await;
        assert!(fast.is_ok());

        limiter.strategy().release.notify_one();
        slow.await.unwrap();
        assert!(limiter.locks.is_empty());
    }
}
