//! Rate limiter trait for abstracting over the configured storage strategy.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::bucket::{BucketStrategy, InMemoryBucketStore};
use super::clock::Clock;
use super::counter::{CounterStrategy, InMemoryCounterStore};
use super::engine::RateLimiter;
use super::handler::ErrorHandler;
use super::rate::Rate;
use super::redis_store::RedisCounterStore;
use super::stored::{InMemoryRateRepository, StoredRateStrategy};
use crate::config::{RateLimitSettings, RedisConfig, Repository};
use crate::error::Result;
use crate::policy::Policy;

/// Trait for rate limiter implementations.
///
/// This trait lets the gate work with whichever storage strategy the
/// configuration selects.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Consume capacity for `key` under `policy`.
    ///
    /// Called without `elapsed_millis` before the request is handled, which
    /// spends one request from the limit, and with the measured duration
    /// afterwards, which spends quota. Storage failures never surface here;
    /// they are reported to the error handler and the computed rate is
    /// returned regardless.
    async fn consume(&self, policy: &Policy, key: &str, elapsed_millis: Option<u64>) -> Rate;
}

/// Build the backend selected by `settings.repository`.
pub async fn build_backend(
    settings: &RateLimitSettings,
    redis: &RedisConfig,
    clock: Arc<dyn Clock>,
    errors: Arc<dyn ErrorHandler>,
) -> Result<Arc<dyn RateLimiterBackend>> {
    let backend: Arc<dyn RateLimiterBackend> = match settings.repository {
        Repository::InMemory => Arc::new(
            RateLimiter::new(StoredRateStrategy::new(InMemoryRateRepository::new()))
                .with_clock(clock)
                .with_error_handler(errors),
        ),
        Repository::Counter => Arc::new(
            RateLimiter::new(CounterStrategy::new(InMemoryCounterStore::new(clock.clone())))
                .with_clock(clock)
                .with_error_handler(errors),
        ),
        Repository::Redis => {
            let store = RedisCounterStore::connect(&redis.url).await?;
            Arc::new(
                RateLimiter::new(CounterStrategy::new(store))
                    .with_clock(clock)
                    .with_error_handler(errors),
            )
        }
        Repository::Bucket => Arc::new(
            RateLimiter::new(BucketStrategy::new(InMemoryBucketStore::new(clock.clone())))
                .with_clock(clock)
                .with_error_handler(errors),
        ),
    };

    info!(repository = ?settings.repository, "Rate limiter backend initialized");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LoggingErrorHandler, ManualClock};

    async fn backend_for(repository: Repository) -> Arc<dyn RateLimiterBackend> {
        let settings = RateLimitSettings {
            repository,
            ..Default::default()
        };
        build_backend(
            &settings,
            &RedisConfig::default(),
            Arc::new(ManualClock::default()),
            Arc::new(LoggingErrorHandler),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_every_local_repository_enforces_the_limit() {
        for repository in [Repository::InMemory, Repository::Counter, Repository::Bucket] {
            let backend = backend_for(repository).await;
            let policy = Policy::with_limit(1, 60);

            let first = backend.consume(&policy, "k", None).await;
            let second = backend.consume(&policy, "k", None).await;

            assert_eq!(first.remaining, Some(0), "{:?}", repository);
            assert_eq!(second.remaining, Some(-1), "{:?}", repository);
        }
    }

    #[tokio::test]
    async fn test_redis_backend_rejects_invalid_url() {
        let settings = RateLimitSettings {
            repository: Repository::Redis,
            ..Default::default()
        };
        let redis = RedisConfig {
            url: "not a redis url".to_string(),
        };

        let result = build_backend(
            &settings,
            &redis,
            Arc::new(ManualClock::default()),
            Arc::new(LoggingErrorHandler),
        )
        .await;
        assert!(result.is_err());
    }
}
