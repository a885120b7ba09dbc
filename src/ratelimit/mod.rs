//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod clock;
mod counter;
mod engine;
mod handler;
mod key;
mod rate;
mod redis_store;
mod stored;

pub use backend::{build_backend, RateLimiterBackend};
pub use bucket::{
    BucketSnapshot, BucketSpec, BucketStore, BucketStrategy, ConsumptionProbe,
    InMemoryBucketStore, TokenBucket,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterStore, CounterStrategy, InMemoryCounterStore, SWEEP_INTERVAL};
pub use engine::{ConsumeStrategy, RateLimiter};
pub use handler::{ErrorHandler, LoggingErrorHandler};
pub use key::{DefaultKeyGenerator, KeyGenerator, KEY_SEPARATOR, NO_ROUTE};
pub use rate::{remaining_after, Rate, EXHAUSTED};
pub use redis_store::RedisCounterStore;
pub use stored::{InMemoryRateRepository, RateRepository, StoredRateStrategy};

/// Suffix for keys that track quota rather than request count.
pub const QUOTA_SUFFIX: &str = "-quota";

/// The key a policy's quota is counted under.
pub fn quota_key(key: &str) -> String {
    format!("{}{}", key, QUOTA_SUFFIX)
}
