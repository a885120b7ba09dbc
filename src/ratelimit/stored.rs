//! Strategy that loads and saves whole [`Rate`] records.

use async_trait::async_trait;
use dashmap::DashMap;

use super::engine::ConsumeStrategy;
use super::handler::ErrorHandler;
use super::rate::{remaining_after, saturating_i64, Rate};
use crate::error::Result;
use crate::policy::Policy;

/// Key-value storage for rates.
#[async_trait]
pub trait RateRepository: Send + Sync {
    async fn find(&self, key: &str) -> Result<Option<Rate>>;
    async fn save(&self, rate: &Rate) -> Result<()>;
}

/// Process-local rate storage.
///
/// Entries are replaced when their window expires but never removed.
#[derive(Debug, Default)]
pub struct InMemoryRateRepository {
    rates: DashMap<String, Rate>,
}

impl InMemoryRateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

#[async_trait]
impl RateRepository for InMemoryRateRepository {
    async fn find(&self, key: &str) -> Result<Option<Rate>> {
        Ok(self.rates.get(key).map(|entry| entry.value().clone()))
    }

    async fn save(&self, rate: &Rate) -> Result<()> {
        self.rates.insert(rate.key.clone(), rate.clone());
        Ok(())
    }
}

/// Decrements the stored rate in place.
#[derive(Debug, Default)]
pub struct StoredRateStrategy<R> {
    repository: R,
}

impl<R: RateRepository> StoredRateStrategy<R> {
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }
}

#[async_trait]
impl<R: RateRepository> ConsumeStrategy for StoredRateStrategy<R> {
    fn name(&self) -> &'static str {
        "stored"
    }

    async fn fetch(&self, key: &str) -> Result<Option<Rate>> {
        self.repository.find(key).await
    }

    async fn apply(
        &self,
        policy: &Policy,
        rate: &mut Rate,
        elapsed_millis: Option<u64>,
        _errors: &dyn ErrorHandler,
    ) {
        match elapsed_millis {
            None => {
                if policy.limit.is_some() {
                    let remaining = rate.remaining.unwrap_or(0);
                    rate.remaining = Some(remaining_after(remaining, 1));
                }
            }
            Some(elapsed) => {
                if policy.quota.is_some() {
                    let remaining = rate.remaining_quota_millis.unwrap_or(0);
                    rate.remaining_quota_millis =
                        Some(remaining_after(remaining, saturating_i64(elapsed)));
                }
            }
        }
    }

    async fn persist(&self, rate: &Rate) -> Result<()> {
        self.repository.save(rate).await
    }
}
