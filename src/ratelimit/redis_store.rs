//! Redis-backed counters shared by every process pointing at the same server.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::info;

use super::counter::CounterStore;
use crate::error::Result;

/// Counters stored with `INCRBY` and expired with `EXPIRE`.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: MultiplexedConnection,
}

impl RedisCounterStore {
    /// Connect to the server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!(url = %url, "Connected to Redis");
        Ok(Self { connection })
    }

    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let mut connection = self.connection.clone();
        let current: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(by)
            .query_async(&mut connection)
            .await?;
        Ok(current)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }
}
