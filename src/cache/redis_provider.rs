use crate::cache::provider::MAX_TTL;
use crate::cache::CacheProvider;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;

/// Redis-backed provider. `set_if_absent` maps to `SET NX PX`, so leases stay
/// mutually exclusive across processes.
#[derive(Clone)]
pub struct RedisProvider {
    connection: MultiplexedConnection,
}

impl RedisProvider {
    /// Opens a multiplexed connection and verifies it with `PING`.
    pub async fn connect(client: redis::Client) -> Result<Self> {
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)?;

        let _: () = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(AppError::Redis)?;

        Ok(Self { connection })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.min(MAX_TTL).as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

#[async_trait]
impl CacheProvider for RedisProvider {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok(result.is_some())
    }
}
