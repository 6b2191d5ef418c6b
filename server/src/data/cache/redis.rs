//! Redis cache backend
//!
//! Keys live under `{courier}:cache:` (hash tag for cluster compatibility).
//! `incr` uses INCR + PEXPIRE-on-create, the same fixed-window pattern the
//! rate limiter expects.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::Value as RedisValue;
use deadpool_redis::{Config, Pool, Runtime};

use super::backend::CacheBackend;
use super::error::CacheError;

/// Cache key prefix (hash tag for Redis Cluster)
const CACHE_PREFIX: &str = "{courier}:cache:";

/// SCAN page size for delete_pattern
const SCAN_COUNT: usize = 500;

/// Redis cache backend
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub async fn new(redis_url: &str) -> Result<Self, CacheError> {
        let mut config = Config::from_url(redis_url);
        config.pool = Some(deadpool_redis::PoolConfig {
            max_size: 16,
            timeouts: deadpool_redis::Timeouts {
                wait: Some(Duration::from_secs(5)),
                create: Some(Duration::from_secs(5)),
                recycle: Some(Duration::from_secs(5)),
            },
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Config(format!("Failed to create Redis pool: {e}")))?;

        // Validate connection
        let mut conn = pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        deadpool_redis::redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| CacheError::Connection(format!("Redis PING failed: {e}")))?;

        tracing::debug!("Redis cache backend connected");
        Ok(Self { pool })
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}{}", CACHE_PREFIX, key)
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = deadpool_redis::redis::cmd("GET")
            .arg(self.cache_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        let mut cmd = deadpool_redis::redis::cmd("SET");
        cmd.arg(self.cache_key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: String = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = deadpool_redis::redis::cmd("DEL")
            .arg(self.cache_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.pool.get().await?;
        let exists: i64 = deadpool_redis::redis::cmd("EXISTS")
            .arg(self.cache_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(exists > 0)
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, CacheError> {
        let key = self.cache_key(key);
        let mut conn = self.pool.get().await?;

        let count: i64 = deadpool_redis::redis::cmd("INCR")
            .arg(&key)
            .query_async(&mut conn)
            .await?;

        // First increment created the key: start the window
        if count == 1
            && let Some(ttl) = ttl
        {
            let _: i64 = deadpool_redis::redis::cmd("PEXPIRE")
                .arg(&key)
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
        }

        Ok(count)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.pool.get().await?;
        let millis: i64 = deadpool_redis::redis::cmd("PTTL")
            .arg(self.cache_key(key))
            .query_async(&mut conn)
            .await?;
        // -1 = no expiry, -2 = no key
        if millis < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(millis as u64)))
        }
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut conn = self.pool.get().await?;
        let full_pattern = self.cache_key(pattern);
        let mut cursor: u64 = 0;
        let mut deleted = 0u64;

        loop {
            let reply: RedisValue = deadpool_redis::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            let RedisValue::Array(parts) = reply else {
                return Err(CacheError::Backend("unexpected SCAN reply".to_string()));
            };
            if parts.len() < 2 {
                return Err(CacheError::Backend("unexpected SCAN reply".to_string()));
            }

            cursor = match &parts[0] {
                RedisValue::BulkString(bytes) => String::from_utf8_lossy(bytes)
                    .parse()
                    .map_err(|_| CacheError::Backend("bad SCAN cursor".to_string()))?,
                RedisValue::Int(i) => *i as u64,
                _ => return Err(CacheError::Backend("bad SCAN cursor".to_string())),
            };

            if let RedisValue::Array(keys) = &parts[1]
                && !keys.is_empty()
            {
                let mut cmd = deadpool_redis::redis::cmd("DEL");
                for key in keys {
                    if let RedisValue::BulkString(bytes) = key {
                        cmd.arg(&bytes[..]);
                    }
                }
                let removed: i64 = cmd.query_async(&mut conn).await?;
                deleted += removed.max(0) as u64;
            }

            if cursor == 0 {
                break;
            }
        }

        Ok(deleted)
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        deadpool_redis::redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_prefix() {
        let key = format!("{}{}", CACHE_PREFIX, "presence:alice");
        assert_eq!(key, "{courier}:cache:presence:alice");
    }
}
