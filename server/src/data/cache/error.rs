//! Cache error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Connection error (Redis)
    #[error("connection error: {0}")]
    Connection(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend operation error
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        CacheError::Connection(err.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for CacheError {
    fn from(err: deadpool_redis::redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}
