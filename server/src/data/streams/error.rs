//! Stream error types

use thiserror::Error;

/// Error type for stream broker operations
#[derive(Debug, Error)]
pub enum StreamError {
    /// Broker unreachable beyond the embedded retry budget
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Transient broker error (retried inside append)
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Consumer group error
    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    /// Record encode/decode error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Malformed stream id or response
    #[error("stream error: {0}")]
    Stream(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<deadpool_redis::PoolError> for StreamError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        StreamError::Transient(err.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for StreamError {
    fn from(err: deadpool_redis::redis::RedisError) -> Self {
        StreamError::Transient(err.to_string())
    }
}
