//! Rate limiter using cache backend
//!
//! Implements a fixed window counter algorithm with burst allowance.
//!
//! # Algorithm
//!
//! Uses fixed time windows (default 60 seconds) with atomic counters.
//! Each window starts when the first request arrives and resets after the
//! window duration expires.
//!
//! # Known Limitations
//!
//! Fixed window algorithms allow up to 2x the limit at window boundaries.
//! This is acceptable here; senders that hit the limit get a typed
//! `RATE_LIMITED` error with a retry hint, not silent drops.

use std::sync::Arc;
use std::time::Duration;

use super::key::CacheKey;
use super::CacheService;
use crate::core::constants::DEFAULT_RATE_LIMIT_WINDOW_SECS;

/// Rate limit bucket configuration
#[derive(Debug, Clone)]
pub struct RateLimitBucket {
    /// Bucket name (e.g., "messages", "api", "files")
    pub name: &'static str,
    /// Maximum requests per window
    pub requests_per_window: u32,
    /// Window duration in seconds
    pub window_secs: u64,
    /// Burst allowance (additional requests above limit)
    pub burst: u32,
}

impl RateLimitBucket {
    /// Message sends (socket + HTTP ingest), keyed by sender identity
    pub fn messages(rpm: u32) -> Self {
        Self {
            name: "messages",
            requests_per_window: rpm,
            window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
            burst: rpm / 10,
        }
    }

    /// General API requests, keyed by identity
    pub fn api(rpm: u32) -> Self {
        Self {
            name: "api",
            requests_per_window: rpm,
            window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
            burst: rpm / 20,
        }
    }

    /// File uploads, keyed by identity
    pub fn files(rpm: u32) -> Self {
        Self {
            name: "files",
            requests_per_window: rpm,
            window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
            burst: rpm / 5,
        }
    }

    /// Get the total limit (requests + burst)
    pub fn total_limit(&self) -> u32 {
        self.requests_per_window.saturating_add(self.burst)
    }
}

/// Rate limit check result
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Requests remaining in window
    pub remaining: u32,
    /// Total limit (rpm + burst)
    pub limit: u32,
    /// Milliseconds until retry (only if blocked)
    pub retry_after_ms: Option<u64>,
}

/// Rate limiter using cache backend
pub struct RateLimiter {
    cache: Arc<CacheService>,
}

impl RateLimiter {
    pub fn new(cache: Arc<CacheService>) -> Self {
        Self { cache }
    }

    /// Check rate limit for identifier in bucket.
    ///
    /// Fails open: a cache error logs a warning and allows the request
    /// rather than blocking traffic on infrastructure trouble.
    pub async fn check(&self, bucket: &RateLimitBucket, identifier: &str) -> RateLimitResult {
        let key = CacheKey::rate_limit(bucket.name, identifier);
        let window = Duration::from_secs(bucket.window_secs);
        let limit = bucket.total_limit();

        let count = match self.cache.incr(&key, Some(window)).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, bucket = bucket.name, "Rate limit check failed, allowing");
                return RateLimitResult {
                    allowed: true,
                    remaining: limit,
                    limit,
                    retry_after_ms: None,
                };
            }
        };

        if count <= limit as i64 {
            RateLimitResult {
                allowed: true,
                remaining: limit.saturating_sub(count as u32),
                limit,
                retry_after_ms: None,
            }
        } else {
            let retry_after_ms = match self.cache.ttl(&key).await {
                Ok(Some(ttl)) => ttl.as_millis() as u64,
                _ => bucket.window_secs * 1_000,
            };
            RateLimitResult {
                allowed: false,
                remaining: 0,
                limit,
                retry_after_ms: Some(retry_after_ms),
            }
        }
    }
}
