//! Per-identity rate limiting middleware
//!
//! Runs after authentication: the bucket key is the verified identity.
//! Exceeding the window answers 429 with a `retry_after_ms` hint, the
//! closed-loop back-pressure the socket path mirrors with
//! `message_error{code: RATE_LIMITED}`.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use super::auth::Identity;
use super::types::ApiError;
use crate::data::cache::{RateLimitBucket, RateLimiter};

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub bucket: RateLimitBucket,
    pub enabled: bool,
}

pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.enabled {
        return Ok(next.run(request).await);
    }

    let identity = request
        .extensions()
        .get::<Identity>()
        .map(|i| i.id.clone())
        .unwrap_or_else(|| "anonymous".to_string());

    let result = state.limiter.check(&state.bucket, &identity).await;
    if !result.allowed {
        tracing::debug!(
            identity = %identity,
            bucket = state.bucket.name,
            "Rate limit exceeded"
        );
        return Err(ApiError::TooManyRequests {
            retry_after_ms: result.retry_after_ms.unwrap_or(0),
        });
    }

    Ok(next.run(request).await)
}
