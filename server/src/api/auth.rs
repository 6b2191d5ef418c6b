//! Identity claim verification
//!
//! The core never issues tokens: it consumes HS256-signed identity claims
//! minted by the portal's auth service and verifies them with a shared
//! secret. The same verifier backs the HTTP bearer middleware and the
//! socket `authenticate` handshake.

use axum::extract::Request;
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use rand::RngCore;
use serde::Deserialize;
use thiserror::Error;

use super::types::ApiError;
use crate::core::config::AuthConfig;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,

    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),
}

impl AuthError {
    pub const fn code(&self) -> &'static str {
        match self {
            AuthError::Missing => "AUTH_MISSING",
            AuthError::Expired => "AUTH_EXPIRED",
            AuthError::Invalid(_) => "AUTH_INVALID",
        }
    }
}

/// Verified identity attached to requests and sockets
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdentityClaims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

pub struct AuthVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Build from config. Without a configured secret a random per-process
    /// one is generated: every token verification will fail, which is the
    /// safe default, and the log says how to fix it.
    pub fn from_config(config: &AuthConfig) -> Self {
        match &config.secret {
            Some(secret) => Self::new(secret.as_bytes()),
            None => {
                tracing::warn!(
                    "No auth secret configured; generated a random one. \
                     Set COURIER_AUTH_SECRET to accept externally issued identity claims."
                );
                let mut secret = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                Self::new(&secret)
            }
        }
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".to_string()));
        }

        Ok(Identity {
            id: data.claims.sub,
            display_name: data.claims.name,
        })
    }
}

/// Require a bearer identity claim; inserts `Identity` as an extension
pub async fn require_auth(mut request: Request, next: Next) -> Result<Response, ApiError> {
    let verifier = request
        .extensions()
        .get::<std::sync::Arc<AuthVerifier>>()
        .cloned()
        .ok_or_else(|| ApiError::internal("auth verifier not installed"))?;

    let token = bearer_token(&request).ok_or_else(|| {
        ApiError::unauthorized(AuthError::Missing.code(), "missing bearer token")
    })?;

    let identity = verifier
        .verify(&token)
        .map_err(|e| ApiError::unauthorized(e.code(), e.to_string()))?;

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

fn bearer_token(request: &Request) -> Option<String> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::to_string)
}

#[cfg(test)]
pub(crate) fn issue_token(secret: &[u8], sub: &str, ttl_secs: i64) -> String {
    use jsonwebtoken::{EncodingKey, Header, encode};

    #[derive(serde::Serialize)]
    struct Claims<'a> {
        sub: &'a str,
        name: Option<&'a str>,
        exp: i64,
    }

    encode(
        &Header::new(Algorithm::HS256),
        &Claims {
            sub,
            name: Some(sub),
            exp: chrono::Utc::now().timestamp() + ttl_secs,
        },
        &EncodingKey::from_secret(secret),
    )
    .unwrap()
}
