//! Shared API types
//!
//! Error responses and pagination parsing used across endpoints. The error
//! taxonomy mirrors the pipeline's: validation, authorization and
//! not-found surface immediately as 4xx; circuit/transient conditions as
//! 503 with the degraded paths already engaged underneath.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::core::constants::{DEFAULT_BACKFILL_LIMIT, MAX_BACKFILL_LIMIT};
use crate::data::files::FileError;
use crate::domain::gateway::GatewayError;
use crate::domain::ingest::IngestError;
use crate::domain::rooms::RoomError;
use crate::domain::status::StatusError;

/// Standard API error response
#[derive(Debug)]
pub enum ApiError {
    BadRequest { code: String, message: String },
    NotFound { code: String, message: String },
    Unauthorized { code: String, message: String },
    Forbidden { code: String, message: String },
    Conflict { code: String, message: String },
    TooManyRequests { retry_after_ms: u64 },
    PayloadTooLarge { message: String },
    ServiceUnavailable { message: String },
    Internal { message: String },
}

impl ApiError {
    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotFound {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unauthorized {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Forbidden {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    pub fn from_gateway(e: GatewayError) -> Self {
        match e {
            GatewayError::Conflict(msg) => Self::conflict("CONFLICT", msg),
            GatewayError::CircuitOpen | GatewayError::Timeout | GatewayError::TransientStore(_) => {
                Self::service_unavailable("store temporarily unavailable")
            }
            GatewayError::Unrecoverable(_) => {
                tracing::error!(error = %e, "Store error");
                Self::internal("store operation failed")
            }
        }
    }

    pub fn from_room(e: RoomError) -> Self {
        match e {
            RoomError::NotFound(id) => {
                Self::not_found("CONVERSATION_NOT_FOUND", format!("conversation {id}"))
            }
            RoomError::NotParticipant { .. } => {
                Self::forbidden("NOT_PARTICIPANT", e.to_string())
            }
            RoomError::Forbidden { .. } => Self::forbidden("FORBIDDEN", e.to_string()),
            RoomError::Store(e) => Self::from_gateway(e),
        }
    }

    pub fn from_status(e: StatusError) -> Self {
        match e {
            StatusError::NotFound(what) => Self::not_found("NOT_FOUND", what),
            StatusError::NotParticipant { .. } => Self::forbidden("NOT_PARTICIPANT", e.to_string()),
            StatusError::Store(e) => Self::from_gateway(e),
            StatusError::Broker(e) => {
                tracing::error!(error = %e, "Broker error");
                Self::service_unavailable("stream broker unavailable")
            }
        }
    }

    pub fn from_ingest(e: IngestError) -> Self {
        match e {
            IngestError::Validation(msg) => Self::bad_request("VALIDATION", msg),
            IngestError::Authorization(msg) => Self::forbidden("NOT_AUTHORIZED", msg),
            IngestError::NotFound(what) => {
                Self::not_found("CONVERSATION_NOT_FOUND", format!("conversation {what}"))
            }
            IngestError::RateLimited { retry_after_ms } => {
                Self::TooManyRequests { retry_after_ms }
            }
            IngestError::Broker(e) => {
                tracing::error!(error = %e, "Broker error in ingest");
                Self::service_unavailable("stream broker unavailable")
            }
            IngestError::Unrecoverable(msg) => {
                tracing::error!(error = %msg, "Unrecoverable ingest error");
                Self::internal("message could not be accepted")
            }
        }
    }

    pub fn from_file(e: FileError) -> Self {
        match e {
            FileError::Disabled => {
                Self::forbidden("FILES_DISABLED", "file storage is disabled")
            }
            FileError::Empty => Self::bad_request("FILE_EMPTY", "file is empty"),
            FileError::TooLarge { size, max } => Self::PayloadTooLarge {
                message: format!("file is {size} bytes, maximum is {max}"),
            },
            FileError::NotFound(id) => Self::not_found("FILE_NOT_FOUND", format!("file {id}")),
            FileError::NotReady(id, status) => {
                Self::conflict("FILE_NOT_READY", format!("file {id} is {status}"))
            }
            FileError::Backend(_) | FileError::Io(_) => {
                tracing::error!(error = %e, "File storage error");
                Self::internal("file storage failed")
            }
            FileError::Store(e) => Self::from_gateway(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, code, message, retry_after_ms) = match self {
            Self::BadRequest { code, message } => {
                (StatusCode::BAD_REQUEST, "bad_request", code, message, None)
            }
            Self::NotFound { code, message } => {
                (StatusCode::NOT_FOUND, "not_found", code, message, None)
            }
            Self::Unauthorized { code, message } => {
                (StatusCode::UNAUTHORIZED, "unauthorized", code, message, None)
            }
            Self::Forbidden { code, message } => {
                (StatusCode::FORBIDDEN, "forbidden", code, message, None)
            }
            Self::Conflict { code, message } => {
                (StatusCode::CONFLICT, "conflict", code, message, None)
            }
            Self::TooManyRequests { retry_after_ms } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "RATE_LIMITED".to_string(),
                "rate limit exceeded".to_string(),
                Some(retry_after_ms),
            ),
            Self::PayloadTooLarge { message } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                "PAYLOAD_TOO_LARGE".to_string(),
                message,
                None,
            ),
            Self::ServiceUnavailable { message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "SERVICE_UNAVAILABLE".to_string(),
                message,
                None,
            ),
            Self::Internal { message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "INTERNAL".to_string(),
                message,
                None,
            ),
        };

        let mut body = serde_json::json!({
            "error": error_type,
            "code": code,
            "message": message
        });
        if let Some(retry_after_ms) = retry_after_ms {
            body["retry_after_ms"] = retry_after_ms.into();
        }

        (status, Json(body)).into_response()
    }
}

/// Clamp a backfill limit into `[1, MAX_BACKFILL_LIMIT]`
pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit
        .unwrap_or(DEFAULT_BACKFILL_LIMIT)
        .clamp(1, MAX_BACKFILL_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), DEFAULT_BACKFILL_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10)), 10);
        assert_eq!(clamp_limit(Some(5_000)), MAX_BACKFILL_LIMIT);
    }

    #[test]
    fn test_gateway_mapping() {
        assert!(matches!(
            ApiError::from_gateway(GatewayError::CircuitOpen),
            ApiError::ServiceUnavailable { .. }
        ));
        assert!(matches!(
            ApiError::from_gateway(GatewayError::Conflict("dup".into())),
            ApiError::Conflict { .. }
        ));
    }

    #[test]
    fn test_ingest_mapping() {
        assert!(matches!(
            ApiError::from_ingest(IngestError::Validation("empty".into())),
            ApiError::BadRequest { .. }
        ));
        assert!(matches!(
            ApiError::from_ingest(IngestError::RateLimited { retry_after_ms: 5 }),
            ApiError::TooManyRequests { retry_after_ms: 5 }
        ));
    }
}
