//! Message endpoints: alternative ingestion and reconnect backfill

use std::sync::Arc;

use axum::Json;
use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use validator::Validate;

use crate::api::CoreContext;
use crate::api::auth::Identity;
use crate::api::types::{ApiError, clamp_limit};
use crate::api::ws::MessagePayload;
use crate::data::types::MessageKind;
use crate::domain::ingest::{IngestOutcome, SendMessageRequest};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    #[validate(length(min = 1, max = 256))]
    pub conversation_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<String>,
}

/// `POST /messages`: same contract as the socket `sendMessage`
pub async fn send_message(
    State(ctx): State<Arc<CoreContext>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<SendMessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    body.validate()
        .map_err(|e| ApiError::bad_request("VALIDATION", e.to_string()))?;

    let kind = match body.kind.as_deref() {
        None => MessageKind::Text,
        Some(raw) => MessageKind::parse(raw).ok_or_else(|| {
            ApiError::bad_request("VALIDATION", format!("unknown message type: {raw}"))
        })?,
    };

    let request = SendMessageRequest {
        conversation_id: body.conversation_id,
        content: body.content,
        kind,
        receiver_id: body.receiver_id,
        attachment_id: body.attachment_id,
    };

    let outcome = ctx
        .ingest
        .receive_message(&identity.id, request)
        .await
        .map_err(ApiError::from_ingest)?;

    let response = match &outcome {
        IngestOutcome::Sent(message) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "message": MessagePayload::from(message),
                "status": "SENT",
                "persisted": true
            })),
        ),
        IngestOutcome::Queued(message) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "messageId": message.id,
                "status": "QUEUED",
                "persisted": false
            })),
        ),
    };

    Ok(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillQuery {
    pub conversation_id: String,
    /// Epoch millis; only strictly older messages are returned
    #[serde(default)]
    pub before: Option<i64>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// `GET /messages?conversationId=&before=&limit=`: the backfill query a
/// reconnecting client uses to fetch what it missed, in `createdAt` order
pub async fn list_messages(
    State(ctx): State<Arc<CoreContext>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<BackfillQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let is_participant = ctx
        .rooms
        .is_participant(&identity.id, &query.conversation_id)
        .await
        .map_err(ApiError::from_room)?;
    if !is_participant {
        return Err(ApiError::forbidden(
            "NOT_PARTICIPANT",
            format!("{} is not a participant", identity.id),
        ));
    }

    let limit = clamp_limit(query.limit);
    let messages = ctx
        .gateway
        .list_messages(&query.conversation_id, query.before, limit)
        .await
        .map_err(ApiError::from_gateway)?;

    let data: Vec<MessagePayload> = messages.iter().map(MessagePayload::from).collect();
    Ok(Json(serde_json::json!({
        "data": data,
        "conversationId": query.conversation_id,
        "limit": limit
    })))
}
