//! Conversation endpoints: listing, creation, membership management

use std::sync::Arc;

use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::api::CoreContext;
use crate::api::auth::Identity;
use crate::api::types::ApiError;
use crate::data::types::{Conversation, ConversationKind, Participant, ParticipantRole};
use crate::domain::gateway::GatewayError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
    pub last_activity: i64,
}

impl From<&Conversation> for ConversationView {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id.clone(),
            kind: conversation.kind.as_str(),
            created_by: conversation.created_by.clone(),
            last_message_id: conversation.last_message_id.clone(),
            last_activity: conversation.last_activity,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub user_id: String,
    pub role: &'static str,
    pub unread_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<i64>,
    pub is_muted: bool,
    pub is_archived: bool,
}

impl From<&Participant> for ParticipantView {
    fn from(participant: &Participant) -> Self {
        Self {
            user_id: participant.user_id.clone(),
            role: participant.role.as_str(),
            unread_count: participant.unread_count,
            last_read_at: participant.last_read_at,
            is_muted: participant.is_muted,
            is_archived: participant.is_archived,
        }
    }
}

/// `GET /conversations`: the caller's conversations, most active first
pub async fn list_conversations(
    State(ctx): State<Arc<CoreContext>>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = ctx
        .gateway
        .list_conversations(&identity.id)
        .await
        .map_err(ApiError::from_gateway)?;

    let data: Vec<serde_json::Value> = conversations
        .iter()
        .map(|(conversation, participant)| {
            serde_json::json!({
                "conversation": ConversationView::from(conversation),
                "membership": ParticipantView::from(participant),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({ "data": data })))
}

/// `GET /conversations/{id}`: metadata plus the participant roster
pub async fn get_conversation(
    State(ctx): State<Arc<CoreContext>>,
    Extension(identity): Extension<Identity>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let meta = ctx
        .rooms
        .meta(&conversation_id)
        .await
        .map_err(ApiError::from_room)?;

    if meta.participant(&identity.id).is_none() {
        return Err(ApiError::forbidden(
            "NOT_PARTICIPANT",
            format!("{} is not a participant", identity.id),
        ));
    }

    let participants: Vec<ParticipantView> =
        meta.participants.iter().map(ParticipantView::from).collect();
    let members_online = ctx
        .rooms
        .members_online(&conversation_id, &ctx.presence)
        .await
        .map_err(ApiError::from_room)?;

    Ok(Json(serde_json::json!({
        "conversation": ConversationView::from(&meta.conversation),
        "participants": participants,
        "membersOnline": members_online,
    })))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationBody {
    #[serde(rename = "type")]
    pub kind: String,
    /// Other participants; the caller joins as OWNER automatically
    #[validate(length(max = 256))]
    pub participant_ids: Vec<String>,
}

/// `POST /conversations`: create PRIVATE/GROUP/BROADCAST. Creating a
/// PRIVATE conversation for a pair that already has one returns the
/// existing conversation.
pub async fn create_conversation(
    State(ctx): State<Arc<CoreContext>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CreateConversationBody>,
) -> Result<impl IntoResponse, ApiError> {
    body.validate()
        .map_err(|e| ApiError::bad_request("VALIDATION", e.to_string()))?;

    let kind = ConversationKind::parse(&body.kind).ok_or_else(|| {
        ApiError::bad_request("VALIDATION", format!("unknown conversation type: {}", body.kind))
    })?;

    let mut participants: Vec<(String, ParticipantRole)> =
        vec![(identity.id.clone(), ParticipantRole::Owner)];
    for user_id in &body.participant_ids {
        if *user_id != identity.id {
            participants.push((user_id.clone(), ParticipantRole::Member));
        }
    }

    if kind == ConversationKind::Private && participants.len() != 2 {
        return Err(ApiError::bad_request(
            "VALIDATION",
            "a private conversation needs exactly one other participant",
        ));
    }

    match ctx
        .rooms
        .create_conversation(kind, &identity.id, &participants)
        .await
    {
        Ok(conversation) => Ok((
            StatusCode::CREATED,
            Json(serde_json::json!({ "conversation": ConversationView::from(&conversation) })),
        )),
        Err(crate::domain::rooms::RoomError::Store(GatewayError::Conflict(_)))
            if kind == ConversationKind::Private =>
        {
            // The pair already talks; hand back the existing conversation
            let existing = ctx
                .gateway
                .get_private_by_pair(&identity.id, &participants[1].0)
                .await
                .map_err(ApiError::from_gateway)?
                .ok_or_else(|| ApiError::internal("conflicting conversation vanished"))?;
            Ok((
                StatusCode::OK,
                Json(serde_json::json!({ "conversation": ConversationView::from(&existing) })),
            ))
        }
        Err(e) => Err(ApiError::from_room(e)),
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddParticipantBody {
    #[validate(length(min = 1, max = 256))]
    pub user_id: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// `POST /conversations/{id}/participants`: OWNER/ADMIN only
pub async fn add_participant(
    State(ctx): State<Arc<CoreContext>>,
    Extension(identity): Extension<Identity>,
    Path(conversation_id): Path<String>,
    Json(body): Json<AddParticipantBody>,
) -> Result<impl IntoResponse, ApiError> {
    body.validate()
        .map_err(|e| ApiError::bad_request("VALIDATION", e.to_string()))?;

    let role = match body.role.as_deref() {
        None => ParticipantRole::Member,
        Some("OWNER") => {
            return Err(ApiError::bad_request(
                "VALIDATION",
                "a conversation has exactly one owner",
            ));
        }
        Some(raw) => ParticipantRole::parse(raw).ok_or_else(|| {
            ApiError::bad_request("VALIDATION", format!("unknown role: {raw}"))
        })?,
    };

    let added = ctx
        .rooms
        .add_participant(&identity.id, &conversation_id, &body.user_id, role)
        .await
        .map_err(ApiError::from_room)?;

    let status = if added {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(serde_json::json!({ "userId": body.user_id, "added": added })),
    ))
}

/// `DELETE /conversations/{id}/participants/{user_id}`: OWNER/ADMIN only
pub async fn remove_participant(
    State(ctx): State<Arc<CoreContext>>,
    Extension(identity): Extension<Identity>,
    Path((conversation_id, user_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = ctx
        .rooms
        .remove_participant(&identity.id, &conversation_id, &user_id)
        .await
        .map_err(ApiError::from_room)?;

    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(
            "PARTICIPANT_NOT_FOUND",
            format!("{user_id} is not a participant"),
        ))
    }
}
