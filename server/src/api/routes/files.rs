//! File endpoints: multipart upload, metadata, download

use std::sync::Arc;

use axum::Json;
use axum::extract::{Extension, Multipart, Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use serde::Serialize;

use crate::api::CoreContext;
use crate::api::auth::Identity;
use crate::api::types::ApiError;
use crate::data::streams::StreamName;
use crate::data::types::FileRecord;
use crate::domain::events::FileEvent;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileView {
    pub id: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    pub checksum: String,
    pub uploaded_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub status: &'static str,
    pub download_count: i64,
    pub created_at: i64,
}

impl From<&FileRecord> for FileView {
    fn from(record: &FileRecord) -> Self {
        Self {
            id: record.id.clone(),
            original_name: record.original_name.clone(),
            mime_type: record.mime_type.clone(),
            size: record.size,
            checksum: record.checksum.clone(),
            uploaded_by: record.uploaded_by.clone(),
            conversation_id: record.conversation_id.clone(),
            message_id: record.message_id.clone(),
            status: record.status.as_str(),
            download_count: record.download_count,
            created_at: record.created_at,
        }
    }
}

/// `POST /files`: multipart upload. Fields: `file` (required),
/// `conversation_id` (optional). The returned id goes into a subsequent
/// `sendMessage{type: FILE, attachmentId}`.
pub async fn upload_file(
    State(ctx): State<Arc<CoreContext>>,
    Extension(identity): Extension<Identity>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut file_part: Option<(String, Option<String>, Vec<u8>)> = None;
    let mut conversation_id: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::bad_request("MULTIPART", format!("malformed multipart body: {e}"))
    })? {
        match field.name() {
            Some("file") => {
                let name = field
                    .file_name()
                    .unwrap_or("unnamed")
                    .to_string();
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(|e| {
                    ApiError::bad_request("MULTIPART", format!("failed to read file field: {e}"))
                })?;
                file_part = Some((name, content_type, data.to_vec()));
            }
            Some("conversation_id") => {
                let value = field.text().await.map_err(|e| {
                    ApiError::bad_request("MULTIPART", format!("bad conversation_id field: {e}"))
                })?;
                conversation_id = Some(value);
            }
            _ => {}
        }
    }

    let (name, content_type, data) = file_part
        .ok_or_else(|| ApiError::bad_request("MULTIPART", "missing 'file' field"))?;

    if let Some(conversation_id) = &conversation_id {
        let is_participant = ctx
            .rooms
            .is_participant(&identity.id, conversation_id)
            .await
            .map_err(ApiError::from_room)?;
        if !is_participant {
            return Err(ApiError::forbidden(
                "NOT_PARTICIPANT",
                format!("{} is not a participant", identity.id),
            ));
        }
    }

    let record = ctx
        .files
        .store_upload(
            &identity.id,
            &name,
            content_type.as_deref(),
            conversation_id.as_deref(),
            data,
        )
        .await
        .map_err(ApiError::from_file)?;

    let event = FileEvent::Ready {
        file: record.clone(),
    };
    if let Err(e) = ctx.streams.append(StreamName::EventsFiles, &event).await {
        tracing::warn!(file_id = %record.id, error = %e, "Failed to publish FILE_READY");
    }
    ctx.gateway.record_event("FILE_READY", &record.id, None).await;

    Ok((StatusCode::CREATED, Json(FileView::from(&record))))
}

/// `GET /files/{id}`: metadata
pub async fn get_file(
    State(ctx): State<Arc<CoreContext>>,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = ctx
        .files
        .get(&file_id)
        .await
        .map_err(ApiError::from_file)?
        .ok_or_else(|| ApiError::not_found("FILE_NOT_FOUND", format!("file {file_id}")))?;

    Ok(Json(FileView::from(&record)))
}

/// `GET /files/{id}/download`: the bytes, as an attachment
pub async fn download_file(
    State(ctx): State<Arc<CoreContext>>,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (record, data) = ctx
        .files
        .download(&file_id)
        .await
        .map_err(ApiError::from_file)?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        record.original_name.replace('"', "_")
    );

    Ok((
        [
            (header::CONTENT_TYPE, record.mime_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    ))
}
