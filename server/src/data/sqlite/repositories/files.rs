//! File metadata repository
//!
//! Status is monotone through UPLOADING → PROCESSING → COMPLETED;
//! FAILED/DELETED are terminal and enterable from any non-terminal state.

use sqlx::SqlitePool;

use crate::data::sqlite::SqliteError;
use crate::data::types::{FileMetadata, FileRecord, FileStatus};

type FileTuple = (
    String,         // id
    String,         // original_name
    String,         // storage_key
    String,         // mime_type
    i64,            // size
    String,         // checksum
    String,         // uploaded_by
    Option<String>, // conversation_id
    Option<String>, // message_id
    String,         // status
    i64,            // download_count
    Option<String>, // metadata
    i64,            // created_at
    i64,            // updated_at
);

fn from_tuple(t: FileTuple) -> Result<FileRecord, SqliteError> {
    let metadata = match &t.11 {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| SqliteError::Corrupt(format!("file metadata: {e}")))?,
        None => FileMetadata::default(),
    };
    Ok(FileRecord {
        status: FileStatus::parse(&t.9)
            .ok_or_else(|| SqliteError::Corrupt(format!("file status '{}'", t.9)))?,
        id: t.0,
        original_name: t.1,
        storage_key: t.2,
        mime_type: t.3,
        size: t.4,
        checksum: t.5,
        uploaded_by: t.6,
        conversation_id: t.7,
        message_id: t.8,
        download_count: t.10,
        metadata,
        created_at: t.12,
        updated_at: t.13,
    })
}

const SELECT_COLUMNS: &str = "id, original_name, storage_key, mime_type, size, checksum, \
     uploaded_by, conversation_id, message_id, status, download_count, metadata, \
     created_at, updated_at";

/// SQL ranking of a file status column for monotone updates
fn rank(column: &str) -> String {
    format!(
        "CASE {column} WHEN 'UPLOADING' THEN 0 WHEN 'PROCESSING' THEN 1 \
         WHEN 'COMPLETED' THEN 2 ELSE 3 END"
    )
}

pub async fn create(pool: &SqlitePool, file: &FileRecord) -> Result<(), SqliteError> {
    let metadata = serde_json::to_string(&file.metadata)
        .map_err(|e| SqliteError::Corrupt(format!("file metadata: {e}")))?;

    sqlx::query(
        "INSERT INTO files \
         (id, original_name, storage_key, mime_type, size, checksum, uploaded_by, \
          conversation_id, message_id, status, download_count, metadata, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&file.id)
    .bind(&file.original_name)
    .bind(&file.storage_key)
    .bind(&file.mime_type)
    .bind(file.size)
    .bind(&file.checksum)
    .bind(&file.uploaded_by)
    .bind(&file.conversation_id)
    .bind(&file.message_id)
    .bind(file.status.as_str())
    .bind(file.download_count)
    .bind(&metadata)
    .bind(file.created_at)
    .bind(file.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<FileRecord>, SqliteError> {
    let row: Option<FileTuple> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM files WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(from_tuple).transpose()
}

/// Monotone status update. Returns true when the row changed.
pub async fn update_status(
    pool: &SqlitePool,
    id: &str,
    to: FileStatus,
    now: i64,
) -> Result<bool, SqliteError> {
    let rank_col = rank("status");
    let rank_new = rank("?");
    let result = sqlx::query(&format!(
        "UPDATE files SET status = ?, updated_at = ? \
         WHERE id = ? \
           AND status NOT IN ('FAILED', 'DELETED') \
           AND (? IN ('FAILED', 'DELETED') OR ({rank_col}) + 1 = ({rank_new}))"
    ))
    .bind(to.as_str())
    .bind(now)
    .bind(id)
    .bind(to.as_str())
    .bind(to.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Bind an uploaded file to the message (and conversation) that carries it
pub async fn attach_to_message(
    pool: &SqlitePool,
    file_id: &str,
    message_id: &str,
    conversation_id: &str,
    now: i64,
) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE files SET message_id = ?, conversation_id = ?, updated_at = ? \
         WHERE id = ? AND status NOT IN ('FAILED', 'DELETED')",
    )
    .bind(message_id)
    .bind(conversation_id)
    .bind(now)
    .bind(file_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn bump_download_count(pool: &SqlitePool, id: &str) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE files SET download_count = download_count + 1 WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
