//! Message repository
//!
//! Writes are idempotent by message id: replaying a save produces no
//! duplicate row. Status updates are monotone (SENT → DELIVERED → READ,
//! FAILED/DELETED terminal) and enforced in SQL so concurrent updaters
//! cannot regress a status.

use sqlx::SqlitePool;

use super::{STATUS_RANK, status_rank_col};
use crate::data::sqlite::SqliteError;
use crate::data::types::{Message, MessageKind, MessageStatus};

type MessageTuple = (
    String,         // id
    String,         // conversation_id
    String,         // sender_id
    Option<String>, // receiver_id
    String,         // content
    String,         // kind
    Option<String>, // attachment_id
    String,         // status
    String,         // correlation_id
    i64,            // created_at
    Option<i64>,    // edited_at
    Option<i64>,    // deleted_at
);

fn from_tuple(t: MessageTuple) -> Result<Message, SqliteError> {
    Ok(Message {
        kind: MessageKind::parse(&t.5)
            .ok_or_else(|| SqliteError::Corrupt(format!("message kind '{}'", t.5)))?,
        status: MessageStatus::parse(&t.7)
            .ok_or_else(|| SqliteError::Corrupt(format!("message status '{}'", t.7)))?,
        id: t.0,
        conversation_id: t.1,
        sender_id: t.2,
        receiver_id: t.3,
        content: t.4,
        attachment_id: t.6,
        correlation_id: t.8,
        created_at: t.9,
        edited_at: t.10,
        deleted_at: t.11,
    })
}

const SELECT_COLUMNS: &str = "id, conversation_id, sender_id, receiver_id, content, kind, \
     attachment_id, status, correlation_id, created_at, edited_at, deleted_at";

/// Insert a message, ignoring replays of the same id.
/// Returns true when the row was actually inserted.
pub async fn save_message(pool: &SqlitePool, message: &Message) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO messages \
         (id, conversation_id, sender_id, receiver_id, content, kind, attachment_id, status, \
          correlation_id, created_at, edited_at, deleted_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(&message.sender_id)
    .bind(&message.receiver_id)
    .bind(&message.content)
    .bind(message.kind.as_str())
    .bind(&message.attachment_id)
    .bind(message.status.as_str())
    .bind(&message.correlation_id)
    .bind(message.created_at)
    .bind(message.edited_at)
    .bind(message.deleted_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Message>, SqliteError> {
    let row: Option<MessageTuple> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM messages WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(from_tuple).transpose()
}

/// Page of messages in a conversation, `created_at` ascending.
/// `before` bounds the page to strictly older messages (for backfill).
pub async fn list_by_conversation(
    pool: &SqlitePool,
    conversation_id: &str,
    before: Option<i64>,
    limit: u32,
) -> Result<Vec<Message>, SqliteError> {
    let before = before.unwrap_or(i64::MAX);

    // Newest page first, then flip to chronological order
    let rows: Vec<MessageTuple> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM messages \
         WHERE conversation_id = ? AND created_at < ? \
         ORDER BY created_at DESC, id DESC LIMIT ?"
    ))
    .bind(conversation_id)
    .bind(before)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut messages = rows
        .into_iter()
        .map(from_tuple)
        .collect::<Result<Vec<_>, _>>()?;
    messages.reverse();
    Ok(messages)
}

/// Monotone update of the sender-visible aggregate status.
/// Returns true when the row changed.
pub async fn update_aggregate_status(
    pool: &SqlitePool,
    message_id: &str,
    to: MessageStatus,
) -> Result<bool, SqliteError> {
    let rank_col = status_rank_col("status");
    let result = sqlx::query(&format!(
        "UPDATE messages SET status = ? \
         WHERE id = ? \
           AND status NOT IN ('FAILED', 'DELETED') \
           AND ({rank_col}) < ({STATUS_RANK})"
    ))
    .bind(to.as_str())
    .bind(message_id)
    .bind(to.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Monotone upsert of a per-recipient status row.
/// Returns true when the status actually advanced.
pub async fn upsert_recipient_status(
    pool: &SqlitePool,
    message_id: &str,
    recipient_id: &str,
    to: MessageStatus,
    now: i64,
) -> Result<bool, SqliteError> {
    let rank_col = status_rank_col("message_status.status");
    let rank_new = status_rank_col("excluded.status");
    let result = sqlx::query(&format!(
        "INSERT INTO message_status (message_id, recipient_id, status, updated_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(message_id, recipient_id) DO UPDATE \
         SET status = excluded.status, updated_at = excluded.updated_at \
         WHERE message_status.status NOT IN ('FAILED', 'DELETED') \
           AND ({rank_col}) < ({rank_new})"
    ))
    .bind(message_id)
    .bind(recipient_id)
    .bind(to.as_str())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn recipient_status(
    pool: &SqlitePool,
    message_id: &str,
    recipient_id: &str,
) -> Result<Option<MessageStatus>, SqliteError> {
    let status: Option<String> = sqlx::query_scalar(
        "SELECT status FROM message_status WHERE message_id = ? AND recipient_id = ?",
    )
    .bind(message_id)
    .bind(recipient_id)
    .fetch_optional(pool)
    .await?;

    status
        .map(|s| {
            MessageStatus::parse(&s)
                .ok_or_else(|| SqliteError::Corrupt(format!("message status '{s}'")))
        })
        .transpose()
}

/// Mark every message up to `up_to_created_at` in a conversation as READ
/// for one recipient. Rows are created where missing; existing rows only
/// ever advance. Returns the number of affected messages.
pub async fn mark_read_up_to(
    pool: &SqlitePool,
    conversation_id: &str,
    recipient_id: &str,
    up_to_created_at: i64,
    now: i64,
) -> Result<u64, SqliteError> {
    let rank_col = status_rank_col("message_status.status");
    let result = sqlx::query(&format!(
        "INSERT INTO message_status (message_id, recipient_id, status, updated_at) \
         SELECT id, ?, 'READ', ? FROM messages \
         WHERE conversation_id = ? AND sender_id != ? AND created_at <= ? \
           AND status NOT IN ('FAILED', 'DELETED') \
         ON CONFLICT(message_id, recipient_id) DO UPDATE \
         SET status = 'READ', updated_at = excluded.updated_at \
         WHERE message_status.status NOT IN ('FAILED', 'DELETED') \
           AND ({rank_col}) < 2"
    ))
    .bind(recipient_id)
    .bind(now)
    .bind(conversation_id)
    .bind(recipient_id)
    .bind(up_to_created_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Advance the sender-visible aggregate to READ for a span of messages.
/// Used for private conversations where the single recipient reading is
/// the aggregate truth.
pub async fn aggregate_read_up_to(
    pool: &SqlitePool,
    conversation_id: &str,
    reader_id: &str,
    up_to_created_at: i64,
) -> Result<u64, SqliteError> {
    let rank_col = status_rank_col("status");
    let result = sqlx::query(&format!(
        "UPDATE messages SET status = 'READ' \
         WHERE conversation_id = ? AND sender_id != ? AND created_at <= ? \
           AND status NOT IN ('FAILED', 'DELETED') \
           AND ({rank_col}) < 2"
    ))
    .bind(conversation_id)
    .bind(reader_id)
    .bind(up_to_created_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Edit message content (sender only, not terminal).
pub async fn edit(
    pool: &SqlitePool,
    message_id: &str,
    sender_id: &str,
    content: &str,
    now: i64,
) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE messages SET content = ?, edited_at = ? \
         WHERE id = ? AND sender_id = ? AND status NOT IN ('FAILED', 'DELETED')",
    )
    .bind(content)
    .bind(now)
    .bind(message_id)
    .bind(sender_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Soft-delete: blank the content, keep the row, enter the DELETED sink.
pub async fn soft_delete(
    pool: &SqlitePool,
    message_id: &str,
    sender_id: &str,
    now: i64,
) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE messages SET content = '', status = 'DELETED', deleted_at = ? \
         WHERE id = ? AND sender_id = ? AND status != 'DELETED'",
    )
    .bind(now)
    .bind(message_id)
    .bind(sender_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
