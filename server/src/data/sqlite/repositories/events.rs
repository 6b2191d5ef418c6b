//! Pipeline event audit log
//!
//! Append-only, best-effort record of emitted pipeline events. Callers
//! treat failures here as non-fatal: the audit log is an operator aid, not
//! part of the durability contract.

use sqlx::SqlitePool;

use crate::data::sqlite::SqliteError;

#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub id: i64,
    pub event_type: String,
    pub entity_id: String,
    pub payload: Option<String>,
    pub created_at: i64,
}

pub async fn record(
    pool: &SqlitePool,
    event_type: &str,
    entity_id: &str,
    payload: Option<&str>,
    now: i64,
) -> Result<(), SqliteError> {
    sqlx::query(
        "INSERT INTO events (event_type, entity_id, payload, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(event_type)
    .bind(entity_id)
    .bind(payload)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recent events, newest first
pub async fn recent(pool: &SqlitePool, limit: u32) -> Result<Vec<EventRow>, SqliteError> {
    let rows: Vec<(i64, String, String, Option<String>, i64)> = sqlx::query_as(
        "SELECT id, event_type, entity_id, payload, created_at FROM events \
         ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, event_type, entity_id, payload, created_at)| EventRow {
            id,
            event_type,
            entity_id,
            payload,
            created_at,
        })
        .collect())
}
