//! Conversation repository
//!
//! Owns conversation rows and the per-participant bookkeeping
//! (role, unread counter, read cursor). PRIVATE conversations are unique
//! per participant pair, enforced by a partial unique index on the sorted
//! pair key.

use sqlx::SqlitePool;

use crate::data::sqlite::SqliteError;
use crate::data::types::{
    Conversation, ConversationKind, Participant, ParticipantRole, participant_pair,
};

type ConversationTuple = (
    String,         // id
    String,         // kind
    String,         // created_by
    Option<String>, // last_message_id
    i64,            // last_activity
    i64,            // created_at
    i64,            // updated_at
);

fn conversation_from_tuple(t: ConversationTuple) -> Result<Conversation, SqliteError> {
    Ok(Conversation {
        kind: ConversationKind::parse(&t.1)
            .ok_or_else(|| SqliteError::Corrupt(format!("conversation kind '{}'", t.1)))?,
        id: t.0,
        created_by: t.2,
        last_message_id: t.3,
        last_activity: t.4,
        created_at: t.5,
        updated_at: t.6,
    })
}

type ParticipantTuple = (
    String,      // conversation_id
    String,      // user_id
    String,      // role
    i64,         // unread_count
    Option<i64>, // last_read_at
    bool,        // is_muted
    bool,        // is_archived
    i64,         // joined_at
);

fn participant_from_tuple(t: ParticipantTuple) -> Result<Participant, SqliteError> {
    Ok(Participant {
        role: ParticipantRole::parse(&t.2)
            .ok_or_else(|| SqliteError::Corrupt(format!("participant role '{}'", t.2)))?,
        conversation_id: t.0,
        user_id: t.1,
        unread_count: t.3,
        last_read_at: t.4,
        is_muted: t.5,
        is_archived: t.6,
        joined_at: t.7,
    })
}

const CONVERSATION_COLUMNS: &str =
    "id, kind, created_by, last_message_id, last_activity, created_at, updated_at";

const PARTICIPANT_COLUMNS: &str =
    "conversation_id, user_id, role, unread_count, last_read_at, is_muted, is_archived, joined_at";

/// Create a conversation with its initial participants in one transaction.
///
/// PRIVATE requires exactly two participants and fails with `Conflict` if a
/// conversation for the pair already exists.
pub async fn create(
    pool: &SqlitePool,
    kind: ConversationKind,
    created_by: &str,
    participants: &[(String, ParticipantRole)],
    now: i64,
) -> Result<Conversation, SqliteError> {
    if kind == ConversationKind::Private && participants.len() != 2 {
        return Err(SqliteError::Conflict(
            "private conversation requires exactly two participants".to_string(),
        ));
    }
    if participants.is_empty() {
        return Err(SqliteError::Conflict(
            "conversation requires at least one participant".to_string(),
        ));
    }

    let id = cuid2::create_id();
    let pair = (kind == ConversationKind::Private)
        .then(|| participant_pair(&participants[0].0, &participants[1].0));

    let mut tx = pool.begin().await?;

    let insert = sqlx::query(
        "INSERT INTO conversations \
         (id, kind, created_by, participant_pair, last_message_id, last_activity, created_at, updated_at) \
         VALUES (?, ?, ?, ?, NULL, ?, ?, ?)",
    )
    .bind(&id)
    .bind(kind.as_str())
    .bind(created_by)
    .bind(&pair)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await;

    if let Err(e) = insert {
        if e.as_database_error()
            .map(|d| d.is_unique_violation())
            .unwrap_or(false)
        {
            return Err(SqliteError::Conflict(
                "private conversation already exists for this pair".to_string(),
            ));
        }
        return Err(e.into());
    }

    for (user_id, role) in participants {
        sqlx::query(
            "INSERT INTO conversation_participants \
             (conversation_id, user_id, role, unread_count, joined_at) \
             VALUES (?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(Conversation {
        id,
        kind,
        created_by: created_by.to_string(),
        last_message_id: None,
        last_activity: now,
        created_at: now,
        updated_at: now,
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<Conversation>, SqliteError> {
    let row: Option<ConversationTuple> = sqlx::query_as(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(conversation_from_tuple).transpose()
}

/// Find the PRIVATE conversation for a participant pair
pub async fn get_by_pair(
    pool: &SqlitePool,
    a: &str,
    b: &str,
) -> Result<Option<Conversation>, SqliteError> {
    let row: Option<ConversationTuple> = sqlx::query_as(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations \
         WHERE kind = 'PRIVATE' AND participant_pair = ?"
    ))
    .bind(participant_pair(a, b))
    .fetch_optional(pool)
    .await?;

    row.map(conversation_from_tuple).transpose()
}

pub async fn participants(
    pool: &SqlitePool,
    conversation_id: &str,
) -> Result<Vec<Participant>, SqliteError> {
    let rows: Vec<ParticipantTuple> = sqlx::query_as(&format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM conversation_participants \
         WHERE conversation_id = ? ORDER BY joined_at, user_id"
    ))
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(participant_from_tuple).collect()
}

pub async fn participant(
    pool: &SqlitePool,
    conversation_id: &str,
    user_id: &str,
) -> Result<Option<Participant>, SqliteError> {
    let row: Option<ParticipantTuple> = sqlx::query_as(&format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM conversation_participants \
         WHERE conversation_id = ? AND user_id = ?"
    ))
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.map(participant_from_tuple).transpose()
}

/// Conversations a user participates in, most recently active first
pub async fn list_for_user(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Vec<(Conversation, Participant)>, SqliteError> {
    let rows: Vec<(
        String,
        String,
        String,
        Option<String>,
        i64,
        i64,
        i64,
        String,
        String,
        String,
        i64,
        Option<i64>,
        bool,
        bool,
        i64,
    )> = sqlx::query_as(
        "SELECT c.id, c.kind, c.created_by, c.last_message_id, c.last_activity, c.created_at, \
                c.updated_at, \
                p.conversation_id, p.user_id, p.role, p.unread_count, p.last_read_at, \
                p.is_muted, p.is_archived, p.joined_at \
         FROM conversations c \
         JOIN conversation_participants p ON p.conversation_id = c.id \
         WHERE p.user_id = ? \
         ORDER BY c.last_activity DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            let conversation =
                conversation_from_tuple((r.0, r.1, r.2, r.3, r.4, r.5, r.6))?;
            let participant =
                participant_from_tuple((r.7, r.8, r.9, r.10, r.11, r.12, r.13, r.14))?;
            Ok((conversation, participant))
        })
        .collect()
}

/// Advance the last-message reference and activity timestamp. Monotone:
/// committing an out-of-order recovered message never moves the
/// conversation head backward. Returns true when the head advanced.
pub async fn touch(
    pool: &SqlitePool,
    conversation_id: &str,
    last_message_id: &str,
    activity: i64,
) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE conversations SET last_message_id = ?, last_activity = ?, updated_at = ? \
         WHERE id = ? AND last_activity <= ?",
    )
    .bind(last_message_id)
    .bind(activity)
    .bind(activity)
    .bind(conversation_id)
    .bind(activity)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Recompute every participant's unread counter from the stored messages:
/// messages sent by someone else, newer than the participant's read
/// cursor. Idempotent, so at-least-once redelivery of a NEW_MESSAGE event
/// cannot drift the counters the way a blind increment would.
/// Returns the number of participants recounted.
pub async fn recompute_unread(
    pool: &SqlitePool,
    conversation_id: &str,
) -> Result<u64, SqliteError> {
    let result = sqlx::query(
        "UPDATE conversation_participants AS p \
         SET unread_count = ( \
             SELECT COUNT(*) FROM messages m \
             WHERE m.conversation_id = p.conversation_id \
               AND m.sender_id != p.user_id \
               AND m.created_at > COALESCE(p.last_read_at, 0) \
               AND m.status NOT IN ('FAILED', 'DELETED') \
         ) \
         WHERE p.conversation_id = ?",
    )
    .bind(conversation_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Reset the unread counter and advance the read cursor
pub async fn reset_unread(
    pool: &SqlitePool,
    conversation_id: &str,
    user_id: &str,
    read_at: i64,
) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE conversation_participants SET unread_count = 0, last_read_at = ? \
         WHERE conversation_id = ? AND user_id = ?",
    )
    .bind(read_at)
    .bind(conversation_id)
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Add a participant. Returns false when they were already a member.
pub async fn add_participant(
    pool: &SqlitePool,
    conversation_id: &str,
    user_id: &str,
    role: ParticipantRole,
    now: i64,
) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO conversation_participants \
         (conversation_id, user_id, role, unread_count, joined_at) \
         VALUES (?, ?, ?, 0, ?)",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(role.as_str())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Remove a participant. The owner cannot be removed, which also keeps the
/// at-least-one-admin invariant for groups.
pub async fn remove_participant(
    pool: &SqlitePool,
    conversation_id: &str,
    user_id: &str,
) -> Result<bool, SqliteError> {
    let role: Option<String> = sqlx::query_scalar(
        "SELECT role FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    match role.as_deref() {
        None => return Ok(false),
        Some("OWNER") => {
            return Err(SqliteError::Conflict(
                "the conversation owner cannot be removed".to_string(),
            ));
        }
        Some(_) => {}
    }

    let result = sqlx::query(
        "DELETE FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
    )
    .bind(conversation_id)
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sqlite::SqliteService;
    use crate::data::sqlite::repositories::messages;
    use crate::data::types::{Message, MessageKind, MessageStatus};

    fn pair(a: &str, b: &str) -> Vec<(String, ParticipantRole)> {
        vec![
            (a.to_string(), ParticipantRole::Owner),
            (b.to_string(), ParticipantRole::Member),
        ]
    }

    fn message(id: &str, conversation_id: &str, sender: &str, created_at: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender.to_string(),
            receiver_id: None,
            content: "hi".to_string(),
            kind: MessageKind::Text,
            attachment_id: None,
            status: MessageStatus::Sent,
            correlation_id: "corr".to_string(),
            created_at,
            edited_at: None,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let service = SqliteService::init_in_memory().await.unwrap();
        let conversation = create(
            service.pool(),
            ConversationKind::Private,
            "alice",
            &pair("alice", "bob"),
            1_000,
        )
        .await
        .unwrap();

        let found = get(service.pool(), &conversation.id).await.unwrap().unwrap();
        assert_eq!(found, conversation);

        let members = participants(service.pool(), &conversation.id).await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].unread_count, 0);
    }

    #[tokio::test]
    async fn test_private_is_unique_per_pair() {
        let service = SqliteService::init_in_memory().await.unwrap();
        create(
            service.pool(),
            ConversationKind::Private,
            "alice",
            &pair("alice", "bob"),
            1_000,
        )
        .await
        .unwrap();

        // Same pair in the other order still conflicts
        let err = create(
            service.pool(),
            ConversationKind::Private,
            "bob",
            &pair("bob", "alice"),
            1_001,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SqliteError::Conflict(_)));

        let found = get_by_pair(service.pool(), "bob", "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.kind, ConversationKind::Private);
    }

    #[tokio::test]
    async fn test_private_requires_two_participants() {
        let service = SqliteService::init_in_memory().await.unwrap();
        let err = create(
            service.pool(),
            ConversationKind::Private,
            "alice",
            &[("alice".to_string(), ParticipantRole::Owner)],
            1_000,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SqliteError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_group_allows_many_and_duplicate_pairs() {
        let service = SqliteService::init_in_memory().await.unwrap();
        for _ in 0..2 {
            create(
                service.pool(),
                ConversationKind::Group,
                "alice",
                &[
                    ("alice".to_string(), ParticipantRole::Owner),
                    ("bob".to_string(), ParticipantRole::Member),
                    ("carol".to_string(), ParticipantRole::Member),
                ],
                1_000,
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_unread_counters_follow_messages() {
        let service = SqliteService::init_in_memory().await.unwrap();
        let conversation = create(
            service.pool(),
            ConversationKind::Private,
            "alice",
            &pair("alice", "bob"),
            1_000,
        )
        .await
        .unwrap();

        messages::save_message(service.pool(), &message("m1", &conversation.id, "alice", 2_000))
            .await
            .unwrap();
        messages::save_message(service.pool(), &message("m2", &conversation.id, "alice", 2_001))
            .await
            .unwrap();

        let recounted = recompute_unread(service.pool(), &conversation.id)
            .await
            .unwrap();
        assert_eq!(recounted, 2);

        let bob = participant(service.pool(), &conversation.id, "bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob.unread_count, 2);
        let alice = participant(service.pool(), &conversation.id, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alice.unread_count, 0);

        // Recomputing again (redelivered event) changes nothing
        recompute_unread(service.pool(), &conversation.id)
            .await
            .unwrap();
        let bob = participant(service.pool(), &conversation.id, "bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob.unread_count, 2);

        assert!(
            reset_unread(service.pool(), &conversation.id, "bob", 5_000)
                .await
                .unwrap()
        );
        let bob = participant(service.pool(), &conversation.id, "bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob.unread_count, 0);
        assert_eq!(bob.last_read_at, Some(5_000));

        // The read cursor is past both messages: still zero after recompute
        recompute_unread(service.pool(), &conversation.id)
            .await
            .unwrap();
        let bob = participant(service.pool(), &conversation.id, "bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob.unread_count, 0);
    }

    #[tokio::test]
    async fn test_recompute_ignores_deleted_messages() {
        let service = SqliteService::init_in_memory().await.unwrap();
        let conversation = create(
            service.pool(),
            ConversationKind::Private,
            "alice",
            &pair("alice", "bob"),
            1_000,
        )
        .await
        .unwrap();

        messages::save_message(service.pool(), &message("m1", &conversation.id, "alice", 2_000))
            .await
            .unwrap();
        messages::soft_delete(service.pool(), "m1", "alice", 3_000)
            .await
            .unwrap();

        recompute_unread(service.pool(), &conversation.id)
            .await
            .unwrap();
        let bob = participant(service.pool(), &conversation.id, "bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob.unread_count, 0);
    }

    #[tokio::test]
    async fn test_touch_updates_activity() {
        let service = SqliteService::init_in_memory().await.unwrap();
        let conversation = create(
            service.pool(),
            ConversationKind::Private,
            "alice",
            &pair("alice", "bob"),
            1_000,
        )
        .await
        .unwrap();

        assert!(
            touch(service.pool(), &conversation.id, "m9", 2_000)
                .await
                .unwrap()
        );

        let found = get(service.pool(), &conversation.id).await.unwrap().unwrap();
        assert_eq!(found.last_message_id.as_deref(), Some("m9"));
        assert_eq!(found.last_activity, 2_000);
    }

    #[tokio::test]
    async fn test_touch_never_regresses() {
        let service = SqliteService::init_in_memory().await.unwrap();
        let conversation = create(
            service.pool(),
            ConversationKind::Private,
            "alice",
            &pair("alice", "bob"),
            1_000,
        )
        .await
        .unwrap();

        assert!(
            touch(service.pool(), &conversation.id, "m-new", 5_000)
                .await
                .unwrap()
        );

        // A message parked during an outage commits late with an older
        // created_at: the conversation head must not move backward
        assert!(
            !touch(service.pool(), &conversation.id, "m-old", 2_000)
                .await
                .unwrap()
        );

        let found = get(service.pool(), &conversation.id).await.unwrap().unwrap();
        assert_eq!(found.last_message_id.as_deref(), Some("m-new"));
        assert_eq!(found.last_activity, 5_000);
    }

    #[tokio::test]
    async fn test_list_for_user_ordered_by_activity() {
        let service = SqliteService::init_in_memory().await.unwrap();
        let older = create(
            service.pool(),
            ConversationKind::Private,
            "alice",
            &pair("alice", "bob"),
            1_000,
        )
        .await
        .unwrap();
        let newer = create(
            service.pool(),
            ConversationKind::Private,
            "alice",
            &pair("alice", "carol"),
            1_000,
        )
        .await
        .unwrap();
        touch(service.pool(), &newer.id, "m1", 9_000).await.unwrap();

        let listed = list_for_user(service.pool(), "alice").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0.id, newer.id);
        assert_eq!(listed[1].0.id, older.id);

        assert!(list_for_user(service.pool(), "nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_remove_participants() {
        let service = SqliteService::init_in_memory().await.unwrap();
        let conversation = create(
            service.pool(),
            ConversationKind::Group,
            "alice",
            &[("alice".to_string(), ParticipantRole::Owner)],
            1_000,
        )
        .await
        .unwrap();

        assert!(
            add_participant(
                service.pool(),
                &conversation.id,
                "bob",
                ParticipantRole::Member,
                2_000
            )
            .await
            .unwrap()
        );
        // Re-adding is a no-op
        assert!(
            !add_participant(
                service.pool(),
                &conversation.id,
                "bob",
                ParticipantRole::Member,
                2_001
            )
            .await
            .unwrap()
        );

        assert!(
            remove_participant(service.pool(), &conversation.id, "bob")
                .await
                .unwrap()
        );
        assert!(
            !remove_participant(service.pool(), &conversation.id, "bob")
                .await
                .unwrap()
        );

        // The owner is not removable
        let err = remove_participant(service.pool(), &conversation.id, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, SqliteError::Conflict(_)));
    }
}
