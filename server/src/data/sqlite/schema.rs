//! SQLite schema definitions
//!
//! Initial schema with all tables. No migrations needed for first version.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Complete schema SQL
pub const SCHEMA: &str = r#"
-- =============================================================================
-- Infrastructure: Schema version tracking
-- =============================================================================
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    execution_time_ms INTEGER,
    success INTEGER NOT NULL DEFAULT 1
);

-- =============================================================================
-- 1. Conversations (must be before messages due to FK)
-- =============================================================================
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL CHECK(kind IN ('PRIVATE', 'GROUP', 'BROADCAST')),
    created_by TEXT NOT NULL,
    -- Sorted "a|b" key; populated for PRIVATE conversations only
    participant_pair TEXT,
    last_message_id TEXT,
    last_activity INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- A PRIVATE conversation is unique per participant pair
CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_private_pair
    ON conversations(participant_pair)
    WHERE kind = 'PRIVATE' AND participant_pair IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_conversations_activity ON conversations(last_activity DESC);

-- =============================================================================
-- 2. Conversation participants
-- =============================================================================
CREATE TABLE IF NOT EXISTS conversation_participants (
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'MEMBER' CHECK(role IN ('OWNER', 'ADMIN', 'MEMBER')),
    unread_count INTEGER NOT NULL DEFAULT 0 CHECK(unread_count >= 0),
    last_read_at INTEGER,
    is_muted INTEGER NOT NULL DEFAULT 0,
    is_archived INTEGER NOT NULL DEFAULT 0,
    joined_at INTEGER NOT NULL,
    PRIMARY KEY (conversation_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_participants_user ON conversation_participants(user_id);

-- =============================================================================
-- 3. Messages
-- =============================================================================
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    sender_id TEXT NOT NULL,
    receiver_id TEXT,
    content TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('TEXT', 'FILE', 'SYSTEM')),
    attachment_id TEXT,
    status TEXT NOT NULL DEFAULT 'SENT'
        CHECK(status IN ('SENT', 'DELIVERED', 'READ', 'FAILED', 'DELETED')),
    correlation_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    edited_at INTEGER,
    deleted_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);

-- =============================================================================
-- 4. Per-recipient message status
-- =============================================================================
CREATE TABLE IF NOT EXISTS message_status (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    recipient_id TEXT NOT NULL,
    status TEXT NOT NULL
        CHECK(status IN ('SENT', 'DELIVERED', 'READ', 'FAILED', 'DELETED')),
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (message_id, recipient_id)
);

-- =============================================================================
-- 5. Files metadata
-- =============================================================================
CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY,
    original_name TEXT NOT NULL,
    storage_key TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size INTEGER NOT NULL CHECK(size > 0),
    checksum TEXT NOT NULL,
    uploaded_by TEXT NOT NULL,
    conversation_id TEXT,
    message_id TEXT,
    status TEXT NOT NULL DEFAULT 'UPLOADING'
        CHECK(status IN ('UPLOADING', 'PROCESSING', 'COMPLETED', 'FAILED', 'DELETED')),
    download_count INTEGER NOT NULL DEFAULT 0,
    metadata TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_uploader ON files(uploaded_by, created_at);

-- =============================================================================
-- 6. Pipeline event audit log (append-only, best-effort)
-- =============================================================================
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_schema_version_is_positive() {
        assert!(SCHEMA_VERSION > 0);
    }

    #[test]
    fn test_schema_contains_required_tables() {
        let required_tables = [
            "schema_version",
            "schema_migrations",
            "conversations",
            "conversation_participants",
            "messages",
            "message_status",
            "files",
            "events",
        ];

        for table in required_tables {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {}", table)),
                "Schema missing table: {}",
                table
            );
        }
    }

    #[test]
    fn test_schema_has_required_indexes() {
        assert!(SCHEMA.contains("idx_messages_conversation"));
        assert!(SCHEMA.contains("idx_conversations_private_pair"));
        assert!(SCHEMA.contains("idx_participants_user"));
        assert!(SCHEMA.contains("idx_files_uploader"));
    }
}
