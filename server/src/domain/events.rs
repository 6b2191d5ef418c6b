//! Stream record payloads
//!
//! Everything that travels through the named streams is one of these
//! MessagePack-encoded types. The enums are closed: consumers match
//! exhaustively, and an undecodable record is acked-to-discard rather than
//! redelivered forever.

use serde::{Deserialize, Serialize};

use crate::data::types::{FileRecord, Message};

// ============================================================================
// WRITE-AHEAD LOG (`wal:pre` / `wal:post`)
// ============================================================================

/// Logged before the store commit. A `WalEntry` with no matching
/// `WalCommit` after the WAL timeout is in-flight work lost to a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub message: Message,
    pub correlation_id: String,
    pub first_seen_at: i64,
}

/// Logged after a successful store commit, closing the WAL pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalCommit {
    pub message_id: String,
    pub correlation_id: String,
    /// Stream id of the matching `wal:pre` record, when the committer saw
    /// it (recovery and fallback commits do not)
    pub pre_stream_id: Option<String>,
    pub persisted_at: i64,
}

// ============================================================================
// RECOVERY QUEUES (`fallback:messages`, `retry:messages`, `dlq:messages`)
// ============================================================================

/// A message waiting out a store outage. Not a retry: the fallback queue
/// preserves arrival order and does not count attempts while the circuit
/// stays open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackJob {
    pub message: Message,
    pub correlation_id: String,
    pub attempt: u32,
    pub first_seen_at: i64,
}

/// The closed set of actions the retry worker can re-attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryAction {
    SaveMessage {
        message: Message,
        correlation_id: String,
    },
    PublishMessageEvent {
        event: MessageEvent,
    },
    PublishStatusEvent {
        event: StatusEvent,
    },
}

impl RetryAction {
    /// Entity the action concerns, for logging and dead-letter triage
    pub fn entity_id(&self) -> &str {
        match self {
            RetryAction::SaveMessage { message, .. } => &message.id,
            RetryAction::PublishMessageEvent { event } => event.message_id(),
            RetryAction::PublishStatusEvent { event } => event.entity_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryJob {
    pub action: RetryAction,
    pub attempt: u32,
    pub first_seen_at: i64,
    pub correlation_id: String,
    /// Earliest time this attempt should run (exponential backoff)
    pub not_before: i64,
}

/// A record that exhausted its retries. Operator intervention required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub action: RetryAction,
    pub attempts: u32,
    pub first_seen_at: i64,
    pub dead_at: i64,
    pub reason: String,
    pub correlation_id: String,
}

// ============================================================================
// EVENT STREAMS (`events:*`)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageEvent {
    New {
        message: Message,
    },
    Edited {
        message: Message,
    },
    Deleted {
        message_id: String,
        conversation_id: String,
        sender_id: String,
    },
}

impl MessageEvent {
    pub fn message_id(&self) -> &str {
        match self {
            MessageEvent::New { message } | MessageEvent::Edited { message } => &message.id,
            MessageEvent::Deleted { message_id, .. } => message_id,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            MessageEvent::New { message } | MessageEvent::Edited { message } => {
                &message.conversation_id
            }
            MessageEvent::Deleted {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub const fn event_type(&self) -> &'static str {
        match self {
            MessageEvent::New { .. } => "NEW_MESSAGE",
            MessageEvent::Edited { .. } => "MESSAGE_EDITED",
            MessageEvent::Deleted { .. } => "MESSAGE_DELETED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatusEvent {
    Delivered {
        message_id: String,
        conversation_id: String,
        receiver_id: String,
        at: i64,
    },
    Read {
        conversation_id: String,
        reader_id: String,
        up_to_message_id: Option<String>,
        at: i64,
    },
}

impl StatusEvent {
    pub fn entity_id(&self) -> &str {
        match self {
            StatusEvent::Delivered { message_id, .. } => message_id,
            StatusEvent::Read {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub const fn event_type(&self) -> &'static str {
        match self {
            StatusEvent::Delivered { .. } => "MESSAGE_DELIVERED",
            StatusEvent::Read { .. } => "CONVERSATION_READ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConversationChange {
    Created,
    Joined { user_id: String },
    Left { user_id: String },
    ParticipantAdded { user_id: String },
    ParticipantRemoved { user_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub conversation_id: String,
    pub change: ConversationChange,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FileEvent {
    Ready { file: FileRecord },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserEvent {
    Online { identity: String, at: i64 },
    Offline { identity: String, at: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::{MessageKind, MessageStatus};

    fn message() -> Message {
        Message {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "alice".to_string(),
            receiver_id: None,
            content: "hi".to_string(),
            kind: MessageKind::Text,
            attachment_id: None,
            status: MessageStatus::Sent,
            correlation_id: "corr".to_string(),
            created_at: 1,
            edited_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn test_message_event_accessors() {
        let event = MessageEvent::New { message: message() };
        assert_eq!(event.message_id(), "m1");
        assert_eq!(event.conversation_id(), "c1");
        assert_eq!(event.event_type(), "NEW_MESSAGE");

        let deleted = MessageEvent::Deleted {
            message_id: "m2".to_string(),
            conversation_id: "c9".to_string(),
            sender_id: "bob".to_string(),
        };
        assert_eq!(deleted.message_id(), "m2");
        assert_eq!(deleted.conversation_id(), "c9");
    }

    #[test]
    fn test_retry_action_entity() {
        let action = RetryAction::SaveMessage {
            message: message(),
            correlation_id: "corr".to_string(),
        };
        assert_eq!(action.entity_id(), "m1");
    }

    #[test]
    fn test_wal_entry_roundtrips_through_msgpack() {
        let entry = WalEntry {
            message: message(),
            correlation_id: "corr".to_string(),
            first_seen_at: 42,
        };
        let bytes = rmp_serde::to_vec(&entry).unwrap();
        let decoded: WalEntry = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }
}
