//! Shared model types for the data layer
//!
//! These are the persisted shapes: messages, conversations, participants,
//! and file records. Enum variants are stored as their TEXT names; the
//! schema CHECK constraints mirror `as_str` exactly.

use serde::{Deserialize, Serialize};

// ============================================================================
// MESSAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    File,
    System,
}

impl MessageKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "TEXT",
            MessageKind::File => "FILE",
            MessageKind::System => "SYSTEM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TEXT" => Some(MessageKind::Text),
            "FILE" => Some(MessageKind::File),
            "SYSTEM" => Some(MessageKind::System),
            _ => None,
        }
    }
}

/// Delivery status of a message, per recipient and as the sender-visible
/// aggregate. Transitions are monotone SENT → DELIVERED → READ; FAILED and
/// DELETED are sink states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
    Deleted,
}

impl MessageStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Read => "READ",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SENT" => Some(MessageStatus::Sent),
            "DELIVERED" => Some(MessageStatus::Delivered),
            "READ" => Some(MessageStatus::Read),
            "FAILED" => Some(MessageStatus::Failed),
            "DELETED" => Some(MessageStatus::Deleted),
            _ => None,
        }
    }

    /// Position in the SENT < DELIVERED < READ progression
    pub const fn rank(&self) -> u8 {
        match self {
            MessageStatus::Sent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Read => 2,
            // Sink states rank above everything so they never regress
            MessageStatus::Failed | MessageStatus::Deleted => 3,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Failed | MessageStatus::Deleted)
    }

    /// Whether a transition from `self` to `to` is allowed
    pub fn can_transition(&self, to: MessageStatus) -> bool {
        !self.is_terminal() && to.rank() > self.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    pub attachment_id: Option<String>,
    pub status: MessageStatus,
    pub correlation_id: String,
    pub created_at: i64,
    pub edited_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

// ============================================================================
// CONVERSATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    Private,
    Group,
    Broadcast,
}

impl ConversationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Private => "PRIVATE",
            ConversationKind::Group => "GROUP",
            ConversationKind::Broadcast => "BROADCAST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PRIVATE" => Some(ConversationKind::Private),
            "GROUP" => Some(ConversationKind::Group),
            "BROADCAST" => Some(ConversationKind::Broadcast),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantRole {
    Owner,
    Admin,
    Member,
}

impl ParticipantRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Owner => "OWNER",
            ParticipantRole::Admin => "ADMIN",
            ParticipantRole::Member => "MEMBER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OWNER" => Some(ParticipantRole::Owner),
            "ADMIN" => Some(ParticipantRole::Admin),
            "MEMBER" => Some(ParticipantRole::Member),
            _ => None,
        }
    }

    pub const fn can_administer(&self) -> bool {
        matches!(self, ParticipantRole::Owner | ParticipantRole::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub created_by: String,
    pub last_message_id: Option<String>,
    pub last_activity: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: String,
    pub user_id: String,
    pub role: ParticipantRole,
    pub unread_count: i64,
    pub last_read_at: Option<i64>,
    pub is_muted: bool,
    pub is_archived: bool,
    pub joined_at: i64,
}

/// Canonical key identifying a PRIVATE conversation's participant pair
pub fn participant_pair(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

// ============================================================================
// FILES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
    Deleted,
}

impl FileStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Uploading => "UPLOADING",
            FileStatus::Processing => "PROCESSING",
            FileStatus::Completed => "COMPLETED",
            FileStatus::Failed => "FAILED",
            FileStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UPLOADING" => Some(FileStatus::Uploading),
            "PROCESSING" => Some(FileStatus::Processing),
            "COMPLETED" => Some(FileStatus::Completed),
            "FAILED" => Some(FileStatus::Failed),
            "DELETED" => Some(FileStatus::Deleted),
            _ => None,
        }
    }

    const fn rank(&self) -> u8 {
        match self {
            FileStatus::Uploading => 0,
            FileStatus::Processing => 1,
            FileStatus::Completed => 2,
            FileStatus::Failed | FileStatus::Deleted => 3,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Failed | FileStatus::Deleted)
    }

    /// Status is monotone through the listed order; FAILED/DELETED may be
    /// entered from any non-terminal state and never left.
    pub fn can_transition(&self, to: FileStatus) -> bool {
        !self.is_terminal() && (to.is_terminal() || to.rank() == self.rank() + 1)
    }
}

/// File metadata: tagged sections, each optional, extracted by the
/// (out-of-scope) media pipeline and stored verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub original_name: String,
    pub storage_key: String,
    pub mime_type: String,
    pub size: i64,
    pub checksum: String,
    pub uploaded_by: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub status: FileStatus,
    pub download_count: i64,
    pub metadata: FileMetadata,
    pub created_at: i64,
    pub updated_at: i64,
}
