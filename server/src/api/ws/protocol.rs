//! Socket wire protocol
//!
//! Framed JSON events over one persistent WebSocket, `{event, payload}`
//! on both directions. The inbound and outbound sets are closed enums:
//! dispatch is an exhaustive match, and an unknown inbound event fails to
//! parse and is logged and dropped.

use serde::{Deserialize, Serialize};

use crate::data::types::Message;

/// Client → server events
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "authenticate")]
    Authenticate { token: String },

    #[serde(rename = "sendMessage")]
    SendMessage {
        conversation_id: String,
        #[serde(default)]
        content: String,
        #[serde(rename = "type", default)]
        kind: Option<String>,
        #[serde(default)]
        receiver_id: Option<String>,
        #[serde(default)]
        attachment_id: Option<String>,
    },

    #[serde(rename = "joinConversation")]
    JoinConversation { conversation_id: String },

    #[serde(rename = "leaveConversation")]
    LeaveConversation { conversation_id: String },

    #[serde(rename = "typing")]
    Typing {
        conversation_id: String,
        is_typing: bool,
    },

    /// Delivery acknowledgement
    #[serde(rename = "messageReceived")]
    MessageReceived {
        message_id: String,
        #[allow(dead_code)]
        conversation_id: String,
    },

    #[serde(rename = "markRead")]
    MarkRead {
        conversation_id: String,
        #[serde(default)]
        up_to_message_id: Option<String>,
    },

    #[serde(rename = "editMessage")]
    EditMessage { message_id: String, content: String },

    #[serde(rename = "deleteMessage")]
    DeleteMessage { message_id: String },

    #[serde(rename = "ping")]
    Ping,
}

/// Message body as it appears on the wire
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    pub status: &'static str,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<i64>,
}

impl From<&Message> for MessagePayload {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            kind: message.kind.as_str(),
            attachment_id: message.attachment_id.clone(),
            status: message.status.as_str(),
            created_at: message.created_at,
            edited_at: message.edited_at,
        }
    }
}

/// Server → client events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "authenticated")]
    Authenticated {
        identity: String,
        session_id: String,
    },

    #[serde(rename = "auth_error")]
    AuthError { message: String, code: String },

    #[serde(rename = "newMessage")]
    NewMessage(MessagePayload),

    #[serde(rename = "message_sent")]
    MessageSent {
        message_id: String,
        persisted: bool,
        status: &'static str,
    },

    #[serde(rename = "message_error")]
    MessageError {
        message: String,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },

    #[serde(rename = "messageStatusChanged")]
    MessageStatusChanged {
        message_id: String,
        status: &'static str,
        timestamp: i64,
    },

    #[serde(rename = "conversationMarkedRead")]
    ConversationMarkedRead {
        conversation_id: String,
        read_by: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        up_to_message_id: Option<String>,
    },

    #[serde(rename = "userTyping")]
    UserTyping {
        identity: String,
        conversation_id: String,
        is_typing: bool,
    },

    #[serde(rename = "user_connected")]
    UserConnected { identity: String },

    #[serde(rename = "user_disconnected")]
    UserDisconnected { identity: String, reason: String },

    #[serde(rename = "conversationJoined")]
    ConversationJoined {
        conversation_id: String,
        participants: Vec<String>,
    },

    #[serde(rename = "messageEdited")]
    MessageEdited(MessagePayload),

    #[serde(rename = "messageDeleted")]
    MessageDeleted {
        message_id: String,
        conversation_id: String,
    },

    #[serde(rename = "pong")]
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::{MessageKind, MessageStatus};

    #[test]
    fn test_client_events_parse() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"authenticate","payload":{"token":"abc"}}"#,
        )
        .unwrap();
        assert!(matches!(event, ClientEvent::Authenticate { token } if token == "abc"));

        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"sendMessage","payload":{"conversationId":"c1","content":"hi","type":"TEXT"}}"#,
        )
        .unwrap();
        match event {
            ClientEvent::SendMessage {
                conversation_id,
                content,
                kind,
                ..
            } => {
                assert_eq!(conversation_id, "c1");
                assert_eq!(content, "hi");
                assert_eq!(kind.as_deref(), Some("TEXT"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"markRead","payload":{"conversationId":"c1","upToMessageId":"m5"}}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            ClientEvent::MarkRead { up_to_message_id: Some(id), .. } if id == "m5"
        ));

        let event: ClientEvent = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Ping));
    }

    #[test]
    fn test_unknown_client_event_is_an_error() {
        let result: Result<ClientEvent, _> =
            serde_json::from_str(r#"{"event":"selfDestruct","payload":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_server_event_wire_names() {
        let event = ServerEvent::MessageSent {
            message_id: "m1".to_string(),
            persisted: true,
            status: "SENT",
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "message_sent");
        assert_eq!(json["payload"]["messageId"], "m1");
        assert_eq!(json["payload"]["persisted"], true);

        let event = ServerEvent::AuthError {
            message: "bad token".to_string(),
            code: "AUTH_INVALID".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "auth_error");

        let event = ServerEvent::Pong;
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "pong");
    }

    #[test]
    fn test_new_message_payload_shape() {
        let message = Message {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "alice".to_string(),
            receiver_id: Some("bob".to_string()),
            content: "hi".to_string(),
            kind: MessageKind::Text,
            attachment_id: None,
            status: MessageStatus::Sent,
            correlation_id: "corr".to_string(),
            created_at: 42,
            edited_at: None,
            deleted_at: None,
        };

        let event = ServerEvent::NewMessage(MessagePayload::from(&message));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "newMessage");
        assert_eq!(json["payload"]["id"], "m1");
        assert_eq!(json["payload"]["conversationId"], "c1");
        assert_eq!(json["payload"]["type"], "TEXT");
        assert_eq!(json["payload"]["status"], "SENT");
        // The correlation id is pipeline-internal, never on the wire
        assert!(json["payload"].get("correlationId").is_none());
        assert!(json["payload"].get("attachmentId").is_none());
    }

    #[test]
    fn test_rate_limit_error_carries_retry_hint() {
        let event = ServerEvent::MessageError {
            message: "rate limit exceeded".to_string(),
            code: "RATE_LIMITED".to_string(),
            retry_after_ms: Some(1_500),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["retryAfterMs"], 1_500);
    }
}
