//! Socket hub
//!
//! Per-connection registry: which sessions exist, which identity owns
//! them, and which conversation rooms each session has joined. Outbound
//! delivery goes through each connection's queue; a send to a closed
//! queue is dropped (the reconnecting client backfills).
//!
//! The hub is also the pipeline's `DeliverySink`: the stream consumers
//! hand it domain events and it translates them to wire events.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::protocol::{MessagePayload, ServerEvent};
use crate::data::types::{Message, MessageStatus};
use crate::domain::workers::DeliverySink;

struct Connection {
    identity: String,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
pub struct SocketHub {
    /// session id → connection
    connections: DashMap<String, Connection>,
    /// identity → session ids
    identities: DashMap<String, HashSet<String>>,
    /// conversation id → session ids joined to the room
    rooms: DashMap<String, HashSet<String>>,
}

impl SocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection
    pub fn register(
        &self,
        session_id: &str,
        identity: &str,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) {
        self.connections.insert(
            session_id.to_string(),
            Connection {
                identity: identity.to_string(),
                tx,
            },
        );
        self.identities
            .entry(identity.to_string())
            .or_default()
            .insert(session_id.to_string());

        tracing::debug!(session_id, identity, "Socket registered");
    }

    /// Drop a connection and all its room subscriptions.
    /// Returns the identity that owned the session.
    pub fn unregister(&self, session_id: &str) -> Option<String> {
        let connection = self.connections.remove(session_id)?.1;

        if let Some(mut sessions) = self.identities.get_mut(&connection.identity) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                drop(sessions);
                self.identities.remove(&connection.identity);
            }
        }

        self.rooms.retain(|_, sessions| {
            sessions.remove(session_id);
            !sessions.is_empty()
        });

        tracing::debug!(session_id, identity = %connection.identity, "Socket unregistered");
        Some(connection.identity)
    }

    pub fn join_room(&self, conversation_id: &str, session_id: &str) {
        self.rooms
            .entry(conversation_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    pub fn leave_room(&self, conversation_id: &str, session_id: &str) {
        if let Some(mut sessions) = self.rooms.get_mut(conversation_id) {
            sessions.remove(session_id);
        }
    }

    /// Conversations a session is currently joined to
    pub fn rooms_of(&self, session_id: &str) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|entry| entry.value().contains(session_id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn send_to_session(&self, session_id: &str, event: ServerEvent) -> bool {
        match self.connections.get(session_id) {
            Some(connection) => {
                if connection.tx.send(event).is_err() {
                    tracing::debug!(session_id, "Send to closed session dropped");
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    /// Deliver to every session of an identity. Returns sessions reached.
    pub fn send_to_identity(&self, identity: &str, event: &ServerEvent) -> usize {
        let Some(sessions) = self.identities.get(identity) else {
            return 0;
        };
        let session_ids: Vec<String> = sessions.iter().cloned().collect();
        drop(sessions);

        let mut delivered = 0;
        for session_id in session_ids {
            if self.send_to_session(&session_id, event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver to every session joined to a conversation room
    pub fn send_to_conversation(
        &self,
        conversation_id: &str,
        event: &ServerEvent,
        exclude_session: Option<&str>,
    ) -> usize {
        let Some(sessions) = self.rooms.get(conversation_id) else {
            return 0;
        };
        let session_ids: Vec<String> = sessions
            .iter()
            .filter(|s| Some(s.as_str()) != exclude_session)
            .cloned()
            .collect();
        drop(sessions);

        let mut delivered = 0;
        for session_id in session_ids {
            if self.send_to_session(&session_id, event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }
}

#[async_trait]
impl DeliverySink for SocketHub {
    async fn new_message(&self, recipient: &str, message: &Message) {
        self.send_to_identity(recipient, &ServerEvent::NewMessage(MessagePayload::from(message)));
    }

    async fn message_edited(&self, recipient: &str, message: &Message) {
        self.send_to_identity(
            recipient,
            &ServerEvent::MessageEdited(MessagePayload::from(message)),
        );
    }

    async fn message_deleted(
        &self,
        recipient: &str,
        message_id: &str,
        conversation_id: &str,
        _sender_id: &str,
    ) {
        self.send_to_identity(
            recipient,
            &ServerEvent::MessageDeleted {
                message_id: message_id.to_string(),
                conversation_id: conversation_id.to_string(),
            },
        );
    }

    async fn status_changed(
        &self,
        recipient: &str,
        message_id: &str,
        status: MessageStatus,
        at: i64,
    ) {
        self.send_to_identity(
            recipient,
            &ServerEvent::MessageStatusChanged {
                message_id: message_id.to_string(),
                status: status.as_str(),
                timestamp: at,
            },
        );
    }

    async fn conversation_read(
        &self,
        recipient: &str,
        conversation_id: &str,
        read_by: &str,
        up_to_message_id: Option<&str>,
    ) {
        self.send_to_identity(
            recipient,
            &ServerEvent::ConversationMarkedRead {
                conversation_id: conversation_id.to_string(),
                read_by: read_by.to_string(),
                up_to_message_id: up_to_message_id.map(str::to_string),
            },
        );
    }
}

/// Broadcast presence transitions to the rooms a session belongs to
pub fn broadcast_presence(hub: &SocketHub, session_id: &str, identity: &str, connected: bool) {
    let event = if connected {
        ServerEvent::UserConnected {
            identity: identity.to_string(),
        }
    } else {
        ServerEvent::UserDisconnected {
            identity: identity.to_string(),
            reason: "disconnect".to_string(),
        }
    };
    for conversation_id in hub.rooms_of(session_id) {
        hub.send_to_conversation(&conversation_id, &event, Some(session_id));
    }
}
