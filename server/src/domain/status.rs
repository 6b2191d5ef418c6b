//! Status tracker: delivered/read bookkeeping
//!
//! Applies delivery and read acknowledgements idempotently (a READ is
//! never downgraded), resets unread counters on read, and publishes the
//! corresponding `events:status` records for the status consumer to fan
//! out.

use std::sync::Arc;

use thiserror::Error;

use super::events::StatusEvent;
use super::gateway::{GatewayError, MessageStoreGateway};
use super::rooms::{RoomError, RoomRegistry};
use crate::data::streams::{StreamError, StreamName, StreamService};
use crate::data::types::{ConversationKind, MessageStatus};
use crate::utils::time::now_millis;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{identity} is not a participant of {conversation_id}")]
    NotParticipant {
        identity: String,
        conversation_id: String,
    },

    #[error(transparent)]
    Store(#[from] GatewayError),

    #[error(transparent)]
    Broker(#[from] StreamError),
}

impl From<RoomError> for StatusError {
    fn from(e: RoomError) -> Self {
        match e {
            RoomError::NotFound(id) => StatusError::NotFound(id),
            RoomError::NotParticipant {
                identity,
                conversation_id,
            }
            | RoomError::Forbidden {
                identity,
                conversation_id,
            } => StatusError::NotParticipant {
                identity,
                conversation_id,
            },
            RoomError::Store(e) => StatusError::Store(e),
        }
    }
}

pub struct StatusTracker {
    gateway: Arc<MessageStoreGateway>,
    rooms: Arc<RoomRegistry>,
    streams: Arc<StreamService>,
}

impl StatusTracker {
    pub fn new(
        gateway: Arc<MessageStoreGateway>,
        rooms: Arc<RoomRegistry>,
        streams: Arc<StreamService>,
    ) -> Self {
        Self {
            gateway,
            rooms,
            streams,
        }
    }

    /// Record a delivery acknowledgement from a recipient.
    ///
    /// Idempotent: repeated acks (and acks arriving after a READ) change
    /// nothing and emit nothing. Returns whether the status advanced.
    pub async fn mark_delivered(
        &self,
        message_id: &str,
        receiver_id: &str,
    ) -> Result<bool, StatusError> {
        let message = self
            .gateway
            .find_message(message_id)
            .await?
            .ok_or_else(|| StatusError::NotFound(message_id.to_string()))?;

        if message.sender_id == receiver_id {
            // A sender acking their own message carries no information
            return Ok(false);
        }

        let meta = self.rooms.meta(&message.conversation_id).await?;
        if meta.participant(receiver_id).is_none() {
            return Err(StatusError::NotParticipant {
                identity: receiver_id.to_string(),
                conversation_id: message.conversation_id.clone(),
            });
        }

        // Cheap monotonicity pre-check; the upsert is the real guard
        if let Some(current) = self.gateway.recipient_status(message_id, receiver_id).await?
            && !current.can_transition(MessageStatus::Delivered)
        {
            return Ok(false);
        }

        let advanced = self
            .gateway
            .mark_recipient_status(message_id, receiver_id, MessageStatus::Delivered)
            .await?;

        if !advanced {
            return Ok(false);
        }

        // For a private conversation the single recipient's state is the
        // sender-visible aggregate
        if meta.conversation.kind == ConversationKind::Private {
            self.gateway
                .update_aggregate_status(message_id, MessageStatus::Delivered)
                .await?;
        }

        let event = StatusEvent::Delivered {
            message_id: message_id.to_string(),
            conversation_id: message.conversation_id.clone(),
            receiver_id: receiver_id.to_string(),
            at: now_millis(),
        };
        self.streams.append(StreamName::EventsStatus, &event).await?;
        self.gateway
            .record_event(event.event_type(), message_id, None)
            .await;

        Ok(true)
    }

    /// Record a read acknowledgement: everything in the conversation up to
    /// `up_to_message_id` (or now) becomes READ for the reader, and the
    /// reader's unread counter resets to zero.
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        up_to_message_id: Option<&str>,
    ) -> Result<u64, StatusError> {
        let meta = self.rooms.meta(conversation_id).await?;
        if meta.participant(reader_id).is_none() {
            return Err(StatusError::NotParticipant {
                identity: reader_id.to_string(),
                conversation_id: conversation_id.to_string(),
            });
        }

        let up_to_created_at = match up_to_message_id {
            Some(message_id) => {
                let message = self
                    .gateway
                    .find_message(message_id)
                    .await?
                    .filter(|m| m.conversation_id == conversation_id)
                    .ok_or_else(|| StatusError::NotFound(message_id.to_string()))?;
                message.created_at
            }
            None => now_millis(),
        };

        let affected = self
            .gateway
            .mark_read_up_to(conversation_id, reader_id, up_to_created_at)
            .await?;

        if meta.conversation.kind == ConversationKind::Private {
            self.gateway
                .aggregate_read_up_to(conversation_id, reader_id, up_to_created_at)
                .await?;
        }

        self.gateway.reset_unread(conversation_id, reader_id).await?;

        let event = StatusEvent::Read {
            conversation_id: conversation_id.to_string(),
            reader_id: reader_id.to_string(),
            up_to_message_id: up_to_message_id.map(str::to_string),
            at: now_millis(),
        };
        self.streams.append(StreamName::EventsStatus, &event).await?;
        self.gateway
            .record_event(event.event_type(), conversation_id, None)
            .await;

        Ok(affected)
    }
}
