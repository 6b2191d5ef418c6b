//! Room registry
//!
//! Answers membership and policy questions for conversations and owns the
//! join/leave/add/remove mutations. Policy is enforced here, in one place:
//! the HTTP routes and the socket handlers both call through this
//! registry. Metadata reads go through a short-lived local cache.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::events::{ConversationChange, ConversationEvent};
use super::gateway::{GatewayError, MessageStoreGateway};
use super::presence::PresenceRegistry;
use crate::core::constants::CACHE_TTL_CONVERSATION;
use crate::data::streams::{StreamName, StreamService};
use crate::data::types::{Conversation, ConversationKind, Participant, ParticipantRole};
use crate::utils::time::now_millis;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("{identity} is not a participant of {conversation_id}")]
    NotParticipant {
        identity: String,
        conversation_id: String,
    },

    #[error("{identity} may not perform this action in {conversation_id}")]
    Forbidden {
        identity: String,
        conversation_id: String,
    },

    #[error(transparent)]
    Store(#[from] GatewayError),
}

/// Cached conversation metadata
#[derive(Debug, Clone)]
pub struct RoomMeta {
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
}

impl RoomMeta {
    pub fn participant(&self, identity: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == identity)
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.user_id.clone()).collect()
    }
}

pub struct RoomRegistry {
    gateway: Arc<MessageStoreGateway>,
    streams: Arc<StreamService>,
    cache: moka::sync::Cache<String, Arc<RoomMeta>>,
}

impl RoomRegistry {
    pub fn new(gateway: Arc<MessageStoreGateway>, streams: Arc<StreamService>) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            streams,
            cache: moka::sync::Cache::builder()
                .max_capacity(50_000)
                .time_to_live(Duration::from_secs(CACHE_TTL_CONVERSATION))
                .build(),
        })
    }

    /// Conversation metadata with participants, read-through cached
    pub async fn meta(&self, conversation_id: &str) -> Result<Arc<RoomMeta>, RoomError> {
        if let Some(meta) = self.cache.get(conversation_id) {
            return Ok(meta);
        }

        let conversation = self
            .gateway
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| RoomError::NotFound(conversation_id.to_string()))?;
        let participants = self.gateway.conversation_participants(conversation_id).await?;

        let meta = Arc::new(RoomMeta {
            conversation,
            participants,
        });
        self.cache.insert(conversation_id.to_string(), Arc::clone(&meta));
        Ok(meta)
    }

    pub fn invalidate(&self, conversation_id: &str) {
        self.cache.invalidate(conversation_id);
    }

    /// All participant identities of a conversation
    pub async fn participants(&self, conversation_id: &str) -> Result<Vec<String>, RoomError> {
        Ok(self.meta(conversation_id).await?.participant_ids())
    }

    /// Participants that are currently online
    pub async fn members_online(
        &self,
        conversation_id: &str,
        presence: &PresenceRegistry,
    ) -> Result<Vec<String>, RoomError> {
        let ids = self.participants(conversation_id).await?;
        Ok(presence.list_online(&ids).await)
    }

    pub async fn is_participant(
        &self,
        identity: &str,
        conversation_id: &str,
    ) -> Result<bool, RoomError> {
        Ok(self.meta(conversation_id).await?.participant(identity).is_some())
    }

    /// May `identity` post into this conversation?
    ///
    /// Participants may post, except in BROADCAST conversations which are
    /// write-once for everyone but the owner.
    pub async fn can_post(&self, identity: &str, conversation_id: &str) -> Result<(), RoomError> {
        let meta = self.meta(conversation_id).await?;
        let participant =
            meta.participant(identity)
                .ok_or_else(|| RoomError::NotParticipant {
                    identity: identity.to_string(),
                    conversation_id: conversation_id.to_string(),
                })?;

        if meta.conversation.kind == ConversationKind::Broadcast
            && participant.role != ParticipantRole::Owner
        {
            return Err(RoomError::Forbidden {
                identity: identity.to_string(),
                conversation_id: conversation_id.to_string(),
            });
        }

        Ok(())
    }

    /// May `identity` manage membership of this conversation?
    pub async fn can_administer(
        &self,
        identity: &str,
        conversation_id: &str,
    ) -> Result<(), RoomError> {
        let meta = self.meta(conversation_id).await?;
        let participant =
            meta.participant(identity)
                .ok_or_else(|| RoomError::NotParticipant {
                    identity: identity.to_string(),
                    conversation_id: conversation_id.to_string(),
                })?;

        if !participant.role.can_administer() {
            return Err(RoomError::Forbidden {
                identity: identity.to_string(),
                conversation_id: conversation_id.to_string(),
            });
        }

        Ok(())
    }

    /// Create a conversation and announce it
    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        created_by: &str,
        participants: &[(String, ParticipantRole)],
    ) -> Result<Conversation, RoomError> {
        let conversation = self
            .gateway
            .create_conversation(kind, created_by, participants)
            .await?;

        self.publish_change(&conversation.id, ConversationChange::Created)
            .await;
        self.gateway
            .record_event("CONVERSATION_UPDATED", &conversation.id, None)
            .await;

        Ok(conversation)
    }

    /// A participant joining their room (socket subscription)
    pub async fn join(&self, identity: &str, conversation_id: &str) -> Result<(), RoomError> {
        if !self.is_participant(identity, conversation_id).await? {
            return Err(RoomError::NotParticipant {
                identity: identity.to_string(),
                conversation_id: conversation_id.to_string(),
            });
        }
        self.publish_change(
            conversation_id,
            ConversationChange::Joined {
                user_id: identity.to_string(),
            },
        )
        .await;
        Ok(())
    }

    pub async fn leave(&self, identity: &str, conversation_id: &str) -> Result<(), RoomError> {
        self.publish_change(
            conversation_id,
            ConversationChange::Left {
                user_id: identity.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Add a participant; `actor` must be OWNER or ADMIN
    pub async fn add_participant(
        &self,
        actor: &str,
        conversation_id: &str,
        user_id: &str,
        role: ParticipantRole,
    ) -> Result<bool, RoomError> {
        self.can_administer(actor, conversation_id).await?;

        let meta = self.meta(conversation_id).await?;
        if meta.conversation.kind == ConversationKind::Private {
            return Err(RoomError::Forbidden {
                identity: actor.to_string(),
                conversation_id: conversation_id.to_string(),
            });
        }

        let added = self
            .gateway
            .add_participant(conversation_id, user_id, role)
            .await?;

        if added {
            self.invalidate(conversation_id);
            self.publish_change(
                conversation_id,
                ConversationChange::ParticipantAdded {
                    user_id: user_id.to_string(),
                },
            )
            .await;
            self.gateway
                .record_event("CONVERSATION_UPDATED", conversation_id, None)
                .await;
        }

        Ok(added)
    }

    /// Remove a participant; `actor` must be OWNER or ADMIN. The owner is
    /// never removable, which keeps at least one admin in every group.
    pub async fn remove_participant(
        &self,
        actor: &str,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<bool, RoomError> {
        self.can_administer(actor, conversation_id).await?;

        let removed = self
            .gateway
            .remove_participant(conversation_id, user_id)
            .await?;

        if removed {
            self.invalidate(conversation_id);
            self.publish_change(
                conversation_id,
                ConversationChange::ParticipantRemoved {
                    user_id: user_id.to_string(),
                },
            )
            .await;
            self.gateway
                .record_event("CONVERSATION_UPDATED", conversation_id, None)
                .await;
        }

        Ok(removed)
    }

    async fn publish_change(&self, conversation_id: &str, change: ConversationChange) {
        let event = ConversationEvent {
            conversation_id: conversation_id.to_string(),
            change,
            at: now_millis(),
        };
        if let Err(e) = self
            .streams
            .append(StreamName::EventsConversations, &event)
            .await
        {
            tracing::warn!(conversation_id, error = %e, "Failed to publish conversation event");
        }
    }
}
