//! Message store gateway
//!
//! Thin facade over the SQLite repositories. Every call passes through the
//! circuit breaker with a per-call timeout; errors are classified so only
//! infrastructure failures trip the circuit. Writes are idempotent by
//! `message.id`, which is what makes WAL replay and retry safe.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::breaker::CircuitBreaker;
use crate::data::sqlite::repositories::{conversations, events, files, messages};
use crate::data::sqlite::{SqliteError, SqliteService};
use crate::data::types::{
    Conversation, ConversationKind, FileRecord, FileStatus, Message, MessageStatus, Participant,
    ParticipantRole,
};
use crate::utils::time::now_millis;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Breaker is open: fail fast, no store call was made
    #[error("circuit open")]
    CircuitOpen,

    /// Store call exceeded the breaker's per-call timeout
    #[error("store call timed out")]
    Timeout,

    /// Infrastructure-level store failure, worth retrying
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Constraint violation (duplicate, invariant breach)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Store rejected the operation for good; retrying will not help
    #[error("unrecoverable store error: {0}")]
    Unrecoverable(String),
}

impl GatewayError {
    /// Whether routing the operation through the fallback/retry pipeline
    /// can eventually succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::CircuitOpen | GatewayError::Timeout | GatewayError::TransientStore(_)
        )
    }
}

pub struct MessageStoreGateway {
    store: Arc<SqliteService>,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Duration,
}

impl MessageStoreGateway {
    pub fn new(store: Arc<SqliteService>, breaker: Arc<CircuitBreaker>, call_timeout_ms: u64) -> Self {
        Self {
            store,
            breaker,
            call_timeout: Duration::from_millis(call_timeout_ms),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run one store operation under the breaker.
    ///
    /// Success and non-transient errors (the store answered) count as
    /// breaker successes; timeouts and transient errors count as failures.
    async fn guard<T, Fut>(&self, op: &'static str, fut: Fut) -> Result<T, GatewayError>
    where
        Fut: Future<Output = Result<T, SqliteError>>,
    {
        if !self.breaker.try_acquire() {
            return Err(GatewayError::CircuitOpen);
        }

        match tokio::time::timeout(self.call_timeout, fut).await {
            Err(_) => {
                self.breaker.record_failure();
                tracing::warn!(op, timeout_ms = self.call_timeout.as_millis() as u64, "Store call timed out");
                Err(GatewayError::Timeout)
            }
            Ok(Ok(value)) => {
                self.breaker.record_success();
                Ok(value)
            }
            Ok(Err(e)) if e.is_transient() => {
                self.breaker.record_failure();
                tracing::warn!(op, error = %e, "Transient store error");
                Err(GatewayError::TransientStore(e.to_string()))
            }
            Ok(Err(SqliteError::Conflict(msg))) => {
                self.breaker.record_success();
                Err(GatewayError::Conflict(msg))
            }
            Ok(Err(e)) => {
                self.breaker.record_success();
                tracing::error!(op, error = %e, "Unrecoverable store error");
                Err(GatewayError::Unrecoverable(e.to_string()))
            }
        }
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Persist a message. Returns true when the row was inserted, false
    /// when an identical id already existed (idempotent replay).
    pub async fn save_message(&self, message: &Message) -> Result<bool, GatewayError> {
        self.guard("save_message", messages::save_message(self.store.pool(), message))
            .await
    }

    pub async fn find_message(&self, id: &str) -> Result<Option<Message>, GatewayError> {
        self.guard("find_message", messages::find_by_id(self.store.pool(), id))
            .await
    }

    pub async fn list_messages(
        &self,
        conversation_id: &str,
        before: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Message>, GatewayError> {
        self.guard(
            "list_messages",
            messages::list_by_conversation(self.store.pool(), conversation_id, before, limit),
        )
        .await
    }

    pub async fn update_aggregate_status(
        &self,
        message_id: &str,
        to: MessageStatus,
    ) -> Result<bool, GatewayError> {
        self.guard(
            "update_aggregate_status",
            messages::update_aggregate_status(self.store.pool(), message_id, to),
        )
        .await
    }

    pub async fn mark_recipient_status(
        &self,
        message_id: &str,
        recipient_id: &str,
        to: MessageStatus,
    ) -> Result<bool, GatewayError> {
        self.guard(
            "mark_recipient_status",
            messages::upsert_recipient_status(
                self.store.pool(),
                message_id,
                recipient_id,
                to,
                now_millis(),
            ),
        )
        .await
    }

    pub async fn recipient_status(
        &self,
        message_id: &str,
        recipient_id: &str,
    ) -> Result<Option<MessageStatus>, GatewayError> {
        self.guard(
            "recipient_status",
            messages::recipient_status(self.store.pool(), message_id, recipient_id),
        )
        .await
    }

    pub async fn mark_read_up_to(
        &self,
        conversation_id: &str,
        recipient_id: &str,
        up_to_created_at: i64,
    ) -> Result<u64, GatewayError> {
        self.guard(
            "mark_read_up_to",
            messages::mark_read_up_to(
                self.store.pool(),
                conversation_id,
                recipient_id,
                up_to_created_at,
                now_millis(),
            ),
        )
        .await
    }

    pub async fn aggregate_read_up_to(
        &self,
        conversation_id: &str,
        reader_id: &str,
        up_to_created_at: i64,
    ) -> Result<u64, GatewayError> {
        self.guard(
            "aggregate_read_up_to",
            messages::aggregate_read_up_to(
                self.store.pool(),
                conversation_id,
                reader_id,
                up_to_created_at,
            ),
        )
        .await
    }

    pub async fn edit_message(
        &self,
        message_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<bool, GatewayError> {
        self.guard(
            "edit_message",
            messages::edit(self.store.pool(), message_id, sender_id, content, now_millis()),
        )
        .await
    }

    pub async fn soft_delete_message(
        &self,
        message_id: &str,
        sender_id: &str,
    ) -> Result<bool, GatewayError> {
        self.guard(
            "soft_delete_message",
            messages::soft_delete(self.store.pool(), message_id, sender_id, now_millis()),
        )
        .await
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        created_by: &str,
        participants: &[(String, ParticipantRole)],
    ) -> Result<Conversation, GatewayError> {
        self.guard(
            "create_conversation",
            conversations::create(self.store.pool(), kind, created_by, participants, now_millis()),
        )
        .await
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, GatewayError> {
        self.guard("get_conversation", conversations::get(self.store.pool(), id))
            .await
    }

    pub async fn get_private_by_pair(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Option<Conversation>, GatewayError> {
        self.guard(
            "get_private_by_pair",
            conversations::get_by_pair(self.store.pool(), a, b),
        )
        .await
    }

    pub async fn conversation_participants(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Participant>, GatewayError> {
        self.guard(
            "conversation_participants",
            conversations::participants(self.store.pool(), conversation_id),
        )
        .await
    }

    pub async fn get_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<Participant>, GatewayError> {
        self.guard(
            "get_participant",
            conversations::participant(self.store.pool(), conversation_id, user_id),
        )
        .await
    }

    pub async fn list_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<(Conversation, Participant)>, GatewayError> {
        self.guard(
            "list_conversations",
            conversations::list_for_user(self.store.pool(), user_id),
        )
        .await
    }

    /// Advance the conversation head; a no-op when the head is already
    /// newer (out-of-order recovery commits)
    pub async fn touch_conversation(
        &self,
        conversation_id: &str,
        last_message_id: &str,
        activity: i64,
    ) -> Result<bool, GatewayError> {
        self.guard(
            "touch_conversation",
            conversations::touch(self.store.pool(), conversation_id, last_message_id, activity),
        )
        .await
    }

    /// Recompute per-participant unread counters from the stored messages.
    /// Idempotent by construction: safe under event redelivery.
    pub async fn recompute_unread(&self, conversation_id: &str) -> Result<u64, GatewayError> {
        self.guard(
            "recompute_unread",
            conversations::recompute_unread(self.store.pool(), conversation_id),
        )
        .await
    }

    pub async fn reset_unread(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<bool, GatewayError> {
        self.guard(
            "reset_unread",
            conversations::reset_unread(self.store.pool(), conversation_id, user_id, now_millis()),
        )
        .await
    }

    pub async fn add_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
        role: ParticipantRole,
    ) -> Result<bool, GatewayError> {
        self.guard(
            "add_participant",
            conversations::add_participant(
                self.store.pool(),
                conversation_id,
                user_id,
                role,
                now_millis(),
            ),
        )
        .await
    }

    pub async fn remove_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<bool, GatewayError> {
        self.guard(
            "remove_participant",
            conversations::remove_participant(self.store.pool(), conversation_id, user_id),
        )
        .await
    }

    // ========================================================================
    // Files
    // ========================================================================

    pub async fn create_file(&self, file: &FileRecord) -> Result<(), GatewayError> {
        self.guard("create_file", files::create(self.store.pool(), file))
            .await
    }

    pub async fn find_file(&self, id: &str) -> Result<Option<FileRecord>, GatewayError> {
        self.guard("find_file", files::find_by_id(self.store.pool(), id))
            .await
    }

    pub async fn update_file_status(
        &self,
        id: &str,
        to: FileStatus,
    ) -> Result<bool, GatewayError> {
        self.guard(
            "update_file_status",
            files::update_status(self.store.pool(), id, to, now_millis()),
        )
        .await
    }

    pub async fn attach_file_to_message(
        &self,
        file_id: &str,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<bool, GatewayError> {
        self.guard(
            "attach_file_to_message",
            files::attach_to_message(
                self.store.pool(),
                file_id,
                message_id,
                conversation_id,
                now_millis(),
            ),
        )
        .await
    }

    pub async fn bump_file_download(&self, id: &str) -> Result<bool, GatewayError> {
        self.guard(
            "bump_file_download",
            files::bump_download_count(self.store.pool(), id),
        )
        .await
    }

    // ========================================================================
    // Event audit log
    // ========================================================================

    /// Best-effort audit record; failures are logged, never propagated
    pub async fn record_event(&self, event_type: &str, entity_id: &str, payload: Option<&str>) {
        let result = self
            .guard(
                "record_event",
                events::record(self.store.pool(), event_type, entity_id, payload, now_millis()),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(event_type, entity_id, error = %e, "Event audit write failed");
        }
    }

    pub async fn recent_events(
        &self,
        limit: u32,
    ) -> Result<Vec<events::EventRow>, GatewayError> {
        self.guard("recent_events", events::recent(self.store.pool(), limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CircuitConfig;
    use crate::data::types::MessageKind;

    async fn gateway() -> MessageStoreGateway {
        let store = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let breaker = Arc::new(CircuitBreaker::new(CircuitConfig::default()));
        MessageStoreGateway::new(store, breaker, 5_000)
    }

    fn message(id: &str, conversation_id: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: "alice".to_string(),
            receiver_id: Some("bob".to_string()),
            content: "hi".to_string(),
            kind: MessageKind::Text,
            attachment_id: None,
            status: MessageStatus::Sent,
            correlation_id: "corr".to_string(),
            created_at: now_millis(),
            edited_at: None,
            deleted_at: None,
        }
    }

    async fn seed_conversation(gateway: &MessageStoreGateway) -> Conversation {
        gateway
            .create_conversation(
                ConversationKind::Private,
                "alice",
                &[
                    ("alice".to_string(), ParticipantRole::Owner),
                    ("bob".to_string(), ParticipantRole::Member),
                ],
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_is_idempotent_through_gateway() {
        let gateway = gateway().await;
        let conversation = seed_conversation(&gateway).await;
        let msg = message("m1", &conversation.id);

        assert!(gateway.save_message(&msg).await.unwrap());
        assert!(!gateway.save_message(&msg).await.unwrap());
    }

    #[tokio::test]
    async fn test_conflict_is_not_retryable_and_keeps_breaker_closed() {
        let gateway = gateway().await;
        seed_conversation(&gateway).await;

        let err = gateway
            .create_conversation(
                ConversationKind::Private,
                "alice",
                &[
                    ("alice".to_string(), ParticipantRole::Owner),
                    ("bob".to_string(), ParticipantRole::Member),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        assert!(!err.is_retryable());

        // The store answered; the breaker saw a success
        assert_eq!(
            gateway.breaker().state(),
            crate::domain::breaker::BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn test_circuit_open_fails_fast() {
        let store = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let breaker = Arc::new(CircuitBreaker::new(CircuitConfig {
            failure_threshold: 1,
            reset_timeout_ms: 60_000,
            half_open_max_calls: 1,
            call_timeout_ms: 5_000,
        }));
        let gateway = MessageStoreGateway::new(store, breaker, 5_000);

        gateway.breaker().record_failure();

        let err = gateway.find_message("m1").await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_record_event_is_best_effort() {
        let gateway = gateway().await;
        gateway.record_event("NEW_MESSAGE", "m1", Some("{}")).await;

        let rows = gateway.recent_events(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "NEW_MESSAGE");
    }
}
