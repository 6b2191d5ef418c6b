//! Ingest path: `receive_message`
//!
//! The synchronous write path. A message is WAL-logged before the store
//! commit and WAL-committed after it; the post-write event on
//! `events:messages` is what fans it out to live sockets. When the store
//! is unreachable (circuit open, transient failure, or timeout) the
//! message is parked on `fallback:messages` and the sender gets a QUEUED
//! acknowledgement instead of an error: acceptance is durable even when
//! persistence is not yet.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use super::events::{FallbackJob, MessageEvent, RetryAction, RetryJob, WalCommit, WalEntry};
use super::gateway::{GatewayError, MessageStoreGateway};
use super::rooms::{RoomError, RoomRegistry};
use crate::core::config::PipelineConfig;
use crate::data::files::FileService;
use crate::data::streams::{StreamError, StreamName, StreamService};
use crate::data::types::{FileStatus, Message, MessageKind, MessageStatus};
use crate::utils::time::now_millis;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Malformed request; never enters the pipeline
    #[error("validation failed: {0}")]
    Validation(String),

    /// Sender may not post here; never enters the pipeline
    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Sender exceeded their message budget
    #[error("rate limited, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Broker unreachable beyond the append retry budget; the caller may
    /// buffer client-side
    #[error(transparent)]
    Broker(#[from] StreamError),

    /// Store rejected the message for good
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

/// Outcome of a successful ingest call. `Queued` is a first-class result,
/// not an error: the message is parked durably and will be persisted by
/// the fallback worker.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Persisted and published
    Sent(Message),
    /// Accepted in degraded mode; the fallback worker owns it now
    Queued(Message),
}

impl IngestOutcome {
    pub fn message(&self) -> &Message {
        match self {
            IngestOutcome::Sent(m) | IngestOutcome::Queued(m) => m,
        }
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, IngestOutcome::Sent(_))
    }
}

/// A validated send request (socket `sendMessage` or `POST /messages`)
#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub receiver_id: Option<String>,
    pub attachment_id: Option<String>,
}

pub struct IngestService {
    streams: Arc<StreamService>,
    gateway: Arc<MessageStoreGateway>,
    rooms: Arc<RoomRegistry>,
    files: Arc<FileService>,
    config: PipelineConfig,
}

impl IngestService {
    pub fn new(
        streams: Arc<StreamService>,
        gateway: Arc<MessageStoreGateway>,
        rooms: Arc<RoomRegistry>,
        files: Arc<FileService>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            streams,
            gateway,
            rooms,
            files,
            config,
        }
    }

    /// The write path, straight-line:
    /// validate → authorize → `wal:pre` → persist → `wal:post` → publish.
    pub async fn receive_message(
        &self,
        sender_id: &str,
        request: SendMessageRequest,
    ) -> Result<IngestOutcome, IngestError> {
        self.validate(&request).await?;
        self.authorize(sender_id, &request.conversation_id).await?;

        let now = now_millis();
        let message = Message {
            id: Uuid::now_v7().to_string(),
            conversation_id: request.conversation_id.clone(),
            sender_id: sender_id.to_string(),
            receiver_id: request.receiver_id.clone(),
            content: request.content.clone(),
            kind: request.kind,
            attachment_id: request.attachment_id.clone(),
            status: MessageStatus::Sent,
            correlation_id: Uuid::new_v4().to_string(),
            created_at: now,
            edited_at: None,
            deleted_at: None,
        };

        // Pre-write log. A broker failure here surfaces to the caller:
        // without the WAL entry the durability contract cannot hold.
        let pre_stream_id = self
            .streams
            .append(
                StreamName::WalPre,
                &WalEntry {
                    message: message.clone(),
                    correlation_id: message.correlation_id.clone(),
                    first_seen_at: now,
                },
            )
            .await?;

        // Persist under the ingest budget; past it the sender gets QUEUED
        // and the fallback worker finishes the job.
        let save_result = tokio::time::timeout(
            std::time::Duration::from_millis(self.config.ingest_timeout_ms),
            self.gateway.save_message(&message),
        )
        .await;

        match save_result {
            Ok(Ok(inserted)) => {
                self.commit_effects(&message, Some(&pre_stream_id), inserted).await;
                Ok(IngestOutcome::Sent(message))
            }
            Ok(Err(e)) if e.is_retryable() => {
                tracing::warn!(
                    message_id = %message.id,
                    error = %e,
                    "Store unavailable, parking message on fallback queue"
                );
                self.park_on_fallback(&message).await?;
                Ok(IngestOutcome::Queued(message))
            }
            Err(_elapsed) => {
                tracing::warn!(
                    message_id = %message.id,
                    budget_ms = self.config.ingest_timeout_ms,
                    "Ingest budget exceeded, parking message on fallback queue"
                );
                self.park_on_fallback(&message).await?;
                Ok(IngestOutcome::Queued(message))
            }
            Ok(Err(GatewayError::Conflict(msg))) => Err(IngestError::Validation(msg)),
            Ok(Err(e)) => Err(IngestError::Unrecoverable(e.to_string())),
        }
    }

    /// Post-persist bookkeeping: `wal:post`, the NEW_MESSAGE event, the
    /// conversation touch, attachment binding, and the audit row. All
    /// best-effort: the message is durable, and the WAL recovery worker or
    /// reconnect backfill reconcile anything that slips here.
    ///
    /// Shared with the fallback, retry, and WAL-recovery workers, which
    /// commit messages outside the synchronous path. Those workers drain
    /// at-least-once streams, so `inserted` carries the save's dedup
    /// signal: a replay of an already persisted message closes the WAL
    /// pair and publishes nothing.
    pub(crate) async fn commit_effects(
        &self,
        message: &Message,
        pre_stream_id: Option<&str>,
        inserted: bool,
    ) {
        // Always close the WAL pair, even on replay: the recovery scan
        // keeps rescanning any correlation id without a wal:post record.
        let commit = WalCommit {
            message_id: message.id.clone(),
            correlation_id: message.correlation_id.clone(),
            pre_stream_id: pre_stream_id.map(str::to_string),
            persisted_at: now_millis(),
        };
        if let Err(e) = self.streams.append(StreamName::WalPost, &commit).await {
            // The WAL pair stays open; recovery will replay the save,
            // which is idempotent by message id.
            tracing::error!(message_id = %message.id, error = %e, "Failed to append wal:post");
        }

        if !inserted {
            // The row already existed: a previous attempt published the
            // event (or recipients backfill). Re-publishing here would
            // fan out a duplicate and drift the unread counters.
            tracing::debug!(
                message_id = %message.id,
                "Replay of an already persisted message, skipping publication"
            );
            return;
        }

        let event = MessageEvent::New {
            message: message.clone(),
        };
        let audit_type = event.event_type();
        if let Err(e) = self.streams.append(StreamName::EventsMessages, &event).await {
            tracing::error!(message_id = %message.id, error = %e, "Failed to publish NEW_MESSAGE");
            self.enqueue_publish_retry(message, event).await;
        }

        if let Some(attachment_id) = &message.attachment_id
            && let Err(e) = self
                .files
                .attach_to_message(attachment_id, &message.id, &message.conversation_id)
                .await
        {
            tracing::warn!(message_id = %message.id, error = %e, "Failed to bind attachment");
        }

        if let Err(e) = self
            .gateway
            .touch_conversation(&message.conversation_id, &message.id, message.created_at)
            .await
        {
            tracing::warn!(message_id = %message.id, error = %e, "Failed to touch conversation");
        }

        self.gateway.record_event(audit_type, &message.id, None).await;
    }

    async fn park_on_fallback(&self, message: &Message) -> Result<(), IngestError> {
        let job = FallbackJob {
            message: message.clone(),
            correlation_id: message.correlation_id.clone(),
            attempt: 0,
            first_seen_at: now_millis(),
        };
        self.streams
            .append(StreamName::FallbackMessages, &job)
            .await?;
        Ok(())
    }

    /// Publishing failed with the broker wobbling; hand the event to the
    /// retry worker. If even that append fails there is nothing durable
    /// left to do: recipients reconcile via backfill.
    async fn enqueue_publish_retry(&self, message: &Message, event: MessageEvent) {
        let job = RetryJob {
            action: RetryAction::PublishMessageEvent { event },
            attempt: 1,
            first_seen_at: now_millis(),
            correlation_id: message.correlation_id.clone(),
            not_before: now_millis(),
        };
        if let Err(e) = self.streams.append(StreamName::RetryMessages, &job).await {
            tracing::error!(message_id = %message.id, error = %e, "Retry enqueue failed, relying on backfill");
        }
    }

    async fn validate(&self, request: &SendMessageRequest) -> Result<(), IngestError> {
        match request.kind {
            MessageKind::Text | MessageKind::System => {
                if request.content.trim().is_empty() {
                    return Err(IngestError::Validation("content must not be empty".into()));
                }
            }
            MessageKind::File => {
                let attachment_id = request
                    .attachment_id
                    .as_deref()
                    .ok_or_else(|| {
                        IngestError::Validation("file message requires attachment_id".into())
                    })?;
                match self.files.get(attachment_id).await {
                    Ok(Some(file)) if file.status == FileStatus::Completed => {}
                    Ok(Some(file)) => {
                        return Err(IngestError::Validation(format!(
                            "attachment {attachment_id} is {}",
                            file.status.as_str()
                        )));
                    }
                    Ok(None) => {
                        return Err(IngestError::Validation(format!(
                            "attachment not found: {attachment_id}"
                        )));
                    }
                    // Store down: accept degraded; the binding step after
                    // persist re-touches the file row anyway
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(attachment_id, error = %e, "Attachment check degraded, store unavailable");
                    }
                    Err(e) => return Err(IngestError::Unrecoverable(e.to_string())),
                }
            }
        }

        if request.content.len() > self.config.max_content_length {
            return Err(IngestError::Validation(format!(
                "content exceeds {} bytes",
                self.config.max_content_length
            )));
        }

        Ok(())
    }

    async fn authorize(&self, sender_id: &str, conversation_id: &str) -> Result<(), IngestError> {
        match self.rooms.can_post(sender_id, conversation_id).await {
            Ok(()) => Ok(()),
            Err(RoomError::NotFound(id)) => Err(IngestError::NotFound(id)),
            Err(e @ (RoomError::NotParticipant { .. } | RoomError::Forbidden { .. })) => {
                Err(IngestError::Authorization(e.to_string()))
            }
            // Membership unreadable because the store is down: accept and
            // let the recovery pipeline sort persistence out. Bad targets
            // die in the store's FK checks and end in the DLQ.
            Err(RoomError::Store(e)) if e.is_retryable() => {
                tracing::warn!(conversation_id, error = %e, "Authorization degraded, store unavailable");
                Ok(())
            }
            Err(RoomError::Store(e)) => Err(IngestError::Unrecoverable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{CircuitConfig, FilesConfig, StreamLimits};
    use crate::data::files::FilesystemStorage;
    use crate::data::sqlite::SqliteService;
    use crate::data::streams::MemoryStreamBackend;
    use crate::data::types::{ConversationKind, ParticipantRole};
    use crate::domain::breaker::CircuitBreaker;

    struct Fixture {
        _dir: tempfile::TempDir,
        streams: Arc<StreamService>,
        gateway: Arc<MessageStoreGateway>,
        rooms: Arc<RoomRegistry>,
        ingest: IngestService,
        conversation_id: String,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let breaker = Arc::new(CircuitBreaker::new(CircuitConfig::default()));
        let gateway = Arc::new(MessageStoreGateway::new(Arc::clone(&store), breaker, 5_000));
        let streams = Arc::new(StreamService::with_backend(
            Arc::new(MemoryStreamBackend::new()),
            StreamLimits::default(),
        ));
        let rooms = RoomRegistry::new(Arc::clone(&gateway), Arc::clone(&streams));
        let files = Arc::new(FileService::with_storage(
            FilesConfig::default(),
            Arc::new(FilesystemStorage::new(
                dir.path().join("files"),
                dir.path().join("temp"),
            )),
            Arc::clone(&gateway),
        ));

        let conversation = rooms
            .create_conversation(
                ConversationKind::Private,
                "alice",
                &[
                    ("alice".to_string(), ParticipantRole::Owner),
                    ("bob".to_string(), ParticipantRole::Member),
                ],
            )
            .await
            .unwrap();

        let ingest = IngestService::new(
            Arc::clone(&streams),
            Arc::clone(&gateway),
            Arc::clone(&rooms),
            files,
            crate::core::config::PipelineConfig::default(),
        );

        Fixture {
            _dir: dir,
            streams,
            gateway,
            rooms,
            ingest,
            conversation_id: conversation.id,
        }
    }

    fn text_request(conversation_id: &str, content: &str) -> SendMessageRequest {
        SendMessageRequest {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
            receiver_id: Some("bob".to_string()),
            attachment_id: None,
        }
    }

    #[tokio::test]
    async fn test_happy_path_persists_and_logs_wal_pair() {
        let f = fixture().await;

        let outcome = f
            .ingest
            .receive_message("alice", text_request(&f.conversation_id, "hi"))
            .await
            .unwrap();

        let message = match &outcome {
            IngestOutcome::Sent(m) => m,
            other => panic!("expected Sent, got {other:?}"),
        };
        assert!(outcome.is_persisted());

        // Persisted
        let stored = f.gateway.find_message(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "hi");

        // Exactly one wal:pre and one wal:post with the same correlation id
        let pre = f
            .streams
            .range_by_time(StreamName::WalPre, 0, i64::MAX)
            .await
            .unwrap();
        let post = f
            .streams
            .range_by_time(StreamName::WalPost, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(pre.len(), 1);
        assert_eq!(post.len(), 1);
        let entry: WalEntry = StreamService::decode(&pre[0]).unwrap();
        let commit: WalCommit = StreamService::decode(&post[0]).unwrap();
        assert_eq!(entry.correlation_id, commit.correlation_id);
        assert_eq!(commit.pre_stream_id.as_deref(), Some(pre[0].id.as_str()));

        // NEW_MESSAGE published
        let events = f
            .streams
            .range_by_time(StreamName::EventsMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let event: MessageEvent = StreamService::decode(&events[0]).unwrap();
        assert_eq!(event.message_id(), message.id);

        // Conversation touched
        let conversation = f
            .gateway
            .get_conversation(&f.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.last_message_id.as_deref(), Some(message.id.as_str()));
    }

    #[tokio::test]
    async fn test_validation_rejects_before_pipeline() {
        let f = fixture().await;

        let err = f
            .ingest
            .receive_message("alice", text_request(&f.conversation_id, "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));

        // Nothing entered the WAL
        let pre = f
            .streams
            .range_by_time(StreamName::WalPre, 0, i64::MAX)
            .await
            .unwrap();
        assert!(pre.is_empty());
    }

    #[tokio::test]
    async fn test_non_participant_is_rejected() {
        let f = fixture().await;

        let err = f
            .ingest
            .receive_message("mallory", text_request(&f.conversation_id, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_not_found() {
        let f = fixture().await;
        let err = f
            .ingest
            .receive_message("alice", text_request("missing", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_file_message_requires_completed_attachment() {
        let f = fixture().await;

        let request = SendMessageRequest {
            conversation_id: f.conversation_id.clone(),
            content: String::new(),
            kind: MessageKind::File,
            receiver_id: None,
            attachment_id: Some("missing-file".to_string()),
        };
        let err = f.ingest.receive_message("alice", request).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));

        let request = SendMessageRequest {
            conversation_id: f.conversation_id.clone(),
            content: String::new(),
            kind: MessageKind::File,
            receiver_id: None,
            attachment_id: None,
        };
        let err = f.ingest.receive_message("alice", request).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }

    #[tokio::test]
    async fn test_circuit_open_queues_message() {
        let f = fixture().await;

        // Prime the room cache so authorization works while the store is out
        f.rooms.can_post("alice", &f.conversation_id).await.unwrap();

        // Trip the breaker
        for _ in 0..CircuitConfig::default().failure_threshold {
            f.gateway.breaker().record_failure();
        }

        let outcome = f
            .ingest
            .receive_message("alice", text_request(&f.conversation_id, "queued"))
            .await
            .unwrap();
        let message = match &outcome {
            IngestOutcome::Queued(m) => m,
            other => panic!("expected Queued, got {other:?}"),
        };
        assert!(!outcome.is_persisted());

        // WAL pre written, no post
        let pre = f
            .streams
            .range_by_time(StreamName::WalPre, 0, i64::MAX)
            .await
            .unwrap();
        let post = f
            .streams
            .range_by_time(StreamName::WalPost, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(pre.len(), 1);
        assert!(post.is_empty());

        // Parked on the fallback queue with attempt 0
        let jobs = f
            .streams
            .range_by_time(StreamName::FallbackMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        let job: FallbackJob = StreamService::decode(&jobs[0]).unwrap();
        assert_eq!(job.message.id, message.id);
        assert_eq!(job.attempt, 0);

        // No NEW_MESSAGE yet: recipients must not see it before wal:post
        let events = f
            .streams
            .range_by_time(StreamName::EventsMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_message_ids_are_time_ordered() {
        let f = fixture().await;

        let first = f
            .ingest
            .receive_message("alice", text_request(&f.conversation_id, "one"))
            .await
            .unwrap();
        let second = f
            .ingest
            .receive_message("alice", text_request(&f.conversation_id, "two"))
            .await
            .unwrap();

        // UUIDv7 ids sort by creation time
        assert!(second.message().id > first.message().id);
        assert!(second.message().created_at >= first.message().created_at);
    }
}
