//! Fallback worker
//!
//! Drains `fallback:messages`: messages accepted while the store was
//! unreachable. This is a queue, not a retry: while the circuit stays
//! open each record is re-appended with the *same* attempt counter and the
//! worker backs off, preserving arrival order per conversation. Once a
//! save succeeds, the worker finishes what the ingest path could not:
//! `wal:post`, the NEW_MESSAGE event, and the conversation touch. Failures
//! other than an open circuit route to `retry:messages`.

use std::sync::Arc;

use tokio::sync::watch;

use super::WorkerMetricsHandle;
use crate::core::config::PipelineConfig;
use crate::core::constants::{STREAM_BLOCK_MS, WORKER_BATCH_SIZE};
use crate::data::streams::{RawRecord, StreamName, StreamService};
use crate::domain::events::{FallbackJob, RetryAction, RetryJob};
use crate::domain::gateway::{GatewayError, MessageStoreGateway};
use crate::domain::ingest::IngestService;
use crate::utils::time::now_millis;

const GROUP: &str = "fallback";

/// Pause after finding the circuit still open, so the queue does not spin
const CIRCUIT_WAIT_MS: u64 = 500;

pub struct FallbackWorker {
    streams: Arc<StreamService>,
    gateway: Arc<MessageStoreGateway>,
    ingest: Arc<IngestService>,
    config: PipelineConfig,
}

impl FallbackWorker {
    pub fn new(
        streams: Arc<StreamService>,
        gateway: Arc<MessageStoreGateway>,
        ingest: Arc<IngestService>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            streams,
            gateway,
            ingest,
            config,
        })
    }

    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
        metrics: WorkerMetricsHandle,
    ) {
        let consumer = self.streams.consumer_name(GROUP);
        let mut claim_interval = tokio::time::interval(std::time::Duration::from_secs(30));

        tracing::debug!(consumer = %consumer, "FallbackWorker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = claim_interval.tick() => {
                    match self
                        .streams
                        .claim_idle(StreamName::FallbackMessages, GROUP, &consumer, self.config.claim_idle_ms, 100)
                        .await
                    {
                        Ok(claimed) if !claimed.is_empty() => {
                            tracing::debug!(count = claimed.len(), "Claimed stuck fallback records");
                            for record in claimed {
                                self.process(&record, &metrics).await;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Fallback claim cycle failed"),
                    }
                }
                batch = self.streams.read_group(
                    StreamName::FallbackMessages,
                    GROUP,
                    &consumer,
                    WORKER_BATCH_SIZE,
                    STREAM_BLOCK_MS,
                    true,
                ) => {
                    match batch {
                        Ok(records) => {
                            let mut circuit_still_open = false;
                            for record in records {
                                circuit_still_open |= self.process(&record, &metrics).await;
                            }
                            if circuit_still_open {
                                tokio::select! {
                                    _ = shutdown_rx.changed() => {}
                                    _ = tokio::time::sleep(std::time::Duration::from_millis(CIRCUIT_WAIT_MS)) => {}
                                }
                            }
                        }
                        Err(e) => {
                            metrics.failed(&e);
                            tracing::warn!(error = %e, "Fallback read failed");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        tracing::debug!("FallbackWorker shutdown complete");
    }

    /// Process one parked message. Returns true when the circuit was
    /// still open (caller backs off before the next batch).
    async fn process(&self, record: &RawRecord, metrics: &WorkerMetricsHandle) -> bool {
        let job: FallbackJob = match StreamService::decode(record) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(record_id = %record.id, error = %e, "Undecodable fallback record, discarding");
                self.ack(&record.id).await;
                metrics.failed(&e);
                return false;
            }
        };

        match self.gateway.save_message(&job.message).await {
            Ok(inserted) => {
                self.ingest.commit_effects(&job.message, None, inserted).await;
                self.ack(&record.id).await;
                metrics.processed(1);
                tracing::debug!(message_id = %job.message.id, "Fallback message persisted");
                false
            }
            Err(GatewayError::CircuitOpen) => {
                // Still degraded: keep the message queued, same attempt
                if let Err(e) = self
                    .streams
                    .append(StreamName::FallbackMessages, &job)
                    .await
                {
                    tracing::error!(error = %e, "Failed to re-queue fallback record, leaving pending");
                    return true; // no ack: claim cycle recovers it
                }
                self.ack(&record.id).await;
                true
            }
            Err(e) => {
                // Not a circuit problem: hand over to the retry pipeline
                tracing::warn!(message_id = %job.message.id, error = %e, "Fallback save failed, routing to retry");
                let retry = RetryJob {
                    action: RetryAction::SaveMessage {
                        message: job.message.clone(),
                        correlation_id: job.correlation_id.clone(),
                    },
                    attempt: 1,
                    first_seen_at: job.first_seen_at,
                    correlation_id: job.correlation_id,
                    not_before: now_millis(),
                };
                if let Err(e) = self.streams.append(StreamName::RetryMessages, &retry).await {
                    tracing::error!(error = %e, "Failed to route to retry, leaving pending");
                    return false;
                }
                self.ack(&record.id).await;
                metrics.failed(&e);
                false
            }
        }
    }

    async fn ack(&self, record_id: &str) {
        if let Err(e) = self
            .streams
            .ack(StreamName::FallbackMessages, GROUP, record_id)
            .await
        {
            tracing::warn!(record_id, error = %e, "Failed to ack fallback record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{CircuitConfig, FilesConfig, StreamLimits};
    use crate::data::files::{FileService, FilesystemStorage};
    use crate::data::sqlite::SqliteService;
    use crate::data::streams::MemoryStreamBackend;
    use crate::data::types::{
        ConversationKind, Message, MessageKind, MessageStatus, ParticipantRole,
    };
    use crate::domain::breaker::CircuitBreaker;
    use crate::domain::events::MessageEvent;
    use crate::domain::rooms::RoomRegistry;

    struct Fixture {
        _dir: tempfile::TempDir,
        streams: Arc<StreamService>,
        gateway: Arc<MessageStoreGateway>,
        worker: Arc<FallbackWorker>,
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
        let config = PipelineConfig::default();
        let ingest = Arc::new(IngestService::new(
            Arc::clone(&streams),
            Arc::clone(&gateway),
            Arc::clone(&rooms),
            files,
            config.clone(),
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

        let worker = FallbackWorker::new(
            Arc::clone(&streams),
            Arc::clone(&gateway),
            ingest,
            config,
        );

        Fixture {
            _dir: dir,
            streams,
            gateway,
            worker,
            conversation_id: conversation.id,
        }
    }

    fn job(id: &str, conversation_id: &str) -> FallbackJob {
        FallbackJob {
            message: Message {
                id: id.to_string(),
                conversation_id: conversation_id.to_string(),
                sender_id: "alice".to_string(),
                receiver_id: Some("bob".to_string()),
                content: "parked".to_string(),
                kind: MessageKind::Text,
                attachment_id: None,
                status: MessageStatus::Sent,
                correlation_id: "corr".to_string(),
                created_at: now_millis(),
                edited_at: None,
                deleted_at: None,
            },
            correlation_id: "corr".to_string(),
            attempt: 0,
            first_seen_at: now_millis(),
        }
    }

    async fn pending_record(f: &Fixture, job: &FallbackJob) -> RawRecord {
        let consumer = f.streams.consumer_name(GROUP);
        // Establish the consumer group at the tail before appending
        f.streams
            .read_group(StreamName::FallbackMessages, GROUP, &consumer, 10, 10, true)
            .await
            .unwrap();
        f.streams
            .append(StreamName::FallbackMessages, job)
            .await
            .unwrap();
        let mut batch = f
            .streams
            .read_group(StreamName::FallbackMessages, GROUP, &consumer, 10, 200, true)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        batch.remove(0)
    }

    #[tokio::test]
    async fn test_store_recovered_persists_and_commits() {
        let f = fixture().await;
        let job = job("m1", &f.conversation_id);
        let record = pending_record(&f, &job).await;

        let metrics = WorkerMetricsHandle::for_test("fallback");
        let still_open = f.worker.process(&record, &metrics).await;
        assert!(!still_open);

        // Persisted with the original id
        assert!(f.gateway.find_message("m1").await.unwrap().is_some());

        // wal:post closed the pair and NEW_MESSAGE went out
        let posts = f
            .streams
            .range_by_time(StreamName::WalPost, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(posts.len(), 1);
        let events = f
            .streams
            .range_by_time(StreamName::EventsMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let event: MessageEvent = StreamService::decode(&events[0]).unwrap();
        assert_eq!(event.message_id(), "m1");

        assert_eq!(metrics.snapshot().processed, 1);
    }

    #[tokio::test]
    async fn test_redelivered_job_is_a_true_noop() {
        let f = fixture().await;
        let job = job("m1", &f.conversation_id);

        let metrics = WorkerMetricsHandle::for_test("fallback");
        let record = pending_record(&f, &job).await;
        f.worker.process(&record, &metrics).await;

        // The ack was lost and the claim cycle hands the job back:
        // the save dedups on the message id, so nothing is re-published
        let redelivered = pending_record(&f, &job).await;
        f.worker.process(&redelivered, &metrics).await;

        let messages = f
            .gateway
            .list_messages(&f.conversation_id, None, 50)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        let events = f
            .streams
            .range_by_time(StreamName::EventsMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_circuit_open_requeues_same_attempt() {
        let f = fixture().await;
        let job = job("m1", &f.conversation_id);
        let record = pending_record(&f, &job).await;

        // Trip the breaker
        for _ in 0..CircuitConfig::default().failure_threshold {
            f.gateway.breaker().record_failure();
        }

        let metrics = WorkerMetricsHandle::for_test("fallback");
        let still_open = f.worker.process(&record, &metrics).await;
        assert!(still_open);

        // Not persisted, re-queued with the same attempt counter
        assert!(
            f.streams
                .range_by_time(StreamName::WalPost, 0, i64::MAX)
                .await
                .unwrap()
                .is_empty()
        );
        let consumer = f.streams.consumer_name(GROUP);
        let requeued = f
            .streams
            .read_group(StreamName::FallbackMessages, GROUP, &consumer, 10, 200, true)
            .await
            .unwrap();
        assert_eq!(requeued.len(), 1);
        let next: FallbackJob = StreamService::decode(&requeued[0]).unwrap();
        assert_eq!(next.attempt, 0);
        assert_eq!(next.message.id, "m1");
    }

    #[tokio::test]
    async fn test_unrecoverable_failure_routes_to_retry() {
        let f = fixture().await;
        // FK violation: conversation does not exist
        let job = job("m1", "missing-conversation");
        let record = pending_record(&f, &job).await;

        let metrics = WorkerMetricsHandle::for_test("fallback");
        let still_open = f.worker.process(&record, &metrics).await;
        assert!(!still_open);

        let routed = f
            .streams
            .range_by_time(StreamName::RetryMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(routed.len(), 1);
        let retry: RetryJob = StreamService::decode(&routed[0]).unwrap();
        assert_eq!(retry.attempt, 1);
        assert!(matches!(retry.action, RetryAction::SaveMessage { .. }));

        // Fallback queue is clean
        assert!(
            f.streams
                .pending(StreamName::FallbackMessages, GROUP)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
