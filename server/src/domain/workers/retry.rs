//! Retry worker
//!
//! Drains `retry:messages`. Each record carries a `RetryAction` and an
//! attempt counter; failures re-append with `attempt + 1` and an
//! exponential delay (`min(2^attempt · 500 ms, 30 s)`), and records that
//! exhaust `MAX_RETRY_ATTEMPTS` move to `dlq:messages`. The original
//! record is always acked once its fate is decided.

use std::sync::Arc;

use tokio::sync::watch;

use super::WorkerMetricsHandle;
use crate::core::config::PipelineConfig;
use crate::core::constants::{
    RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS, STREAM_BLOCK_MS, WORKER_BATCH_SIZE,
};
use crate::data::streams::{RawRecord, StreamName, StreamService};
use crate::domain::events::{DeadLetter, RetryAction, RetryJob};
use crate::domain::gateway::MessageStoreGateway;
use crate::domain::ingest::IngestService;
use crate::utils::retry::backoff_delay;
use crate::utils::time::now_millis;

const GROUP: &str = "retry";

pub struct RetryWorker {
    streams: Arc<StreamService>,
    gateway: Arc<MessageStoreGateway>,
    ingest: Arc<IngestService>,
    config: PipelineConfig,
}

impl RetryWorker {
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

        tracing::debug!(consumer = %consumer, "RetryWorker started");

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
                        .claim_idle(StreamName::RetryMessages, GROUP, &consumer, self.config.claim_idle_ms, 100)
                        .await
                    {
                        Ok(claimed) if !claimed.is_empty() => {
                            tracing::debug!(count = claimed.len(), "Claimed stuck retry records");
                            for record in claimed {
                                self.process(&record, &metrics, &mut shutdown_rx).await;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Retry claim cycle failed"),
                    }
                }
                batch = self.streams.read_group(
                    StreamName::RetryMessages,
                    GROUP,
                    &consumer,
                    WORKER_BATCH_SIZE,
                    STREAM_BLOCK_MS,
                    true,
                ) => {
                    match batch {
                        Ok(records) => {
                            for record in records {
                                self.process(&record, &metrics, &mut shutdown_rx).await;
                            }
                        }
                        Err(e) => {
                            metrics.failed(&e);
                            tracing::warn!(error = %e, "Retry read failed");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        tracing::debug!("RetryWorker shutdown complete");
    }

    async fn process(
        &self,
        record: &RawRecord,
        metrics: &WorkerMetricsHandle,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let job: RetryJob = match StreamService::decode(record) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(record_id = %record.id, error = %e, "Undecodable retry record, discarding");
                self.ack(&record.id).await;
                metrics.failed(&e);
                return;
            }
        };

        // Honor the backoff deadline; stay cancellable while waiting
        let wait_ms = job.not_before.saturating_sub(now_millis());
        if wait_ms > 0 {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    // Leave the record pending; the claim cycle picks it up
                    return;
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(wait_ms as u64)) => {}
            }
        }

        match self.execute(&job.action).await {
            Ok(()) => {
                self.ack(&record.id).await;
                metrics.processed(1);
            }
            Err(reason) => {
                if job.attempt < self.config.max_retry_attempts {
                    let next = RetryJob {
                        attempt: job.attempt + 1,
                        not_before: now_millis()
                            + backoff_delay(job.attempt, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS)
                                .as_millis() as i64,
                        ..job
                    };
                    tracing::warn!(
                        entity = next.action.entity_id(),
                        attempt = next.attempt,
                        reason = %reason,
                        "Retry failed, re-queueing"
                    );
                    if let Err(e) = self.streams.append(StreamName::RetryMessages, &next).await {
                        tracing::error!(error = %e, "Failed to re-queue retry job, leaving pending");
                        return; // no ack: redelivered via claim
                    }
                } else {
                    let dead = DeadLetter {
                        action: job.action,
                        attempts: job.attempt,
                        first_seen_at: job.first_seen_at,
                        dead_at: now_millis(),
                        reason: reason.clone(),
                        correlation_id: job.correlation_id,
                    };
                    tracing::error!(
                        entity = dead.action.entity_id(),
                        attempts = dead.attempts,
                        reason = %reason,
                        "Retries exhausted, dead-lettering"
                    );
                    if let Err(e) = self.streams.append(StreamName::DlqMessages, &dead).await {
                        tracing::error!(error = %e, "Failed to dead-letter record, leaving pending");
                        return;
                    }
                }
                self.ack(&record.id).await;
                metrics.failed(&reason);
            }
        }
    }

    /// Re-attempt one action. The error string becomes the retry/DLQ reason.
    async fn execute(&self, action: &RetryAction) -> Result<(), String> {
        match action {
            RetryAction::SaveMessage { message, .. } => {
                let inserted = self
                    .gateway
                    .save_message(message)
                    .await
                    .map_err(|e| e.to_string())?;
                self.ingest.commit_effects(message, None, inserted).await;
                Ok(())
            }
            RetryAction::PublishMessageEvent { event } => self
                .streams
                .append(StreamName::EventsMessages, event)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            RetryAction::PublishStatusEvent { event } => self
                .streams
                .append(StreamName::EventsStatus, event)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
        }
    }

    async fn ack(&self, record_id: &str) {
        if let Err(e) = self
            .streams
            .ack(StreamName::RetryMessages, GROUP, record_id)
            .await
        {
            tracing::warn!(record_id, error = %e, "Failed to ack retry record");
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
    use crate::domain::rooms::RoomRegistry;

    struct Fixture {
        _dir: tempfile::TempDir,
        streams: Arc<StreamService>,
        gateway: Arc<MessageStoreGateway>,
        worker: Arc<RetryWorker>,
        conversation_id: String,
    }

    async fn fixture(max_retry_attempts: u32) -> Fixture {
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
        let config = PipelineConfig {
            max_retry_attempts,
            ..PipelineConfig::default()
        };
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

        let worker = RetryWorker::new(
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

    fn message(id: &str, conversation_id: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: "alice".to_string(),
            receiver_id: None,
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

    fn record(payload: &impl serde::Serialize) -> RawRecord {
        RawRecord {
            id: "1-0".to_string(),
            payload: rmp_serde::to_vec(payload).unwrap(),
        }
    }

    async fn seed_pending_record(f: &Fixture, job: &RetryJob) -> RawRecord {
        let consumer = f.streams.consumer_name(GROUP);
        // Establish the consumer group at the tail before appending
        f.streams
            .read_group(StreamName::RetryMessages, GROUP, &consumer, 10, 10, true)
            .await
            .unwrap();
        f.streams
            .append(StreamName::RetryMessages, job)
            .await
            .unwrap();
        let mut batch = f
            .streams
            .read_group(StreamName::RetryMessages, GROUP, &consumer, 10, 200, true)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        batch.remove(0)
    }

    #[tokio::test]
    async fn test_successful_save_action_commits_and_publishes() {
        let f = fixture(5).await;
        let msg = message("m1", &f.conversation_id);
        let job = RetryJob {
            action: RetryAction::SaveMessage {
                message: msg.clone(),
                correlation_id: "corr".to_string(),
            },
            attempt: 1,
            first_seen_at: now_millis(),
            correlation_id: "corr".to_string(),
            not_before: 0,
        };
        let record = seed_pending_record(&f, &job).await;

        let metrics = WorkerMetricsHandle::for_test("retry");
        let (_tx, mut rx) = watch::channel(false);
        f.worker.process(&record, &metrics, &mut rx).await;

        // Saved and committed
        assert!(f.gateway.find_message("m1").await.unwrap().is_some());
        let posts = f
            .streams
            .range_by_time(StreamName::WalPost, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(metrics.snapshot().processed, 1);

        // Acked
        assert!(f
            .streams
            .pending(StreamName::RetryMessages, GROUP)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_action_requeues_with_backoff() {
        let f = fixture(5).await;
        // Message referencing a missing conversation: FK failure is
        // unrecoverable at the store but the job still follows the
        // attempt/backoff path
        let msg = message("m1", "missing-conversation");
        let job = RetryJob {
            action: RetryAction::SaveMessage {
                message: msg,
                correlation_id: "corr".to_string(),
            },
            attempt: 1,
            first_seen_at: now_millis(),
            correlation_id: "corr".to_string(),
            not_before: 0,
        };
        let record = seed_pending_record(&f, &job).await;

        let metrics = WorkerMetricsHandle::for_test("retry");
        let (_tx, mut rx) = watch::channel(false);
        f.worker.process(&record, &metrics, &mut rx).await;

        // Re-queued with attempt + 1 and a future not_before
        let consumer = f.streams.consumer_name(GROUP);
        let requeued = f
            .streams
            .read_group(StreamName::RetryMessages, GROUP, &consumer, 10, 200, true)
            .await
            .unwrap();
        assert_eq!(requeued.len(), 1);
        let next: RetryJob = StreamService::decode(&requeued[0]).unwrap();
        assert_eq!(next.attempt, 2);
        assert!(next.not_before > now_millis() - 100);
        assert_eq!(metrics.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_dead_letter() {
        let f = fixture(2).await;
        let msg = message("m1", "missing-conversation");
        let job = RetryJob {
            action: RetryAction::SaveMessage {
                message: msg,
                correlation_id: "corr".to_string(),
            },
            attempt: 2, // already at the cap
            first_seen_at: 1_000,
            correlation_id: "corr".to_string(),
            not_before: 0,
        };
        let record = seed_pending_record(&f, &job).await;

        let metrics = WorkerMetricsHandle::for_test("retry");
        let (_tx, mut rx) = watch::channel(false);
        f.worker.process(&record, &metrics, &mut rx).await;

        let dead = f
            .streams
            .range_by_time(StreamName::DlqMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        let letter: DeadLetter = StreamService::decode(&dead[0]).unwrap();
        assert_eq!(letter.attempts, 2);
        assert_eq!(letter.first_seen_at, 1_000);

        // No further retries queued
        let consumer = f.streams.consumer_name(GROUP);
        assert!(f
            .streams
            .read_group(StreamName::RetryMessages, GROUP, &consumer, 10, 50, true)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_record_is_discarded() {
        let f = fixture(5).await;
        let record = RawRecord {
            id: "1-0".to_string(),
            payload: vec![0xc1],
        };

        let metrics = WorkerMetricsHandle::for_test("retry");
        let (_tx, mut rx) = watch::channel(false);
        f.worker.process(&record, &metrics, &mut rx).await;
        assert_eq!(metrics.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_publish_action_republishes_event() {
        let f = fixture(5).await;
        let msg = message("m1", &f.conversation_id);
        let job = RetryJob {
            action: RetryAction::PublishMessageEvent {
                event: crate::domain::events::MessageEvent::New { message: msg },
            },
            attempt: 1,
            first_seen_at: now_millis(),
            correlation_id: "corr".to_string(),
            not_before: 0,
        };
        let record = record(&job);

        let metrics = WorkerMetricsHandle::for_test("retry");
        let (_tx, mut rx) = watch::channel(false);
        f.worker.process(&record, &metrics, &mut rx).await;

        let events = f
            .streams
            .range_by_time(StreamName::EventsMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }
}
