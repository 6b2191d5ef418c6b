//! WAL recovery worker
//!
//! Periodically scans `wal:pre` for entries older than the WAL timeout
//! whose correlation id has no matching `wal:post` record: messages whose
//! ingest died between the pre-write log and the store commit. Each one is
//! re-persisted (idempotent by message id) and committed. This is the
//! mechanism by which in-flight messages survive a process crash.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::WorkerMetricsHandle;
use crate::core::config::PipelineConfig;
use crate::core::constants::WAL_SCAN_INTERVAL_SECS;
use crate::data::streams::{StreamName, StreamService};
use crate::domain::events::{DeadLetter, RetryAction, WalCommit, WalEntry};
use crate::domain::gateway::MessageStoreGateway;
use crate::domain::ingest::IngestService;
use crate::utils::time::now_millis;

pub struct WalRecoveryWorker {
    streams: Arc<StreamService>,
    gateway: Arc<MessageStoreGateway>,
    ingest: Arc<IngestService>,
    config: PipelineConfig,
}

impl WalRecoveryWorker {
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
        let mut interval = tokio::time::interval(Duration::from_secs(WAL_SCAN_INTERVAL_SECS));
        tracing::debug!("WalRecoveryWorker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.scan(&metrics).await;
                }
            }
        }

        tracing::debug!("WalRecoveryWorker shutdown complete");
    }

    /// One recovery pass. Public to the crate for tests and for the
    /// startup sweep the app runs before serving traffic.
    pub async fn scan(&self, metrics: &WorkerMetricsHandle) {
        metrics.touch();
        let cutoff = now_millis() - self.config.wal_timeout_ms as i64;

        let stale = match self.streams.range_by_time(StreamName::WalPre, 0, cutoff).await {
            Ok(records) => records,
            Err(e) => {
                metrics.failed(&e);
                tracing::warn!(error = %e, "WAL scan failed to read wal:pre");
                return;
            }
        };
        if stale.is_empty() {
            return;
        }

        let commits = match self
            .streams
            .range_by_time(StreamName::WalPost, 0, i64::MAX)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                metrics.failed(&e);
                tracing::warn!(error = %e, "WAL scan failed to read wal:post");
                return;
            }
        };

        let committed: HashSet<String> = commits
            .iter()
            .filter_map(|r| StreamService::decode::<WalCommit>(r).ok())
            .map(|c| c.correlation_id)
            .collect();

        let mut recovered = 0u64;
        for record in &stale {
            let entry: WalEntry = match StreamService::decode(record) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(record_id = %record.id, error = %e, "Undecodable wal:pre record");
                    continue;
                }
            };
            if committed.contains(&entry.correlation_id) {
                continue;
            }

            let age_ms = record
                .timestamp_ms()
                .map(|logged_at| now_millis() - logged_at)
                .unwrap_or_default();
            tracing::warn!(
                message_id = %entry.message.id,
                correlation_id = %entry.correlation_id,
                age_ms,
                "Recovering in-flight message from WAL"
            );

            match self.gateway.save_message(&entry.message).await {
                Ok(inserted) => {
                    // commit_effects closes the WAL pair, so the next scan
                    // skips this correlation id; `inserted` keeps a replay
                    // of an already persisted message from re-publishing
                    self.ingest
                        .commit_effects(&entry.message, Some(&record.id), inserted)
                        .await;
                    recovered += 1;
                }
                Err(e) if e.is_retryable() => {
                    // Store still down; the next scan tries again
                    tracing::debug!(message_id = %entry.message.id, error = %e, "Recovery deferred, store unavailable");
                }
                Err(e) => {
                    // The save will never succeed: dead-letter it and
                    // close the WAL pair so the scan stops replaying it
                    metrics.failed(&e);
                    self.dead_letter(&entry, &e.to_string()).await;
                }
            }
        }

        if recovered > 0 {
            metrics.processed(recovered);
            tracing::info!(recovered, "WAL recovery replayed in-flight messages");
        }
    }

    async fn dead_letter(&self, entry: &WalEntry, reason: &str) {
        let dead = DeadLetter {
            action: RetryAction::SaveMessage {
                message: entry.message.clone(),
                correlation_id: entry.correlation_id.clone(),
            },
            attempts: 1,
            first_seen_at: entry.first_seen_at,
            dead_at: now_millis(),
            reason: reason.to_string(),
            correlation_id: entry.correlation_id.clone(),
        };
        if let Err(e) = self.streams.append(StreamName::DlqMessages, &dead).await {
            tracing::error!(error = %e, "Failed to dead-letter WAL entry");
            return;
        }

        // Close the pair: this correlation id is resolved (badly)
        let commit = WalCommit {
            message_id: entry.message.id.clone(),
            correlation_id: entry.correlation_id.clone(),
            pre_stream_id: None,
            persisted_at: now_millis(),
        };
        if let Err(e) = self.streams.append(StreamName::WalPost, &commit).await {
            tracing::error!(error = %e, "Failed to close WAL pair for dead-lettered entry");
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
        worker: Arc<WalRecoveryWorker>,
        conversation_id: String,
    }

    async fn fixture(wal_timeout_ms: u64) -> Fixture {
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
            wal_timeout_ms,
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

        let worker = WalRecoveryWorker::new(
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

    fn wal_entry(id: &str, conversation_id: &str, correlation: &str) -> WalEntry {
        WalEntry {
            message: Message {
                id: id.to_string(),
                conversation_id: conversation_id.to_string(),
                sender_id: "alice".to_string(),
                receiver_id: Some("bob".to_string()),
                content: "in flight".to_string(),
                kind: MessageKind::Text,
                attachment_id: None,
                status: MessageStatus::Sent,
                correlation_id: correlation.to_string(),
                created_at: now_millis(),
                edited_at: None,
                deleted_at: None,
            },
            correlation_id: correlation.to_string(),
            first_seen_at: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_orphaned_entry_is_recovered_exactly_once() {
        // wal_timeout 0: every pre entry is immediately stale
        let f = fixture(0).await;
        let entry = wal_entry("m1", &f.conversation_id, "corr-1");
        f.streams.append(StreamName::WalPre, &entry).await.unwrap();

        let metrics = WorkerMetricsHandle::for_test("wal");
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.worker.scan(&metrics).await;

        // Persisted and committed
        assert!(f.gateway.find_message("m1").await.unwrap().is_some());
        let events = f
            .streams
            .range_by_time(StreamName::EventsMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let event: MessageEvent = StreamService::decode(&events[0]).unwrap();
        assert_eq!(event.message_id(), "m1");
        assert_eq!(metrics.snapshot().processed, 1);

        // A second scan finds the pair closed and does nothing more
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.worker.scan(&metrics).await;
        let events = f
            .streams
            .range_by_time(StreamName::EventsMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(metrics.snapshot().processed, 1);
    }

    #[tokio::test]
    async fn test_committed_entry_is_left_alone() {
        let f = fixture(0).await;
        let entry = wal_entry("m1", &f.conversation_id, "corr-1");
        f.streams.append(StreamName::WalPre, &entry).await.unwrap();
        f.streams
            .append(
                StreamName::WalPost,
                &WalCommit {
                    message_id: "m1".to_string(),
                    correlation_id: "corr-1".to_string(),
                    pre_stream_id: None,
                    persisted_at: now_millis(),
                },
            )
            .await
            .unwrap();

        let metrics = WorkerMetricsHandle::for_test("wal");
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.worker.scan(&metrics).await;

        // Nothing replayed
        assert!(f.gateway.find_message("m1").await.unwrap().is_none());
        assert_eq!(metrics.snapshot().processed, 0);
    }

    #[tokio::test]
    async fn test_fresh_entries_wait_for_timeout() {
        let f = fixture(60_000).await;
        let entry = wal_entry("m1", &f.conversation_id, "corr-1");
        f.streams.append(StreamName::WalPre, &entry).await.unwrap();

        let metrics = WorkerMetricsHandle::for_test("wal");
        f.worker.scan(&metrics).await;

        // Still inside the WAL timeout: the ingest path may yet commit
        assert!(f.gateway.find_message("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unrecoverable_entry_is_dead_lettered_and_closed() {
        let f = fixture(0).await;
        let entry = wal_entry("m1", "missing-conversation", "corr-1");
        f.streams.append(StreamName::WalPre, &entry).await.unwrap();

        let metrics = WorkerMetricsHandle::for_test("wal");
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.worker.scan(&metrics).await;

        let dead = f
            .streams
            .range_by_time(StreamName::DlqMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);

        // The pair is closed: the next scan does not replay
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.worker.scan(&metrics).await;
        let dead = f
            .streams
            .range_by_time(StreamName::DlqMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
    }

    #[tokio::test]
    async fn test_replay_after_partial_commit_is_idempotent() {
        let f = fixture(0).await;
        let entry = wal_entry("m1", &f.conversation_id, "corr-1");

        // The save happened but the process died before wal:post
        f.gateway.save_message(&entry.message).await.unwrap();
        f.streams.append(StreamName::WalPre, &entry).await.unwrap();

        let metrics = WorkerMetricsHandle::for_test("wal");
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.worker.scan(&metrics).await;

        // No duplicate row; the pair is now closed
        let messages = f
            .gateway
            .list_messages(&f.conversation_id, None, 50)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        let posts = f
            .streams
            .range_by_time(StreamName::WalPost, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(posts.len(), 1);

        // The save was a replay: no NEW event is published for it
        // (recipients reconcile via backfill), and unread is untouched
        let events = f
            .streams
            .range_by_time(StreamName::EventsMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert!(events.is_empty());
        let bob = f
            .gateway
            .get_participant(&f.conversation_id, "bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob.unread_count, 0);
    }

    #[tokio::test]
    async fn test_replay_after_published_commit_publishes_no_duplicate() {
        let f = fixture(0).await;
        let entry = wal_entry("m1", &f.conversation_id, "corr-1");

        // A full first commit ran (save + NEW event) but the wal:post
        // append itself failed, leaving the pair open for the scan
        f.gateway.save_message(&entry.message).await.unwrap();
        f.streams
            .append(
                StreamName::EventsMessages,
                &MessageEvent::New {
                    message: entry.message.clone(),
                },
            )
            .await
            .unwrap();
        f.streams.append(StreamName::WalPre, &entry).await.unwrap();

        let metrics = WorkerMetricsHandle::for_test("wal");
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.worker.scan(&metrics).await;

        // The NEW-event count stays at 1 across the replay
        let events = f
            .streams
            .range_by_time(StreamName::EventsMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let posts = f
            .streams
            .range_by_time(StreamName::WalPost, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(posts.len(), 1);

        // Another scan finds the pair closed and republishes nothing
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.worker.scan(&metrics).await;
        let events = f
            .streams
            .range_by_time(StreamName::EventsMessages, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }
}
