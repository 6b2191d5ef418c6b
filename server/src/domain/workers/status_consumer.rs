//! Status-stream consumer
//!
//! Drains `events:status` and fans delivery/read transitions out to the
//! other participants' sockets. Status events may overtake or lag message
//! events; recipients treat the transitions as monotone and the store
//! already discarded regressions, so fan-out here is purely notification.

use std::sync::Arc;

use tokio::sync::watch;

use super::{DeliverySink, WorkerMetricsHandle};
use crate::core::config::PipelineConfig;
use crate::core::constants::{STREAM_BLOCK_MS, WORKER_BATCH_SIZE};
use crate::data::streams::{RawRecord, StreamName, StreamService};
use crate::data::types::MessageStatus;
use crate::domain::events::StatusEvent;
use crate::domain::presence::PresenceRegistry;
use crate::domain::rooms::RoomRegistry;

const GROUP: &str = "status";

pub struct StatusStreamConsumer {
    streams: Arc<StreamService>,
    rooms: Arc<RoomRegistry>,
    presence: Arc<PresenceRegistry>,
    sink: Arc<dyn DeliverySink>,
    config: PipelineConfig,
}

impl StatusStreamConsumer {
    pub fn new(
        streams: Arc<StreamService>,
        rooms: Arc<RoomRegistry>,
        presence: Arc<PresenceRegistry>,
        sink: Arc<dyn DeliverySink>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            streams,
            rooms,
            presence,
            sink,
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

        tracing::debug!(consumer = %consumer, "StatusStreamConsumer started");

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
                        .claim_idle(StreamName::EventsStatus, GROUP, &consumer, self.config.claim_idle_ms, 100)
                        .await
                    {
                        Ok(claimed) if !claimed.is_empty() => {
                            tracing::debug!(count = claimed.len(), "Claimed stuck status events");
                            for record in claimed {
                                self.process(&record, &metrics).await;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Status claim cycle failed"),
                    }
                }
                batch = self.streams.read_group(
                    StreamName::EventsStatus,
                    GROUP,
                    &consumer,
                    WORKER_BATCH_SIZE,
                    STREAM_BLOCK_MS,
                    true,
                ) => {
                    match batch {
                        Ok(records) => {
                            for record in records {
                                self.process(&record, &metrics).await;
                            }
                        }
                        Err(e) => {
                            metrics.failed(&e);
                            tracing::warn!(error = %e, "Status read failed");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        tracing::debug!("StatusStreamConsumer shutdown complete");
    }

    async fn process(&self, record: &RawRecord, metrics: &WorkerMetricsHandle) {
        let event: StatusEvent = match StreamService::decode(record) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(record_id = %record.id, error = %e, "Undecodable status event, discarding");
                self.ack(&record.id).await;
                metrics.failed(&e);
                return;
            }
        };

        match self.dispatch(&event).await {
            Ok(()) => {
                self.ack(&record.id).await;
                metrics.processed(1);
            }
            Err(e) => {
                metrics.failed(&e);
                tracing::warn!(error = %e, "Status dispatch failed, leaving event pending");
            }
        }
    }

    async fn dispatch(&self, event: &StatusEvent) -> Result<(), String> {
        match event {
            StatusEvent::Delivered {
                message_id,
                conversation_id,
                receiver_id,
                at,
            } => {
                // The counters changed underneath any cached view
                self.rooms.invalidate(conversation_id);

                let participants = self
                    .rooms
                    .participants(conversation_id)
                    .await
                    .map_err(|e| e.to_string())?;

                for participant in participants.iter().filter(|p| *p != receiver_id) {
                    if self.presence.is_online(participant).await {
                        self.sink
                            .status_changed(participant, message_id, MessageStatus::Delivered, *at)
                            .await;
                    }
                }
            }
            StatusEvent::Read {
                conversation_id,
                reader_id,
                up_to_message_id,
                at,
            } => {
                self.rooms.invalidate(conversation_id);

                let participants = self
                    .rooms
                    .participants(conversation_id)
                    .await
                    .map_err(|e| e.to_string())?;

                for participant in participants.iter().filter(|p| *p != reader_id) {
                    if self.presence.is_online(participant).await {
                        self.sink
                            .conversation_read(
                                participant,
                                conversation_id,
                                reader_id,
                                up_to_message_id.as_deref(),
                            )
                            .await;
                        // The boundary message's own transition, so senders
                        // watching a single bubble see READ without diffing
                        // the conversation
                        if let Some(message_id) = up_to_message_id {
                            self.sink
                                .status_changed(participant, message_id, MessageStatus::Read, *at)
                                .await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn ack(&self, record_id: &str) {
        if let Err(e) = self
            .streams
            .ack(StreamName::EventsStatus, GROUP, record_id)
            .await
        {
            tracing::warn!(record_id, error = %e, "Failed to ack status event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::core::config::{CircuitConfig, StreamLimits};
    use crate::data::cache::CacheService;
    use crate::data::sqlite::SqliteService;
    use crate::data::streams::MemoryStreamBackend;
    use crate::data::types::{ConversationKind, Message, ParticipantRole};
    use crate::domain::breaker::CircuitBreaker;
    use crate::domain::gateway::MessageStoreGateway;
    use crate::utils::time::now_millis;

    #[derive(Default)]
    struct RecordingSink {
        statuses: Mutex<Vec<(String, String, MessageStatus)>>,
        reads: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        async fn new_message(&self, _recipient: &str, _message: &Message) {}
        async fn message_edited(&self, _recipient: &str, _message: &Message) {}
        async fn message_deleted(
            &self,
            _recipient: &str,
            _message_id: &str,
            _conversation_id: &str,
            _sender_id: &str,
        ) {
        }

        async fn status_changed(
            &self,
            recipient: &str,
            message_id: &str,
            status: MessageStatus,
            _at: i64,
        ) {
            self.statuses
                .lock()
                .push((recipient.to_string(), message_id.to_string(), status));
        }

        async fn conversation_read(
            &self,
            recipient: &str,
            conversation_id: &str,
            read_by: &str,
            _up_to_message_id: Option<&str>,
        ) {
            self.reads.lock().push((
                recipient.to_string(),
                conversation_id.to_string(),
                read_by.to_string(),
            ));
        }
    }

    struct Fixture {
        presence: Arc<PresenceRegistry>,
        sink: Arc<RecordingSink>,
        consumer: Arc<StatusStreamConsumer>,
        conversation_id: String,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let breaker = Arc::new(CircuitBreaker::new(CircuitConfig::default()));
        let gateway = Arc::new(MessageStoreGateway::new(store, breaker, 5_000));
        let streams = Arc::new(StreamService::with_backend(
            Arc::new(MemoryStreamBackend::new()),
            StreamLimits::default(),
        ));
        let rooms = RoomRegistry::new(Arc::clone(&gateway), Arc::clone(&streams));
        let cache = Arc::new(CacheService::in_memory(10_000));
        let presence = PresenceRegistry::new(cache, Arc::clone(&streams), 60_000);
        let sink = Arc::new(RecordingSink::default());

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

        let consumer = StatusStreamConsumer::new(
            streams,
            rooms,
            Arc::clone(&presence),
            Arc::clone(&sink) as Arc<dyn DeliverySink>,
            PipelineConfig::default(),
        );

        Fixture {
            presence,
            sink,
            consumer,
            conversation_id: conversation.id,
        }
    }

    fn record_of(event: &StatusEvent) -> RawRecord {
        RawRecord {
            id: "1-0".to_string(),
            payload: rmp_serde::to_vec(event).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_delivered_notifies_sender_not_acker() {
        let f = fixture().await;
        f.presence.register("alice", "s1").await.unwrap();
        f.presence.register("bob", "s2").await.unwrap();

        let event = StatusEvent::Delivered {
            message_id: "m1".to_string(),
            conversation_id: f.conversation_id.clone(),
            receiver_id: "bob".to_string(),
            at: now_millis(),
        };
        let metrics = WorkerMetricsHandle::for_test("status");
        f.consumer.process(&record_of(&event), &metrics).await;

        let statuses = f.sink.statuses.lock().clone();
        assert_eq!(
            statuses,
            vec![(
                "alice".to_string(),
                "m1".to_string(),
                MessageStatus::Delivered
            )]
        );
        assert_eq!(metrics.snapshot().processed, 1);
    }

    #[tokio::test]
    async fn test_read_notifies_other_participants() {
        let f = fixture().await;
        f.presence.register("alice", "s1").await.unwrap();

        let event = StatusEvent::Read {
            conversation_id: f.conversation_id.clone(),
            reader_id: "bob".to_string(),
            up_to_message_id: Some("m3".to_string()),
            at: now_millis(),
        };
        let metrics = WorkerMetricsHandle::for_test("status");
        f.consumer.process(&record_of(&event), &metrics).await;

        let reads = f.sink.reads.lock().clone();
        assert_eq!(
            reads,
            vec![(
                "alice".to_string(),
                f.conversation_id.clone(),
                "bob".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_offline_participants_get_no_push() {
        let f = fixture().await;
        // Nobody online

        let event = StatusEvent::Delivered {
            message_id: "m1".to_string(),
            conversation_id: f.conversation_id.clone(),
            receiver_id: "bob".to_string(),
            at: now_millis(),
        };
        let metrics = WorkerMetricsHandle::for_test("status");
        f.consumer.process(&record_of(&event), &metrics).await;

        assert!(f.sink.statuses.lock().is_empty());
        assert_eq!(metrics.snapshot().processed, 1);
    }
}
