//! Message-stream consumer
//!
//! Drains `events:messages` (consumer group `dispatch`) and fans each
//! event out to the live sockets of every recipient. Recipients that are
//! offline get nothing pushed: they reconcile through the backfill query
//! on reconnect. Per-endpoint delivery failures are likewise not
//! re-appended. Unread counters are maintained here, on the consumer
//! side, so a message accepted through the fallback path still counts;
//! they are recomputed from the store rather than incremented, because
//! this group is at-least-once and redelivery must not drift them.

use std::sync::Arc;

use tokio::sync::watch;

use super::{DeliverySink, WorkerMetricsHandle};
use crate::core::config::PipelineConfig;
use crate::core::constants::{STREAM_BLOCK_MS, WORKER_BATCH_SIZE};
use crate::data::streams::{RawRecord, StreamName, StreamService};
use crate::domain::events::MessageEvent;
use crate::domain::gateway::MessageStoreGateway;
use crate::domain::presence::PresenceRegistry;
use crate::domain::rooms::RoomRegistry;

const GROUP: &str = "dispatch";

pub struct MessageStreamConsumer {
    streams: Arc<StreamService>,
    rooms: Arc<RoomRegistry>,
    presence: Arc<PresenceRegistry>,
    gateway: Arc<MessageStoreGateway>,
    sink: Arc<dyn DeliverySink>,
    config: PipelineConfig,
}

impl MessageStreamConsumer {
    pub fn new(
        streams: Arc<StreamService>,
        rooms: Arc<RoomRegistry>,
        presence: Arc<PresenceRegistry>,
        gateway: Arc<MessageStoreGateway>,
        sink: Arc<dyn DeliverySink>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            streams,
            rooms,
            presence,
            gateway,
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

        tracing::debug!(consumer = %consumer, "MessageStreamConsumer started");

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
                        .claim_idle(StreamName::EventsMessages, GROUP, &consumer, self.config.claim_idle_ms, 100)
                        .await
                    {
                        Ok(claimed) if !claimed.is_empty() => {
                            tracing::debug!(count = claimed.len(), "Claimed stuck message events");
                            for record in claimed {
                                self.process(&record, &metrics).await;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Dispatch claim cycle failed"),
                    }
                }
                batch = self.streams.read_group(
                    StreamName::EventsMessages,
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
                            tracing::warn!(error = %e, "Dispatch read failed");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        tracing::debug!("MessageStreamConsumer shutdown complete");
    }

    async fn process(&self, record: &RawRecord, metrics: &WorkerMetricsHandle) {
        let event: MessageEvent = match StreamService::decode(record) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(record_id = %record.id, error = %e, "Undecodable message event, discarding");
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
                // No ack: the record stays pending and comes back through
                // the claim cycle once the store recovers
                metrics.failed(&e);
                tracing::warn!(
                    message_id = event.message_id(),
                    error = %e,
                    "Dispatch failed, leaving event pending"
                );
            }
        }
    }

    async fn dispatch(&self, event: &MessageEvent) -> Result<(), String> {
        let participants = self
            .rooms
            .participants(event.conversation_id())
            .await
            .map_err(|e| e.to_string())?;

        match event {
            MessageEvent::New { message } => {
                // Unread counters are consumer-side so fallback-path
                // messages count the same as synchronous ones. The
                // counters are recomputed from the store, not incremented:
                // this group is at-least-once and a claimed redelivery of
                // the same event must not drift them.
                self.gateway
                    .recompute_unread(&message.conversation_id)
                    .await
                    .map_err(|e| e.to_string())?;

                for recipient in participants.iter().filter(|p| **p != message.sender_id) {
                    if self.presence.is_online(recipient).await {
                        self.sink.new_message(recipient, message).await;
                    }
                    // Offline: no push; reconnect backfill covers it
                }
            }
            MessageEvent::Edited { message } => {
                for recipient in participants.iter().filter(|p| **p != message.sender_id) {
                    if self.presence.is_online(recipient).await {
                        self.sink.message_edited(recipient, message).await;
                    }
                }
            }
            MessageEvent::Deleted {
                message_id,
                conversation_id,
                sender_id,
            } => {
                // The deleted message drops out of everyone's unread set
                self.gateway
                    .recompute_unread(conversation_id)
                    .await
                    .map_err(|e| e.to_string())?;

                for recipient in participants.iter().filter(|p| *p != sender_id) {
                    if self.presence.is_online(recipient).await {
                        self.sink
                            .message_deleted(recipient, message_id, conversation_id, sender_id)
                            .await;
                    }
                }
            }
        }

        Ok(())
    }

    async fn ack(&self, record_id: &str) {
        if let Err(e) = self
            .streams
            .ack(StreamName::EventsMessages, GROUP, record_id)
            .await
        {
            tracing::warn!(record_id, error = %e, "Failed to ack message event");
        }
    }
}
