//! Long-running cooperative workers
//!
//! Each worker is one task draining a named stream (or sampling on an
//! interval), supervised by the `Supervisor`: restart with backoff on
//! unexpected exit, per-worker metrics, cancellation via the shutdown
//! channel. Consumers ack records only after processing; records left
//! pending by a crashed process are recovered through the claim cycle
//! every worker runs on its own stream/group.

mod dlq;
mod fallback;
mod message_consumer;
mod monitor;
mod retry;
mod status_consumer;
mod supervisor;
mod wal_recovery;

pub use dlq::DlqMonitor;
pub use fallback::FallbackWorker;
pub use message_consumer::MessageStreamConsumer;
pub use monitor::{MemoryMonitor, StreamMonitor};
pub use retry::RetryWorker;
pub use status_consumer::StatusStreamConsumer;
pub use supervisor::{Supervisor, WorkerMetrics, WorkerMetricsHandle};
pub use wal_recovery::WalRecoveryWorker;

use async_trait::async_trait;

use crate::data::types::{Message, MessageStatus};

/// Where the stream consumers push server→client events.
///
/// Implemented by the socket hub; tests substitute a recording sink.
/// Deliveries are fire-and-forget: a failed push to a closed socket is not
/// re-appended: the recipient reconciles via reconnect backfill.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn new_message(&self, recipient: &str, message: &Message);

    async fn message_edited(&self, recipient: &str, message: &Message);

    async fn message_deleted(
        &self,
        recipient: &str,
        message_id: &str,
        conversation_id: &str,
        sender_id: &str,
    );

    async fn status_changed(
        &self,
        recipient: &str,
        message_id: &str,
        status: MessageStatus,
        at: i64,
    );

    async fn conversation_read(
        &self,
        recipient: &str,
        conversation_id: &str,
        read_by: &str,
        up_to_message_id: Option<&str>,
    );
}
