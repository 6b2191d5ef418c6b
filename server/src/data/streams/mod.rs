//! Stream manager
//!
//! Typed API over named, capped, consumer-grouped append-only streams with
//! pluggable backends:
//! - In-memory - local-only, for tests and single-process deployments
//! - Redis Streams - distributed, for production
//!
//! The named streams form a fixed registry: the write-ahead pair
//! (`wal:pre`/`wal:post`), the recovery queues (`retry:messages`,
//! `fallback:messages`, `dlq:messages`), and the event fan-out streams
//! (`events:*`). Each stream carries an approximate MAXLEN cap enforced on
//! append; the durability contract relies on consumers draining records
//! before the cap trims them.

mod backend;
mod error;
mod memory;
mod redis;

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use backend::{PendingEntry, RawRecord, StreamBackend};
pub use error::StreamError;
pub use memory::MemoryStreamBackend;
pub use redis::RedisStreamBackend;

use crate::core::config::{BackendConfig, BackendType, StreamLimits};
use crate::core::constants::{STREAM_APPEND_BASE_DELAY_MS, STREAM_APPEND_MAX_ATTEMPTS};
use crate::utils::retry::retry_with_backoff_async;

/// The fixed stream registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamName {
    WalPre,
    WalPost,
    RetryMessages,
    FallbackMessages,
    DlqMessages,
    EventsMessages,
    EventsStatus,
    EventsConversations,
    EventsFiles,
    EventsUsers,
}

impl StreamName {
    pub const ALL: [StreamName; 10] = [
        StreamName::WalPre,
        StreamName::WalPost,
        StreamName::RetryMessages,
        StreamName::FallbackMessages,
        StreamName::DlqMessages,
        StreamName::EventsMessages,
        StreamName::EventsStatus,
        StreamName::EventsConversations,
        StreamName::EventsFiles,
        StreamName::EventsUsers,
    ];

    pub const fn key(&self) -> &'static str {
        match self {
            StreamName::WalPre => "wal:pre",
            StreamName::WalPost => "wal:post",
            StreamName::RetryMessages => "retry:messages",
            StreamName::FallbackMessages => "fallback:messages",
            StreamName::DlqMessages => "dlq:messages",
            StreamName::EventsMessages => "events:messages",
            StreamName::EventsStatus => "events:status",
            StreamName::EventsConversations => "events:conversations",
            StreamName::EventsFiles => "events:files",
            StreamName::EventsUsers => "events:users",
        }
    }

    /// The MAXLEN≈ cap for this stream
    pub fn max_len(&self, limits: &StreamLimits) -> u64 {
        match self {
            StreamName::WalPre | StreamName::WalPost => limits.maxlen_wal,
            StreamName::RetryMessages | StreamName::FallbackMessages => limits.maxlen_retry,
            StreamName::DlqMessages => limits.maxlen_dlq,
            StreamName::EventsMessages
            | StreamName::EventsStatus
            | StreamName::EventsConversations
            | StreamName::EventsFiles
            | StreamName::EventsUsers => limits.maxlen_events,
        }
    }
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Central stream service: the registry plus a typed record API
pub struct StreamService {
    backend: Arc<dyn StreamBackend>,
    limits: StreamLimits,
    process_id: String,
}

impl StreamService {
    /// Create from backend configuration
    pub async fn from_config(
        backend_config: &BackendConfig,
        limits: StreamLimits,
    ) -> Result<Self, StreamError> {
        let backend: Arc<dyn StreamBackend> = match backend_config.backend {
            BackendType::Memory => Arc::new(MemoryStreamBackend::new()),
            BackendType::Redis => {
                Arc::new(RedisStreamBackend::new(backend_config.redis_url()).await?)
            }
        };

        Ok(Self::with_backend(backend, limits))
    }

    /// Create with an explicit backend (tests use the memory backend here)
    pub fn with_backend(backend: Arc<dyn StreamBackend>, limits: StreamLimits) -> Self {
        Self {
            backend,
            limits,
            process_id: std::process::id().to_string(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Consumer name for a worker: `{process_id}-{worker}`.
    /// A restarted process claims a fresh consumer slot; records pending
    /// under the old name are recovered via `claim_idle`.
    pub fn consumer_name(&self, worker: &str) -> String {
        format!("{}-{}", self.process_id, worker)
    }

    /// Encode and append a record, trimming to the stream's cap.
    ///
    /// Transient broker errors are retried inside (3 attempts, exponential
    /// backoff); on exhaustion the error surfaces as
    /// `StreamError::Unavailable`.
    pub async fn append<T: Serialize>(
        &self,
        stream: StreamName,
        record: &T,
    ) -> Result<String, StreamError> {
        let payload =
            rmp_serde::to_vec(record).map_err(|e| StreamError::Serialization(e.to_string()))?;
        let max_len = stream.max_len(&self.limits);

        retry_with_backoff_async(
            STREAM_APPEND_MAX_ATTEMPTS,
            STREAM_APPEND_BASE_DELAY_MS,
            || self.backend.append(stream.key(), &payload, max_len),
        )
        .await
        .map_err(|(e, attempts)| {
            tracing::error!(stream = %stream, attempts, error = %e, "Stream append exhausted retries");
            StreamError::Unavailable(format!("append to {stream} failed after {attempts} attempts: {e}"))
        })
    }

    /// Read a batch of new records for a consumer group.
    ///
    /// The group is created lazily at the stream tail; pass
    /// `from_beginning` to create it at the start instead, so records
    /// appended before the first consumer existed are still delivered
    /// (the pipeline consumers all do).
    pub async fn read_group(
        &self,
        stream: StreamName,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
        from_beginning: bool,
    ) -> Result<Vec<RawRecord>, StreamError> {
        self.backend
            .read_group(stream.key(), group, consumer, count, block_ms, from_beginning)
            .await
    }

    /// Decode a record payload
    pub fn decode<T: DeserializeOwned>(record: &RawRecord) -> Result<T, StreamError> {
        rmp_serde::from_slice(&record.payload)
            .map_err(|e| StreamError::Serialization(e.to_string()))
    }

    pub async fn ack(
        &self,
        stream: StreamName,
        group: &str,
        id: &str,
    ) -> Result<(), StreamError> {
        self.backend.ack(stream.key(), group, id).await
    }

    pub async fn pending(
        &self,
        stream: StreamName,
        group: &str,
    ) -> Result<Vec<PendingEntry>, StreamError> {
        self.backend.pending(stream.key(), group).await
    }

    pub async fn claim_idle(
        &self,
        stream: StreamName,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<RawRecord>, StreamError> {
        self.backend
            .claim_idle(stream.key(), group, consumer, min_idle_ms, count)
            .await
    }

    pub async fn len(&self, stream: StreamName) -> Result<u64, StreamError> {
        self.backend.len(stream.key()).await
    }

    pub async fn trim_to(&self, stream: StreamName, max_len: u64) -> Result<u64, StreamError> {
        self.backend.trim_to(stream.key(), max_len).await
    }

    pub async fn range_by_time(
        &self,
        stream: StreamName,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<RawRecord>, StreamError> {
        self.backend.range_by_time(stream.key(), from_ms, to_ms).await
    }

    /// The configured cap for a stream (for monitoring)
    pub fn cap(&self, stream: StreamName) -> u64 {
        stream.max_len(&self.limits)
    }

    pub async fn health_check(&self) -> Result<(), StreamError> {
        self.backend.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestRecord {
        id: String,
        attempt: u32,
    }

    fn memory_service() -> StreamService {
        StreamService::with_backend(Arc::new(MemoryStreamBackend::new()), StreamLimits::default())
    }

    #[test]
    fn test_registry_keys() {
        assert_eq!(StreamName::WalPre.key(), "wal:pre");
        assert_eq!(StreamName::DlqMessages.key(), "dlq:messages");
        assert_eq!(StreamName::EventsUsers.key(), "events:users");
        assert_eq!(StreamName::ALL.len(), 10);
    }

    #[test]
    fn test_registry_caps() {
        let limits = StreamLimits::default();
        assert_eq!(StreamName::WalPre.max_len(&limits), 10_000);
        assert_eq!(StreamName::WalPost.max_len(&limits), 10_000);
        assert_eq!(StreamName::RetryMessages.max_len(&limits), 5_000);
        assert_eq!(StreamName::FallbackMessages.max_len(&limits), 5_000);
        assert_eq!(StreamName::DlqMessages.max_len(&limits), 50_000);
        assert_eq!(StreamName::EventsMessages.max_len(&limits), 5_000);
    }

    #[test]
    fn test_consumer_name_includes_process() {
        let service = memory_service();
        let name = service.consumer_name("retry");
        assert!(name.ends_with("-retry"));
        assert_eq!(name, format!("{}-retry", std::process::id()));
    }

    #[tokio::test]
    async fn test_typed_append_read_roundtrip() {
        let service = memory_service();
        let record = TestRecord {
            id: "m1".to_string(),
            attempt: 0,
        };

        // First read creates the group at the stream tail
        let batch = service
            .read_group(StreamName::RetryMessages, "retry", "c1", 10, 10, false)
            .await
            .unwrap();
        assert!(batch.is_empty());

        service
            .append(StreamName::RetryMessages, &record)
            .await
            .unwrap();

        let batch = service
            .read_group(StreamName::RetryMessages, "retry", "c1", 10, 200, false)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);

        let decoded: TestRecord = StreamService::decode(&batch[0]).unwrap();
        assert_eq!(decoded, record);

        service
            .ack(StreamName::RetryMessages, "retry", &batch[0].id)
            .await
            .unwrap();
        assert!(
            service
                .pending(StreamName::RetryMessages, "retry")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_from_beginning_group_sees_history() {
        let service = memory_service();
        service
            .append(
                StreamName::EventsMessages,
                &TestRecord {
                    id: "published-before-any-consumer".to_string(),
                    attempt: 0,
                },
            )
            .await
            .unwrap();

        let batch = service
            .read_group(StreamName::EventsMessages, "dispatch", "c1", 10, 10, true)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_is_serialization_error() {
        let record = RawRecord {
            id: "1-0".to_string(),
            payload: vec![0xc1], // reserved msgpack byte, never valid
        };
        let result: Result<TestRecord, _> = StreamService::decode(&record);
        assert!(matches!(result, Err(StreamError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_len_and_trim() {
        let service = memory_service();
        for i in 0..4u32 {
            service
                .append(
                    StreamName::EventsMessages,
                    &TestRecord {
                        id: i.to_string(),
                        attempt: i,
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(service.len(StreamName::EventsMessages).await.unwrap(), 4);

        service.trim_to(StreamName::EventsMessages, 2).await.unwrap();
        assert_eq!(service.len(StreamName::EventsMessages).await.unwrap(), 2);
    }
}
