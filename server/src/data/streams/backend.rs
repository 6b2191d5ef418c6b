//! Stream backend trait definition
//!
//! Defines the interface over named, capped, consumer-grouped append-only
//! streams. Two implementations exist:
//! - Redis Streams (production, multi-process)
//! - In-memory (tests and single-process deployments)

use async_trait::async_trait;

use super::error::StreamError;

/// A record read from a stream, with its broker-assigned id
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Time-ordered stream id (`{millis}-{seq}`)
    pub id: String,
    /// Encoded payload
    pub payload: Vec<u8>,
}

impl RawRecord {
    /// Millisecond component of the stream id
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.id.split('-').next()?.parse().ok()
    }
}

/// A record sitting in a consumer group's pending list
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Stream backend trait
///
/// Records delivered through `read_group` must be `ack`ed; unacked records
/// stay in the group's pending list and become claimable via `claim_idle`
/// once idle long enough.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Append a payload, trimming the stream to `max_len` (approximate).
    /// Never blocks on consumers. Returns the assigned stream id.
    async fn append(&self, stream: &str, payload: &[u8], max_len: u64)
    -> Result<String, StreamError>;

    /// Read up to `count` new records for a consumer group, blocking up to
    /// `block_ms` when the stream is empty. The group is created lazily at
    /// the stream tail, or at the beginning when `from_beginning` is set.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
        from_beginning: bool,
    ) -> Result<Vec<RawRecord>, StreamError>;

    /// Acknowledge a record, removing it from the pending list
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError>;

    /// List the group's pending records
    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, StreamError>;

    /// Claim pending records idle for at least `min_idle_ms`, reassigning
    /// them to `consumer`. Used to recover records from crashed consumers.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<RawRecord>, StreamError>;

    /// Current stream length
    async fn len(&self, stream: &str) -> Result<u64, StreamError>;

    /// Trim the stream to at most `max_len` entries (approximate).
    /// Returns the number of entries removed.
    async fn trim_to(&self, stream: &str, max_len: u64) -> Result<u64, StreamError>;

    /// Records whose id timestamp falls within `[from_ms, to_ms]`
    async fn range_by_time(
        &self,
        stream: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<RawRecord>, StreamError>;

    /// Health check (validates connection)
    async fn health_check(&self) -> Result<(), StreamError>;

    /// Backend name for debugging/logging
    fn backend_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_record_timestamp() {
        let record = RawRecord {
            id: "1700000000123-4".to_string(),
            payload: vec![],
        };
        assert_eq!(record.timestamp_ms(), Some(1_700_000_000_123));
    }

    #[test]
    fn test_raw_record_timestamp_malformed() {
        let record = RawRecord {
            id: "garbage".to_string(),
            payload: vec![],
        };
        assert_eq!(record.timestamp_ms(), None);
    }
}
