//! In-memory stream backend
//!
//! Simulated consumer groups over VecDeques with pending tracking. Suitable
//! for tests and single-process deployments:
//! - process crash = all records lost (no persistence)
//! - no cross-process coordination
//!
//! For production durability and multi-machine deployments, use the Redis
//! backend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;

use super::backend::{PendingEntry, RawRecord, StreamBackend};
use super::error::StreamError;

/// Poll slice while blocked waiting for new records
const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Record id as (millis, sequence), matching the Redis `{ms}-{seq}` format
type EntryId = (i64, u64);

fn format_id(id: EntryId) -> String {
    format!("{}-{}", id.0, id.1)
}

fn parse_id(id: &str) -> Result<EntryId, StreamError> {
    let mut parts = id.splitn(2, '-');
    let ms = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| StreamError::Stream(format!("invalid record id: {id}")))?;
    let seq = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| StreamError::Stream(format!("invalid record id: {id}")))?;
    Ok((ms, seq))
}

#[derive(Clone)]
struct StreamEntry {
    id: EntryId,
    payload: Vec<u8>,
}

struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct ConsumerGroup {
    /// Highest id handed out to any consumer in this group
    last_delivered: EntryId,
    pending: HashMap<EntryId, PendingState>,
}

#[derive(Default)]
struct StreamState {
    entries: VecDeque<StreamEntry>,
    groups: HashMap<String, ConsumerGroup>,
    last_id: EntryId,
}

impl StreamState {
    fn next_id(&mut self, now_ms: i64) -> EntryId {
        let id = if now_ms <= self.last_id.0 {
            (self.last_id.0, self.last_id.1 + 1)
        } else {
            (now_ms, 0)
        };
        self.last_id = id;
        id
    }

    fn trim(&mut self, max_len: u64) -> u64 {
        let mut removed = 0;
        while self.entries.len() as u64 > max_len {
            if let Some(entry) = self.entries.pop_front() {
                for group in self.groups.values_mut() {
                    group.pending.remove(&entry.id);
                }
                removed += 1;
            }
        }
        removed
    }
}

struct SharedState {
    streams: RwLock<HashMap<String, StreamState>>,
    notifiers: RwLock<HashMap<String, Arc<Notify>>>,
}

/// In-memory stream backend
pub struct MemoryStreamBackend {
    state: Arc<SharedState>,
}

impl Default for MemoryStreamBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStreamBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SharedState {
                streams: RwLock::new(HashMap::new()),
                notifiers: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn notifier(&self, stream: &str) -> Arc<Notify> {
        {
            let notifiers = self.state.notifiers.read();
            if let Some(n) = notifiers.get(stream) {
                return Arc::clone(n);
            }
        }
        let mut notifiers = self.state.notifiers.write();
        if let Some(n) = notifiers.get(stream) {
            return Arc::clone(n);
        }
        let n = Arc::new(Notify::new());
        notifiers.insert(stream.to_string(), Arc::clone(&n));
        n
    }

    /// Take up to `count` undelivered records for a group, marking them pending
    fn take_batch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        from_beginning: bool,
    ) -> Vec<RawRecord> {
        let mut streams = self.state.streams.write();
        let state = streams.entry(stream.to_string()).or_default();

        // Lazy group creation: tail unless FROM_BEGINNING was requested
        let tail = state.last_id;
        let cg = state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| ConsumerGroup {
                last_delivered: if from_beginning { (0, 0) } else { tail },
                pending: HashMap::new(),
            });

        let mut batch = Vec::new();
        for entry in &state.entries {
            if batch.len() >= count {
                break;
            }
            if entry.id > cg.last_delivered {
                cg.pending.insert(
                    entry.id,
                    PendingState {
                        consumer: consumer.to_string(),
                        delivered_at: Instant::now(),
                        delivery_count: 1,
                    },
                );
                cg.last_delivered = entry.id;
                batch.push(RawRecord {
                    id: format_id(entry.id),
                    payload: entry.payload.clone(),
                });
            }
        }
        batch
    }
}

#[async_trait]
impl StreamBackend for MemoryStreamBackend {
    async fn append(
        &self,
        stream: &str,
        payload: &[u8],
        max_len: u64,
    ) -> Result<String, StreamError> {
        let id = {
            let mut streams = self.state.streams.write();
            let state = streams.entry(stream.to_string()).or_default();

            let id = state.next_id(chrono::Utc::now().timestamp_millis());
            state.entries.push_back(StreamEntry {
                id,
                payload: payload.to_vec(),
            });
            state.trim(max_len);
            id
        };

        self.notifier(stream).notify_one();
        Ok(format_id(id))
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
        from_beginning: bool,
    ) -> Result<Vec<RawRecord>, StreamError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        let notifier = self.notifier(stream);

        loop {
            let batch = self.take_batch(stream, group, consumer, count, from_beginning);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(vec![]);
            }
            let slice = BLOCK_POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = notifier.notified() => {}
                _ = tokio::time::sleep(slice) => {}
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let id = parse_id(id)?;

        let mut streams = self.state.streams.write();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::Stream(format!("stream not found: {stream}")))?;

        let cg = state.groups.get_mut(group).ok_or_else(|| {
            StreamError::ConsumerGroup(format!("consumer group not found: {group}"))
        })?;

        cg.pending.remove(&id);
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, StreamError> {
        let streams = self.state.streams.read();
        let Some(state) = streams.get(stream) else {
            return Ok(vec![]);
        };
        let Some(cg) = state.groups.get(group) else {
            return Ok(vec![]);
        };

        let now = Instant::now();
        let mut entries: Vec<PendingEntry> = cg
            .pending
            .iter()
            .map(|(id, p)| PendingEntry {
                id: format_id(*id),
                consumer: p.consumer.clone(),
                idle_ms: now.duration_since(p.delivered_at).as_millis() as u64,
                delivery_count: p.delivery_count,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<RawRecord>, StreamError> {
        let mut streams = self.state.streams.write();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(vec![]);
        };

        // Split borrows: collect idle ids first, then look up payloads
        let idle_ids: Vec<EntryId> = match state.groups.get(group) {
            Some(cg) => {
                let now = Instant::now();
                let min_idle = Duration::from_millis(min_idle_ms);
                let mut ids: Vec<EntryId> = cg
                    .pending
                    .iter()
                    .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
                    .map(|(&id, _)| id)
                    .collect();
                ids.sort();
                ids.truncate(count);
                ids
            }
            None => return Ok(vec![]),
        };

        let mut claimed = Vec::new();
        for id in idle_ids {
            let payload = state
                .entries
                .iter()
                .find(|e| e.id == id)
                .map(|e| e.payload.clone());
            if let Some(payload) = payload {
                if let Some(cg) = state.groups.get_mut(group)
                    && let Some(p) = cg.pending.get_mut(&id)
                {
                    p.consumer = consumer.to_string();
                    p.delivered_at = Instant::now();
                    p.delivery_count += 1;
                }
                claimed.push(RawRecord {
                    id: format_id(id),
                    payload,
                });
            }
        }

        Ok(claimed)
    }

    async fn len(&self, stream: &str) -> Result<u64, StreamError> {
        let streams = self.state.streams.read();
        Ok(streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn trim_to(&self, stream: &str, max_len: u64) -> Result<u64, StreamError> {
        let mut streams = self.state.streams.write();
        Ok(streams
            .get_mut(stream)
            .map(|s| s.trim(max_len))
            .unwrap_or(0))
    }

    async fn range_by_time(
        &self,
        stream: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<RawRecord>, StreamError> {
        let streams = self.state.streams.read();
        let Some(state) = streams.get(stream) else {
            return Ok(vec![]);
        };

        Ok(state
            .entries
            .iter()
            .filter(|e| e.id.0 >= from_ms && e.id.0 <= to_ms)
            .map(|e| RawRecord {
                id: format_id(e.id),
                payload: e.payload.clone(),
            })
            .collect())
    }

    async fn health_check(&self) -> Result<(), StreamError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
