//! In-memory cache backend
//!
//! moka (TinyLFU) for values with lazy per-entry TTL checks, dashmap for
//! the atomic counters used by rate limiting.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;

use super::backend::CacheBackend;
use super::error::CacheError;

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

struct Counter {
    value: i64,
    expires_at: Option<Instant>,
}

/// In-memory cache backend
pub struct InMemoryCache {
    entries: Cache<String, Entry>,
    counters: DashMap<String, Counter>,
}

impl InMemoryCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(max_entries).build(),
            counters: DashMap::new(),
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self.entries.get(key).await {
            Some(entry) if entry.is_expired() => {
                self.entries.invalidate(key).await;
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let entry = Entry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let existed = self.entries.get(key).await.is_some_and(|e| !e.is_expired());
        self.entries.invalidate(key).await;
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, CacheError> {
        let now = Instant::now();
        let mut counter = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: None,
        });

        if counter.expires_at.is_some_and(|at| now >= at) {
            counter.value = 0;
            counter.expires_at = None;
        }

        counter.value += 1;
        if counter.value == 1 {
            counter.expires_at = ttl.map(|t| now + t);
        }
        Ok(counter.value)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        if let Some(counter) = self.counters.get(key)
            && let Some(at) = counter.expires_at
        {
            return Ok(at.checked_duration_since(Instant::now()));
        }
        if let Some(entry) = self.entries.get(key).await
            && let Some(at) = entry.expires_at
        {
            return Ok(at.checked_duration_since(Instant::now()));
        }
        Ok(None)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut deleted = 0u64;

        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, _)| glob_match(pattern, k))
            .map(|(k, _)| k.as_ref().clone())
            .collect();
        for key in matching {
            self.entries.invalidate(&key).await;
            deleted += 1;
        }

        let counter_keys: Vec<String> = self
            .counters
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in counter_keys {
            self.counters.remove(&key);
            deleted += 1;
        }

        Ok(deleted)
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Minimal glob matching: `*` matches any run of characters
fn glob_match(pattern: &str, input: &str) -> bool {
    fn inner(p: &[u8], s: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], s) || (!s.is_empty() && inner(p, &s[1..])),
            (Some(pc), Some(sc)) if pc == sc => inner(&p[1..], &s[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), input.as_bytes())
}
