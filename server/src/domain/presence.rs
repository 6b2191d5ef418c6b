//! Presence registry
//!
//! Tracks which identities are currently connected, and where. The
//! canonical view lives in the shared cache backend (Redis in production)
//! under a heartbeat-based TTL; each process keeps a small read-through
//! cache with a few seconds of staleness tolerance. Presence is advisory:
//! delivery decisions made from it are reconciled by reconnect backfill.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::events::UserEvent;
use crate::core::constants::{PRESENCE_LOCAL_CACHE_TTL_MS, PRESENCE_SWEEP_INTERVAL_SECS};
use crate::data::cache::{CacheError, CacheKey, CacheService};
use crate::data::streams::{StreamName, StreamService};
use crate::utils::time::now_millis;

/// One live socket for an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEndpoint {
    pub process_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub identity: String,
    pub endpoints: Vec<PresenceEndpoint>,
    pub last_heartbeat: i64,
}

impl PresenceEntry {
    fn is_live(&self, ttl_ms: u64, now: i64) -> bool {
        !self.endpoints.is_empty() && self.last_heartbeat + ttl_ms as i64 > now
    }
}

pub struct PresenceRegistry {
    cache: Arc<CacheService>,
    streams: Arc<StreamService>,
    /// Read-through cache over the canonical store (≤5 s staleness)
    local: moka::sync::Cache<String, Option<PresenceEntry>>,
    /// Identities this process has registered, swept for expiry
    tracked: DashMap<String, ()>,
    ttl_ms: u64,
    process_id: String,
}

impl PresenceRegistry {
    pub fn new(cache: Arc<CacheService>, streams: Arc<StreamService>, ttl_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            cache,
            streams,
            local: moka::sync::Cache::builder()
                .max_capacity(100_000)
                .time_to_live(Duration::from_millis(PRESENCE_LOCAL_CACHE_TTL_MS))
                .build(),
            tracked: DashMap::new(),
            ttl_ms,
            process_id: std::process::id().to_string(),
        })
    }

    fn entry_ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    async fn canonical(&self, identity: &str) -> Result<Option<PresenceEntry>, CacheError> {
        self.cache.get(&CacheKey::presence(identity)).await
    }

    async fn write_canonical(&self, entry: &PresenceEntry) -> Result<(), CacheError> {
        self.cache
            .set(&CacheKey::presence(&entry.identity), entry, Some(self.entry_ttl()))
            .await?;
        self.local.invalidate(&entry.identity);
        Ok(())
    }

    /// Register a socket endpoint for an identity.
    /// First endpoint publishes `USER_ONLINE` on `events:users`.
    pub async fn register(&self, identity: &str, session_id: &str) -> Result<(), CacheError> {
        let now = now_millis();
        let endpoint = PresenceEndpoint {
            process_id: self.process_id.clone(),
            session_id: session_id.to_string(),
        };

        let mut entry = self
            .canonical(identity)
            .await?
            .filter(|e| e.is_live(self.ttl_ms, now))
            .unwrap_or_else(|| PresenceEntry {
                identity: identity.to_string(),
                endpoints: Vec::new(),
                last_heartbeat: now,
            });

        let came_online = entry.endpoints.is_empty();
        if !entry.endpoints.contains(&endpoint) {
            entry.endpoints.push(endpoint);
        }
        entry.last_heartbeat = now;
        self.write_canonical(&entry).await?;
        self.tracked.insert(identity.to_string(), ());

        if came_online {
            let event = UserEvent::Online {
                identity: identity.to_string(),
                at: now,
            };
            if let Err(e) = self.streams.append(StreamName::EventsUsers, &event).await {
                tracing::warn!(identity, error = %e, "Failed to publish USER_ONLINE");
            }
        }

        tracing::debug!(identity, session_id, "Presence registered");
        Ok(())
    }

    /// Drop a socket endpoint. The last endpoint going away publishes
    /// `USER_OFFLINE` and removes the entry.
    pub async fn unregister(&self, identity: &str, session_id: &str) -> Result<(), CacheError> {
        let Some(mut entry) = self.canonical(identity).await? else {
            self.local.invalidate(identity);
            return Ok(());
        };

        entry
            .endpoints
            .retain(|e| !(e.process_id == self.process_id && e.session_id == session_id));

        if entry.endpoints.is_empty() {
            self.cache.delete(&CacheKey::presence(identity)).await?;
            self.local.invalidate(identity);
            self.tracked.remove(identity);
            self.publish_offline(identity).await;
        } else {
            self.write_canonical(&entry).await?;
        }

        tracing::debug!(identity, session_id, "Presence unregistered");
        Ok(())
    }

    /// Refresh the heartbeat, extending the entry's TTL
    pub async fn heartbeat(&self, identity: &str) -> Result<(), CacheError> {
        if let Some(mut entry) = self.canonical(identity).await? {
            entry.last_heartbeat = now_millis();
            self.write_canonical(&entry).await?;
        }
        Ok(())
    }

    /// Whether the identity has at least one live endpoint.
    /// Reads through the local cache; errors degrade to "offline".
    pub async fn is_online(&self, identity: &str) -> bool {
        self.entry(identity).await.is_some()
    }

    /// The live presence entry for an identity, if any
    pub async fn entry(&self, identity: &str) -> Option<PresenceEntry> {
        let now = now_millis();

        if let Some(cached) = self.local.get(identity) {
            return cached.filter(|e| e.is_live(self.ttl_ms, now));
        }

        let entry = match self.canonical(identity).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(identity, error = %e, "Presence lookup failed, treating as offline");
                return None;
            }
        };

        self.local.insert(identity.to_string(), entry.clone());
        entry.filter(|e| e.is_live(self.ttl_ms, now))
    }

    /// Subset of `candidates` that is currently online
    pub async fn list_online(&self, candidates: &[String]) -> Vec<String> {
        let mut online = Vec::new();
        for identity in candidates {
            if self.is_online(identity).await {
                online.push(identity.clone());
            }
        }
        online
    }

    /// Number of identities this process believes are online
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    async fn publish_offline(&self, identity: &str) {
        let event = UserEvent::Offline {
            identity: identity.to_string(),
            at: now_millis(),
        };
        if let Err(e) = self.streams.append(StreamName::EventsUsers, &event).await {
            tracing::warn!(identity, error = %e, "Failed to publish USER_OFFLINE");
        }
    }

    /// Remove expired entries among tracked identities and publish
    /// `USER_OFFLINE` for each. With the Redis backend the TTL already
    /// evicted the value; the sweep notices and emits the event.
    pub async fn sweep(&self) {
        let now = now_millis();
        let tracked: Vec<String> = self.tracked.iter().map(|e| e.key().clone()).collect();

        for identity in tracked {
            let live = match self.canonical(&identity).await {
                Ok(entry) => entry.is_some_and(|e| e.is_live(self.ttl_ms, now)),
                Err(_) => continue, // keep tracking through cache hiccups
            };
            if !live {
                self.tracked.remove(&identity);
                self.local.invalidate(&identity);
                let _ = self.cache.delete(&CacheKey::presence(&identity)).await;
                self.publish_offline(&identity).await;
                tracing::debug!(identity, "Presence expired");
            }
        }
    }

    /// Background sweeper: runs every 30 s until shutdown
    pub fn start_sweeper(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(PRESENCE_SWEEP_INTERVAL_SECS));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("Presence sweeper shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        registry.sweep().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StreamLimits;
    use crate::data::streams::MemoryStreamBackend;

    fn registry(ttl_ms: u64) -> Arc<PresenceRegistry> {
        let cache = Arc::new(CacheService::in_memory(10_000));
        let streams = Arc::new(StreamService::with_backend(
            Arc::new(MemoryStreamBackend::new()),
            StreamLimits::default(),
        ));
        PresenceRegistry::new(cache, streams, ttl_ms)
    }

    #[tokio::test]
    async fn test_register_makes_identity_online() {
        let registry = registry(60_000);

        assert!(!registry.is_online("alice").await);
        registry.register("alice", "s1").await.unwrap();
        assert!(registry.is_online("alice").await);
        assert_eq!(registry.tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_multiple_endpoints_survive_partial_unregister() {
        let registry = registry(60_000);

        registry.register("alice", "s1").await.unwrap();
        registry.register("alice", "s2").await.unwrap();

        registry.unregister("alice", "s1").await.unwrap();
        assert!(registry.is_online("alice").await);

        registry.unregister("alice", "s2").await.unwrap();
        assert!(!registry.is_online("alice").await);
        assert_eq!(registry.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_heartbeat_is_offline() {
        let registry = registry(10);
        registry.register("alice", "s1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!registry.is_online("alice").await);
    }

    #[tokio::test]
    async fn test_heartbeat_extends_liveness() {
        let registry = registry(80);
        registry.register("alice", "s1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.heartbeat("alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Would have expired without the heartbeat
        assert!(registry.is_online("alice").await);
    }

    #[tokio::test]
    async fn test_list_online_filters() {
        let registry = registry(60_000);
        registry.register("alice", "s1").await.unwrap();
        registry.register("carol", "s2").await.unwrap();

        let online = registry
            .list_online(&[
                "alice".to_string(),
                "bob".to_string(),
                "carol".to_string(),
            ])
            .await;
        assert_eq!(online, vec!["alice".to_string(), "carol".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_and_untracks() {
        let registry = registry(10);
        registry.register("alice", "s1").await.unwrap();
        assert_eq!(registry.tracked_count(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.sweep().await;
        assert_eq!(registry.tracked_count(), 0);
    }
}
