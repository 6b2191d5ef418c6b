//! Worker supervisor
//!
//! Owns worker lifecycle: spawns each worker under a restart loop with
//! exponential backoff (capped at 30 s), aggregates per-worker metrics,
//! and logs circuit breaker transitions for alerting. Task handles are
//! registered with the shutdown service so graceful shutdown waits for
//! the drain.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;

use crate::core::shutdown::ShutdownService;
use crate::domain::breaker::{BreakerState, CircuitBreaker};
use crate::utils::retry::backoff_delay;
use crate::utils::time::now_millis;

/// Restart backoff base (ms)
const RESTART_BASE_DELAY_MS: u64 = 1_000;

/// Restart backoff cap (ms)
const RESTART_MAX_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerMetrics {
    pub processed: u64,
    pub failed: u64,
    pub restarts: u64,
    pub last_error: Option<String>,
    pub last_run_at: Option<i64>,
}

type MetricsRegistry = Arc<DashMap<&'static str, WorkerMetrics>>;

/// Handle a worker uses to report progress
#[derive(Clone)]
pub struct WorkerMetricsHandle {
    name: &'static str,
    registry: MetricsRegistry,
}

impl WorkerMetricsHandle {
    pub fn processed(&self, count: u64) {
        let mut entry = self.registry.entry(self.name).or_default();
        entry.processed += count;
        entry.last_run_at = Some(now_millis());
    }

    pub fn failed(&self, error: &dyn std::fmt::Display) {
        let mut entry = self.registry.entry(self.name).or_default();
        entry.failed += 1;
        entry.last_error = Some(error.to_string());
        entry.last_run_at = Some(now_millis());
    }

    pub fn touch(&self) {
        let mut entry = self.registry.entry(self.name).or_default();
        entry.last_run_at = Some(now_millis());
    }

    #[cfg(test)]
    pub fn for_test(name: &'static str) -> Self {
        Self {
            name,
            registry: Arc::new(DashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> WorkerMetrics {
        self.registry.get(self.name).map(|e| e.clone()).unwrap_or_default()
    }
}

pub struct Supervisor {
    shutdown: ShutdownService,
    registry: MetricsRegistry,
}

impl Supervisor {
    pub fn new(shutdown: ShutdownService) -> Self {
        Self {
            shutdown,
            registry: Arc::new(DashMap::new()),
        }
    }

    /// Spawn a worker under supervision.
    ///
    /// `make` is called to (re)create the worker future; when the future
    /// completes while shutdown has not been signalled, the worker is
    /// restarted after an exponential backoff.
    pub async fn supervise<F, Fut>(&self, name: &'static str, make: F)
    where
        F: Fn(watch::Receiver<bool>, WorkerMetricsHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registry.entry(name).or_default();

        let handle = WorkerMetricsHandle {
            name,
            registry: Arc::clone(&self.registry),
        };
        let registry = Arc::clone(&self.registry);
        let mut shutdown_rx = self.shutdown.subscribe();

        let join = tokio::spawn(async move {
            let mut restart = 0u32;
            loop {
                tracing::debug!(worker = name, "Worker starting");
                make(shutdown_rx.clone(), handle.clone()).await;

                if *shutdown_rx.borrow() {
                    tracing::debug!(worker = name, "Worker stopped (shutdown)");
                    break;
                }

                if let Some(mut entry) = registry.get_mut(name) {
                    entry.restarts += 1;
                }
                let delay = backoff_delay(restart, RESTART_BASE_DELAY_MS, RESTART_MAX_DELAY_MS);
                restart = restart.saturating_add(1);
                tracing::warn!(
                    worker = name,
                    restart,
                    delay_ms = delay.as_millis() as u64,
                    "Worker exited unexpectedly, restarting"
                );

                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });

        self.shutdown.register(join).await;
    }

    /// Log circuit breaker transitions; an OPEN transition is the alert
    /// operators page on.
    pub async fn watch_breaker(&self, breaker: &Arc<CircuitBreaker>) {
        let mut rx = breaker.subscribe();
        let mut shutdown_rx = self.shutdown.subscribe();

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *rx.borrow();
                        match state {
                            BreakerState::Open => {
                                tracing::error!("ALERT: store circuit breaker opened");
                            }
                            BreakerState::HalfOpen => {
                                tracing::info!("Store circuit breaker probing");
                            }
                            BreakerState::Closed => {
                                tracing::info!("Store circuit breaker recovered");
                            }
                        }
                    }
                }
            }
        });

        self.shutdown.register(join).await;
    }

    /// Per-worker metrics snapshot, sorted by worker name
    pub fn metrics(&self) -> Vec<(&'static str, WorkerMetrics)> {
        let mut snapshot: Vec<_> = self
            .registry
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        snapshot.sort_by_key(|(name, _)| *name);
        snapshot
    }
}
