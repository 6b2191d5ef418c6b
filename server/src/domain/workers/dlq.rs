//! Dead-letter queue monitor
//!
//! Watches `dlq:messages` and fires the alert hook when the backlog grows
//! past the configured threshold. Dead letters are never auto-retried;
//! the monitor exposes a snapshot for `/stats` so operators can triage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;

use super::WorkerMetricsHandle;
use crate::core::constants::MONITOR_INTERVAL_SECS;
use crate::data::streams::{StreamName, StreamService};
use crate::domain::events::DeadLetter;

/// Called when the DLQ crosses the alert threshold (length passed in)
pub type AlertHook = Box<dyn Fn(u64) + Send + Sync>;

pub struct DlqMonitor {
    streams: Arc<StreamService>,
    threshold: u64,
    alert: AlertHook,
    last_len: AtomicU64,
    alerting: AtomicBool,
}

impl DlqMonitor {
    pub fn new(streams: Arc<StreamService>, threshold: u64) -> Arc<Self> {
        Self::with_alert(
            streams,
            threshold,
            Box::new(|len| {
                tracing::error!(len, "ALERT: dead-letter queue above threshold");
            }),
        )
    }

    pub fn with_alert(streams: Arc<StreamService>, threshold: u64, alert: AlertHook) -> Arc<Self> {
        Arc::new(Self {
            streams,
            threshold,
            alert,
            last_len: AtomicU64::new(0),
            alerting: AtomicBool::new(false),
        })
    }

    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
        metrics: WorkerMetricsHandle,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(MONITOR_INTERVAL_SECS));
        tracing::debug!(threshold = self.threshold, "DlqMonitor started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.sample(&metrics).await;
                }
            }
        }

        tracing::debug!("DlqMonitor shutdown complete");
    }

    pub async fn sample(&self, metrics: &WorkerMetricsHandle) {
        match self.streams.len(StreamName::DlqMessages).await {
            Ok(len) => {
                self.last_len.store(len, Ordering::Relaxed);
                metrics.touch();

                if len > self.threshold {
                    // Edge-triggered: alert once per excursion
                    if !self.alerting.swap(true, Ordering::Relaxed) {
                        (self.alert)(len);
                        metrics.failed(&format!("dlq length {len} above threshold"));
                    }
                } else {
                    self.alerting.store(false, Ordering::Relaxed);
                }
            }
            Err(e) => {
                metrics.failed(&e);
                tracing::warn!(error = %e, "DLQ length sample failed");
            }
        }
    }

    /// Last sampled queue length
    pub fn len(&self) -> u64 {
        self.last_len.load(Ordering::Relaxed)
    }

    /// Whether the queue is currently above threshold
    pub fn is_alerting(&self) -> bool {
        self.alerting.load(Ordering::Relaxed)
    }

    /// Most recent dead letters for operator triage
    pub async fn recent(&self, limit: usize) -> Vec<DeadLetter> {
        match self
            .streams
            .range_by_time(StreamName::DlqMessages, 0, i64::MAX)
            .await
        {
            Ok(records) => {
                let mut letters: Vec<DeadLetter> = records
                    .iter()
                    .filter_map(|r| StreamService::decode(r).ok())
                    .collect();
                let skip = letters.len().saturating_sub(limit);
                letters.drain(..skip);
                letters
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read dead letters");
                Vec::new()
            }
        }
    }
}
