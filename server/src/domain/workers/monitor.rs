//! Memory and stream monitors
//!
//! Periodic samplers: process RSS against a warning threshold, and every
//! named stream's length against its MAXLEN cap. A stream past 80% of its
//! cap is warned about and defensively trimmed back to the cap, keeping
//! the approximate trim honest under producer bursts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::WorkerMetricsHandle;
use crate::core::constants::{MEMORY_WARN_BYTES, MONITOR_INTERVAL_SECS, STREAM_PRESSURE_RATIO};
use crate::data::streams::{StreamName, StreamService};

// ============================================================================
// STREAM MONITOR
// ============================================================================

pub struct StreamMonitor {
    streams: Arc<StreamService>,
}

impl StreamMonitor {
    pub fn new(streams: Arc<StreamService>) -> Arc<Self> {
        Arc::new(Self { streams })
    }

    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
        metrics: WorkerMetricsHandle,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(MONITOR_INTERVAL_SECS));
        tracing::debug!("StreamMonitor started");

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

        tracing::debug!("StreamMonitor shutdown complete");
    }

    pub async fn sample(&self, metrics: &WorkerMetricsHandle) {
        metrics.touch();

        for stream in StreamName::ALL {
            let len = match self.streams.len(stream).await {
                Ok(len) => len,
                Err(e) => {
                    metrics.failed(&e);
                    tracing::warn!(stream = %stream, error = %e, "Stream length sample failed");
                    continue;
                }
            };

            let cap = self.streams.cap(stream);
            let pressure_at = (cap as f64 * STREAM_PRESSURE_RATIO) as u64;

            if len > pressure_at {
                tracing::warn!(
                    stream = %stream,
                    len,
                    cap,
                    "Stream under pressure, trimming defensively"
                );
                match self.streams.trim_to(stream, cap).await {
                    Ok(trimmed) if trimmed > 0 => {
                        tracing::warn!(stream = %stream, trimmed, "Defensive trim removed records");
                        metrics.processed(trimmed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        metrics.failed(&e);
                        tracing::warn!(stream = %stream, error = %e, "Defensive trim failed");
                    }
                }
            }
        }
    }

    /// Current lengths of every named stream (for `/stats`)
    pub async fn lengths(&self) -> Vec<(&'static str, u64, u64)> {
        let mut out = Vec::with_capacity(StreamName::ALL.len());
        for stream in StreamName::ALL {
            let len = self.streams.len(stream).await.unwrap_or(0);
            out.push((stream.key(), len, self.streams.cap(stream)));
        }
        out
    }
}

// ============================================================================
// MEMORY MONITOR
// ============================================================================

pub struct MemoryMonitor {
    warn_bytes: u64,
}

impl MemoryMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            warn_bytes: MEMORY_WARN_BYTES,
        })
    }

    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
        metrics: WorkerMetricsHandle,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(MONITOR_INTERVAL_SECS));
        tracing::debug!("MemoryMonitor started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    metrics.touch();
                    if let Some(rss) = resident_set_bytes() {
                        if rss > self.warn_bytes {
                            tracing::warn!(
                                rss_mb = rss / (1024 * 1024),
                                warn_mb = self.warn_bytes / (1024 * 1024),
                                "Process memory above threshold"
                            );
                            metrics.failed(&format!("rss {rss} bytes"));
                        } else {
                            tracing::trace!(rss_mb = rss / (1024 * 1024), "Memory sample");
                        }
                    }
                }
            }
        }

        tracing::debug!("MemoryMonitor shutdown complete");
    }
}

/// Resident set size of this process in bytes, where the platform exposes it
pub fn resident_set_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StreamLimits;
    use crate::data::streams::MemoryStreamBackend;

    fn monitor_with_limits(maxlen_events: u64) -> (Arc<StreamService>, Arc<StreamMonitor>) {
        let limits = StreamLimits {
            maxlen_events,
            ..StreamLimits::default()
        };
        let streams = Arc::new(StreamService::with_backend(
            Arc::new(MemoryStreamBackend::new()),
            limits,
        ));
        let monitor = StreamMonitor::new(Arc::clone(&streams));
        (streams, monitor)
    }

    #[tokio::test]
    async fn test_quiet_streams_are_left_alone() {
        let (streams, monitor) = monitor_with_limits(100);
        for i in 0..10u32 {
            streams
                .append(StreamName::EventsMessages, &i)
                .await
                .unwrap();
        }

        let metrics = WorkerMetricsHandle::for_test("stream-monitor");
        monitor.sample(&metrics).await;

        assert_eq!(streams.len(StreamName::EventsMessages).await.unwrap(), 10);
        assert_eq!(metrics.snapshot().processed, 0);
    }

    #[tokio::test]
    async fn test_pressured_stream_is_held_at_cap() {
        let (streams, monitor) = monitor_with_limits(10);
        for i in 0..20u32 {
            streams
                .append(StreamName::EventsMessages, &i)
                .await
                .unwrap();
        }

        let metrics = WorkerMetricsHandle::for_test("stream-monitor");
        monitor.sample(&metrics).await;

        assert!(streams.len(StreamName::EventsMessages).await.unwrap() <= 10);
        assert_eq!(metrics.snapshot().failed, 0);
    }

    #[test]
    fn test_resident_set_bytes_on_linux() {
        #[cfg(target_os = "linux")]
        {
            let rss = resident_set_bytes().unwrap();
            assert!(rss > 0);
        }
        #[cfg(not(target_os = "linux"))]
        {
            assert!(resident_set_bytes().is_none());
        }
    }

    #[tokio::test]
    async fn test_lengths_reports_all_streams() {
        let (streams, monitor) = monitor_with_limits(100);
        streams
            .append(StreamName::DlqMessages, &1u32)
            .await
            .unwrap();

        let lengths = monitor.lengths().await;
        assert_eq!(lengths.len(), StreamName::ALL.len());
        let dlq = lengths.iter().find(|(k, _, _)| *k == "dlq:messages").unwrap();
        assert_eq!(dlq.1, 1);
        assert_eq!(dlq.2, 50_000);
    }
}
