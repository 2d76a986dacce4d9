#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[cfg(feature = "metrics")]
    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),
    #[error("Metrics encoding error: {0}")]
    EncodingError(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub batches_sent: u64,
    pub batches_acknowledged: u64,
    pub batches_failed: u64,
    pub batches_timed_out: u64,
    pub batches_retried: u64,
    pub send_timeouts: u64,
    pub channels_created: u64,
    pub channels_replaced: u64,
    pub channels_dead: u64,
    pub checkpoints: u64,
    pub pending_checkpoints: u64,
}

/// Connection-wide counters. Updated from the dispatch path, the pool
/// listener and the timeout checker.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    batches_sent: AtomicU64,
    batches_acknowledged: AtomicU64,
    batches_failed: AtomicU64,
    batches_timed_out: AtomicU64,
    batches_retried: AtomicU64,
    send_timeouts: AtomicU64,
    channels_created: AtomicU64,
    channels_replaced: AtomicU64,
    channels_dead: AtomicU64,
    checkpoints: AtomicU64,
    pending_checkpoints: AtomicU64,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch_sent(&self) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acknowledged(&self) {
        self.batches_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.batches_timed_out.fetch_add(1, Ordering::Relaxed);
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.batches_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_timeout(&self) {
        self.send_timeouts.fetch_add(1, Ordering::Relaxed);
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_channel_created(&self) {
        self.channels_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_channel_replaced(&self) {
        self.channels_replaced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_channel_dead(&self) {
        self.channels_dead.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending_checkpoints(&self, pending: usize) {
        self.pending_checkpoints
            .store(pending as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_acknowledged: self.batches_acknowledged.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_timed_out: self.batches_timed_out.load(Ordering::Relaxed),
            batches_retried: self.batches_retried.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
            channels_created: self.channels_created.load(Ordering::Relaxed),
            channels_replaced: self.channels_replaced.load(Ordering::Relaxed),
            channels_dead: self.channels_dead.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            pending_checkpoints: self.pending_checkpoints.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition of the current counters.
    #[cfg(feature = "metrics")]
    pub fn export_metrics(&self) -> Result<String, MetricsError> {
        let snapshot = self.snapshot();
        let registry = Registry::new();

        let counters = [
            ("hec_batches_sent_total", "Batches dispatched to a channel", snapshot.batches_sent),
            ("hec_batches_acknowledged_total", "Batches confirmed by ack poll", snapshot.batches_acknowledged),
            ("hec_batches_failed_total", "Batches reported failed to the caller", snapshot.batches_failed),
            ("hec_batches_timed_out_total", "Batches failed by the ack timeout", snapshot.batches_timed_out),
            ("hec_batches_retried_total", "Batches redriven after a retryable failure", snapshot.batches_retried),
            ("hec_send_timeouts_total", "Batches no channel accepted in time", snapshot.send_timeouts),
            ("hec_channels_created_total", "Channels opened", snapshot.channels_created),
            ("hec_channels_replaced_total", "Channels replaced by the reaper or health checks", snapshot.channels_replaced),
            ("hec_channels_dead_total", "Channels declared unresponsive", snapshot.channels_dead),
            ("hec_checkpoints_total", "Checkpoints delivered to the caller", snapshot.checkpoints),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::new(name, help)?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        let pending = IntGauge::new(
            "hec_pending_checkpoints",
            "Batches registered but not yet checkpointed",
        )?;
        pending.set(snapshot.pending_checkpoints as i64);
        registry.register(Box::new(pending))?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingError(e.to_string()))
    }
}
