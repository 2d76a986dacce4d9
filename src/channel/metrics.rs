use crate::domain::{BatchId, ChannelId, EventBatch, HecError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Typed notifications a channel publishes about its own state.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    AckConfirmed {
        channel: ChannelId,
        batch: Arc<EventBatch>,
    },
    BatchFailed {
        channel: ChannelId,
        batch: Arc<EventBatch>,
        error: Arc<HecError>,
    },
    Unresponsive {
        channel: ChannelId,
        reason: String,
    },
    Closed {
        channel: ChannelId,
    },
}

impl ChannelEvent {
    pub fn channel(&self) -> &ChannelId {
        match self {
            Self::AckConfirmed { channel, .. }
            | Self::BatchFailed { channel, .. }
            | Self::Unresponsive { channel, .. }
            | Self::Closed { channel } => channel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMetricsSnapshot {
    pub unacknowledged: usize,
    pub total_posted: u64,
    pub total_acknowledged: u64,
    pub total_failed: u64,
    pub health_check_failures: u64,
    pub last_ack_latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct LatencyState {
    births: BTreeMap<BatchId, Instant>,
    last_ack_latency: Option<Duration>,
    last_ack_at: Option<Instant>,
}

/// Per-channel health counters plus the channel-scoped event stream.
#[derive(Debug)]
pub struct ChannelMetrics {
    channel: ChannelId,
    latency: Mutex<LatencyState>,
    total_posted: AtomicU64,
    total_acknowledged: AtomicU64,
    total_failed: AtomicU64,
    health_check_failures: AtomicU64,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl ChannelMetrics {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            latency: Mutex::new(LatencyState::default()),
            total_posted: AtomicU64::new(0),
            total_acknowledged: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            health_check_failures: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_subscriber(tx);
        rx
    }

    /// Forwards this channel's events into an existing stream, e.g. the
    /// pool-wide listener.
    pub fn add_subscriber(&self, tx: mpsc::UnboundedSender<ChannelEvent>) {
        self.subscribers.lock().push(tx);
    }

    pub fn record_post(&self, batch: &EventBatch, now: Instant) {
        self.latency.lock().births.insert(batch.id(), now);
        self.total_posted.fetch_add(1, Ordering::Relaxed);
        trace!(channel = %self.channel, batch_id = %batch.id(), "Recorded post");
    }

    pub fn record_ack(&self, batch: &Arc<EventBatch>, now: Instant) {
        {
            let mut latency = self.latency.lock();
            if let Some(posted_at) = latency.births.remove(&batch.id()) {
                latency.last_ack_latency = Some(now.saturating_duration_since(posted_at));
            }
            latency.last_ack_at = Some(now);
        }
        self.total_acknowledged.fetch_add(1, Ordering::Relaxed);
        self.emit(ChannelEvent::AckConfirmed {
            channel: self.channel.clone(),
            batch: Arc::clone(batch),
        });
    }

    pub fn record_failure(&self, batch: &Arc<EventBatch>, error: HecError) {
        self.latency.lock().births.remove(&batch.id());
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        self.emit(ChannelEvent::BatchFailed {
            channel: self.channel.clone(),
            batch: Arc::clone(batch),
            error: Arc::new(error),
        });
    }

    pub fn record_unresponsive(&self, reason: impl Into<String>) {
        self.emit(ChannelEvent::Unresponsive {
            channel: self.channel.clone(),
            reason: reason.into(),
        });
    }

    /// Emits the final `Closed` event and detaches every subscriber.
    pub fn record_closed(&self) {
        self.emit(ChannelEvent::Closed {
            channel: self.channel.clone(),
        });
        self.subscribers.lock().clear();
    }

    pub fn record_health_check(&self, healthy: bool) {
        if !healthy {
            self.health_check_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Forgets a batch without emitting anything, for batches abandoned
    /// with their channel.
    pub fn forget(&self, batch: &EventBatch) {
        self.latency.lock().births.remove(&batch.id());
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.latency.lock().births.len()
    }

    pub fn oldest_unacked_age(&self, now: Instant) -> Option<Duration> {
        self.latency
            .lock()
            .births
            .values()
            .min()
            .map(|oldest| now.saturating_duration_since(*oldest))
    }

    pub fn last_ack_latency(&self) -> Option<Duration> {
        self.latency.lock().last_ack_latency
    }

    pub fn last_ack_at(&self) -> Option<Instant> {
        self.latency.lock().last_ack_at
    }

    pub fn snapshot(&self) -> ChannelMetricsSnapshot {
        let latency = self.latency.lock();
        ChannelMetricsSnapshot {
            unacknowledged: latency.births.len(),
            total_posted: self.total_posted.load(Ordering::Relaxed),
            total_acknowledged: self.total_acknowledged.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
            last_ack_latency: latency.last_ack_latency,
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            debug!(channel = %self.channel, "No subscribers left for channel events");
        }
    }
}
