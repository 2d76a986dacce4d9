pub mod metrics;
pub mod tracker;

pub use metrics::{ChannelEvent, ChannelMetrics, ChannelMetricsSnapshot};
pub use tracker::{AckRequest, AcknowledgementTracker};

use crate::app::ConnectionSettings;
use crate::domain::{ChannelId, EventBatch, HecError};
use crate::pool::Endpoint;
use crate::sender::HecTransport;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct ChannelState {
    unacked: usize,
    quiesced: bool,
    closed: bool,
}

/// One HEC request channel: a transport, its ack tracker and an in-flight
/// cap.
///
/// The channel's background task polls acks, checks for a stalled server
/// and consumes the channel's own `ChannelEvent` stream to release
/// in-flight slots.
pub struct Channel {
    id: ChannelId,
    endpoint: Endpoint,
    channel_uuid: Uuid,
    transport: Arc<dyn HecTransport>,
    tracker: AcknowledgementTracker,
    metrics: Arc<ChannelMetrics>,
    state: Mutex<ChannelState>,
    capacity: Notify,
    settings: Arc<ConnectionSettings>,
    created_at: Instant,
    cancel: CancellationToken,
    unresponsive_reported: AtomicBool,
}

impl Channel {
    /// Creates the channel and spawns its background task. `pool_events`,
    /// when given, receives every event the channel emits.
    pub fn start(
        id: ChannelId,
        endpoint: Endpoint,
        channel_uuid: Uuid,
        transport: Arc<dyn HecTransport>,
        settings: Arc<ConnectionSettings>,
        pool_events: Option<mpsc::UnboundedSender<ChannelEvent>>,
    ) -> Arc<Self> {
        let metrics = Arc::new(ChannelMetrics::new(id.clone()));
        let own_events = metrics.subscribe();
        if let Some(tx) = pool_events {
            metrics.add_subscriber(tx);
        }

        let channel = Arc::new(Self {
            tracker: AcknowledgementTracker::new(id.clone(), Arc::clone(&metrics)),
            id,
            endpoint,
            channel_uuid,
            transport,
            metrics,
            state: Mutex::new(ChannelState::default()),
            capacity: Notify::new(),
            settings,
            created_at: Instant::now(),
            cancel: CancellationToken::new(),
            unresponsive_reported: AtomicBool::new(false),
        });

        tokio::spawn(run(
            Arc::downgrade(&channel),
            own_events,
            channel.cancel.clone(),
            channel.settings.ack_poll_interval,
        ));
        info!(channel = %channel.id, endpoint = %channel.endpoint, uuid = %channel.channel_uuid, "Channel started");
        channel
    }

    /// Non-blocking send. `Ok(false)` when the channel is quiesced, closed
    /// or at its in-flight cap.
    pub fn send(self: &Arc<Self>, batch: &Arc<EventBatch>) -> Result<bool, HecError> {
        if !self.try_reserve() {
            return Ok(false);
        }
        self.dispatch(batch)?;
        Ok(true)
    }

    /// Send for a caller committed to this channel: waits up to `timeout`
    /// for an in-flight slot.
    pub async fn send_or_wait(
        self: &Arc<Self>,
        batch: &Arc<EventBatch>,
        timeout: Duration,
    ) -> Result<(), HecError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.closed || state.quiesced {
                    return Err(HecError::IllegalState(format!(
                        "channel {} stopped accepting batches while batch {} was waiting",
                        self.id,
                        batch.id()
                    )));
                }
            }
            if self.try_reserve() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(HecError::SendTimeout {
                    batch_id: batch.id(),
                    timeout,
                });
            }
        }
        self.dispatch(batch)
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.state.lock();
        if !Self::is_available_locked(&state, self.settings.max_unacked_per_channel) {
            return false;
        }
        state.unacked += 1;
        true
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.unacked = state.unacked.saturating_sub(1);
        drop(state);
        self.capacity.notify_waiters();
    }

    fn dispatch(self: &Arc<Self>, batch: &Arc<EventBatch>) -> Result<(), HecError> {
        if !batch.mark_flushed() {
            self.release_slot();
            return Err(HecError::IllegalState(format!(
                "batch {} is empty or already flushed",
                batch.id()
            )));
        }
        let attempt = batch.record_attempt();
        self.tracker.pre_event_post(batch);
        self.metrics.record_post(batch, Instant::now());
        debug!(channel = %self.id, batch_id = %batch.id(), attempt, bytes = batch.len(), "Posting batch");

        let channel = Arc::clone(self);
        let batch = Arc::clone(batch);
        tokio::spawn(async move { channel.post(batch).await });
        Ok(())
    }

    async fn post(self: Arc<Self>, batch: Arc<EventBatch>) {
        match self.transport.post_events(&batch).await {
            Ok(ack_id) => {
                if self.is_closed() {
                    debug!(channel = %self.id, batch_id = %batch.id(), ack_id, "Ack id arrived after channel closed");
                    return;
                }
                if let Err(e) = self.tracker.handle_event_post_response(ack_id, &batch) {
                    if batch.is_timed_out_flag() {
                        debug!(channel = %self.id, batch_id = %batch.id(), ack_id, "Ack id arrived after batch timed out");
                        return;
                    }
                    self.report_violation(&e);
                }
            }
            Err(e) => {
                warn!(channel = %self.id, batch_id = %batch.id(), error = %e, "Event post failed");
                if batch.is_timed_out_flag() {
                    self.abandon(&batch);
                } else if self.tracker.cancel(&batch) {
                    self.metrics.record_failure(&batch, e);
                }
            }
        }
    }

    async fn poll_acks(&self) {
        let request = self.tracker.get_ack_request();
        if request.is_empty() {
            return;
        }
        match self.transport.poll_acks(&request).await {
            Ok(succeeded) => match self.tracker.handle_ack_poll_response(&succeeded) {
                Ok(confirmed) if !confirmed.is_empty() => {
                    debug!(channel = %self.id, confirmed = confirmed.len(), requested = request.len(), "Ack poll confirmed batches");
                }
                Ok(_) => {}
                Err(e) => self.report_violation(&e),
            },
            Err(e) => {
                warn!(channel = %self.id, requested = request.len(), error = %e, "Ack poll failed");
            }
        }
    }

    /// Drops a batch the timeout checker already reported and frees its
    /// slot. No event is emitted; the outcome is settled.
    fn abandon(&self, batch: &EventBatch) -> bool {
        if !self.tracker.cancel(batch) {
            return false;
        }
        self.metrics.forget(batch);
        if let Err(e) = self.decrement() {
            self.report_violation(&e);
        }
        true
    }

    /// Releases every in-flight batch that has timed out. Returns how many
    /// slots were freed.
    pub fn release_timed_out(&self) -> usize {
        let mut released = 0;
        for batch in self.tracker.in_flight() {
            if batch.is_timed_out_flag() && self.abandon(&batch) {
                released += 1;
            }
        }
        if released > 0 {
            debug!(channel = %self.id, released, unacked = self.unacked_count(), "Released timed out batches");
        }
        released
    }

    async fn check_health(&self) {
        match self.transport.check_health().await {
            Ok(()) => {
                self.metrics.record_health_check(true);
                debug!(channel = %self.id, "Health check passed");
            }
            Err(e) => {
                self.metrics.record_health_check(false);
                warn!(channel = %self.id, error = %e, "Health check failed");
            }
        }
    }

    /// Emits `Unresponsive` once when the oldest unacked batch has waited
    /// longer than the configured decommission threshold.
    pub fn check_responsiveness(&self, now: Instant) -> bool {
        let Some(threshold) = self.settings.unresponsive_channel_decom else {
            return false;
        };
        let Some(age) = self.metrics.oldest_unacked_age(now) else {
            return false;
        };
        if age <= threshold || self.is_closed() {
            return false;
        }
        if self.unresponsive_reported.swap(true, Ordering::AcqRel) {
            return false;
        }
        warn!(channel = %self.id, oldest_unacked = ?age, threshold = ?threshold, "Channel unresponsive");
        self.metrics.record_unresponsive(format!(
            "oldest unacknowledged batch waited {age:?}, limit {threshold:?}"
        ));
        true
    }

    fn report_violation(&self, violation: &HecError) {
        error!(channel = %self.id, error = %violation, "Channel consistency violation");
        if !self.unresponsive_reported.swap(true, Ordering::AcqRel) {
            self.metrics.record_unresponsive(violation.to_string());
        }
    }

    fn handle_event(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::AckConfirmed { .. } | ChannelEvent::BatchFailed { .. } => {
                if let Err(e) = self.decrement() {
                    self.report_violation(&e);
                }
            }
            ChannelEvent::Unresponsive { .. } | ChannelEvent::Closed { .. } => {}
        }
    }

    fn decrement(&self) -> Result<(), HecError> {
        let close_now = {
            let mut state = self.state.lock();
            if state.unacked == 0 {
                return Err(HecError::IllegalState(format!(
                    "channel {} in-flight counter would go negative",
                    self.id
                )));
            }
            state.unacked -= 1;
            state.quiesced && !state.closed && state.unacked == 0
        };
        self.capacity.notify_waiters();
        if close_now {
            debug!(channel = %self.id, "Quiesced channel drained");
            self.close()?;
        }
        Ok(())
    }

    /// Stops the channel from taking new batches. In-flight batches keep
    /// draining.
    pub fn quiesce(&self) {
        let mut state = self.state.lock();
        if !state.quiesced {
            state.quiesced = true;
            debug!(channel = %self.id, unacked = state.unacked, "Channel quiesced");
        }
        drop(state);
        self.capacity.notify_waiters();
    }

    /// Closes the channel, or quiesces it while batches are still in
    /// flight; the close then happens when the last one drains.
    pub fn close(&self) -> Result<(), HecError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(HecError::IllegalState(format!(
                    "channel {} is already closed",
                    self.id
                )));
            }
            state.quiesced = true;
            if state.unacked > 0 {
                debug!(channel = %self.id, unacked = state.unacked, "Close deferred until channel drains");
                drop(state);
                self.capacity.notify_waiters();
                return Ok(());
            }
            state.closed = true;
        }
        self.shutdown();
        Ok(())
    }

    /// Closes immediately and abandons every in-flight batch. Returns the
    /// abandoned batches; their outcome is left to the timeout checker.
    pub fn force_close(&self) -> Vec<Arc<EventBatch>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Vec::new();
            }
            state.closed = true;
            state.quiesced = true;
            state.unacked = 0;
        }
        let abandoned = self.tracker.drain();
        for batch in &abandoned {
            self.metrics.forget(batch);
        }
        if !abandoned.is_empty() {
            warn!(channel = %self.id, abandoned = abandoned.len(), "Force closing channel with batches in flight");
        }
        self.shutdown();
        abandoned
    }

    fn shutdown(&self) {
        self.transport.close();
        self.cancel.cancel();
        self.capacity.notify_waiters();
        self.metrics.record_closed();
        info!(channel = %self.id, "Channel closed");
    }

    fn is_available_locked(state: &ChannelState, cap: usize) -> bool {
        !state.quiesced && !state.closed && state.unacked < cap
    }

    pub fn is_available(&self) -> bool {
        Self::is_available_locked(&self.state.lock(), self.settings.max_unacked_per_channel)
    }

    pub fn is_quiesced(&self) -> bool {
        self.state.lock().quiesced
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked
    }

    pub fn is_empty(&self) -> bool {
        self.unacked_count() == 0
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn channel_uuid(&self) -> Uuid {
        self.channel_uuid
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn metrics(&self) -> &Arc<ChannelMetrics> {
        &self.metrics
    }

    pub fn tracker(&self) -> &AcknowledgementTracker {
        &self.tracker
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    channel: Weak<Channel>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    if let Some(channel) = channel.upgrade() {
        channel.check_health().await;
    }

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(channel) = channel.upgrade() else { break };
                channel.handle_event(&event);
            }
            _ = ticker.tick() => {
                let Some(channel) = channel.upgrade() else { break };
                channel.release_timed_out();
                if channel.is_closed() {
                    continue;
                }
                channel.poll_acks().await;
                channel.check_responsiveness(Instant::now());
            }
        }
    }
    debug!("Channel task stopped");
}
