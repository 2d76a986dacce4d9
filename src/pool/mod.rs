pub mod checkpoint;
pub mod discovery;
pub mod reaper;

pub use checkpoint::CheckpointManager;
pub use discovery::{Discoverer, Endpoint, StaticDiscoverer};

use crate::app::ConnectionSettings;
use crate::channel::{Channel, ChannelEvent};
use crate::domain::{ChannelId, ConnectionCallbacks, EventBatch, HecError};
use crate::reliability::{ConnectionMetrics, RetryPolicy, TimeoutChecker};
use crate::sender::TransportFactory;
use dashmap::DashMap;
use parking_lot::Mutex;
pub use reaper::Reaper;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Pool of HEC channels with round-robin dispatch.
///
/// Channels are created lazily on the first batch, one set per discovered
/// endpoint. The pool listens to every channel's event stream to report
/// outcomes, redrive failed batches and replace dead channels.
#[derive(Clone)]
pub struct LoadBalancer {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    channels: DashMap<ChannelId, Arc<Channel>>,
    robin: AtomicUsize,
    post_count: AtomicU64,
    channel_seq: AtomicU64,
    settings: Arc<ConnectionSettings>,
    discoverer: Arc<dyn Discoverer>,
    transports: Arc<dyn TransportFactory>,
    callbacks: Arc<dyn ConnectionCallbacks>,
    checkpoints: Arc<CheckpointManager>,
    timeout_checker: TimeoutChecker,
    reaper: Reaper,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    dispatch_lock: tokio::sync::Mutex<()>,
    creation_lock: Mutex<()>,
    closed: AtomicBool,
    metrics: Arc<ConnectionMetrics>,
    retry_policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl LoadBalancer {
    /// Must be called from within a tokio runtime.
    pub fn new(
        settings: Arc<ConnectionSettings>,
        discoverer: Arc<dyn Discoverer>,
        transports: Arc<dyn TransportFactory>,
        callbacks: Arc<dyn ConnectionCallbacks>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(ConnectionMetrics::new());
        let checkpoints = Arc::new(CheckpointManager::new(
            settings.enable_checkpoints,
            Arc::clone(&callbacks),
            Arc::clone(&metrics),
        ));
        let timeout_checker = TimeoutChecker::new(
            settings.ack_timeout,
            Arc::clone(&callbacks),
            Arc::clone(&checkpoints),
            Arc::clone(&metrics),
        );
        let retry_policy = RetryPolicy::new(settings.retry.clone());

        let inner = Arc::new_cyclic(|pool: &Weak<PoolInner>| {
            let expiring = pool.clone();
            let reaper = Reaper::start(move |channel| {
                if let Some(pool) = expiring.upgrade() {
                    if let Err(e) = pool.close_and_replace(&channel) {
                        error!(channel = %channel, error = %e, "Failed to replace expired channel");
                    }
                }
            });

            PoolInner {
                channels: DashMap::new(),
                robin: AtomicUsize::new(0),
                post_count: AtomicU64::new(0),
                channel_seq: AtomicU64::new(0),
                settings,
                discoverer,
                transports,
                callbacks,
                checkpoints,
                timeout_checker,
                reaper,
                events_tx,
                dispatch_lock: tokio::sync::Mutex::new(()),
                creation_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
                metrics,
                retry_policy,
                shutdown: shutdown.clone(),
            }
        });

        tokio::spawn(listen(Arc::downgrade(&inner), events_rx, shutdown));
        Self { inner }
    }

    /// Hands a batch to the next available channel.
    ///
    /// Waits up to the send timeout for a channel with a free slot. On
    /// timeout the batch is failed through the callbacks and the error is
    /// also returned.
    pub async fn send_batch(&self, batch: Arc<EventBatch>) -> Result<(), HecError> {
        let pool = &self.inner;
        if pool.closed.load(Ordering::Acquire) {
            return Err(HecError::IllegalState(format!(
                "load balancer is closed, batch {} rejected",
                batch.id()
            )));
        }
        if batch.is_empty() || batch.is_flushed() {
            debug!(batch_id = %batch.id(), "Ignoring empty or already flushed batch");
            return Ok(());
        }

        pool.ensure_channels()?;
        pool.checkpoints.register(&batch);
        pool.timeout_checker.add(&batch);
        if batch.post_count().is_none() {
            batch.set_post_count_if_unset(pool.post_count.fetch_add(1, Ordering::Relaxed));
        }
        pool.dispatch(&batch).await
    }

    /// Adds a channel to `endpoint`. Without `force` the pool's channel cap
    /// applies and `Ok(None)` means the pool is full.
    pub fn add_channel(
        &self,
        endpoint: &Endpoint,
        force: bool,
    ) -> Result<Option<Arc<Channel>>, HecError> {
        self.inner.add_channel(endpoint, force)
    }

    /// Forced add to a random discovered endpoint.
    pub fn add_channel_from_randomly_chosen_host(&self) -> Result<Arc<Channel>, HecError> {
        self.inner.add_channel_from_randomly_chosen_host()
    }

    /// Starts a replacement channel, then closes `channel` once it drains.
    pub fn close_and_replace(&self, channel: &ChannelId) -> Result<(), HecError> {
        self.inner.close_and_replace(channel)
    }

    /// Removes a channel from the pool. Removing a channel with batches in
    /// flight requires `force`; those batches are abandoned to the timeout
    /// checker.
    pub fn remove_channel(&self, channel: &ChannelId, force: bool) -> Result<bool, HecError> {
        self.inner.remove_channel(channel, force)
    }

    /// Graceful close: no new batches, channels close as they drain.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Abrupt close: every channel is force closed and pending batches are
    /// forgotten without callbacks.
    pub fn close_now(&self) {
        self.inner.close_now();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.inner.snapshot()
    }

    pub fn channel(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        self.inner.channels.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.inner.metrics
    }

    pub fn settings(&self) -> &Arc<ConnectionSettings> {
        &self.inner.settings
    }

    pub fn timeout_checker(&self) -> &TimeoutChecker {
        &self.inner.timeout_checker
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.inner.checkpoints
    }

    /// Batches currently in flight across all channels.
    pub fn unacked_count(&self) -> usize {
        self.inner.channels.iter().map(|e| e.unacked_count()).sum()
    }
}

impl PoolInner {
    fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn ensure_channels(&self) -> Result<(), HecError> {
        if !self.channels.is_empty() {
            return Ok(());
        }
        let _creation = self.creation_lock.lock();
        if !self.channels.is_empty() {
            return Ok(());
        }

        let endpoints = self.discoverer.addrs();
        if endpoints.is_empty() {
            return Err(HecError::IllegalState(
                "no HEC endpoints discovered".to_string(),
            ));
        }
        'endpoints: for endpoint in &endpoints {
            for _ in 0..self.settings.channels_per_destination {
                if self.add_channel(endpoint, false)?.is_none() {
                    break 'endpoints;
                }
            }
        }
        info!(channels = self.channels.len(), endpoints = endpoints.len(), "Channel pool created");
        Ok(())
    }

    fn add_channel(
        &self,
        endpoint: &Endpoint,
        force: bool,
    ) -> Result<Option<Arc<Channel>>, HecError> {
        if self.closed.load(Ordering::Acquire) {
            debug!(endpoint = %endpoint, "Pool closed, not adding channel");
            return Ok(None);
        }
        if !force && self.channels.len() >= self.settings.max_total_channels {
            debug!(endpoint = %endpoint, max = self.settings.max_total_channels, "Channel pool full");
            return Ok(None);
        }

        let seq = self.channel_seq.fetch_add(1, Ordering::Relaxed);
        let id = ChannelId::new(&endpoint.destination(), seq);
        let channel_uuid = Uuid::new_v4();
        let transport = self.transports.create(endpoint, channel_uuid)?;
        let channel = Channel::start(
            id.clone(),
            endpoint.clone(),
            channel_uuid,
            transport,
            Arc::clone(&self.settings),
            Some(self.events_tx.clone()),
        );
        self.channels.insert(id.clone(), Arc::clone(&channel));
        if let Some(lifespan) = self.settings.channel_decom {
            self.reaper.schedule(id, lifespan);
        }
        self.metrics.record_channel_created();
        Ok(Some(channel))
    }

    fn add_channel_from_randomly_chosen_host(&self) -> Result<Arc<Channel>, HecError> {
        let endpoint = self.discoverer.randomly_choose_addr().ok_or_else(|| {
            HecError::IllegalState("no HEC endpoints discovered".to_string())
        })?;
        self.add_channel(&endpoint, true)?.ok_or_else(|| {
            HecError::IllegalState("load balancer is closed, no channel added".to_string())
        })
    }

    fn close_and_replace(&self, id: &ChannelId) -> Result<(), HecError> {
        let Some(old) = self.channels.get(id).map(|e| Arc::clone(e.value())) else {
            return Ok(());
        };
        if old.is_quiesced() || self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let replacement = self.add_channel_from_randomly_chosen_host()?;
        self.metrics.record_channel_replaced();
        info!(old = %id, new = %replacement.id(), unacked = old.unacked_count(), "Replacing channel");
        old.close()
    }

    fn replace_dead_channel(&self, id: &ChannelId, reason: String) {
        let Some(old) = self.channels.get(id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        if old.is_closed() {
            return;
        }

        warn!(channel = %id, reason = %reason, unacked = old.unacked_count(), "Channel declared dead");
        self.metrics.record_channel_dead();
        self.callbacks.system_warning(&HecError::ChannelDeath {
            channel: id.clone(),
            reason,
        });

        if !self.closed.load(Ordering::Acquire) {
            match self.add_channel_from_randomly_chosen_host() {
                Ok(replacement) => {
                    self.metrics.record_channel_replaced();
                    info!(old = %id, new = %replacement.id(), "Dead channel replaced");
                }
                Err(e) => error!(channel = %id, error = %e, "Failed to replace dead channel"),
            }
        }
        if let Err(e) = self.remove_channel(id, true) {
            error!(channel = %id, error = %e, "Failed to remove dead channel");
        }
    }

    fn remove_channel(&self, id: &ChannelId, force: bool) -> Result<bool, HecError> {
        let Some(channel) = self.channels.get(id).map(|e| Arc::clone(e.value())) else {
            return Ok(false);
        };
        if !force && !channel.is_empty() {
            return Err(HecError::IllegalState(format!(
                "channel {id} still has {} unacknowledged batches",
                channel.unacked_count()
            )));
        }

        self.channels.remove(id);
        self.reaper.cancel(id.clone());
        if !channel.is_closed() {
            let abandoned = channel.force_close();
            if !abandoned.is_empty() {
                warn!(channel = %id, abandoned = abandoned.len(), "Batches left to the timeout checker");
            }
        }
        debug!(channel = %id, remaining = self.channels.len(), "Channel removed");
        Ok(true)
    }

    async fn dispatch(&self, batch: &Arc<EventBatch>) -> Result<(), HecError> {
        let send_timeout = self.settings.send_timeout;
        let deadline = Instant::now() + send_timeout;

        let Ok(_dispatch) = tokio::time::timeout_at(deadline, self.dispatch_lock.lock()).await
        else {
            return Err(self.fail_send_timeout(batch));
        };

        let mut misses = 0_usize;
        loop {
            if self.closed.load(Ordering::Acquire) {
                let error = HecError::IllegalState(format!(
                    "load balancer closed while dispatching batch {}",
                    batch.id()
                ));
                self.report_failure(batch, &error);
                return Err(error);
            }

            let channels = self.snapshot();
            if !channels.is_empty() {
                let idx = self.robin.fetch_add(1, Ordering::Relaxed) % channels.len();
                let channel = &channels[idx];
                match channel.send(batch) {
                    Ok(true) => {
                        self.metrics.record_batch_sent();
                        trace!(batch_id = %batch.id(), channel = %channel.id(), "Batch dispatched");
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(e) => {
                        self.report_failure(batch, &e);
                        return Err(e);
                    }
                }
            }

            misses += 1;
            let now = Instant::now();
            if now >= deadline {
                return Err(self.fail_send_timeout(batch));
            }
            // A full sweep found no free slot
            if misses >= channels.len().max(1) {
                misses = 0;
                tokio::task::yield_now().await;
                let pause = self.settings.dispatch_backoff.min(deadline - now);
                tokio::time::sleep(pause).await;
            }
        }
    }

    fn fail_send_timeout(&self, batch: &Arc<EventBatch>) -> HecError {
        let timeout = self.settings.send_timeout;
        warn!(batch_id = %batch.id(), timeout = ?timeout, "No channel accepted batch in time");
        self.report_failure(
            batch,
            &HecError::SendTimeout {
                batch_id: batch.id(),
                timeout,
            },
        );
        HecError::SendTimeout {
            batch_id: batch.id(),
            timeout,
        }
    }

    fn report_acknowledged(&self, batch: &EventBatch) {
        self.timeout_checker.cancel(batch.id());
        if !batch.claim_outcome() {
            return;
        }
        self.callbacks.acknowledged(batch);
        self.metrics.record_acknowledged();
        self.checkpoints.complete(batch);
    }

    fn report_failure(&self, batch: &EventBatch, error: &HecError) {
        self.timeout_checker.cancel(batch.id());
        batch.mark_failed();
        if !batch.claim_outcome() {
            return;
        }
        self.callbacks.failed(batch, error);
        if matches!(error, HecError::SendTimeout { .. }) {
            self.metrics.record_send_timeout();
        } else {
            self.metrics.record_failed();
        }
        self.checkpoints.complete(batch);
    }

    /// Redrives a batch a channel failed, or reports the failure when the
    /// error is final or the attempt budget is spent.
    async fn fail_or_redrive(&self, batch: Arc<EventBatch>, error: Arc<HecError>) {
        if batch.is_reported() {
            return;
        }
        let attempts = batch.attempts();
        if !self.closed.load(Ordering::Acquire) && self.retry_policy.should_redrive(&error, attempts)
        {
            let delay = self.retry_policy.calculate_delay(attempts);
            self.metrics.record_retry();
            debug!(batch_id = %batch.id(), attempts, delay = ?delay, error = %error, "Redriving batch");
            tokio::time::sleep(delay).await;

            // Timed out while backing off
            if batch.is_reported() {
                return;
            }
            batch.prepare_to_resend();
            if let Err(e) = self.dispatch(&batch).await {
                debug!(batch_id = %batch.id(), error = %e, "Redrive failed");
            }
            return;
        }

        if error.is_retryable() && self.retry_policy.should_give_up(attempts) {
            let exhausted = HecError::MaxRetries {
                batch_id: batch.id(),
                attempts,
                last_error: error.to_string(),
            };
            self.report_failure(&batch, &exhausted);
        } else {
            self.report_failure(&batch, &error);
        }
    }

    fn handle_event(self: &Arc<Self>, event: ChannelEvent) {
        match event {
            ChannelEvent::AckConfirmed { batch, .. } => self.report_acknowledged(&batch),
            ChannelEvent::BatchFailed { batch, error, .. } => {
                let pool = Arc::clone(self);
                tokio::spawn(async move { pool.fail_or_redrive(batch, error).await });
            }
            ChannelEvent::Unresponsive { channel, reason } => {
                self.replace_dead_channel(&channel, reason);
            }
            ChannelEvent::Closed { channel } => {
                if let Err(e) = self.remove_channel(&channel, true) {
                    error!(channel = %channel, error = %e, "Failed to remove closed channel");
                }
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(channels = self.channels.len(), "Closing load balancer");
        self.reaper.stop();
        for channel in self.snapshot() {
            if channel.is_closed() {
                continue;
            }
            if let Err(e) = channel.close() {
                debug!(channel = %channel.id(), error = %e, "Channel already closing");
            }
        }
        self.timeout_checker.quiesce();
    }

    fn close_now(&self) {
        self.closed.store(true, Ordering::Release);
        info!(channels = self.channels.len(), "Closing load balancer now");
        self.reaper.stop();
        for channel in self.snapshot() {
            if let Err(e) = self.remove_channel(channel.id(), true) {
                error!(channel = %channel.id(), error = %e, "Failed to remove channel");
            }
        }
        self.timeout_checker.close_now();
        self.shutdown.cancel();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.reaper.stop();
        self.shutdown.cancel();
    }
}

async fn listen(
    pool: Weak<PoolInner>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(pool) = pool.upgrade() else { break };
                trace!(channel = %event.channel(), "Channel event");
                pool.handle_event(event);
            }
        }
    }
    debug!("Pool event listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Event, LoggingCallbacks};
    use crate::sender::SimulatedFactory;
    use std::time::Duration;
    use url::Url;

    fn settings(urls: &[&str]) -> ConnectionSettings {
        ConnectionSettings {
            urls: urls.iter().map(|u| Url::parse(u).unwrap()).collect(),
            token: "t".to_string(),
            ..ConnectionSettings::default()
        }
    }

    fn batch() -> Arc<EventBatch> {
        let batch = EventBatch::new();
        batch.append(&Event::raw("x")).unwrap();
        Arc::new(batch)
    }

    fn pool_with(settings: ConnectionSettings, factory: SimulatedFactory) -> LoadBalancer {
        let discoverer = Arc::new(StaticDiscoverer::from_urls(&settings.urls));
        LoadBalancer::new(
            Arc::new(settings),
            discoverer,
            Arc::new(factory),
            Arc::new(LoggingCallbacks),
        )
    }

    #[tokio::test]
    async fn test_channels_created_lazily_per_destination() {
        let mut s = settings(&["https://a:8088", "https://b:8088"]);
        s.channels_per_destination = 2;
        s.max_total_channels = 3;
        let pool = pool_with(s, SimulatedFactory::acking(Duration::from_millis(5)));
        assert_eq!(pool.channel_count(), 0);

        pool.send_batch(batch()).await.unwrap();
        assert_eq!(pool.channel_count(), 3);
    }

    #[tokio::test]
    async fn test_no_endpoints_is_an_error() {
        let pool = pool_with(settings(&[]), SimulatedFactory::acking(Duration::ZERO));
        assert!(matches!(
            pool.send_batch(batch()).await,
            Err(HecError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_batches() {
        let pool = pool_with(settings(&["https://a:8088"]), SimulatedFactory::acking(Duration::ZERO));
        pool.close();
        assert!(pool.send_batch(batch()).await.is_err());
    }

    #[tokio::test]
    async fn test_add_channel_respects_cap_unless_forced() {
        let mut s = settings(&["https://a:8088"]);
        s.channels_per_destination = 1;
        s.max_total_channels = 1;
        let pool = pool_with(s, SimulatedFactory::acking(Duration::ZERO));
        let endpoint = Endpoint::parse("https://a:8088").unwrap();

        assert!(pool.add_channel(&endpoint, false).unwrap().is_some());
        assert!(pool.add_channel(&endpoint, false).unwrap().is_none());
        assert!(pool.add_channel(&endpoint, true).unwrap().is_some());
        assert_eq!(pool.channel_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_busy_channel_requires_force() {
        let mut s = settings(&["https://a:8088"]);
        s.channels_per_destination = 1;
        s.ack_poll_interval = Duration::from_secs(60);
        let pool = pool_with(s, SimulatedFactory::lossy());
        pool.send_batch(batch()).await.unwrap();
        let channel = pool.channels().remove(0);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(pool.remove_channel(channel.id(), false).is_err());
        assert!(pool.remove_channel(channel.id(), true).unwrap());
        assert_eq!(pool.channel_count(), 0);
        assert!(channel.is_closed());
        assert!(!pool.remove_channel(channel.id(), true).unwrap());
    }

    #[tokio::test]
    async fn test_close_and_replace_keeps_pool_size() {
        let mut s = settings(&["https://a:8088"]);
        s.channels_per_destination = 2;
        s.ack_poll_interval = Duration::from_millis(10);
        let pool = pool_with(s, SimulatedFactory::acking(Duration::ZERO));
        pool.send_batch(batch()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let old = pool.channels().remove(0);
        pool.close_and_replace(old.id()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(old.is_closed());
        assert!(pool.channel(old.id()).is_none());
        assert_eq!(pool.channel_count(), 2);
        assert_eq!(pool.metrics().snapshot().channels_replaced, 1);
    }

    #[tokio::test]
    async fn test_post_count_tags_batches_in_order() {
        let pool = pool_with(settings(&["https://a:8088"]), SimulatedFactory::acking(Duration::ZERO));
        let first = batch();
        let second = batch();
        pool.send_batch(Arc::clone(&first)).await.unwrap();
        pool.send_batch(Arc::clone(&second)).await.unwrap();

        assert_eq!(first.post_count(), Some(0));
        assert_eq!(second.post_count(), Some(1));
        assert!(first.id() < second.id());
    }
}
