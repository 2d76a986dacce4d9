use super::{Config, ConnectionSettings};
use crate::domain::{ConnectionCallbacks, Event, EventBatch, HecError};
use crate::pool::{Discoverer, LoadBalancer, StaticDiscoverer};
use crate::reliability::ConnectionMetrics;
use crate::sender::{HttpTransportFactory, TransportFactory};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Caller-facing entry point: buffers events into batches and hands full
/// batches to the channel pool.
pub struct Connection {
    balancer: LoadBalancer,
    settings: Arc<ConnectionSettings>,
    buffer: Mutex<Option<Arc<EventBatch>>>,
}

impl Connection {
    /// Connection over HTTP to the configured URLs.
    pub fn from_config(
        config: &Config,
        callbacks: Arc<dyn ConnectionCallbacks>,
    ) -> Result<Self, HecError> {
        config.validate()?;
        let settings = Arc::new(config.to_settings()?);
        let transports = Arc::new(HttpTransportFactory::new(Arc::clone(&settings))?);
        let discoverer = Arc::new(StaticDiscoverer::from_urls(&settings.urls));
        info!(
            urls = settings.urls.len(),
            channels_per_destination = settings.channels_per_destination,
            max_total_channels = settings.max_total_channels,
            "Starting hec-forwarder v{}",
            crate::VERSION
        );
        Ok(Self::new(settings, discoverer, transports, callbacks))
    }

    pub fn new(
        settings: Arc<ConnectionSettings>,
        discoverer: Arc<dyn Discoverer>,
        transports: Arc<dyn TransportFactory>,
        callbacks: Arc<dyn ConnectionCallbacks>,
    ) -> Self {
        let balancer = LoadBalancer::new(Arc::clone(&settings), discoverer, transports, callbacks);
        Self {
            balancer,
            settings,
            buffer: Mutex::new(None),
        }
    }

    /// Buffers one event; the batch goes out once it grows past
    /// `event_batch_size` bytes.
    pub async fn send(&self, event: Event) -> Result<(), HecError> {
        if self.balancer.is_closed() {
            return Err(HecError::IllegalState(
                "connection is closed and no longer accepts events".to_string(),
            ));
        }
        let ready = {
            let mut buffer = self.buffer.lock();
            let batch = buffer.get_or_insert_with(|| Arc::new(EventBatch::new()));
            batch.append(&event)?;
            if batch.is_flushable(self.settings.event_batch_size) {
                buffer.take()
            } else {
                None
            }
        };

        match ready {
            Some(batch) => self.balancer.send_batch(batch).await,
            None => Ok(()),
        }
    }

    /// Sends a caller-built batch, bypassing the buffer.
    pub async fn send_batch(&self, batch: Arc<EventBatch>) -> Result<(), HecError> {
        self.balancer.send_batch(batch).await
    }

    /// Sends whatever is buffered.
    pub async fn flush(&self) -> Result<(), HecError> {
        let pending = self.buffer.lock().take();
        match pending {
            Some(batch) if !batch.is_empty() => self.balancer.send_batch(batch).await,
            _ => Ok(()),
        }
    }

    /// Flushes, then stops taking batches. In-flight batches still get
    /// their outcome.
    pub async fn close(&self) -> Result<(), HecError> {
        let flushed = self.flush().await;
        self.balancer.close();
        flushed
    }

    /// Drops everything in flight without callbacks.
    pub fn close_now(&self) {
        if let Some(batch) = self.buffer.lock().take() {
            debug!(batch_id = %batch.id(), events = batch.num_events(), "Discarding buffered batch");
        }
        self.balancer.close_now();
    }

    /// Waits until no batch is in flight or `timeout` passes. Returns
    /// whether the pool drained.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.balancer.unacked_count() > 0 && start.elapsed() < timeout {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let unacked = self.balancer.unacked_count();
        if unacked > 0 {
            warn!(unacked, timeout = ?timeout, "Connection did not drain in time");
            return false;
        }
        true
    }

    pub fn buffered_events(&self) -> usize {
        self.buffer
            .lock()
            .as_ref()
            .map_or(0, |batch| batch.num_events())
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        self.balancer.metrics()
    }

    pub fn settings(&self) -> &Arc<ConnectionSettings> {
        &self.settings
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.balancer
    }
}
