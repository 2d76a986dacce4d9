//! In-process HEC endpoints for exercising the pool without a server.

use super::{HecTransport, TransportFactory};
use crate::channel::AckRequest;
use crate::domain::{AckId, EventBatch, HecError, HecServerError};
use crate::pool::Endpoint;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Issues sequential ack ids and reports each one indexed once
/// `ack_delay` has passed since its post.
#[derive(Debug)]
pub struct SimulatedEndpoints {
    ack_delay: Duration,
    post_latency: Duration,
    next_ack_id: AtomicU64,
    pending: Mutex<HashMap<AckId, Instant>>,
    posts: AtomicU64,
    polls: AtomicU64,
    events: AtomicU64,
}

impl SimulatedEndpoints {
    pub fn new(ack_delay: Duration) -> Self {
        Self {
            ack_delay,
            post_latency: Duration::ZERO,
            next_ack_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            posts: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            events: AtomicU64::new(0),
        }
    }

    pub fn with_post_latency(mut self, latency: Duration) -> Self {
        self.post_latency = latency;
        self
    }

    pub fn post_count(&self) -> u64 {
        self.posts.load(Ordering::Relaxed)
    }

    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn event_count(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    fn accept(&self, batch: &EventBatch) -> AckId {
        let ack_id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(ack_id, Instant::now());
        self.posts.fetch_add(1, Ordering::Relaxed);
        self.events
            .fetch_add(batch.num_events() as u64, Ordering::Relaxed);
        ack_id
    }

    fn indexed(&self, requested: &BTreeSet<AckId>) -> Vec<AckId> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let ready: Vec<AckId> = requested
            .iter()
            .copied()
            .filter(|ack_id| {
                pending
                    .get(ack_id)
                    .is_some_and(|posted| now.saturating_duration_since(*posted) >= self.ack_delay)
            })
            .collect();
        for ack_id in &ready {
            pending.remove(ack_id);
        }
        ready
    }
}

#[async_trait]
impl HecTransport for SimulatedEndpoints {
    async fn post_events(&self, batch: &EventBatch) -> Result<AckId, HecError> {
        if !self.post_latency.is_zero() {
            tokio::time::sleep(self.post_latency).await;
        }
        Ok(self.accept(batch))
    }

    async fn poll_acks(&self, request: &AckRequest) -> Result<Vec<AckId>, HecError> {
        Ok(self.indexed(&request.acks))
    }

    async fn check_health(&self) -> Result<(), HecError> {
        Ok(())
    }
}

/// Accepts every post but never reports anything indexed.
#[derive(Debug, Default)]
pub struct LossyEndpoints {
    next_ack_id: AtomicU64,
    polls: AtomicU64,
}

impl LossyEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post_count(&self) -> u64 {
        self.next_ack_id.load(Ordering::Relaxed)
    }

    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HecTransport for LossyEndpoints {
    async fn post_events(&self, _batch: &EventBatch) -> Result<AckId, HecError> {
        Ok(self.next_ack_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn poll_acks(&self, _request: &AckRequest) -> Result<Vec<AckId>, HecError> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        Ok(Vec::new())
    }

    async fn check_health(&self) -> Result<(), HecError> {
        Ok(())
    }
}

/// Rejects every post with a fixed HEC error code, e.g. 4 (invalid token)
/// or 9 (server busy).
#[derive(Debug)]
pub struct FailingEndpoints {
    code: i32,
    status: u16,
    posts: AtomicU64,
}

impl FailingEndpoints {
    pub fn new(code: i32, status: u16) -> Self {
        Self {
            code,
            status,
            posts: AtomicU64::new(0),
        }
    }

    pub fn invalid_token() -> Self {
        Self::new(4, 403)
    }

    pub fn server_busy() -> Self {
        Self::new(9, 503)
    }

    pub fn post_count(&self) -> u64 {
        self.posts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HecTransport for FailingEndpoints {
    async fn post_events(&self, _batch: &EventBatch) -> Result<AckId, HecError> {
        self.posts.fetch_add(1, Ordering::Relaxed);
        Err(HecError::Server(HecServerError::new(
            self.code,
            "simulated failure",
            self.status,
            "sim://endpoint",
        )))
    }

    async fn poll_acks(&self, _request: &AckRequest) -> Result<Vec<AckId>, HecError> {
        Ok(Vec::new())
    }

    async fn check_health(&self) -> Result<(), HecError> {
        Err(HecError::Server(HecServerError::new(
            self.code,
            "simulated failure",
            self.status,
            "sim://endpoint/health",
        )))
    }
}

/// Like `SimulatedEndpoints`, but every ack id it reports is reported again
/// in the following poll response.
#[derive(Debug)]
pub struct DuplicateAckEndpoints {
    inner: SimulatedEndpoints,
    replay: Mutex<Vec<AckId>>,
}

impl DuplicateAckEndpoints {
    pub fn new(ack_delay: Duration) -> Self {
        Self {
            inner: SimulatedEndpoints::new(ack_delay),
            replay: Mutex::new(Vec::new()),
        }
    }

    /// Starts issuing ack ids at `first`, so tests can aim at a known id.
    pub fn starting_at(self, first: AckId) -> Self {
        self.inner.next_ack_id.store(first, Ordering::Relaxed);
        self
    }

    pub fn post_count(&self) -> u64 {
        self.inner.post_count()
    }
}

#[async_trait]
impl HecTransport for DuplicateAckEndpoints {
    async fn post_events(&self, batch: &EventBatch) -> Result<AckId, HecError> {
        self.inner.post_events(batch).await
    }

    async fn poll_acks(&self, request: &AckRequest) -> Result<Vec<AckId>, HecError> {
        let fresh = self.inner.indexed(&request.acks);
        let mut replay = self.replay.lock();
        let mut response = std::mem::replace(&mut *replay, fresh.clone());
        response.extend(fresh);
        Ok(response)
    }

    async fn check_health(&self) -> Result<(), HecError> {
        Ok(())
    }
}

type MakeTransport = dyn Fn(&Endpoint) -> Arc<dyn HecTransport> + Send + Sync;

/// Factory handing each new channel a transport built by a closure.
pub struct SimulatedFactory {
    make: Box<MakeTransport>,
    created: AtomicUsize,
}

impl SimulatedFactory {
    pub fn new<F>(make: F) -> Self
    where
        F: Fn(&Endpoint) -> Arc<dyn HecTransport> + Send + Sync + 'static,
    {
        Self {
            make: Box::new(make),
            created: AtomicUsize::new(0),
        }
    }

    /// Every channel acks after `ack_delay`.
    pub fn acking(ack_delay: Duration) -> Self {
        Self::new(move |_| Arc::new(SimulatedEndpoints::new(ack_delay)))
    }

    /// No channel ever acks.
    pub fn lossy() -> Self {
        Self::new(|_| Arc::new(LossyEndpoints::new()))
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl TransportFactory for SimulatedFactory {
    fn create(
        &self,
        endpoint: &Endpoint,
        _channel_uuid: Uuid,
    ) -> Result<Arc<dyn HecTransport>, HecError> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok((self.make)(endpoint))
    }
}
