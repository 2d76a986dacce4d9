use crate::domain::{BatchId, ConnectionCallbacks, EventBatch, HecError};
use crate::pool::CheckpointManager;
use crate::reliability::ConnectionMetrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Fails batches that were not acknowledged within the ack timeout.
///
/// The periodic check starts with the first tracked batch. After `quiesce`
/// it keeps running until nothing is left to track and then ends itself.
pub struct TimeoutChecker {
    inner: Arc<TimeoutInner>,
}

struct TimeoutInner {
    batches: DashMap<BatchId, Arc<EventBatch>>,
    timeout: Duration,
    interval: Duration,
    task: Mutex<Option<CancellationToken>>,
    quiesced: AtomicBool,
    callbacks: Arc<dyn ConnectionCallbacks>,
    checkpoints: Arc<CheckpointManager>,
    metrics: Arc<ConnectionMetrics>,
}

impl TimeoutChecker {
    pub fn new(
        timeout: Duration,
        callbacks: Arc<dyn ConnectionCallbacks>,
        checkpoints: Arc<CheckpointManager>,
        metrics: Arc<ConnectionMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(TimeoutInner {
                batches: DashMap::new(),
                timeout,
                interval: timeout.min(MAX_CHECK_INTERVAL),
                task: Mutex::new(None),
                quiesced: AtomicBool::new(false),
                callbacks,
                checkpoints,
                metrics,
            }),
        }
    }

    pub fn add(&self, batch: &Arc<EventBatch>) {
        self.inner.batches.insert(batch.id(), Arc::clone(batch));
        self.ensure_started();
    }

    pub fn cancel(&self, batch_id: BatchId) -> bool {
        self.inner.batches.remove(&batch_id).is_some()
    }

    /// Runs one check at `now`; returns how many batches timed out.
    pub fn check_timeouts(&self, now: Instant) -> usize {
        self.inner.check_timeouts(now)
    }

    pub fn quiesce(&self) {
        self.inner.quiesced.store(true, Ordering::Release);
        if self.inner.batches.is_empty() {
            self.inner.stop_task();
        }
        debug!(tracked = self.inner.batches.len(), "Timeout checker quiesced");
    }

    /// Stops checking and forgets every tracked batch without reporting it.
    pub fn close_now(&self) {
        self.inner.quiesced.store(true, Ordering::Release);
        self.inner.batches.clear();
        self.inner.stop_task();
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.batches.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.task.lock().is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn check_interval(&self) -> Duration {
        self.inner.interval
    }

    fn ensure_started(&self) {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *task = Some(cancel.clone());
        tokio::spawn(run(Arc::downgrade(&self.inner), cancel, self.inner.interval));
    }
}

impl Drop for TimeoutChecker {
    fn drop(&mut self) {
        self.inner.stop_task();
    }
}

impl TimeoutInner {
    fn check_timeouts(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        self.batches.retain(|_, batch| {
            if batch.is_failed() || batch.is_reported() {
                return false;
            }
            if batch.is_timed_out(now, self.timeout) {
                expired.push(Arc::clone(batch));
                return false;
            }
            true
        });

        let mut reported = 0;
        for batch in expired {
            batch.mark_timed_out();
            if !batch.claim_outcome() {
                continue;
            }
            let error = HecError::AckTimeout {
                batch_id: batch.id(),
                timeout: self.timeout,
            };
            warn!(batch_id = %batch.id(), timeout = ?self.timeout, "Batch not acknowledged in time");
            self.callbacks.failed(&batch, &error);
            self.metrics.record_timed_out();
            self.checkpoints.complete(&batch);
            reported += 1;
        }
        reported
    }

    fn stop_task(&self) {
        if let Some(cancel) = self.task.lock().take() {
            cancel.cancel();
        }
    }

    fn is_drained(&self) -> bool {
        self.quiesced.load(Ordering::Acquire) && self.batches.is_empty()
    }
}

async fn run(inner: Weak<TimeoutInner>, cancel: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.check_timeouts(Instant::now());
                if inner.is_drained() {
                    inner.stop_task();
                    break;
                }
            }
        }
    }
    debug!("Timeout checker stopped");
}
