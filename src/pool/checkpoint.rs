use crate::domain::{BatchId, ConnectionCallbacks, EventBatch};
use crate::reliability::ConnectionMetrics;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug)]
struct Pending {
    batch: Arc<EventBatch>,
    done: bool,
}

#[derive(Debug, Default)]
struct Window {
    pending: BTreeMap<BatchId, Pending>,
    highwater: Option<BatchId>,
}

/// Turns per-batch outcomes into ordered checkpoint callbacks.
///
/// With checkpoints enabled, `checkpoint` fires for a batch only once every
/// earlier registered batch has an outcome too, so the caller can persist
/// a single highwater mark. Disabled, each batch is checkpointed as soon as
/// its outcome is known.
pub struct CheckpointManager {
    enabled: bool,
    window: Mutex<Window>,
    delivery: Mutex<()>,
    callbacks: Arc<dyn ConnectionCallbacks>,
    metrics: Arc<ConnectionMetrics>,
}

impl CheckpointManager {
    pub fn new(
        enabled: bool,
        callbacks: Arc<dyn ConnectionCallbacks>,
        metrics: Arc<ConnectionMetrics>,
    ) -> Self {
        Self {
            enabled,
            window: Mutex::new(Window::default()),
            delivery: Mutex::new(()),
            callbacks,
            metrics,
        }
    }

    /// Idempotent, so redriven batches keep their original slot.
    pub fn register(&self, batch: &Arc<EventBatch>) {
        if !self.enabled {
            return;
        }
        let mut window = self.window.lock();
        window.pending.entry(batch.id()).or_insert_with(|| Pending {
            batch: Arc::clone(batch),
            done: false,
        });
        self.metrics.set_pending_checkpoints(window.pending.len());
    }

    pub fn complete(&self, batch: &EventBatch) {
        if !self.enabled {
            self.callbacks.checkpoint(batch);
            self.metrics.record_checkpoint();
            return;
        }

        // Serializes delivery so callbacks see ids in ascending order
        let _delivery = self.delivery.lock();
        let ready = {
            let mut window = self.window.lock();
            match window.pending.get_mut(&batch.id()) {
                Some(entry) => entry.done = true,
                None => return,
            }

            let mut ready = Vec::new();
            while let Some(entry) = window.pending.first_entry() {
                if !entry.get().done {
                    break;
                }
                ready.push(entry.remove().batch);
            }
            if let Some(last) = ready.last() {
                window.highwater = Some(last.id());
            }
            self.metrics.set_pending_checkpoints(window.pending.len());
            ready
        };

        for batch in &ready {
            trace!(batch_id = %batch.id(), "Checkpoint");
            self.callbacks.checkpoint(batch);
            self.metrics.record_checkpoint();
        }
    }

    pub fn highwater(&self) -> Option<BatchId> {
        self.window.lock().highwater
    }

    pub fn pending_count(&self) -> usize {
        self.window.lock().pending.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Event, HecError};

    #[derive(Default)]
    struct Recorder {
        checkpoints: Mutex<Vec<BatchId>>,
    }

    impl ConnectionCallbacks for Recorder {
        fn acknowledged(&self, _batch: &EventBatch) {}
        fn failed(&self, _batch: &EventBatch, _error: &HecError) {}
        fn checkpoint(&self, batch: &EventBatch) {
            self.checkpoints.lock().push(batch.id());
        }
    }

    fn batch() -> Arc<EventBatch> {
        let batch = EventBatch::new();
        batch.append(&Event::raw("x")).unwrap();
        Arc::new(batch)
    }

    #[test]
    fn test_checkpoints_slide_in_order() {
        let recorder = Arc::new(Recorder::default());
        let manager = CheckpointManager::new(
            true,
            recorder.clone(),
            Arc::new(ConnectionMetrics::new()),
        );
        assert!(manager.is_enabled());
        let batches: Vec<_> = (0..3).map(|_| batch()).collect();
        for b in &batches {
            manager.register(b);
        }

        manager.complete(&batches[2]);
        manager.complete(&batches[1]);
        assert!(recorder.checkpoints.lock().is_empty());
        assert_eq!(manager.highwater(), None);

        manager.complete(&batches[0]);
        let ids: Vec<_> = batches.iter().map(|b| b.id()).collect();
        assert_eq!(*recorder.checkpoints.lock(), ids);
        assert_eq!(manager.highwater(), Some(batches[2].id()));
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_disabled_checkpoints_are_immediate() {
        let recorder = Arc::new(Recorder::default());
        let metrics = Arc::new(ConnectionMetrics::new());
        let manager = CheckpointManager::new(false, recorder.clone(), Arc::clone(&metrics));
        assert!(!manager.is_enabled());
        let first = batch();
        let second = batch();
        manager.register(&first);
        manager.register(&second);

        manager.complete(&second);
        assert_eq!(*recorder.checkpoints.lock(), vec![second.id()]);
        assert_eq!(metrics.snapshot().checkpoints, 1);
    }

    #[test]
    fn test_register_is_idempotent() {
        let recorder = Arc::new(Recorder::default());
        let manager =
            CheckpointManager::new(true, recorder.clone(), Arc::new(ConnectionMetrics::new()));
        let b = batch();
        manager.register(&b);
        manager.register(&b);
        assert_eq!(manager.pending_count(), 1);

        manager.complete(&b);
        manager.complete(&b);
        assert_eq!(recorder.checkpoints.lock().len(), 1);
    }
}
