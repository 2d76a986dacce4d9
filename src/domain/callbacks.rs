use super::batch::EventBatch;
use super::error::HecError;
use tracing::{debug, error, info, warn};

/// Caller-facing outcome notifications.
///
/// For every batch handed to the pool exactly one of `acknowledged` or
/// `failed` is called. `checkpoint` follows once the outcome has been
/// folded into the connection metrics, in batch id order when checkpoints
/// are enabled.
pub trait ConnectionCallbacks: Send + Sync {
    fn acknowledged(&self, batch: &EventBatch);

    fn failed(&self, batch: &EventBatch, error: &HecError);

    fn checkpoint(&self, _batch: &EventBatch) {}

    /// Out-of-band problems that did not fail a specific batch, such as a
    /// channel being declared dead.
    fn system_warning(&self, _warning: &HecError) {}
}

/// Callbacks that only log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallbacks;

impl ConnectionCallbacks for LoggingCallbacks {
    fn acknowledged(&self, batch: &EventBatch) {
        debug!(batch_id = %batch.id(), events = batch.num_events(), "Batch acknowledged");
    }

    fn failed(&self, batch: &EventBatch, error: &HecError) {
        error!(batch_id = %batch.id(), error = %error, "Batch failed");
    }

    fn checkpoint(&self, batch: &EventBatch) {
        info!(batch_id = %batch.id(), "Checkpoint advanced");
    }

    fn system_warning(&self, warning: &HecError) {
        warn!(warning = %warning, "System warning");
    }
}
