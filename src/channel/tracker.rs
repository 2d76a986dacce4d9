use super::metrics::ChannelMetrics;
use crate::domain::{AckId, BatchId, ChannelId, EventBatch, HecError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Body of an ack poll: `{"acks":[1,2,3]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequest {
    pub acks: BTreeSet<AckId>,
}

impl AckRequest {
    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn to_json(&self) -> Result<String, HecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Correlates posted batches with server ack ids for one channel.
///
/// A batch lives in `posted` from just before its POST until the server
/// returns an ack id, then in `polled` until a poll confirms it. Moves
/// between the maps happen under `move_lock`; plain lookups do not lock.
#[derive(Debug)]
pub struct AcknowledgementTracker {
    channel: ChannelId,
    posted: DashMap<BatchId, Arc<EventBatch>>,
    polled: DashMap<AckId, Arc<EventBatch>>,
    move_lock: Mutex<()>,
    metrics: Arc<ChannelMetrics>,
}

impl AcknowledgementTracker {
    pub fn new(channel: ChannelId, metrics: Arc<ChannelMetrics>) -> Self {
        Self {
            channel,
            posted: DashMap::new(),
            polled: DashMap::new(),
            move_lock: Mutex::new(()),
            metrics,
        }
    }

    /// Must run before the network call is issued and outside any lock the
    /// transport could re-enter.
    pub fn pre_event_post(&self, batch: &Arc<EventBatch>) {
        self.posted.insert(batch.id(), Arc::clone(batch));
    }

    pub fn handle_event_post_response(
        &self,
        ack_id: AckId,
        batch: &Arc<EventBatch>,
    ) -> Result<(), HecError> {
        let _guard = self.move_lock.lock();

        if self.posted.remove(&batch.id()).is_none() {
            return Err(HecError::IllegalState(format!(
                "channel {}: ack id {ack_id} returned for batch {} which was never posted",
                self.channel,
                batch.id()
            )));
        }
        if self.polled.contains_key(&ack_id) {
            return Err(HecError::IllegalState(format!(
                "channel {}: server reissued ack id {ack_id} while it is still outstanding",
                self.channel
            )));
        }
        batch.set_ack_id(ack_id)?;
        self.polled.insert(ack_id, Arc::clone(batch));
        debug!(channel = %self.channel, batch_id = %batch.id(), ack_id, "Awaiting ack poll");
        Ok(())
    }

    /// Copies the current ack-id key set so serialization never races with
    /// concurrent moves.
    pub fn get_ack_request(&self) -> AckRequest {
        AckRequest {
            acks: self.polled.iter().map(|entry| *entry.key()).collect(),
        }
    }

    /// Retires every confirmed ack id. Ids this tracker does not know are
    /// skipped (duplicate or late poll responses); an ack id that does not
    /// match the batch it maps to is a consistency violation and nothing
    /// is retired.
    pub fn handle_ack_poll_response(
        &self,
        succeeded: &[AckId],
    ) -> Result<Vec<Arc<EventBatch>>, HecError> {
        let _guard = self.move_lock.lock();

        let mut confirmed_ids = HashSet::with_capacity(succeeded.len());
        let mut confirmed = Vec::with_capacity(succeeded.len());
        for &ack_id in succeeded {
            if confirmed_ids.contains(&ack_id) {
                continue;
            }
            let Some(batch) = self.polled.get(&ack_id).map(|entry| Arc::clone(entry.value()))
            else {
                warn!(channel = %self.channel, ack_id, "Ignoring ack for unknown or already retired ack id");
                continue;
            };
            if batch.ack_id() != Some(ack_id) {
                return Err(HecError::IllegalState(format!(
                    "channel {}: ack id {ack_id} maps to batch {} recorded with ack id {:?}",
                    self.channel,
                    batch.id(),
                    batch.ack_id()
                )));
            }
            confirmed_ids.insert(ack_id);
            confirmed.push(batch);
        }

        if !confirmed_ids.is_empty() {
            self.polled.retain(|ack_id, _| !confirmed_ids.contains(ack_id));
        }

        let now = Instant::now();
        for batch in &confirmed {
            batch.mark_acknowledged();
            self.metrics.record_ack(batch, now);
        }
        Ok(confirmed)
    }

    /// Drops a batch from whichever map holds it.
    pub fn cancel(&self, batch: &EventBatch) -> bool {
        let _guard = self.move_lock.lock();
        let mut removed = self.posted.remove(&batch.id()).is_some();
        if let Some(ack_id) = batch.ack_id() {
            removed |= self
                .polled
                .remove_if(&ack_id, |_, held| held.id() == batch.id())
                .is_some();
        }
        removed
    }

    /// Removes and returns every tracked batch.
    pub fn drain(&self) -> Vec<Arc<EventBatch>> {
        let _guard = self.move_lock.lock();
        let mut batches: Vec<_> = self.posted.iter().map(|e| Arc::clone(e.value())).collect();
        batches.extend(self.polled.iter().map(|e| Arc::clone(e.value())));
        self.posted.clear();
        self.polled.clear();
        batches
    }

    pub fn in_flight(&self) -> Vec<Arc<EventBatch>> {
        let _guard = self.move_lock.lock();
        let mut batches: Vec<_> = self.posted.iter().map(|e| Arc::clone(e.value())).collect();
        batches.extend(self.polled.iter().map(|e| Arc::clone(e.value())));
        batches
    }

    pub fn is_posted(&self, id: BatchId) -> bool {
        self.posted.contains_key(&id)
    }

    pub fn is_polled(&self, ack_id: AckId) -> bool {
        self.polled.contains_key(&ack_id)
    }

    pub fn posted_count(&self) -> usize {
        self.posted.len()
    }

    pub fn polled_count(&self) -> usize {
        self.polled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posted.is_empty() && self.polled.is_empty()
    }
}
