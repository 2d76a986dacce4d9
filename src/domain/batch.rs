use super::error::HecError;
use super::ids::{AckId, BatchId};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// HEC JSON envelope for a single event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonEvent {
    pub event: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sourcetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

impl JsonEvent {
    pub fn new(event: Value) -> Self {
        Self {
            event,
            time: None,
            host: None,
            source: None,
            sourcetype: None,
            index: None,
        }
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_sourcetype(mut self, sourcetype: impl Into<String>) -> Self {
        self.sourcetype = Some(sourcetype.into());
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Json(JsonEvent),
    Raw(String),
}

impl Event {
    pub fn json(event: Value) -> Self {
        Self::Json(JsonEvent::new(event))
    }

    pub fn raw(line: impl Into<String>) -> Self {
        Self::Raw(line.into())
    }

    /// Serialized form, always newline terminated.
    pub fn to_bytes(&self) -> Result<Vec<u8>, HecError> {
        let mut out = match self {
            Self::Json(event) => serde_json::to_vec(event)?,
            Self::Raw(line) => line.trim_end_matches('\n').as_bytes().to_vec(),
        };
        out.push(b'\n');
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct BatchState {
    payload: Vec<u8>,
    num_events: usize,
    ack_id: Option<AckId>,
    post_count: Option<u64>,
    flushed: bool,
    acknowledged: bool,
    failed: bool,
    timed_out: bool,
    attempts: u32,
}

/// Unit of delivery. Shared as `Arc<EventBatch>` between the pool, the
/// channel that carries it and the timeout checker.
#[derive(Debug)]
pub struct EventBatch {
    id: BatchId,
    created_at: Instant,
    state: Mutex<BatchState>,
    reported: AtomicBool,
}

impl EventBatch {
    pub fn new() -> Self {
        Self::with_created_at(Instant::now())
    }

    pub fn with_created_at(created_at: Instant) -> Self {
        Self {
            id: BatchId::next(),
            created_at,
            state: Mutex::new(BatchState::default()),
            reported: AtomicBool::new(false),
        }
    }

    pub fn from_events<'a, I>(events: I) -> Result<Self, HecError>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let batch = Self::new();
        for event in events {
            batch.append(event)?;
        }
        Ok(batch)
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn append(&self, event: &Event) -> Result<(), HecError> {
        let bytes = event.to_bytes()?;
        let mut state = self.state.lock();
        if state.flushed {
            return Err(HecError::IllegalState(format!(
                "cannot append to flushed batch {}",
                self.id
            )));
        }
        state.payload.extend_from_slice(&bytes);
        state.num_events += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().payload.is_empty()
    }

    pub fn num_events(&self) -> usize {
        self.state.lock().num_events
    }

    pub fn is_flushable(&self, threshold_bytes: usize) -> bool {
        let state = self.state.lock();
        !state.flushed && state.payload.len() > threshold_bytes
    }

    /// Returns true only when this call moved a non-empty batch into the
    /// flushed state, i.e. the caller owns the post.
    pub fn mark_flushed(&self) -> bool {
        let mut state = self.state.lock();
        if state.flushed || state.payload.is_empty() {
            return false;
        }
        state.flushed = true;
        true
    }

    pub fn is_flushed(&self) -> bool {
        self.state.lock().flushed
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= timeout
    }

    pub fn payload(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.lock().payload)
    }

    pub fn ack_id(&self) -> Option<AckId> {
        self.state.lock().ack_id
    }

    pub fn set_ack_id(&self, ack_id: AckId) -> Result<(), HecError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.ack_id {
            return Err(HecError::IllegalState(format!(
                "batch {} already holds ack id {existing}, refusing {ack_id}",
                self.id
            )));
        }
        state.ack_id = Some(ack_id);
        Ok(())
    }

    pub fn post_count(&self) -> Option<u64> {
        self.state.lock().post_count
    }

    /// Tags the batch with the pool send sequence unless already tagged.
    pub fn set_post_count_if_unset(&self, post_count: u64) -> bool {
        let mut state = self.state.lock();
        if state.post_count.is_some() {
            return false;
        }
        state.post_count = Some(post_count);
        true
    }

    pub fn mark_acknowledged(&self) {
        self.state.lock().acknowledged = true;
    }

    pub fn is_acknowledged(&self) -> bool {
        self.state.lock().acknowledged
    }

    pub fn mark_failed(&self) {
        self.state.lock().failed = true;
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    pub fn mark_timed_out(&self) {
        let mut state = self.state.lock();
        state.timed_out = true;
        state.failed = true;
    }

    pub fn is_timed_out_flag(&self) -> bool {
        self.state.lock().timed_out
    }

    /// Resets the posting state so the batch can be redriven on another
    /// channel. Identity and payload are kept.
    pub fn prepare_to_resend(&self) {
        let mut state = self.state.lock();
        state.flushed = false;
        state.acknowledged = false;
        state.failed = false;
        state.ack_id = None;
    }

    pub fn record_attempt(&self) -> u32 {
        let mut state = self.state.lock();
        state.attempts += 1;
        state.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// One-shot guard: the first caller wins the right to report this
    /// batch's outcome to the caller callbacks.
    pub fn claim_outcome(&self) -> bool {
        self.reported
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_reported(&self) -> bool {
        self.reported.load(Ordering::Acquire)
    }
}

impl Default for EventBatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_after_flush_is_illegal() {
        let batch = EventBatch::new();
        batch.append(&Event::raw("first")).unwrap();
        assert!(batch.mark_flushed());

        let err = batch.append(&Event::raw("second")).unwrap_err();
        assert!(matches!(err, HecError::IllegalState(_)));
        assert_eq!(batch.num_events(), 1);
    }

    #[test]
    fn test_mark_flushed_is_guarded() {
        let empty = EventBatch::new();
        assert!(!empty.mark_flushed());
        assert!(!empty.is_flushed());

        let batch = EventBatch::new();
        batch.append(&Event::raw("x")).unwrap();
        assert!(batch.mark_flushed());
        assert!(!batch.mark_flushed());
    }

    #[test]
    fn test_is_flushable_threshold() {
        let batch = EventBatch::new();
        batch.append(&Event::raw("abcd")).unwrap();
        assert_eq!(batch.len(), 5);
        assert!(batch.is_flushable(4));
        assert!(!batch.is_flushable(5));

        batch.mark_flushed();
        assert!(!batch.is_flushable(0));
    }

    #[test]
    fn test_is_timed_out_boundary() {
        let start = Instant::now();
        let batch = EventBatch::with_created_at(start);
        let timeout = Duration::from_millis(100);

        assert!(!batch.is_timed_out(start + Duration::from_millis(99), timeout));
        assert!(batch.is_timed_out(start + timeout, timeout));
    }

    #[test]
    fn test_json_event_serialization() {
        let event = Event::Json(
            JsonEvent::new(json!({"msg": "hello"}))
                .with_host("web-1")
                .with_sourcetype("app"),
        );
        let bytes = event.to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.ends_with('\n'));
        let parsed: Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(parsed["event"]["msg"], "hello");
        assert_eq!(parsed["host"], "web-1");
        assert!(parsed.get("index").is_none());
    }

    #[test]
    fn test_prepare_to_resend_keeps_identity() {
        let batch = EventBatch::new();
        batch.append(&Event::raw("x")).unwrap();
        batch.mark_flushed();
        batch.set_ack_id(7).unwrap();
        batch.mark_acknowledged();
        let id = batch.id();

        batch.prepare_to_resend();

        assert_eq!(batch.id(), id);
        assert!(!batch.is_flushed());
        assert!(!batch.is_acknowledged());
        assert_eq!(batch.ack_id(), None);
        assert!(batch.mark_flushed());
    }

    #[test]
    fn test_ack_id_set_once() {
        let batch = EventBatch::new();
        batch.set_ack_id(1).unwrap();
        assert!(batch.set_ack_id(2).is_err());
        assert_eq!(batch.ack_id(), Some(1));
    }

    #[test]
    fn test_claim_outcome_once() {
        let batch = EventBatch::new();
        assert!(batch.claim_outcome());
        assert!(!batch.claim_outcome());
        assert!(batch.is_reported());
    }
}
