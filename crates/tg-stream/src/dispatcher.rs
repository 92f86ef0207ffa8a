use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use tg_core::{Clock, GovernError, Operation, Result, StreamConfig};

use crate::event::{StreamEvent, StreamStats, StreamStatus};
use crate::subscription::Subscription;

// ============================================================================
// Subscriber slots
// ============================================================================

/// Per-subscriber mailbox. Holds at most `capacity` content events; when full
/// the backlog collapses into a single replace event (coalesce-to-latest).
pub(crate) struct Slot {
    pub(crate) id: u64,
    pub(crate) queue: Mutex<SlotQueue>,
    pub(crate) notify: Notify,
}

#[derive(Default)]
pub(crate) struct SlotQueue {
    pub(crate) pending: VecDeque<StreamEvent>,
    /// No further events will arrive; drain `pending` and stop.
    pub(crate) closed: bool,
    pub(crate) coalesced: u64,
}

impl Slot {
    fn new(id: u64) -> Self {
        Self {
            id,
            queue: Mutex::new(SlotQueue::default()),
            notify: Notify::new(),
        }
    }

    fn deliver(&self, event: &StreamEvent, cumulative: &str, capacity: usize) {
        {
            let mut queue = self.queue.lock();
            if queue.closed {
                return;
            }
            if event.terminal {
                // terminals are never coalesced away
                queue.pending.push_back(event.clone());
                queue.closed = true;
            } else if queue.pending.len() < capacity {
                queue.pending.push_back(event.clone());
            } else {
                queue.pending.clear();
                queue.pending.push_back(StreamEvent::replace(event.sequence, cumulative));
                queue.coalesced += 1;
            }
        }
        self.notify.notify_one();
    }
}

// ============================================================================
// Shared stream state
// ============================================================================

pub(crate) struct StreamShared {
    id: String,
    session_id: String,
    operation: Operation,
    capacity: usize,
    clock: Arc<dyn Clock>,
    next_slot: AtomicU64,
    state: Mutex<StreamState>,
}

/// Whatever a stream holds on behalf of its session (a concurrency slot, a
/// quota charge). Released exactly once, when the stream reaches a terminal
/// status.
pub trait StreamLease: Send + Sync {
    fn release(self: Box<Self>, status: StreamStatus);
}

struct StreamState {
    /// Last sequence handed out, terminal included.
    sequence: u64,
    /// Sequence of the last content (non-terminal) event.
    content_sequence: u64,
    cumulative: String,
    status: StreamStatus,
    terminal: Option<StreamEvent>,
    slots: Vec<Arc<Slot>>,
    stats: StreamStats,
    /// Set while paused output is held back: the sequence and cumulative
    /// output subscribers had last been given.
    released: Option<(u64, String)>,
    lease: Option<Box<dyn StreamLease>>,
}

impl StreamState {
    /// Catch every subscriber up with one replace carrying the held output.
    fn flush_held(&mut self, capacity: usize) {
        if self.released.take().is_none() {
            return;
        }
        let event = StreamEvent::replace(self.content_sequence, self.cumulative.clone());
        for slot in &self.slots {
            slot.deliver(&event, &self.cumulative, capacity);
        }
    }
}

impl StreamShared {
    fn push_content(&self, payload: &str, replace: bool) -> Result<u64> {
        let mut state = self.state.lock();
        if state.status.is_finished() {
            return Err(GovernError::StreamTerminated { stream_id: self.id.clone() });
        }
        let paused = state.status == StreamStatus::Paused;
        if paused && state.released.is_none() {
            state.released = Some((state.content_sequence, state.cumulative.clone()));
        }

        state.sequence += 1;
        let sequence = state.sequence;
        state.content_sequence = sequence;
        if replace {
            state.cumulative.clear();
        }
        state.cumulative.push_str(payload);
        state.stats.events_emitted += 1;
        state.stats.bytes_emitted += payload.len() as u64;
        state.stats.last_emit_at = Some(self.clock.utc());

        if paused {
            return Ok(sequence);
        }
        let event = if replace {
            StreamEvent::replace(sequence, payload)
        } else {
            StreamEvent::delta(sequence, payload)
        };
        for slot in &state.slots {
            slot.deliver(&event, &state.cumulative, self.capacity);
        }
        Ok(sequence)
    }

    fn finish(&self, status: StreamStatus, error: Option<String>) -> Result<u64> {
        let (sequence, subscribers, lease) = {
            let mut state = self.state.lock();
            if state.status.is_finished() {
                return Err(GovernError::StreamTerminated { stream_id: self.id.clone() });
            }
            state.flush_held(self.capacity);

            state.sequence += 1;
            let sequence = state.sequence;
            let event = match error {
                Some(err) => StreamEvent::failed(sequence, err),
                None => StreamEvent::completed(sequence),
            };
            state.status = status;
            state.terminal = Some(event.clone());
            state.stats.finished_at = Some(self.clock.utc());

            let slots = std::mem::take(&mut state.slots);
            for slot in &slots {
                slot.deliver(&event, &state.cumulative, self.capacity);
            }
            (sequence, slots.len(), state.lease.take())
        };
        if let Some(lease) = lease {
            lease.release(status);
        }
        debug!(
            stream_id = %self.id,
            session_id = %self.session_id,
            status = %status,
            subscribers,
            "Stream finished"
        );
        Ok(sequence)
    }

    /// Hold delivery. `Ok(false)` if already paused.
    fn pause(&self) -> Result<bool> {
        let mut state = self.state.lock();
        match state.status {
            StreamStatus::Open => {
                state.status = StreamStatus::Paused;
                debug!(stream_id = %self.id, "Stream paused");
                Ok(true)
            }
            StreamStatus::Paused => Ok(false),
            _ => Err(GovernError::StreamTerminated { stream_id: self.id.clone() }),
        }
    }

    /// Resume delivery; output produced meanwhile arrives as one replace
    /// event. `Ok(false)` if the stream was not paused.
    fn resume(&self) -> Result<bool> {
        let mut state = self.state.lock();
        match state.status {
            StreamStatus::Paused => {
                state.status = StreamStatus::Open;
                state.flush_held(self.capacity);
                debug!(stream_id = %self.id, "Stream resumed");
                Ok(true)
            }
            StreamStatus::Open => Ok(false),
            _ => Err(GovernError::StreamTerminated { stream_id: self.id.clone() }),
        }
    }

    /// New subscriber, caught up to the current cumulative output.
    pub(crate) fn attach(self: &Arc<Self>) -> Subscription {
        let slot = Arc::new(Slot::new(self.next_slot.fetch_add(1, Ordering::Relaxed)));
        let mut state = self.state.lock();
        {
            let mut queue = slot.queue.lock();
            // a paused stream shows joiners only what it had released
            let (sequence, output) = match &state.released {
                Some((sequence, output)) => (*sequence, output),
                None => (state.content_sequence, &state.cumulative),
            };
            if sequence > 0 {
                queue.pending.push_back(StreamEvent::replace(sequence, output.clone()));
            }
            if let Some(terminal) = &state.terminal {
                queue.pending.push_back(terminal.clone());
                queue.closed = true;
            }
        }
        if state.terminal.is_none() {
            state.slots.push(slot.clone());
        }
        Subscription::new(self.clone(), slot)
    }

    pub(crate) fn detach(&self, slot_id: u64) {
        self.state.lock().slots.retain(|s| s.id != slot_id);
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> StreamStatus {
        self.state.lock().status
    }

    fn info(&self) -> StreamInfo {
        let state = self.state.lock();
        StreamInfo {
            stream_id: self.id.clone(),
            session_id: self.session_id.clone(),
            operation: self.operation,
            status: state.status,
            sequence: state.sequence,
            cumulative_bytes: state.cumulative.len(),
            subscribers: state.slots.len(),
            tokens_per_second: state.stats.tokens_per_second(),
            stats: state.stats.clone(),
        }
    }
}

/// Snapshot of a stream for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub stream_id: String,
    pub session_id: String,
    pub operation: Operation,
    pub status: StreamStatus,
    pub sequence: u64,
    pub cumulative_bytes: usize,
    pub subscribers: usize,
    pub tokens_per_second: f64,
    pub stats: StreamStats,
}

// ============================================================================
// Handles
// ============================================================================

/// Interface the model-execution side pushes output through.
pub trait ChunkSink: Send + Sync {
    /// Append a chunk to the output.
    fn emit(&self, chunk: &str) -> Result<u64>;

    /// Replace the whole output so far.
    fn replace(&self, content: &str) -> Result<u64>;

    fn complete(&self) -> Result<u64>;

    fn fail(&self, error: &str) -> Result<u64>;
}

/// Cheap, cloneable reference to an open stream.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<StreamShared>,
}

impl StreamHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn operation(&self) -> Operation {
        self.shared.operation
    }

    pub fn status(&self) -> StreamStatus {
        self.shared.status()
    }

    pub fn info(&self) -> StreamInfo {
        self.shared.info()
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.attach()
    }

    pub fn pause(&self) -> Result<bool> {
        self.shared.pause()
    }

    pub fn resume(&self) -> Result<bool> {
        self.shared.resume()
    }

    /// Fail the stream from outside the producer.
    pub fn cancel(&self) -> Result<u64> {
        self.shared.finish(StreamStatus::Cancelled, Some("cancelled".into()))
    }

    /// Wrap in a producer that fails the stream if dropped before finishing.
    pub fn into_producer(self) -> StreamProducer {
        StreamProducer { handle: self }
    }
}

impl ChunkSink for StreamHandle {
    fn emit(&self, chunk: &str) -> Result<u64> {
        self.shared.push_content(chunk, false)
    }

    fn replace(&self, content: &str) -> Result<u64> {
        self.shared.push_content(content, true)
    }

    fn complete(&self) -> Result<u64> {
        self.shared.finish(StreamStatus::Completed, None)
    }

    fn fail(&self, error: &str) -> Result<u64> {
        self.shared.finish(StreamStatus::Failed, Some(error.to_string()))
    }
}

/// Owning producer end. Dropping it while the stream is still open
/// (e.g. the producing task was aborted) fails the stream for every subscriber.
pub struct StreamProducer {
    handle: StreamHandle,
}

impl StreamProducer {
    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }
}

impl ChunkSink for StreamProducer {
    fn emit(&self, chunk: &str) -> Result<u64> {
        self.handle.emit(chunk)
    }

    fn replace(&self, content: &str) -> Result<u64> {
        self.handle.replace(content)
    }

    fn complete(&self) -> Result<u64> {
        self.handle.complete()
    }

    fn fail(&self, error: &str) -> Result<u64> {
        self.handle.fail(error)
    }
}

impl Drop for StreamProducer {
    fn drop(&mut self) {
        if !self.handle.status().is_finished() {
            warn!(stream_id = %self.handle.id(), "Producer dropped before finishing stream");
            let _ = self.handle.shared.finish(StreamStatus::Failed, Some("producer dropped".into()));
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub subscriber_buffer: usize,
    pub retain_finished: usize,
}

impl From<&StreamConfig> for DispatchConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            subscriber_buffer: config.subscriber_buffer.max(1),
            retain_finished: config.retain_finished,
        }
    }
}

/// All streams of one session.
pub struct StreamDispatcher {
    session_id: String,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    streams: RwLock<HashMap<String, StreamHandle>>,
}

impl StreamDispatcher {
    pub fn new(session_id: impl Into<String>, config: DispatchConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            clock,
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub fn open(&self, operation: Operation) -> StreamHandle {
        self.create(operation, None)
    }

    /// Open a stream that holds `lease` until it finishes.
    pub fn open_leased(&self, operation: Operation, lease: Box<dyn StreamLease>) -> StreamHandle {
        self.create(operation, Some(lease))
    }

    fn create(&self, operation: Operation, lease: Option<Box<dyn StreamLease>>) -> StreamHandle {
        self.prune_finished();
        let id = format!("stream_{}", Uuid::new_v4().simple());
        let shared = Arc::new(StreamShared {
            id: id.clone(),
            session_id: self.session_id.clone(),
            operation,
            capacity: self.config.subscriber_buffer.max(1),
            clock: self.clock.clone(),
            next_slot: AtomicU64::new(1),
            state: Mutex::new(StreamState {
                sequence: 0,
                content_sequence: 0,
                cumulative: String::new(),
                status: StreamStatus::Open,
                terminal: None,
                slots: Vec::new(),
                stats: StreamStats::new(self.clock.utc()),
                released: None,
                lease,
            }),
        });
        let handle = StreamHandle { shared };
        self.streams.write().insert(id.clone(), handle.clone());
        debug!(stream_id = %id, session_id = %self.session_id, operation = %operation, "Opened stream");
        handle
    }

    pub fn handle(&self, stream_id: &str) -> Result<StreamHandle> {
        self.streams
            .read()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| GovernError::StreamNotFound { stream_id: stream_id.to_string() })
    }

    pub fn subscribe(&self, stream_id: &str) -> Result<Subscription> {
        Ok(self.handle(stream_id)?.subscribe())
    }

    pub fn emit(&self, stream_id: &str, payload: &str, replace: bool) -> Result<u64> {
        let handle = self.handle(stream_id)?;
        if replace {
            handle.replace(payload)
        } else {
            handle.emit(payload)
        }
    }

    pub fn complete(&self, stream_id: &str) -> Result<u64> {
        self.handle(stream_id)?.complete()
    }

    pub fn fail(&self, stream_id: &str, error: &str) -> Result<u64> {
        self.handle(stream_id)?.fail(error)
    }

    pub fn cancel(&self, stream_id: &str) -> Result<u64> {
        self.handle(stream_id)?.cancel()
    }

    pub fn pause(&self, stream_id: &str) -> Result<bool> {
        self.handle(stream_id)?.pause()
    }

    pub fn resume(&self, stream_id: &str) -> Result<bool> {
        self.handle(stream_id)?.resume()
    }

    pub fn status(&self, stream_id: &str) -> Result<StreamInfo> {
        Ok(self.handle(stream_id)?.info())
    }

    pub fn list(&self) -> Vec<StreamInfo> {
        self.streams.read().values().map(StreamHandle::info).collect()
    }

    /// Streams still open or paused, oldest first.
    pub fn active(&self) -> Vec<StreamInfo> {
        let mut active: Vec<StreamInfo> = self
            .streams
            .read()
            .values()
            .filter(|h| !h.status().is_finished())
            .map(StreamHandle::info)
            .collect();
        active.sort_by(|a, b| a.stats.opened_at.cmp(&b.stats.opened_at));
        active
    }

    pub fn open_count(&self) -> usize {
        self.streams
            .read()
            .values()
            .filter(|h| !h.status().is_finished())
            .count()
    }

    /// Fail every open stream with `reason`; returns how many were open.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let handles: Vec<StreamHandle> = self.streams.read().values().cloned().collect();
        handles
            .iter()
            .filter(|h| h.shared.finish(StreamStatus::Cancelled, Some(reason.to_string())).is_ok())
            .count()
    }

    /// Forget the oldest finished streams beyond `retain_finished`.
    pub fn prune_finished(&self) -> usize {
        let mut streams = self.streams.write();
        let mut finished: Vec<(chrono::DateTime<chrono::Utc>, String)> = streams
            .values()
            .filter_map(|h| {
                let state = h.shared.state.lock();
                state.stats.finished_at.map(|at| (at, h.shared.id.clone()))
            })
            .collect();
        if finished.len() <= self.config.retain_finished {
            return 0;
        }
        finished.sort();
        let excess = finished.len() - self.config.retain_finished;
        for (_, id) in finished.into_iter().take(excess) {
            streams.remove(&id);
        }
        excess
    }

    /// Drop every stream, failing those still open.
    pub fn clear(&self, reason: &str) {
        self.cancel_all(reason);
        self.streams.write().clear();
    }
}
