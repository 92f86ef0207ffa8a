use futures::Stream;
use std::sync::Arc;
use std::time::Duration;

use tg_core::{GovernError, Result};

use crate::dispatcher::{Slot, StreamShared};
use crate::event::StreamEvent;

/// Consumer end of a stream. Yields events in sequence order and ends after
/// the terminal event. Dropping it detaches from the stream.
pub struct Subscription {
    stream: Arc<StreamShared>,
    slot: Arc<Slot>,
}

impl Subscription {
    pub(crate) fn new(stream: Arc<StreamShared>, slot: Arc<Slot>) -> Self {
        Self { stream, slot }
    }

    pub fn stream_id(&self) -> &str {
        self.stream.id()
    }

    /// Next event, or `None` once the terminal event has been consumed.
    pub async fn next(&self) -> Option<StreamEvent> {
        loop {
            let notified = self.slot.notify.notified();
            {
                let mut queue = self.slot.queue.lock();
                if let Some(event) = queue.pending.pop_front() {
                    return Some(event);
                }
                if queue.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub async fn next_timeout(&self, timeout: Duration) -> Result<Option<StreamEvent>> {
        tokio::time::timeout(timeout, self.next())
            .await
            .map_err(|_| GovernError::StreamTimeout(timeout))
    }

    /// Non-blocking poll of the mailbox.
    pub fn try_next(&self) -> Option<StreamEvent> {
        self.slot.queue.lock().pending.pop_front()
    }

    pub fn is_closed(&self) -> bool {
        let queue = self.slot.queue.lock();
        queue.closed && queue.pending.is_empty()
    }

    /// Times this subscriber fell behind and had its backlog collapsed.
    pub fn coalesced(&self) -> u64 {
        self.slot.queue.lock().coalesced
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        futures::stream::unfold(self, |sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stream.detach(self.slot.id);
    }
}
