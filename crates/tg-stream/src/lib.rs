//! Ordered, replaceable, multiplexed output streams.
//!
//! A producer appends chunks (or replaces the whole output); every subscriber
//! sees strictly increasing sequence numbers. Late or reconnecting subscribers
//! are caught up with one replace event carrying the cumulative output, and a
//! slow subscriber has its backlog coalesced the same way instead of growing
//! an unbounded queue.

pub mod dispatcher;
pub mod event;
pub mod subscription;
pub mod wire;

pub use dispatcher::{
    ChunkSink, DispatchConfig, StreamDispatcher, StreamHandle, StreamInfo, StreamLease, StreamProducer,
};
pub use event::{StreamEvent, StreamStats, StreamStatus, Transcript};
pub use subscription::Subscription;
pub use wire::{parse_sse_body, FrameStatus, WireFrame};
