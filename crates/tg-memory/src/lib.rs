//! Tollgate memory store.
//!
//! A per-session cache that answers both exact-key lookups and similarity
//! queries over embedded content, evicting by a blend of importance and
//! recency once it outgrows its capacity.

pub mod error;
pub mod index;
pub mod persist;
pub mod record;
pub mod store;

pub use error::{MemoryError, Result};
pub use index::{DistanceMetric, FlatIndex};
pub use persist::{JsonlPersistence, MemoryPersistence};
pub use record::{MemoryRecord, RecordId};
pub use store::{MemoryStore, PutOutcome, StoreConfig};
