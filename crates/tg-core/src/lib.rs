//! Shared vocabulary for Tollgate: tiers, operations, resource dimensions,
//! the error taxonomy, configuration, and the clock abstraction.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    MemoryConfig, QuotaPolicy, ServerConfig, SessionConfig, StreamConfig, TierPolicy,
    TollgateConfig,
};
pub use error::{GovernError, Result};
pub use types::{Feature, Operation, QuotaWindow, RateCeiling, ResourceDimension, Tier};
