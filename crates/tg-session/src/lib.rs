//! Session lifecycle and resource governance: quota ledger, rate limiter,
//! concurrency guard, and the registry that composes them per session.

pub mod concurrency;
pub mod operation;
pub mod quota;
pub mod rate;
pub mod registry;
pub mod session;

pub use concurrency::{ConcurrencyGuard, Permit};
pub use operation::OperationGuard;
pub use quota::{QuotaLedger, QuotaUsage, Receipt, Reservation};
pub use rate::{RateLimiter, RateUsage};
pub use registry::{SessionRegistry, SweepReport, SweeperHandle};
pub use session::{Session, SessionInfo, SessionStatus};

#[cfg(test)]
mod tests;
