use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use tg_core::{GovernError, Operation, Result};

/// Caps simultaneous operations per operation kind and per session.
///
/// Each operation kind has its own semaphore; a session-wide semaphore sits
/// on top. A call needs a permit from both.
#[derive(Debug)]
pub struct ConcurrencyGuard {
    per_operation_limit: usize,
    total_limit: usize,
    per_operation: HashMap<Operation, Arc<Semaphore>>,
    total: Arc<Semaphore>,
}

fn capped(limit: usize) -> usize {
    limit.min(Semaphore::MAX_PERMITS)
}

impl ConcurrencyGuard {
    pub fn new(per_operation_limit: usize, total_limit: usize) -> Self {
        let per_operation_limit = capped(per_operation_limit);
        let total_limit = capped(total_limit);
        let per_operation = Operation::ALL
            .into_iter()
            .map(|op| (op, Arc::new(Semaphore::new(per_operation_limit))))
            .collect();
        Self {
            per_operation_limit,
            total_limit,
            per_operation,
            total: Arc::new(Semaphore::new(total_limit)),
        }
    }

    /// Take a slot for `operation` without waiting.
    pub fn enter(&self, operation: Operation) -> Result<Permit> {
        let semaphore = self
            .per_operation
            .get(&operation)
            .ok_or_else(|| GovernError::Config(format!("no concurrency slots for {operation}")))?;
        let operation_slot = semaphore.clone().try_acquire_owned().map_err(|_| {
            GovernError::ConcurrencyExceeded {
                operation,
                in_flight: self.in_flight(operation),
                limit: self.per_operation_limit,
            }
        })?;
        // on failure `operation_slot` drops and hands its permit back
        let session_slot = self.total.clone().try_acquire_owned().map_err(|_| {
            GovernError::ConcurrencyExceeded {
                operation,
                in_flight: self.in_flight_total(),
                limit: self.total_limit,
            }
        })?;
        debug!(operation = %operation, in_flight = self.in_flight(operation), "Entered operation");
        Ok(Permit {
            operation,
            _operation_slot: operation_slot,
            _session_slot: session_slot,
        })
    }

    pub fn in_flight(&self, operation: Operation) -> usize {
        self.per_operation
            .get(&operation)
            .map(|s| self.per_operation_limit - s.available_permits())
            .unwrap_or(0)
    }

    pub fn in_flight_total(&self) -> usize {
        self.total_limit - self.total.available_permits()
    }

    pub fn per_operation_limit(&self) -> usize {
        self.per_operation_limit
    }

    pub fn total_limit(&self) -> usize {
        self.total_limit
    }
}

/// One in-flight slot. Both semaphore permits go back when it is dropped.
#[derive(Debug)]
pub struct Permit {
    operation: Operation,
    _operation_slot: OwnedSemaphorePermit,
    _session_slot: OwnedSemaphorePermit,
}

impl Permit {
    pub fn operation(&self) -> Operation {
        self.operation
    }
}
