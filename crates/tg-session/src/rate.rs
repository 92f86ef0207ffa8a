//! Multi-window sliding-log rate limiter.
//!
//! Every operation has its own set of windows behind one mutex. A call is
//! admitted only if every window has headroom, and is then recorded in all of
//! them; a rejected call is recorded nowhere.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use tg_core::{Clock, GovernError, Operation, RateCeiling, Result, TierPolicy};

#[derive(Debug)]
struct RateWindow {
    ceiling: RateCeiling,
    events: VecDeque<Instant>,
}

impl RateWindow {
    fn new(ceiling: RateCeiling) -> Self {
        Self {
            ceiling,
            events: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        let window = self.ceiling.window();
        while let Some(oldest) = self.events.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Wait until this window has room, or `None` if it has room now.
    fn wait(&self, now: Instant) -> Option<Duration> {
        if self.events.len() < self.ceiling.max_calls as usize {
            return None;
        }
        let window = self.ceiling.window();
        Some(match self.events.front() {
            Some(oldest) => window.saturating_sub(now.saturating_duration_since(*oldest)),
            None => window,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateUsage {
    pub window_ms: u64,
    pub max_calls: u32,
    pub used: usize,
    pub remaining: usize,
}

#[derive(Debug)]
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    operations: HashMap<Operation, Mutex<Vec<RateWindow>>>,
}

impl RateLimiter {
    /// Fails on a zero-length window, which would otherwise admit everything.
    pub fn new(policy: &TierPolicy, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut operations = HashMap::new();
        for op in Operation::ALL {
            let ceilings = policy.rate_for(op);
            if let Some(bad) = ceilings.iter().find(|c| !c.is_valid()) {
                return Err(GovernError::Config(format!("{op}: rate window of {bad} must be positive")));
            }
            let windows = ceilings.iter().copied().map(RateWindow::new).collect();
            operations.insert(op, Mutex::new(windows));
        }
        Ok(Self { clock, operations })
    }

    /// Admit one call of `operation` or say how long to wait.
    pub fn check(&self, operation: Operation) -> Result<()> {
        let Some(windows) = self.operations.get(&operation) else {
            return Ok(());
        };
        let now = self.clock.now();
        let mut windows = windows.lock();

        let mut retry_after: Option<Duration> = None;
        for window in windows.iter_mut() {
            window.prune(now);
            if let Some(wait) = window.wait(now) {
                retry_after = Some(retry_after.map_or(wait, |r| r.max(wait)));
            }
        }
        if let Some(retry_after) = retry_after {
            debug!(operation = %operation, ?retry_after, "Rate limited");
            return Err(GovernError::RateLimited { retry_after });
        }

        for window in windows.iter_mut() {
            window.events.push_back(now);
            debug_assert!(window.events.len() <= window.ceiling.max_calls as usize);
        }
        Ok(())
    }

    pub fn usage(&self, operation: Operation) -> Vec<RateUsage> {
        let Some(windows) = self.operations.get(&operation) else {
            return Vec::new();
        };
        let now = self.clock.now();
        let mut windows = windows.lock();
        windows
            .iter_mut()
            .map(|w| {
                w.prune(now);
                let max = w.ceiling.max_calls as usize;
                RateUsage {
                    window_ms: w.ceiling.window_ms,
                    max_calls: w.ceiling.max_calls,
                    used: w.events.len(),
                    remaining: max.saturating_sub(w.events.len()),
                }
            })
            .collect()
    }

    /// Forget every recorded call.
    pub fn clear(&self) {
        for windows in self.operations.values() {
            windows.lock().iter_mut().for_each(|w| w.events.clear());
        }
    }
}
