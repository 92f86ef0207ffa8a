//! Per-session quota ledger.
//!
//! One counter per metered dimension, each behind its own lock, so charging
//! tokens never waits on a storage charge. Periodic windows reset lazily: every
//! access compares the clock with the window start and zeroes `used` once a
//! boundary has passed. Each reset bumps the window epoch; receipts remember
//! the epoch they were charged in so a late refund cannot eat into a fresh
//! window.
//!
//! `concurrent_operations` is not a ledger counter. Its limit is enforced by
//! the concurrency guard.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use tg_core::{Clock, GovernError, QuotaPolicy, QuotaWindow, ResourceDimension, Result};

/// Proof of a successful reservation.
#[derive(Debug, PartialEq, Eq)]
pub struct Receipt {
    pub dimension: ResourceDimension,
    pub amount: u64,
    epoch: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub pct: f64,
    pub window: QuotaWindow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_in_secs: Option<u64>,
}

impl QuotaUsage {
    pub fn new(used: u64, limit: u64, window: QuotaWindow) -> Self {
        let pct = if limit == 0 {
            100.0
        } else {
            used as f64 / limit as f64 * 100.0
        };
        Self {
            used,
            limit,
            remaining: limit.saturating_sub(used),
            pct,
            window,
            resets_in_secs: None,
        }
    }
}

#[derive(Debug)]
struct QuotaCounter {
    limit: u64,
    used: u64,
    window: QuotaWindow,
    window_start: Instant,
    epoch: u64,
}

impl QuotaCounter {
    /// Zero the counter if the current window has ended.
    fn roll(&mut self, now: Instant) -> bool {
        let Some(period) = self.window.period() else {
            return false;
        };
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < period {
            return false;
        }
        // keep windows aligned to the first window start
        let into_window = elapsed.as_nanos() % period.as_nanos();
        self.window_start = now - Duration::from_nanos(into_window as u64);
        self.used = 0;
        self.epoch += 1;
        true
    }

    fn usage(&self, now: Instant) -> QuotaUsage {
        let mut usage = QuotaUsage::new(self.used, self.limit, self.window);
        usage.resets_in_secs = self
            .window
            .period()
            .map(|p| p.saturating_sub(now.saturating_duration_since(self.window_start)).as_secs());
        usage
    }

    fn refund(&mut self, amount: u64) -> u64 {
        let refunded = amount.min(self.used);
        self.used -= refunded;
        refunded
    }
}

#[derive(Debug)]
pub struct QuotaLedger {
    clock: Arc<dyn Clock>,
    counters: BTreeMap<ResourceDimension, Mutex<QuotaCounter>>,
}

impl QuotaLedger {
    pub fn new(quotas: &BTreeMap<ResourceDimension, QuotaPolicy>, clock: Arc<dyn Clock>) -> Self {
        let start = clock.now();
        let counters = quotas
            .iter()
            .filter(|(dim, _)| **dim != ResourceDimension::ConcurrentOperations)
            .map(|(dim, policy)| {
                let counter = QuotaCounter {
                    limit: policy.limit,
                    used: 0,
                    window: policy.window,
                    window_start: start,
                    epoch: 0,
                };
                (*dim, Mutex::new(counter))
            })
            .collect();
        Self { clock, counters }
    }

    pub fn is_metered(&self, dimension: ResourceDimension) -> bool {
        self.counters.contains_key(&dimension)
    }

    fn counter(&self, dimension: ResourceDimension) -> Result<&Mutex<QuotaCounter>> {
        self.counters
            .get(&dimension)
            .ok_or(GovernError::DimensionNotMetered { dimension })
    }

    /// Charge `amount` against `dimension`, or reject without charging.
    pub fn reserve(&self, dimension: ResourceDimension, amount: u64) -> Result<Receipt> {
        let mut counter = self.counter(dimension)?.lock();
        counter.roll(self.clock.now());

        let fits = counter
            .used
            .checked_add(amount)
            .is_some_and(|total| total <= counter.limit);
        if !fits {
            return Err(GovernError::QuotaExceeded {
                dimension,
                used: counter.used,
                limit: counter.limit,
            });
        }
        counter.used += amount;
        debug_assert!(counter.used <= counter.limit);
        debug!(dimension = %dimension, amount, used = counter.used, limit = counter.limit, "Reserved quota");
        Ok(Receipt {
            dimension,
            amount,
            epoch: counter.epoch,
        })
    }

    /// Refund the whole receipt. Returns the amount given back.
    pub fn release(&self, receipt: Receipt) -> u64 {
        self.release_unused(receipt, 0)
    }

    /// Keep `consumed` of the receipt and refund the rest.
    pub fn release_unused(&self, receipt: Receipt, consumed: u64) -> u64 {
        let unused = receipt.amount.saturating_sub(consumed);
        if unused == 0 {
            return 0;
        }
        let Ok(counter) = self.counter(receipt.dimension) else {
            return 0;
        };
        let mut counter = counter.lock();
        counter.roll(self.clock.now());
        if counter.epoch != receipt.epoch {
            // the charge went away with the old window
            return 0;
        }
        counter.refund(unused)
    }

    /// Give back `amount` charged earlier in the current window, clamped at
    /// zero. Used when a charged resource (stored bytes) is freed later.
    pub fn refund(&self, dimension: ResourceDimension, amount: u64) -> Result<u64> {
        let mut counter = self.counter(dimension)?.lock();
        counter.roll(self.clock.now());
        Ok(counter.refund(amount))
    }

    /// Reservation that refunds itself unless committed.
    pub fn reserve_scoped(self: &Arc<Self>, dimension: ResourceDimension, amount: u64) -> Result<Reservation> {
        let receipt = self.reserve(dimension, amount)?;
        Ok(Reservation {
            ledger: Arc::clone(self),
            receipt: Some(receipt),
        })
    }

    pub fn usage(&self, dimension: ResourceDimension) -> Result<QuotaUsage> {
        let now = self.clock.now();
        let mut counter = self.counter(dimension)?.lock();
        counter.roll(now);
        Ok(counter.usage(now))
    }

    pub fn snapshot(&self) -> BTreeMap<ResourceDimension, QuotaUsage> {
        let now = self.clock.now();
        self.counters
            .iter()
            .map(|(dim, counter)| {
                let mut counter = counter.lock();
                counter.roll(now);
                (*dim, counter.usage(now))
            })
            .collect()
    }

    /// Roll every counter whose window has ended; returns how many reset.
    pub fn reset_expired(&self) -> usize {
        let now = self.clock.now();
        self.counters.values().filter(|c| c.lock().roll(now)).count()
    }

    /// Zero every counter and invalidate outstanding receipts.
    pub fn clear(&self) {
        for counter in self.counters.values() {
            let mut counter = counter.lock();
            counter.used = 0;
            counter.epoch += 1;
        }
    }
}

/// Scoped reservation: refunds on drop unless settled.
#[derive(Debug)]
pub struct Reservation {
    ledger: Arc<QuotaLedger>,
    receipt: Option<Receipt>,
}

impl Reservation {
    pub fn dimension(&self) -> Option<ResourceDimension> {
        self.receipt.as_ref().map(|r| r.dimension)
    }

    pub fn amount(&self) -> u64 {
        self.receipt.as_ref().map_or(0, |r| r.amount)
    }

    /// Keep the full charge.
    pub fn commit(mut self) -> u64 {
        self.receipt.take().map_or(0, |r| r.amount)
    }

    /// Keep `consumed` and refund the rest. Returns the refunded amount.
    pub fn commit_partial(mut self, consumed: u64) -> u64 {
        match self.receipt.take() {
            Some(receipt) => self.ledger.release_unused(receipt, consumed),
            None => 0,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(receipt) = self.receipt.take() {
            let dimension = receipt.dimension;
            let refunded = self.ledger.release(receipt);
            debug!(dimension = %dimension, refunded, "Rolled back quota reservation");
        }
    }
}
