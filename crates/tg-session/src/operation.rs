use std::sync::Arc;
use tracing::debug;

use tg_core::{Operation, ResourceDimension, Result};
use tg_stream::{StreamLease, StreamStatus};

use crate::concurrency::Permit;
use crate::quota::Reservation;
use crate::session::Session;

/// Everything an admitted operation holds: its concurrency permit and the
/// quota it reserved up front.
///
/// Dropping the guard without [`OperationGuard::complete`] (error, panic,
/// dropped future) refunds every reservation and frees the permit.
pub struct OperationGuard {
    session: Arc<Session>,
    operation: Operation,
    reservations: Vec<Reservation>,
    _permit: Permit,
}

impl OperationGuard {
    /// Admit `operation` on `session`, reserving `costs`.
    ///
    /// Order: feature gate, concurrency, quota, rate. A rejection at any step
    /// unwinds the earlier ones, so a refused call is never charged.
    pub(crate) fn admit(
        session: Arc<Session>,
        operation: Operation,
        costs: &[(ResourceDimension, u64)],
    ) -> Result<Self> {
        if let Some(feature) = operation.required_feature() {
            session.require_feature(feature)?;
        }
        let permit = session.concurrency().enter(operation)?;
        let reservations = costs
            .iter()
            .map(|(dim, amount)| session.quota().reserve_scoped(*dim, *amount))
            .collect::<Result<Vec<_>>>()?;
        session.rate().check(operation)?;

        debug!(session_id = %session.id, operation = %operation, "Operation admitted");
        Ok(Self {
            session,
            operation,
            reservations,
            _permit: permit,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Total reserved against `dimension`.
    pub fn reserved(&self, dimension: ResourceDimension) -> u64 {
        self.reservations
            .iter()
            .filter(|r| r.dimension() == Some(dimension))
            .map(Reservation::amount)
            .sum()
    }

    /// Settle the reservations. Dimensions listed in `consumed` keep at most
    /// that much and refund the rest; unlisted dimensions keep the full charge.
    /// Returns the total refunded.
    pub fn complete(self, consumed: &[(ResourceDimension, u64)]) -> u64 {
        let mut refunded = 0;
        let mut remaining: Vec<(ResourceDimension, u64)> = consumed.to_vec();
        for reservation in self.reservations {
            let Some(dimension) = reservation.dimension() else {
                continue;
            };
            match remaining.iter_mut().find(|(d, _)| *d == dimension) {
                Some((_, left)) => {
                    let keep = (*left).min(reservation.amount());
                    *left -= keep;
                    refunded += reservation.commit_partial(keep);
                }
                None => {
                    reservation.commit();
                }
            }
        }
        debug!(
            session_id = %self.session.id,
            operation = %self.operation,
            refunded,
            "Operation completed"
        );
        refunded
    }
}

/// A streaming operation stays admitted for the life of its stream: the
/// permit is held and the reserved charge is kept once the stream ends,
/// however it ends.
impl StreamLease for OperationGuard {
    fn release(self: Box<Self>, status: StreamStatus) {
        debug!(session_id = %self.session.id, operation = %self.operation, %status, "Stream admission released");
        (*self).complete(&[]);
    }
}
