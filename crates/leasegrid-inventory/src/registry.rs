//! Reservation registry — the provider's in-memory capacity ledger.
//!
//! One lock guards both the reservation table and the committed totals,
//! so every mutation is a single critical section: operations on the same
//! order are strictly ordered and the totals can never be observed half
//! updated. Reads (`snapshot`, `status`, `reservation`) share the lock.
//! Nothing in here awaits or performs I/O.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use leasegrid_core::{OrderId, ReservationSummary, ResourceClass, ResourceGroup, ResourceTotals};

use crate::error::{InventoryError, InventoryResult};
use crate::reservation::Reservation;

/// Point-in-time view of inventory usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryStatus {
    pub capacity: ResourceTotals,
    /// Sum of allocated reservations.
    pub committed: ResourceTotals,
    /// Sum of reservations still waiting for their bid to be accepted.
    pub pending: ResourceTotals,
    pub available: ResourceTotals,
    pub reservations: usize,
}

struct Ledger {
    reservations: HashMap<OrderId, Reservation>,
    committed: ResourceTotals,
}

/// Tracks reservations against a fixed advertised capacity.
pub struct ReservationRegistry {
    capacity: ResourceTotals,
    ledger: RwLock<Ledger>,
}

impl ReservationRegistry {
    pub fn new(capacity: ResourceTotals) -> Self {
        Self {
            capacity,
            ledger: RwLock::new(Ledger {
                reservations: HashMap::new(),
                committed: ResourceTotals::default(),
            }),
        }
    }

    pub fn capacity(&self) -> ResourceTotals {
        self.capacity
    }

    /// Record an unallocated reservation if the group fits in the
    /// currently uncommitted capacity.
    ///
    /// Other unallocated reservations are not counted; `allocate` makes
    /// the binding decision.
    pub fn reserve(&self, order: OrderId, group: ResourceGroup) -> InventoryResult<Reservation> {
        let mut ledger = self.write();
        if ledger.reservations.contains_key(&order) {
            return Err(InventoryError::AlreadyReserved(order));
        }

        let reservation = Reservation::new(order.clone(), group);
        let headroom = self.capacity.saturating_sub(&ledger.committed);
        if let Some(class) = reservation.demand().exceeding_class(&headroom) {
            warn!(%order, %class, "order does not fit, not reserving");
            return Err(InventoryError::InsufficientCapacity { order, class });
        }

        info!(
            %order,
            endpoint_quantity = reservation.endpoint_quantity(),
            "reservation created"
        );
        ledger.reservations.insert(order, reservation.clone());
        Ok(reservation)
    }

    /// Commit a reservation's resources against the running totals.
    ///
    /// Capacity is re-checked here: two orders may both pass `reserve`
    /// but only those that still fit are committed. Allocating an
    /// already allocated reservation succeeds without change.
    pub fn allocate(&self, order: &OrderId) -> InventoryResult<()> {
        let mut guard = self.write();
        let ledger = &mut *guard;
        let reservation = ledger
            .reservations
            .get_mut(order)
            .ok_or_else(|| InventoryError::NotFound(order.clone()))?;

        if reservation.allocated() {
            debug!(%order, "reservation already allocated");
            return Ok(());
        }

        let demand = *reservation.demand();
        let committed = match ledger.committed.checked_add(&demand) {
            Some(sum) => sum,
            None => {
                let class = demand
                    .exceeding_class(&self.capacity.saturating_sub(&ledger.committed))
                    .unwrap_or(ResourceClass::Cpu);
                return Err(InventoryError::InsufficientCapacity {
                    order: order.clone(),
                    class,
                });
            }
        };
        if let Some(class) = committed.exceeding_class(&self.capacity) {
            warn!(%order, %class, "capacity taken since reservation, allocation refused");
            return Err(InventoryError::InsufficientCapacity {
                order: order.clone(),
                class,
            });
        }

        reservation.mark_allocated();
        ledger.committed = committed;
        info!(%order, "reservation allocated");
        Ok(())
    }

    /// Drop a reservation, returning its committed resources (if any) to
    /// the pool. Unknown orders are a no-op.
    pub fn unreserve(&self, order: &OrderId) -> Option<Reservation> {
        let mut ledger = self.write();
        let Some(reservation) = ledger.reservations.remove(order) else {
            debug!(%order, "unreserve for unknown order ignored");
            return None;
        };

        if reservation.allocated() {
            ledger.committed = ledger.committed.saturating_sub(reservation.demand());
        }
        info!(%order, allocated = reservation.allocated(), "reservation released");
        Some(reservation)
    }

    /// Record that the IP operator confirmed the order's leased IPs.
    /// The flag is never cleared while the reservation exists.
    pub fn confirm_ips(&self, order: &OrderId) -> InventoryResult<()> {
        let mut ledger = self.write();
        let reservation = ledger
            .reservations
            .get_mut(order)
            .ok_or_else(|| InventoryError::NotFound(order.clone()))?;
        if !reservation.ips_confirmed() {
            reservation.mark_ips_confirmed();
            info!(%order, "leased IPs confirmed");
        }
        Ok(())
    }

    pub fn reservation(&self, order: &OrderId) -> Option<Reservation> {
        self.read().reservations.get(order).cloned()
    }

    pub fn is_fully_active(&self, order: &OrderId) -> bool {
        self.read()
            .reservations
            .get(order)
            .is_some_and(Reservation::is_fully_active)
    }

    /// All reservations, ordered by order id.
    pub fn snapshot(&self) -> Vec<ReservationSummary> {
        let ledger = self.read();
        let mut rows: Vec<ReservationSummary> =
            ledger.reservations.values().map(Reservation::summary).collect();
        rows.sort_by(|a, b| a.order.cmp(&b.order));
        rows
    }

    pub fn status(&self) -> InventoryStatus {
        let ledger = self.read();
        let pending = ledger
            .reservations
            .values()
            .filter(|r| !r.allocated())
            .fold(ResourceTotals::default(), |acc, r| {
                acc.checked_add(r.demand()).unwrap_or(acc)
            });
        InventoryStatus {
            capacity: self.capacity,
            committed: ledger.committed,
            pending,
            available: self.capacity.saturating_sub(&ledger.committed),
            reservations: ledger.reservations.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.read().reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Internal helpers ────────────────────────────────────────────

    // Every critical section leaves the ledger consistent before it can
    // panic, so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, Ledger> {
        self.ledger.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Ledger> {
        self.ledger.write().unwrap_or_else(PoisonError::into_inner)
    }
}
