//! The per-order reservation record.

use serde::{Deserialize, Serialize};

use leasegrid_core::{EndpointKind, OrderId, ReservationSummary, ResourceGroup, ResourceTotals};

/// Provider-local record of an order's claim on cluster inventory.
///
/// Owned by the [`ReservationRegistry`](crate::ReservationRegistry);
/// callers only ever see clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    order: OrderId,
    resources: ResourceGroup,
    /// Demand per class, computed once since the group is immutable.
    demand: ResourceTotals,
    allocated: bool,
    endpoint_quantity: u32,
    ips_confirmed: bool,
}

impl Reservation {
    pub(crate) fn new(order: OrderId, resources: ResourceGroup) -> Self {
        let endpoint_quantity = resources.endpoint_quantity(EndpointKind::LeasedIp);
        let demand = resources.totals();
        Self {
            order,
            resources,
            demand,
            allocated: false,
            endpoint_quantity,
            ips_confirmed: false,
        }
    }

    pub fn order_id(&self) -> &OrderId {
        &self.order
    }

    pub fn resources(&self) -> &ResourceGroup {
        &self.resources
    }

    pub fn demand(&self) -> &ResourceTotals {
        &self.demand
    }

    pub fn allocated(&self) -> bool {
        self.allocated
    }

    /// Leased IP endpoints the group asks for.
    pub fn endpoint_quantity(&self) -> u32 {
        self.endpoint_quantity
    }

    pub fn ips_confirmed(&self) -> bool {
        self.ips_confirmed
    }

    /// Committed and, if it leases IPs, confirmed by the IP operator.
    pub fn is_fully_active(&self) -> bool {
        self.allocated && (self.endpoint_quantity == 0 || self.ips_confirmed)
    }

    pub(crate) fn mark_allocated(&mut self) {
        self.allocated = true;
    }

    pub(crate) fn mark_ips_confirmed(&mut self) {
        self.ips_confirmed = true;
    }

    pub fn summary(&self) -> ReservationSummary {
        ReservationSummary {
            order: self.order.clone(),
            allocated: self.allocated,
            ips_confirmed: self.ips_confirmed,
            endpoint_quantity: self.endpoint_quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasegrid_core::{Endpoint, ResourceUnit};

    fn group(leased_ips: u32) -> ResourceGroup {
        ResourceGroup {
            name: "g".to_string(),
            resources: vec![ResourceUnit {
                cpu_millis: 100,
                memory_bytes: 1024,
                storage: vec![],
                gpu_units: 0,
                endpoints: (0..leased_ips)
                    .map(|seq| Endpoint {
                        kind: EndpointKind::LeasedIp,
                        sequence_number: seq,
                    })
                    .collect(),
                count: 1,
            }],
        }
    }

    #[test]
    fn new_reservation_is_unallocated() {
        let r = Reservation::new(OrderId::new("o", 1, 1, 1), group(2));
        assert!(!r.allocated());
        assert!(!r.ips_confirmed());
        assert_eq!(r.endpoint_quantity(), 2);
        assert_eq!(r.demand().endpoints, 2);
    }

    #[test]
    fn fully_active_requires_confirmation_when_leasing_ips() {
        let mut with_ips = Reservation::new(OrderId::new("o", 1, 1, 1), group(1));
        with_ips.mark_allocated();
        assert!(!with_ips.is_fully_active());
        with_ips.mark_ips_confirmed();
        assert!(with_ips.is_fully_active());

        let mut without = Reservation::new(OrderId::new("o", 2, 1, 1), group(0));
        assert!(!without.is_fully_active());
        without.mark_allocated();
        assert!(without.is_fully_active());
    }

    #[test]
    fn summary_mirrors_flags() {
        let mut r = Reservation::new(OrderId::new("o", 1, 1, 1), group(1));
        r.mark_allocated();
        let s = r.summary();
        assert!(s.allocated);
        assert!(!s.ips_confirmed);
        assert_eq!(s.endpoint_quantity, 1);
    }
}
