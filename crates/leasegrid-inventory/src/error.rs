//! Inventory error types.

use leasegrid_core::{OrderId, ResourceClass};
use thiserror::Error;

/// Errors returned by the reservation registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    #[error("insufficient {class} capacity for order {order}")]
    InsufficientCapacity { order: OrderId, class: ResourceClass },

    #[error("reservation not found: {0}")]
    NotFound(OrderId),

    #[error("order already reserved: {0}")]
    AlreadyReserved(OrderId),
}

impl InventoryError {
    /// None of these are fixed by retrying; the bid is withdrawn instead.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

pub type InventoryResult<T> = Result<T, InventoryError>;
