//! Lifecycle error types.
//!
//! Inventory, hostname and backend errors are folded into one taxonomy
//! so callers can decide between withdrawing a bid, rejecting a request
//! and retrying later without knowing which collaborator failed.

use leasegrid_backend::{BackendError, ExecError};
use leasegrid_core::{OrderId, ResourceClass};
use leasegrid_hostname::HostnameError;
use leasegrid_inventory::InventoryError;
use thiserror::Error;

use crate::state::LeaseState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("insufficient {class} capacity for order {order}")]
    InsufficientCapacity { order: OrderId, class: ResourceClass },

    #[error("hostname {hostname} is in use by another owner ({owner})")]
    HostnameConflict { hostname: String, owner: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("order {order}: cannot move from {from} to {to}")]
    InvalidTransition {
        order: OrderId,
        from: LeaseState,
        to: LeaseState,
    },

    #[error("deploy failed after {attempts} attempts: {last}")]
    DeployFailed { attempts: u32, last: String },

    /// The order moved on (closed, redeployed) while a call was in flight.
    #[error("stale result for order {0}, discarded")]
    Stale(OrderId),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("hostname service error: {0}")]
    Hostname(HostnameError),

    #[error("backend error: {0}")]
    Backend(BackendError),
}

impl LifecycleError {
    /// Whether a caller may retry the same request later.
    ///
    /// Capacity and hostname conflicts are final; so are exec failures,
    /// which describe the workload rather than the transport.
    pub fn is_retryable(&self) -> bool {
        match self {
            LifecycleError::BackendUnavailable(_)
            | LifecycleError::DeployFailed { .. }
            | LifecycleError::Migration(_) => true,
            LifecycleError::Hostname(e) => e.is_retryable(),
            LifecycleError::Backend(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<InventoryError> for LifecycleError {
    fn from(e: InventoryError) -> Self {
        match e {
            InventoryError::InsufficientCapacity { order, class } => {
                LifecycleError::InsufficientCapacity { order, class }
            }
            InventoryError::NotFound(order) => LifecycleError::NotFound(order.to_string()),
            InventoryError::AlreadyReserved(order) => LifecycleError::InvalidTransition {
                order,
                from: LeaseState::Reserved,
                to: LeaseState::Reserved,
            },
        }
    }
}

impl From<HostnameError> for LifecycleError {
    fn from(e: HostnameError) -> Self {
        match e {
            HostnameError::Conflict { hostname, owner } => {
                LifecycleError::HostnameConflict { hostname, owner }
            }
            other => LifecycleError::Hostname(other),
        }
    }
}

impl From<BackendError> for LifecycleError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Exec(e) => LifecycleError::Exec(e),
            BackendError::Unavailable(reason) => LifecycleError::BackendUnavailable(reason),
            other => LifecycleError::Backend(other),
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
