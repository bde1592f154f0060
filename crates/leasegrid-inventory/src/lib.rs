//! leasegrid-inventory — reservation registry and inventory tracker.
//!
//! Keeps the provider-local ledger of which orders hold resources and how
//! much of the advertised cluster capacity is committed. Capacity is
//! checked twice: optimistically when an order is evaluated (`reserve`)
//! and authoritatively when the bid is accepted (`allocate`).
//!
//! # Components
//!
//! - **`reservation`**: the per-order record
//! - **`registry`**: the lock-guarded table and running totals

pub mod error;
pub mod registry;
pub mod reservation;

pub use error::{InventoryError, InventoryResult};
pub use registry::{InventoryStatus, ReservationRegistry};
pub use reservation::Reservation;
