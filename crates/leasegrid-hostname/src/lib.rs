//! leasegrid-hostname — hostname allocation across leases.
//!
//! A hostname routed to a deployed service belongs to exactly one active
//! lease. The only exception is a transfer: the destination is staged
//! while the source keeps serving, and releasing the source hands the
//! hostname over without it ever being unbound.
//!
//! # Components
//!
//! - **`client`**: the capability interface consumers program against
//! - **`registry`**: in-process single-authority implementation

pub mod client;
pub mod error;
pub mod registry;

pub use client::{HostnameFuture, HostnameServiceClient};
pub use error::{HostnameError, HostnameResult};
pub use registry::HostnameRegistry;
