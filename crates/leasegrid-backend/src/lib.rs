//! leasegrid-backend — the orchestration backend seam.
//!
//! The resource manager never talks to the cluster directly. It goes
//! through two capability traits:
//!
//! - **`ClusterBackend`**: deploy, status, teardown and exec for a lease
//! - **`IpOperator`**: confirmation that leased IPs were actually assigned
//!
//! `InMemoryBackend` and `StaticIpOperator` are drop-in implementations
//! for tests and local runs, with fault injection for retry paths.

pub mod adapter;
pub mod error;
pub mod memory;
pub mod operator;

pub use adapter::{BackendFuture, ClusterBackend, ExecOutput, IpConfirmation, IpOperator};
pub use error::{BackendError, BackendResult, ExecError};
pub use memory::InMemoryBackend;
pub use operator::StaticIpOperator;
