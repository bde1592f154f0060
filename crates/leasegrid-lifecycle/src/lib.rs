//! leasegrid-lifecycle — drives leases through their state machine.
//!
//! The coordinator keeps three sources of truth consistent: the
//! reservation registry (capacity), the hostname service (routing
//! ownership) and the orchestration backend (what actually runs).
//!
//! # Architecture
//!
//! ```text
//! LeaseCoordinator
//!   ├── ReservationRegistry (reserve / allocate / unreserve / confirm_ips)
//!   ├── HostnameServiceClient (reserve, release, transfer hostnames)
//!   ├── ClusterBackend (deploy / status / teardown / exec)
//!   ├── IpOperator (polled by a per-lease confirmation task)
//!   └── Per-order slot
//!       ├── LeaseState + epoch (stale-result detection)
//!       └── cancel channel (in-flight deploys, confirmation poller)
//! ```
//!
//! The slot table lock is never held across an `.await`: backend and
//! hostname calls run unlocked and their results are recorded only if
//! the slot's epoch is unchanged.

pub mod confirm;
pub mod coordinator;
pub mod error;
pub mod retry;
pub mod settings;
pub mod state;

pub use coordinator::LeaseCoordinator;
pub use error::{LifecycleError, LifecycleResult};
pub use retry::Backoff;
pub use settings::LifecycleSettings;
pub use state::LeaseState;
