//! Capability traits for the orchestration backend and the IP operator.
//!
//! Every call returns a boxed future. Callers bound each call with a
//! deadline (`tokio::time::timeout`); dropping the future cancels it.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use leasegrid_core::{LeaseId, LeaseStatus, Manifest};

use crate::error::BackendResult;

/// Boxed future alias for backend results.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + Send + 'a>>;

/// Output of a successful exec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// The cluster technology a lease's workloads run on.
pub trait ClusterBackend: Send + Sync {
    /// Apply `manifest` for `lease`. Re-deploying an existing lease
    /// updates it in place.
    fn deploy<'a>(&'a self, lease: &'a LeaseId, manifest: &'a Manifest) -> BackendFuture<'a, ()>;

    /// Services, forwarded ports and leased IPs. `NotFound` once torn down.
    fn lease_status<'a>(&'a self, lease: &'a LeaseId) -> BackendFuture<'a, LeaseStatus>;

    /// Remove everything deployed for `lease`. Idempotent.
    fn teardown<'a>(&'a self, lease: &'a LeaseId) -> BackendFuture<'a, ()>;

    /// Run `command` in replica `replica_index` of `service`.
    fn exec<'a>(
        &'a self,
        lease: &'a LeaseId,
        service: &'a str,
        replica_index: u32,
        command: &'a [String],
    ) -> BackendFuture<'a, ExecOutput>;
}

/// Result of asking the IP operator about a lease's leased IPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpConfirmation {
    Confirmed,
    /// Not assigned yet; ask again later.
    Pending,
}

/// External process that assigns leased IPs and reports back.
pub trait IpOperator: Send + Sync {
    fn check_confirmation<'a>(
        &'a self,
        lease: &'a LeaseId,
        sharing_keys: &'a [String],
    ) -> BackendFuture<'a, IpConfirmation>;
}
