//! The hostname service capability interface.
//!
//! Implementations may be in-process (see [`HostnameRegistry`]) or a
//! network client to a remote hostname operator; the lifecycle
//! coordinator only sees this trait.
//!
//! [`HostnameRegistry`]: crate::HostnameRegistry

use std::future::Future;
use std::pin::Pin;

use leasegrid_core::LeaseId;

use crate::error::HostnameResult;

/// Boxed future returned by hostname service calls.
pub type HostnameFuture<'a, T> = Pin<Box<dyn Future<Output = HostnameResult<T>> + Send + 'a>>;

pub trait HostnameServiceClient: Send + Sync {
    /// Fails with `Conflict` if any hostname is bound to another owner.
    fn can_reserve_hostnames<'a>(
        &'a self,
        hostnames: &'a [String],
        owner: &'a str,
    ) -> HostnameFuture<'a, ()>;

    /// Bind `hostnames` to `lease`, returning the subset now served by it.
    ///
    /// Hostnames held by the same owner on another lease are withheld
    /// rather than stolen; moving them requires a transfer.
    fn reserve_hostnames<'a>(
        &'a self,
        hostnames: &'a [String],
        lease: &'a LeaseId,
    ) -> HostnameFuture<'a, Vec<String>>;

    /// Free every hostname held by `lease`.
    fn release_hostnames<'a>(&'a self, lease: &'a LeaseId) -> HostnameFuture<'a, ()>;

    /// Free only `hostnames` from `lease`; completes a transfer.
    fn release_hostnames_scoped<'a>(
        &'a self,
        lease: &'a LeaseId,
        hostnames: &'a [String],
    ) -> HostnameFuture<'a, ()>;

    /// Stage `hostnames` on `destination` without unbinding them from
    /// their current lease.
    fn prepare_hostnames_for_transfer<'a>(
        &'a self,
        hostnames: &'a [String],
        destination: &'a LeaseId,
    ) -> HostnameFuture<'a, ()>;
}
