//! Settable IP operator for tests and local runs.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::debug;

use leasegrid_core::LeaseId;

use crate::adapter::{BackendFuture, IpConfirmation, IpOperator};
use crate::error::BackendError;

/// Reports `Pending` until [`confirm`](Self::confirm) is called.
#[derive(Default)]
pub struct StaticIpOperator {
    confirmed: AtomicBool,
    failures_remaining: AtomicU32,
    checks: AtomicU32,
}

impl StaticIpOperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operator that confirms on the first check.
    pub fn confirmed() -> Self {
        let op = Self::new();
        op.confirm();
        op
    }

    pub fn confirm(&self) {
        self.confirmed.store(true, Ordering::SeqCst);
    }

    /// Fail the next `count` checks with a transport error.
    pub fn fail_next_checks(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of checks answered so far, failures included.
    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

impl IpOperator for StaticIpOperator {
    fn check_confirmation<'a>(
        &'a self,
        lease: &'a LeaseId,
        sharing_keys: &'a [String],
    ) -> BackendFuture<'a, IpConfirmation> {
        Box::pin(async move {
            self.checks.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BackendError::Unavailable("ip operator unreachable".to_string()));
            }
            let result = if self.confirmed.load(Ordering::SeqCst) {
                IpConfirmation::Confirmed
            } else {
                IpConfirmation::Pending
            };
            debug!(%lease, keys = sharing_keys.len(), ?result, "ip confirmation checked");
            Ok(result)
        })
    }
}
