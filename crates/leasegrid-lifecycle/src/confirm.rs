//! Leased IP confirmation polling.
//!
//! Confirmation comes from an eventually-consistent external operator,
//! so `Pending` answers and transport errors are both retried at a
//! fixed interval until the lease is closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use leasegrid_backend::{IpConfirmation, IpOperator};
use leasegrid_core::LeaseId;

/// Poll until the operator confirms every leased IP of `lease`.
///
/// Returns `true` once confirmed, `false` if `shutdown` fired first.
pub async fn wait_for_confirmation(
    operator: Arc<dyn IpOperator>,
    lease: &LeaseId,
    sharing_keys: &[String],
    interval: Duration,
    call_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> bool {
    debug!(%lease, keys = sharing_keys.len(), "ip confirmation poller starting");
    let mut checks: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        checks += 1;

        let check = tokio::time::timeout(
            call_timeout,
            operator.check_confirmation(lease, sharing_keys),
        );
        tokio::select! {
            result = check => match result {
                Ok(Ok(IpConfirmation::Confirmed)) => {
                    info!(%lease, checks, "leased IPs confirmed");
                    return true;
                }
                Ok(Ok(IpConfirmation::Pending)) => {
                    debug!(%lease, checks, "leased IPs pending");
                }
                Ok(Err(e)) => {
                    warn!(%lease, checks, error = %e, "ip confirmation check failed");
                }
                Err(_) => {
                    warn!(%lease, checks, "ip confirmation check timed out");
                }
            },
            _ = shutdown.changed() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!(%lease, checks, "ip confirmation poller stopped");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasegrid_backend::StaticIpOperator;
    use leasegrid_core::OrderId;

    fn lease() -> LeaseId {
        OrderId::new("akash1owner", 7, 1, 1).lease("akash1provider")
    }

    #[tokio::test]
    async fn returns_once_confirmed_after_failures() {
        let op = Arc::new(StaticIpOperator::confirmed());
        op.fail_next_checks(3);
        let (_tx, rx) = watch::channel(false);

        let confirmed = wait_for_confirmation(
            op.clone(),
            &lease(),
            &["akash1owner-ip-web".to_string()],
            Duration::from_millis(5),
            Duration::from_secs(1),
            rx,
        )
        .await;

        assert!(confirmed);
        assert_eq!(op.checks(), 4);
    }

    #[tokio::test]
    async fn shutdown_stops_pending_poller() {
        let op = Arc::new(StaticIpOperator::new());
        let (tx, rx) = watch::channel(false);
        let lease = lease();

        let handle = tokio::spawn(async move {
            wait_for_confirmation(
                op,
                &lease,
                &[],
                Duration::from_millis(5),
                Duration::from_secs(1),
                rx,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send_replace(true);

        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn already_shut_down_never_checks() {
        let op = Arc::new(StaticIpOperator::confirmed());
        let (tx, rx) = watch::channel(false);
        tx.send_replace(true);

        let confirmed = wait_for_confirmation(
            op.clone(),
            &lease(),
            &[],
            Duration::from_millis(5),
            Duration::from_secs(1),
            rx,
        )
        .await;
        assert!(!confirmed);
        assert_eq!(op.checks(), 0);
    }
}
