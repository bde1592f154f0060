//! Lease lifecycle coordinator.
//!
//! One slot per order tracks the lease state, an epoch that is bumped on
//! every transition, the deployed manifest and a cancel channel. Calls to
//! the backend and the hostname service happen with the slot table
//! unlocked; their results are recorded only if the slot still holds the
//! epoch (or state) observed before the call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use leasegrid_backend::{BackendError, BackendFuture, BackendResult, ClusterBackend, ExecOutput, IpOperator};
use leasegrid_core::{
    LeaseId, LeaseStatus, Manifest, OrderId, ReservationSummary, ResourceGroup,
    make_ip_sharing_key,
};
use leasegrid_hostname::HostnameServiceClient;
use leasegrid_inventory::ReservationRegistry;

use crate::confirm;
use crate::error::{LifecycleError, LifecycleResult};
use crate::settings::LifecycleSettings;
use crate::state::LeaseState;

struct LeaseSlot {
    /// Set once the bid is accepted.
    lease: Option<LeaseId>,
    state: LeaseState,
    epoch: u64,
    manifest: Option<Manifest>,
    /// A deploy or migration is in flight for this lease.
    busy: bool,
    cancel: watch::Sender<bool>,
    poller: Option<JoinHandle<()>>,
}

impl LeaseSlot {
    fn reserved() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            lease: None,
            state: LeaseState::Reserved,
            epoch: 0,
            manifest: None,
            busy: false,
            cancel,
            poller: None,
        }
    }

    fn advance(&mut self, next: LeaseState) {
        debug_assert!(self.state.can_transition_to(next), "{} -> {}", self.state, next);
        self.state = next;
        self.epoch += 1;
    }

    fn holds(&self, lease: &LeaseId) -> bool {
        self.lease.as_ref() == Some(lease)
    }
}

type SlotTable = Arc<Mutex<HashMap<OrderId, LeaseSlot>>>;

/// Why a deploy loop stopped without success.
enum DeployAbort {
    Cancelled,
    Exhausted { attempts: u32, last: String },
}

impl DeployAbort {
    fn into_error(self, order: &OrderId) -> LifecycleError {
        match self {
            DeployAbort::Cancelled => LifecycleError::Stale(order.clone()),
            DeployAbort::Exhausted { attempts, last } => {
                LifecycleError::DeployFailed { attempts, last }
            }
        }
    }
}

/// Drives leases from order evaluation to release.
pub struct LeaseCoordinator {
    provider: String,
    registry: Arc<ReservationRegistry>,
    hostnames: Arc<dyn HostnameServiceClient>,
    backend: Arc<dyn ClusterBackend>,
    ip_operator: Arc<dyn IpOperator>,
    settings: LifecycleSettings,
    slots: SlotTable,
}

impl LeaseCoordinator {
    pub fn new(
        provider: impl Into<String>,
        registry: Arc<ReservationRegistry>,
        hostnames: Arc<dyn HostnameServiceClient>,
        backend: Arc<dyn ClusterBackend>,
        ip_operator: Arc<dyn IpOperator>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            provider: provider.into(),
            registry,
            hostnames,
            backend,
            ip_operator,
            settings,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn registry(&self) -> &Arc<ReservationRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    // ── Order and bid ───────────────────────────────────────────────

    /// Reserve capacity for a new order (Pending → Reserved).
    pub fn evaluate_order(
        &self,
        order: OrderId,
        group: ResourceGroup,
    ) -> LifecycleResult<ReservationSummary> {
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get(&order) {
            return Err(LifecycleError::InvalidTransition {
                order,
                from: slot.state,
                to: LeaseState::Reserved,
            });
        }

        let reservation = self.registry.reserve(order.clone(), group).map_err(|e| {
            info!(%order, error = %e, "order declined");
            LifecycleError::from(e)
        })?;
        slots.insert(order.clone(), LeaseSlot::reserved());

        info!(
            %order,
            endpoint_quantity = reservation.endpoint_quantity(),
            "order reserved"
        );
        Ok(reservation.summary())
    }

    /// Commit the reservation for a won bid (Reserved → Allocated).
    ///
    /// Losing the authoritative capacity check withdraws the bid: the
    /// reservation is dropped and `InsufficientCapacity` returned.
    pub fn accept_bid(&self, lease: &LeaseId) -> LifecycleResult<()> {
        if lease.provider != self.provider {
            warn!(%lease, provider = %self.provider, "bid accepted for another provider");
            return Err(LifecycleError::NotFound(lease.to_string()));
        }
        let order = lease.order_id();
        let mut slots = self.lock_slots();
        let slot = slots
            .get_mut(order)
            .ok_or_else(|| LifecycleError::NotFound(order.to_string()))?;

        if slot.state == LeaseState::Allocated && slot.holds(lease) {
            return Ok(());
        }
        check_transition(order, slot.state, LeaseState::Allocated)?;

        match self.registry.allocate(order) {
            Ok(()) => {
                slot.lease = Some(lease.clone());
                slot.advance(LeaseState::Allocated);
                info!(%lease, "bid accepted, resources committed");
                Ok(())
            }
            Err(e) => {
                slots.remove(order);
                self.registry.unreserve(order);
                warn!(%lease, error = %e, "allocation failed, bid withdrawn");
                Err(e.into())
            }
        }
    }

    /// Drop the reservation of an order whose bid was not won.
    pub async fn withdraw_order(&self, order: &OrderId) -> LifecycleResult<()> {
        let Some((lease, had_workloads)) = self.begin_close(order, None) else {
            debug!(%order, "withdrawal of unknown order ignored");
            return Ok(());
        };
        self.finish_close(order, lease.as_ref(), had_workloads).await;
        Ok(())
    }

    // ── Manifest delivery ───────────────────────────────────────────

    /// Reserve the manifest's hostnames and deploy it (Allocated → Deployed).
    ///
    /// Leases without leased IP endpoints go straight to Active. Others
    /// stay Deployed until the IP operator confirms, which a background
    /// poller waits for. A manifest sent to a Deployed or Active lease
    /// replaces the running one in place. Returns the state reached.
    pub async fn deliver_manifest(
        &self,
        lease: &LeaseId,
        manifest: Manifest,
    ) -> LifecycleResult<LeaseState> {
        let order = lease.order_id().clone();
        let (epoch, mut cancel, running) = {
            let mut slots = self.lock_slots();
            let slot = slot_for(&mut slots, lease)?;
            let accepts = slot.state == LeaseState::Allocated || slot.state.has_workloads();
            if slot.busy || !accepts {
                return Err(LifecycleError::InvalidTransition {
                    order,
                    from: slot.state,
                    to: LeaseState::Deployed,
                });
            }
            slot.busy = true;
            let running = slot.manifest.clone().filter(|_| slot.state.has_workloads());
            (slot.epoch, slot.cancel.subscribe(), running)
        };
        if let Some(running) = running {
            return self.update_manifest(lease, running, manifest, cancel).await;
        }

        let mut manifest = manifest;
        let requested = manifest.hostnames();
        if !requested.is_empty() {
            let granted = match self.reserve_hostnames(lease, &requested).await {
                Ok(granted) => granted,
                Err(e) => return Err(self.abort_delivery(lease, epoch, e).await),
            };
            if !self.at_epoch(&order, epoch) {
                info!(%lease, "lease moved on during hostname reservation");
                self.discard_stale(lease).await;
                return Err(LifecycleError::Stale(order));
            }
            withhold(lease, &mut manifest, &requested, &granted);
        }

        if let Err(abort) = self.deploy_with_retry(lease, &manifest, &mut cancel).await {
            let err = abort.into_error(&order);
            match &err {
                LifecycleError::Stale(_) => {
                    info!(%lease, "deploy cancelled by close, removing partial state");
                    self.discard_stale(lease).await;
                }
                _ => {
                    error!(%lease, error = %err, "deploy failed, releasing lease");
                    self.release_after_failure(lease, epoch, true).await;
                }
            }
            return Err(err);
        }

        let sharing_keys = sharing_keys(lease, &manifest);
        let reached = {
            let mut slots = self.lock_slots();
            match slots.get_mut(&order) {
                Some(slot) if slot.epoch == epoch && slot.state == LeaseState::Allocated => {
                    slot.busy = false;
                    slot.manifest = Some(manifest);
                    slot.advance(LeaseState::Deployed);
                    let endpoint_quantity = self
                        .registry
                        .reservation(&order)
                        .map_or(0, |r| r.endpoint_quantity());
                    if endpoint_quantity == 0 {
                        slot.advance(LeaseState::Active);
                    } else {
                        slot.poller = Some(self.spawn_confirmation(
                            lease.clone(),
                            sharing_keys,
                            slot.epoch,
                            slot.cancel.subscribe(),
                        ));
                    }
                    Some(slot.state)
                }
                _ => None,
            }
        };

        match reached {
            Some(state) => {
                info!(%lease, %state, "manifest deployed");
                Ok(state)
            }
            None => {
                warn!(%lease, "lease moved on during deploy, discarding result");
                self.discard_stale(lease).await;
                Err(LifecycleError::Stale(order))
            }
        }
    }

    /// Redeploy a running lease with a new manifest. Added hostnames are
    /// bound before the deploy and dropped ones released after it, so
    /// every routed hostname is bound throughout. A failed update leaves
    /// the previous manifest running and the lease in its state.
    async fn update_manifest(
        &self,
        lease: &LeaseId,
        running: Manifest,
        manifest: Manifest,
        mut cancel: watch::Receiver<bool>,
    ) -> LifecycleResult<LeaseState> {
        let order = lease.order_id().clone();
        let held = running.hostnames();
        let mut manifest = manifest;
        let added: Vec<String> = manifest
            .hostnames()
            .into_iter()
            .filter(|h| !held.contains(h))
            .collect();

        let mut bound = Vec::new();
        if !added.is_empty() {
            bound = match self.reserve_hostnames(lease, &added).await {
                Ok(granted) => granted,
                Err(e) => {
                    warn!(%lease, error = %e, "manifest update rejected, previous manifest kept");
                    self.clear_busy(&order);
                    return Err(e);
                }
            };
            if !self.is_running(lease) {
                info!(%lease, "lease moved on during hostname reservation");
                self.discard_stale(lease).await;
                return Err(LifecycleError::Stale(order));
            }
            withhold(lease, &mut manifest, &added, &bound);
        }

        if let Err(abort) = self.deploy_with_retry(lease, &manifest, &mut cancel).await {
            let err = abort.into_error(&order);
            if self.is_running(lease) {
                error!(%lease, error = %err, "manifest update failed, restoring previous manifest");
                if matches!(err, LifecycleError::DeployFailed { .. }) {
                    if let Err(e) = self.deploy_with_retry(lease, &running, &mut cancel).await {
                        let e = e.into_error(&order);
                        error!(%lease, error = %e, "previous manifest could not be restored");
                    }
                }
                self.release_scoped_quietly(lease, &bound).await;
                self.clear_busy(&order);
            } else {
                info!(%lease, "update cancelled by close, removing partial state");
                self.discard_stale(lease).await;
            }
            return Err(err);
        }

        let sharing_keys = sharing_keys(lease, &manifest);
        let dropped: Vec<String> = {
            let serving = manifest.hostnames();
            held.into_iter().filter(|h| !serving.contains(h)).collect()
        };
        let reached = {
            let mut slots = self.lock_slots();
            match slots.get_mut(&order) {
                Some(slot) if slot.holds(lease) && slot.state.has_workloads() => {
                    slot.busy = false;
                    slot.manifest = Some(manifest);
                    if slot.state == LeaseState::Deployed {
                        // Endpoint names may have changed.
                        if let Some(poller) = slot.poller.take() {
                            poller.abort();
                        }
                        slot.poller = Some(self.spawn_confirmation(
                            lease.clone(),
                            sharing_keys,
                            slot.epoch,
                            slot.cancel.subscribe(),
                        ));
                    }
                    Some(slot.state)
                }
                _ => None,
            }
        };

        let Some(state) = reached else {
            warn!(%lease, "lease moved on during update, discarding result");
            self.discard_stale(lease).await;
            return Err(LifecycleError::Stale(order));
        };
        self.release_scoped_quietly(lease, &dropped).await;
        info!(%lease, %state, ?dropped, "manifest updated");
        Ok(state)
    }

    async fn reserve_hostnames(
        &self,
        lease: &LeaseId,
        hostnames: &[String],
    ) -> LifecycleResult<Vec<String>> {
        self.bounded(
            "hostname check",
            self.hostnames.can_reserve_hostnames(hostnames, lease.owner()),
        )
        .await?;
        self.bounded(
            "hostname reservation",
            self.hostnames.reserve_hostnames(hostnames, lease),
        )
        .await
    }

    /// Terminal errors withdraw the lease; transient ones leave it
    /// Allocated so the manifest can be sent again.
    async fn abort_delivery(
        &self,
        lease: &LeaseId,
        epoch: u64,
        err: LifecycleError,
    ) -> LifecycleError {
        if err.is_retryable() {
            warn!(%lease, error = %err, "manifest delivery failed, lease kept");
            self.clear_busy(lease.order_id());
        } else {
            warn!(%lease, error = %err, "manifest rejected, withdrawing lease");
            self.release_after_failure(lease, epoch, false).await;
        }
        err
    }

    async fn deploy_with_retry(
        &self,
        lease: &LeaseId,
        manifest: &Manifest,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), DeployAbort> {
        let attempts = self.settings.deploy_attempts;
        let mut backoff = self.settings.backoff();
        let mut last = String::new();

        for attempt in 1..=attempts {
            if *cancel.borrow() {
                return Err(DeployAbort::Cancelled);
            }
            let call = tokio::time::timeout(
                self.settings.call_timeout,
                self.backend.deploy(lease, manifest),
            );
            let result = tokio::select! {
                result = call => result,
                _ = cancel.changed() => return Err(DeployAbort::Cancelled),
            };

            match result {
                Ok(Ok(())) => {
                    debug!(%lease, attempt, "deploy applied");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(%lease, attempt, error = %e, "deploy attempt failed");
                    last = e.to_string();
                    if !e.is_transient() {
                        return Err(DeployAbort::Exhausted {
                            attempts: attempt,
                            last,
                        });
                    }
                }
                Err(_) => {
                    warn!(%lease, attempt, "deploy attempt timed out");
                    last = format!("timed out after {:?}", self.settings.call_timeout);
                }
            }

            if attempt < attempts {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.changed() => return Err(DeployAbort::Cancelled),
                }
            }
        }
        Err(DeployAbort::Exhausted { attempts, last })
    }

    fn spawn_confirmation(
        &self,
        lease: LeaseId,
        sharing_keys: Vec<String>,
        epoch: u64,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let operator = self.ip_operator.clone();
        let registry = self.registry.clone();
        let slots = self.slots.clone();
        let interval = self.settings.ip_poll_interval;
        let call_timeout = self.settings.call_timeout;

        tokio::spawn(async move {
            let confirmed = confirm::wait_for_confirmation(
                operator,
                &lease,
                &sharing_keys,
                interval,
                call_timeout,
                shutdown,
            )
            .await;
            if confirmed {
                record_confirmation(&slots, &registry, lease.order_id(), epoch);
            }
        })
    }

    // ── Close ───────────────────────────────────────────────────────

    /// Tear down and release everything held by `lease` (→ Closing →
    /// Released). Unknown leases are a logged no-op; concurrent closes
    /// of the same lease are idempotent.
    pub async fn close_lease(&self, lease: &LeaseId) -> LifecycleResult<()> {
        let order = lease.order_id();
        let Some((_, had_workloads)) = self.begin_close(order, Some(lease)) else {
            debug!(%lease, "close of unknown lease ignored");
            return Ok(());
        };
        self.finish_close(order, Some(lease), had_workloads).await;
        Ok(())
    }

    /// Move the slot to Closing and stop in-flight work. Returns the
    /// slot's lease and whether backend state may exist, or `None` if
    /// there is nothing to close.
    fn begin_close(
        &self,
        order: &OrderId,
        expected: Option<&LeaseId>,
    ) -> Option<(Option<LeaseId>, bool)> {
        let mut slots = self.lock_slots();
        let slot = slots.get_mut(order)?;
        if let Some(lease) = expected {
            if slot.lease.is_some() && !slot.holds(lease) {
                return None;
            }
        }
        if slot.state.is_terminal() {
            return None;
        }

        let had_workloads = slot.state.has_workloads() || slot.busy;
        let from = slot.state;
        slot.advance(LeaseState::Closing);
        slot.cancel.send_replace(true);
        if let Some(poller) = slot.poller.take() {
            poller.abort();
        }
        info!(%order, %from, "lease closing");

        let lease = slot.lease.clone().or_else(|| expected.cloned());
        Some((lease, had_workloads))
    }

    async fn finish_close(&self, order: &OrderId, lease: Option<&LeaseId>, teardown: bool) {
        if let Some(lease) = lease {
            if teardown {
                self.teardown_quietly(lease).await;
            }
            self.release_hostnames_quietly(lease).await;
        }

        let mut slots = self.lock_slots();
        self.registry.unreserve(order);
        if let Some(mut slot) = slots.remove(order) {
            slot.advance(LeaseState::Released);
        }
        info!(%order, "lease released");
    }

    /// Undo a failed delivery, unless a close got there first.
    async fn release_after_failure(&self, lease: &LeaseId, epoch: u64, teardown: bool) {
        let order = lease.order_id();
        let still_ours = {
            let mut slots = self.lock_slots();
            match slots.get_mut(order) {
                Some(slot) if slot.epoch == epoch => {
                    slot.advance(LeaseState::Closing);
                    true
                }
                _ => false,
            }
        };
        if !still_ours {
            debug!(%lease, "lease already closing, failure cleanup skipped");
            return;
        }
        self.finish_close(order, Some(lease), teardown).await;
    }

    async fn teardown_quietly(&self, lease: &LeaseId) {
        let result = self
            .retry_backend("teardown", lease, self.settings.deploy_attempts, |b, l| {
                b.teardown(l)
            })
            .await;
        if let Err(e) = result {
            error!(%lease, error = %e, "teardown failed, backend state may linger");
        }
    }

    async fn release_hostnames_quietly(&self, lease: &LeaseId) {
        if let Err(e) = self
            .bounded("hostname release", self.hostnames.release_hostnames(lease))
            .await
        {
            warn!(%lease, error = %e, "hostname release failed");
        }
    }

    async fn release_scoped_quietly(&self, lease: &LeaseId, hostnames: &[String]) {
        if hostnames.is_empty() {
            return;
        }
        if let Err(e) = self
            .bounded(
                "hostname release",
                self.hostnames.release_hostnames_scoped(lease, hostnames),
            )
            .await
        {
            warn!(%lease, ?hostnames, error = %e, "hostname release failed");
        }
    }

    /// Undo whatever a delivery bound after its lease was closed. A lease
    /// that is still live was interrupted by shutdown and is left alone.
    async fn discard_stale(&self, lease: &LeaseId) {
        let live = {
            let mut slots = self.lock_slots();
            match slots.get_mut(lease.order_id()) {
                Some(slot) if slot.holds(lease) && !slot.state.is_terminal() => {
                    slot.busy = false;
                    true
                }
                _ => false,
            }
        };
        if live {
            return;
        }
        self.teardown_quietly(lease).await;
        self.release_hostnames_quietly(lease).await;
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Backend status of a live lease; `NotFound` once released.
    pub async fn lease_status(&self, lease: &LeaseId) -> LifecycleResult<LeaseStatus> {
        {
            let mut slots = self.lock_slots();
            slot_for(&mut slots, lease)?;
        }
        let result = self
            .retry_backend(
                "lease status",
                lease,
                self.settings.status_attempts,
                |b, l| b.lease_status(l),
            )
            .await;
        result.map_err(|e| match e {
            BackendError::NotFound => LifecycleError::NotFound(lease.to_string()),
            e if e.is_transient() => {
                warn!(%lease, error = %e, "lease status degraded");
                LifecycleError::BackendUnavailable(e.to_string())
            }
            e => e.into(),
        })
    }

    /// Run a command in one replica of a service. Not retried.
    pub async fn exec(
        &self,
        lease: &LeaseId,
        service: &str,
        replica_index: u32,
        command: &[String],
    ) -> LifecycleResult<ExecOutput> {
        {
            let mut slots = self.lock_slots();
            slot_for(&mut slots, lease)?;
        }
        let result = tokio::time::timeout(
            self.settings.call_timeout,
            self.backend.exec(lease, service, replica_index, command),
        )
        .await;
        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(BackendError::NotFound)) => Err(LifecycleError::NotFound(lease.to_string())),
            Ok(Err(e)) => {
                debug!(%lease, service, replica_index, error = %e, "exec failed");
                Err(e.into())
            }
            Err(_) => Err(LifecycleError::BackendUnavailable(format!(
                "exec timed out after {:?}",
                self.settings.call_timeout
            ))),
        }
    }

    pub fn lease_state(&self, order: &OrderId) -> Option<LeaseState> {
        self.lock_slots().get(order).map(|s| s.state)
    }

    pub fn reservation_snapshot(&self) -> Vec<ReservationSummary> {
        self.registry.snapshot()
    }

    /// Stop every confirmation poller and cancel in-flight deploys.
    /// Leases and reservations are left as they are.
    pub fn shutdown(&self) {
        let mut slots = self.lock_slots();
        for (order, slot) in slots.iter_mut() {
            slot.cancel.send_replace(true);
            if let Some(poller) = slot.poller.take() {
                poller.abort();
                debug!(%order, "confirmation poller stopped");
            }
        }
        info!(leases = slots.len(), "lease coordinator shut down");
    }

    // ── Migration ───────────────────────────────────────────────────

    /// Move `hostnames` from `source` to `destination` without a window
    /// in which neither lease holds them.
    ///
    /// The hostnames are staged on the destination, the destination is
    /// redeployed to route them, and only once its status shows them
    /// served are they released from the source and removed from the
    /// source's manifest. Both leases answer during the handover.
    pub async fn migrate_hostnames(
        &self,
        hostnames: &[String],
        source: &LeaseId,
        destination: &LeaseId,
    ) -> LifecycleResult<()> {
        if source == destination {
            return Err(LifecycleError::Migration(
                "source and destination are the same lease".to_string(),
            ));
        }
        let mut names: Vec<String> = hostnames
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        names.sort();
        names.dedup();
        if names.is_empty() {
            return Ok(());
        }

        let (source_manifest, destination_manifest) = {
            let mut slots = self.lock_slots();
            let source_manifest = running_manifest(&mut slots, source)?;
            let destination_manifest = running_manifest(&mut slots, destination)?;
            let served = source_manifest.hostnames();
            let foreign: Vec<&String> = names.iter().filter(|h| !served.contains(h)).collect();
            if !foreign.is_empty() {
                return Err(LifecycleError::Migration(format!(
                    "source {source} does not hold {foreign:?}"
                )));
            }
            for lease in [source, destination] {
                if let Some(slot) = slots.get_mut(lease.order_id()) {
                    slot.busy = true;
                }
            }
            (source_manifest, destination_manifest)
        };

        let result = self
            .run_migration(&names, source, source_manifest, destination, destination_manifest)
            .await;

        self.clear_busy(source.order_id());
        self.clear_busy(destination.order_id());
        match &result {
            Ok(()) => info!(%source, %destination, hostnames = ?names, "hostnames migrated"),
            Err(e) => warn!(%source, %destination, hostnames = ?names, error = %e, "migration failed"),
        }
        result
    }

    async fn run_migration(
        &self,
        hostnames: &[String],
        source: &LeaseId,
        mut source_manifest: Manifest,
        destination: &LeaseId,
        mut destination_manifest: Manifest,
    ) -> LifecycleResult<()> {
        if !destination_manifest.add_hostnames(hostnames) {
            return Err(LifecycleError::Migration(format!(
                "destination {destination} has no global expose to route hostnames to"
            )));
        }

        self.bounded(
            "hostname transfer",
            self.hostnames.prepare_hostnames_for_transfer(hostnames, destination),
        )
        .await?;

        let mut destination_cancel = self.cancel_receiver(destination)?;
        if let Err(abort) = self
            .deploy_with_retry(destination, &destination_manifest, &mut destination_cancel)
            .await
        {
            // Abandon the staged transfer; the source keeps serving.
            if let Err(e) = self
                .bounded(
                    "hostname release",
                    self.hostnames.release_hostnames_scoped(destination, hostnames),
                )
                .await
            {
                warn!(%destination, error = %e, "could not abandon staged transfer");
            }
            return Err(abort.into_error(destination.order_id()));
        }
        self.record_manifest(destination, destination_manifest)?;

        self.await_convergence(destination, hostnames).await?;

        self.bounded(
            "hostname release",
            self.hostnames.release_hostnames_scoped(source, hostnames),
        )
        .await?;

        source_manifest.remove_hostnames(hostnames);
        let mut source_cancel = self.cancel_receiver(source)?;
        self.deploy_with_retry(source, &source_manifest, &mut source_cancel)
            .await
            .map_err(|abort| abort.into_error(source.order_id()))?;
        self.record_manifest(source, source_manifest)
    }

    /// Poll the destination's status until every hostname is served.
    async fn await_convergence(&self, lease: &LeaseId, hostnames: &[String]) -> LifecycleResult<()> {
        let deadline = Instant::now() + self.settings.convergence_timeout;
        let mut backoff = self.settings.backoff();

        loop {
            let status =
                tokio::time::timeout(self.settings.call_timeout, self.backend.lease_status(lease))
                    .await;
            match status {
                Ok(Ok(status)) if hostnames.iter().all(|h| status.serves_hostname(h)) => {
                    debug!(%lease, "destination serves migrated hostnames");
                    return Ok(());
                }
                Ok(Ok(_)) => debug!(%lease, "destination not yet serving migrated hostnames"),
                Ok(Err(e)) => debug!(%lease, error = %e, "destination status unavailable"),
                Err(_) => debug!(%lease, "destination status timed out"),
            }

            let delay = backoff.next_delay();
            if Instant::now() + delay > deadline {
                return Err(LifecycleError::Migration(format!(
                    "destination {lease} did not serve {hostnames:?} within {:?}",
                    self.settings.convergence_timeout
                )));
            }
            tokio::time::sleep(delay).await;
        }
    }

    fn record_manifest(&self, lease: &LeaseId, manifest: Manifest) -> LifecycleResult<()> {
        let mut slots = self.lock_slots();
        match slots.get_mut(lease.order_id()) {
            Some(slot) if slot.holds(lease) && slot.state.has_workloads() => {
                slot.manifest = Some(manifest);
                Ok(())
            }
            _ => Err(LifecycleError::Stale(lease.order_id().clone())),
        }
    }

    fn cancel_receiver(&self, lease: &LeaseId) -> LifecycleResult<watch::Receiver<bool>> {
        let mut slots = self.lock_slots();
        let slot = slot_for(&mut slots, lease)?;
        if slot.state.is_terminal() {
            return Err(LifecycleError::Stale(lease.order_id().clone()));
        }
        Ok(slot.cancel.subscribe())
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Bound a collaborator call by `call_timeout`.
    async fn bounded<T, E>(
        &self,
        what: &'static str,
        call: impl Future<Output = Result<T, E>>,
    ) -> LifecycleResult<T>
    where
        LifecycleError: From<E>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result.map_err(LifecycleError::from),
            Err(_) => Err(LifecycleError::BackendUnavailable(format!(
                "{what} timed out after {:?}",
                self.settings.call_timeout
            ))),
        }
    }

    /// Retry an idempotent backend call on transient failures.
    async fn retry_backend<'a, T>(
        &'a self,
        what: &'static str,
        lease: &'a LeaseId,
        attempts: u32,
        call: impl Fn(&'a dyn ClusterBackend, &'a LeaseId) -> BackendFuture<'a, T>,
    ) -> BackendResult<T> {
        let mut backoff = self.settings.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result =
                tokio::time::timeout(self.settings.call_timeout, call(self.backend.as_ref(), lease))
                    .await;
            let err = match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => BackendError::Unavailable(format!(
                    "{what} timed out after {:?}",
                    self.settings.call_timeout
                )),
            };
            if !err.is_transient() || attempt >= attempts {
                return Err(err);
            }
            let delay = backoff.next_delay();
            debug!(%lease, what, attempt, error = %err, ?delay, "retrying backend call");
            tokio::time::sleep(delay).await;
        }
    }

    fn at_epoch(&self, order: &OrderId, epoch: u64) -> bool {
        self.lock_slots().get(order).is_some_and(|slot| slot.epoch == epoch)
    }

    fn is_running(&self, lease: &LeaseId) -> bool {
        self.lock_slots()
            .get(lease.order_id())
            .is_some_and(|slot| slot.holds(lease) && slot.state.has_workloads())
    }

    fn clear_busy(&self, order: &OrderId) {
        if let Some(slot) = self.lock_slots().get_mut(order) {
            slot.busy = false;
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<OrderId, LeaseSlot>> {
        lock_table(&self.slots)
    }
}

fn lock_table(table: &Mutex<HashMap<OrderId, LeaseSlot>>) -> MutexGuard<'_, HashMap<OrderId, LeaseSlot>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_transition(order: &OrderId, from: LeaseState, to: LeaseState) -> LifecycleResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidTransition {
            order: order.clone(),
            from,
            to,
        })
    }
}

/// The slot bound to `lease`, or `NotFound`.
fn slot_for<'s>(
    slots: &'s mut HashMap<OrderId, LeaseSlot>,
    lease: &LeaseId,
) -> LifecycleResult<&'s mut LeaseSlot> {
    slots
        .get_mut(lease.order_id())
        .filter(|slot| slot.holds(lease))
        .ok_or_else(|| LifecycleError::NotFound(lease.to_string()))
}

/// Drop `requested` hostnames that were not granted from `manifest`.
fn withhold(lease: &LeaseId, manifest: &mut Manifest, requested: &[String], granted: &[String]) {
    let withheld: Vec<String> = requested
        .iter()
        .filter(|h| !granted.contains(h))
        .cloned()
        .collect();
    if !withheld.is_empty() {
        warn!(%lease, ?withheld, "hostnames withheld, still held by another lease");
        manifest.remove_hostnames(&withheld);
    }
}

fn sharing_keys(lease: &LeaseId, manifest: &Manifest) -> Vec<String> {
    manifest
        .ip_endpoint_names()
        .iter()
        .map(|name| make_ip_sharing_key(lease, name))
        .collect()
}

/// Manifest of a deployed lease with no other deploy or migration in flight.
fn running_manifest(
    slots: &mut HashMap<OrderId, LeaseSlot>,
    lease: &LeaseId,
) -> LifecycleResult<Manifest> {
    let slot = slot_for(slots, lease)?;
    if !slot.state.has_workloads() || slot.busy {
        return Err(LifecycleError::InvalidTransition {
            order: lease.order_id().clone(),
            from: slot.state,
            to: slot.state,
        });
    }
    slot.manifest
        .clone()
        .ok_or_else(|| LifecycleError::NotFound(lease.to_string()))
}

fn record_confirmation(
    slots: &Mutex<HashMap<OrderId, LeaseSlot>>,
    registry: &ReservationRegistry,
    order: &OrderId,
    epoch: u64,
) {
    let mut slots = lock_table(slots);
    let Some(slot) = slots.get_mut(order) else {
        debug!(%order, "confirmation for released lease discarded");
        return;
    };
    if slot.epoch != epoch || slot.state != LeaseState::Deployed {
        debug!(%order, state = %slot.state, "stale confirmation discarded");
        return;
    }
    if let Err(e) = registry.confirm_ips(order) {
        warn!(%order, error = %e, "could not record ip confirmation");
        return;
    }
    slot.advance(LeaseState::Active);
    slot.poller = None;
    info!(%order, "leased IPs confirmed, lease active");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use leasegrid_backend::{InMemoryBackend, StaticIpOperator};
    use leasegrid_core::{
        Endpoint, EndpointKind, ManifestService, Protocol, ResourceTotals, ResourceUnit,
        ServiceExpose,
    };
    use leasegrid_hostname::HostnameRegistry;

    const PROVIDER: &str = "akash1provider";

    struct Harness {
        coordinator: LeaseCoordinator,
        registry: Arc<ReservationRegistry>,
        hostnames: Arc<HostnameRegistry>,
        backend: Arc<InMemoryBackend>,
        operator: Arc<StaticIpOperator>,
    }

    fn fast_settings() -> LifecycleSettings {
        LifecycleSettings {
            deploy_attempts: 3,
            deploy_backoff: Duration::from_millis(1),
            deploy_backoff_max: Duration::from_millis(4),
            call_timeout: Duration::from_secs(2),
            ip_poll_interval: Duration::from_millis(5),
            status_attempts: 2,
            convergence_timeout: Duration::from_millis(200),
        }
    }

    fn harness() -> Harness {
        let registry = Arc::new(ReservationRegistry::new(ResourceTotals {
            cpu_millis: 4_000,
            memory_bytes: 8 << 30,
            storage_bytes: 100 << 30,
            gpu_units: 0,
            endpoints: 2,
        }));
        let hostnames = Arc::new(HostnameRegistry::new());
        let backend = Arc::new(InMemoryBackend::new(vec!["203.0.113.10".to_string()]));
        let operator = Arc::new(StaticIpOperator::new());
        let coordinator = LeaseCoordinator::new(
            PROVIDER,
            registry.clone(),
            hostnames.clone(),
            backend.clone(),
            operator.clone(),
            fast_settings(),
        );
        Harness {
            coordinator,
            registry,
            hostnames,
            backend,
            operator,
        }
    }

    fn group(cpu_millis: u64, leased_ips: u32) -> ResourceGroup {
        ResourceGroup {
            name: "westcoast".to_string(),
            resources: vec![ResourceUnit {
                cpu_millis,
                memory_bytes: 512 << 20,
                storage: Vec::new(),
                gpu_units: 0,
                endpoints: (0..leased_ips)
                    .map(|seq| Endpoint {
                        kind: EndpointKind::LeasedIp,
                        sequence_number: seq,
                    })
                    .collect(),
                count: 1,
            }],
        }
    }

    fn manifest(hosts: &[&str], ip: Option<&str>) -> Manifest {
        Manifest {
            group: "westcoast".to_string(),
            services: vec![ManifestService {
                name: "web".to_string(),
                image: "nginx".to_string(),
                count: 1,
                expose: vec![ServiceExpose {
                    port: 80,
                    external_port: 0,
                    proto: Protocol::Tcp,
                    global: true,
                    hosts: hosts.iter().map(|h| h.to_string()).collect(),
                    ip: ip.map(str::to_string),
                }],
            }],
        }
    }

    fn lease(owner: &str, dseq: u64) -> LeaseId {
        OrderId::new(owner, dseq, 1, 1).lease(PROVIDER)
    }

    fn allocated(h: &Harness, lease: &LeaseId, leased_ips: u32) {
        h.coordinator
            .evaluate_order(lease.order_id().clone(), group(500, leased_ips))
            .unwrap();
        h.coordinator.accept_bid(lease).unwrap();
    }

    #[test]
    fn evaluate_then_accept() {
        let h = harness();
        let l = lease("akash1owner", 1);
        let summary = h
            .coordinator
            .evaluate_order(l.order_id().clone(), group(500, 0))
            .unwrap();
        assert!(!summary.allocated);
        assert_eq!(h.coordinator.lease_state(l.order_id()), Some(LeaseState::Reserved));

        h.coordinator.accept_bid(&l).unwrap();
        h.coordinator.accept_bid(&l).unwrap();
        assert_eq!(h.coordinator.lease_state(l.order_id()), Some(LeaseState::Allocated));
        assert!(h.registry.reservation(l.order_id()).unwrap().allocated());
    }

    #[test]
    fn duplicate_order_rejected() {
        let h = harness();
        let l = lease("akash1owner", 1);
        h.coordinator
            .evaluate_order(l.order_id().clone(), group(500, 0))
            .unwrap();
        let err = h
            .coordinator
            .evaluate_order(l.order_id().clone(), group(500, 0))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
        assert_eq!(h.registry.len(), 1);
    }

    #[test]
    fn losing_allocation_race_withdraws_bid() {
        let h = harness();
        let a = lease("akash1owner", 1);
        let b = lease("akash1owner", 2);
        // Both fit optimistically; only one fits once committed.
        h.coordinator
            .evaluate_order(a.order_id().clone(), group(3_000, 0))
            .unwrap();
        h.coordinator
            .evaluate_order(b.order_id().clone(), group(3_000, 0))
            .unwrap();

        h.coordinator.accept_bid(&a).unwrap();
        let err = h.coordinator.accept_bid(&b).unwrap_err();
        assert!(matches!(err, LifecycleError::InsufficientCapacity { .. }));
        assert!(!err.is_retryable());
        assert_eq!(h.coordinator.lease_state(b.order_id()), None);
        assert!(h.registry.reservation(b.order_id()).is_none());
    }

    #[test]
    fn bid_for_other_provider_is_unknown() {
        let h = harness();
        let l = OrderId::new("akash1owner", 1, 1, 1).lease("akash1elsewhere");
        assert!(matches!(
            h.coordinator.accept_bid(&l),
            Err(LifecycleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deploy_without_ips_goes_active() {
        let h = harness();
        let l = lease("akash1owner", 1);
        allocated(&h, &l, 0);

        let state = h
            .coordinator
            .deliver_manifest(&l, manifest(&["web.example.com"], None))
            .await
            .unwrap();
        assert_eq!(state, LeaseState::Active);
        assert!(h.backend.is_deployed(&l));
        assert_eq!(h.hostnames.hostnames_for(&l), vec!["web.example.com"]);
        assert!(h.registry.is_fully_active(l.order_id()));
    }

    #[tokio::test]
    async fn leased_ip_waits_for_confirmation() {
        let h = harness();
        let l = lease("akash1owner", 1);
        allocated(&h, &l, 1);

        let state = h
            .coordinator
            .deliver_manifest(&l, manifest(&[], Some("web")))
            .await
            .unwrap();
        assert_eq!(state, LeaseState::Deployed);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.coordinator.lease_state(l.order_id()), Some(LeaseState::Deployed));
        assert!(!h.registry.is_fully_active(l.order_id()));

        h.operator.confirm();
        for _ in 0..100 {
            if h.coordinator.lease_state(l.order_id()) == Some(LeaseState::Active) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.coordinator.lease_state(l.order_id()), Some(LeaseState::Active));
        assert!(h.registry.reservation(l.order_id()).unwrap().ips_confirmed());
    }

    #[tokio::test]
    async fn update_before_confirmation_keeps_waiting() {
        let h = harness();
        let l = lease("akash1owner", 1);
        allocated(&h, &l, 1);
        h.coordinator
            .deliver_manifest(&l, manifest(&["a.example.com"], Some("web")))
            .await
            .unwrap();

        let state = h
            .coordinator
            .deliver_manifest(&l, manifest(&["b.example.com"], Some("web")))
            .await
            .unwrap();
        assert_eq!(state, LeaseState::Deployed);
        assert_eq!(h.hostnames.hostnames_for(&l), vec!["b.example.com"]);

        h.operator.confirm();
        for _ in 0..100 {
            if h.coordinator.lease_state(l.order_id()) == Some(LeaseState::Active) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.coordinator.lease_state(l.order_id()), Some(LeaseState::Active));
    }

    #[tokio::test]
    async fn manifest_for_closed_lease_is_unknown() {
        let h = harness();
        let l = lease("akash1owner", 1);
        allocated(&h, &l, 0);
        h.coordinator.close_lease(&l).await.unwrap();
        assert!(matches!(
            h.coordinator.deliver_manifest(&l, manifest(&[], None)).await,
            Err(LifecycleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn transient_deploy_failures_are_retried() {
        let h = harness();
        let l = lease("akash1owner", 1);
        allocated(&h, &l, 0);
        h.backend.fail_next_deploys(2);

        let state = h
            .coordinator
            .deliver_manifest(&l, manifest(&[], None))
            .await
            .unwrap();
        assert_eq!(state, LeaseState::Active);
        assert_eq!(h.backend.deploy_calls(), 3);
    }

    #[tokio::test]
    async fn hostname_conflict_rejects_and_withdraws() {
        let h = harness();
        let first = lease("akash1alice", 1);
        let second = lease("akash1bob", 2);
        allocated(&h, &first, 0);
        allocated(&h, &second, 0);

        h.coordinator
            .deliver_manifest(&first, manifest(&["shop.example.com"], None))
            .await
            .unwrap();
        let err = h
            .coordinator
            .deliver_manifest(&second, manifest(&["shop.example.com"], None))
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::HostnameConflict { .. }));
        assert!(!h.backend.is_deployed(&second));
        assert_eq!(h.coordinator.lease_state(second.order_id()), None);
        assert!(h.registry.reservation(second.order_id()).is_none());
        assert_eq!(h.hostnames.lease_of("shop.example.com"), Some(first));
    }

    #[tokio::test]
    async fn same_owner_hostname_is_withheld_not_stolen() {
        let h = harness();
        let first = lease("akash1owner", 1);
        let second = lease("akash1owner", 2);
        allocated(&h, &first, 0);
        allocated(&h, &second, 0);

        h.coordinator
            .deliver_manifest(&first, manifest(&["a.example.com"], None))
            .await
            .unwrap();
        h.coordinator
            .deliver_manifest(&second, manifest(&["a.example.com", "b.example.com"], None))
            .await
            .unwrap();

        let deployed = h.backend.deployed_manifest(&second).unwrap();
        assert_eq!(deployed.hostnames(), vec!["b.example.com"]);
        assert_eq!(h.hostnames.lease_of("a.example.com"), Some(first));
    }

    #[tokio::test]
    async fn close_releases_everything() {
        let h = harness();
        let l = lease("akash1owner", 1);
        allocated(&h, &l, 0);
        h.coordinator
            .deliver_manifest(&l, manifest(&["web.example.com"], None))
            .await
            .unwrap();

        h.coordinator.close_lease(&l).await.unwrap();
        assert!(!h.backend.is_deployed(&l));
        assert!(h.hostnames.hostnames_for(&l).is_empty());
        assert!(h.registry.is_empty());
        assert!(h.registry.status().committed.is_zero());
        assert_eq!(h.coordinator.lease_state(l.order_id()), None);

        // Second close is a no-op.
        h.coordinator.close_lease(&l).await.unwrap();
        assert!(matches!(
            h.coordinator.lease_status(&l).await,
            Err(LifecycleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn withdraw_unwon_order() {
        let h = harness();
        let order = OrderId::new("akash1owner", 9, 1, 1);
        h.coordinator
            .evaluate_order(order.clone(), group(500, 0))
            .unwrap();
        h.coordinator.withdraw_order(&order).await.unwrap();
        assert!(h.registry.is_empty());
        assert!(h.backend.teardowns().is_empty());
    }

    #[tokio::test]
    async fn status_unavailable_is_degraded() {
        let h = harness();
        let l = lease("akash1owner", 1);
        allocated(&h, &l, 0);
        h.coordinator
            .deliver_manifest(&l, manifest(&[], None))
            .await
            .unwrap();

        h.backend.set_unavailable(true);
        let err = h.coordinator.lease_status(&l).await.unwrap_err();
        assert!(matches!(err, LifecycleError::BackendUnavailable(_)));
        assert!(err.is_retryable());

        h.backend.set_unavailable(false);
        let status = h.coordinator.lease_status(&l).await.unwrap();
        assert!(status.services.contains_key("web"));
    }

    #[tokio::test]
    async fn shutdown_stops_pollers() {
        let h = harness();
        let l = lease("akash1owner", 1);
        allocated(&h, &l, 1);
        h.coordinator
            .deliver_manifest(&l, manifest(&[], Some("web")))
            .await
            .unwrap();

        h.coordinator.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let checks = h.operator.checks();
        h.operator.confirm();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.operator.checks(), checks);
        assert_eq!(h.coordinator.lease_state(l.order_id()), Some(LeaseState::Deployed));
    }
}
