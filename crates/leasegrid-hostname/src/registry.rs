//! In-process hostname authority.
//!
//! A single table keyed by hostname is the only place ownership is
//! decided, so concurrent reservations of the same hostname resolve to
//! exactly one winner: whoever takes the lock first.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use leasegrid_core::LeaseId;

use crate::client::{HostnameFuture, HostnameServiceClient};
use crate::error::{HostnameError, HostnameResult};

#[derive(Debug, Clone)]
struct Binding {
    /// Lease currently serving the hostname.
    lease: LeaseId,
    /// Destination of an in-progress transfer.
    staged: Option<LeaseId>,
}

impl Binding {
    fn owner(&self) -> &str {
        self.lease.owner()
    }
}

/// Read-only view of one hostname binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostnameBinding {
    pub hostname: String,
    pub lease: LeaseId,
    pub staged: Option<LeaseId>,
}

#[derive(Default)]
pub struct HostnameRegistry {
    bindings: Mutex<HashMap<String, Binding>>,
}

impl HostnameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_owner(&self, hostnames: &[String], owner: &str) -> HostnameResult<()> {
        let names = normalize_all(hostnames)?;
        let table = self.lock();
        for name in &names {
            check_available(&table, name, owner)?;
        }
        Ok(())
    }

    pub fn reserve(&self, hostnames: &[String], lease: &LeaseId) -> HostnameResult<Vec<String>> {
        let names = normalize_all(hostnames)?;
        let mut table = self.lock();

        // All-or-nothing against other owners.
        for name in &names {
            check_available(&table, name, lease.owner())?;
        }

        let mut granted = Vec::with_capacity(names.len());
        for name in names {
            match table.get(&name) {
                None => {
                    table.insert(
                        name.clone(),
                        Binding {
                            lease: lease.clone(),
                            staged: None,
                        },
                    );
                    debug!(hostname = %name, %lease, "hostname reserved");
                    granted.push(name);
                }
                Some(b) if &b.lease == lease || b.staged.as_ref() == Some(lease) => {
                    granted.push(name);
                }
                Some(b) => {
                    debug!(
                        hostname = %name,
                        %lease,
                        held_by = %b.lease,
                        "hostname withheld, held by another lease of the same owner"
                    );
                }
            }
        }
        granted.sort();
        granted.dedup();
        Ok(granted)
    }

    /// Release everything `lease` holds. Staged transfers complete;
    /// transfers that targeted `lease` are abandoned.
    pub fn release(&self, lease: &LeaseId) {
        self.release_matching(lease, |_| true);
    }

    pub fn release_scoped(&self, lease: &LeaseId, hostnames: &[String]) {
        let names: Vec<String> = hostnames.iter().filter_map(|h| normalize(h).ok()).collect();
        self.release_matching(lease, |name| names.iter().any(|n| n == name));
    }

    pub fn prepare_transfer(
        &self,
        hostnames: &[String],
        destination: &LeaseId,
    ) -> HostnameResult<()> {
        let names = normalize_all(hostnames)?;
        let mut table = self.lock();

        for name in &names {
            check_available(&table, name, destination.owner())?;
            if let Some(staged) = table.get(name).and_then(|b| b.staged.as_ref()) {
                if staged != destination {
                    warn!(hostname = %name, %destination, %staged, "hostname already staged elsewhere");
                    return Err(HostnameError::Conflict {
                        hostname: name.clone(),
                        owner: staged.owner().to_string(),
                    });
                }
            }
        }

        for name in names {
            match table.get_mut(&name) {
                None => {
                    table.insert(
                        name.clone(),
                        Binding {
                            lease: destination.clone(),
                            staged: None,
                        },
                    );
                    debug!(hostname = %name, %destination, "unbound hostname bound directly");
                }
                Some(b) if &b.lease == destination => {}
                Some(b) => {
                    b.staged = Some(destination.clone());
                    info!(hostname = %name, source = %b.lease, %destination, "hostname staged for transfer");
                }
            }
        }
        Ok(())
    }

    /// Hostnames currently served by `lease`, sorted.
    pub fn hostnames_for(&self, lease: &LeaseId) -> Vec<String> {
        let table = self.lock();
        let mut names: Vec<String> = table
            .iter()
            .filter(|(_, b)| &b.lease == lease)
            .map(|(h, _)| h.clone())
            .collect();
        names.sort();
        names
    }

    pub fn lease_of(&self, hostname: &str) -> Option<LeaseId> {
        let name = normalize(hostname).ok()?;
        self.lock().get(&name).map(|b| b.lease.clone())
    }

    pub fn bindings(&self) -> Vec<HostnameBinding> {
        let table = self.lock();
        let mut rows: Vec<HostnameBinding> = table
            .iter()
            .map(|(h, b)| HostnameBinding {
                hostname: h.clone(),
                lease: b.lease.clone(),
                staged: b.staged.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        rows
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn release_matching(&self, lease: &LeaseId, in_scope: impl Fn(&str) -> bool) {
        let mut table = self.lock();
        table.retain(|name, binding| {
            if !in_scope(name.as_str()) {
                return true;
            }
            if &binding.lease == lease {
                match binding.staged.take() {
                    Some(destination) => {
                        info!(hostname = %name, source = %lease, %destination, "hostname handed over");
                        binding.lease = destination;
                        true
                    }
                    None => {
                        debug!(hostname = %name, %lease, "hostname released");
                        false
                    }
                }
            } else {
                if binding.staged.as_ref() == Some(lease) {
                    binding.staged = None;
                    debug!(hostname = %name, %lease, "staged transfer abandoned");
                }
                true
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Binding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HostnameServiceClient for HostnameRegistry {
    fn can_reserve_hostnames<'a>(
        &'a self,
        hostnames: &'a [String],
        owner: &'a str,
    ) -> HostnameFuture<'a, ()> {
        Box::pin(async move { self.check_owner(hostnames, owner) })
    }

    fn reserve_hostnames<'a>(
        &'a self,
        hostnames: &'a [String],
        lease: &'a LeaseId,
    ) -> HostnameFuture<'a, Vec<String>> {
        Box::pin(async move { self.reserve(hostnames, lease) })
    }

    fn release_hostnames<'a>(&'a self, lease: &'a LeaseId) -> HostnameFuture<'a, ()> {
        Box::pin(async move {
            self.release(lease);
            Ok(())
        })
    }

    fn release_hostnames_scoped<'a>(
        &'a self,
        lease: &'a LeaseId,
        hostnames: &'a [String],
    ) -> HostnameFuture<'a, ()> {
        Box::pin(async move {
            self.release_scoped(lease, hostnames);
            Ok(())
        })
    }

    fn prepare_hostnames_for_transfer<'a>(
        &'a self,
        hostnames: &'a [String],
        destination: &'a LeaseId,
    ) -> HostnameFuture<'a, ()> {
        Box::pin(async move { self.prepare_transfer(hostnames, destination) })
    }
}

fn check_available(
    table: &HashMap<String, Binding>,
    name: &str,
    owner: &str,
) -> HostnameResult<()> {
    match table.get(name) {
        Some(b) if b.owner() != owner => {
            warn!(hostname = %name, requested_by = %owner, held_by = %b.owner(), "hostname conflict");
            Err(HostnameError::Conflict {
                hostname: name.to_string(),
                owner: b.owner().to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn normalize(hostname: &str) -> HostnameResult<String> {
    let name = hostname.trim().to_ascii_lowercase();
    let valid = !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*');
    if valid {
        Ok(name)
    } else {
        Err(HostnameError::InvalidHostname(hostname.to_string()))
    }
}

fn normalize_all(hostnames: &[String]) -> HostnameResult<Vec<String>> {
    hostnames.iter().map(|h| normalize(h)).collect()
}
