//! Manifest and lease status payloads.
//!
//! The manifest is the tenant's service description as handed to the
//! orchestration backend. Only the parts the resource manager reasons
//! about are modelled: services, their exposes, the hostnames routed to
//! them and the leased IP endpoint they bind to.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A port a service exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceExpose {
    pub port: u16,
    #[serde(default)]
    pub external_port: u16,
    pub proto: Protocol,
    /// Reachable from outside the cluster.
    #[serde(default)]
    pub global: bool,
    /// Hostnames routed to this port (global HTTP exposes only).
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Name of the leased IP endpoint this port binds to.
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestService {
    pub name: String,
    pub image: String,
    pub count: u32,
    #[serde(default)]
    pub expose: Vec<ServiceExpose>,
}

/// Deployable description of one resource group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub group: String,
    pub services: Vec<ManifestService>,
}

impl Manifest {
    /// Every hostname routed to a global expose, lower-cased and deduplicated.
    pub fn hostnames(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .services
            .iter()
            .flat_map(|svc| svc.expose.iter())
            .filter(|exp| exp.global)
            .flat_map(|exp| exp.hosts.iter())
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        set.into_iter().collect()
    }

    /// Leased IP endpoint names referenced by this manifest.
    pub fn ip_endpoint_names(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .services
            .iter()
            .flat_map(|svc| svc.expose.iter())
            .filter_map(|exp| exp.ip.as_deref())
            .collect();
        set.into_iter().map(str::to_string).collect()
    }

    /// Route `hostnames` to the first global expose of the manifest.
    ///
    /// Used when a hostname migrates onto a lease whose manifest did not
    /// originally list it. Returns `false` if there is no global expose.
    pub fn add_hostnames(&mut self, hostnames: &[String]) -> bool {
        let target = self
            .services
            .iter_mut()
            .flat_map(|svc| svc.expose.iter_mut())
            .find(|exp| exp.global);
        let Some(expose) = target else {
            return false;
        };
        for host in hostnames {
            if !expose.hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
                expose.hosts.push(host.clone());
            }
        }
        true
    }

    /// Stop routing `hostnames` to any service in this manifest.
    pub fn remove_hostnames(&mut self, hostnames: &[String]) {
        for expose in self.services.iter_mut().flat_map(|svc| svc.expose.iter_mut()) {
            expose
                .hosts
                .retain(|h| !hostnames.iter().any(|r| r.eq_ignore_ascii_case(h)));
        }
    }
}

// ── Lease status ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub available: u32,
    pub total: u32,
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedPort {
    pub host: String,
    pub port: u16,
    pub external_port: u16,
    pub proto: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeasedIpStatus {
    pub ip: String,
    pub port: u16,
    pub external_port: u16,
    pub protocol: Protocol,
}

/// What the backend reports for a running lease.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseStatus {
    pub services: BTreeMap<String, ServiceStatus>,
    pub forwarded_ports: BTreeMap<String, Vec<ForwardedPort>>,
    pub ips: BTreeMap<String, Vec<LeasedIpStatus>>,
}

impl LeaseStatus {
    /// Whether any service of the lease answers for `hostname`.
    pub fn serves_hostname(&self, hostname: &str) -> bool {
        self.services
            .values()
            .any(|svc| svc.uris.iter().any(|u| u.eq_ignore_ascii_case(hostname)))
    }
}
