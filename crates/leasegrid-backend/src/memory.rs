//! In-memory cluster backend.
//!
//! Stores deployed manifests per lease and derives lease status from
//! them. Leased IPs are handed out from a fixed pool, keyed by sharing
//! key, so endpoints with equal keys resolve to the same address.
//!
//! Fault injection knobs make retry and cancellation paths testable:
//! failing the next N deploys, delaying deploys, going unavailable, and
//! scripting exec commands.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use leasegrid_core::{
    ForwardedPort, LeaseId, LeaseStatus, LeasedIpStatus, Manifest, ServiceStatus,
    make_ip_sharing_key,
};

use crate::adapter::{BackendFuture, ClusterBackend, ExecOutput};
use crate::error::{BackendError, BackendResult, ExecError};

/// Scripted outcome for an exec command.
#[derive(Debug, Clone)]
struct ScriptedCommand {
    exit_code: i32,
    stdout: Vec<u8>,
}

#[derive(Default)]
struct BackendState {
    deployments: HashMap<LeaseId, Manifest>,
    /// sharing key → assigned IP.
    ip_assignments: HashMap<String, String>,
    fail_next_deploys: u32,
    deploy_delay: Duration,
    unavailable: bool,
    commands: HashMap<String, ScriptedCommand>,
    deploy_calls: u32,
    teardowns: Vec<LeaseId>,
}

pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    ip_pool: Vec<String>,
    node_host: String,
}

impl InMemoryBackend {
    /// Backend whose leased IPs come from `ip_pool`, in order.
    pub fn new(ip_pool: Vec<String>) -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
            ip_pool,
            node_host: "node1.provider.local".to_string(),
        }
    }

    /// Hostname reported for forwarded ports.
    pub fn with_node_host(mut self, host: impl Into<String>) -> Self {
        self.node_host = host.into();
        self
    }

    // ── Fault injection ─────────────────────────────────────────────

    pub fn fail_next_deploys(&self, count: u32) {
        self.lock().fail_next_deploys = count;
    }

    pub fn set_deploy_delay(&self, delay: Duration) {
        self.lock().deploy_delay = delay;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make `path` runnable in every replica with the given outcome.
    pub fn register_command(&self, path: &str, exit_code: i32, stdout: &[u8]) {
        self.lock().commands.insert(
            path.to_string(),
            ScriptedCommand {
                exit_code,
                stdout: stdout.to_vec(),
            },
        );
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn is_deployed(&self, lease: &LeaseId) -> bool {
        self.lock().deployments.contains_key(lease)
    }

    pub fn deployed_manifest(&self, lease: &LeaseId) -> Option<Manifest> {
        self.lock().deployments.get(lease).cloned()
    }

    pub fn deploy_calls(&self) -> u32 {
        self.lock().deploy_calls
    }

    pub fn teardowns(&self) -> Vec<LeaseId> {
        self.lock().teardowns.clone()
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, lease: &LeaseId, manifest: &Manifest) -> BackendResult<()> {
        let mut state = self.lock();
        state.deploy_calls += 1;
        if state.unavailable {
            return Err(BackendError::Unavailable("cluster API unreachable".to_string()));
        }

        // A failed deploy still leaves its objects behind, like a
        // half-applied rollout would.
        state.deployments.insert(lease.clone(), manifest.clone());

        if state.fail_next_deploys > 0 {
            state.fail_next_deploys -= 1;
            return Err(BackendError::Failed("injected deploy failure".to_string()));
        }

        for name in manifest.ip_endpoint_names() {
            let key = make_ip_sharing_key(lease, &name);
            if state.ip_assignments.contains_key(&key) {
                continue;
            }
            let ip = self
                .ip_pool
                .iter()
                .find(|ip| !state.ip_assignments.values().any(|used| used == *ip))
                .cloned()
                .ok_or_else(|| BackendError::Failed("leased IP pool exhausted".to_string()))?;
            debug!(%lease, sharing_key = %key, %ip, "leased IP assigned");
            state.ip_assignments.insert(key, ip);
        }

        info!(%lease, group = %manifest.group, "manifest deployed");
        Ok(())
    }

    fn status(&self, lease: &LeaseId) -> BackendResult<LeaseStatus> {
        let state = self.lock();
        if state.unavailable {
            return Err(BackendError::Unavailable("cluster API unreachable".to_string()));
        }
        let manifest = state.deployments.get(lease).ok_or(BackendError::NotFound)?;

        let mut status = LeaseStatus::default();
        for svc in &manifest.services {
            let mut uris: Vec<String> = svc
                .expose
                .iter()
                .filter(|e| e.global)
                .flat_map(|e| e.hosts.iter().cloned())
                .collect();
            uris.sort();
            uris.dedup();
            status.services.insert(
                svc.name.clone(),
                ServiceStatus {
                    name: svc.name.clone(),
                    available: svc.count,
                    total: svc.count,
                    uris,
                },
            );

            let ports: Vec<ForwardedPort> = svc
                .expose
                .iter()
                .filter(|e| e.global && e.hosts.is_empty() && e.ip.is_none() && e.external_port != 0)
                .map(|e| ForwardedPort {
                    host: self.node_host.clone(),
                    port: e.port,
                    external_port: e.external_port,
                    proto: e.proto,
                })
                .collect();
            if !ports.is_empty() {
                status.forwarded_ports.insert(svc.name.clone(), ports);
            }

            let ips: Vec<LeasedIpStatus> = svc
                .expose
                .iter()
                .filter_map(|e| {
                    let name = e.ip.as_deref()?;
                    let ip = state.ip_assignments.get(&make_ip_sharing_key(lease, name))?;
                    Some(LeasedIpStatus {
                        ip: ip.clone(),
                        port: e.port,
                        external_port: if e.external_port == 0 { e.port } else { e.external_port },
                        protocol: e.proto,
                    })
                })
                .collect();
            if !ips.is_empty() {
                status.ips.insert(svc.name.clone(), ips);
            }
        }
        Ok(status)
    }

    fn remove(&self, lease: &LeaseId) {
        let mut state = self.lock();
        state.teardowns.push(lease.clone());
        let Some(manifest) = state.deployments.remove(lease) else {
            debug!(%lease, "teardown of lease with nothing deployed");
            return;
        };

        // Free IPs no other deployment still shares.
        let still_used: HashSet<String> = state
            .deployments
            .iter()
            .flat_map(|(l, m)| {
                m.ip_endpoint_names()
                    .into_iter()
                    .map(move |n| make_ip_sharing_key(l, &n))
            })
            .collect();
        for name in manifest.ip_endpoint_names() {
            let key = make_ip_sharing_key(lease, &name);
            if !still_used.contains(&key) {
                state.ip_assignments.remove(&key);
            }
        }
        info!(%lease, "lease torn down");
    }

    fn run(
        &self,
        lease: &LeaseId,
        service: &str,
        replica_index: u32,
        command: &[String],
    ) -> BackendResult<ExecOutput> {
        let state = self.lock();
        let manifest = state.deployments.get(lease).ok_or(BackendError::NotFound)?;
        let svc = manifest
            .services
            .iter()
            .find(|s| s.name == service)
            .ok_or(ExecError::NoSuchService)?;
        if replica_index >= svc.count {
            return Err(ExecError::PodIndexOutOfRange.into());
        }

        let Some((program, args)) = command.split_first() else {
            return Err(ExecError::CommandNotFound.into());
        };
        if program == "/bin/echo" || program == "echo" {
            let mut stdout = args.join(" ").into_bytes();
            stdout.push(b'\n');
            return Ok(ExecOutput {
                stdout,
                stderr: Vec::new(),
            });
        }

        let scripted = state.commands.get(program).ok_or(ExecError::CommandNotFound)?;
        if scripted.exit_code != 0 {
            return Err(ExecError::NonZeroExit(scripted.exit_code).into());
        }
        Ok(ExecOutput {
            stdout: scripted.stdout.clone(),
            stderr: Vec::new(),
        })
    }
}

impl ClusterBackend for InMemoryBackend {
    fn deploy<'a>(&'a self, lease: &'a LeaseId, manifest: &'a Manifest) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let delay = self.lock().deploy_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.apply(lease, manifest)
        })
    }

    fn lease_status<'a>(&'a self, lease: &'a LeaseId) -> BackendFuture<'a, LeaseStatus> {
        Box::pin(async move { self.status(lease) })
    }

    fn teardown<'a>(&'a self, lease: &'a LeaseId) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.remove(lease);
            Ok(())
        })
    }

    fn exec<'a>(
        &'a self,
        lease: &'a LeaseId,
        service: &'a str,
        replica_index: u32,
        command: &'a [String],
    ) -> BackendFuture<'a, ExecOutput> {
        Box::pin(async move { self.run(lease, service, replica_index, command) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasegrid_core::{ManifestService, OrderId, Protocol, ServiceExpose};

    fn lease(owner: &str, dseq: u64) -> LeaseId {
        OrderId::new(owner, dseq, 1, 1).lease("akash1provider")
    }

    fn manifest(hosts: &[&str], ip: Option<&str>) -> Manifest {
        Manifest {
            group: "westcoast".to_string(),
            services: vec![ManifestService {
                name: "web".to_string(),
                image: "nginx".to_string(),
                count: 2,
                expose: vec![
                    ServiceExpose {
                        port: 80,
                        external_port: 80,
                        proto: Protocol::Tcp,
                        global: true,
                        hosts: hosts.iter().map(|h| h.to_string()).collect(),
                        ip: ip.map(str::to_string),
                    },
                    ServiceExpose {
                        port: 22,
                        external_port: 2222,
                        proto: Protocol::Tcp,
                        global: true,
                        hosts: vec![],
                        ip: None,
                    },
                ],
            }],
        }
    }

    fn backend() -> InMemoryBackend {
        InMemoryBackend::new(vec!["203.0.113.10".to_string(), "203.0.113.11".to_string()])
    }

    #[tokio::test]
    async fn deploy_then_status() {
        let backend = backend();
        let l = lease("alice", 1);
        backend.deploy(&l, &manifest(&["app.com"], Some("web"))).await.unwrap();

        let status = backend.lease_status(&l).await.unwrap();
        let web = &status.services["web"];
        assert_eq!(web.uris, vec!["app.com".to_string()]);
        assert_eq!(web.available, 2);
        assert_eq!(status.forwarded_ports["web"][0].external_port, 2222);
        assert_eq!(status.ips["web"][0].ip, "203.0.113.10");
        assert!(status.serves_hostname("APP.com"));
    }

    #[tokio::test]
    async fn equal_sharing_keys_share_an_ip() {
        let backend = backend();
        let a1 = lease("alice", 1);
        let a2 = lease("alice", 2);
        let b = lease("bob", 3);
        backend.deploy(&a1, &manifest(&[], Some("shared"))).await.unwrap();
        backend.deploy(&a2, &manifest(&[], Some("shared"))).await.unwrap();
        backend.deploy(&b, &manifest(&[], Some("shared"))).await.unwrap();

        let ip_a1 = backend.lease_status(&a1).await.unwrap().ips["web"][0].ip.clone();
        let ip_a2 = backend.lease_status(&a2).await.unwrap().ips["web"][0].ip.clone();
        let ip_b = backend.lease_status(&b).await.unwrap().ips["web"][0].ip.clone();
        assert_eq!(ip_a1, ip_a2);
        assert_ne!(ip_a1, ip_b);

        // Still shared by a2, so tearing down a1 keeps the address.
        backend.teardown(&a1).await.unwrap();
        assert_eq!(backend.lease_status(&a2).await.unwrap().ips["web"][0].ip, ip_a1);
    }

    #[tokio::test]
    async fn ip_pool_exhaustion_fails_deploy() {
        let backend = InMemoryBackend::new(vec![]);
        let err = backend
            .deploy(&lease("alice", 1), &manifest(&[], Some("web")))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Failed(_)));
    }

    #[tokio::test]
    async fn injected_failures_leave_partial_state() {
        let backend = backend();
        let l = lease("alice", 1);
        backend.fail_next_deploys(1);

        assert!(backend.deploy(&l, &manifest(&[], None)).await.is_err());
        assert!(backend.is_deployed(&l));
        backend.deploy(&l, &manifest(&[], None)).await.unwrap();
        assert_eq!(backend.deploy_calls(), 2);

        backend.teardown(&l).await.unwrap();
        assert!(!backend.is_deployed(&l));
        assert_eq!(backend.teardowns(), vec![l.clone()]);
        assert_eq!(backend.lease_status(&l).await, Err(BackendError::NotFound));
    }

    #[tokio::test]
    async fn unavailable_backend() {
        let backend = backend();
        backend.set_unavailable(true);
        let err = backend.lease_status(&lease("alice", 1)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn exec_error_taxonomy() {
        let backend = backend();
        let l = lease("alice", 1);
        backend.deploy(&l, &manifest(&[], None)).await.unwrap();
        backend.register_command("/bin/cat", 1, b"");
        backend.register_command("/bin/true", 0, b"ok");

        let cmd = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let out = backend.exec(&l, "web", 0, &cmd(&["/bin/echo", "foo"])).await.unwrap();
        assert_eq!(out.stdout, b"foo\n");
        assert_eq!(
            backend.exec(&l, "web", 1, &cmd(&["/bin/true"])).await.unwrap().stdout,
            b"ok"
        );

        assert_eq!(
            backend.exec(&l, "notaservice", 0, &cmd(&["/bin/echo"])).await,
            Err(BackendError::Exec(ExecError::NoSuchService))
        );
        assert_eq!(
            backend.exec(&l, "web", 99, &cmd(&["/bin/echo"])).await,
            Err(BackendError::Exec(ExecError::PodIndexOutOfRange))
        );
        assert_eq!(
            backend.exec(&l, "web", 0, &cmd(&["/bin/baz", "foo"])).await,
            Err(BackendError::Exec(ExecError::CommandNotFound))
        );
        assert_eq!(
            backend.exec(&l, "web", 0, &cmd(&["/bin/cat", "/foo"])).await,
            Err(BackendError::Exec(ExecError::NonZeroExit(1)))
        );
        assert_eq!(
            ExecError::NonZeroExit(1).to_string(),
            "remote process exited with code 1"
        );
    }
}
