//! leasegridd — the leasegrid provider daemon.
//!
//! Operator-facing entry point over the provider's resource manager:
//! - Inventory inspection from the advertised capacity
//! - IP sharing key derivation
//! - Config validation
//! - A local walkthrough of one lease against the in-memory backend
//!
//! # Usage
//!
//! ```text
//! leasegridd inventory --config /etc/leasegrid/leasegrid.toml
//! leasegridd sharing-key --owner akash1... --name "Public IP"
//! leasegridd walkthrough --config leasegrid.toml --hostname demo.example.com
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use leasegrid_backend::{InMemoryBackend, StaticIpOperator};
use leasegrid_core::{
    Endpoint, EndpointKind, Manifest, ManifestService, OrderId, Protocol, ProviderConfig,
    ResourceGroup, ResourceUnit, ServiceExpose, make_ip_sharing_key,
};
use leasegrid_hostname::HostnameRegistry;
use leasegrid_inventory::ReservationRegistry;
use leasegrid_lifecycle::{LeaseCoordinator, LeaseState, LifecycleSettings};

const DEFAULT_FILTER: &str = "info,leasegrid=debug";

#[derive(Parser)]
#[command(name = "leasegridd", about = "leasegrid provider daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the advertised capacity and current usage as JSON.
    Inventory {
        #[arg(long, default_value = "leasegrid.toml")]
        config: PathBuf,
    },

    /// Print the IP sharing key for an endpoint name.
    SharingKey {
        /// Tenant address owning the lease.
        #[arg(long)]
        owner: String,

        /// Endpoint name as written in the manifest.
        #[arg(long)]
        name: String,
    },

    /// Parse a config file and print it normalized.
    CheckConfig {
        #[arg(long, default_value = "leasegrid.toml")]
        config: PathBuf,
    },

    /// Run one lease from order to release against the in-memory backend.
    Walkthrough {
        #[arg(long, default_value = "leasegrid.toml")]
        config: PathBuf,

        #[arg(long, default_value = "akash1walkthrough")]
        owner: String,

        #[arg(long, default_value = "walkthrough.example.com")]
        hostname: String,

        /// Leased IPs handed out by the in-memory backend.
        #[arg(long, default_value = "198.51.100.10")]
        ip_pool: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Inventory { config } => print_inventory(&config),
        Command::SharingKey { owner, name } => {
            // Only the owner takes part in the key.
            let lease = OrderId::new(owner, 0, 0, 0).lease("");
            println!("{}", make_ip_sharing_key(&lease, &name));
            Ok(())
        }
        Command::CheckConfig { config } => check_config(&config),
        Command::Walkthrough {
            config,
            owner,
            hostname,
            ip_pool,
        } => run_walkthrough(&config, owner, hostname, ip_pool).await,
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<ProviderConfig> {
    ProviderConfig::from_file(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

fn print_inventory(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let registry = ReservationRegistry::new(config.inventory.capacity()?);
    info!(provider = %config.provider.address, "inventory loaded");
    println!("{}", serde_json::to_string_pretty(&registry.status())?);
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    // Durations are only parsed when settings are built.
    LifecycleSettings::try_from(&config.lifecycle)?;
    print!("{}", config.to_toml_string()?);
    info!(path = %path.display(), "config ok");
    Ok(())
}

async fn run_walkthrough(
    path: &Path,
    owner: String,
    hostname: String,
    ip_pool: Vec<String>,
) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let settings = LifecycleSettings::try_from(&config.lifecycle)?;
    let poll_interval = settings.ip_poll_interval;

    let registry = Arc::new(ReservationRegistry::new(config.inventory.capacity()?));
    let operator = Arc::new(StaticIpOperator::new());
    let coordinator = LeaseCoordinator::new(
        config.provider.address.clone(),
        registry.clone(),
        Arc::new(HostnameRegistry::new()),
        Arc::new(InMemoryBackend::new(ip_pool)),
        operator.clone(),
        settings,
    );

    let lease = OrderId::new(owner, 1, 1, 1).lease(config.provider.address.clone());
    info!(%lease, "walkthrough starting");

    coordinator.evaluate_order(lease.order_id().clone(), walkthrough_group())?;
    coordinator.accept_bid(&lease)?;
    let state = coordinator
        .deliver_manifest(&lease, walkthrough_manifest(&hostname))
        .await?;
    info!(%lease, %state, "manifest delivered");

    // Stand in for the external IP operator.
    operator.confirm();
    let mut waited = Duration::ZERO;
    while coordinator.lease_state(lease.order_id()) != Some(LeaseState::Active) {
        if waited > poll_interval * 10 {
            warn!(%lease, "leased IP confirmation did not arrive");
            break;
        }
        tokio::time::sleep(poll_interval).await;
        waited += poll_interval;
    }

    let status = coordinator.lease_status(&lease).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    println!(
        "{}",
        serde_json::to_string_pretty(&coordinator.reservation_snapshot())?
    );

    coordinator.close_lease(&lease).await?;
    coordinator.shutdown();
    println!("{}", serde_json::to_string_pretty(&registry.status())?);
    info!(%lease, "walkthrough finished");
    Ok(())
}

fn walkthrough_group() -> ResourceGroup {
    ResourceGroup {
        name: "walkthrough".to_string(),
        resources: vec![ResourceUnit {
            cpu_millis: 500,
            memory_bytes: 512 << 20,
            storage: Vec::new(),
            gpu_units: 0,
            endpoints: vec![Endpoint {
                kind: EndpointKind::LeasedIp,
                sequence_number: 0,
            }],
            count: 1,
        }],
    }
}

fn walkthrough_manifest(hostname: &str) -> Manifest {
    Manifest {
        group: "walkthrough".to_string(),
        services: vec![ManifestService {
            name: "web".to_string(),
            image: "nginx:1.25".to_string(),
            count: 1,
            expose: vec![
                ServiceExpose {
                    port: 80,
                    external_port: 0,
                    proto: Protocol::Tcp,
                    global: true,
                    hosts: vec![hostname.to_string()],
                    ip: None,
                },
                ServiceExpose {
                    port: 443,
                    external_port: 443,
                    proto: Protocol::Tcp,
                    global: true,
                    hosts: Vec::new(),
                    ip: Some("web".to_string()),
                },
            ],
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn walkthrough_manifest_uses_leased_ip() {
        let manifest = walkthrough_manifest("demo.example.com");
        assert_eq!(manifest.hostnames(), vec!["demo.example.com"]);
        assert_eq!(manifest.ip_endpoint_names(), vec!["web"]);
        assert_eq!(walkthrough_group().endpoint_quantity(EndpointKind::LeasedIp), 1);
    }

    #[test]
    fn sharing_key_subcommand_parses() {
        let cli = Cli::try_parse_from([
            "leasegridd",
            "sharing-key",
            "--owner",
            "akash1xyz",
            "--name",
            "My_Endpoint!",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::SharingKey { .. }));
    }
}
