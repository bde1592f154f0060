//! Provider configuration (`leasegrid.toml`) parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ResourceTotals;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: ProviderSection,
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection {
    /// On-chain address of this provider.
    pub address: String,
}

/// Advertised cluster capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// Cores ("64", "1.5") or millicores ("500m").
    pub cpu: String,
    /// Bytes with an optional K/M/G/T or Ki/Mi/Gi/Ti suffix.
    pub memory: String,
    pub storage: String,
    #[serde(default)]
    pub gpu: u64,
    /// Externally leased IPs available to tenants.
    #[serde(default)]
    pub endpoints: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub deploy_attempts: Option<u32>,
    pub deploy_backoff: Option<String>,
    pub deploy_backoff_max: Option<String>,
    pub call_timeout: Option<String>,
    pub ip_poll_interval: Option<String>,
    pub status_attempts: Option<u32>,
    pub convergence_timeout: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid quantity for {field}: {value:?}")]
    InvalidQuantity { field: &'static str, value: String },
    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },
}

impl ProviderConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ProviderConfig = toml::from_str(content)?;
        // Surface bad quantities at load time rather than first use.
        config.inventory.capacity()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl InventoryConfig {
    /// Parse the advertised capacity into per-class totals.
    pub fn capacity(&self) -> Result<ResourceTotals, ConfigError> {
        Ok(ResourceTotals {
            cpu_millis: parse_cpu_millis(&self.cpu).ok_or_else(|| ConfigError::InvalidQuantity {
                field: "inventory.cpu",
                value: self.cpu.clone(),
            })?,
            memory_bytes: parse_bytes(&self.memory).ok_or_else(|| ConfigError::InvalidQuantity {
                field: "inventory.memory",
                value: self.memory.clone(),
            })?,
            storage_bytes: parse_bytes(&self.storage).ok_or_else(|| {
                ConfigError::InvalidQuantity {
                    field: "inventory.storage",
                    value: self.storage.clone(),
                }
            })?,
            gpu_units: self.gpu,
            endpoints: self.endpoints,
        })
    }
}

/// Resolve an optional duration field, falling back to `default` when unset.
pub fn duration_field(
    field: &'static str,
    value: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw).ok_or_else(|| ConfigError::InvalidDuration {
            field,
            value: raw.to_string(),
        }),
    }
}

/// Parse "500ms", "5s", "2m" or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn parse_cpu_millis(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(millis) = s.strip_suffix('m') {
        return millis.parse::<u64>().ok();
    }
    let cores: f64 = s.parse().ok()?;
    if !cores.is_finite() || cores < 0.0 {
        return None;
    }
    Some((cores * 1000.0).round() as u64)
}

fn parse_bytes(s: &str) -> Option<u64> {
    const UNITS: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    let s = s.trim();
    for (suffix, multiplier) in UNITS {
        if let Some(n) = s.strip_suffix(suffix) {
            return n.trim().parse::<u64>().ok()?.checked_mul(*multiplier);
        }
    }
    s.parse::<u64>().ok()
}
