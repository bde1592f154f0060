//! Timing and retry settings for the coordinator.

use std::time::Duration;

use leasegrid_core::ConfigError;
use leasegrid_core::config::{LifecycleConfig, duration_field};

use crate::retry::Backoff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// Deploy attempts before giving up with `DeployFailed`.
    pub deploy_attempts: u32,
    pub deploy_backoff: Duration,
    pub deploy_backoff_max: Duration,
    /// Deadline for any single backend or hostname call.
    pub call_timeout: Duration,
    pub ip_poll_interval: Duration,
    pub status_attempts: u32,
    /// How long a migration waits for the destination to serve the
    /// transferred hostnames.
    pub convergence_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            deploy_attempts: 5,
            deploy_backoff: Duration::from_millis(500),
            deploy_backoff_max: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            ip_poll_interval: Duration::from_secs(5),
            status_attempts: 3,
            convergence_timeout: Duration::from_secs(120),
        }
    }
}

impl LifecycleSettings {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.deploy_backoff, self.deploy_backoff_max)
    }
}

impl TryFrom<&LifecycleConfig> for LifecycleSettings {
    type Error = ConfigError;

    fn try_from(cfg: &LifecycleConfig) -> Result<Self, Self::Error> {
        let d = LifecycleSettings::default();
        Ok(Self {
            deploy_attempts: cfg.deploy_attempts.unwrap_or(d.deploy_attempts).max(1),
            deploy_backoff: duration_field(
                "deploy_backoff",
                cfg.deploy_backoff.as_deref(),
                d.deploy_backoff,
            )?,
            deploy_backoff_max: duration_field(
                "deploy_backoff_max",
                cfg.deploy_backoff_max.as_deref(),
                d.deploy_backoff_max,
            )?,
            call_timeout: duration_field(
                "call_timeout",
                cfg.call_timeout.as_deref(),
                d.call_timeout,
            )?,
            ip_poll_interval: duration_field(
                "ip_poll_interval",
                cfg.ip_poll_interval.as_deref(),
                d.ip_poll_interval,
            )?,
            status_attempts: cfg.status_attempts.unwrap_or(d.status_attempts).max(1),
            convergence_timeout: duration_field(
                "convergence_timeout",
                cfg.convergence_timeout.as_deref(),
                d.convergence_timeout,
            )?,
        })
    }
}
