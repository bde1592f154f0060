//! Hostname service error types.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostnameError {
    #[error("hostname {hostname} is in use by another owner ({owner})")]
    Conflict { hostname: String, owner: String },

    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),

    #[error("hostname service unavailable: {0}")]
    Unavailable(String),
}

impl HostnameError {
    /// Only transport failures are worth retrying; conflicts are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HostnameError::Unavailable(_))
    }
}

pub type HostnameResult<T> = Result<T, HostnameError>;
