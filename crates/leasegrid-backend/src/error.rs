//! Backend error types.

use thiserror::Error;

/// Stable exec failure set, independent of the cluster technology.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("no such service exists with that name")]
    NoSuchService,

    #[error("pod index out of range")]
    PodIndexOutOfRange,

    #[error("command could not be executed because it does not exist")]
    CommandNotFound,

    #[error("remote process exited with code {0}")]
    NonZeroExit(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("lease not found in backend")]
    NotFound,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend operation failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl BackendError {
    /// Transient failures that a bounded retry may fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Failed(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
