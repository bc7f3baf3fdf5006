//! Crate-wide error type.
//!
//! Expected failure modes of the sandbox and subprocess layers are returned
//! as data (`PathError`, `SubprocessOutcome`). This type covers the cases
//! that abort an operation: denied sessions, busy workspaces, bad input and
//! bad configuration.

use crate::config::ConfigError;
use crate::indexer::lock::WorkspaceBusy;
use crate::isolation::DenyReason;
use crate::sandbox::PathError;

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("access denied: {0}")]
    Denied(DenyReason),

    #[error(transparent)]
    Busy(#[from] WorkspaceBusy),

    #[error(
        "index timeout of {}s is out of range ({}s..={}s)",
        requested.as_secs(),
        min.as_secs(),
        max.as_secs()
    )]
    InvalidTimeout {
        requested: Duration,
        min: Duration,
        max: Duration,
    },

    #[error("cannot run an empty command")]
    EmptyCommand,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code for API responses and audit rows.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_INVALID",
            Error::Path(error) => error.code(),
            Error::Denied(reason) => reason.code(),
            Error::Busy(_) => "INDEXING_BUSY",
            Error::InvalidTimeout { .. } => "INVALID_TIMEOUT",
            Error::EmptyCommand | Error::Io(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<DenyReason> for Error {
    fn from(reason: DenyReason) -> Self {
        Error::Denied(reason)
    }
}
