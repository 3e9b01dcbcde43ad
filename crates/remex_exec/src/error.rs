//! Errors surfaced by spawn runners.

use crate::platform::PlatformParseError;
use crate::result::SpawnResult;
use remex_core::CoreError;
use remex_storage::MerkleError;
use std::io;

/// An unrecoverable execution failure that still carries a result
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SpawnExecError {
    /// User facing message; a full cause chain when verbose failures are on
    pub message: String,
    /// Result with a concrete status and exit code
    pub result: SpawnResult,
}

/// Spawn runner error
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The action failed and cannot be recovered here
    #[error(transparent)]
    Exec(#[from] SpawnExecError),

    /// The build was cancelled
    #[error("Interrupted")]
    Interrupted,

    /// Local I/O failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Misconfiguration the user has to fix
    #[error("{message}")]
    User {
        /// Message
        message: String,
    },
}

impl SpawnError {
    /// Configuration error
    #[must_use]
    pub fn user(message: impl Into<String>) -> Self {
        Self::User {
            message: message.into(),
        }
    }

    /// The result carried by an execution failure
    #[must_use]
    pub const fn result(&self) -> Option<&SpawnResult> {
        match self {
            Self::Exec(e) => Some(&e.result),
            _ => None,
        }
    }
}

impl From<PlatformParseError> for SpawnError {
    fn from(err: PlatformParseError) -> Self {
        Self::user(format!("{err}: {}", err.parse_error()))
    }
}

impl From<MerkleError> for SpawnError {
    fn from(err: MerkleError) -> Self {
        match err {
            MerkleError::Metadata { path, source } => Self::Io(io::Error::new(
                source.kind(),
                format!("{}: {source}", path.display()),
            )),
            other => Self::user(other.to_string()),
        }
    }
}

impl From<CoreError> for SpawnError {
    fn from(err: CoreError) -> Self {
        Self::user(err.to_string())
    }
}
