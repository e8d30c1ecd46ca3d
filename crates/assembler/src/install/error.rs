//! Installation error types

use thiserror::Error;

/// Phrase an installer uses when cached credentials can no longer be used
pub const REAUTH_REQUIRED: &str = "needs re-authentication";

/// Errors that can occur during installation
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Installation failed: {0}")]
    InstallationFailed(String),

    #[error("Installation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstallError {
    /// The cached-credential path failed and only a full install can recover
    pub fn needs_reauthentication(&self) -> bool {
        matches!(self, InstallError::InstallationFailed(message) if message.contains(REAUTH_REQUIRED))
    }
}

pub type Result<T> = std::result::Result<T, InstallError>;
