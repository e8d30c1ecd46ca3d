//! Installation seam
//!
//! The assembler does not install anything itself. Once a task has completed,
//! its directory is handed to an [`InstallManager`] supplied by the host.

pub mod error;

pub use error::{InstallError, Result, REAUTH_REQUIRED};

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Installation progress information
#[derive(Debug, Clone, PartialEq)]
pub struct InstallProgress {
    /// 0.0 to 1.0
    pub progress: f64,
    pub message: String,
}

/// Progress callback type for installation updates
pub type InstallProgressCallback = Arc<dyn Fn(InstallProgress) + Send + Sync>;

#[async_trait]
pub trait InstallManager: Send + Sync {
    /// Run the full installation flow for an assembled installer directory
    async fn install(&self, path: &Path, progress: InstallProgressCallback) -> Result<()>;

    /// Abort a running installation
    async fn cancel(&self);

    /// Re-run an installation reusing cached credentials
    async fn retry(&self, path: &Path, progress: InstallProgressCallback) -> Result<()>;
}

/// Retry an installation, falling back to the full flow when the cached
/// credentials need re-authentication
pub async fn retry_install(
    manager: &dyn InstallManager,
    path: &Path,
    progress: InstallProgressCallback,
) -> Result<()> {
    match manager.retry(path, progress.clone()).await {
        Err(error) if error.needs_reauthentication() => {
            warn!("Retry of {} {}, running full installation", path.display(), REAUTH_REQUIRED);
            manager.install(path, progress).await
        }
        Ok(()) => {
            info!("Installation of {} succeeded on retry", path.display());
            Ok(())
        }
        Err(error) => Err(error),
    }
}
