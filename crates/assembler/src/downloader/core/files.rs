//! File operation utilities
//!
//! Downloads land in a `.part` file next to their destination and are renamed
//! into place once complete, so a destination either exists in full or not at all.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::downloader::core::{DownloadError, FileOperation, Result};

/// Temporary path used while a file is being downloaded
pub fn temp_path(dest_path: &Path) -> PathBuf {
    let mut name = dest_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest_path.with_file_name(name)
}

pub async fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| DownloadError::io(dir, FileOperation::CreateDir, e))
}

/// Move a finished temporary file over `dest_path` and confirm it arrived
pub async fn atomic_replace(temp_path: &Path, dest_path: &Path) -> Result<()> {
    if let Some(parent) = dest_path.parent() {
        ensure_dir(parent).await?;
    }
    fs::rename(temp_path, dest_path)
        .await
        .map_err(|e| DownloadError::io(dest_path, FileOperation::Move, e))?;

    let present = fs::try_exists(dest_path).await.unwrap_or(false);
    if !present {
        return Err(DownloadError::MoveVerification {
            path: dest_path.to_path_buf(),
        });
    }
    debug!("Atomically moved {} to {}", temp_path.display(), dest_path.display());
    Ok(())
}

/// Size of an existing partial download, 0 when there is none
pub async fn partial_size(temp_path: &Path) -> u64 {
    fs::metadata(temp_path).await.map(|m| m.len()).unwrap_or(0)
}

/// Delete the partial download for `dest_path`, ignoring a missing file
pub async fn remove_partial(dest_path: &Path) -> Result<()> {
    let temp = temp_path(dest_path);
    match fs::remove_file(&temp).await {
        Ok(()) => {
            debug!("Removed partial download {}", temp.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::io(&temp, FileOperation::Delete, e)),
    }
}

/// Recursively delete a task directory, ignoring a missing directory
pub async fn remove_tree(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::io(dir, FileOperation::Delete, e)),
    }
}
