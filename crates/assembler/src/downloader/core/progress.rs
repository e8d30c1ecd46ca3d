//! Progress tracking: package byte counts rolled up into task progress

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::downloader::model::{DownloadTask, PackageRef, PackageStatus, TaskStatus};

/// One progress notification from a package transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Bytes received in this chunk
    pub bytes_written: u64,
    /// Bytes in the file so far, including any resumed prefix
    pub total_written: u64,
    /// Size the transfer is expected to reach
    pub expected_total: u64,
}

/// Progress callback for package transfers
pub type ProgressCallback = Arc<dyn Fn(ChunkProgress) + Send + Sync>;

/// Throttled roll-up of package progress into task totals
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    interval: Duration,
}

impl ProgressAggregator {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Record a chunk for the package at `at`.
    ///
    /// Returns true when task-visible state was updated. Updates are committed
    /// at most once per interval per package, except that reaching the
    /// expected size always commits and marks the package completed.
    pub fn record(&self, task: &mut DownloadTask, at: PackageRef, chunk: ChunkProgress, now: Instant) -> bool {
        if chunk.expected_total == 0 {
            return false;
        }
        let Some(package) = task.package_mut(at) else {
            return false;
        };
        if package.downloaded {
            return false;
        }

        let finished = chunk.total_written >= chunk.expected_total;
        let due = package
            .last_update
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if !due && !finished {
            return false;
        }

        let transferred = chunk.total_written.saturating_sub(package.last_recorded_size);
        package.speed = match package.last_update {
            Some(last) => {
                let elapsed = now.duration_since(last).as_secs_f64();
                if elapsed > 0.0 {
                    transferred as f64 / elapsed
                } else {
                    transferred as f64
                }
            }
            None => transferred as f64,
        };
        package.downloaded_size = chunk.total_written.min(package.download_size.max(chunk.expected_total));
        package.progress = (chunk.total_written as f64 / chunk.expected_total as f64).clamp(0.0, 1.0);
        package.status = if finished {
            PackageStatus::Completed
        } else {
            PackageStatus::Downloading
        };
        package.last_update = Some(now);
        package.last_recorded_size = chunk.total_written;
        let speed = package.speed;

        task.current_package = Some(at);
        task.total_speed = speed;
        Self::refresh_totals(task);
        true
    }

    /// Recompute `total_downloaded_size`, `total_progress` and the ETA from package state
    pub fn refresh_totals(task: &mut DownloadTask) {
        let current = task.current_package;
        let downloaded: u64 = task
            .packages()
            .map(|(at, package)| {
                if package.downloaded {
                    package.download_size
                } else if Some(at) == current {
                    package.downloaded_size.min(package.download_size)
                } else {
                    0
                }
            })
            .sum();
        task.total_downloaded_size = downloaded;

        let computed = if task.total_size > 0 {
            (downloaded as f64 / task.total_size as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        // A server that ignores Range restarts the package from zero
        task.total_progress = computed.max(task.total_progress).clamp(0.0, 1.0);

        let remaining = task.total_size.saturating_sub(downloaded);
        let speed = task.total_speed;
        if let TaskStatus::Downloading { eta, .. } = &mut task.status {
            *eta = (speed > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / speed));
        }
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
