//! Console rendering of task events

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::downloader::model::{TaskId, TaskStatus};
use crate::downloader::registry::TaskEvent;

/// Prints task events to stdout, optionally for a single task
#[derive(Debug, Clone)]
pub struct ConsoleReporter {
    pub verbose: bool,
    task: Option<TaskId>,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose, task: None }
    }

    /// Only report events of `task`
    pub fn for_task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }

    /// Line to print for an event, if any
    pub fn render(&self, event: &TaskEvent) -> Option<String> {
        if self.task.is_some_and(|id| id != event.task_id()) {
            return None;
        }

        match event {
            TaskEvent::Created { product_code, version, .. } => {
                Some(format!("📦 Task created: {} {}", product_code, version))
            }
            TaskEvent::Progress { downloaded, total, progress, speed, .. } => {
                let speed_mb = speed / 1_000_000.0;
                Some(format!(
                    "⏬ {:.1}% ({}/{} bytes, {:.1} MB/s)",
                    progress * 100.0,
                    downloaded,
                    total,
                    speed_mb
                ))
            }
            TaskEvent::PackageCompleted { package, .. } => {
                self.verbose.then(|| format!("✅ Package complete: {}", package))
            }
            TaskEvent::StatusChanged { status, .. } => Some(describe(status)),
            TaskEvent::Removed { .. } => self.verbose.then(|| "🗑️ Task removed".to_string()),
        }
    }

    /// Print events from `events` until the channel closes
    pub fn spawn(self, mut events: broadcast::Receiver<TaskEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(line) = self.render(&event) {
                            println!("{}", line);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => debug!("Console reporter skipped {} events", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn describe(status: &TaskStatus) -> String {
    match status {
        TaskStatus::Preparing { message, .. } => format!("⏳ Preparing: {}", message),
        TaskStatus::Downloading { file_name, package_index, total_packages, .. } => {
            format!("📥 Downloading {} ({}/{})", file_name, package_index + 1, total_packages)
        }
        TaskStatus::Paused { .. } => "⏸️ Paused".to_string(),
        TaskStatus::Retrying { attempt, max_attempts, reason, .. } => {
            format!("🔄 Retry {}/{}: {}", attempt, max_attempts, reason)
        }
        TaskStatus::Failed { message, recoverable, .. } => {
            let hint = if *recoverable { " (can be retried)" } else { "" };
            format!("❌ Failed: {}{}", message, hint)
        }
        TaskStatus::Completed { total_time, total_size } => {
            format!("🎉 Completed: {} bytes in {:.1}s", total_size, total_time.as_secs_f64())
        }
    }
}
