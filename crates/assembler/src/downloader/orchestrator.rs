//! Download orchestration
//!
//! Drives one task from an empty destination to a finished installer
//! directory: resolve builds, fetch manifests, stream every package in order,
//! write the driver manifest. Failures go through the retry policy; pause and
//! cancel go through the cancel tracker. All task mutations are sent to the
//! registry coordinator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tokio::fs;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::downloader::cancel::{CancelTracker, ControlSignal};
use crate::downloader::catalog::Catalog;
use crate::downloader::config::DownloadConfig;
use crate::downloader::core::{
    files, DownloadError, FileOperation, HttpClient, ProgressAggregator, ProgressCallback, Result, TransferControl,
    TransferRequest, Transport,
};
use crate::downloader::driver;
use crate::downloader::manifest;
use crate::downloader::model::{
    DownloadTask, PackageRef, PackageStatus, PauseReason, PreparingStage, ProductToDownload, TaskId, TaskRequest,
    TaskStatus,
};
use crate::downloader::registry::{RegistryHandle, TaskEvent};
use crate::downloader::retry::{RetryDecision, RetryPolicy};
use crate::integrations::network::{self, AlwaysOnline, ConnectivityMonitor};

/// Name of the persisted manifest inside each sub-product directory
pub const MANIFEST_FILE_NAME: &str = "application.json";
const CANCELLED_MESSAGE: &str = "download cancelled";

/// How a call to [`DownloadOrchestrator::start_download_process`] ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Paused,
    Cancelled,
}

/// The package a download step is about to fetch
#[derive(Debug, Clone)]
struct PendingPackage {
    at: PackageRef,
    url: String,
    dest_dir: PathBuf,
    file_name: String,
    size: u64,
}

/// Top-level driver for download tasks. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct DownloadOrchestrator {
    transport: Arc<dyn Transport>,
    registry: RegistryHandle,
    tracker: CancelTracker,
    config: Arc<DownloadConfig>,
    catalog: Arc<Catalog>,
    retry: RetryPolicy,
    progress: ProgressAggregator,
    connectivity: Arc<dyn ConnectivityMonitor>,
    /// One run at a time per task; a resume waits for the paused run to unwind
    gates: Arc<Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl DownloadOrchestrator {
    /// Create an orchestrator that talks HTTP. Must be called inside a tokio runtime.
    pub fn new(config: DownloadConfig, catalog: Catalog) -> Result<Self> {
        let transport = HttpClient::from_config(&config)?;
        Self::with_transport(config, catalog, Arc::new(transport))
    }

    pub fn with_transport(config: DownloadConfig, catalog: Catalog, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            registry: RegistryHandle::spawn(config.event_capacity),
            tracker: CancelTracker::new(),
            retry: RetryPolicy::from_config(&config),
            progress: ProgressAggregator::new(config.progress_interval),
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            connectivity: Arc::new(AlwaysOnline),
            gates: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_connectivity(mut self, monitor: Arc<dyn ConnectivityMonitor>) -> Self {
        self.connectivity = monitor;
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cancel_tracker(&self) -> &CancelTracker {
        &self.tracker
    }

    /// Receive every task event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.registry.subscribe()
    }

    /// Register a new task. Nothing is downloaded until it is started.
    pub async fn create_task(&self, request: TaskRequest) -> Result<TaskId> {
        let task = DownloadTask::new(request);
        info!(
            "Created task {} for {} {} ({})",
            task.id, task.product_code, task.version, task.language
        );
        self.registry.insert(task).await
    }

    pub async fn task(&self, id: TaskId) -> Result<Option<DownloadTask>> {
        self.registry.get(id).await
    }

    /// All tasks in creation order
    pub async fn tasks(&self) -> Result<Vec<DownloadTask>> {
        self.registry.list().await
    }

    /// Run a task until it completes, pauses, is cancelled or fails.
    ///
    /// Starting a paused, retrying or recoverably failed task resumes it;
    /// packages already downloaded are not fetched again. Restarting a task
    /// that failed after exhausting its retries grants it a fresh retry budget.
    pub async fn start_download_process(&self, id: TaskId) -> Result<TaskOutcome> {
        let gate = self.gate(id);
        let _running = gate.lock().await;

        let task = self
            .registry
            .get(id)
            .await?
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
        if matches!(task.status, TaskStatus::Completed { .. }) {
            return Ok(TaskOutcome::Completed);
        }
        if !self.tracker.resume(id) {
            return Ok(TaskOutcome::Cancelled);
        }
        self.registry
            .update(id, |task| {
                if matches!(task.status, TaskStatus::Failed { recoverable: true, .. }) {
                    task.retry_count = 0;
                }
            })
            .await?;

        let span = info_span!("download_task", task = %id, product = %task.product_code);
        match self.drive(id).instrument(span).await {
            // Removed from the registry while running
            Err(DownloadError::TaskNotFound(_)) => Ok(TaskOutcome::Cancelled),
            other => other,
        }
    }

    /// Run [`start_download_process`](Self::start_download_process) on its own tokio task
    pub fn spawn(&self, id: TaskId) -> JoinHandle<Result<TaskOutcome>> {
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.start_download_process(id).await })
    }

    /// Pause an active task. In-flight transfers stop at their next checkpoint and keep their bytes.
    pub async fn pause(&self, id: TaskId) -> Result<()> {
        let tracker = self.tracker.clone();
        let paused = self
            .registry
            .update(id, move |task| {
                if !task.status.is_active() {
                    return false;
                }
                tracker.pause(id);
                task.status = TaskStatus::Paused {
                    reason: PauseReason::UserRequested,
                    resumable: true,
                };
                true
            })
            .await?;
        if paused {
            info!("Paused task {}", id);
        }
        Ok(())
    }

    /// Resume a paused task; same as starting it again
    pub async fn resume(&self, id: TaskId) -> Result<TaskOutcome> {
        info!("Resuming task {}", id);
        self.start_download_process(id).await
    }

    /// Cancel a task, discarding partial files and optionally the whole destination
    pub async fn cancel(&self, id: TaskId, delete_files: bool) -> Result<()> {
        let tracker = self.tracker.clone();
        let (task, cancelled) = self
            .registry
            .update(id, move |task| {
                if task.status.is_terminal() {
                    return (task.clone(), false);
                }
                tracker.cancel(id);
                // A run still unwinding removes whatever it wrote after this point
                task.purge_on_cancel = delete_files;
                task.status = TaskStatus::Failed {
                    message: CANCELLED_MESSAGE.to_string(),
                    error: None,
                    recoverable: false,
                };
                settle_current_package(task, PackageStatus::Queued);
                (task.clone(), true)
            })
            .await?;
        if cancelled {
            info!("Cancelled task {}", id);
        }

        if delete_files {
            files::remove_tree(&task.destination).await?;
            debug!("Deleted task directory {}", task.destination.display());
        } else if cancelled {
            discard_partials(&task).await;
        }
        Ok(())
    }

    /// Cancel and forget a task
    pub async fn remove_task(&self, id: TaskId, delete_files: bool) -> Result<()> {
        self.cancel(id, delete_files).await?;
        self.registry.remove(id).await?;
        self.forget(id);
        Ok(())
    }

    /// Drop completed and permanently failed tasks from the registry
    pub async fn clear_terminal(&self) -> Result<Vec<TaskId>> {
        let cleared = self.registry.clear_terminal().await?;
        for id in &cleared {
            self.forget(*id);
        }
        if !cleared.is_empty() {
            info!("Cleared {} finished tasks", cleared.len());
        }
        Ok(cleared)
    }

    /// Directory handed to the installer once the task has completed
    pub async fn installer_path(&self, id: TaskId) -> Result<PathBuf> {
        let task = self
            .registry
            .get(id)
            .await?
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
        match task.status {
            TaskStatus::Completed { .. } => Ok(task.destination),
            _ => Err(DownloadError::InvalidData {
                message: format!("task {} has not completed", id),
            }),
        }
    }

    fn gate(&self, id: TaskId) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        gates.entry(id).or_default().clone()
    }

    fn forget(&self, id: TaskId) {
        self.tracker.clear(id);
        self.gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
    }

    /// Retry loop around [`run_once`](Self::run_once)
    async fn drive(&self, id: TaskId) -> Result<TaskOutcome> {
        self.registry
            .update(id, |task| {
                task.started_at.get_or_insert_with(Instant::now);
            })
            .await?;

        loop {
            let error = match self.run_once(id).await {
                Ok(()) => return Ok(TaskOutcome::Completed),
                Err(error) => network::reclassify(error, self.connectivity.as_ref()),
            };
            if matches!(error, DownloadError::TaskNotFound(_) | DownloadError::CoordinatorClosed) {
                return Err(error);
            }

            let retry_count = self.registry.update(id, |task| task.retry_count).await?;
            match self.retry.decide(&error, retry_count) {
                RetryDecision::Interrupted => return self.interrupted(id).await,
                RetryDecision::Retry { attempt, delay, reason } => {
                    warn!(
                        "Attempt failed ({}), retry {}/{} in {:?}",
                        error,
                        attempt,
                        self.retry.max_attempts(),
                        delay
                    );
                    let max_attempts = self.retry.max_attempts();
                    let next_retry_at = SystemTime::now() + delay;
                    let scheduled = self
                        .transition(id, move |task| {
                            task.retry_count = attempt;
                            task.status = TaskStatus::Retrying {
                                attempt,
                                max_attempts,
                                reason,
                                next_retry_at,
                            };
                            settle_current_package(task, PackageStatus::Queued);
                        })
                        .await;
                    if let Err(stop) = scheduled {
                        if stop.is_interruption() {
                            return self.interrupted(id).await;
                        }
                        return Err(stop);
                    }

                    let token = self.tracker.token(id);
                    tokio::select! {
                        _ = token.cancelled() => return self.interrupted(id).await,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::Fail { message, recoverable } => {
                    warn!("Task {} failed: {}", id, error);
                    self.fail(id, message, &error, recoverable).await?;
                    return Err(error);
                }
            }
        }
    }

    /// One pass over the task: resolve if needed, then fetch every pending package
    async fn run_once(&self, id: TaskId) -> Result<()> {
        self.tracker.check(id)?;
        let task = self
            .registry
            .get(id)
            .await?
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
        if !task.is_resolved() {
            self.prepare(&task).await?;
        }

        while let Some(pending) = self.next_package(id).await? {
            self.download_package(id, pending).await?;
        }

        self.finish(id).await
    }

    /// Build the directory skeleton, resolve builds and read their manifests
    async fn prepare(&self, task: &DownloadTask) -> Result<()> {
        let id = task.id;
        self.transition(id, |task| task.status = TaskStatus::preparing(PreparingStage::Initializing))
            .await?;
        let products_dir = task.products_dir();
        files::ensure_dir(&products_dir).await?;

        let main = self
            .catalog
            .resolve_main(&task.product_code, &task.version, &self.config)?;
        let mut builds = vec![(main.clone(), main.version.clone(), task.product_code.clone())];
        for dependency in &main.dependencies {
            match self.catalog.resolve_dependency(dependency, &self.config) {
                Some(build) => builds.push((build, dependency.version.clone(), dependency.code.clone())),
                None => warn!(
                    "No build of dependency {} {} for an allowed platform, skipping",
                    dependency.code, dependency.version
                ),
            }
        }

        self.transition(id, |task| task.status = TaskStatus::preparing(PreparingStage::FetchingInfo))
            .await?;

        let mut products = Vec::with_capacity(builds.len());
        for (build, base_version, sap_code) in builds {
            let token = self.tracker.token(id);
            let text = tokio::select! {
                _ = token.cancelled() => return Err(self.tracker.interruption(id)),
                text = self.transport.fetch_manifest(&build.build_guid) => text?,
            };
            // Nothing may be written once the task was paused or cancelled
            self.tracker.check(id)?;

            let product_dir = products_dir.join(&sap_code);
            files::ensure_dir(&product_dir).await?;
            let manifest_path = product_dir.join(MANIFEST_FILE_NAME);
            fs::write(&manifest_path, &text)
                .await
                .map_err(|e| DownloadError::io(&manifest_path, FileOperation::Write, e))?;

            let packages = manifest::parse_manifest(&text, &task.language)?;
            debug!("{} {}: {} packages", sap_code, build.version, packages.len());
            products.push(ProductToDownload {
                sap_code,
                version: build.version,
                base_version,
                build_guid: build.build_guid,
                platform: build.platform,
                packages,
            });
        }

        let total_size: u64 = products.iter().map(ProductToDownload::total_size).sum();
        self.transition(id, move |task| {
            task.products = products;
            task.recompute_total_size();
            task.current_package = None;
            ProgressAggregator::refresh_totals(task);
        })
        .await?;
        info!("Resolved task {}: {} bytes to download", id, total_size);
        Ok(())
    }

    /// Pick the next pending package and mark the task as downloading it
    async fn next_package(&self, id: TaskId) -> Result<Option<PendingPackage>> {
        let tracker = self.tracker.clone();
        let catalog = self.catalog.clone();
        self.registry
            .update(id, move |task| -> Result<Option<PendingPackage>> {
                tracker.check(id)?;
                let Some(at) = task.next_pending() else {
                    return Ok(None);
                };
                let index = task.package_ordinal(at);
                let total = task.package_count();
                let dest_dir = task.products_dir().join(&task.products[at.product].sap_code);
                let package = &task.products[at.product].packages[at.package];
                let pending = PendingPackage {
                    at,
                    url: catalog.package_url(&package.download_url),
                    dest_dir,
                    file_name: package.full_package_name.clone(),
                    size: package.download_size,
                };

                task.status = TaskStatus::Downloading {
                    file_name: pending.file_name.clone(),
                    package_index: index,
                    total_packages: total,
                    start_time: SystemTime::now(),
                    eta: None,
                };
                task.current_package = Some(at);
                if let Some(package) = task.package_mut(at) {
                    package.status = PackageStatus::Downloading;
                    package.reset_transfer();
                }
                Ok(Some(pending))
            })
            .await?
    }

    async fn download_package(&self, id: TaskId, pending: PendingPackage) -> Result<()> {
        let at = pending.at;
        let request = TransferRequest {
            url: pending.url,
            dest_dir: pending.dest_dir,
            file_name: pending.file_name,
            expected_size: pending.size,
        };
        debug!("Downloading {} from {}", request.file_name, request.url);

        let registry = self.registry.clone();
        let aggregator = self.progress.clone();
        let progress: ProgressCallback = Arc::new(move |chunk| {
            let aggregator = aggregator.clone();
            let now = Instant::now();
            registry.notify(id, move |task| {
                aggregator.record(task, at, chunk, now);
            });
        });

        let control = TransferControl::new(id, self.tracker.clone());
        let size = self.transport.download(&request, &control, progress).await?;

        self.registry
            .update(id, move |task| {
                if let Some(package) = task.package_mut(at) {
                    package.mark_downloaded();
                }
                task.current_package = None;
                task.total_speed = 0.0;
                ProgressAggregator::refresh_totals(task);
            })
            .await?;
        info!("Downloaded {} ({} bytes)", request.file_name, size);
        Ok(())
    }

    /// Write the driver manifest and mark the task completed
    async fn finish(&self, id: TaskId) -> Result<()> {
        self.tracker.check(id)?;
        let task = self
            .registry
            .get(id)
            .await?
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
        driver::write(&task).await?;

        self.transition(id, |task| {
            let total_time = task.started_at.map(|t| t.elapsed()).unwrap_or_default();
            task.current_package = None;
            task.total_speed = 0.0;
            ProgressAggregator::refresh_totals(task);
            task.status = TaskStatus::Completed {
                total_time,
                total_size: task.total_size,
            };
        })
        .await?;
        info!("Task {} completed", id);
        Ok(())
    }

    /// Apply a state change unless the task was paused or cancelled in the meantime.
    ///
    /// The check runs on the coordinator, so it cannot interleave with the
    /// status write made by `pause` or `cancel`.
    async fn transition<F>(&self, id: TaskId, f: F) -> Result<()>
    where
        F: FnOnce(&mut DownloadTask) + Send + 'static,
    {
        let tracker = self.tracker.clone();
        self.registry
            .update(id, move |task| -> Result<()> {
                tracker.check(id)?;
                f(task);
                Ok(())
            })
            .await?
    }

    /// Stop after a pause or cancel. The status was already set by whoever interrupted.
    async fn interrupted(&self, id: TaskId) -> Result<TaskOutcome> {
        let task = self
            .registry
            .update(id, |task| {
                settle_current_package(task, PackageStatus::Queued);
                task.clone()
            })
            .await?;

        if self.tracker.signal(id) == ControlSignal::Cancel {
            discard_cancelled(&task).await;
            debug!("Task {} stopped: cancelled", id);
            Ok(TaskOutcome::Cancelled)
        } else {
            debug!("Task {} stopped: paused", id);
            Ok(TaskOutcome::Paused)
        }
    }

    async fn fail(&self, id: TaskId, message: String, error: &DownloadError, recoverable: bool) -> Result<()> {
        let detail = error.detailed_report();
        let tracker = self.tracker.clone();
        let (task, cancelled) = self
            .registry
            .update(id, move |task| {
                settle_current_package(task, PackageStatus::Failed);
                // A concurrent cancel already wrote the final status
                let cancelled = tracker.signal(id) == ControlSignal::Cancel;
                if !cancelled {
                    task.status = TaskStatus::Failed {
                        message,
                        error: Some(detail),
                        recoverable,
                    };
                }
                (task.clone(), cancelled)
            })
            .await?;
        if cancelled {
            discard_cancelled(&task).await;
        } else {
            discard_partials(&task).await;
        }
        Ok(())
    }
}

/// Clear the in-flight package once the transfer is no longer running
fn settle_current_package(task: &mut DownloadTask, status: PackageStatus) {
    if let Some(at) = task.current_package.take() {
        if let Some(package) = task.package_mut(at) {
            if !package.downloaded {
                package.status = status;
            }
            package.speed = 0.0;
        }
    }
    task.total_speed = 0.0;
}

/// Clean up after a cancelled run: the whole destination when the cancel asked
/// for it, otherwise just the partial files
async fn discard_cancelled(task: &DownloadTask) {
    if !task.purge_on_cancel {
        discard_partials(task).await;
        return;
    }
    match files::remove_tree(&task.destination).await {
        Ok(()) => debug!("Deleted task directory {}", task.destination.display()),
        Err(e) => warn!("Failed to delete task directory {}: {}", task.destination.display(), e),
    }
}

/// Delete the `.part` files of every package that has not finished
async fn discard_partials(task: &DownloadTask) {
    for (at, package) in task.packages() {
        if package.downloaded {
            continue;
        }
        if let Some(path) = task.package_path(at) {
            if let Err(e) = files::remove_partial(&path).await {
                warn!("Failed to remove partial download {}: {}", path.display(), e);
            }
        }
    }
}
