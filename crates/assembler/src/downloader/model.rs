//! Task, sub-product and package entities
//!
//! These are plain data owned by the task registry. Everything that mutates
//! them runs on the registry's coordinator, so none of them carry locks.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use uuid::Uuid;

/// Opaque identifier of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    Core,
    NonCore,
}

impl PackageType {
    pub fn from_manifest(tag: &str) -> Self {
        if tag.eq_ignore_ascii_case("core") {
            PackageType::Core
        } else {
            PackageType::NonCore
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
}

/// One downloadable file of a sub-product
#[derive(Debug, Clone, Serialize)]
pub struct Package {
    pub package_type: PackageType,
    pub full_package_name: String,
    pub download_size: u64,
    /// Server-relative path, joined with the CDN base at download time
    pub download_url: String,
    pub downloaded: bool,
    pub progress: f64,
    pub downloaded_size: u64,
    pub speed: f64,
    pub status: PackageStatus,
    #[serde(skip)]
    pub last_update: Option<Instant>,
    #[serde(skip)]
    pub last_recorded_size: u64,
}

impl Package {
    pub fn new(
        package_type: PackageType,
        full_package_name: impl Into<String>,
        download_size: u64,
        download_url: impl Into<String>,
    ) -> Self {
        Self {
            package_type,
            full_package_name: full_package_name.into(),
            download_size,
            download_url: download_url.into(),
            downloaded: false,
            progress: 0.0,
            downloaded_size: 0,
            speed: 0.0,
            status: PackageStatus::Queued,
            last_update: None,
            last_recorded_size: 0,
        }
    }

    /// Forget throttling state between transfer attempts
    pub fn reset_transfer(&mut self) {
        self.speed = 0.0;
        self.last_update = None;
        self.last_recorded_size = self.downloaded_size;
    }

    pub fn mark_downloaded(&mut self) {
        self.downloaded = true;
        self.status = PackageStatus::Completed;
        self.progress = 1.0;
        self.downloaded_size = self.download_size;
        self.speed = 0.0;
        self.last_update = None;
    }
}

/// The main product or one of its dependencies, resolved to a build
#[derive(Debug, Clone, Serialize)]
pub struct ProductToDownload {
    pub sap_code: String,
    pub version: String,
    /// Version the dependency was declared against; the version itself for the main product
    pub base_version: String,
    pub build_guid: String,
    pub platform: String,
    pub packages: Vec<Package>,
}

impl ProductToDownload {
    pub fn total_size(&self) -> u64 {
        self.packages.iter().map(|p| p.download_size).sum()
    }
}

/// Position of a package inside a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PackageRef {
    pub product: usize,
    pub package: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreparingStage {
    Initializing,
    FetchingInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    UserRequested,
    NetworkIssue,
}

/// Current state of a task; exactly one holds at a time
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Preparing {
        message: String,
        stage: PreparingStage,
    },
    Downloading {
        file_name: String,
        package_index: usize,
        total_packages: usize,
        start_time: SystemTime,
        eta: Option<Duration>,
    },
    Paused {
        reason: PauseReason,
        resumable: bool,
    },
    Retrying {
        attempt: usize,
        max_attempts: usize,
        reason: String,
        next_retry_at: SystemTime,
    },
    Failed {
        message: String,
        error: Option<String>,
        recoverable: bool,
    },
    Completed {
        total_time: Duration,
        total_size: u64,
    },
}

impl TaskStatus {
    pub fn preparing(stage: PreparingStage) -> Self {
        let message = match stage {
            PreparingStage::Initializing => "initializing",
            PreparingStage::FetchingInfo => "fetching product information",
        };
        TaskStatus::Preparing {
            message: message.to_string(),
            stage,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Preparing { .. } => "preparing",
            TaskStatus::Downloading { .. } => "downloading",
            TaskStatus::Paused { .. } => "paused",
            TaskStatus::Retrying { .. } => "retrying",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Completed { .. } => "completed",
        }
    }

    /// Preparing, downloading or waiting for a retry
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Preparing { .. } | TaskStatus::Downloading { .. } | TaskStatus::Retrying { .. }
        )
    }

    /// No further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed { .. } | TaskStatus::Failed { recoverable: false, .. }
        )
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, TaskStatus::Paused { .. })
    }
}

/// What a caller asks for when creating a task
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub product_code: String,
    pub version: String,
    pub language: String,
    pub display_name: String,
    /// Task directory; the installer skeleton is created inside it
    pub destination: PathBuf,
}

impl TaskRequest {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(product_code: S, version: S, destination: P) -> Self {
        let product_code = product_code.into();
        Self {
            display_name: product_code.clone(),
            product_code,
            version: version.into(),
            language: "en_US".to_string(),
            destination: destination.into(),
        }
    }

    pub fn with_language<S: Into<String>>(mut self, language: S) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_display_name<S: Into<String>>(mut self, display_name: S) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Conventional name of the installer bundle directory for a platform
    pub fn installer_name(&self, platform: &str) -> String {
        format!(
            "Install {}_{}-{}-{}.app",
            self.product_code, self.version, self.language, platform
        )
    }
}

/// One user-initiated download and assembly job
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub id: TaskId,
    pub product_code: String,
    pub version: String,
    pub language: String,
    pub display_name: String,
    pub destination: PathBuf,
    pub created_at: SystemTime,
    pub retry_count: usize,
    pub status: TaskStatus,
    pub total_size: u64,
    pub total_downloaded_size: u64,
    pub total_progress: f64,
    pub total_speed: f64,
    pub products: Vec<ProductToDownload>,
    pub current_package: Option<PackageRef>,
    #[serde(skip)]
    pub started_at: Option<Instant>,
    /// Set by a cancel that deletes files; the unwinding run removes the destination too
    #[serde(skip)]
    pub purge_on_cancel: bool,
}

impl DownloadTask {
    pub fn new(request: TaskRequest) -> Self {
        Self {
            id: TaskId::new(),
            product_code: request.product_code,
            version: request.version,
            language: request.language,
            display_name: request.display_name,
            destination: request.destination,
            created_at: SystemTime::now(),
            retry_count: 0,
            status: TaskStatus::preparing(PreparingStage::Initializing),
            total_size: 0,
            total_downloaded_size: 0,
            total_progress: 0.0,
            total_speed: 0.0,
            products: Vec::new(),
            current_package: None,
            started_at: None,
            purge_on_cancel: false,
        }
    }

    /// Manifests have been fetched and packages enumerated
    pub fn is_resolved(&self) -> bool {
        !self.products.is_empty()
    }

    pub fn products_dir(&self) -> PathBuf {
        products_dir(&self.destination)
    }

    pub fn package(&self, at: PackageRef) -> Option<&Package> {
        self.products.get(at.product)?.packages.get(at.package)
    }

    pub fn package_mut(&mut self, at: PackageRef) -> Option<&mut Package> {
        self.products.get_mut(at.product)?.packages.get_mut(at.package)
    }

    /// All packages in download order
    pub fn packages(&self) -> impl Iterator<Item = (PackageRef, &Package)> {
        self.products.iter().enumerate().flat_map(|(product, p)| {
            p.packages
                .iter()
                .enumerate()
                .map(move |(package, pkg)| (PackageRef { product, package }, pkg))
        })
    }

    pub fn package_count(&self) -> usize {
        self.products.iter().map(|p| p.packages.len()).sum()
    }

    /// Zero-based position of a package across all sub-products
    pub fn package_ordinal(&self, at: PackageRef) -> usize {
        self.products[..at.product.min(self.products.len())]
            .iter()
            .map(|p| p.packages.len())
            .sum::<usize>()
            + at.package
    }

    /// First package that still needs to be fetched
    pub fn next_pending(&self) -> Option<PackageRef> {
        self.packages().find(|(_, p)| !p.downloaded).map(|(at, _)| at)
    }

    pub fn recompute_total_size(&mut self) {
        self.total_size = self.products.iter().map(ProductToDownload::total_size).sum();
    }

    /// Path of a package on disk
    pub fn package_path(&self, at: PackageRef) -> Option<PathBuf> {
        let product = self.products.get(at.product)?;
        let package = product.packages.get(at.package)?;
        Some(self.products_dir().join(&product.sap_code).join(&package.full_package_name))
    }
}

/// `<task directory>/Contents/Resources/products`
pub fn products_dir(destination: &Path) -> PathBuf {
    destination.join("Contents").join("Resources").join("products")
}
