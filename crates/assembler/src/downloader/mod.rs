//! Downloader module
//!
//! The orchestration engine: task model, registry coordinator, cancel
//! tracking, retry policy, catalog resolution, manifest parsing and the
//! orchestrator that ties them together.

pub mod cancel;
pub mod catalog;
pub mod config;
pub mod core;
pub mod driver;
pub mod manifest;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod retry;

// Re-export main types for convenience
pub use cancel::{CancelTracker, ControlSignal};
pub use catalog::{Catalog, CatalogSource, Dependency, JsonCatalog, Product, ProductVersion};
pub use config::{DownloadConfig, DownloadConfigBuilder};
pub use self::core::{
    ChunkProgress, DownloadError, ErrorKind, ErrorSeverity, FileOperation, HttpClient, ProgressAggregator,
    ProgressCallback, Result, TransferControl, TransferRequest, Transport,
};
pub use model::{
    DownloadTask, Package, PackageRef, PackageStatus, PackageType, PauseReason, PreparingStage, ProductToDownload,
    TaskId, TaskRequest, TaskStatus,
};
pub use orchestrator::{DownloadOrchestrator, TaskOutcome};
pub use registry::{RegistryHandle, TaskEvent, TaskRegistry};
pub use retry::{RetryDecision, RetryPolicy};

#[cfg(test)]
mod tests;
