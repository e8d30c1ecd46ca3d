//! Installer assembler library
//!
//! Downloads multi-component installer payloads from a distribution network
//! and lays them out as an installer directory. A task resolves the requested
//! product and its dependencies to builds, fetches each build's manifest,
//! streams every package to disk and finally writes a driver manifest.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use assembler::{CatalogSource, DownloadConfig, DownloadOrchestrator, JsonCatalog, TaskEvent, TaskRequest};
//!
//! # async fn example() -> assembler::Result<()> {
//! let config = DownloadConfig::default();
//! let catalog = JsonCatalog::new("catalog.json", &config).fetch_catalog().await?;
//! let orchestrator = DownloadOrchestrator::new(config, catalog)?;
//!
//! let mut events = orchestrator.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         if let TaskEvent::Progress { progress, .. } = event {
//!             println!("{:.1}%", progress * 100.0);
//!         }
//!     }
//! });
//!
//! let request = TaskRequest::new("PHSP", "25.0", "/tmp/Install PHSP.app").with_language("en_US");
//! let id = orchestrator.create_task(request).await?;
//! let outcome = orchestrator.start_download_process(id).await?;
//! println!("Task finished: {:?}", outcome);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Sequential packages, concurrent tasks**: each task fetches its packages one by one
//! - **Retry logic**: recoverable network failures are retried after a fixed or doubling delay
//! - **Pause, resume and cancel**: cooperative checkpoints; paused transfers resume with `Range`
//! - **Progress tracking**: throttled roll-up of package bytes into task progress, speed and ETA
//! - **Events**: every state change is published on a broadcast channel

pub mod downloader;
pub mod install;
pub mod integrations;

// Re-export commonly used types for convenience
pub use downloader::{
    CancelTracker, Catalog, CatalogSource, DownloadConfig, DownloadConfigBuilder, DownloadError, DownloadOrchestrator,
    DownloadTask, ErrorKind, JsonCatalog, Package, PackageStatus, ProductToDownload, Result, RetryPolicy, TaskEvent,
    TaskId, TaskOutcome, TaskRequest, TaskStatus,
};
pub use install::{InstallError, InstallManager};
pub use integrations::{AlwaysOnline, ConnectivityMonitor, ConsoleReporter};
