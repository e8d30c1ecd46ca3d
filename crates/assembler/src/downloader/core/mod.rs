//! Core types used throughout the downloader
//!
//! Errors, file helpers, progress accounting and the HTTP transport. Everything
//! above this module depends on these, never the other way round.

pub mod error;
pub mod files;
pub mod http;
pub mod progress;

pub use error::{DownloadError, ErrorKind, ErrorSeverity, FileOperation, Result};
pub use http::{HttpClient, TransferControl, TransferRequest, Transport};
pub use progress::{ChunkProgress, ProgressAggregator, ProgressCallback};
