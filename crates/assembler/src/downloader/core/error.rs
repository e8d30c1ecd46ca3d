//! Error types for the download engine with classification and recovery information

use std::error::Error;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while resolving, downloading or assembling a task
#[derive(Error, Debug)]
pub enum DownloadError {
    /// No usable network path to the server
    #[error("No network connection while requesting '{url}'")]
    NoConnection {
        url: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Network timeout with retry suggestion
    #[error("Request to '{url}' timed out (try again or check network)")]
    NetworkTimeout {
        url: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Host could not be resolved or refused the connection
    #[error("Server for '{url}' is unreachable")]
    ServerUnreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Unclassified transport failure
    #[error("HTTP request to '{url}' failed")]
    HttpRequest {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Server answered with a non-success status
    #[error("HTTP {status} from '{url}': {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },

    /// The body ended at a different length than the manifest announced
    #[error("Size mismatch for '{url}': expected {expected} bytes, got {actual}")]
    SizeMismatch { url: String, expected: u64, actual: u64 },

    /// File system I/O errors with file context
    #[error("File operation failed while {operation} '{path}'")]
    FileSystem {
        path: PathBuf,
        operation: FileOperation,
        #[source]
        source: std::io::Error,
    },

    /// The file was moved into place but is not there afterwards
    #[error("Downloaded file is missing after move: '{path}'")]
    MoveVerification { path: PathBuf },

    /// Insufficient disk space
    #[error("Insufficient disk space while {operation} '{path}'")]
    InsufficientSpace {
        path: PathBuf,
        operation: FileOperation,
        #[source]
        source: std::io::Error,
    },

    /// Permission denied errors with suggestions
    #[error("Permission denied while {operation} '{path}'")]
    PermissionDenied {
        path: PathBuf,
        operation: FileOperation,
        #[source]
        source: std::io::Error,
    },

    /// Manifest or catalog content that cannot be used
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// URL parsing errors with helpful suggestions
    #[error("Invalid URL '{url}': {suggestion}")]
    InvalidUrl {
        url: String,
        suggestion: String,
        #[source]
        source: url::ParseError,
    },

    /// Configuration errors
    #[error("Invalid configuration: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// The task id is not known to the registry
    #[error("Task {0} not found")]
    TaskNotFound(String),

    /// The task coordinator is no longer running
    #[error("Task coordinator has shut down")]
    CoordinatorClosed,

    /// Download cancelled by user
    #[error("Download cancelled: {reason}")]
    Cancelled { reason: String },

    /// Download paused by user
    #[error("Download paused")]
    Paused,
}

/// Types of file operations for error context
#[derive(Debug, Clone, PartialEq)]
pub enum FileOperation {
    Read,
    Write,
    Create,
    Delete,
    Move,
    Metadata,
    CreateDir,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOperation::Read => write!(f, "reading"),
            FileOperation::Write => write!(f, "writing"),
            FileOperation::Create => write!(f, "creating"),
            FileOperation::Delete => write!(f, "deleting"),
            FileOperation::Move => write!(f, "moving"),
            FileOperation::Metadata => write!(f, "reading metadata"),
            FileOperation::CreateDir => write!(f, "creating directory"),
        }
    }
}

/// Broad error families used by the retry policy and for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Storage,
    Data,
    Filesystem,
    Cancelled,
    Configuration,
}

pub type Result<T> = std::result::Result<T, DownloadError>;

impl DownloadError {
    /// Wrap an I/O error, pulling out the storage conditions that are never worth retrying
    pub fn io(path: impl AsRef<Path>, operation: FileOperation, source: std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match source.kind() {
            std::io::ErrorKind::StorageFull => {
                DownloadError::InsufficientSpace { path, operation, source }
            }
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::ReadOnlyFilesystem => {
                DownloadError::PermissionDenied { path, operation, source }
            }
            _ => DownloadError::FileSystem { path, operation, source },
        }
    }

    /// Classify a transport error raised while talking to `url`
    pub fn transport(url: &str, source: reqwest::Error) -> Self {
        let url = url.to_string();
        if source.is_timeout() {
            return DownloadError::NetworkTimeout { url, source: Some(source) };
        }
        if source.is_connect() {
            let offline = io_cause(&source).is_some_and(|io| {
                matches!(
                    io.kind(),
                    std::io::ErrorKind::NetworkDown | std::io::ErrorKind::NetworkUnreachable
                )
            });
            if offline {
                return DownloadError::NoConnection { url, source: Some(source) };
            }
            return DownloadError::ServerUnreachable { url, source };
        }
        DownloadError::HttpRequest { url, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::NoConnection { .. }
            | DownloadError::NetworkTimeout { .. }
            | DownloadError::ServerUnreachable { .. }
            | DownloadError::HttpRequest { .. }
            | DownloadError::HttpStatus { .. }
            | DownloadError::SizeMismatch { .. } => ErrorKind::Network,
            DownloadError::InsufficientSpace { .. } | DownloadError::PermissionDenied { .. } => {
                ErrorKind::Storage
            }
            DownloadError::InvalidData { .. } | DownloadError::InvalidUrl { .. } => ErrorKind::Data,
            DownloadError::FileSystem { .. } | DownloadError::MoveVerification { .. } => {
                ErrorKind::Filesystem
            }
            DownloadError::Cancelled { .. } | DownloadError::Paused => ErrorKind::Cancelled,
            DownloadError::Configuration { .. }
            | DownloadError::TaskNotFound(_)
            | DownloadError::CoordinatorClosed => ErrorKind::Configuration,
        }
    }

    /// Check if error is recoverable (should retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            DownloadError::NoConnection { .. } => true,
            DownloadError::NetworkTimeout { .. } => true,
            DownloadError::ServerUnreachable { .. } => true,
            DownloadError::HttpRequest { .. } => true,
            // Client errors will not change on a second attempt
            DownloadError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            // Usually a truncated transfer; the partial file is resumed
            DownloadError::SizeMismatch { .. } => true,
            DownloadError::InsufficientSpace { .. } => false,
            DownloadError::PermissionDenied { .. } => false,
            DownloadError::FileSystem { .. } => false,
            DownloadError::MoveVerification { .. } => false,
            DownloadError::InvalidData { .. } => false,
            DownloadError::InvalidUrl { .. } => false,
            DownloadError::Configuration { .. } => false,
            DownloadError::TaskNotFound(_) => false,
            DownloadError::CoordinatorClosed => false,
            DownloadError::Cancelled { .. } => false,
            DownloadError::Paused => false,
        }
    }

    /// Pause and cancel are deliberate stops rather than failures
    pub fn is_interruption(&self) -> bool {
        matches!(self, DownloadError::Cancelled { .. } | DownloadError::Paused)
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            DownloadError::NoConnection { .. } => "no_connection",
            DownloadError::NetworkTimeout { .. } => "network_timeout",
            DownloadError::ServerUnreachable { .. } => "server_unreachable",
            DownloadError::HttpRequest { .. } => "http_request",
            DownloadError::HttpStatus { .. } => "http_status",
            DownloadError::SizeMismatch { .. } => "size_mismatch",
            DownloadError::FileSystem { .. } => "file_system",
            DownloadError::MoveVerification { .. } => "move_verification",
            DownloadError::InsufficientSpace { .. } => "insufficient_space",
            DownloadError::PermissionDenied { .. } => "permission_denied",
            DownloadError::InvalidData { .. } => "invalid_data",
            DownloadError::InvalidUrl { .. } => "invalid_url",
            DownloadError::Configuration { .. } => "configuration",
            DownloadError::TaskNotFound(_) => "task_not_found",
            DownloadError::CoordinatorClosed => "coordinator_closed",
            DownloadError::Cancelled { .. } => "cancelled",
            DownloadError::Paused => "paused",
        }
    }

    /// Get severity level for error prioritization
    pub fn severity(&self) -> ErrorSeverity {
        match self.kind() {
            ErrorKind::Cancelled => ErrorSeverity::Low,
            ErrorKind::Network => ErrorSeverity::Medium,
            ErrorKind::Data | ErrorKind::Filesystem | ErrorKind::Configuration => ErrorSeverity::High,
            ErrorKind::Storage => ErrorSeverity::Critical,
        }
    }

    /// Short message suitable for a task status
    pub fn user_message(&self) -> String {
        match self {
            DownloadError::NoConnection { .. } => "no network connection".to_string(),
            DownloadError::NetworkTimeout { .. } => "network request timed out".to_string(),
            DownloadError::ServerUnreachable { .. } => "server unreachable".to_string(),
            DownloadError::InsufficientSpace { .. } => "insufficient storage space".to_string(),
            DownloadError::PermissionDenied { .. } => "permission denied".to_string(),
            DownloadError::Cancelled { .. } => "download cancelled".to_string(),
            other => other.to_string(),
        }
    }

    /// Get user-friendly suggestion for resolving the error
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            DownloadError::NoConnection { .. } => Some("Check your internet connection"),
            DownloadError::NetworkTimeout { .. } => {
                Some("Check your internet connection or try increasing the timeout value")
            }
            DownloadError::InvalidUrl { suggestion, .. } => Some(suggestion),
            DownloadError::InsufficientSpace { .. } => {
                Some("Free up disk space or choose a different download location")
            }
            DownloadError::PermissionDenied { .. } => {
                Some("Choose a destination directory you can write to")
            }
            _ => None,
        }
    }

    /// Create a detailed error report for debugging
    pub fn detailed_report(&self) -> String {
        let mut report = format!("Error: {}\n", self);
        report.push_str(&format!("Category: {}\n", self.category()));
        report.push_str(&format!("Severity: {:?}\n", self.severity()));
        report.push_str(&format!("Recoverable: {}\n", self.is_recoverable()));

        if let Some(suggestion) = self.suggestion() {
            report.push_str(&format!("Suggestion: {}\n", suggestion));
        }

        if let Some(source) = self.source() {
            report.push_str(&format!("Root cause: {}\n", source));
        }

        report
    }
}

/// Error severity levels for prioritization
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

fn io_cause(error: &reqwest::Error) -> Option<&std::io::Error> {
    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        source = err.source();
    }
    None
}

impl From<url::ParseError> for DownloadError {
    fn from(error: url::ParseError) -> Self {
        let suggestion = match error {
            url::ParseError::EmptyHost => "URL must have a valid hostname",
            url::ParseError::InvalidPort => "Port number must be between 1 and 65535",
            url::ParseError::RelativeUrlWithoutBase => "URL must be absolute (include http:// or https://)",
            _ => "Check URL format and try again",
        }
        .to_string();

        DownloadError::InvalidUrl {
            url: "<unparseable>".to_string(),
            suggestion,
            source: error,
        }
    }
}
