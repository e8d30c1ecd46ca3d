//! HTTP transport
//!
//! One client serves both manifest requests and streaming package downloads.
//! Package downloads write to a `.part` file, honour pause and cancel at every
//! chunk, resume with a `Range` request when a partial file is present, and
//! move the result into place atomically.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, COOKIE, RANGE};
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use super::files;
use crate::downloader::cancel::CancelTracker;
use crate::downloader::config::DownloadConfig;
use crate::downloader::core::{ChunkProgress, DownloadError, FileOperation, ProgressCallback, Result};
use crate::downloader::model::TaskId;

const BUILD_GUID_HEADER: &str = "x-adobe-build-guid";
const API_KEY_HEADER: &str = "x-api-key";
const MAX_ERROR_BODY: usize = 512;

/// A single package transfer
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Fully-qualified source URL
    pub url: String,
    pub dest_dir: PathBuf,
    pub file_name: String,
    /// Size announced by the manifest, used when the server sends no length
    pub expected_size: u64,
}

impl TransferRequest {
    pub fn dest_path(&self) -> PathBuf {
        self.dest_dir.join(&self.file_name)
    }
}

/// Pause/cancel handle a transfer polls at its checkpoints
#[derive(Debug, Clone)]
pub struct TransferControl {
    pub task_id: TaskId,
    pub tracker: CancelTracker,
}

impl TransferControl {
    pub fn new(task_id: TaskId, tracker: CancelTracker) -> Self {
        Self { task_id, tracker }
    }

    pub fn check(&self) -> Result<()> {
        self.tracker.check(self.task_id)
    }

    fn interruption(&self) -> DownloadError {
        self.tracker.interruption(self.task_id)
    }
}

/// Network operations the orchestrator depends on
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the raw manifest document of a build
    async fn fetch_manifest(&self, build_guid: &str) -> Result<String>;

    /// Stream one package to disk, returning the final file size
    async fn download(
        &self,
        request: &TransferRequest,
        control: &TransferControl,
        progress: ProgressCallback,
    ) -> Result<u64>;
}

/// reqwest-backed transport
pub struct HttpClient {
    client: Client,
    config: DownloadConfig,
    session_cookie: String,
}

impl HttpClient {
    /// Create a new HTTP client from download configuration
    pub fn from_config(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| DownloadError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
                field: None,
            })?;

        Ok(Self {
            client,
            config: config.clone(),
            session_cookie: generate_session_cookie(),
        })
    }

    async fn stream_to_file(
        &self,
        request: &TransferRequest,
        control: &TransferControl,
        progress: &ProgressCallback,
    ) -> Result<u64> {
        let url = request.url.as_str();
        let dest_path = request.dest_path();
        let temp_path = files::temp_path(&dest_path);

        control.check()?;
        files::ensure_dir(&request.dest_dir).await?;

        let mut start_byte = files::partial_size(&temp_path).await;
        if request.expected_size > 0 && start_byte >= request.expected_size {
            // Nothing sensible to ask for; start over
            files::remove_partial(&dest_path).await?;
            start_byte = 0;
        }

        let mut builder = self
            .client
            .get(url)
            .timeout(self.config.get_timeout_for_size(request.expected_size));
        if start_byte > 0 {
            debug!("Found partial file, requesting range: bytes={}-", start_byte);
            builder = builder.header(RANGE, format!("bytes={}-", start_byte));
        }

        let token = control.tracker.token(control.task_id);
        let response = tokio::select! {
            _ = token.cancelled() => return Err(control.interruption()),
            response = builder.send() => response.map_err(|e| DownloadError::transport(url, e))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, response).await);
        }

        let resumed = start_byte > 0 && status == StatusCode::PARTIAL_CONTENT;
        if start_byte > 0 && !resumed {
            debug!("Server ignored range request, restarting {}", request.file_name);
        }
        let mut written = if resumed { start_byte } else { 0 };
        let expected_total = response
            .content_length()
            .map(|len| len + written)
            .filter(|total| *total > 0)
            .unwrap_or(request.expected_size);

        let mut file = if resumed {
            fs::OpenOptions::new()
                .append(true)
                .open(&temp_path)
                .await
                .map_err(|e| DownloadError::io(&temp_path, FileOperation::Write, e))?
        } else {
            fs::File::create(&temp_path)
                .await
                .map_err(|e| DownloadError::io(&temp_path, FileOperation::Create, e))?
        };

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => {
                    let _ = file.flush().await;
                    return Err(control.interruption());
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| DownloadError::transport(url, e))?;

            if let Err(stop) = control.check() {
                let _ = file.flush().await;
                return Err(stop);
            }

            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(&temp_path, FileOperation::Write, e))?;
            written += chunk.len() as u64;

            // Keep-alive and zero-length notifications carry no progress
            if expected_total > 0 && !chunk.is_empty() {
                progress(ChunkProgress {
                    bytes_written: chunk.len() as u64,
                    total_written: written,
                    expected_total,
                });
            }
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::io(&temp_path, FileOperation::Write, e))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::io(&temp_path, FileOperation::Write, e))?;
        drop(file);

        // A short body stays as a partial for the next attempt to resume
        if request.expected_size > 0 && written != request.expected_size {
            return Err(DownloadError::SizeMismatch {
                url: url.to_string(),
                expected: request.expected_size,
                actual: written,
            });
        }

        files::atomic_replace(&temp_path, &dest_path).await?;
        debug!("Stream download completed: {} bytes", written);
        Ok(written)
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn fetch_manifest(&self, build_guid: &str) -> Result<String> {
        let url = self.config.manifest_url.as_str();
        debug!("Fetching manifest for build {}", build_guid);

        let response = self
            .client
            .get(url)
            .timeout(self.config.timeout)
            .header(BUILD_GUID_HEADER, build_guid)
            .header(API_KEY_HEADER, &self.config.api_key)
            .header(ACCEPT, "application/json")
            .header(COOKIE, &self.session_cookie)
            .send()
            .await
            .map_err(|e| DownloadError::transport(url, e))?;

        if !response.status().is_success() {
            return Err(status_error(url, response).await);
        }

        response.text().await.map_err(|e| DownloadError::transport(url, e))
    }

    async fn download(
        &self,
        request: &TransferRequest,
        control: &TransferControl,
        progress: ProgressCallback,
    ) -> Result<u64> {
        let result = self
            .stream_to_file(request, control, &progress)
            .instrument(info_span!("package_download", file = %request.file_name))
            .await;

        // A cancelled transfer's partial file is discarded; a paused one is kept for resume
        if let Err(DownloadError::Cancelled { .. }) = &result {
            files::remove_partial(&request.dest_path()).await?;
        }
        result
    }
}

async fn status_error(url: &str, response: reqwest::Response) -> DownloadError {
    let status = response.status().as_u16();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    DownloadError::HttpStatus {
        url: url.to_string(),
        status,
        body,
    }
}

fn generate_session_cookie() -> String {
    let id = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("fg={}; s_cc=true", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> DownloadConfig {
        crate::downloader::config::DownloadConfigBuilder::new()
            .manifest_url(format!("{}/core/v3/applications", server.uri()))
            .package_timeout(Duration::from_millis(500))
            .build()
            .unwrap()
    }

    fn capture() -> (ProgressCallback, Arc<Mutex<Vec<ChunkProgress>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: ProgressCallback = Arc::new(move |chunk| sink.lock().unwrap().push(chunk));
        (callback, events)
    }

    fn control() -> TransferControl {
        TransferControl::new(TaskId::new(), CancelTracker::new())
    }

    #[tokio::test]
    async fn test_fetch_manifest_sends_build_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/core/v3/applications"))
            .and(header("x-adobe-build-guid", "build-123"))
            .and(header("accept", "application/json"))
            .and(header_exists("cookie"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"Packages\":{}}"))
            .mount(&server)
            .await;

        let client = HttpClient::from_config(&config(&server)).unwrap();
        let body = client.fetch_manifest("build-123").await.unwrap();
        assert_eq!(body, "{\"Packages\":{}}");
    }

    #[tokio::test]
    async fn test_fetch_manifest_surfaces_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such build"))
            .mount(&server)
            .await;

        let client = HttpClient::from_config(&config(&server)).unwrap();
        match client.fetch_manifest("missing").await {
            Err(DownloadError::HttpStatus { status, body, .. }) => {
                assert_eq!(status, 404);
                assert_eq!(body, "no such build");
            }
            other => panic!("Expected HttpStatus error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_streams_and_moves_into_place() {
        let server = MockServer::start().await;
        let content = vec![7u8; 4096];
        Mock::given(method("GET"))
            .and(path("/pkgs/core.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let request = TransferRequest {
            url: format!("{}/pkgs/core.zip", server.uri()),
            dest_dir: dir.path().join("PHSP"),
            file_name: "core.zip".into(),
            expected_size: 4096,
        };
        let client = HttpClient::from_config(&config(&server)).unwrap();
        let (callback, events) = capture();

        let size = client.download(&request, &control(), callback).await.unwrap();

        assert_eq!(size, 4096);
        assert_eq!(fs::read(request.dest_path()).await.unwrap(), content);
        assert!(!files::temp_path(&request.dest_path()).exists());
        let events = events.lock().unwrap();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.bytes_written > 0 && e.expected_total == 4096));
        assert_eq!(events.last().unwrap().total_written, 4096);
    }

    #[tokio::test]
    async fn test_download_resumes_from_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkgs/core.zip"))
            .and(header("range", "bytes=4-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"5678".to_vec()))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let request = TransferRequest {
            url: format!("{}/pkgs/core.zip", server.uri()),
            dest_dir: dir.path().to_path_buf(),
            file_name: "core.zip".into(),
            expected_size: 8,
        };
        fs::write(files::temp_path(&request.dest_path()), b"1234").await.unwrap();
        let client = HttpClient::from_config(&config(&server)).unwrap();
        let (callback, events) = capture();

        let size = client.download(&request, &control(), callback).await.unwrap();

        assert_eq!(size, 8);
        assert_eq!(fs::read(request.dest_path()).await.unwrap(), b"12345678");
        assert_eq!(events.lock().unwrap()[0].expected_total, 8);
    }

    #[tokio::test]
    async fn test_truncated_body_is_not_moved_into_place() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkgs/short.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![3u8; 40]))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let request = TransferRequest {
            url: format!("{}/pkgs/short.zip", server.uri()),
            dest_dir: dir.path().to_path_buf(),
            file_name: "short.zip".into(),
            expected_size: 100,
        };
        let client = HttpClient::from_config(&config(&server)).unwrap();
        let (callback, _) = capture();

        let error = client.download(&request, &control(), callback).await.unwrap_err();
        match &error {
            DownloadError::SizeMismatch { expected, actual, .. } => {
                assert_eq!(*expected, 100);
                assert_eq!(*actual, 40);
            }
            other => panic!("Expected SizeMismatch, got {:?}", other),
        }
        assert!(error.is_recoverable());
        assert!(!request.dest_path().exists());
        assert_eq!(fs::read(files::temp_path(&request.dest_path())).await.unwrap().len(), 40);
    }

    #[tokio::test]
    async fn test_download_timeout_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1u8; 16])
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let request = TransferRequest {
            url: format!("{}/slow.zip", server.uri()),
            dest_dir: dir.path().to_path_buf(),
            file_name: "slow.zip".into(),
            expected_size: 16,
        };
        let client = HttpClient::from_config(&config(&server)).unwrap();
        let (callback, _) = capture();

        let error = client.download(&request, &control(), callback).await.unwrap_err();
        assert!(matches!(error, DownloadError::NetworkTimeout { .. }), "{:?}", error);
        assert!(error.is_recoverable());
        assert!(!request.dest_path().exists());
    }

    #[tokio::test]
    async fn test_download_checks_cancellation_before_starting() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let request = TransferRequest {
            url: format!("{}/never.zip", server.uri()),
            dest_dir: dir.path().to_path_buf(),
            file_name: "never.zip".into(),
            expected_size: 16,
        };
        fs::write(files::temp_path(&request.dest_path()), b"stale").await.unwrap();

        let control = control();
        control.tracker.cancel(control.task_id);
        let client = HttpClient::from_config(&config(&server)).unwrap();
        let (callback, events) = capture();

        let error = client.download(&request, &control, callback).await.unwrap_err();
        assert!(matches!(error, DownloadError::Cancelled { .. }));
        assert!(events.lock().unwrap().is_empty());
        assert!(!files::temp_path(&request.dest_path()).exists());
    }

    #[tokio::test]
    async fn test_download_paused_keeps_partial_file() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let request = TransferRequest {
            url: format!("{}/later.zip", server.uri()),
            dest_dir: dir.path().to_path_buf(),
            file_name: "later.zip".into(),
            expected_size: 16,
        };
        fs::write(files::temp_path(&request.dest_path()), b"half").await.unwrap();

        let control = control();
        control.tracker.pause(control.task_id);
        let client = HttpClient::from_config(&config(&server)).unwrap();
        let (callback, _) = capture();

        let error = client.download(&request, &control, callback).await.unwrap_err();
        assert!(matches!(error, DownloadError::Paused));
        assert!(files::temp_path(&request.dest_path()).exists());
    }
}
