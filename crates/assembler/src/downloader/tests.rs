//! End-to-end tests for task orchestration against a mock distribution server

use super::*;
use crate::downloader::core::files;
use crate::downloader::model::products_dir;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

const MAIN_BUILD: &str = "phsp-build";
const DEP_BUILD: &str = "kbrg-build";

fn config(server: &MockServer) -> DownloadConfigBuilder {
    DownloadConfigBuilder::new()
        .manifest_url(format!("{}/core/v3/applications", server.uri()))
        .package_timeout(Duration::from_millis(500))
        .retry_delay(Duration::from_millis(10))
        .progress_interval(Duration::ZERO)
}

fn build(version: &str, base: &str, guid: &str, platform: &str, dependencies: Vec<Dependency>) -> ProductVersion {
    ProductVersion {
        version: version.into(),
        base_version: base.into(),
        build_guid: guid.into(),
        platform: platform.into(),
        dependencies,
    }
}

/// PHSP 25.0 depending on KBRG 16.0; `dependency_platform` decides whether the dependency resolves
fn catalog(server: &MockServer, config: &DownloadConfig, dependency_platform: &str) -> Catalog {
    let main = Product {
        code: "PHSP".into(),
        display_name: "Photoshop".into(),
        versions: vec![build(
            "25.0",
            "25.0",
            MAIN_BUILD,
            "macuniversal",
            vec![Dependency { code: "KBRG".into(), version: "16.0".into() }],
        )],
    };
    let dependency = Product {
        code: "KBRG".into(),
        display_name: "Camera Raw".into(),
        versions: vec![build("16.1", "16.0", DEP_BUILD, dependency_platform, Vec::new())],
    };
    Catalog::new(server.uri(), vec![main, dependency], &config.allowed_platforms)
}

fn manifest(packages: &[(&str, u64)]) -> String {
    let entries: Vec<serde_json::Value> = packages
        .iter()
        .map(|(name, size)| {
            serde_json::json!({
                "Type": "core",
                "FullPackageName": name,
                "DownloadSize": size,
                "Path": format!("/pkgs/{}", name),
            })
        })
        .collect();
    serde_json::json!({ "Packages": { "Package": entries } }).to_string()
}

async fn mount_manifest(server: &MockServer, guid: &str, body: String) {
    Mock::given(method("GET"))
        .and(path("/core/v3/applications"))
        .and(header("x-adobe-build-guid", guid))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn mount_package(server: &MockServer, name: &str, size: usize) {
    Mock::given(method("GET"))
        .and(path(format!("/pkgs/{}", name)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; size]))
        .mount(server)
        .await;
}

/// The first request for `name` hangs for `delay`; later ones succeed
async fn mount_slow_once(server: &MockServer, name: &str, size: usize, delay: Duration) {
    Mock::given(method("GET"))
        .and(path(format!("/pkgs/{}", name)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; size]).set_delay(delay))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(server)
        .await;
}

/// Main product with packages of 100 and 300 bytes; the dependency has no usable build
async fn standard_server() -> MockServer {
    let server = MockServer::start().await;
    mount_manifest(&server, MAIN_BUILD, manifest(&[("a.zip", 100), ("b.zip", 300)])).await;
    server
}

fn destination(dir: &TempDir) -> PathBuf {
    dir.path().join("Install PHSP_25.0-en_US.app")
}

async fn requests_for(server: &MockServer, file: &str) -> usize {
    let wanted = format!("/pkgs/{}", file);
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == wanted)
        .count()
}

async fn wait_for(orchestrator: &DownloadOrchestrator, id: TaskId, done: impl Fn(&DownloadTask) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(task) = orchestrator.task(id).await.unwrap() {
            if done(&task) {
                return;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "task {} never reached the expected state", id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn downloading_package(index: usize) -> impl Fn(&DownloadTask) -> bool {
    move |task| matches!(task.status, TaskStatus::Downloading { package_index, .. } if package_index == index)
}

fn package_file(dest: &Path, name: &str) -> PathBuf {
    products_dir(dest).join("PHSP").join(name)
}

mod orchestration_tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_is_retried_and_task_completes() {
        let server = standard_server().await;
        mount_package(&server, "a.zip", 100).await;
        mount_slow_once(&server, "b.zip", 300, Duration::from_secs(3)).await;
        mount_package(&server, "b.zip", 300).await;

        let config = config(&server).build().unwrap();
        let catalog = catalog(&server, &config, "win64");
        let orchestrator = DownloadOrchestrator::new(config, catalog).unwrap();
        let dir = tempdir().unwrap();
        let id = orchestrator
            .create_task(TaskRequest::new("PHSP", "25.0", destination(&dir)))
            .await
            .unwrap();

        let outcome = orchestrator.start_download_process(id).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);

        let task = orchestrator.task(id).await.unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Completed { total_size: 400, .. }));
        assert_eq!(task.total_size, 400);
        assert_eq!(task.total_downloaded_size, 400);
        assert_eq!(task.total_progress, 1.0);
        assert_eq!(task.retry_count, 1);
        assert!(task.current_package.is_none());
        assert!(task.packages().all(|(_, p)| p.downloaded));

        let dest = destination(&dir);
        assert_eq!(tokio::fs::read(package_file(&dest, "a.zip")).await.unwrap().len(), 100);
        assert_eq!(tokio::fs::read(package_file(&dest, "b.zip")).await.unwrap().len(), 300);
        assert!(package_file(&dest, "application.json").exists());
        assert!(products_dir(&dest).join("driver.xml").exists());
        assert_eq!(orchestrator.installer_path(id).await.unwrap(), dest);
    }

    #[tokio::test]
    async fn test_manifest_not_found_fails_without_product_directory() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/core/v3/applications"))
            .respond_with(ResponseTemplate::new(404).set_body_string("unknown build"))
            .mount(&server)
            .await;

        let config = config(&server).build().unwrap();
        let catalog = catalog(&server, &config, "win64");
        let orchestrator = DownloadOrchestrator::new(config, catalog).unwrap();
        let dir = tempdir().unwrap();
        let id = orchestrator
            .create_task(TaskRequest::new("PHSP", "25.0", destination(&dir)))
            .await
            .unwrap();

        let error = orchestrator.start_download_process(id).await.unwrap_err();
        assert!(matches!(error, DownloadError::HttpStatus { status: 404, .. }), "{:?}", error);

        let task = orchestrator.task(id).await.unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Failed { recoverable: false, .. }));
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.total_size, 0);
        assert!(!products_dir(&destination(&dir)).join("PHSP").exists());
    }

    #[tokio::test]
    async fn test_dependency_without_allowed_build_is_skipped() {
        let server = standard_server().await;
        mount_package(&server, "a.zip", 100).await;
        mount_package(&server, "b.zip", 300).await;

        let config = config(&server).build().unwrap();
        let catalog = catalog(&server, &config, "win64");
        let orchestrator = DownloadOrchestrator::new(config, catalog).unwrap();
        let dir = tempdir().unwrap();
        let id = orchestrator
            .create_task(TaskRequest::new("PHSP", "25.0", destination(&dir)))
            .await
            .unwrap();

        assert_eq!(orchestrator.start_download_process(id).await.unwrap(), TaskOutcome::Completed);

        let task = orchestrator.task(id).await.unwrap().unwrap();
        assert_eq!(task.products.len(), 1);
        let driver = tokio::fs::read_to_string(products_dir(&destination(&dir)).join("driver.xml"))
            .await
            .unwrap();
        assert!(!driver.contains("<Dependencies>"));
    }

    #[tokio::test]
    async fn test_resolved_dependency_is_downloaded_and_listed() {
        let server = standard_server().await;
        mount_manifest(&server, DEP_BUILD, manifest(&[("raw.zip", 50)])).await;
        mount_package(&server, "a.zip", 100).await;
        mount_package(&server, "b.zip", 300).await;
        mount_package(&server, "raw.zip", 50).await;

        let config = config(&server).build().unwrap();
        let catalog = catalog(&server, &config, "macarm64");
        let orchestrator = DownloadOrchestrator::new(config, catalog).unwrap();
        let dir = tempdir().unwrap();
        let id = orchestrator
            .create_task(TaskRequest::new("PHSP", "25.0", destination(&dir)))
            .await
            .unwrap();

        assert_eq!(orchestrator.start_download_process(id).await.unwrap(), TaskOutcome::Completed);

        let task = orchestrator.task(id).await.unwrap().unwrap();
        assert_eq!(task.total_size, 450);
        assert_eq!(task.total_downloaded_size, 450);
        assert_eq!(task.products[1].sap_code, "KBRG");
        assert_eq!(task.products[1].base_version, "16.0");

        let products = products_dir(&destination(&dir));
        assert!(products.join("KBRG").join("raw.zip").exists());
        let driver = tokio::fs::read_to_string(products.join("driver.xml")).await.unwrap();
        assert!(driver.contains("<SAPCode>KBRG</SAPCode>"));
        assert!(driver.contains("<BuildVersion>16.1</BuildVersion>"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_recoverably() {
        let server = standard_server().await;
        mount_package(&server, "a.zip", 100).await;
        Mock::given(method("GET"))
            .and(path("/pkgs/b.zip"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let config = config(&server).max_retry_attempts(2).build().unwrap();
        let catalog = catalog(&server, &config, "win64");
        let orchestrator = DownloadOrchestrator::new(config, catalog).unwrap();
        let dir = tempdir().unwrap();
        let id = orchestrator
            .create_task(TaskRequest::new("PHSP", "25.0", destination(&dir)))
            .await
            .unwrap();

        let error = orchestrator.start_download_process(id).await.unwrap_err();
        assert!(matches!(error, DownloadError::HttpStatus { status: 503, .. }));

        let task = orchestrator.task(id).await.unwrap().unwrap();
        assert_eq!(task.retry_count, 2);
        match &task.status {
            TaskStatus::Failed { message, recoverable, .. } => {
                assert!(*recoverable);
                assert!(message.contains("gave up after 2 retries"));
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(requests_for(&server, "b.zip").await, 3);
        assert!(task.products[0].packages[0].downloaded);
        assert!(!task.products[0].packages[1].downloaded);
        assert_eq!(task.products[0].packages[1].status, PackageStatus::Failed);

        let dest = destination(&dir);
        assert!(!files::temp_path(&package_file(&dest, "b.zip")).exists());
        assert!(!package_file(&dest, "b.zip").exists());
        // Recoverable failures stay in the registry
        assert!(orchestrator.clear_terminal().await.unwrap().is_empty());

        // A manual restart gets the full retry budget again
        let error = orchestrator.start_download_process(id).await.unwrap_err();
        assert!(matches!(error, DownloadError::HttpStatus { status: 503, .. }));
        assert_eq!(requests_for(&server, "b.zip").await, 6);
        assert_eq!(requests_for(&server, "a.zip").await, 1);
        let task = orchestrator.task(id).await.unwrap().unwrap();
        assert_eq!(task.retry_count, 2);
        assert!(matches!(task.status, TaskStatus::Failed { recoverable: true, .. }));
    }

    #[tokio::test]
    async fn test_truncated_package_is_never_marked_downloaded() {
        let server = standard_server().await;
        // Announced at 100 bytes, served at 40
        mount_package(&server, "a.zip", 40).await;
        mount_package(&server, "b.zip", 300).await;

        let config = config(&server).max_retry_attempts(1).build().unwrap();
        let catalog = catalog(&server, &config, "win64");
        let orchestrator = DownloadOrchestrator::new(config, catalog).unwrap();
        let dir = tempdir().unwrap();
        let id = orchestrator
            .create_task(TaskRequest::new("PHSP", "25.0", destination(&dir)))
            .await
            .unwrap();

        let error = orchestrator.start_download_process(id).await.unwrap_err();
        assert!(
            matches!(error, DownloadError::SizeMismatch { expected: 100, actual: 40, .. }),
            "{:?}",
            error
        );

        let task = orchestrator.task(id).await.unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Failed { recoverable: true, .. }));
        assert!(!task.products[0].packages[0].downloaded);
        assert!(task.total_downloaded_size < task.total_size);
        assert!(task.total_progress < 1.0);
        assert_eq!(requests_for(&server, "a.zip").await, 2);
        assert_eq!(requests_for(&server, "b.zip").await, 0);

        let dest = destination(&dir);
        assert!(!package_file(&dest, "a.zip").exists());
        assert!(!products_dir(&dest).join("driver.xml").exists());
        assert!(orchestrator.installer_path(id).await.is_err());
    }

    #[tokio::test]
    async fn test_pause_and_resume_skips_downloaded_packages() {
        let server = standard_server().await;
        mount_package(&server, "a.zip", 100).await;
        mount_slow_once(&server, "b.zip", 300, Duration::from_secs(1)).await;
        mount_package(&server, "b.zip", 300).await;

        let config = config(&server).package_timeout(Duration::from_secs(10)).build().unwrap();
        let catalog = catalog(&server, &config, "win64");
        let orchestrator = DownloadOrchestrator::new(config, catalog).unwrap();
        let dir = tempdir().unwrap();
        let id = orchestrator
            .create_task(TaskRequest::new("PHSP", "25.0", destination(&dir)))
            .await
            .unwrap();

        let run = orchestrator.spawn(id);
        wait_for(&orchestrator, id, downloading_package(1)).await;
        orchestrator.pause(id).await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), TaskOutcome::Paused);

        let paused = orchestrator.task(id).await.unwrap().unwrap();
        assert!(matches!(paused.status, TaskStatus::Paused { resumable: true, .. }));
        assert!(paused.products[0].packages[0].downloaded);
        assert!(paused.current_package.is_none());
        let progress_at_pause = paused.total_progress;

        assert_eq!(orchestrator.resume(id).await.unwrap(), TaskOutcome::Completed);

        let task = orchestrator.task(id).await.unwrap().unwrap();
        assert_eq!(task.total_downloaded_size, task.total_size);
        assert!(task.total_progress >= progress_at_pause);
        assert_eq!(requests_for(&server, "a.zip").await, 1);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_discards_partial_file() {
        let server = standard_server().await;
        mount_package(&server, "a.zip", 100).await;
        mount_slow_once(&server, "b.zip", 300, Duration::from_secs(2)).await;

        let config = config(&server).package_timeout(Duration::from_secs(10)).build().unwrap();
        let catalog = catalog(&server, &config, "win64");
        let orchestrator = DownloadOrchestrator::new(config, catalog).unwrap();
        let dir = tempdir().unwrap();
        let dest = destination(&dir);

        // Bytes left over from an earlier interrupted run
        let partial = files::temp_path(&package_file(&dest, "b.zip"));
        tokio::fs::create_dir_all(partial.parent().unwrap()).await.unwrap();
        tokio::fs::write(&partial, vec![b'x'; 10]).await.unwrap();

        let id = orchestrator.create_task(TaskRequest::new("PHSP", "25.0", dest.clone())).await.unwrap();
        let run = orchestrator.spawn(id);
        wait_for(&orchestrator, id, downloading_package(1)).await;
        orchestrator.cancel(id, false).await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), TaskOutcome::Cancelled);

        let task = orchestrator.task(id).await.unwrap().unwrap();
        match &task.status {
            TaskStatus::Failed { message, recoverable, .. } => {
                assert_eq!(message, "download cancelled");
                assert!(!recoverable);
            }
            other => panic!("Expected cancelled task, got {:?}", other),
        }
        assert!(!task.products[0].packages[1].downloaded);
        assert!(task.current_package.is_none());
        assert!(!partial.exists());
        assert!(!package_file(&dest, "b.zip").exists());

        // Cancelled tasks cannot be restarted
        assert_eq!(orchestrator.start_download_process(id).await.unwrap(), TaskOutcome::Cancelled);
        assert_eq!(orchestrator.clear_terminal().await.unwrap(), vec![id]);
        assert!(orchestrator.tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_manifest_fetch_leaves_nothing_behind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/core/v3/applications"))
            .and(header("x-adobe-build-guid", MAIN_BUILD))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(manifest(&[("a.zip", 100), ("b.zip", 300)]))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;
        mount_package(&server, "a.zip", 100).await;
        mount_package(&server, "b.zip", 300).await;

        let config = config(&server).build().unwrap();
        let catalog = catalog(&server, &config, "win64");
        let orchestrator = DownloadOrchestrator::new(config, catalog).unwrap();
        let dir = tempdir().unwrap();
        let dest = destination(&dir);
        let id = orchestrator.create_task(TaskRequest::new("PHSP", "25.0", dest.clone())).await.unwrap();

        let run = orchestrator.spawn(id);
        wait_for(&orchestrator, id, |task| {
            matches!(task.status, TaskStatus::Preparing { stage: PreparingStage::FetchingInfo, .. })
        })
        .await;
        orchestrator.cancel(id, true).await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), TaskOutcome::Cancelled);

        // Outlive the delayed manifest response
        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert!(!dest.exists());

        let task = orchestrator.task(id).await.unwrap().unwrap();
        assert!(task.products.is_empty());
        assert_eq!(task.total_size, 0);
        assert!(matches!(task.status, TaskStatus::Failed { recoverable: false, .. }));
        assert_eq!(requests_for(&server, "a.zip").await, 0);
    }

    #[tokio::test]
    async fn test_remove_task_with_files_deletes_destination() {
        let server = standard_server().await;
        mount_package(&server, "a.zip", 100).await;
        mount_package(&server, "b.zip", 300).await;

        let config = config(&server).build().unwrap();
        let catalog = catalog(&server, &config, "win64");
        let orchestrator = DownloadOrchestrator::new(config, catalog).unwrap();
        let dir = tempdir().unwrap();
        let id = orchestrator
            .create_task(TaskRequest::new("PHSP", "25.0", destination(&dir)))
            .await
            .unwrap();
        orchestrator.start_download_process(id).await.unwrap();
        assert!(destination(&dir).exists());

        // Cancelling a finished task keeps both its status and its files
        orchestrator.cancel(id, false).await.unwrap();
        let task = orchestrator.task(id).await.unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Completed { .. }));
        assert!(!orchestrator.cancel_tracker().is_cancelled(id));
        assert!(package_file(&destination(&dir), "b.zip").exists());

        orchestrator.remove_task(id, true).await.unwrap();
        assert!(!destination(&dir).exists());
        assert!(orchestrator.task(id).await.unwrap().is_none());
        assert!(!orchestrator.cancel_tracker().is_cancelled(id));
    }

    #[tokio::test]
    async fn test_events_follow_task_lifecycle() {
        let server = standard_server().await;
        mount_package(&server, "a.zip", 100).await;
        mount_package(&server, "b.zip", 300).await;

        let config = config(&server).build().unwrap();
        let catalog = catalog(&server, &config, "win64");
        let orchestrator = DownloadOrchestrator::new(config, catalog).unwrap();
        let mut events = orchestrator.subscribe();
        let dir = tempdir().unwrap();
        let id = orchestrator
            .create_task(TaskRequest::new("PHSP", "25.0", destination(&dir)))
            .await
            .unwrap();
        orchestrator.start_download_process(id).await.unwrap();

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }

        assert!(matches!(received.first(), Some(TaskEvent::Created { .. })));
        let completed: Vec<&str> = received
            .iter()
            .filter_map(|e| match e {
                TaskEvent::PackageCompleted { package, .. } => Some(package.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec!["a.zip", "b.zip"]);

        let progress: Vec<f64> = received
            .iter()
            .filter_map(|e| match e {
                TaskEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(progress.last().copied(), Some(1.0));

        assert!(matches!(
            received.last(),
            Some(TaskEvent::StatusChanged { status: TaskStatus::Completed { .. }, .. })
        ));
    }
}
