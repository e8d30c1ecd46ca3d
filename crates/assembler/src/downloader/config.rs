//! Configuration types for the download engine

use std::time::Duration;

use crate::downloader::core::{DownloadError, Result};

/// Platform identifiers accepted when resolving builds
pub const DEFAULT_PLATFORMS: [&str; 4] = ["macuniversal", "macarm64", "osx10-64", "osx10"];

pub const DEFAULT_MANIFEST_URL: &str = "https://cdn-ffc.oobesaas.adobe.com/core/v3/applications";

/// Configuration for download operations
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Recoverable failures tolerated per task before it is marked failed
    pub max_retry_attempts: usize,
    /// Delay before a retry re-enters the download loop
    pub retry_delay: Duration,
    /// Double the delay on each attempt instead of keeping it fixed
    pub exponential_backoff: bool,
    /// Maximum retry delay cap when backing off exponentially
    pub max_retry_delay: Duration,
    /// Minimum time between task-visible progress updates for a package
    pub progress_interval: Duration,
    pub connect_timeout: Duration,
    /// Timeout for manifest requests
    pub timeout: Duration,
    /// Timeout for packages below the large file threshold
    pub package_timeout: Duration,
    /// Timeout specifically for large packages
    pub large_file_timeout: Duration,
    /// File size threshold (bytes) to use large file timeout
    pub large_file_threshold: u64,
    pub user_agent: String,
    pub api_key: String,
    pub manifest_url: String,
    /// Platforms a build may target to be downloaded
    pub allowed_platforms: Vec<String>,
    /// Capacity of the task event channel
    pub event_capacity: usize,
}

impl DownloadConfig {
    /// Get appropriate timeout based on expected package size
    pub fn get_timeout_for_size(&self, expected_size: u64) -> Duration {
        if expected_size >= self.large_file_threshold {
            self.large_file_timeout
        } else {
            self.package_timeout
        }
    }

    pub fn is_platform_allowed(&self, platform: &str) -> bool {
        self.allowed_platforms.iter().any(|p| p == platform)
    }

    /// Rank of a platform in the allow-list, lower is preferred
    pub fn platform_rank(&self, platform: &str) -> Option<usize> {
        self.allowed_platforms.iter().position(|p| p == platform)
    }

    pub fn validate(&self) -> Result<()> {
        if self.allowed_platforms.is_empty() {
            return Err(DownloadError::Configuration {
                message: "at least one platform must be allowed".to_string(),
                field: Some("allowed_platforms".to_string()),
            });
        }
        if self.event_capacity == 0 {
            return Err(DownloadError::Configuration {
                message: "event channel capacity must be positive".to_string(),
                field: Some("event_capacity".to_string()),
            });
        }
        url::Url::parse(&self.manifest_url).map_err(|e| DownloadError::Configuration {
            message: format!("manifest url '{}' is invalid: {}", self.manifest_url, e),
            field: Some("manifest_url".to_string()),
        })?;
        Ok(())
    }

    /// Overlay `ASSEMBLER_*` environment variables on top of the defaults
    ///
    /// Call `dotenv::dotenv()` beforehand to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = env_var("ASSEMBLER_MAX_RETRIES") {
            config.max_retry_attempts = parse_env("ASSEMBLER_MAX_RETRIES", &value)?;
        }
        if let Some(value) = env_var("ASSEMBLER_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(parse_env("ASSEMBLER_RETRY_DELAY_MS", &value)?);
        }
        if let Some(value) = env_var("ASSEMBLER_PROGRESS_INTERVAL_MS") {
            config.progress_interval =
                Duration::from_millis(parse_env("ASSEMBLER_PROGRESS_INTERVAL_MS", &value)?);
        }
        if let Some(value) = env_var("ASSEMBLER_MANIFEST_URL") {
            config.manifest_url = value;
        }
        if let Some(value) = env_var("ASSEMBLER_PLATFORMS") {
            config.allowed_platforms = value
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        if let Some(value) = env_var("ASSEMBLER_USER_AGENT") {
            config.user_agent = value;
        }

        config.validate()?;
        Ok(config)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| DownloadError::Configuration {
        message: format!("{} has invalid value '{}'", name, value),
        field: Some(name.to_string()),
    })
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            exponential_backoff: false,
            max_retry_delay: Duration::from_secs(60),
            progress_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            package_timeout: Duration::from_secs(600),
            large_file_timeout: Duration::from_secs(3600),
            large_file_threshold: 100_000_000, // 100MB
            user_agent: "Creative Cloud".to_string(),
            api_key: "CC_HD_ESD_1_0".to_string(),
            manifest_url: DEFAULT_MANIFEST_URL.to_string(),
            allowed_platforms: DEFAULT_PLATFORMS.iter().map(|p| p.to_string()).collect(),
            event_capacity: 256,
        }
    }
}

/// Builder for download configuration
#[derive(Debug, Default)]
pub struct DownloadConfigBuilder {
    config: DownloadConfig,
}

impl DownloadConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retry_attempts(mut self, attempts: usize) -> Self {
        self.config.max_retry_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn exponential_backoff(mut self, max_delay: Duration) -> Self {
        self.config.exponential_backoff = true;
        self.config.max_retry_delay = max_delay;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.config.progress_interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Use the same timeout for every package regardless of size
    pub fn package_timeout(mut self, timeout: Duration) -> Self {
        self.config.package_timeout = timeout;
        self.config.large_file_timeout = timeout;
        self
    }

    pub fn manifest_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.manifest_url = url.into();
        self
    }

    pub fn allowed_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> Result<DownloadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
