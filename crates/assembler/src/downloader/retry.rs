//! Retry policy: error classification and retry scheduling

use std::time::Duration;

use crate::downloader::config::DownloadConfig;
use crate::downloader::core::{DownloadError, ErrorKind};

/// What the orchestrator should do after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait `delay`, then re-enter the download loop as attempt `attempt`
    Retry {
        attempt: usize,
        delay: Duration,
        reason: String,
    },
    /// Give up and mark the task failed
    Fail { message: String, recoverable: bool },
    /// Paused or cancelled by the user; neither retried nor reported as a failure
    Interrupted,
}

/// How an error is treated by the policy
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub recoverable: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    delay: Duration,
    /// `Some(cap)` when delays double per attempt
    backoff_cap: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff_cap: None,
        }
    }

    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            delay: config.retry_delay,
            backoff_cap: config.exponential_backoff.then_some(config.max_retry_delay),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn classify(error: &DownloadError) -> Classification {
        Classification {
            kind: error.kind(),
            recoverable: error.is_recoverable(),
            message: error.user_message(),
        }
    }

    /// Delay before the given attempt (1-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        match self.backoff_cap {
            None => self.delay,
            Some(cap) => {
                let exponent = attempt.saturating_sub(1).min(16) as u32;
                self.delay.saturating_mul(2_u32.pow(exponent)).min(cap)
            }
        }
    }

    /// Decide the next step given the failure and how many retries the task already used
    pub fn decide(&self, error: &DownloadError, retry_count: usize) -> RetryDecision {
        if error.is_interruption() {
            return RetryDecision::Interrupted;
        }

        let classification = Self::classify(error);
        if !classification.recoverable {
            return RetryDecision::Fail {
                message: classification.message,
                recoverable: false,
            };
        }

        if retry_count >= self.max_attempts {
            return RetryDecision::Fail {
                message: format!(
                    "{} (gave up after {} retries)",
                    classification.message, self.max_attempts
                ),
                // The user may still retry by hand
                recoverable: true,
            };
        }

        let attempt = retry_count + 1;
        RetryDecision::Retry {
            attempt,
            delay: self.delay_for(attempt),
            reason: classification.message,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}
