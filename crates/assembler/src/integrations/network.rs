//! Connectivity signal consulted when classifying transport failures
//!
//! The monitor never gates a transfer. Failures are still detected by the
//! transport; the signal only sharpens the reason reported for them.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::downloader::core::DownloadError;

pub trait ConnectivityMonitor: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Monitor for hosts without a reachability source
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl ConnectivityMonitor for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Connectivity flag set by whatever watches the network interfaces
#[derive(Debug)]
pub struct ConnectivityFlag {
    online: AtomicBool,
}

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }
}

/// Report an unclassified transport failure as lost connectivity when the monitor says we are offline
pub fn reclassify(error: DownloadError, monitor: &dyn ConnectivityMonitor) -> DownloadError {
    match error {
        DownloadError::HttpRequest { url, source } if !monitor.is_online() => DownloadError::NoConnection {
            url,
            source: Some(source),
        },
        other => other,
    }
}
