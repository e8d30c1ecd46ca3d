//! Process-wide pause and cancel flags, keyed by task
//!
//! Transfers poll [`CancelTracker::check`] at their checkpoints. Long waits
//! (stream reads, retry delays) can instead race against the task's
//! [`CancellationToken`], which fires on both pause and cancel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::downloader::core::{DownloadError, Result};
use crate::downloader::model::TaskId;

/// What a task has been asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

#[derive(Debug)]
struct Entry {
    signal: ControlSignal,
    token: CancellationToken,
}

impl Entry {
    fn new() -> Self {
        Self {
            signal: ControlSignal::Run,
            token: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelTracker {
    entries: Arc<Mutex<HashMap<TaskId, Entry>>>,
}

impl CancelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Entry>> {
        // Entries stay consistent even if a holder panicked
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cancel a task. Cancelling twice is a no-op.
    pub fn cancel(&self, id: TaskId) {
        let mut entries = self.lock();
        let entry = entries.entry(id).or_insert_with(Entry::new);
        if entry.signal != ControlSignal::Cancel {
            entry.signal = ControlSignal::Cancel;
            entry.token.cancel();
        }
    }

    /// Pause a task. No-op when already paused or cancelled.
    pub fn pause(&self, id: TaskId) {
        let mut entries = self.lock();
        let entry = entries.entry(id).or_insert_with(Entry::new);
        if entry.signal == ControlSignal::Run {
            entry.signal = ControlSignal::Pause;
            entry.token.cancel();
        }
    }

    /// Clear a pause so the task can run again. A cancelled task stays cancelled.
    pub fn resume(&self, id: TaskId) -> bool {
        let mut entries = self.lock();
        let entry = entries.entry(id).or_insert_with(Entry::new);
        match entry.signal {
            ControlSignal::Cancel => false,
            ControlSignal::Pause => {
                entry.signal = ControlSignal::Run;
                entry.token = CancellationToken::new();
                true
            }
            ControlSignal::Run => true,
        }
    }

    /// True when the task must stop at its next checkpoint, paused or cancelled
    pub fn is_cancelled(&self, id: TaskId) -> bool {
        self.signal(id) != ControlSignal::Run
    }

    pub fn is_paused(&self, id: TaskId) -> bool {
        self.signal(id) == ControlSignal::Pause
    }

    pub fn signal(&self, id: TaskId) -> ControlSignal {
        self.lock().get(&id).map_or(ControlSignal::Run, |e| e.signal)
    }

    /// Checkpoint: `Err(Cancelled)` or `Err(Paused)` when the task must stop
    pub fn check(&self, id: TaskId) -> Result<()> {
        match self.signal(id) {
            ControlSignal::Run => Ok(()),
            ControlSignal::Pause => Err(DownloadError::Paused),
            ControlSignal::Cancel => Err(DownloadError::Cancelled {
                reason: "cancelled by user".to_string(),
            }),
        }
    }

    /// The error a task stops with once its token has fired
    pub fn interruption(&self, id: TaskId) -> DownloadError {
        self.check(id).err().unwrap_or(DownloadError::Paused)
    }

    /// Token that fires when the task is next paused or cancelled
    pub fn token(&self, id: TaskId) -> CancellationToken {
        self.lock().entry(id).or_insert_with(Entry::new).token.clone()
    }

    /// Drop all state for a task once it leaves the registry
    pub fn clear(&self, id: TaskId) {
        self.lock().remove(&id);
    }
}
