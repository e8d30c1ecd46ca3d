//! Task registry and the coordinator that owns it
//!
//! A single tokio task owns every [`DownloadTask`]. Other contexts reach it
//! only through a [`RegistryHandle`], which sends commands over a channel; the
//! coordinator applies them one at a time in arrival order. After each command
//! it compares the task before and after and publishes the resulting
//! [`TaskEvent`]s on a broadcast channel.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace};

use crate::downloader::core::{DownloadError, Result};
use crate::downloader::model::{DownloadTask, PackageRef, TaskId, TaskStatus};

/// Notification published whenever task state changes
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Created {
        id: TaskId,
        product_code: String,
        version: String,
    },
    StatusChanged {
        id: TaskId,
        status: TaskStatus,
    },
    Progress {
        id: TaskId,
        downloaded: u64,
        total: u64,
        progress: f64,
        speed: f64,
    },
    PackageCompleted {
        id: TaskId,
        package: String,
    },
    Removed {
        id: TaskId,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Created { id, .. }
            | TaskEvent::StatusChanged { id, .. }
            | TaskEvent::Progress { id, .. }
            | TaskEvent::PackageCompleted { id, .. }
            | TaskEvent::Removed { id } => *id,
        }
    }
}

/// The task collection, kept in creation order
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, DownloadTask>,
    order: Vec<TaskId>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: DownloadTask) -> TaskId {
        let id = task.id;
        if self.tasks.insert(id, task).is_none() {
            self.order.push(id);
        }
        id
    }

    pub fn get(&self, id: TaskId) -> Option<&DownloadTask> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut DownloadTask> {
        self.tasks.get_mut(&id)
    }

    /// All tasks in creation order
    pub fn list(&self) -> Vec<DownloadTask> {
        self.order.iter().filter_map(|id| self.tasks.get(id)).cloned().collect()
    }

    pub fn remove(&mut self, id: TaskId) -> Option<DownloadTask> {
        let task = self.tasks.remove(&id)?;
        self.order.retain(|other| *other != id);
        Some(task)
    }

    /// Remove completed and permanently failed tasks, returning their ids
    pub fn clear_terminal(&mut self) -> Vec<TaskId> {
        let finished: Vec<TaskId> = self
            .order
            .iter()
            .filter(|id| self.tasks.get(id).is_some_and(|t| t.status.is_terminal()))
            .copied()
            .collect();
        for id in &finished {
            self.remove(*id);
        }
        finished
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Runs after the events of an operation are published
type Completion = Box<dyn FnOnce() + Send>;
type TaskOp = Box<dyn FnOnce(Option<&mut DownloadTask>) -> Completion + Send>;

enum Command {
    Insert {
        task: Box<DownloadTask>,
        reply: oneshot::Sender<TaskId>,
    },
    Apply {
        id: TaskId,
        op: TaskOp,
    },
    Get {
        id: TaskId,
        reply: oneshot::Sender<Option<DownloadTask>>,
    },
    List {
        reply: oneshot::Sender<Vec<DownloadTask>>,
    },
    Remove {
        id: TaskId,
        reply: oneshot::Sender<Option<DownloadTask>>,
    },
    ClearTerminal {
        reply: oneshot::Sender<Vec<TaskId>>,
    },
}

/// Cloneable access to the coordinator
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TaskEvent>,
}

impl RegistryHandle {
    /// Start a coordinator on the current tokio runtime.
    ///
    /// The coordinator stops once every handle has been dropped.
    pub fn spawn(event_capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(event_capacity.max(1));
        tokio::spawn(coordinate(TaskRegistry::new(), rx, events.clone()));
        Self { tx, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| DownloadError::CoordinatorClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| DownloadError::CoordinatorClosed)
    }

    pub async fn insert(&self, task: DownloadTask) -> Result<TaskId> {
        self.request(|reply| Command::Insert { task: Box::new(task), reply }).await
    }

    /// Run `f` against the task on the coordinator and return its result
    pub async fn update<R, F>(&self, id: TaskId, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut DownloadTask) -> R + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let op: TaskOp = Box::new(move |task: Option<&mut DownloadTask>| -> Completion {
            let result = task.map(f);
            Box::new(move || {
                let _ = reply.send(result);
            })
        });
        self.send(Command::Apply { id, op })?;
        rx.await
            .map_err(|_| DownloadError::CoordinatorClosed)?
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))
    }

    /// Queue `f` without waiting; used from synchronous progress callbacks.
    ///
    /// Ordering relative to other commands from the same caller is preserved.
    pub fn notify<F>(&self, id: TaskId, f: F)
    where
        F: FnOnce(&mut DownloadTask) + Send + 'static,
    {
        let op: TaskOp = Box::new(move |task: Option<&mut DownloadTask>| -> Completion {
            if let Some(task) = task {
                f(task);
            }
            Box::new(|| {})
        });
        if self.send(Command::Apply { id, op }).is_err() {
            trace!("Dropped update for task {}: coordinator closed", id);
        }
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<DownloadTask>> {
        self.request(|reply| Command::Get { id, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<DownloadTask>> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn remove(&self, id: TaskId) -> Result<Option<DownloadTask>> {
        self.request(|reply| Command::Remove { id, reply }).await
    }

    pub async fn clear_terminal(&self) -> Result<Vec<TaskId>> {
        self.request(|reply| Command::ClearTerminal { reply }).await
    }
}

/// What an event-worthy comparison needs from a task
struct Snapshot {
    status: TaskStatus,
    downloaded: u64,
    progress: f64,
    speed: f64,
    finished: HashSet<PackageRef>,
}

impl Snapshot {
    fn of(task: &DownloadTask) -> Self {
        Self {
            status: task.status.clone(),
            downloaded: task.total_downloaded_size,
            progress: task.total_progress,
            speed: task.total_speed,
            finished: finished_packages(task),
        }
    }
}

fn finished_packages(task: &DownloadTask) -> HashSet<PackageRef> {
    task.packages().filter(|(_, p)| p.downloaded).map(|(at, _)| at).collect()
}

async fn coordinate(
    mut registry: TaskRegistry,
    mut rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<TaskEvent>,
) {
    // Sending fails only when nobody is subscribed
    let publish = |event: TaskEvent| {
        let _ = events.send(event);
    };

    while let Some(command) = rx.recv().await {
        match command {
            Command::Insert { task, reply } => {
                let event = TaskEvent::Created {
                    id: task.id,
                    product_code: task.product_code.clone(),
                    version: task.version.clone(),
                };
                let id = registry.insert(*task);
                debug!("Registered task {}", id);
                publish(event);
                let _ = reply.send(id);
            }
            Command::Apply { id, op } => match registry.get_mut(id) {
                Some(task) => {
                    let before = Snapshot::of(task);
                    let complete = op(Some(&mut *task));
                    for event in diff(id, &before, task) {
                        publish(event);
                    }
                    complete();
                }
                None => op(None)(),
            },
            Command::Get { id, reply } => {
                let _ = reply.send(registry.get(id).cloned());
            }
            Command::List { reply } => {
                let _ = reply.send(registry.list());
            }
            Command::Remove { id, reply } => {
                let removed = registry.remove(id);
                if removed.is_some() {
                    debug!("Removed task {}", id);
                    publish(TaskEvent::Removed { id });
                }
                let _ = reply.send(removed);
            }
            Command::ClearTerminal { reply } => {
                let cleared = registry.clear_terminal();
                for id in &cleared {
                    publish(TaskEvent::Removed { id: *id });
                }
                let _ = reply.send(cleared);
            }
        }
    }
    debug!("Task coordinator stopped");
}

fn diff(id: TaskId, before: &Snapshot, task: &DownloadTask) -> Vec<TaskEvent> {
    let mut events = Vec::new();

    let after = finished_packages(task);
    let mut newly: Vec<PackageRef> = after.difference(&before.finished).copied().collect();
    newly.sort_by_key(|at| (at.product, at.package));
    for at in newly {
        if let Some(package) = task.package(at) {
            events.push(TaskEvent::PackageCompleted {
                id,
                package: package.full_package_name.clone(),
            });
        }
    }

    if task.total_downloaded_size != before.downloaded
        || task.total_progress != before.progress
        || task.total_speed != before.speed
    {
        events.push(TaskEvent::Progress {
            id,
            downloaded: task.total_downloaded_size,
            total: task.total_size,
            progress: task.total_progress,
            speed: task.total_speed,
        });
    }

    if transitioned(&before.status, &task.status) {
        events.push(TaskEvent::StatusChanged {
            id,
            status: task.status.clone(),
        });
    }
    events
}

/// A change of state, as opposed to a refresh of the ETA inside the same state
fn transitioned(before: &TaskStatus, after: &TaskStatus) -> bool {
    match (before, after) {
        (TaskStatus::Downloading { package_index: a, .. }, TaskStatus::Downloading { package_index: b, .. }) => a != b,
        (TaskStatus::Preparing { stage: a, .. }, TaskStatus::Preparing { stage: b, .. }) => a != b,
        (TaskStatus::Retrying { attempt: a, .. }, TaskStatus::Retrying { attempt: b, .. }) => a != b,
        _ => before != after,
    }
}
