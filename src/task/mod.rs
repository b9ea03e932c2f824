//! Task registry - observer-visible progress handles.
//!
//! The pipeline never owns the task collection. It talks to a [`TaskReporter`]
//! (the front end's capability) and only keeps the opaque [`TaskId`]s it gets back.
//! Ids are UUID keys, so a task retired at 100% can never alias a later one; an
//! update to a retired id comes back as [`TaskError::Stale`] and is logged by
//! [`Reporter`] instead of failing the pipeline.
//!
//! [`TaskBoard`] is the in-process registry used by the CLI and by tests.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Opaque task handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskId(Uuid);

impl TaskId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub detail: String,
    /// Completion fraction in `[0, 1]`.
    pub progress: f32,
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Created(Task),
    Updated(Task),
    /// Progress reached 1.0 and the task left the registry.
    Retired(Task),
}

#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error("task {0} is no longer registered")]
    Stale(TaskId),
}

/// Task-reporting capability consumed by the pipeline.
pub trait TaskReporter: Send + Sync {
    fn create_task(&self, title: &str, detail: &str) -> TaskId;

    fn update_task(&self, id: TaskId, progress: f32, detail: Option<&str>)
        -> Result<(), TaskError>;
}

fn clamp_progress(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

// ─── Reporter ────────────────────────────────────────────────

/// Fire-and-forget wrapper handed to pipeline steps.
///
/// Stale handles are logged and swallowed.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<dyn TaskReporter>,
}

impl Reporter {
    pub fn new(inner: Arc<dyn TaskReporter>) -> Self {
        Self { inner }
    }

    pub fn create(&self, title: &str, detail: &str) -> TaskId {
        self.inner.create_task(title, detail)
    }

    pub fn update(&self, id: TaskId, progress: f32) {
        self.send(id, progress, None);
    }

    pub fn update_detail(&self, id: TaskId, progress: f32, detail: &str) {
        self.send(id, progress, Some(detail));
    }

    /// Drive the task to 1.0 so the registry retires it.
    pub fn finish(&self, id: TaskId) {
        self.send(id, 1.0, None);
    }

    fn send(&self, id: TaskId, progress: f32, detail: Option<&str>) {
        if let Err(e) = self.inner.update_task(id, progress, detail) {
            tracing::warn!("Ignoring task update: {}", e);
        }
    }
}

// ─── Task Board ──────────────────────────────────────────────

/// Thread-safe in-memory task registry.
///
/// Progress callbacks fire from download and output-drain tasks while observers
/// read snapshots, so all state sits behind one mutex. Every change is also
/// broadcast as a [`TaskEvent`].
pub struct TaskBoard {
    tasks: Mutex<HashMap<TaskId, Task>>,
    order: Mutex<Vec<TaskId>>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskBoard {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tasks: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            events,
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.lock().unwrap_or_else(|poisoned| {
            tracing::error!("TaskBoard lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_order(&self) -> MutexGuard<'_, Vec<TaskId>> {
        self.order.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to task events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Active tasks in creation order.
    pub fn snapshot(&self) -> Vec<Task> {
        let tasks = self.lock_tasks();
        self.lock_order()
            .iter()
            .filter_map(|id| tasks.get(id).cloned())
            .collect()
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.lock_tasks().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskReporter for TaskBoard {
    fn create_task(&self, title: &str, detail: &str) -> TaskId {
        let task = Task {
            id: TaskId::new(),
            title: title.to_string(),
            detail: detail.to_string(),
            progress: 0.0,
        };
        let id = task.id;
        self.lock_tasks().insert(id, task.clone());
        self.lock_order().push(id);
        tracing::debug!("Task created: {} ({})", task.title, id);
        let _ = self.events.send(TaskEvent::Created(task));
        id
    }

    fn update_task(
        &self,
        id: TaskId,
        progress: f32,
        detail: Option<&str>,
    ) -> Result<(), TaskError> {
        let event = {
            let mut tasks = self.lock_tasks();
            let task = tasks.get_mut(&id).ok_or(TaskError::Stale(id))?;
            task.progress = clamp_progress(progress);
            if let Some(detail) = detail {
                task.detail = detail.to_string();
            }

            if task.progress >= 1.0 {
                let retired = tasks.remove(&id).ok_or(TaskError::Stale(id))?;
                self.lock_order().retain(|t| *t != id);
                tracing::debug!("Task retired: {} ({})", retired.title, id);
                TaskEvent::Retired(retired)
            } else {
                TaskEvent::Updated(task.clone())
            }
        };
        let _ = self.events.send(event);
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────
