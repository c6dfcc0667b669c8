//! Priority task queue
//!
//! Top-level tasks wait in a priority-ordered list (FIFO within a priority)
//! and are started while fewer than `max_concurrent` are running and the
//! manager is not paused. Finished tasks move to a bounded, newest-first
//! history. The queued + running snapshot and the history are persisted
//! through [`Store`]s after every mutation.

pub mod runner;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::agent::AbortHandle;
use crate::metrics::{QUEUE_DEPTH, QUEUE_RUNNING, TASKS_FINISHED};
use crate::store::{MemoryStore, Store};

pub use runner::{AgentTaskRunner, TaskContext, TaskOutcome, TaskRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Paused => "paused",
        }
    }
}

/// Ordered: `Low < Normal < High < Urgent`
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "urgent" => Ok(TaskPriority::Urgent),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    ToolCall,
    ToolResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A top-level task and its lifecycle record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: Uuid,
    pub description: String,
    pub working_directory: PathBuf,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub logs: Vec<TaskLogEntry>,
    /// 0.0 to 1.0
    pub progress: f64,
    pub error: Option<String>,
    /// Split into subtasks before running
    pub use_decomposition: bool,
    pub result: Option<String>,
}

impl QueuedTask {
    pub fn new(description: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::now_v7(),
            description: description.into(),
            working_directory: working_directory.into(),
            status: TaskStatus::Queued,
            priority: TaskPriority::Normal,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            logs: Vec::new(),
            progress: 0.0,
            error: None,
            use_decomposition: false,
            result: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_decomposition(mut self, enabled: bool) -> Self {
        self.use_decomposition = enabled;
        self
    }

    /// Back to a fresh queued state, keeping id, description and settings
    fn reset(&mut self) {
        self.status = TaskStatus::Queued;
        self.created_at = Utc::now();
        self.started_at = None;
        self.completed_at = None;
        self.logs.clear();
        self.progress = 0.0;
        self.error = None;
        self.result = None;
    }
}

/// Queue settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            history_limit: 100,
        }
    }
}

struct RunningTask {
    task: QueuedTask,
    abort: AbortHandle,
    /// Distinguishes runs of the same task id across retries
    run: u64,
}

#[derive(Default)]
struct QueueState {
    queued: Vec<QueuedTask>,
    running: Vec<RunningTask>,
    history: VecDeque<QueuedTask>,
    paused: bool,
    next_run: u64,
}

impl QueueState {
    fn running_mut(&mut self, id: Uuid, run: u64) -> Option<&mut RunningTask> {
        self.running
            .iter_mut()
            .find(|r| r.task.id == id && r.run == run)
    }

    /// Insert before the first lower-priority entry
    fn insert(&mut self, mut task: QueuedTask) {
        task.status = if self.paused {
            TaskStatus::Paused
        } else {
            TaskStatus::Queued
        };
        let pos = self
            .queued
            .iter()
            .position(|t| t.priority < task.priority)
            .unwrap_or(self.queued.len());
        self.queued.insert(pos, task);
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    runner: Arc<dyn TaskRunner>,
    config: QueueConfig,
    snapshot_store: Box<dyn Store<Vec<QueuedTask>>>,
    history_store: Box<dyn Store<Vec<QueuedTask>>>,
    changed: watch::Sender<u64>,
}

/// Admits and bounds concurrent top-level tasks
#[derive(Clone)]
pub struct TaskQueueManager {
    inner: Arc<QueueInner>,
}

impl TaskQueueManager {
    /// Manager with in-memory persistence
    pub fn new(runner: Arc<dyn TaskRunner>, config: QueueConfig) -> Self {
        Self::with_stores(
            runner,
            config,
            Box::new(MemoryStore::new()),
            Box::new(MemoryStore::new()),
        )
    }

    /// Manager restoring its queue and history from the given stores
    ///
    /// Tasks that were running when the snapshot was taken come back queued.
    /// Nothing starts until [`advance`](Self::advance) or the next enqueue.
    pub fn with_stores(
        runner: Arc<dyn TaskRunner>,
        config: QueueConfig,
        snapshot_store: Box<dyn Store<Vec<QueuedTask>>>,
        history_store: Box<dyn Store<Vec<QueuedTask>>>,
    ) -> Self {
        let mut state = QueueState::default();
        match snapshot_store.load() {
            Ok(Some(tasks)) => {
                for mut task in tasks {
                    task.started_at = None;
                    state.insert(task);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load queue snapshot"),
        }
        match history_store.load() {
            Ok(Some(history)) => state.history = history.into_iter().collect(),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load task history"),
        }
        if !state.queued.is_empty() {
            info!(restored = state.queued.len(), "Restored queued tasks");
        }
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(state),
                runner,
                config,
                snapshot_store,
                history_store,
                changed,
            }),
        }
    }

    /// Add a task and try to start it; returns its id
    pub fn enqueue(&self, task: QueuedTask) -> Uuid {
        let id = task.id;
        {
            let mut state = self.inner.lock();
            info!(task_id = %id, priority = ?task.priority, "Task enqueued");
            state.insert(task);
            self.inner.persist(&state);
        }
        self.advance();
        id
    }

    /// Start queued tasks while capacity allows
    pub fn advance(&self) {
        QueueInner::advance(&self.inner);
    }

    /// Cancel a queued or running task
    ///
    /// A queued task is simply removed. A running task has its abort flag set
    /// and is recorded once in history as cancelled; its runner stops at the
    /// next abort check and whatever it reports afterwards is ignored.
    /// Returns false for unknown ids.
    pub fn cancel(&self, id: Uuid) -> bool {
        {
            let mut state = self.inner.lock();
            if let Some(pos) = state.queued.iter().position(|t| t.id == id) {
                state.queued.remove(pos);
                info!(task_id = %id, "Queued task removed");
                self.inner.persist(&state);
                drop(state);
                self.inner.notify();
                return true;
            }
            let Some(pos) = state.running.iter().position(|r| r.task.id == id) else {
                return false;
            };
            let running = state.running.remove(pos);
            running.abort.abort();
            let mut task = running.task;
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            info!(task_id = %id, "Running task cancelled");
            self.inner.record(&mut state, task);
        }
        self.inner.notify();
        self.advance();
        true
    }

    /// Stop admitting tasks; running tasks continue
    pub fn pause(&self) {
        let mut state = self.inner.lock();
        state.paused = true;
        for task in &mut state.queued {
            task.status = TaskStatus::Paused;
        }
        info!("Queue paused");
        self.inner.persist(&state);
    }

    pub fn resume(&self) {
        {
            let mut state = self.inner.lock();
            state.paused = false;
            for task in &mut state.queued {
                task.status = TaskStatus::Queued;
            }
            info!("Queue resumed");
            self.inner.persist(&state);
        }
        self.advance();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Change a queued task's priority and re-sort it
    pub fn set_priority(&self, id: Uuid, priority: TaskPriority) -> bool {
        let mut state = self.inner.lock();
        let Some(pos) = state.queued.iter().position(|t| t.id == id) else {
            return false;
        };
        let mut task = state.queued.remove(pos);
        task.priority = priority;
        state.insert(task);
        self.inner.persist(&state);
        true
    }

    /// Re-queue a failed or cancelled task from history
    pub fn retry(&self, id: Uuid) -> bool {
        {
            let mut state = self.inner.lock();
            let Some(pos) = state.history.iter().position(|t| {
                t.id == id && matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled)
            }) else {
                return false;
            };
            let Some(mut task) = state.history.remove(pos) else {
                return false;
            };
            task.reset();
            info!(task_id = %id, "Task re-queued");
            state.insert(task);
            self.inner.persist(&state);
        }
        self.advance();
        true
    }

    /// Queued tasks in start order
    pub fn queued(&self) -> Vec<QueuedTask> {
        self.inner.lock().queued.clone()
    }

    pub fn running(&self) -> Vec<QueuedTask> {
        self.inner
            .lock()
            .running
            .iter()
            .map(|r| r.task.clone())
            .collect()
    }

    /// Finished tasks, newest first
    pub fn history(&self) -> Vec<QueuedTask> {
        self.inner.lock().history.iter().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().running.len()
    }

    pub fn get(&self, id: Uuid) -> Option<QueuedTask> {
        let state = self.inner.lock();
        state
            .queued
            .iter()
            .chain(state.running.iter().map(|r| &r.task))
            .chain(state.history.iter())
            .find(|t| t.id == id)
            .cloned()
    }

    /// Wait until the task reaches history; `None` if it was removed while queued
    pub async fn wait_for(&self, id: Uuid) -> Option<QueuedTask> {
        let mut changed = self.inner.changed.subscribe();
        loop {
            {
                let state = self.inner.lock();
                if let Some(task) = state.history.iter().find(|t| t.id == id) {
                    return Some(task.clone());
                }
                let known = state.queued.iter().any(|t| t.id == id)
                    || state.running.iter().any(|r| r.task.id == id);
                if !known {
                    return None;
                }
            }
            if changed.changed().await.is_err() {
                return None;
            }
        }
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn advance(self: &Arc<Self>) {
        let mut state = self.lock();
        let mut started = false;
        while !state.paused
            && state.running.len() < self.config.max_concurrent
            && !state.queued.is_empty()
        {
            let mut task = state.queued.remove(0);
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            let abort = AbortHandle::new();
            let id = task.id;
            let run = state.next_run;
            state.next_run += 1;
            state.running.push(RunningTask {
                task: task.clone(),
                abort: abort.clone(),
                run,
            });

            let ctx = TaskContext {
                reporter: TaskReporter {
                    queue: Arc::downgrade(self),
                    task_id: id,
                    run,
                },
                abort,
            };
            let inner = self.clone();
            let span = info_span!("task", task_id = %id, otel.name = "task");
            tokio::spawn(
                async move {
                    let outcome = inner.runner.run(task, ctx).await;
                    inner.finish(id, run, outcome);
                }
                .instrument(span),
            );
            debug!(task_id = %id, running = state.running.len(), "Task started");
            started = true;
        }
        if started {
            self.persist(&state);
            drop(state);
            self.notify();
        }
    }

    fn finish(self: &Arc<Self>, id: Uuid, run: u64, outcome: TaskOutcome) {
        {
            let mut state = self.lock();
            // Missing when this run was cancelled first
            let Some(pos) = state
                .running
                .iter()
                .position(|r| r.task.id == id && r.run == run)
            else {
                debug!(task_id = %id, "Ignoring result of a cancelled run");
                return;
            };
            let mut task = state.running.remove(pos).task;
            task.completed_at = Some(Utc::now());
            match outcome {
                TaskOutcome::Completed(output) => {
                    task.status = TaskStatus::Completed;
                    task.progress = 1.0;
                    task.result = Some(output);
                }
                TaskOutcome::Failed(error) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error);
                }
                TaskOutcome::Cancelled => task.status = TaskStatus::Cancelled,
            }
            info!(task_id = %id, status = task.status.as_str(), "Task finished");
            self.record(&mut state, task);
        }
        self.notify();
        self.advance();
    }

    /// Push a finished task to history and persist
    fn record(&self, state: &mut QueueState, task: QueuedTask) {
        TASKS_FINISHED
            .with_label_values(&[task.status.as_str()])
            .inc();
        state.history.push_front(task);
        state.history.truncate(self.config.history_limit);
        self.persist(state);
    }

    fn persist(&self, state: &QueueState) {
        QUEUE_DEPTH.set(state.queued.len() as f64);
        QUEUE_RUNNING.set(state.running.len() as f64);

        let snapshot: Vec<QueuedTask> = state
            .running
            .iter()
            .map(|r| {
                let mut task = r.task.clone();
                task.status = TaskStatus::Queued;
                task
            })
            .chain(state.queued.iter().cloned())
            .collect();
        if let Err(e) = self.snapshot_store.save(&snapshot) {
            warn!(error = %e, "Failed to save queue snapshot");
        }
        let history: Vec<QueuedTask> = state.history.iter().cloned().collect();
        if let Err(e) = self.history_store.save(&history) {
            warn!(error = %e, "Failed to save task history");
        }
    }
}

/// Log and progress channel from a running task back to the queue
#[derive(Clone)]
pub struct TaskReporter {
    queue: Weak<QueueInner>,
    task_id: Uuid,
    run: u64,
}

impl TaskReporter {
    /// Reporter not attached to any queue
    pub fn detached() -> Self {
        Self {
            queue: Weak::new(),
            task_id: Uuid::nil(),
            run: 0,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        debug!(task_id = %self.task_id, ?level, %message, "Task log");
        self.update(|task| {
            task.logs.push(TaskLogEntry {
                timestamp: Utc::now(),
                level,
                message,
            })
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Clamped to 0.0..=1.0
    pub fn progress(&self, value: f64) {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        self.update(|task| task.progress = value);
    }

    fn update(&self, f: impl FnOnce(&mut QueuedTask)) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let mut state = queue.lock();
        if let Some(running) = state.running_mut(self.task_id, self.run) {
            f(&mut running.task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert!(TaskPriority::High < TaskPriority::Urgent);
        assert_eq!("URGENT".parse::<TaskPriority>(), Ok(TaskPriority::Urgent));
        assert!("asap".parse::<TaskPriority>().is_err());
    }

    #[test]
    fn test_insert_is_fifo_within_priority() {
        let mut state = QueueState::default();
        let a = QueuedTask::new("a", "/tmp");
        let b = QueuedTask::new("b", "/tmp").with_priority(TaskPriority::High);
        let c = QueuedTask::new("c", "/tmp");
        let d = QueuedTask::new("d", "/tmp").with_priority(TaskPriority::High);
        for t in [a, b, c, d] {
            state.insert(t);
        }
        let order: Vec<&str> = state.queued.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_reset_clears_run_data() {
        let mut task = QueuedTask::new("x", "/tmp");
        task.status = TaskStatus::Failed;
        task.started_at = Some(Utc::now());
        task.completed_at = Some(Utc::now());
        task.progress = 0.5;
        task.error = Some("boom".into());
        task.logs.push(TaskLogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Error,
            message: "boom".into(),
        });
        task.reset();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.started_at.is_none() && task.completed_at.is_none());
        assert!(task.logs.is_empty() && task.error.is_none());
        assert_eq!(task.progress, 0.0);
    }

    #[test]
    fn test_detached_reporter_is_noop() {
        let reporter = TaskReporter::detached();
        reporter.info("nothing listens");
        reporter.progress(2.0);
        assert!(reporter.task_id().is_nil());
    }
}
