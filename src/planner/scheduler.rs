//! Dependency-gated parallel execution of subtasks
//!
//! Subtasks whose dependencies have all completed are admitted up to
//! `max_parallel` at a time. Each spawned unit reports exactly once on a
//! fan-in channel; a drop guard covers panics and aborts. When nothing is
//! running and subtasks are still pending, their dependencies can never
//! complete (a failure upstream or a cycle), so they fail as blocked.
//!
//! Cancelling sets every unit's abort flag and waits for running units to
//! stop at their next check; in-flight tool calls are not interrupted.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::decomposer::SubtaskDefinition;
use crate::agent::{AbortHandle, AbortReason, AgentConfig, AgentLoop, AgentOutcome, EventSink};
use crate::llm::LlmProvider;
use crate::tools::ToolExecutor;
use crate::vm::VmSession;

pub const BLOCKED_MESSAGE: &str = "blocked by unfinished dependencies";

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Subtasks allowed to run at once
    pub max_parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_parallel: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubtaskStatus::Completed | SubtaskStatus::Failed | SubtaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub subtask_id: Uuid,
    pub success: bool,
    pub output: String,
    pub error_message: Option<String>,
    pub turns: usize,
}

impl SubtaskResult {
    pub fn failed(subtask_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            subtask_id,
            success: false,
            output: String::new(),
            error_message: Some(message.into()),
            turns: 0,
        }
    }
}

/// Observable state of one subtask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskState {
    pub id: Uuid,
    pub description: String,
    pub status: SubtaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<SubtaskResult>,
}

/// Executes one subtask
#[async_trait]
pub trait SubtaskRunner: Send + Sync {
    /// `prompt` already contains the outputs of the subtask's dependencies
    async fn run(
        &self,
        subtask: &SubtaskDefinition,
        prompt: String,
        working_directory: &Path,
        abort: AbortHandle,
    ) -> SubtaskResult;
}

pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Reports a failure if the unit ends without reporting
struct CompletionGuard {
    tx: mpsc::UnboundedSender<SubtaskResult>,
    id: Uuid,
    sent: bool,
}

impl CompletionGuard {
    fn complete(mut self, result: SubtaskResult) {
        self.sent = true;
        let _ = self.tx.send(result);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.tx.send(SubtaskResult::failed(
                self.id,
                "subtask ended without a result",
            ));
        }
    }
}

/// Spawned units, aborted when the scheduler future is dropped
#[derive(Default)]
struct Units(HashMap<Uuid, JoinHandle<()>>);

impl Drop for Units {
    fn drop(&mut self) {
        for (_, handle) in self.0.drain() {
            handle.abort();
        }
    }
}

/// Runs a subtask graph with bounded parallelism
pub struct SubAgentScheduler {
    runner: Arc<dyn SubtaskRunner>,
    config: SchedulerConfig,
    progress: Option<ProgressCallback>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    states: Mutex<Vec<SubtaskState>>,
    aborts: Mutex<HashMap<Uuid, AbortHandle>>,
}

impl SubAgentScheduler {
    pub fn new(runner: Arc<dyn SubtaskRunner>, config: SchedulerConfig) -> Self {
        Self {
            runner,
            config,
            progress: None,
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            states: Mutex::new(Vec::new()),
            aborts: Mutex::new(HashMap::new()),
        }
    }

    /// Called with `(completed, total)` after every subtask that completes
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Snapshot of every subtask's state, in definition order
    pub fn states(&self) -> Vec<SubtaskState> {
        self.lock_states().clone()
    }

    /// Cancel pending and running subtasks
    ///
    /// Running units are asked to stop; `execute` returns once they have.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.abort_units();
        self.cancel_notify.notify_one();
    }

    fn abort_units(&self) {
        for abort in self
            .aborts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, Vec<SubtaskState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, index: usize, f: impl FnOnce(&mut SubtaskState)) {
        if let Some(state) = self.lock_states().get_mut(index) {
            f(state);
        }
    }

    /// Run every subtask; results come back in definition order
    pub async fn execute(
        &self,
        definitions: Vec<SubtaskDefinition>,
        working_directory: &Path,
    ) -> Vec<SubtaskResult> {
        let total = definitions.len();
        let index: HashMap<Uuid, usize> = definitions
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id, i))
            .collect();
        *self.lock_states() = definitions
            .iter()
            .map(|d| SubtaskState {
                id: d.id,
                description: d.description.clone(),
                status: SubtaskStatus::Pending,
                started_at: None,
                ended_at: None,
                result: None,
            })
            .collect();

        // Higher priority first among eligible subtasks, then definition order
        let mut admission: Vec<usize> = (0..total).collect();
        admission.sort_by_key(|&i| std::cmp::Reverse(definitions[i].priority));

        let (tx, mut rx) = mpsc::unbounded_channel::<SubtaskResult>();
        let mut units = Units::default();
        let mut completed: HashSet<Uuid> = HashSet::new();
        let mut results: HashMap<Uuid, SubtaskResult> = HashMap::new();

        info!(total, max_parallel = self.config.max_parallel, "Scheduling subtasks");

        loop {
            if self.is_cancelled() {
                break;
            }

            for &i in &admission {
                if units.0.len() >= self.config.max_parallel.max(1) {
                    break;
                }
                let def = &definitions[i];
                let pending = self.lock_states()[i].status == SubtaskStatus::Pending;
                if !pending || !def.dependencies.iter().all(|d| completed.contains(d)) {
                    continue;
                }
                let prompt = build_prompt(def, &definitions, &index, &results);
                let handle = self.spawn_unit(def.clone(), prompt, working_directory, tx.clone());
                units.0.insert(def.id, handle);
                self.update(i, |s| {
                    s.status = SubtaskStatus::Running;
                    s.started_at = Some(Utc::now());
                });
                debug!(subtask = %def.key, "Subtask started");
            }

            if units.0.is_empty() {
                break;
            }

            let result = tokio::select! {
                result = rx.recv() => result,
                _ = self.cancel_notify.notified() => continue,
            };
            // `tx` is still held here, so the channel cannot close
            let Some(result) = result else { break };
            let Some(&i) = index.get(&result.subtask_id) else {
                continue;
            };
            units.0.remove(&result.subtask_id);
            self.aborts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&result.subtask_id);

            let status = if result.success {
                completed.insert(result.subtask_id);
                SubtaskStatus::Completed
            } else {
                warn!(
                    subtask = %definitions[i].key,
                    error = ?result.error_message,
                    "Subtask failed"
                );
                SubtaskStatus::Failed
            };
            self.update(i, |s| {
                s.status = status;
                s.ended_at = Some(Utc::now());
                s.result = Some(result.clone());
            });
            let success = result.success;
            results.insert(result.subtask_id, result);
            if let Some(progress) = self.progress.as_ref().filter(|_| success) {
                progress(completed.len(), total);
            }
        }

        let cancelled = self.is_cancelled();
        if cancelled && !units.0.is_empty() {
            // A unit spawned while `cancel` ran may have missed its flag
            self.abort_units();
            debug!(running = units.0.len(), "Waiting for cancelled subtasks to stop");
            while !units.0.is_empty() {
                let Some(result) = rx.recv().await else { break };
                units.0.remove(&result.subtask_id);
            }
            self.aborts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }
        let leftover = if cancelled {
            SubtaskStatus::Cancelled
        } else {
            SubtaskStatus::Failed
        };
        let message = if cancelled { "cancelled" } else { BLOCKED_MESSAGE };
        drop(units);

        definitions
            .iter()
            .enumerate()
            .map(|(i, def)| {
                if let Some(result) = results.remove(&def.id) {
                    return result;
                }
                let result = SubtaskResult::failed(def.id, message);
                self.update(i, |s| {
                    s.status = leftover;
                    s.ended_at = Some(Utc::now());
                    s.result = Some(result.clone());
                });
                result
            })
            .collect()
    }

    fn spawn_unit(
        &self,
        def: SubtaskDefinition,
        prompt: String,
        working_directory: &Path,
        tx: mpsc::UnboundedSender<SubtaskResult>,
    ) -> JoinHandle<()> {
        let abort = AbortHandle::new();
        self.aborts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(def.id, abort.clone());
        let runner = self.runner.clone();
        let working_directory: PathBuf = working_directory.to_path_buf();
        let span = info_span!("subtask", subtask = %def.key, otel.name = "subtask");
        tokio::spawn(
            async move {
                let guard = CompletionGuard {
                    tx,
                    id: def.id,
                    sent: false,
                };
                let mut result = runner.run(&def, prompt, &working_directory, abort).await;
                result.subtask_id = def.id;
                guard.complete(result);
            }
            .instrument(span),
        )
    }
}

/// Subtask prompt with dependency outputs prepended
fn build_prompt(
    def: &SubtaskDefinition,
    definitions: &[SubtaskDefinition],
    index: &HashMap<Uuid, usize>,
    results: &HashMap<Uuid, SubtaskResult>,
) -> String {
    let mut prompt = String::new();
    if !def.dependencies.is_empty() {
        prompt.push_str("Results from prerequisite subtasks:\n\n");
        for dep in &def.dependencies {
            let (Some(&i), Some(result)) = (index.get(dep), results.get(dep)) else {
                continue;
            };
            prompt.push_str(&format!(
                "### {}: {}\n{}\n\n",
                definitions[i].key, definitions[i].description, result.output
            ));
        }
        prompt.push_str("---\n\nYour subtask:\n");
    }
    prompt.push_str(&def.description);
    if let Some(expected) = &def.expected_output {
        prompt.push_str(&format!("\n\nExpected output: {}", expected));
    }
    prompt
}

/// Runs each subtask as a fresh agent loop sharing provider and executor
pub struct AgentSubtaskRunner {
    provider: Arc<dyn LlmProvider>,
    executor: Arc<ToolExecutor>,
    config: AgentConfig,
    vm: Option<Arc<VmSession>>,
    events: Option<EventSink>,
}

impl AgentSubtaskRunner {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        executor: Arc<ToolExecutor>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            executor,
            config,
            vm: None,
            events: None,
        }
    }

    pub fn with_vm(mut self, vm: Option<Arc<VmSession>>) -> Self {
        self.vm = vm;
        self
    }

    pub fn with_event_sink(mut self, sink: Option<EventSink>) -> Self {
        self.events = sink;
        self
    }
}

#[async_trait]
impl SubtaskRunner for AgentSubtaskRunner {
    async fn run(
        &self,
        subtask: &SubtaskDefinition,
        prompt: String,
        working_directory: &Path,
        abort: AbortHandle,
    ) -> SubtaskResult {
        let mut agent = AgentLoop::new(
            self.provider.clone(),
            self.executor.clone(),
            self.config.clone(),
        )
        .with_abort(abort)
        .with_vm(self.vm.clone());
        if let Some(sink) = &self.events {
            agent = agent.with_event_sink(sink.clone());
        }

        let run = agent.run(&prompt, working_directory).await;
        let error_message = match &run.outcome {
            AgentOutcome::Completed | AgentOutcome::TurnsExhausted => None,
            AgentOutcome::Failed(e) => Some(e.clone()),
            AgentOutcome::Aborted(AbortReason::Requested) => Some("aborted".to_string()),
            AgentOutcome::Aborted(AbortReason::DoomLoop { tool }) => {
                Some(format!("stopped: repeated identical calls to {}", tool))
            }
        };
        SubtaskResult {
            subtask_id: subtask.id,
            success: run.outcome.is_success(),
            output: run.final_response,
            error_message,
            turns: run.turns,
        }
    }
}
