//! Task execution for the queue
//!
//! [`AgentTaskRunner`] runs a task as one agent loop, or splits it with the
//! decomposer and runs the subtasks through the scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{LogLevel, QueuedTask, TaskReporter};
use crate::agent::{
    AbortHandle, AbortReason, AgentConfig, AgentEvent, AgentLoop, AgentOutcome, EventSink,
};
use crate::llm::LlmProvider;
use crate::planner::{
    AgentSubtaskRunner, SchedulerConfig, SubAgentScheduler, SubtaskDefinition, TaskDecomposer,
};
use crate::tools::ToolExecutor;
use crate::vm::VmSession;

const ABORT_POLL: Duration = Duration::from_millis(200);

/// How a task ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Final output text
    Completed(String),
    Failed(String),
    Cancelled,
}

/// Handed to a runner for each started task
pub struct TaskContext {
    pub reporter: TaskReporter,
    /// Set when the task is cancelled
    pub abort: AbortHandle,
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: QueuedTask, ctx: TaskContext) -> TaskOutcome;
}

/// Runs tasks with the agent stack
pub struct AgentTaskRunner {
    provider: Arc<dyn LlmProvider>,
    executor: Arc<ToolExecutor>,
    agent_config: AgentConfig,
    scheduler_config: SchedulerConfig,
    vm: Option<Arc<VmSession>>,
}

impl AgentTaskRunner {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        executor: Arc<ToolExecutor>,
        agent_config: AgentConfig,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        Self {
            provider,
            executor,
            agent_config,
            scheduler_config,
            vm: None,
        }
    }

    pub fn with_vm(mut self, vm: Option<Arc<VmSession>>) -> Self {
        self.vm = vm;
        self
    }

    async fn run_single(&self, task: &QueuedTask, ctx: &TaskContext) -> TaskOutcome {
        let agent = AgentLoop::new(
            self.provider.clone(),
            self.executor.clone(),
            self.agent_config.clone(),
        )
        .with_abort(ctx.abort.clone())
        .with_event_sink(event_sink(&ctx.reporter))
        .with_vm(self.vm.clone());

        let run = agent.run(&task.description, &task.working_directory).await;
        info!(outcome = run.outcome.label(), turns = run.turns, "Agent run finished");
        match run.outcome {
            AgentOutcome::Completed => TaskOutcome::Completed(run.final_response),
            AgentOutcome::TurnsExhausted => {
                ctx.reporter.warning(format!(
                    "Stopped after {} turns without a final answer",
                    run.turns
                ));
                TaskOutcome::Completed(run.final_response)
            }
            AgentOutcome::Aborted(AbortReason::Requested) => TaskOutcome::Cancelled,
            AgentOutcome::Aborted(AbortReason::DoomLoop { tool }) => TaskOutcome::Failed(
                format!("stopped: repeated identical calls to {}", tool),
            ),
            AgentOutcome::Failed(e) => TaskOutcome::Failed(e),
        }
    }

    async fn run_decomposed(
        &self,
        task: &QueuedTask,
        subtasks: Vec<SubtaskDefinition>,
        ctx: &TaskContext,
    ) -> TaskOutcome {
        let total = subtasks.len();
        ctx.reporter
            .info(format!("Split into {} subtasks", total));

        let runner = AgentSubtaskRunner::new(
            self.provider.clone(),
            self.executor.clone(),
            self.agent_config.clone(),
        )
        .with_vm(self.vm.clone())
        .with_event_sink(Some(event_sink(&ctx.reporter)));
        let reporter = ctx.reporter.clone();
        let scheduler = SubAgentScheduler::new(Arc::new(runner), self.scheduler_config.clone())
            .with_progress(Arc::new(move |completed, total| {
                reporter.progress(completed as f64 / total.max(1) as f64)
            }));

        let keys: Vec<String> = subtasks.iter().map(|s| s.key.clone()).collect();
        let execution = scheduler.execute(subtasks, &task.working_directory);
        tokio::pin!(execution);
        let results = tokio::select! {
            results = &mut execution => results,
            _ = wait_aborted(&ctx.abort) => {
                // Sub-loops stop at their next abort check
                scheduler.cancel();
                execution.await;
                return TaskOutcome::Cancelled;
            }
        };

        let mut summary = String::new();
        let mut failures = Vec::new();
        for (key, result) in keys.iter().zip(&results) {
            summary.push_str(&format!("## {}\n{}\n\n", key, result.output));
            if !result.success {
                let reason = result.error_message.as_deref().unwrap_or("failed");
                ctx.reporter
                    .error(format!("Subtask {} failed: {}", key, reason));
                failures.push(key.as_str());
            }
        }
        if failures.is_empty() {
            TaskOutcome::Completed(summary.trim_end().to_string())
        } else {
            TaskOutcome::Failed(format!(
                "{} of {} subtasks failed: {}",
                failures.len(),
                total,
                failures.join(", ")
            ))
        }
    }
}

#[async_trait]
impl TaskRunner for AgentTaskRunner {
    async fn run(&self, task: QueuedTask, ctx: TaskContext) -> TaskOutcome {
        ctx.reporter.info(format!("Started: {}", task.description));
        if !task.use_decomposition {
            return self.run_single(&task, &ctx).await;
        }

        let decomposer = TaskDecomposer::new(self.provider.clone());
        let tools = self.executor.registry().names();
        match decomposer.decompose(&task.description, &tools).await {
            Ok(subtasks) if subtasks.len() > 1 => self.run_decomposed(&task, subtasks, &ctx).await,
            Ok(_) => {
                ctx.reporter
                    .info("Task is a single subtask, running one agent");
                self.run_single(&task, &ctx).await
            }
            Err(e) => {
                warn!(error = %e, "Decomposition failed");
                ctx.reporter
                    .warning(format!("Decomposition failed, running one agent: {}", e));
                self.run_single(&task, &ctx).await
            }
        }
    }
}

/// Forward agent events into the task log
fn event_sink(reporter: &TaskReporter) -> EventSink {
    let reporter = reporter.clone();
    Arc::new(move |event| match event {
        AgentEvent::Info(message) => reporter.log(LogLevel::Info, message),
        AgentEvent::Warning(message) => reporter.log(LogLevel::Warning, message),
        AgentEvent::Error(message) => reporter.log(LogLevel::Error, message),
        AgentEvent::ToolCall { name, arguments } => {
            reporter.log(LogLevel::ToolCall, format!("{} {}", name, arguments))
        }
        AgentEvent::ToolResult {
            name,
            title,
            is_error,
        } => {
            let status = if is_error { "error" } else { "ok" };
            reporter.log(LogLevel::ToolResult, format!("{} [{}] {}", name, status, title))
        }
    })
}

async fn wait_aborted(abort: &AbortHandle) {
    while !abort.is_aborted() {
        tokio::time::sleep(ABORT_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalGate;
    use crate::llm::Completion;
    use crate::test_support::ScriptedProvider;
    use crate::tools::ToolRegistry;
    use std::path::PathBuf;

    fn runner(provider: Arc<ScriptedProvider>) -> AgentTaskRunner {
        let executor = Arc::new(ToolExecutor::new(
            ToolRegistry::new(),
            Arc::new(ApprovalGate::new()),
        ));
        AgentTaskRunner::new(
            provider,
            executor,
            AgentConfig::default(),
            SchedulerConfig::default(),
        )
    }

    fn ctx() -> TaskContext {
        TaskContext {
            reporter: TaskReporter::detached(),
            abort: AbortHandle::new(),
        }
    }

    #[tokio::test]
    async fn test_single_run_completes() {
        let provider = Arc::new(ScriptedProvider::new(vec![Completion::text("all done")]));
        let task = QueuedTask::new("say done", PathBuf::from("/tmp"));
        let outcome = runner(provider).run(task, ctx()).await;
        assert_eq!(outcome, TaskOutcome::Completed("all done".into()));
    }

    #[tokio::test]
    async fn test_bad_decomposition_falls_back_to_single_agent() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Completion::text("no plan here"),
            Completion::text("did it anyway"),
        ]));
        let task = QueuedTask::new("fix it", PathBuf::from("/tmp")).with_decomposition(true);
        let outcome = runner(provider.clone()).run(task, ctx()).await;
        assert_eq!(outcome, TaskOutcome::Completed("did it anyway".into()));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_decomposed_run_joins_outputs() {
        let provider = Arc::new(ScriptedProvider::from_fn(|messages| {
            let last = &messages[messages.len() - 1].content;
            if messages[0].content.contains("split software tasks") {
                return Ok(Completion::text(
                    r#"{"subtasks": [
                        {"id": "one", "description": "first part"},
                        {"id": "two", "description": "second part", "dependencies": ["one"]}
                    ]}"#,
                ));
            }
            if last.contains("second part") {
                assert!(last.contains("### one: first part\nfirst done"));
                return Ok(Completion::text("second done"));
            }
            Ok(Completion::text("first done"))
        }));
        let task = QueuedTask::new("two parts", PathBuf::from("/tmp")).with_decomposition(true);
        let outcome = runner(provider).run(task, ctx()).await;
        assert_eq!(
            outcome,
            TaskOutcome::Completed("## one\nfirst done\n\n## two\nsecond done".into())
        );
    }

    #[tokio::test]
    async fn test_provider_failure_fails_task() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        provider.push_error("model offline");
        let task = QueuedTask::new("anything", PathBuf::from("/tmp"));
        let outcome = runner(provider).run(task, ctx()).await;
        assert!(matches!(outcome, TaskOutcome::Failed(e) if e.contains("model offline")));
    }
}
