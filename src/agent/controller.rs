//! Agent loop - bounded conversation between an LLM and the tool executor
//!
//! Each turn sends the full history to the provider. A response without tool
//! calls ends the run; otherwise every call is executed in order and its
//! result appended before the next turn.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::doom_loop::DoomLoopDetector;
use crate::llm::{LlmProvider, Message, ToolCall};
use crate::metrics::{AGENT_RUNS, AGENT_TURNS, DOOM_LOOPS, LLM_CALL_DURATION};
use crate::tools::executor::DEFAULT_MAX_OUTPUT_BYTES;
use crate::tools::{ToolContext, ToolExecutor};
use crate::vm::VmSession;

/// Default system prompt for coding tasks
pub const DEFAULT_AGENT_SYSTEM_PROMPT: &str = r#"You are a coding agent working inside a user's project.

Use the available tools to inspect and change the project until the task is done.
Call one tool at a time when later steps depend on earlier output.
When the task is complete, reply with a short summary and no tool calls."#;

/// Tool message for calls left unexecuted when a run stops mid-turn
pub const SKIPPED_CALL_MESSAGE: &str = "Skipped: run aborted";

/// Configuration for an agent loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum number of LLM calls before the run ends
    pub max_turns: usize,
    /// Custom system prompt (uses default if None)
    pub system_prompt: Option<String>,
    /// Cap on tool output fed back to the model
    pub max_tool_output_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 50,
            system_prompt: None,
            max_tool_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Shared cooperative stop flag
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a run stopped early
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// Someone called [`AbortHandle::abort`]
    Requested,
    /// The same tool call repeated too often
    DoomLoop { tool: String },
}

/// Terminal state of an agent run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentOutcome {
    /// The model answered without requesting tools
    Completed,
    /// `max_turns` was reached while the model still wanted tools
    TurnsExhausted,
    Aborted(AbortReason),
    /// The provider failed; the message is the error text
    Failed(String),
}

impl AgentOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AgentOutcome::Completed => "completed",
            AgentOutcome::TurnsExhausted => "turns_exhausted",
            AgentOutcome::Aborted(AbortReason::Requested) => "aborted",
            AgentOutcome::Aborted(AbortReason::DoomLoop { .. }) => "doom_loop",
            AgentOutcome::Failed(_) => "failed",
        }
    }

    /// Completed and turn-exhausted runs both count as success
    pub fn is_success(&self) -> bool {
        matches!(self, AgentOutcome::Completed | AgentOutcome::TurnsExhausted)
    }
}

/// Result of an agent run
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub outcome: AgentOutcome,
    /// Last assistant text
    pub final_response: String,
    /// Number of LLM calls made
    pub turns: usize,
    pub tool_calls_made: usize,
    /// Full conversation, system prompt included
    pub messages: Vec<Message>,
    pub trace_id: String,
}

/// Progress notifications from a running loop
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Info(String),
    Warning(String),
    Error(String),
    ToolCall { name: String, arguments: String },
    ToolResult { name: String, title: String, is_error: bool },
}

pub type EventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// One agent: provider + executor + limits
pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    executor: Arc<ToolExecutor>,
    config: AgentConfig,
    abort: AbortHandle,
    events: Option<EventSink>,
    vm: Option<Arc<VmSession>>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        executor: Arc<ToolExecutor>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            executor,
            config,
            abort: AbortHandle::new(),
            events: None,
            vm: None,
        }
    }

    /// Use an externally owned stop flag
    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    /// Run tools inside this sandbox
    pub fn with_vm(mut self, vm: Option<Arc<VmSession>>) -> Self {
        self.vm = vm;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(sink) = &self.events {
            sink(event);
        }
    }

    /// Run the loop for `task` in `working_directory`
    pub async fn run(&self, task: &str, working_directory: &Path) -> AgentRun {
        let trace_id = Uuid::now_v7().to_string();
        let root_span = info_span!(
            "agent_run",
            trace_id = %trace_id,
            otel.name = "agent_run"
        );

        async {
            info!(trace_id = %trace_id, task = %task, "Starting agent run");

            let system_prompt = self
                .config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_AGENT_SYSTEM_PROMPT.to_string());
            let mut messages = vec![Message::system(system_prompt), Message::user(task)];

            let tools = self.executor.registry().definitions();
            let ctx = ToolContext::new(working_directory)
                .with_abort(self.abort.clone())
                .with_vm(self.vm.clone());

            let mut detector = DoomLoopDetector::default();
            let mut doom_tool: Option<String> = None;
            let mut turns = 0;
            let mut tool_calls_made = 0;
            let mut final_response = String::new();

            let outcome = loop {
                if let Some(tool) = doom_tool.take() {
                    break AgentOutcome::Aborted(AbortReason::DoomLoop { tool });
                }
                if self.abort.is_aborted() {
                    break AgentOutcome::Aborted(AbortReason::Requested);
                }
                if turns >= self.config.max_turns {
                    warn!(trace_id = %trace_id, turns, "Max turns reached");
                    self.emit(AgentEvent::Warning(format!(
                        "Stopped after {} turns",
                        self.config.max_turns
                    )));
                    break AgentOutcome::TurnsExhausted;
                }
                turns += 1;

                let llm_span = info_span!(
                    "llm_call",
                    trace_id = %trace_id,
                    turn = turns,
                    otel.name = "llm_call"
                );
                let call_start = Instant::now();
                let response = self
                    .provider
                    .complete(&messages, &tools)
                    .instrument(llm_span)
                    .await;
                LLM_CALL_DURATION.observe(call_start.elapsed().as_secs_f64());

                let completion = match response {
                    Ok(completion) => completion,
                    Err(e) => {
                        warn!(trace_id = %trace_id, error = %e, "LLM call failed");
                        self.emit(AgentEvent::Error(format!("LLM call failed: {}", e)));
                        messages.push(Message::assistant(format!("Error: {}", e), Vec::new()));
                        break AgentOutcome::Failed(e.to_string());
                    }
                };

                debug!(
                    trace_id = %trace_id,
                    turn = turns,
                    tool_calls = completion.tool_calls.len(),
                    "LLM call completed"
                );
                final_response = completion.content.clone();
                messages.push(Message::assistant(
                    completion.content.clone(),
                    completion.tool_calls.clone(),
                ));

                if completion.tool_calls.is_empty() {
                    break AgentOutcome::Completed;
                }

                let mut calls = completion.tool_calls.into_iter();
                while let Some(call) = calls.next() {
                    if self.abort.is_aborted() {
                        skip_calls(std::iter::once(call).chain(calls), &mut messages);
                        break;
                    }
                    tool_calls_made += 1;
                    if let Some(warning) = self
                        .run_tool_call(&call, &ctx, &mut messages, &mut detector)
                        .await
                    {
                        // Every call of the turn gets its tool message before the warning
                        skip_calls(calls, &mut messages);
                        messages.push(Message::user(warning));
                        doom_tool = Some(call.name);
                        break;
                    }
                }
            };

            AGENT_RUNS.with_label_values(&[outcome.label()]).inc();
            AGENT_TURNS.observe(turns as f64);
            info!(
                trace_id = %trace_id,
                outcome = outcome.label(),
                turns,
                tool_calls = tool_calls_made,
                "Agent run finished"
            );

            AgentRun {
                outcome,
                final_response,
                turns,
                tool_calls_made,
                messages,
                trace_id: trace_id.clone(),
            }
        }
        .instrument(root_span)
        .await
    }

    /// Execute one call and append its tool message; returns the warning on a doom loop
    async fn run_tool_call(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        messages: &mut Vec<Message>,
        detector: &mut DoomLoopDetector,
    ) -> Option<String> {
        self.emit(AgentEvent::ToolCall {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let args = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Malformed tool arguments");
                self.emit(AgentEvent::Warning(format!(
                    "Malformed arguments for {}: {}",
                    call.name, e
                )));
                messages.push(Message::tool(
                    call.id.clone(),
                    format!("Error: could not parse arguments as JSON: {}", e),
                ));
                return None;
            }
        };

        let repeated = detector.record(&call.name, &args);
        let result = self.executor.execute(&call.name, args, ctx).await;
        self.emit(AgentEvent::ToolResult {
            name: call.name.clone(),
            title: result.title.clone(),
            is_error: result.is_error,
        });
        messages.push(Message::tool_result(call.id.clone(), result));

        if !repeated {
            return None;
        }
        DOOM_LOOPS.inc();
        let warning = format!(
            "The tool `{}` was called with identical arguments repeatedly. Stopping to avoid a loop.",
            call.name
        );
        warn!(tool = %call.name, "Doom loop detected");
        self.emit(AgentEvent::Warning(warning.clone()));
        self.abort.abort();
        Some(warning)
    }
}

/// Answer calls the run will not execute so each call id keeps a tool message
fn skip_calls(calls: impl Iterator<Item = ToolCall>, messages: &mut Vec<Message>) {
    for call in calls {
        debug!(tool = %call.name, "Skipping tool call after abort");
        messages.push(Message::tool(call.id, SKIPPED_CALL_MESSAGE));
    }
}

/// Parse raw tool arguments; blank input means no arguments
fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
}
