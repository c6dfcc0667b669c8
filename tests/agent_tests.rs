//! Integration tests for the agent loop
//!
//! These drive the loop with a scripted provider against the real executor,
//! approval gate and shell tool.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use agentvisor::agent::controller::SKIPPED_CALL_MESSAGE;
use agentvisor::agent::{AbortReason, AgentConfig, AgentEvent, AgentLoop, AgentOutcome};
use agentvisor::approval::{ApprovalGate, ApprovalRule};
use agentvisor::llm::{Completion, Message, Role, ToolCall};
use agentvisor::test_support::{tool_call, FakeBackend, ScriptedProvider};
use agentvisor::tools::{
    ShellTool, Tool, ToolCategory, ToolContext, ToolError, ToolExecutor, ToolRegistry, ToolResult,
};
use agentvisor::vm::{VmConfig, VmSession};

fn executor(gate: Arc<ApprovalGate>) -> Arc<ToolExecutor> {
    let registry = ToolRegistry::new().with(Arc::new(ShellTool::new()));
    Arc::new(ToolExecutor::new(registry, gate))
}

/// Gate that allows every shell command
fn open_gate() -> Arc<ApprovalGate> {
    let gate = Arc::new(ApprovalGate::new());
    gate.add_rule(ApprovalRule::new("bash", None, ToolCategory::Execute));
    gate
}

fn agent(provider: Arc<ScriptedProvider>, gate: Arc<ApprovalGate>) -> AgentLoop {
    AgentLoop::new(provider, executor(gate), AgentConfig::default())
}

#[tokio::test]
async fn test_answer_without_tools_completes_in_one_call() {
    let provider = Arc::new(ScriptedProvider::new(vec![Completion::text("Nothing to do.")]));
    let run = agent(provider.clone(), open_gate())
        .run("say hi", Path::new("/tmp"))
        .await;

    assert_eq!(run.outcome, AgentOutcome::Completed);
    assert_eq!(run.final_response, "Nothing to do.");
    assert_eq!(run.turns, 1);
    assert_eq!(provider.call_count(), 1);
    assert_eq!(run.messages[0].role, Role::System);
    assert_eq!(run.messages[1].content, "say hi");
}

#[tokio::test]
async fn test_tool_result_is_fed_back() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call("c1", "bash", r#"{"command": "echo from-shell"}"#),
        Completion::text("done"),
    ]));
    let run = agent(provider.clone(), open_gate())
        .run("run echo", dir.path())
        .await;

    assert_eq!(run.outcome, AgentOutcome::Completed);
    assert_eq!(run.tool_calls_made, 1);
    let second_call = &provider.calls()[1];
    let tool_message = second_call.last().unwrap();
    assert_eq!(tool_message.role, Role::Tool);
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("c1"));
    assert!(tool_message.content.contains("from-shell"));
}

#[tokio::test]
async fn test_three_identical_calls_abort_with_one_warning() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::repeating(tool_call(
        "same",
        "bash",
        r#"{"command": "true"}"#,
    )));
    let warnings = Arc::new(Mutex::new(Vec::new()));
    let seen = warnings.clone();
    let run = agent(provider.clone(), open_gate())
        .with_event_sink(Arc::new(move |event| {
            if let AgentEvent::Warning(w) = event {
                seen.lock().unwrap().push(w);
            }
        }))
        .run("loop forever", dir.path())
        .await;

    assert_eq!(
        run.outcome,
        AgentOutcome::Aborted(AbortReason::DoomLoop {
            tool: "bash".into()
        })
    );
    assert_eq!(provider.call_count(), 3);
    assert_eq!(warnings.lock().unwrap().len(), 1);
    let last = run.messages.last().unwrap();
    assert_eq!(last.role, Role::User);
    assert!(last.content.contains("identical arguments"));
}

/// Each tool call id in an assistant message is answered by exactly one tool message
fn assert_every_call_answered(messages: &[Message]) {
    for (i, message) in messages.iter().enumerate() {
        for call in &message.tool_calls {
            let answers = messages[i + 1..]
                .iter()
                .take_while(|m| m.role == Role::Tool)
                .filter(|m| m.tool_call_id.as_deref() == Some(call.id.as_str()))
                .count();
            assert_eq!(answers, 1, "call {} answered {} times", call.id, answers);
        }
    }
}

#[tokio::test]
async fn test_doom_loop_mid_turn_answers_remaining_calls() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::repeating(Completion::with_tool_calls(
        "",
        vec![
            ToolCall::new("a", "bash", r#"{"command": "true"}"#),
            ToolCall::new("b", "bash", r#"{"command": "true"}"#),
        ],
    )));
    let run = agent(provider.clone(), open_gate())
        .run("loop", dir.path())
        .await;

    assert!(matches!(run.outcome, AgentOutcome::Aborted(AbortReason::DoomLoop { .. })));
    // Calls a, b then a again trip the detector; the second b is skipped
    assert_eq!(provider.call_count(), 2);
    assert_eq!(run.tool_calls_made, 3);
    let n = run.messages.len();
    assert_eq!(run.messages[n - 1].role, Role::User);
    assert_eq!(run.messages[n - 2].tool_call_id.as_deref(), Some("b"));
    assert_eq!(run.messages[n - 2].content, SKIPPED_CALL_MESSAGE);
    assert_every_call_answered(&run.messages);
}

/// Requests an abort of the run it belongs to
struct StopTool;

#[async_trait]
impl Tool for StopTool {
    fn id(&self) -> &str {
        "stop"
    }

    fn description(&self) -> &str {
        "Stop the run"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Other
    }

    fn requires_approval(&self) -> bool {
        false
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        ctx.abort.abort();
        Ok(ToolResult::ok("stop", "stopping"))
    }
}

#[tokio::test]
async fn test_abort_mid_turn_answers_remaining_calls() {
    let registry = ToolRegistry::new()
        .with(Arc::new(ShellTool::new()))
        .with(Arc::new(StopTool));
    let executor = Arc::new(ToolExecutor::new(registry, open_gate()));
    let provider = Arc::new(ScriptedProvider::new(vec![
        Completion::with_tool_calls(
            "",
            vec![
                ToolCall::new("s", "stop", "{}"),
                ToolCall::new("x", "bash", r#"{"command": "touch nope"}"#),
                ToolCall::new("y", "bash", r#"{"command": "touch nope"}"#),
            ],
        ),
        Completion::text("never"),
    ]));
    let dir = tempfile::tempdir().unwrap();
    let run = AgentLoop::new(provider.clone(), executor, AgentConfig::default())
        .run("stop early", dir.path())
        .await;

    assert_eq!(run.outcome, AgentOutcome::Aborted(AbortReason::Requested));
    assert_eq!(run.tool_calls_made, 1);
    assert_eq!(provider.call_count(), 1);
    assert!(!dir.path().join("nope").exists());
    let skipped: Vec<_> = run
        .messages
        .iter()
        .filter(|m| m.content == SKIPPED_CALL_MESSAGE)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(skipped, vec!["x", "y"]);
    assert_every_call_answered(&run.messages);
}

#[tokio::test]
async fn test_turn_limit_ends_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut n = 0;
    let responses = std::iter::from_fn(|| {
        n += 1;
        Some(tool_call(
            &format!("c{}", n),
            "bash",
            &json!({ "command": format!("echo {}", n) }).to_string(),
        ))
    })
    .take(5)
    .collect();
    let provider = Arc::new(ScriptedProvider::new(responses));
    let config = AgentConfig {
        max_turns: 3,
        ..AgentConfig::default()
    };
    let run = AgentLoop::new(provider.clone(), executor(open_gate()), config)
        .run("keep going", dir.path())
        .await;

    assert_eq!(run.outcome, AgentOutcome::TurnsExhausted);
    assert!(run.outcome.is_success());
    assert_eq!(run.turns, 3);
    assert_eq!(provider.call_count(), 3);
}

#[tokio::test]
async fn test_provider_error_fails_run() {
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    provider.push_error("connection refused");
    let run = agent(provider, open_gate())
        .run("anything", Path::new("/tmp"))
        .await;

    assert!(matches!(&run.outcome, AgentOutcome::Failed(e) if e.contains("connection refused")));
    let last = run.messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.content.starts_with("Error:"));
}

#[tokio::test]
async fn test_malformed_arguments_reported_to_model() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Completion::with_tool_calls("", vec![ToolCall::new("bad", "bash", "{not json")]),
        Completion::text("sorry"),
    ]));
    let run = agent(provider.clone(), open_gate())
        .run("go", Path::new("/tmp"))
        .await;

    assert_eq!(run.outcome, AgentOutcome::Completed);
    let tool_message = provider.calls()[1].last().unwrap().clone();
    assert!(tool_message
        .content
        .starts_with("Error: could not parse arguments as JSON"));
}

#[tokio::test]
async fn test_unknown_tool_is_an_error_result() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call("x", "teleport", "{}"),
        Completion::text("ok"),
    ]));
    let run = agent(provider.clone(), open_gate())
        .run("go", Path::new("/tmp"))
        .await;

    assert_eq!(run.outcome, AgentOutcome::Completed);
    let tool_message = provider.calls()[1].last().unwrap().clone();
    assert!(tool_message.content.contains("Unknown tool: teleport"));
}

#[tokio::test]
async fn test_denied_call_becomes_error_result() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(ApprovalGate::new());
    let mut requests = gate.subscribe();
    let denier = {
        let gate = gate.clone();
        tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            gate.deny(request.id, "not today").unwrap();
        })
    };
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call("c1", "bash", r#"{"command": "touch should-not-exist"}"#),
        Completion::text("understood"),
    ]));
    let run = agent(provider.clone(), gate).run("touch", dir.path()).await;
    denier.await.unwrap();

    assert_eq!(run.outcome, AgentOutcome::Completed);
    let tool_message = provider.calls()[1].last().unwrap().clone();
    assert!(tool_message.content.contains("Permission denied: not today"));
    assert!(!dir.path().join("should-not-exist").exists());
}

#[tokio::test]
async fn test_remembered_approval_skips_later_prompts() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(ApprovalGate::new());
    let mut requests = gate.subscribe();
    let approver = {
        let gate = gate.clone();
        tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            gate.approve(request.id, true).unwrap();
        })
    };
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call("c1", "bash", r#"{"command": "echo one"}"#),
        tool_call("c2", "bash", r#"{"command": "echo two"}"#),
        Completion::text("done"),
    ]));
    let run = agent(provider, gate.clone()).run("echo twice", dir.path()).await;
    approver.await.unwrap();

    assert_eq!(run.outcome, AgentOutcome::Completed);
    assert_eq!(gate.rules().len(), 1);
    assert!(gate.pending().is_empty());
    assert_eq!(gate.history().len(), 2);
}

#[tokio::test]
async fn test_abort_before_start() {
    let provider = Arc::new(ScriptedProvider::new(vec![Completion::text("never")]));
    let agent = agent(provider.clone(), open_gate());
    agent.abort_handle().abort();
    let run = agent.run("stop", Path::new("/tmp")).await;

    assert_eq!(run.outcome, AgentOutcome::Aborted(AbortReason::Requested));
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn test_shell_runs_in_sandbox_when_attached() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new();
    let guest = backend.guest();
    let vm = VmSession::new(
        VmConfig {
            enabled: true,
            shared_folders: vec![dir.path().to_path_buf()],
            startup_timeout_secs: 10,
            command_timeout_secs: 10,
            ..VmConfig::default()
        },
        Arc::new(backend),
    );
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call("c1", "bash", r#"{"command": "pwd", "timeout_secs": 5}"#),
        Completion::text("done"),
    ]));
    let run = agent(provider.clone(), open_gate())
        .with_vm(Some(vm.clone()))
        .run("where am I", &dir.path().join("src"))
        .await;

    assert_eq!(run.outcome, AgentOutcome::Completed);
    let tool_message = provider.calls()[1].last().unwrap().clone();
    assert!(tool_message.content.contains("/mnt/share0/src"));
    assert!(guest
        .commands()
        .iter()
        .any(|c| c == "cd '/mnt/share0/src' && pwd"));

    vm.graceful_stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_sandbox_refuses_unshared_directory() {
    let shared = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let vm = VmSession::new(
        VmConfig {
            enabled: true,
            shared_folders: vec![shared.path().to_path_buf()],
            ..VmConfig::default()
        },
        Arc::new(FakeBackend::new()),
    );
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call("c1", "bash", r#"{"command": "ls"}"#),
        Completion::text("done"),
    ]));
    let run = agent(provider.clone(), open_gate())
        .with_vm(Some(vm.clone()))
        .run("list", elsewhere.path())
        .await;

    assert_eq!(run.outcome, AgentOutcome::Completed);
    let tool_message = provider.calls()[1].last().unwrap().clone();
    assert!(tool_message.content.starts_with("Error:"));
    vm.stop().await.unwrap();
}
