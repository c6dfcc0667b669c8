//! Prometheus metrics for the agent engine
//!
//! All metrics live in a single registry so the approval bridge can expose
//! them on `GET /metrics` without touching the process-global default.
//!
//! # Metric families
//!
//! ```text
//! agent_*     agent loop runs, turns, doom-loop detections
//! tool_*      tool executions by tool and status
//! approval_*  gate decisions and pending requests
//! vm_*        sandbox boot time and command execution
//! queue_*     queue depth, running tasks, finished tasks
//! ```

use lazy_static::lazy_static;
use prometheus::{
    register_gauge_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, Gauge, Histogram, HistogramVec, IntCounter,
    IntCounterVec, Registry, TextEncoder,
};

lazy_static! {
    /// Registry holding every agentvisor metric
    pub static ref REGISTRY: Registry = Registry::new_custom(Some("agentvisor".to_string()), None)
        .expect("static registry prefix is valid");

    // ── Agent loop ──────────────────────────────────────────────────────
    pub static ref AGENT_RUNS: IntCounterVec = register_int_counter_vec_with_registry!(
        "agent_runs_total",
        "Agent loop runs by terminal outcome",
        &["outcome"],
        REGISTRY
    )
    .expect("agent_runs_total registers once");

    pub static ref AGENT_TURNS: Histogram = register_histogram_with_registry!(
        "agent_turns",
        "LLM turns used per agent run",
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0],
        REGISTRY
    )
    .expect("agent_turns registers once");

    pub static ref LLM_CALL_DURATION: Histogram = register_histogram_with_registry!(
        "llm_call_duration_seconds",
        "Latency of a single LLM completion call",
        REGISTRY
    )
    .expect("llm_call_duration_seconds registers once");

    pub static ref DOOM_LOOPS: IntCounter = register_int_counter_with_registry!(
        "doom_loops_total",
        "Repeated identical tool calls detected",
        REGISTRY
    )
    .expect("doom_loops_total registers once");

    // ── Tools ───────────────────────────────────────────────────────────
    pub static ref TOOL_CALLS: IntCounterVec = register_int_counter_vec_with_registry!(
        "tool_calls_total",
        "Tool executions by tool and status",
        &["tool", "status"],
        REGISTRY
    )
    .expect("tool_calls_total registers once");

    // ── Approval gate ───────────────────────────────────────────────────
    pub static ref APPROVAL_DECISIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "approval_decisions_total",
        "Approval gate resolutions by source and result",
        &["source", "result"],
        REGISTRY
    )
    .expect("approval_decisions_total registers once");

    pub static ref APPROVALS_PENDING: Gauge = register_gauge_with_registry!(
        "approvals_pending",
        "Approval requests waiting for a decision",
        REGISTRY
    )
    .expect("approvals_pending registers once");

    // ── Sandbox VM ──────────────────────────────────────────────────────
    pub static ref VM_BOOT_DURATION: Histogram = register_histogram_with_registry!(
        "vm_boot_duration_seconds",
        "Time from boot request until the guest shell answers",
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0],
        REGISTRY
    )
    .expect("vm_boot_duration_seconds registers once");

    pub static ref VM_COMMANDS: IntCounterVec = register_int_counter_vec_with_registry!(
        "vm_commands_total",
        "Guest commands by status",
        &["status"],
        REGISTRY
    )
    .expect("vm_commands_total registers once");

    pub static ref VM_COMMAND_DURATION: HistogramVec = register_histogram_vec_with_registry!(
        "vm_command_duration_seconds",
        "Guest command wall-clock duration",
        &["status"],
        REGISTRY
    )
    .expect("vm_command_duration_seconds registers once");

    // ── Task queue ──────────────────────────────────────────────────────
    pub static ref QUEUE_DEPTH: Gauge = register_gauge_with_registry!(
        "queue_depth",
        "Tasks waiting in the queue",
        REGISTRY
    )
    .expect("queue_depth registers once");

    pub static ref QUEUE_RUNNING: Gauge = register_gauge_with_registry!(
        "queue_running",
        "Tasks currently running",
        REGISTRY
    )
    .expect("queue_running registers once");

    pub static ref TASKS_FINISHED: IntCounterVec = register_int_counter_vec_with_registry!(
        "tasks_finished_total",
        "Top-level tasks by terminal status",
        &["status"],
        REGISTRY
    )
    .expect("tasks_finished_total registers once");
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
