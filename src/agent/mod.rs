//! Agent module for LLM-driven coding tasks
//!
//! # Architecture
//!
//! ```text
//! Task → AgentLoop → LlmProvider::complete (history + tool definitions)
//!             ↓
//!       tool calls? ── no ──▶ Completed
//!             ↓ yes
//!       ToolExecutor → ApprovalGate → Tool (host or VmSession)
//!             ↓
//!       DoomLoopDetector (3 identical calls ⇒ abort)
//!             ↓
//!       append tool results → next turn (≤ max_turns)
//! ```

pub mod controller;
pub mod doom_loop;

pub use controller::{
    AbortHandle, AbortReason, AgentConfig, AgentEvent, AgentLoop, AgentOutcome, AgentRun,
    EventSink, DEFAULT_AGENT_SYSTEM_PROMPT,
};
pub use doom_loop::DoomLoopDetector;
