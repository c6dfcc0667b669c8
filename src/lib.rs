//! AgentVisor - coding agents with gated tools and a sandboxed shell
//!
//! This library provides the agent execution engine: a turn-based agent
//! loop, an approval gate in front of every side-effecting tool, a QEMU VM
//! command channel, task decomposition with a dependency-gated scheduler and
//! a priority task queue.
//!
//! # Modules
//!
//! - `agent` - Agent loop and doom-loop detection
//! - `approval` - Approval gate, remembered rules and the HTTP bridge
//! - `tools` - Tool trait, registry and the approval-aware executor
//! - `llm` - LLM provider trait and the Ollama chat client
//! - `vm` - QEMU sandbox session with a serialized serial console
//! - `planner` - Task decomposer and sub-agent scheduler
//! - `queue` - Priority task queue manager
//! - `store` - JSON persistence for queue, history and rules
//! - `config` - TOML configuration
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - Logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use agentvisor::queue::{QueuedTask, TaskQueueManager};
//!
//! let queue = TaskQueueManager::new(runner, QueueConfig::default());
//! let id = queue.enqueue(QueuedTask::new("add a README", "/work/project"));
//! let finished = queue.wait_for(id).await;
//! ```

pub mod agent;
pub mod approval;
pub mod config;
pub mod llm;
pub mod metrics;
pub mod planner;
pub mod queue;
pub mod store;
pub mod tools;
pub mod tracing;
pub mod vm;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentLoop, AgentOutcome};
pub use approval::ApprovalGate;
pub use queue::{QueuedTask, TaskQueueManager};
pub use vm::VmSession;
