//! Tool abstraction and registry
//!
//! Concrete tools implement [`Tool`]; the [`ToolExecutor`] is the single
//! entry point the agent loop uses, adding approval, truncation and metrics
//! around every call.

pub mod executor;
pub mod shell;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::agent::AbortHandle;
use crate::llm::ToolDefinition;
use crate::vm::{VmError, VmSession};

pub use executor::ToolExecutor;
pub use shell::ShellTool;

/// What kind of effect a tool has, used by approval rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Read,
    Write,
    Execute,
    Network,
    Other,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Read => "read",
            ToolCategory::Write => "write",
            ToolCategory::Execute => "execute",
            ToolCategory::Network => "network",
            ToolCategory::Other => "other",
        }
    }

    /// Best-effort category for a tool known only by id (HTTP bridge callers)
    pub fn infer(tool_id: &str) -> Self {
        let id = tool_id.to_ascii_lowercase();
        let id = id.rsplit(['.', ':', '/']).next().unwrap_or(&id);
        match id {
            "read" | "read_file" | "grep" | "glob" | "ls" | "list" | "view" => ToolCategory::Read,
            "write" | "write_file" | "edit" | "patch" | "multiedit" | "delete" => {
                ToolCategory::Write
            }
            "bash" | "shell" | "exec" | "execute" | "run" => ToolCategory::Execute,
            "fetch" | "webfetch" | "http" | "curl" | "websearch" => ToolCategory::Network,
            _ => ToolCategory::Other,
        }
    }
}

/// Structured outcome of one tool execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub title: String,
    pub output: String,
    /// Whether the tool changed anything on disk or in the environment
    pub changed: bool,
    /// Canonical identity of the action, e.g. `bash:cargo test`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_key: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            output: output.into(),
            changed: false,
            normalized_key: None,
            metadata: HashMap::new(),
            is_error: false,
        }
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::ok(title, message)
        }
    }

    pub fn with_changed(mut self, changed: bool) -> Self {
        self.changed = changed;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.normalized_key = Some(key.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Text fed back to the model
    pub fn to_message_text(&self) -> String {
        if self.is_error {
            format!("Error: {}", self.output)
        } else {
            self.output.clone()
        }
    }
}

/// Per-call execution context
#[derive(Clone)]
pub struct ToolContext {
    pub working_directory: PathBuf,
    pub abort: AbortHandle,
    /// Sandbox to run commands in; `None` means run on the host
    pub vm: Option<Arc<VmSession>>,
}

impl ToolContext {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            abort: AbortHandle::new(),
            vm: None,
        }
    }

    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_vm(mut self, vm: Option<Arc<VmSession>>) -> Self {
        self.vm = vm;
        self
    }
}

/// Error type for tool execution
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Execution(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("sandbox error: {0}")]
    Vm(#[from] VmError),
    #[error("path {0} is outside every shared folder")]
    PathNotShared(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A capability the agent can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> &str;
    fn category(&self) -> ToolCategory;
    fn requires_approval(&self) -> bool;
    /// JSON Schema of the arguments
    fn input_schema(&self) -> Value;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.id().to_string(),
            description: self.description().to_string(),
            parameters: self.input_schema(),
        }
    }
}

/// Tools available to an agent, in registration order
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a tool with the same id is replaced in place
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter().position(|t| t.id() == tool.id()) {
            Some(i) => self.tools[i] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.id() == id).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.id().to_string()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
