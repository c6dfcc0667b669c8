//! LLM collaborator interface
//!
//! The engine is agnostic to the provider wire format: it hands a message
//! history and tool definitions to an [`LlmProvider`] and gets back assistant
//! text plus zero or more tool calls. Translating to a concrete API is the
//! provider's job (see [`ollama::ChatClient`]).

pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tools::ToolResult;

pub use ollama::ChatClient;

/// Who authored a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A message in an agent conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Set on tool messages: the call this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on assistant messages that requested tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Structured result attached to a tool message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            tool_result: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// A plain-text tool message (used for argument parse failures)
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    /// A tool message carrying the full structured result
    pub fn tool_result(call_id: impl Into<String>, result: ToolResult) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            content: result.to_message_text(),
            tool_result: Some(result),
            ..Self::new(Role::Tool, "")
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument payload, parsed by the agent loop
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Tool definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments
    pub parameters: serde_json::Value,
}

/// One model response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

impl Completion {
    /// A text-only response
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// A response requesting tools
    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
            finish_reason: Some("tool_calls".to_string()),
        }
    }
}

/// Error type for LLM calls
#[derive(Debug, Error)]
pub enum LlmError {
    /// No provider (or an incomplete one) is configured
    #[error("no LLM provider configured: {0}")]
    NotConfigured(String),
    #[error("LLM request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("LLM returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to parse LLM response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("empty response from LLM")]
    EmptyResponse,
}

/// The model behind an agent loop
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send the full history and available tools, get one response back
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Completion, LlmError>;
}

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the Ollama server
    pub base_url: String,
    /// Model name (e.g., "qwen3")
    pub model: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "qwen3".to_string(),
            request_timeout_secs: 300,
            temperature: 0.0,
        }
    }
}
