//! Ollama Chat API provider with tool calling support
//!
//! Translates the engine's [`Message`] history to Ollama's `/api/chat` wire
//! format and back. Tool-call arguments travel as JSON objects on the wire
//! but as raw strings inside the engine, so the agent loop owns parsing.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Completion, LlmConfig, LlmError, LlmProvider, Message, Role, ToolCall, ToolDefinition};

/// Tool call as Ollama sends it
#[derive(Debug, Clone, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Debug, Clone, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

/// Response from /api/chat
#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    message: WireMessage,
    #[serde(default)]
    done_reason: Option<String>,
}

/// Client for Ollama's /api/chat endpoint with tool support
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl ChatClient {
    /// Create a new chat client
    ///
    /// # Arguments
    /// * `base_url` - Ollama server URL (e.g., "http://localhost:11434")
    /// * `model` - The model name (e.g., "qwen3")
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            temperature: 0.0,
            client: reqwest::Client::new(),
        }
    }

    /// Build a client from config, rejecting an incomplete provider setup
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        if config.base_url.trim().is_empty() {
            return Err(LlmError::NotConfigured("llm.base_url is empty".into()));
        }
        if config.model.trim().is_empty() {
            return Err(LlmError::NotConfigured("llm.model is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Build the request body for /api/chat
    fn request_body(&self, messages: &[Message], tools: &[ToolDefinition]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(message_to_wire).collect::<Vec<_>>(),
            "stream": false,
            "options": {
                "temperature": self.temperature
            }
        });

        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

#[async_trait]
impl LlmProvider for ChatClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Completion, LlmError> {
        let endpoint = format!("{}/api/chat", self.base_url);
        let body = self.request_body(messages, tools);

        let response = self.client.post(&endpoint).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        let chat_response: ChatResponse = serde_json::from_str(&text)?;
        Ok(completion_from_wire(chat_response))
    }
}

/// Translate one engine message into Ollama's message shape
fn message_to_wire(message: &Message) -> Value {
    let mut wire = json!({
        "role": message.role.as_str(),
        "content": message.content,
    });
    if message.role == Role::Assistant && !message.tool_calls.is_empty() {
        wire["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    // Ollama wants an object; fall back to {} for payloads the model mangled
                    let arguments = serde_json::from_str::<Value>(&call.arguments)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| json!({}));
                    json!({ "function": { "name": call.name, "arguments": arguments } })
                })
                .collect(),
        );
    }
    wire
}

/// Convert a parsed response, falling back to tool calls embedded in the text
fn completion_from_wire(response: ChatResponse) -> Completion {
    let native: Vec<WireToolCall> = response
        .message
        .tool_calls
        .filter(|calls| !calls.is_empty())
        .unwrap_or_default();

    let tool_calls: Vec<ToolCall> = if native.is_empty() {
        parse_tool_calls_from_text(&response.message.content)
    } else {
        native
            .into_iter()
            .enumerate()
            .map(|(i, call)| {
                let arguments = match call.function.arguments {
                    Value::String(raw) => raw,
                    Value::Null => "{}".to_string(),
                    other => other.to_string(),
                };
                ToolCall {
                    id: call.id.unwrap_or_else(|| format!("call_{}", i)),
                    name: call.function.name,
                    arguments,
                }
            })
            .collect()
    };

    Completion {
        content: response.message.content,
        finish_reason: response
            .done_reason
            .or_else(|| (!tool_calls.is_empty()).then(|| "tool_calls".to_string())),
        tool_calls,
    }
}

/// Try to parse tool calls from the response content text
///
/// Some models print `{"name": ..., "arguments": {...}}` instead of using the
/// native tool_calls field. Every balanced top-level JSON object in the text
/// that has that shape becomes a call.
pub fn parse_tool_calls_from_text(content: &str) -> Vec<ToolCall> {
    let content = content.trim();
    let mut tool_calls = Vec::new();

    if let Some(call) = try_parse_tool_call(content, 0) {
        tool_calls.push(call);
        return tool_calls;
    }

    let mut depth = 0usize;
    let mut start = None;
    for (i, c) in content.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Some(call) = try_parse_tool_call(&content[s..=i], tool_calls.len()) {
                            tool_calls.push(call);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    tool_calls
}

fn try_parse_tool_call(json_str: &str, index: usize) -> Option<ToolCall> {
    let value: Value = serde_json::from_str(json_str).ok()?;
    let name = value.get("name")?.as_str()?;
    // Some models say "parameters" instead of "arguments"
    let arguments = value.get("arguments").or_else(|| value.get("parameters"))?;
    let arguments = match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    };
    Some(ToolCall {
        id: format!("text_call_{}", index),
        name: name.to_string(),
        arguments,
    })
}
