//! Tool executor: lookup, approval, execution and output truncation

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use super::{ToolContext, ToolRegistry, ToolResult};
use crate::approval::{ApprovalGate, ApprovalRequest, Decision};
use crate::metrics::TOOL_CALLS;

/// Default cap on tool output fed back to the model
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 50_000;

/// Runs tools on behalf of agent loops
///
/// Every failure mode (unknown tool, denial, tool error) becomes an error
/// [`ToolResult`] so the conversation can continue.
pub struct ToolExecutor {
    registry: ToolRegistry,
    gate: Arc<ApprovalGate>,
    max_output_bytes: usize,
    approval_timeout: Option<Duration>,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, gate: Arc<ApprovalGate>) -> Self {
        Self {
            registry,
            gate,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            approval_timeout: None,
        }
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Deny approvals nobody answers within `timeout`
    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    /// Execute a tool by name
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = self.registry.get(name) else {
            warn!(tool = %name, "Unknown tool requested");
            TOOL_CALLS.with_label_values(&[name, "unknown"]).inc();
            return ToolResult::error(name, format!("Unknown tool: {}", name));
        };

        if tool.requires_approval() {
            let request = ApprovalRequest::new(
                tool.id(),
                name,
                tool.category(),
                args.clone(),
                ctx.working_directory.clone(),
            );
            let decision = match self.approval_timeout {
                Some(timeout) => self
                    .gate
                    .request_with_timeout(request, timeout)
                    .await
                    .unwrap_or_else(|e| Decision::Denied {
                        reason: e.to_string(),
                    }),
                None => self.gate.request(request).await,
            };
            if let Decision::Denied { reason } = decision {
                debug!(tool = %name, reason = %reason, "Tool call denied");
                TOOL_CALLS.with_label_values(&[name, "denied"]).inc();
                return ToolResult::error(name, format!("Permission denied: {}", reason));
            }
        }

        let span = info_span!("tool_execution", tool = %name, otel.name = "tool_execution");
        let result = match tool.execute(args, ctx).instrument(span).await {
            Ok(result) => {
                let status = if result.is_error { "error" } else { "success" };
                TOOL_CALLS.with_label_values(&[name, status]).inc();
                result
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool execution failed");
                TOOL_CALLS.with_label_values(&[name, "error"]).inc();
                ToolResult::error(name, e.to_string()).with_changed(false)
            }
        };

        self.truncate(result)
    }

    fn truncate(&self, mut result: ToolResult) -> ToolResult {
        if result.output.len() > self.max_output_bytes {
            result.output = truncate_output(&result.output, self.max_output_bytes);
            result = result.with_metadata("truncated", Value::Bool(true));
        }
        result
    }
}

/// Cut `output` to at most `max` bytes on a char boundary and append a notice
pub fn truncate_output(output: &str, max: usize) -> String {
    if output.len() <= max {
        return output.to_string();
    }
    let mut end = max;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n\n[output truncated: showing {} of {} bytes]",
        &output[..end],
        end,
        output.len()
    )
}
