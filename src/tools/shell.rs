//! Shell command tool
//!
//! Runs inside the sandbox VM when the context carries one, otherwise on the
//! host through `sh -c`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use super::{Tool, ToolCategory, ToolContext, ToolError, ToolResult};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Deserialize)]
struct ShellArgs {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// `bash` tool
pub struct ShellTool {
    default_timeout_secs: u64,
}

impl ShellTool {
    pub fn new() -> Self {
        Self::with_default_timeout(DEFAULT_TIMEOUT_SECS)
    }

    pub fn with_default_timeout(secs: u64) -> Self {
        Self {
            default_timeout_secs: secs,
        }
    }

    async fn run_in_vm(
        &self,
        command: &str,
        timeout: Duration,
        ctx: &ToolContext,
    ) -> Result<(String, i32, bool), ToolError> {
        let Some(vm) = ctx.vm.as_ref() else {
            return Err(ToolError::Execution("no sandbox attached".into()));
        };
        vm.ensure_running().await?;
        let guest_dir = vm
            .shared_folders()
            .to_guest(&ctx.working_directory)
            .ok_or_else(|| ToolError::PathNotShared(ctx.working_directory.clone()))?;
        let result = vm.execute(command, timeout, Some(&guest_dir)).await?;
        Ok((result.output, result.exit_code, result.timed_out))
    }

    async fn run_local(
        &self,
        command: &str,
        timeout: Duration,
        ctx: &ToolContext,
    ) -> Result<(String, i32, bool), ToolError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => return Err(ToolError::Timeout(timeout.as_secs())),
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        Ok((text, output.status.code().unwrap_or(-1), false))
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn id(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the task's working directory and return its combined output."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Execute
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to run"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Optional timeout in seconds"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let args: ShellArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        if args.command.trim().is_empty() {
            return Err(ToolError::InvalidArguments("command is empty".into()));
        }
        if ctx.abort.is_aborted() {
            return Err(ToolError::Execution("aborted before start".into()));
        }

        let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(self.default_timeout_secs));
        debug!(command = %args.command, sandboxed = ctx.vm.is_some(), "Running shell command");

        let (mut output, exit_code, timed_out) = if ctx.vm.is_some() {
            self.run_in_vm(&args.command, timeout, ctx).await?
        } else {
            self.run_local(&args.command, timeout, ctx).await?
        };

        if timed_out {
            output.push_str(&format!("\n[command timed out after {}s]", timeout.as_secs()));
        } else if exit_code != 0 {
            output.push_str(&format!("\n[exit code: {}]", exit_code));
        }

        let result = ToolResult::ok(args.command.clone(), output)
            .with_changed(exit_code == 0)
            .with_key(format!("bash:{}", args.command))
            .with_metadata("exit_code", json!(exit_code))
            .with_metadata("timed_out", json!(timed_out));
        Ok(if timed_out {
            ToolResult {
                is_error: true,
                ..result
            }
        } else {
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_command_success() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());
        let result = ShellTool::new()
            .execute(json!({"command": "echo hello"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.output.trim(), "hello");
        assert!(result.changed);
        assert_eq!(result.normalized_key.as_deref(), Some("bash:echo hello"));
    }

    #[tokio::test]
    async fn test_local_command_failure_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());
        let result = ShellTool::new()
            .execute(json!({"command": "echo oops >&2; exit 3"}), &ctx)
            .await
            .unwrap();
        assert!(!result.changed);
        assert!(result.output.contains("oops"));
        assert!(result.output.contains("[exit code: 3]"));
        assert_eq!(result.metadata["exit_code"], json!(3));
    }

    #[tokio::test]
    async fn test_local_command_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let ctx = ToolContext::new(dir.path());
        let result = ShellTool::new()
            .execute(json!({"command": "ls"}), &ctx)
            .await
            .unwrap();
        assert!(result.output.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_local_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());
        let err = ShellTool::new()
            .execute(json!({"command": "sleep 5", "timeout_secs": 0}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(0)));
    }

    #[tokio::test]
    async fn test_missing_command_rejected() {
        let err = ShellTool::new()
            .execute(json!({"cmd": "ls"}), &ToolContext::new("/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
