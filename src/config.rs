//! Application configuration loaded from `~/.agentvisor/config.toml`
//!
//! Every section is optional; missing fields fall back to the defaults of the
//! component that owns them.
//!
//! ```toml
//! [llm]
//! base_url = "http://localhost:11434"
//! model = "qwen3"
//!
//! [queue]
//! max_concurrent = 4
//!
//! [vm]
//! enabled = true
//! kernel_path = "/var/lib/agentvisor/vmlinuz"
//! shared_folders = ["/home/me/project"]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentConfig;
use crate::approval::ApprovalConfig;
use crate::llm::LlmConfig;
use crate::planner::SchedulerConfig;
use crate::queue::QueueConfig;
use crate::vm::VmConfig;

/// Error type for configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Directory for persisted queue, history and approval rules
    pub data_dir: PathBuf,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub approval: ApprovalConfig,
    pub vm: VmConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: home_dir().join(".agentvisor"),
            llm: LlmConfig::default(),
            agent: AgentConfig::default(),
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            approval: ApprovalConfig::default(),
            vm: VmConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reject values that would stall or disable a component
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_turns == 0 {
            return Err(ConfigError::Invalid("agent.max_turns must be > 0".into()));
        }
        if self.agent.max_tool_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_tool_output_bytes must be > 0".into(),
            ));
        }
        if self.scheduler.max_parallel == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_parallel must be > 0".into(),
            ));
        }
        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::Invalid("queue.max_concurrent must be > 0".into()));
        }
        if self.approval.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "approval.request_timeout_secs must be > 0".into(),
            ));
        }
        if self.vm.enabled {
            if self.vm.command_timeout_secs == 0 || self.vm.startup_timeout_secs == 0 {
                return Err(ConfigError::Invalid("vm timeouts must be > 0".into()));
            }
            if self.vm.idle_poll_secs == 0 {
                return Err(ConfigError::Invalid("vm.idle_poll_secs must be > 0".into()));
            }
        }
        Ok(())
    }
}

/// Default config location (`~/.agentvisor/config.toml`)
pub fn default_config_path() -> PathBuf {
    home_dir().join(".agentvisor").join("config.toml")
}

/// Load and validate config; a missing file yields the defaults
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let config = match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str::<AppConfig>(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    config.validate()?;
    Ok(config)
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.agent.max_turns, 50);
        assert_eq!(config.queue.max_concurrent, 10);
        assert_eq!(config.scheduler.max_parallel, 3);
        assert_eq!(config.approval.request_timeout_secs, 300);
        assert_eq!(config.vm.idle_timeout_secs, 300);
    }

    #[test]
    fn test_partial_file_overrides_only_given_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/tmp/agentvisor-test"

[queue]
max_concurrent = 2

[vm]
enabled = true
shared_folders = ["/work"]
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/agentvisor-test"));
        assert_eq!(config.queue.max_concurrent, 2);
        assert_eq!(config.queue.history_limit, 100);
        assert!(config.vm.enabled);
        assert_eq!(config.vm.shared_folders, vec![PathBuf::from("/work")]);
        assert_eq!(config.llm.model, "qwen3");
    }

    #[test]
    fn test_zero_limits_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[queue]\nmax_concurrent = 0\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[queue\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse { .. })));
    }
}
