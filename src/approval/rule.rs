//! Persistent approval rules and pattern matching

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::ApprovalRequest;
use crate::tools::ToolCategory;

/// Argument keys that name the file a tool acts on
const PATH_KEYS: [&str; 3] = ["path", "file_path", "filePath"];

/// "Always allow" rule created by approve-with-remember or by hand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: Uuid,
    pub tool_id: String,
    /// `None` allows every call of the tool
    pub pattern: Option<String>,
    pub category: ToolCategory,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRule {
    pub fn new(tool_id: impl Into<String>, pattern: Option<String>, category: ToolCategory) -> Self {
        Self {
            id: Uuid::now_v7(),
            tool_id: tool_id.into(),
            pattern,
            category,
            created_at: Utc::now(),
        }
    }

    /// Build the rule remembered when a human approves `request` with "always"
    pub fn remembered(request: &ApprovalRequest) -> Self {
        Self::new(
            request.tool_id.clone(),
            derive_pattern(request.category, &request.args, &request.working_directory),
            request.category,
        )
    }

    /// True iff the tool ids are equal and the pattern is absent or matches
    pub fn matches(&self, request: &ApprovalRequest) -> bool {
        if self.tool_id != request.tool_id {
            return false;
        }
        let Some(pattern) = &self.pattern else {
            return true;
        };
        let Some(subject) = request_subject(&request.args, &request.working_directory) else {
            return false;
        };
        if self.category == ToolCategory::Execute {
            command_prefix_matches(pattern, &subject)
        } else {
            glob_matches(pattern, &subject)
        }
    }
}

/// The string a rule pattern is tested against: an absolute target path, or
/// the command line
pub fn request_subject(args: &Value, working_directory: &Path) -> Option<String> {
    if let Some(path) = target_path(args, working_directory) {
        return Some(path.to_string_lossy().into_owned());
    }
    args.get("command")
        .and_then(Value::as_str)
        .map(|c| c.trim().to_string())
}

/// Pattern stored when a request is approved with remember
///
/// Read/write tools get a glob over the files directly in the parent
/// directory (escaped, so the directory name matches only itself), execute
/// tools the first command token, everything else a tool-wide rule.
pub fn derive_pattern(category: ToolCategory, args: &Value, working_directory: &Path) -> Option<String> {
    match category {
        ToolCategory::Read | ToolCategory::Write => {
            let path = target_path(args, working_directory)?;
            let parent = path.parent().unwrap_or(Path::new("/"));
            let parent = glob::Pattern::escape(&parent.to_string_lossy());
            Some(format!("{}/*", parent.trim_end_matches('/')))
        }
        ToolCategory::Execute => args
            .get("command")
            .and_then(Value::as_str)
            .and_then(|c| c.split_whitespace().next())
            .map(str::to_string),
        ToolCategory::Network | ToolCategory::Other => None,
    }
}

fn target_path(args: &Value, working_directory: &Path) -> Option<PathBuf> {
    let raw = PATH_KEYS
        .iter()
        .find_map(|key| args.get(*key).and_then(Value::as_str))?;
    Some(absolutize(Path::new(raw), working_directory))
}

/// Join against the working directory and fold `.`/`..` lexically
fn absolutize(path: &Path, working_directory: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_directory.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Command equals the pattern, or starts with it followed by whitespace
fn command_prefix_matches(pattern: &str, command: &str) -> bool {
    let pattern = pattern.trim();
    match command.strip_prefix(pattern) {
        Some("") => true,
        Some(rest) => rest.starts_with(char::is_whitespace),
        None => false,
    }
}

/// `*` and `?` stop at `/`, so a directory rule does not reach subdirectories
fn glob_matches(pattern: &str, subject: &str) -> bool {
    let options = glob::MatchOptions {
        require_literal_separator: true,
        ..glob::MatchOptions::new()
    };
    match glob::Pattern::new(pattern) {
        Ok(glob) => glob.matches_with(subject, options),
        Err(_) => subject.starts_with(pattern.trim_end_matches('*')),
    }
}
