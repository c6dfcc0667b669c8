//! Task decomposition into a dependency graph of subtasks

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::llm::{LlmError, LlmProvider, Message};

const DECOMPOSITION_PROMPT: &str = r#"You split software tasks into subtasks for parallel agents.

Reply with a single JSON object and nothing else:
{"subtasks": [{"id": "short-id", "description": "what to do", "dependencies": ["ids this needs first"], "expected_output": "what the result looks like", "priority": 1}]}

Rules:
- Keep subtasks independent where possible so they can run in parallel.
- Only list a dependency when a subtask needs another's result.
- Use 1 to 6 subtasks. A simple task is a single subtask."#;

/// One node of the subtask graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskDefinition {
    pub id: Uuid,
    /// Identifier the model used, kept for logs
    pub key: String,
    pub description: String,
    pub dependencies: Vec<Uuid>,
    pub expected_output: Option<String>,
    pub priority: i64,
}

/// Error type for decomposition
#[derive(Debug, Error)]
pub enum DecomposeError {
    #[error("decomposition request failed: {0}")]
    Llm(#[from] LlmError),
    #[error("no JSON object in decomposition response")]
    NoJson,
    #[error("invalid decomposition JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("decomposition produced no valid subtasks")]
    NoSubtasks,
}

/// One `subtasks` entry that has an id and a description
struct RawSubtask<'a> {
    key: String,
    description: String,
    entry: &'a Value,
}

fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric priorities pass through; named ones follow the task priority scale
fn priority_of(key: &str, value: Option<&Value>) -> i64 {
    let parsed = match value {
        None | Some(Value::Null) => return 0,
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(0),
            "normal" | "medium" => Some(1),
            "high" => Some(2),
            "urgent" | "critical" => Some(3),
            other => other.parse().ok(),
        },
        Some(_) => None,
    };
    parsed.unwrap_or_else(|| {
        warn!(id = %key, "Ignoring unreadable subtask priority");
        0
    })
}

/// Asks the LLM for a subtask graph
pub struct TaskDecomposer {
    provider: Arc<dyn LlmProvider>,
}

impl TaskDecomposer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    pub async fn decompose(
        &self,
        task: &str,
        tool_names: &[String],
    ) -> Result<Vec<SubtaskDefinition>, DecomposeError> {
        let messages = vec![
            Message::system(DECOMPOSITION_PROMPT),
            Message::user(format!(
                "Task:\n{}\n\nTools each agent can use: {}",
                task,
                tool_names.join(", ")
            )),
        ];
        let completion = self.provider.complete(&messages, &[]).await?;
        let subtasks = parse_decomposition(&completion.content)?;
        info!(count = subtasks.len(), "Task decomposed");
        Ok(subtasks)
    }
}

/// Parse a decomposition reply, dropping invalid entries and dependencies
pub fn parse_decomposition(text: &str) -> Result<Vec<SubtaskDefinition>, DecomposeError> {
    let json = extract_json_object(text).ok_or(DecomposeError::NoJson)?;
    let plan: Value = serde_json::from_str(json)?;
    let entries: &[Value] = match plan.get("subtasks") {
        Some(Value::Array(entries)) => entries.as_slice(),
        _ => &[],
    };

    let mut keys: HashMap<String, Uuid> = HashMap::new();
    let mut accepted = Vec::new();
    for entry in entries {
        let key = entry.get("id").and_then(key_of).unwrap_or_default();
        let description = entry
            .get("description")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if key.is_empty() || description.is_empty() {
            warn!(id = %key, "Dropping subtask without id or description");
            continue;
        }
        if keys.contains_key(&key) {
            warn!(id = %key, "Dropping duplicate subtask id");
            continue;
        }
        keys.insert(key.clone(), Uuid::now_v7());
        accepted.push(RawSubtask {
            key,
            description: description.to_string(),
            entry,
        });
    }

    let subtasks: Vec<SubtaskDefinition> = accepted
        .into_iter()
        .map(|RawSubtask { key, description, entry }| {
            let id = keys[&key];
            let raw_dependencies: &[Value] = match entry.get("dependencies") {
                Some(Value::Array(deps)) => deps.as_slice(),
                _ => &[],
            };
            let mut seen = HashSet::new();
            let dependencies = raw_dependencies
                .iter()
                .filter_map(|dep| {
                    let dep_key = key_of(dep)?;
                    if dep_key == key {
                        warn!(id = %key, "Dropping self dependency");
                        return None;
                    }
                    match keys.get(&dep_key) {
                        Some(dep_id) => seen.insert(*dep_id).then_some(*dep_id),
                        None => {
                            warn!(id = %key, dependency = %dep_key, "Dropping unknown dependency");
                            None
                        }
                    }
                })
                .collect();
            let expected_output = entry
                .get("expected_output")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            SubtaskDefinition {
                id,
                priority: priority_of(&key, entry.get("priority")),
                key,
                description,
                dependencies,
                expected_output,
            }
        })
        .collect();

    if subtasks.is_empty() {
        return Err(DecomposeError::NoSubtasks);
    }
    debug!(count = subtasks.len(), "Parsed decomposition");
    Ok(subtasks)
}

/// First balanced `{...}` in `text`, ignoring braces inside JSON strings
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_code_fence_and_prose() {
        let reply = r#"Here is the plan:
```json
{"subtasks": [
  {"id": "api", "description": "Write the API {handlers}", "dependencies": []},
  {"id": "tests", "description": "Test the API", "dependencies": ["api"], "expected_output": "passing tests", "priority": 2}
]}
```
Good luck."#;
        let subtasks = parse_decomposition(reply).unwrap();
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].key, "api");
        assert_eq!(subtasks[0].description, "Write the API {handlers}");
        assert_eq!(subtasks[1].dependencies, vec![subtasks[0].id]);
        assert_eq!(subtasks[1].expected_output.as_deref(), Some("passing tests"));
        assert_eq!(subtasks[1].priority, 2);
    }

    #[test]
    fn test_invalid_entries_and_dependencies_dropped() {
        let reply = r#"{"subtasks": [
            {"id": "a", "description": "first", "dependencies": ["a", "ghost", "b", "b"]},
            {"id": "", "description": "no id"},
            {"id": "c", "description": "   "},
            {"id": 2, "description": "numeric id"},
            {"id": "b", "description": "second", "dependencies": [2]}
        ]}"#;
        let subtasks = parse_decomposition(reply).unwrap();
        let keys: Vec<&str> = subtasks.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "2", "b"]);
        assert_eq!(subtasks[0].dependencies, vec![subtasks[2].id]);
        assert_eq!(subtasks[2].dependencies, vec![subtasks[1].id]);
    }

    #[test]
    fn test_odd_field_types_do_not_sink_the_plan() {
        let reply = r#"{"subtasks": [
            {"id": "a", "description": "first", "priority": 1},
            {"id": "b", "description": "second", "priority": "high", "dependencies": null},
            {"id": "c", "description": "third", "priority": {"level": 9}, "dependencies": "a"},
            {"id": "d", "description": "fourth", "priority": "Urgent", "dependencies": ["a", null]},
            {"id": "e", "description": "fifth", "expected_output": 42, "priority": 2.6},
            "not an object"
        ]}"#;
        let subtasks = parse_decomposition(reply).unwrap();
        let keys: Vec<&str> = subtasks.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);
        let priorities: Vec<i64> = subtasks.iter().map(|s| s.priority).collect();
        assert_eq!(priorities, vec![1, 2, 0, 3, 3]);
        assert!(subtasks[1].dependencies.is_empty());
        assert!(subtasks[2].dependencies.is_empty());
        assert_eq!(subtasks[3].dependencies, vec![subtasks[0].id]);
        assert!(subtasks[4].expected_output.is_none());
    }

    #[test]
    fn test_non_array_subtasks_has_no_subtasks() {
        assert!(matches!(
            parse_decomposition(r#"{"subtasks": null}"#),
            Err(DecomposeError::NoSubtasks)
        ));
    }

    #[test]
    fn test_no_valid_subtasks() {
        assert!(matches!(
            parse_decomposition(r#"{"subtasks": [{"id": "x"}]}"#),
            Err(DecomposeError::NoSubtasks)
        ));
        assert!(matches!(
            parse_decomposition("I cannot do that"),
            Err(DecomposeError::NoJson)
        ));
        assert!(matches!(
            parse_decomposition("{\"subtasks\": [}"),
            Err(DecomposeError::NoJson) | Err(DecomposeError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_decompose_uses_provider() {
        use crate::llm::Completion;
        use crate::test_support::ScriptedProvider;

        let provider = Arc::new(ScriptedProvider::new(vec![Completion::text(
            r#"{"subtasks": [{"id": "only", "description": "do it"}]}"#,
        )]));
        let decomposer = TaskDecomposer::new(provider.clone());
        let subtasks = decomposer
            .decompose("build it", &["bash".to_string()])
            .await
            .unwrap();
        assert_eq!(subtasks.len(), 1);
        let prompt = &provider.calls()[0][1].content;
        assert!(prompt.contains("build it"));
        assert!(prompt.contains("bash"));
    }
}
