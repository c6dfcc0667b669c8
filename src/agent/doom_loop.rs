//! Detection of repeated identical tool calls

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use serde_json::Value;

pub const DEFAULT_WINDOW: usize = 10;
pub const DEFAULT_THRESHOLD: usize = 3;

/// Sliding window over recent `(tool, argument hash)` pairs
#[derive(Debug, Clone)]
pub struct DoomLoopDetector {
    window: VecDeque<(String, u64)>,
    window_size: usize,
    threshold: usize,
}

impl Default for DoomLoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_THRESHOLD)
    }
}

impl DoomLoopDetector {
    pub fn new(window_size: usize, threshold: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(threshold).max(1),
            threshold: threshold.max(1),
        }
    }

    /// Record a call; true when the last `threshold` calls are identical
    ///
    /// The window is cleared on detection, so a run of repeats warns once.
    pub fn record(&mut self, tool: &str, args: &Value) -> bool {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back((tool.to_string(), hash_args(args)));

        if self.window.len() < self.threshold {
            return false;
        }
        let last = &self.window[self.window.len() - 1];
        let repeated = self
            .window
            .iter()
            .rev()
            .take(self.threshold)
            .all(|entry| entry == last);
        if repeated {
            self.window.clear();
        }
        repeated
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

/// Hash of the arguments with object keys in sorted order
fn hash_args(args: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_value(args, &mut hasher);
    hasher.finish()
}

fn hash_value(value: &Value, hasher: &mut DefaultHasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Number(n) => {
            2u8.hash(hasher);
            n.to_string().hash(hasher);
        }
        Value::String(s) => {
            3u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Array(items) => {
            4u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, hasher);
            }
        }
        Value::Object(map) => {
            5u8.hash(hasher);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys.len().hash(hasher);
            for key in keys {
                key.hash(hasher);
                hash_value(&map[key], hasher);
            }
        }
    }
}
