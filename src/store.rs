//! Persistence collaborator for queue snapshots, task history and approval rules
//!
//! The engine only needs last-write-wins `save`/`load` of whole collections.
//! `JsonFileStore` keeps one pretty-printed JSON file per collection under the
//! data directory; `MemoryStore` is used by tests and when persistence is off.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store data at {path} is invalid: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Whole-collection persistence with no transactional guarantee
pub trait Store<T>: Send + Sync {
    /// Load the last saved collection, `None` if nothing was saved yet
    fn load(&self) -> Result<Option<T>, StoreError>;

    /// Replace the saved collection
    fn save(&self, value: &T) -> Result<(), StoreError>;
}

/// JSON file backed store
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    /// Create a store writing to `path`; parent directories are created on save
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Create a store for `name.json` inside `dir`
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self::new(dir.join(format!("{}.json", name)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> Store<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<T>, StoreError> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|source| StoreError::Format {
                path: self.path.clone(),
                source,
            })
    }

    fn save(&self, value: &T) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(value).map_err(|source| StoreError::Format {
            path: self.path.clone(),
            source,
        })?;
        // Write-then-rename so a crash never leaves a half-written file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

/// In-memory store
pub struct MemoryStore<T> {
    value: Mutex<Option<T>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Store<T> for MemoryStore<T>
where
    T: Clone + Send,
{
    fn load(&self) -> Result<Option<T>, StoreError> {
        Ok(self
            .value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn save(&self, value: &T) -> Result<(), StoreError> {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_store_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonFileStore<Vec<String>> = JsonFileStore::in_dir(dir.path(), "rules");
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_json_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("history.json"));
        store.save(&vec!["a".to_string(), "b".to_string()]).unwrap();
        let loaded: Vec<String> = store.load().unwrap().unwrap();
        assert_eq!(loaded, vec!["a", "b"]);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_json_store_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{not json").unwrap();
        let store: JsonFileStore<Vec<String>> = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Format { .. })));
    }

    #[test]
    fn test_memory_store_last_write_wins() {
        let store = MemoryStore::new();
        store.save(&1u32).unwrap();
        store.save(&2u32).unwrap();
        assert_eq!(store.load().unwrap(), Some(2));
    }
}
