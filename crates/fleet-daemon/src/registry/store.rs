//! Durable persistence for the task registry.
//!
//! The registry is persisted as a single JSON document mapping task id to
//! task record, rewritten in full on every mutation. The [`TaskStore`] trait
//! is the seam where a sturdier backend could be substituted without
//! touching the supervisor or reaper contracts.

use std::collections::HashMap;
use std::path::PathBuf;

use super::TaskRecord;

/// Errors from registry persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Storage backend for the task registry document.
pub trait TaskStore: Send + Sync {
    /// Load the full document. A missing document is an empty registry.
    fn load(&self) -> Result<HashMap<String, TaskRecord>, StoreError>;

    /// Replace the full document.
    fn save(&self, tasks: &HashMap<String, TaskRecord>) -> Result<(), StoreError>;
}

/// JSON file store writing the document atomically (tmp file + rename).
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl TaskStore for JsonFileStore {
    fn load(&self) -> Result<HashMap<String, TaskRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, tasks: &HashMap<String, TaskRecord>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(tasks)?;

        // Write-then-rename so a crash mid-write never corrupts the document.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store for tests and embedders that opt out of durability.
#[derive(Default)]
pub struct MemoryStore {
    tasks: std::sync::Mutex<HashMap<String, TaskRecord>>,
}

impl TaskStore for MemoryStore {
    fn load(&self) -> Result<HashMap<String, TaskRecord>, StoreError> {
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    fn save(&self, tasks: &HashMap<String, TaskRecord>) -> Result<(), StoreError> {
        *self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = tasks.clone();
        Ok(())
    }
}
