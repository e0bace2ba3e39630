//! Task registry: durable records for background agent runs.
//!
//! One [`TaskRecord`] per spawned background task, held in memory and
//! mirrored to a [`TaskStore`] document on every mutation. Status
//! transitions are monotone: once a record reaches a terminal state no code
//! path moves it back to `Running` or to a different terminal state, which
//! is what protects explicit kills and reaper timeouts from being
//! overwritten by late-arriving exit events.

mod store;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

pub use store::{JsonFileStore, MemoryStore, StoreError, TaskStore};

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    #[serde(rename = "timeout")]
    TimedOut,
}

impl TaskStatus {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timeout",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One background agent run.
///
/// `exit_code` is three-valued: absent means the exit was never observed,
/// JSON `null` means the process was terminated by a signal, and an integer
/// is the concrete exit code. `end_time` is set exactly when `exit_code` is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub agent_name: String,
    pub pid: u32,
    /// Unix milliseconds.
    pub start_time: i64,
    pub working_dir: PathBuf,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_pid: Option<u32>,
    /// Absolute deadline, unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(
        default,
        deserialize_with = "deserialize_observed",
        skip_serializing_if = "Option::is_none"
    )]
    pub exit_code: Option<Option<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

impl TaskRecord {
    /// Age of the record in milliseconds at `now`.
    pub const fn age_ms(&self, now: i64) -> i64 {
        now - self.start_time
    }

    pub const fn is_running(&self) -> bool {
        matches!(self.status, TaskStatus::Running)
    }
}

/// Keeps a present-but-null `exit_code` distinct from an absent one.
fn deserialize_observed<'de, D>(deserializer: D) -> Result<Option<Option<i32>>, D::Error>
where
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Returns the current time as unix milliseconds.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// In-memory registry mirrored to a [`TaskStore`].
///
/// All mutation goes through the methods here so the monotone-terminal
/// invariant holds in one place.
pub struct Registry {
    tasks: HashMap<String, TaskRecord>,
    store: Box<dyn TaskStore>,
}

impl Registry {
    /// Load the registry from its store, reconciling stale state:
    /// records past the storage ceiling are purged, and records still
    /// marked running whose process died while we were away are committed
    /// failed.
    pub fn load(store: Box<dyn TaskStore>, storage_ceiling_ms: i64) -> Self {
        let loaded = match store.load() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to load task registry, starting fresh");
                HashMap::new()
            }
        };

        let now = unix_millis();
        let total = loaded.len();
        let mut purged = 0usize;
        let mut reconciled = 0usize;
        let mut tasks = HashMap::new();

        for (id, mut record) in loaded {
            if record.age_ms(now) > storage_ceiling_ms {
                purged += 1;
                continue;
            }
            if record.is_running() && !crate::process::is_alive(record.pid) {
                record.status = TaskStatus::Failed;
                if let Some(watchdog_pid) = record.watchdog_pid.take()
                    && crate::process::is_alive(watchdog_pid)
                {
                    crate::process::send_sigkill(watchdog_pid);
                }
                reconciled += 1;
            }
            tasks.insert(id, record);
        }

        let registry = Self { tasks, store };
        if purged > 0 || reconciled > 0 {
            info!(
                loaded = total,
                purged, reconciled, "Task registry loaded with reconciliation"
            );
            registry.persist();
        } else {
            info!(loaded = total, "Task registry loaded");
        }
        registry
    }

    pub fn insert(&mut self, record: TaskRecord) {
        self.tasks.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<&TaskRecord> {
        self.tasks.values().find(|t| t.pid == pid)
    }

    pub fn running_count(&self) -> usize {
        self.tasks.values().filter(|t| t.is_running()).count()
    }

    pub fn values(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Commit an observed exit. No-op unless the record is still running:
    /// explicit kills and reaper timeouts must not be overwritten by a
    /// late-arriving exit event.
    ///
    /// `exit_code` of `None` means signal-terminated. Returns the committed
    /// status, if any.
    pub fn record_exit(&mut self, id: &str, exit_code: Option<i32>) -> Option<TaskStatus> {
        let record = self.tasks.get_mut(id)?;
        if !record.is_running() {
            return None;
        }

        record.exit_code = Some(exit_code);
        record.end_time = Some(unix_millis());
        record.status = if exit_code == Some(0) {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        Some(record.status)
    }

    /// Move a running record to `TimedOut`. Returns false if the record is
    /// missing or already terminal.
    pub fn mark_timed_out(&mut self, id: &str) -> bool {
        match self.tasks.get_mut(id) {
            Some(record) if record.is_running() => {
                record.status = TaskStatus::TimedOut;
                true
            }
            _ => false,
        }
    }

    /// Move a running record to `Failed` without an observed exit (explicit
    /// kill, dead pid, shutdown). Returns false if missing or terminal.
    pub fn mark_failed(&mut self, id: &str) -> bool {
        match self.tasks.get_mut(id) {
            Some(record) if record.is_running() => {
                record.status = TaskStatus::Failed;
                true
            }
            _ => false,
        }
    }

    /// Forget a watchdog that has been terminated.
    pub fn clear_watchdog(&mut self, id: &str) {
        if let Some(record) = self.tasks.get_mut(id) {
            record.watchdog_pid = None;
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<TaskRecord> {
        self.tasks.remove(id)
    }

    /// Best-effort write-back of the full document. Persistence failures
    /// are logged and swallowed; the in-memory state change stands.
    pub fn persist(&self) {
        if let Err(e) = self.store.save(&self.tasks) {
            warn!(error = %e, "Failed to persist task registry");
        }
    }
}
