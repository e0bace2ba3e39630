//! Agent fleet orchestrator.
//!
//! [`Orchestrator`] is the high-level coordinator that:
//! - admits spawn requests against the concurrency cap
//! - runs foreground agents to completion with streamed progress
//! - detaches background agents with a log file, watchdog, and task record
//! - answers the management operations (list / status / kill / log tail)
//! - tears everything down on shutdown
//!
//! All state lives on this object, not in globals, so tests instantiate
//! independent orchestrators in isolation.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use fleet_core::Config;
use fleet_core::config::default_tasks_file;

use crate::admission::{AdmissionController, AdmissionPermit, AdmissionRejected};
use crate::logs::{self, LogTail};
use crate::process::{escalate, is_alive, send_sigkill, send_sigterm};
use crate::registry::{
    JsonFileStore, Registry, TaskRecord, TaskStatus, TaskStore, unix_millis,
};
use crate::supervisor::{
    AgentInvocation, ForegroundParams, ProgressUpdate, RunError, RunReport, SpawnError, watchdog,
    generate_task_id, run_foreground, sanitize_agent_name, spawn_detached,
};

/// Errors from orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    AdmissionRejected(#[from] AdmissionRejected),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Failed to spawn agent: {reason}")]
    SpawnFailed { reason: String },

    #[error("Agent timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Agent process failed: {message}")]
    ProcessFailed { message: String },

    #[error("Task not found: {query}")]
    NotFound { query: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RunError> for OrchestratorError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::Spawn { reason } => Self::SpawnFailed { reason },
            RunError::TimedOut { timeout_ms } => Self::Timeout { timeout_ms },
            RunError::Process { message } => Self::ProcessFailed { message },
        }
    }
}

impl From<SpawnError> for OrchestratorError {
    fn from(e: SpawnError) -> Self {
        Self::SpawnFailed {
            reason: e.to_string(),
        }
    }
}

/// Lookup key for status and kill operations.
#[derive(Debug, Clone)]
pub enum TaskQuery {
    Id(String),
    Pid(u32),
}

impl std::fmt::Display for TaskQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Pid(pid) => write!(f, "pid {pid}"),
        }
    }
}

/// One spawn request, foreground or background.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Caller-supplied agent name; sanitized before use.
    pub agent_name: String,
    pub invocation: AgentInvocation,
    /// Must be absolute and free of `..` segments.
    pub working_dir: PathBuf,
    /// Falls back to the configured foreground/background default.
    pub timeout: Option<Duration>,
    pub background: bool,
}

/// Reply to a spawn request.
#[derive(Debug)]
pub enum SpawnOutcome {
    Foreground(RunReport),
    Background(BackgroundStarted),
}

/// Immediate reply for a detached spawn.
#[derive(Debug, Clone)]
pub struct BackgroundStarted {
    pub task_id: String,
    pub pid: u32,
    pub log_file: PathBuf,
    /// Absolute deadline, unix milliseconds.
    pub timeout_at: i64,
}

/// Caller-facing snapshot of one task.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub id: String,
    pub agent_name: String,
    pub pid: u32,
    pub status: TaskStatus,
    pub working_dir: PathBuf,
    pub start_time: i64,
    /// Runtime so far, or the final runtime for finished tasks (seconds).
    pub runtime_secs: i64,
    pub finished: bool,
    /// Absent = exit never observed; `Some(None)` = killed by signal.
    pub exit_code: Option<Option<i32>>,
    /// Seconds until the deadline; negative when overdue. Running only.
    pub timeout_remaining_secs: Option<i64>,
    pub log_file: Option<PathBuf>,
}

impl TaskView {
    fn from_record(record: &TaskRecord, now: i64) -> Self {
        let runtime_ms = record.end_time.unwrap_or(now) - record.start_time;
        let timeout_remaining_secs = if record.is_running() {
            record.timeout_at.map(|deadline| (deadline - now) / 1000)
        } else {
            None
        };
        Self {
            id: record.id.clone(),
            agent_name: record.agent_name.clone(),
            pid: record.pid,
            status: record.status,
            working_dir: record.working_dir.clone(),
            start_time: record.start_time,
            runtime_secs: runtime_ms / 1000,
            finished: record.end_time.is_some(),
            exit_code: record.exit_code,
            timeout_remaining_secs,
            log_file: record.log_file.clone(),
        }
    }
}

/// Status-sorted, age-filtered listing.
#[derive(Debug)]
pub struct TaskListing {
    pub tasks: Vec<TaskView>,
    /// Terminal tasks past the display ceiling, excluded but counted.
    pub hidden: usize,
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) admission: AdmissionController,
    pub(crate) registry: Mutex<Registry>,
    /// In-flight foreground pids, for shutdown teardown.
    pub(crate) foreground: Arc<Mutex<HashMap<String, u32>>>,
    pub(crate) log_dir: PathBuf,
    pub(crate) diagnostic_log: PathBuf,
    pub(crate) instance_id: String,
}

/// Handle to the orchestration core. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator persisting to the configured registry path.
    pub fn new(config: Config) -> Self {
        let tasks_file = config
            .daemon
            .tasks_file
            .clone()
            .or_else(default_tasks_file)
            .unwrap_or_else(|| PathBuf::from("fleet-tasks.json"));
        Self::with_store(config, Box::new(JsonFileStore::new(tasks_file)))
    }

    /// Create an orchestrator over an explicit store (tests, embedders).
    pub fn with_store(config: Config, store: Box<dyn TaskStore>) -> Self {
        let registry = Registry::load(store, secs_to_ms(config.limits.storage_ceiling_secs));
        let log_dir = config
            .daemon
            .log_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let diagnostic_log = log_dir.join("fleet-watchdog.log");
        let instance_id = uuid::Uuid::new_v4().simple().to_string();

        info!(
            instance_id = %instance_id,
            cap = config.limits.max_agents,
            tasks = registry.len(),
            "Orchestrator created"
        );

        Self {
            inner: Arc::new(Inner {
                admission: AdmissionController::new(config.limits.max_agents),
                config,
                registry: Mutex::new(registry),
                foreground: Arc::new(Mutex::new(HashMap::new())),
                log_dir,
                diagnostic_log,
                instance_id,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Spawn an agent.
    ///
    /// Foreground requests block until the agent completes, emitting
    /// progress over `progress` along the way. Background requests return
    /// immediately with the task id. Admission and working-directory
    /// validation happen before any process is created.
    pub async fn spawn(
        &self,
        request: SpawnRequest,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> Result<SpawnOutcome, OrchestratorError> {
        validate_working_dir(&request.working_dir)?;
        let agent_name = sanitize_agent_name(&request.agent_name);

        let running = self.inner.registry.lock().await.running_count();
        let permit = self.inner.admission.try_admit(running)?;
        debug!(
            agent_name = %agent_name,
            running,
            pending = self.inner.admission.pending(),
            cap = self.inner.admission.cap(),
            background = request.background,
            "Spawn admitted"
        );

        if request.background {
            self.spawn_background(request, agent_name, permit)
                .await
                .map(SpawnOutcome::Background)
        } else {
            self.spawn_foreground(request, agent_name, permit, progress)
                .await
                .map(SpawnOutcome::Foreground)
        }
    }

    async fn spawn_foreground(
        &self,
        request: SpawnRequest,
        agent_name: String,
        permit: AdmissionPermit,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> Result<RunReport, OrchestratorError> {
        // Foreground runs never enter the registry; the permit is what
        // counts them against the cap, held for the whole run.
        let _permit = permit;

        let limits = &self.inner.config.limits;
        let timeout = request
            .timeout
            .unwrap_or(Duration::from_secs(limits.foreground_timeout_secs));
        let run_id = generate_task_id(&agent_name, unix_millis());

        info!(agent_name = %agent_name, run_id = %run_id, "Starting foreground agent");

        let report = run_foreground(ForegroundParams {
            agent_bin: &self.inner.config.daemon.agent_bin,
            invocation: &request.invocation,
            working_dir: &request.working_dir,
            timeout,
            term_grace: Duration::from_secs(limits.term_grace_secs),
            progress,
            active: Arc::clone(&self.inner.foreground),
            run_id,
        })
        .await?;
        Ok(report)
    }

    async fn spawn_background(
        &self,
        request: SpawnRequest,
        agent_name: String,
        permit: AdmissionPermit,
    ) -> Result<BackgroundStarted, OrchestratorError> {
        let limits = &self.inner.config.limits;
        let timeout = request
            .timeout
            .unwrap_or(Duration::from_secs(limits.background_timeout_secs));

        let start_time = unix_millis();
        let task_id = generate_task_id(&agent_name, start_time);
        let log_file = self.inner.log_dir.join(format!("fleet-agent-{task_id}.log"));

        let handle = spawn_detached(
            &self.inner.config.daemon.agent_bin,
            &request.invocation,
            &request.working_dir,
            &log_file,
            Duration::from_millis(limits.spawn_probe_ms),
        )
        .await?;

        let timeout_at = start_time + millis_i64(timeout);
        let watchdog_pid = watchdog::spawn(&watchdog::WatchdogSpec {
            target_pid: handle.pid,
            timeout_secs: timeout.as_secs(),
            term_grace_secs: limits.term_grace_secs,
            heartbeat_interval_secs: limits.heartbeat_interval_secs,
            heartbeat_count: limits.heartbeat_count,
            task_id: &task_id,
            task_log: &log_file,
            diagnostic_log: &self.inner.diagnostic_log,
        });

        let record = TaskRecord {
            id: task_id.clone(),
            agent_name: agent_name.clone(),
            pid: handle.pid,
            start_time,
            working_dir: request.working_dir.clone(),
            status: TaskStatus::Running,
            watchdog_pid,
            timeout_at: Some(timeout_at),
            log_file: Some(log_file.clone()),
            exit_code: None,
            end_time: None,
        };

        {
            let mut registry = self.inner.registry.lock().await;
            registry.insert(record);
            registry.persist();
        }

        // The record now covers this task in the running count; the permit
        // can go.
        drop(permit);

        self.monitor_exit(task_id.clone(), handle.child);

        info!(
            task_id = %task_id,
            agent_name = %agent_name,
            pid = handle.pid,
            watchdog_pid = ?watchdog_pid,
            log_file = %log_file.display(),
            "Background agent started"
        );

        Ok(BackgroundStarted {
            task_id,
            pid: handle.pid,
            log_file,
            timeout_at,
        })
    }

    /// Install the exit listener for a background child.
    fn monitor_exit(&self, task_id: String, mut child: tokio::process::Child) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let status = child.wait().await;
            let exit_code = match &status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Failed to await agent exit");
                    None
                }
            };

            let mut registry = inner.registry.lock().await;
            let committed = registry.record_exit(&task_id, exit_code);

            // Whatever the outcome, a surviving watchdog is now moot.
            if let Some(record) = registry.get(&task_id)
                && let Some(watchdog_pid) = record.watchdog_pid
            {
                if is_alive(watchdog_pid) {
                    watchdog::stand_down(watchdog_pid);
                }
                registry.clear_watchdog(&task_id);
            }
            registry.persist();

            match committed {
                Some(status) => {
                    info!(task_id = %task_id, status = %status, exit_code = ?exit_code, "Background agent exited");
                }
                None => {
                    debug!(task_id = %task_id, exit_code = ?exit_code, "Exit event after terminal status, ignored");
                }
            }
        });
    }

    /// List tasks: running first, then newest first. Terminal tasks older
    /// than the display ceiling are excluded from the listing but counted.
    pub async fn list(&self) -> TaskListing {
        let now = unix_millis();
        let display_ceiling_ms = secs_to_ms(self.inner.config.limits.display_ceiling_secs);

        let registry = self.inner.registry.lock().await;
        let mut hidden = 0usize;
        let mut tasks = Vec::new();
        for record in registry.values() {
            if !record.is_running() && record.age_ms(now) > display_ceiling_ms {
                hidden += 1;
                continue;
            }
            tasks.push(TaskView::from_record(record, now));
        }
        drop(registry);

        tasks.sort_by(|a, b| {
            let a_running = a.status == TaskStatus::Running;
            let b_running = b.status == TaskStatus::Running;
            b_running
                .cmp(&a_running)
                .then(b.start_time.cmp(&a.start_time))
        });

        TaskListing { tasks, hidden }
    }

    /// Status of one task, by id or pid.
    pub async fn status(&self, query: &TaskQuery) -> Result<TaskView, OrchestratorError> {
        let registry = self.inner.registry.lock().await;
        let record = match query {
            TaskQuery::Id(id) => registry.get(id),
            TaskQuery::Pid(pid) => registry.find_by_pid(*pid),
        }
        .ok_or_else(|| OrchestratorError::NotFound {
            query: query.to_string(),
        })?;
        Ok(TaskView::from_record(record, unix_millis()))
    }

    /// Kill a task, by id or pid.
    ///
    /// Already-terminal tasks are a no-op: the unchanged view comes back
    /// and no error is raised. Running tasks get the two-stage escalation,
    /// their watchdog is force-killed, and the record commits `Failed`.
    pub async fn kill(&self, query: &TaskQuery) -> Result<TaskView, OrchestratorError> {
        let kill_grace = Duration::from_secs(self.inner.config.limits.kill_grace_secs);

        let mut registry = self.inner.registry.lock().await;
        let record = match query {
            TaskQuery::Id(id) => registry.get(id),
            TaskQuery::Pid(pid) => registry.find_by_pid(*pid),
        }
        .ok_or_else(|| OrchestratorError::NotFound {
            query: query.to_string(),
        })?;

        if !record.is_running() {
            return Ok(TaskView::from_record(record, unix_millis()));
        }

        let id = record.id.clone();
        let pid = record.pid;
        let watchdog_pid = record.watchdog_pid;

        info!(task_id = %id, pid, "Killing task");
        if is_alive(pid) {
            escalate(pid, kill_grace);
        }
        if let Some(watchdog_pid) = watchdog_pid
            && is_alive(watchdog_pid)
        {
            watchdog::stand_down(watchdog_pid);
        }

        registry.mark_failed(&id);
        registry.clear_watchdog(&id);
        registry.persist();

        let record = registry.get(&id).ok_or_else(|| OrchestratorError::NotFound {
            query: query.to_string(),
        })?;
        Ok(TaskView::from_record(record, unix_millis()))
    }

    /// Tail a task's log file.
    pub async fn log_tail(
        &self,
        task_id: &str,
        max_lines: usize,
    ) -> Result<LogTail, OrchestratorError> {
        let log_file = {
            let registry = self.inner.registry.lock().await;
            let record = registry
                .get(task_id)
                .ok_or_else(|| OrchestratorError::NotFound {
                    query: task_id.to_string(),
                })?;
            record
                .log_file
                .clone()
                .ok_or_else(|| OrchestratorError::NotFound {
                    query: format!("log file for task {task_id}"),
                })?
        };

        Ok(logs::tail(&log_file, max_lines, &self.inner.config.tail).await?)
    }

    /// Shut the fleet down: every running record commits `Failed`, owned
    /// children and watchdogs get best-effort termination, and anything
    /// still alive after a bounded grace period is force-killed.
    pub async fn shutdown(&self) {
        info!(instance_id = %self.inner.instance_id, "Orchestrator shutting down");

        let mut pids = Vec::new();
        {
            let mut registry = self.inner.registry.lock().await;
            let running: Vec<(String, u32, Option<u32>)> = registry
                .values()
                .filter(|t| t.is_running())
                .map(|t| (t.id.clone(), t.pid, t.watchdog_pid))
                .collect();

            for (id, pid, watchdog_pid) in running {
                if is_alive(pid) {
                    send_sigterm(pid);
                    pids.push(pid);
                }
                if let Some(watchdog_pid) = watchdog_pid
                    && is_alive(watchdog_pid)
                {
                    watchdog::stand_down(watchdog_pid);
                }
                registry.mark_failed(&id);
                registry.clear_watchdog(&id);
            }
            registry.persist();
        }

        for pid in self.inner.foreground.lock().await.values().copied() {
            if is_alive(pid) {
                send_sigterm(pid);
                pids.push(pid);
            }
        }

        if pids.is_empty() {
            return;
        }

        tokio::time::sleep(Duration::from_secs(
            self.inner.config.limits.term_grace_secs,
        ))
        .await;
        for pid in pids {
            if is_alive(pid) {
                warn!(pid, "Child survived shutdown grace period, killing");
                send_sigkill(pid);
            }
        }
    }
}

/// Reject working directories that are relative or climb upward, before
/// any admission check or process creation.
fn validate_working_dir(dir: &Path) -> Result<(), OrchestratorError> {
    if !dir.is_absolute() {
        return Err(OrchestratorError::InvalidInput {
            message: format!("working directory must be absolute: {}", dir.display()),
        });
    }
    if dir.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(OrchestratorError::InvalidInput {
            message: format!(
                "working directory must not contain '..': {}",
                dir.display()
            ),
        });
    }
    Ok(())
}

pub(crate) fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

fn millis_i64(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::MemoryStore;

    /// Write `script` as an executable stand-in for the agent binary.
    pub(crate) fn fake_agent(dir: &Path, script: &str) -> PathBuf {
        let bin = dir.join("fake-agent");
        std::fs::write(&bin, format!("#!/bin/sh\n{script}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        bin
    }

    pub(crate) fn test_config(dir: &Path, agent_bin: PathBuf) -> Config {
        let mut config = Config::default();
        config.daemon.agent_bin = agent_bin;
        config.daemon.log_dir = Some(dir.to_path_buf());
        config.limits.spawn_probe_ms = 100;
        config.limits.term_grace_secs = 1;
        config.limits.kill_grace_secs = 1;
        config
    }

    pub(crate) fn orchestrator(config: Config) -> Orchestrator {
        Orchestrator::with_store(config, Box::new(MemoryStore::default()))
    }

    pub(crate) fn request(working_dir: &Path, background: bool) -> SpawnRequest {
        SpawnRequest {
            agent_name: "tester".to_string(),
            invocation: AgentInvocation {
                prompt: "ignored".to_string(),
                ..Default::default()
            },
            working_dir: working_dir.to_path_buf(),
            timeout: None,
            background,
        }
    }

    /// Insert a synthetic running record, returning its id.
    pub(crate) async fn insert_running(orch: &Orchestrator, id: &str, pid: u32) {
        let record = TaskRecord {
            id: id.to_string(),
            agent_name: "synthetic".to_string(),
            pid,
            start_time: unix_millis(),
            working_dir: PathBuf::from("/tmp"),
            status: TaskStatus::Running,
            watchdog_pid: None,
            timeout_at: None,
            log_file: None,
            exit_code: None,
            end_time: None,
        };
        orch.inner.registry.lock().await.insert(record);
    }

    async fn wait_for_status(
        orch: &Orchestrator,
        id: &str,
        expected: TaskStatus,
    ) -> TaskView {
        for _ in 0..100 {
            let view = orch.status(&TaskQuery::Id(id.to_string())).await.unwrap();
            if view.status == expected {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task {id} never reached {expected}");
    }

    #[test]
    fn relative_working_dir_rejected() {
        let err = validate_working_dir(Path::new("../x")).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput { .. }));
    }

    #[test]
    fn parent_traversal_rejected_even_when_absolute() {
        let err = validate_working_dir(Path::new("/tmp/../etc")).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput { .. }));
        assert!(validate_working_dir(Path::new("/tmp/work")).is_ok());
    }

    #[tokio::test]
    async fn unsafe_working_dir_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "exit 0");
        let orch = orchestrator(test_config(dir.path(), bin));

        let err = orch
            .spawn(request(Path::new("../x"), true), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput { .. }));
        assert!(orch.inner.registry.lock().await.is_empty());
        assert_eq!(orch.inner.admission.pending(), 0);
    }

    #[tokio::test]
    async fn fifth_spawn_rejected_at_cap_of_four() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "exit 0");
        let orch = orchestrator(test_config(dir.path(), bin));

        // Four tasks already running (our own live pid keeps them running).
        let self_pid = std::process::id();
        for i in 0..4 {
            insert_running(&orch, &format!("t-{i}"), self_pid).await;
        }

        let err = orch
            .spawn(request(dir.path(), true), None)
            .await
            .unwrap_err();
        match err {
            OrchestratorError::AdmissionRejected(r) => {
                assert_eq!(r.current, 4);
                assert_eq!(r.cap, 4);
            }
            other => panic!("expected AdmissionRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn background_exit_zero_observed_as_completed() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "echo working; sleep 0.3; exit 0");
        let orch = orchestrator(test_config(dir.path(), bin));

        let outcome = orch.spawn(request(dir.path(), true), None).await.unwrap();
        let SpawnOutcome::Background(started) = outcome else {
            panic!("expected background outcome");
        };
        assert!(started.task_id.starts_with("tester-"));

        let view = wait_for_status(&orch, &started.task_id, TaskStatus::Completed).await;
        assert_eq!(view.exit_code, Some(Some(0)));
        assert!(view.finished);
        // The admission slot drained back once the record took over.
        assert_eq!(orch.inner.admission.pending(), 0);
    }

    #[tokio::test]
    async fn background_nonzero_exit_observed_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "sleep 0.3; exit 9");
        let orch = orchestrator(test_config(dir.path(), bin));

        let outcome = orch.spawn(request(dir.path(), true), None).await.unwrap();
        let SpawnOutcome::Background(started) = outcome else {
            panic!("expected background outcome");
        };

        let view = wait_for_status(&orch, &started.task_id, TaskStatus::Failed).await;
        assert_eq!(view.exit_code, Some(Some(9)));
    }

    #[tokio::test]
    async fn killed_task_stays_failed_despite_later_exit_event() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "sleep 30; exit 0");
        let orch = orchestrator(test_config(dir.path(), bin));

        let outcome = orch.spawn(request(dir.path(), true), None).await.unwrap();
        let SpawnOutcome::Background(started) = outcome else {
            panic!("expected background outcome");
        };

        let view = orch
            .kill(&TaskQuery::Id(started.task_id.clone()))
            .await
            .unwrap();
        assert_eq!(view.status, TaskStatus::Failed);

        // The exit monitor fires after the kill; the record must not flip.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let view = orch
            .status(&TaskQuery::Id(started.task_id.clone()))
            .await
            .unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.exit_code, None);
    }

    #[tokio::test]
    async fn killing_terminal_task_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "exit 0");
        let orch = orchestrator(test_config(dir.path(), bin));

        insert_running(&orch, "t-1", 0).await;
        orch.inner.registry.lock().await.mark_failed("t-1");

        let view = orch.kill(&TaskQuery::Id("t-1".to_string())).await.unwrap();
        assert_eq!(view.status, TaskStatus::Failed);

        // A second kill is equally fine.
        let view = orch.kill(&TaskQuery::Id("t-1".to_string())).await.unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn kill_by_pid_resolves_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "sleep 30");
        let orch = orchestrator(test_config(dir.path(), bin));

        let outcome = orch.spawn(request(dir.path(), true), None).await.unwrap();
        let SpawnOutcome::Background(started) = outcome else {
            panic!("expected background outcome");
        };

        let view = orch.kill(&TaskQuery::Pid(started.pid)).await.unwrap();
        assert_eq!(view.id, started.task_id);
        assert_eq!(view.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "exit 0");
        let orch = orchestrator(test_config(dir.path(), bin));

        let err = orch
            .status(&TaskQuery::Id("missing".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
        let err = orch.kill(&TaskQuery::Pid(999_999)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
        let err = orch.log_tail("missing", 10).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
    }

    #[tokio::test]
    async fn listing_sorts_running_first_and_hides_old_terminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "exit 0");
        let orch = orchestrator(test_config(dir.path(), bin));

        let self_pid = std::process::id();
        insert_running(&orch, "young-running", self_pid).await;
        {
            let mut registry = orch.inner.registry.lock().await;

            let mut done = TaskRecord {
                id: "young-done".to_string(),
                agent_name: "synthetic".to_string(),
                pid: 0,
                start_time: unix_millis() - 60_000,
                working_dir: PathBuf::from("/tmp"),
                status: TaskStatus::Completed,
                watchdog_pid: None,
                timeout_at: None,
                log_file: None,
                exit_code: Some(Some(0)),
                end_time: Some(unix_millis() - 30_000),
            };
            registry.insert(done.clone());

            // Older than the display ceiling (2h) but younger than storage.
            done.id = "old-done".to_string();
            done.start_time = unix_millis() - 3 * 60 * 60 * 1000;
            registry.insert(done);
        }

        let listing = orch.list().await;
        assert_eq!(listing.hidden, 1);
        assert_eq!(listing.tasks.len(), 2);
        assert_eq!(listing.tasks[0].id, "young-running");
        assert_eq!(listing.tasks[1].id, "young-done");
        // Hidden records are still present in the registry.
        assert_eq!(orch.inner.registry.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn log_tail_reads_the_task_log() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "echo first; echo second; sleep 0.3");
        let orch = orchestrator(test_config(dir.path(), bin));

        let outcome = orch.spawn(request(dir.path(), true), None).await.unwrap();
        let SpawnOutcome::Background(started) = outcome else {
            panic!("expected background outcome");
        };

        wait_for_status(&orch, &started.task_id, TaskStatus::Completed).await;
        let tail = orch.log_tail(&started.task_id, 10).await.unwrap();
        assert_eq!(tail.lines, vec!["first", "second"]);
        assert!(!tail.truncated);
    }

    #[tokio::test]
    async fn foreground_spawn_returns_report() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(
            dir.path(),
            r#"echo '{"type":"result","result":"fg done","is_error":false,"duration_ms":1,"usage":{"input_tokens":5,"output_tokens":5}}'"#,
        );
        let orch = orchestrator(test_config(dir.path(), bin));

        let outcome = orch.spawn(request(dir.path(), false), None).await.unwrap();
        let SpawnOutcome::Foreground(report) = outcome else {
            panic!("expected foreground outcome");
        };
        assert!(report.success);
        assert_eq!(report.result, "fg done");
        assert_eq!(report.total_tokens, 10);
        // No record for foreground runs; the permit has drained.
        assert!(orch.inner.registry.lock().await.is_empty());
        assert_eq!(orch.inner.admission.pending(), 0);
    }

    #[tokio::test]
    async fn shutdown_fails_running_tasks_and_kills_children() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "sleep 30");
        let mut config = test_config(dir.path(), bin);
        config.limits.term_grace_secs = 1;
        let orch = orchestrator(config);

        let outcome = orch.spawn(request(dir.path(), true), None).await.unwrap();
        let SpawnOutcome::Background(started) = outcome else {
            panic!("expected background outcome");
        };
        assert!(is_alive(started.pid));

        orch.shutdown().await;

        let view = orch
            .status(&TaskQuery::Id(started.task_id.clone()))
            .await
            .unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!is_alive(started.pid));
    }
}
