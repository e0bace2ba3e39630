//! Background (detached) agent spawning.
//!
//! Background children write to a log file instead of pipes so the
//! orchestrator carries no back-pressure risk, run in their own session so
//! orchestrator termination does not imply theirs, and are liveness-probed
//! shortly after spawn so immediate launch failures surface distinctly
//! from later runtime failures.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::process::is_alive;

use super::invocation::AgentInvocation;

/// Errors from background spawning.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to spawn agent: {reason}")]
    Spawn { reason: String },

    #[error("Agent died immediately after launch: {detail}")]
    DiedAtLaunch { detail: String },
}

/// A successfully launched background child.
#[derive(Debug)]
pub struct BackgroundHandle {
    /// Retained only so the exit monitor can `wait()`; dropping it does not
    /// kill the child.
    pub child: Child,
    pub pid: u32,
}

/// Spawn a detached agent whose output is captured to `log_file`.
///
/// The child gets the log file opened twice: create/truncate for stdout and
/// append for stderr, interleaving both streams in one file. The parent's
/// descriptor copies are consumed by the spawn; the child holds its own.
pub async fn spawn_detached(
    agent_bin: &Path,
    invocation: &AgentInvocation,
    working_dir: &Path,
    log_file: &Path,
    probe: Duration,
) -> Result<BackgroundHandle, SpawnError> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SpawnError::LogFile {
            path: log_file.to_path_buf(),
            source: e,
        })?;
    }

    let stdout_file = std::fs::File::create(log_file).map_err(|e| SpawnError::LogFile {
        path: log_file.to_path_buf(),
        source: e,
    })?;
    let stderr_file = std::fs::OpenOptions::new()
        .append(true)
        .open(log_file)
        .map_err(|e| SpawnError::LogFile {
            path: log_file.to_path_buf(),
            source: e,
        })?;

    let mut cmd = Command::new(agent_bin);
    cmd.args(invocation.to_args(false))
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file));

    #[cfg(unix)]
    {
        // SAFETY: setsid is async-signal-safe and runs in the forked child
        // before exec; the parent's memory is untouched.
        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|e| SpawnError::Spawn {
        reason: e.to_string(),
    })?;
    let pid = child.id().ok_or_else(|| SpawnError::Spawn {
        reason: "No pid returned".to_string(),
    })?;

    debug!(pid, log_file = %log_file.display(), "Background agent spawned, probing liveness");

    // A short bounded wait, not a join: immediate launch failures (bad
    // binary, unwritable cwd) show up here instead of as runtime failures.
    tokio::time::sleep(probe).await;

    match child.try_wait() {
        Ok(Some(status)) => {
            return Err(SpawnError::DiedAtLaunch {
                detail: format!("exited with {status} during launch, see {}", log_file.display()),
            });
        }
        Ok(None) => {}
        Err(e) => {
            return Err(SpawnError::DiedAtLaunch {
                detail: format!("liveness check failed: {e}"),
            });
        }
    }
    if !is_alive(pid) {
        return Err(SpawnError::DiedAtLaunch {
            detail: format!("pid {pid} not running, see {}", log_file.display()),
        });
    }

    Ok(BackgroundHandle { child, pid })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fake_agent(dir: &Path, script: &str) -> PathBuf {
        let bin = dir.join("fake-agent");
        std::fs::write(&bin, format!("#!/bin/sh\n{script}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        bin
    }

    fn invocation() -> AgentInvocation {
        AgentInvocation {
            prompt: "ignored".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn long_running_child_spawns_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "echo started; sleep 30");
        let log = dir.path().join("agent.log");

        let mut handle = spawn_detached(
            &bin,
            &invocation(),
            dir.path(),
            &log,
            Duration::from_millis(150),
        )
        .await
        .unwrap();

        assert!(is_alive(handle.pid));
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("started"));

        handle.child.start_kill().unwrap();
        let _ = handle.child.wait().await;
    }

    #[tokio::test]
    async fn immediate_exit_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "echo doomed >&2; exit 1");
        let log = dir.path().join("agent.log");

        let err = spawn_detached(
            &bin,
            &invocation(),
            dir.path(),
            &log,
            Duration::from_millis(150),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SpawnError::DiedAtLaunch { .. }));

        // Stderr landed in the log file for the failure post-mortem.
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("doomed"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("agent.log");
        let err = spawn_detached(
            Path::new("/nonexistent/fleet-agent-binary"),
            &invocation(),
            dir.path(),
            &log,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SpawnError::Spawn { .. }));
    }

    #[tokio::test]
    async fn unwritable_log_path_is_a_log_file_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "sleep 1");
        let err = spawn_detached(
            &bin,
            &invocation(),
            dir.path(),
            Path::new("/proc/definitely/not/writable/agent.log"),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SpawnError::LogFile { .. }));
    }
}
