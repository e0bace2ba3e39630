//! Deadline watchdog helper processes.
//!
//! One watchdog is spawned per background task, fully detached from the
//! orchestrator, so deadline enforcement works even if the orchestrator
//! crashes or restarts. Its whole contract: at or after the deadline, if
//! the target pid is still alive, send SIGTERM, wait the grace interval,
//! then SIGKILL if still alive. During an initial window it also emits
//! liveness heartbeats into the shared diagnostic log for failure
//! forensics.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::process::send_sigkill;

/// Everything a watchdog needs to know. Only numeric values, the sanitized
/// task id, and daemon-controlled paths are interpolated into the script.
#[derive(Debug)]
pub struct WatchdogSpec<'a> {
    pub target_pid: u32,
    pub timeout_secs: u64,
    pub term_grace_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_count: u32,
    pub task_id: &'a str,
    /// The task's own log file; the watchdog reports its size in heartbeats
    /// and announces the kill there.
    pub task_log: &'a Path,
    /// Shared diagnostic log receiving heartbeats and kill announcements.
    pub diagnostic_log: &'a Path,
}

/// Render the watchdog shell script.
///
/// Heartbeats never overshoot the deadline: the heartbeat window is capped
/// at the timeout, and whatever remains is slept in one stretch.
pub fn build_script(spec: &WatchdogSpec<'_>) -> String {
    let interval = spec.heartbeat_interval_secs.max(1);
    let beats = u64::from(spec.heartbeat_count).min(spec.timeout_secs / interval);
    let remaining = spec.timeout_secs.saturating_sub(beats * interval);

    let pid = spec.target_pid;
    let task_id = spec.task_id;
    let grace = spec.term_grace_secs;
    let task_log = spec.task_log.display();
    let diag_log = spec.diagnostic_log.display();

    format!(
        r#"beat=0
while [ $beat -lt {beats} ]; do
  sleep {interval}
  beat=$((beat + 1))
  if kill -0 {pid} 2>/dev/null; then
    log_size=$(wc -c < '{task_log}' 2>/dev/null | tr -d ' ' || echo '?')
    echo "[$(date -Iseconds)] [{task_id}] heartbeat $beat: pid {pid} alive, log=$log_size bytes" >> '{diag_log}'
  else
    echo "[$(date -Iseconds)] [{task_id}] heartbeat $beat: pid {pid} gone" >> '{diag_log}'
    exit 0
  fi
done
if [ {remaining} -gt 0 ]; then
  sleep {remaining}
fi
if kill -0 {pid} 2>/dev/null; then
  echo "[$(date -Iseconds)] [{task_id}] deadline reached, terminating pid {pid}" >> '{diag_log}'
  echo "[watchdog] deadline reached, terminating pid {pid}" >> '{task_log}'
  kill -TERM {pid} 2>/dev/null
  sleep {grace}
  if kill -0 {pid} 2>/dev/null; then
    echo "[$(date -Iseconds)] [{task_id}] pid {pid} survived SIGTERM, killing" >> '{diag_log}'
    kill -KILL {pid} 2>/dev/null
  fi
fi
"#
    )
}

/// Spawn a detached watchdog. Returns its pid, or `None` when the spawn
/// fails (the reaper then remains the only deadline enforcement).
pub fn spawn(spec: &WatchdogSpec<'_>) -> Option<u32> {
    let script = build_script(spec);

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        // SAFETY: setsid is async-signal-safe and runs in the forked child
        // before exec.
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

    match cmd.spawn() {
        Ok(child) => {
            let pid = child.id();
            debug!(
                task_id = %spec.task_id,
                watchdog_pid = ?pid,
                target_pid = spec.target_pid,
                timeout_secs = spec.timeout_secs,
                "Watchdog started"
            );
            // The Child handle is dropped; the runtime reaps it when it
            // exits on its own.
            pid
        }
        Err(e) => {
            warn!(task_id = %spec.task_id, error = %e, "Failed to spawn watchdog");
            None
        }
    }
}

/// Force-kill a watchdog whose task has ended; its job is moot.
pub fn stand_down(pid: u32) -> bool {
    send_sigkill(pid)
}
