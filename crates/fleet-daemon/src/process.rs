//! Pid liveness probes and signal delivery.
//!
//! Cancellation in the orchestrator is always two-staged: a graceful
//! SIGTERM, a fixed grace interval, then SIGKILL if the target is still
//! alive. The same escalation is used by the foreground timeout, explicit
//! kills, and the reaper.

use std::time::Duration;

use tracing::{debug, warn};

/// Check whether a process with the given pid is running.
///
/// Non-positive pids address process groups rather than processes and are
/// always reported dead.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    send_signal(pid, 0)
}

/// Send SIGTERM. Returns whether delivery succeeded.
pub fn send_sigterm(pid: u32) -> bool {
    #[cfg(unix)]
    {
        send_signal(pid, libc::SIGTERM)
    }
    #[cfg(not(unix))]
    {
        send_signal(pid, 15)
    }
}

/// Send SIGKILL. Returns whether delivery succeeded.
pub fn send_sigkill(pid: u32) -> bool {
    #[cfg(unix)]
    {
        send_signal(pid, libc::SIGKILL)
    }
    #[cfg(not(unix))]
    {
        send_signal(pid, 9)
    }
}

/// Two-stage termination: SIGTERM now, then SIGKILL after `grace` if the
/// process is still alive. The kill leg runs on a detached task so callers
/// never block on the grace interval.
pub fn escalate(pid: u32, grace: Duration) {
    if !send_sigterm(pid) {
        debug!(pid, "SIGTERM not delivered, process likely already gone");
        return;
    }

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if is_alive(pid) {
            warn!(pid, "Process survived SIGTERM grace period, sending SIGKILL");
            send_sigkill(pid);
        }
    });
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: pid is a positive process id owned by this orchestrator (or a
    // liveness probe with signal 0). kill(2) is safe to call with any such
    // arguments; failure is reported via the return value.
    #[allow(unsafe_code)]
    #[allow(clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, signal) };
    ret == 0
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) -> bool {
    false
}
