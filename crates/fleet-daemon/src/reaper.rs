//! Periodic maintenance sweep over the task registry.
//!
//! The reaper reconciles recorded state against OS reality on a fixed
//! interval: it escalates past-deadline tasks (the fallback path when a
//! watchdog itself failed), evicts records past the storage retention
//! ceiling regardless of status, and commits `Failed` for running records
//! whose process died out-of-band. The registry persists after any change.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::orchestrator::{Orchestrator, secs_to_ms};
use crate::process::{escalate, is_alive};
use crate::registry::unix_millis;
use crate::supervisor::watchdog;

impl Orchestrator {
    /// One maintenance pass. Safe to call at any time; the periodic loop
    /// in [`spawn_reaper`](Self::spawn_reaper) is just a driver for this.
    pub async fn sweep(&self) {
        let now = unix_millis();
        let limits = &self.inner.config.limits;
        let storage_ceiling_ms = secs_to_ms(limits.storage_ceiling_secs);
        let term_grace = Duration::from_secs(limits.term_grace_secs);

        let mut registry = self.inner.registry.lock().await;
        let mut changed = false;

        // Deadline enforcement, in case the task's own watchdog died.
        let overdue: Vec<(String, u32, Option<u32>)> = registry
            .values()
            .filter(|t| t.is_running() && t.timeout_at.is_some_and(|deadline| now > deadline))
            .map(|t| (t.id.clone(), t.pid, t.watchdog_pid))
            .collect();
        for (id, pid, watchdog_pid) in overdue {
            warn!(task_id = %id, pid, "Task deadline passed, escalating termination");
            if is_alive(pid) {
                escalate(pid, term_grace);
            }
            if let Some(watchdog_pid) = watchdog_pid
                && is_alive(watchdog_pid)
            {
                watchdog::stand_down(watchdog_pid);
            }
            if registry.mark_timed_out(&id) {
                registry.clear_watchdog(&id);
                changed = true;
            }
        }

        // Storage-ceiling eviction, unconditional on status.
        let expired: Vec<String> = registry
            .values()
            .filter(|t| t.age_ms(now) > storage_ceiling_ms)
            .map(|t| t.id.clone())
            .collect();
        for id in expired {
            info!(task_id = %id, "Evicting record past storage ceiling");
            registry.remove(&id);
            changed = true;
        }

        // Zombie reconciliation: recorded running, process gone.
        let dead: Vec<(String, Option<u32>)> = registry
            .values()
            .filter(|t| t.is_running() && !is_alive(t.pid))
            .map(|t| (t.id.clone(), t.watchdog_pid))
            .collect();
        for (id, watchdog_pid) in dead {
            warn!(task_id = %id, "Process died out-of-band, committing failed");
            if let Some(watchdog_pid) = watchdog_pid
                && is_alive(watchdog_pid)
            {
                watchdog::stand_down(watchdog_pid);
            }
            if registry.mark_failed(&id) {
                registry.clear_watchdog(&id);
                changed = true;
            }
        }

        if changed {
            registry.persist();
        }
    }

    /// Run the sweep on the configured interval until `shutdown` flips.
    pub fn spawn_reaper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let interval = Duration::from_secs(self.inner.config.limits.reaper_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh start
            // does not race registry loading.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        orchestrator.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Reaper stopped");
        })
    }
}
